//! Validation script bridge.
//!
//! Runs named, argument-less entry points of a site-supplied WebAssembly
//! module. The module is recompiled whenever its modification time changes
//! and every call runs in a fresh instance.

mod bridge;
mod error;

pub use bridge::{
    ScriptBridge, ScriptConfig, JOB_PROCESS_ENTRY_POINT, STATUS_ERROR, STATUS_SUCCESS,
};
pub use error::ScriptError;
