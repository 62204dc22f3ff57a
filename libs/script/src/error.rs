//! Script bridge errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading or running a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read or compiled.
    #[error("failed to load {}: {cause}", .path.display())]
    Load { path: PathBuf, cause: String },

    /// A required entry point is not exported; nothing was run.
    #[error("{} is missing required entry point {name}", .path.display())]
    MissingEntryPoint { path: PathBuf, name: String },

    /// The requested entry point is not exported.
    #[error("couldn't find function {name} in {}", .path.display())]
    EntryPointNotFound { path: PathBuf, name: String },

    /// Instantiation or execution trapped.
    #[error("{}: {cause}", .path.display())]
    Execution { path: PathBuf, cause: String },
}

impl ScriptError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Load { .. } => "script_load_failed",
            Self::MissingEntryPoint { .. } => "script_missing_entry_point",
            Self::EntryPointNotFound { .. } => "script_entry_point_not_found",
            Self::Execution { .. } => "script_execution_failed",
        }
    }
}
