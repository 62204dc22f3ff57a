//! Burst buffer allocation state.
//!
//! This library holds the allocation model and everything needed to make it
//! durable:
//!
//! - `record` / `table`: allocation records and the keyed table that owns them
//! - `codec`: the versioned binary checkpoint format
//! - `store`: crash-safe checkpoint file rotation (`new` -> current -> `old`)
//!
//! Locking is left to the owner of the table.

pub mod codec;
pub mod record;
pub mod store;
pub mod table;

pub use codec::{
    decode, encode_records, Checkpoint, CheckpointEncoder, CodecError, CURRENT_FORMAT_VERSION,
    FORMAT_V1, SUPPORTED_FORMAT_VERSIONS, UNKNOWN_FORMAT_VERSION,
};
pub use record::{AllocationKey, AllocationRecord, AllocationState, JobBinding};
pub use store::{CheckpointStore, Generation, SaveOutcome, StoreError, StoredCheckpoint};
pub use table::AllocationTable;
