//! Checkpoint file rotation.
//!
//! Three names live in the state directory:
//!
//! - `burst_buffer_lua_state.new`: staged, being written
//! - `burst_buffer_lua_state`: current, authoritative
//! - `burst_buffer_lua_state.old`: previous generation
//!
//! The current name is only ever produced by hard-linking a fully written and
//! synced staged file, so a reader never observes a half-written checkpoint.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Base name of the checkpoint file.
pub const STATE_FILE_NAME: &str = "burst_buffer_lua_state";

/// Permission bits of every checkpoint file.
pub const STATE_FILE_MODE: u32 = 0o600;

/// A file shorter than a checkpoint header is treated as unusable.
const MIN_STATE_FILE_LEN: u64 = 6;

/// Checkpoint store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state directory could not be created.
    #[error("failed to create state directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    /// Writing or syncing the staged file failed.
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    /// Linking the staged file to the current name failed.
    #[error("failed to publish {}: {source}", .path.display())]
    Publish { path: PathBuf, source: io::Error },

    /// Reading a checkpoint failed.
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
}

impl StoreError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::CreateDir { .. } => "create_dir_failed",
            Self::Write { .. } => "write_failed",
            Self::Publish { .. } => "publish_failed",
            Self::Read { .. } => "read_failed",
        }
    }
}

/// Which generation a checkpoint was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Current,
    Old,
}

/// Raw checkpoint bytes read from disk.
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    pub path: PathBuf,
    pub generation: Generation,
    pub data: Vec<u8>,
}

/// Outcome of a save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written and published as the current generation.
    Written { bytes: usize },
    /// Nothing changed since the last save.
    Skipped,
}

/// Checkpoint store rooted at a state directory.
#[derive(Debug)]
pub struct CheckpointStore {
    state_dir: PathBuf,
    /// Time of the last successful save.
    last_save: Mutex<Option<Instant>>,
}

impl CheckpointStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            last_save: Mutex::new(None),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn old_path(&self) -> PathBuf {
        self.state_dir.join(format!("{STATE_FILE_NAME}.old"))
    }

    pub fn new_path(&self) -> PathBuf {
        self.state_dir.join(format!("{STATE_FILE_NAME}.new"))
    }

    /// Whether a save is due.
    ///
    /// Always true while terminating so the final pass persists state.
    pub fn needs_save(&self, last_update: Instant, terminating: bool) -> bool {
        if terminating {
            return true;
        }
        match *self.last_save.lock() {
            Some(saved) => last_update > saved,
            None => true,
        }
    }

    pub fn last_save(&self) -> Option<Instant> {
        *self.last_save.lock()
    }

    /// Persist `data` as the new current generation.
    ///
    /// `save_time` is when the encoded snapshot was taken; it becomes the
    /// reference for [`needs_save`](Self::needs_save) once the write succeeds.
    pub fn write(&self, data: &[u8], save_time: Instant) -> Result<(), StoreError> {
        fs::create_dir_all(&self.state_dir).map_err(|source| StoreError::CreateDir {
            path: self.state_dir.clone(),
            source,
        })?;

        let new_path = self.new_path();
        if let Err(source) = write_synced(&new_path, data) {
            error!(path = %new_path.display(), error = %source, "Can't save state, error writing file");
            remove_if_present(&new_path);
            return Err(StoreError::Write {
                path: new_path,
                source,
            });
        }

        self.rotate()?;
        *self.last_save.lock() = Some(save_time);

        debug!(
            path = %self.current_path().display(),
            bytes = data.len(),
            "Saved burst buffer state"
        );
        Ok(())
    }

    /// Shuffle `new` -> `current` -> `old`.
    fn rotate(&self) -> Result<(), StoreError> {
        let old_path = self.old_path();
        let current_path = self.current_path();
        let new_path = self.new_path();

        remove_if_present(&old_path);
        if let Err(e) = fs::hard_link(&current_path, &old_path) {
            debug!(
                from = %current_path.display(),
                to = %old_path.display(),
                error = %e,
                "Unable to create link"
            );
        }
        remove_if_present(&current_path);

        if let Err(source) = fs::hard_link(&new_path, &current_path) {
            // Keep the staged file; it is the only copy of this generation.
            error!(
                from = %new_path.display(),
                to = %current_path.display(),
                error = %source,
                "Unable to publish state file"
            );
            return Err(StoreError::Publish {
                path: current_path,
                source,
            });
        }
        remove_if_present(&new_path);
        sync_dir(&self.state_dir);

        Ok(())
    }

    /// Read the newest usable checkpoint.
    ///
    /// Falls back to the previous generation when the current file is
    /// missing or too short to hold a header. `Ok(None)` means neither exists.
    pub fn read(&self) -> Result<Option<StoredCheckpoint>, StoreError> {
        let current_path = self.current_path();
        if let Some(data) = read_if_usable(&current_path)? {
            return Ok(Some(StoredCheckpoint {
                path: current_path,
                generation: Generation::Current,
                data,
            }));
        }

        let old_path = self.old_path();
        if let Some(data) = read_if_usable(&old_path)? {
            warn!(path = %old_path.display(), "Recovering burst buffer state from previous generation");
            return Ok(Some(StoredCheckpoint {
                path: old_path,
                generation: Generation::Old,
                data,
            }));
        }

        info!(path = %current_path.display(), "No burst buffer state file to recover");
        Ok(None)
    }
}

/// Write and fsync a fresh file with checkpoint permissions.
fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(STATE_FILE_MODE)
        .open(path)?;

    // write_all retries on Interrupted and fails on anything else.
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()
}

fn read_if_usable(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let len = file
        .metadata()
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if len < MIN_STATE_FILE_LEN {
        warn!(path = %path.display(), len, "State file too small");
        return Ok(None);
    }

    // read_to_end retries on Interrupted and fails on anything else.
    let mut data = Vec::with_capacity(len as usize);
    file.read_to_end(&mut data)
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(data))
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Unable to remove file");
        }
    }
}

/// Best-effort fsync of the directory so the renames are durable.
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(path = %dir.display(), error = %e, "Unable to sync state directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_first_write_publishes_current() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.write(b"generation-1", Instant::now()).unwrap();

        assert_eq!(fs::read(store.current_path()).unwrap(), b"generation-1");
        assert!(!store.new_path().exists());
        assert!(!store.old_path().exists());
    }

    #[test]
    fn test_second_write_rotates_previous_to_old() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.write(b"generation-1", Instant::now()).unwrap();
        store.write(b"generation-2", Instant::now()).unwrap();
        store.write(b"generation-3", Instant::now()).unwrap();

        assert_eq!(fs::read(store.current_path()).unwrap(), b"generation-3");
        assert_eq!(fs::read(store.old_path()).unwrap(), b"generation-2");
        assert!(!store.new_path().exists());
    }

    #[test]
    fn test_files_are_owner_only() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(b"generation-1", Instant::now()).unwrap();

        let mode = fs::metadata(store.current_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, STATE_FILE_MODE);
    }

    #[test]
    fn test_needs_save() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let before = Instant::now();

        assert!(store.needs_save(before, false));

        let saved_at = Instant::now();
        store.write(b"generation-1", saved_at).unwrap();
        assert!(!store.needs_save(before, false));
        assert!(store.needs_save(before, true));

        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(store.needs_save(Instant::now(), false));
    }

    #[test]
    fn test_failed_write_discards_staged_file() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(b"generation-1", Instant::now()).unwrap();

        // A directory squatting on the staged name makes the open fail.
        fs::create_dir(store.new_path()).unwrap();
        let err = store.write(b"generation-2", Instant::now()).unwrap_err();
        assert_eq!(err.reason_code(), "write_failed");

        assert_eq!(fs::read(store.current_path()).unwrap(), b"generation-1");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_read_falls_back_to_old() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(b"generation-1", Instant::now()).unwrap();
        store.write(b"generation-2", Instant::now()).unwrap();

        // Crash after "unlink current", before "link new -> current".
        fs::remove_file(store.current_path()).unwrap();

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.generation, Generation::Old);
        assert_eq!(stored.data, b"generation-1");
    }

    #[test]
    fn test_short_current_falls_back_to_old() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(b"generation-1", Instant::now()).unwrap();
        store.write(b"generation-2", Instant::now()).unwrap();
        fs::write(store.current_path(), b"ab").unwrap();

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.generation, Generation::Old);
    }
}
