//! In-memory allocation table.
//!
//! The table does no locking of its own. Owners wrap it in a lock and every
//! mutating call must be made with that lock held.

use std::collections::HashMap;
use std::time::Instant;

use crate::record::{AllocationKey, AllocationRecord, AllocationState};

/// All allocations currently known, keyed by `(name, user_id)`.
#[derive(Debug)]
pub struct AllocationTable {
    records: HashMap<AllocationKey, AllocationRecord>,
    /// Next id handed to a newly created record.
    next_id: u32,
    /// Last time the contents changed.
    last_update: Instant,
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationTable {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 1,
            last_update: Instant::now(),
        }
    }

    /// Look up `(name, user_id)`, creating an empty record if absent.
    ///
    /// Handing out mutable access counts as a change to the table.
    pub fn insert_or_get(&mut self, name: &str, user_id: u32) -> &mut AllocationRecord {
        let Self {
            records,
            next_id,
            last_update,
        } = self;

        *last_update = Instant::now();
        records
            .entry(AllocationKey::new(name, user_id))
            .or_insert_with_key(|key| {
                let id = *next_id;
                *next_id = next_id.wrapping_add(1).max(1);
                let now = chrono::Utc::now().timestamp();
                AllocationRecord::new(id, key.name.clone(), key.user_id, now)
            })
    }

    pub fn get(&self, name: &str, user_id: u32) -> Option<&AllocationRecord> {
        self.records.get(&AllocationKey::new(name, user_id))
    }

    /// Mutable access to a record. Counts as a change when the record exists.
    pub fn get_mut(&mut self, name: &str, user_id: u32) -> Option<&mut AllocationRecord> {
        let record = self.records.get_mut(&AllocationKey::new(name, user_id))?;
        self.last_update = Instant::now();
        Some(record)
    }

    /// Key of the record holding `id`, if any.
    pub fn key_for_id(&self, id: u32) -> Option<&AllocationKey> {
        self.records
            .iter()
            .find(|(_, rec)| rec.id == id)
            .map(|(key, _)| key)
    }

    /// Visit every record. Order is unspecified.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&AllocationRecord),
    {
        for record in self.records.values() {
            f(record);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    /// Remove the record with the given id.
    ///
    /// Ids are unique as long as records only get ids from this table or from
    /// a recovery that skips ids already in use.
    pub fn remove(&mut self, id: u32) -> Option<AllocationRecord> {
        let key = self.key_for_id(id)?.clone();
        self.remove_key(&key)
    }

    pub fn remove_key(&mut self, key: &AllocationKey) -> Option<AllocationRecord> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            self.last_update = Instant::now();
        }
        removed
    }

    /// Remove every record matching `pred`, returning what was removed.
    ///
    /// `pred` may update bookkeeping on the records it keeps.
    pub fn purge_where<F>(&mut self, mut pred: F) -> Vec<AllocationRecord>
    where
        F: FnMut(&mut AllocationRecord) -> bool,
    {
        let mut removed = Vec::new();
        self.records.retain(|_, rec| {
            if pred(rec) {
                removed.push(rec.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            self.last_update = Instant::now();
        }
        removed
    }

    /// Move a record to a new lifecycle state. Returns false if it is unknown.
    pub fn set_state(&mut self, key: &AllocationKey, state: AllocationState, now: i64) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };

        if record.state != state {
            record.state = state;
            record.state_time = now;
            self.last_update = Instant::now();
        }
        true
    }

    /// Make sure ids handed out later never collide with `id`.
    pub fn observe_id(&mut self, id: u32) {
        if id >= self.next_id {
            self.next_id = id.wrapping_add(1).max(1);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record that the contents changed.
    pub fn mark_updated(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }
}
