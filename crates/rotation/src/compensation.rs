//! Compensation log
//!
//! Before a handler overwrites a record it captures the record's prior
//! ciphertext here. Rollback replays the log to restore every touched record.

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::key::RecordKey;
use crate::secret::EncryptedSecret;

/// Prior value of a record captured before its first overwrite in an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationEntry {
    /// Record that was touched
    pub key: RecordKey,

    /// Ciphertext the record held before the attempt touched it
    pub prior: EncryptedSecret,
}

/// First-write-wins log of prior record values for one attempt
///
/// Entries keep the order in which records were first touched.
#[derive(Debug, Default)]
pub struct CompensationLog {
    entries: IndexMap<RecordKey, EncryptedSecret>,
}

impl CompensationLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures `prior` for `key` unless the key was already captured
    ///
    /// Returns `true` when a new entry was written. A second capture for the
    /// same key is ignored so the value from before the attempt survives.
    pub fn capture(&mut self, key: &RecordKey, prior: &EncryptedSecret) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(prior.clone());
                true
            }
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in capture order
    pub fn entries(&self) -> impl Iterator<Item = CompensationEntry> + '_ {
        self.entries.iter().map(|(key, prior)| CompensationEntry {
            key: key.clone(),
            prior: prior.clone(),
        })
    }

    /// Drops every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
