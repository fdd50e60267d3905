//! Persistent divergence journal
//!
//! When rollback cannot restore a record the system is in a known-divergent
//! state. The journal appends one JSON line per divergent record so the
//! warning survives the process and carries the prior ciphertext an operator
//! needs to restore the record by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::attempt::AttemptId;
use crate::error::ObserverError;
use crate::events::{RotationEvent, RotationObserver};
use crate::key::{HandlerId, RecordKey};
use crate::secret::EncryptedSecret;

/// One divergent record as written to the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// When the divergence was detected
    pub recorded_at: DateTime<Utc>,

    /// Attempt whose rollback diverged
    pub attempt_id: AttemptId,

    /// Handler owning the record
    pub handler: HandlerId,

    /// Record left in an unknown state
    pub key: RecordKey,

    /// Ciphertext the record held before the attempt
    pub prior: EncryptedSecret,

    /// Why restoration failed
    pub reason: String,
}

/// Observer that appends divergent records to a JSON lines file
#[derive(Debug, Clone)]
pub struct DivergenceJournal {
    path: PathBuf,
}

impl DivergenceJournal {
    /// Journal at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Journal file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entries` as JSON lines
    pub async fn append(&self, entries: &[JournalEntry]) -> Result<(), ObserverError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            "Appended divergence journal entries"
        );
        Ok(())
    }

    /// Reads every entry; a missing file is an empty journal
    pub async fn entries(&self) -> Result<Vec<JournalEntry>, ObserverError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ObserverError::from))
            .collect()
    }
}

#[async_trait]
impl RotationObserver for DivergenceJournal {
    async fn on_event(&self, event: &RotationEvent) -> Result<(), ObserverError> {
        let RotationEvent::RollbackDiverged(data) = event else {
            return Ok(());
        };

        let entries: Vec<_> = data
            .records
            .iter()
            .map(|record| JournalEntry {
                recorded_at: data.detected_at,
                attempt_id: data.attempt_id,
                handler: data.handler.clone(),
                key: record.key.clone(),
                prior: record.prior.clone(),
                reason: record.reason.clone(),
            })
            .collect();

        warn!(
            path = %self.path.display(),
            handler = %data.handler,
            records = entries.len(),
            "Journaling divergent records for manual remediation"
        );
        self.append(&entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DivergenceData;
    use crate::handler::DivergentRecord;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn diverged(entities: &[&str]) -> RotationEvent {
        RotationEvent::RollbackDiverged(Box::new(DivergenceData {
            attempt_id: AttemptId::new(),
            handler: HandlerId::new("certs").unwrap(),
            records: entities
                .iter()
                .map(|entity| DivergentRecord {
                    key: RecordKey::new("demo", *entity).unwrap(),
                    prior: EncryptedSecret::new(entity.as_bytes().to_vec()),
                    reason: "store offline".to_string(),
                })
                .collect(),
            detected_at: Utc::now(),
        }))
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let journal = DivergenceJournal::new(dir.path().join("divergence.jsonl"));
        assert!(journal.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_divergence_events_are_appended() {
        let dir = TempDir::new().unwrap();
        let journal = DivergenceJournal::new(dir.path().join("nested/divergence.jsonl"));

        journal.on_event(&diverged(&["alice", "bob"])).await.unwrap();
        journal.on_event(&diverged(&["carol"])).await.unwrap();

        let entries = journal.entries().await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, ["demo__alice", "demo__bob", "demo__carol"]);
        assert_eq!(entries[0].prior, EncryptedSecret::new(b"alice".to_vec()));
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let dir = TempDir::new().unwrap();
        let journal = DivergenceJournal::new(dir.path().join("divergence.jsonl"));

        let event = RotationEvent::AttemptAborted {
            attempt_id: AttemptId::new(),
            fully_rolled_back: true,
            aborted_at: Utc::now(),
        };
        journal.on_event(&event).await.unwrap();

        assert!(!journal.path().exists());
    }
}
