// 📒 Fingerprint Ledger - At-most-once admission and ordering watermarks
//
// Three storage-facing contracts:
//   FingerprintLedger   which fingerprints were admitted
//   EventHistory        latest admitted / finalized timestamps per subject and kind
//   PersistenceBoundary persisted record + ledger entry, written as one unit
//
// SqliteStore (db.rs) implements all three over one database. MemoryEventStore
// implements them in memory.

use crate::events::{EventKind, SubjectKey};
use crate::mapper::PersistedRecord;
use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Stable token derived from a remote record's concurrency marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Base64 of the concurrency token
    pub fn from_token(token: &str) -> Self {
        Fingerprint(STANDARD.encode(token.as_bytes()))
    }

    /// Wrap an already-encoded fingerprint read back from storage
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Fingerprint(encoded.into())
    }

    /// Recover the concurrency token, if the stored value is valid base64 UTF-8
    pub fn decode_token(&self) -> Option<String> {
        let bytes = STANDARD.decode(self.0.as_bytes()).ok()?;
        String::from_utf8(bytes).ok().filter(|t| !t.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger row paired 1:1 with a persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub fingerprint: Fingerprint,
    pub subject_id: i64,
    pub created_at: NaiveDateTime,
    pub personnel_number: Option<String>,
}

// ============================================================================
// CONTRACTS
// ============================================================================

pub trait FingerprintLedger {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn record(
        &self,
        fingerprint: &Fingerprint,
        subject_id: i64,
        admitted_at: NaiveDateTime,
    ) -> Result<()>;
}

pub trait EventHistory {
    /// Latest admitted `created_at` for the subject and kind; Modification
    /// watermarks are further keyed by worker key
    fn last_admitted_at(
        &self,
        subject: &SubjectKey,
        kind: EventKind,
        worker_key: Option<&str>,
    ) -> Result<Option<NaiveDateTime>>;

    /// Latest `created_at` among admitted events already finalized downstream
    fn last_finalized_at(&self, subject: &SubjectKey, kind: EventKind)
        -> Result<Option<NaiveDateTime>>;
}

pub trait PersistenceBoundary {
    /// Persist the record and its ledger entry together; returns the subject id
    fn persist_admitted(&self, record: &PersistedRecord) -> Result<i64>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<PersistedRecord>,
    ledger: Vec<LedgerEntry>,
}

/// MemoryEventStore - all three contracts over a Vec
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PersistedRecord> {
        self.lock().records.clone()
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.lock().ledger.clone()
    }

    /// Mark a persisted record as finalized downstream
    pub fn mark_processed(&self, subject_id: i64) {
        let mut state = self.lock();
        if let Some(record) = state.records.iter_mut().find(|r| r.id == Some(subject_id)) {
            record.processed = true;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn latest<'a>(records: impl Iterator<Item = &'a PersistedRecord>) -> Option<NaiveDateTime> {
    records.map(|r| r.created_at).max()
}

impl FingerprintLedger for MemoryEventStore {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.lock().ledger.iter().any(|e| &e.fingerprint == fingerprint))
    }

    fn record(&self, fingerprint: &Fingerprint, subject_id: i64, admitted_at: NaiveDateTime) -> Result<()> {
        let mut state = self.lock();
        if state.ledger.iter().any(|e| &e.fingerprint == fingerprint) {
            bail!("fingerprint {} already recorded", fingerprint);
        }
        state.ledger.push(LedgerEntry {
            fingerprint: fingerprint.clone(),
            subject_id,
            created_at: admitted_at,
            personnel_number: None,
        });
        Ok(())
    }
}

impl EventHistory for MemoryEventStore {
    fn last_admitted_at(
        &self,
        subject: &SubjectKey,
        kind: EventKind,
        worker_key: Option<&str>,
    ) -> Result<Option<NaiveDateTime>> {
        let state = self.lock();
        Ok(latest(state.records.iter().filter(|r| {
            &r.subject == subject
                && r.kind == kind
                && worker_key.map_or(true, |k| r.worker_key == k)
        })))
    }

    fn last_finalized_at(&self, subject: &SubjectKey, kind: EventKind) -> Result<Option<NaiveDateTime>> {
        let state = self.lock();
        Ok(latest(
            state
                .records
                .iter()
                .filter(|r| &r.subject == subject && r.kind == kind && r.processed),
        ))
    }
}

impl PersistenceBoundary for MemoryEventStore {
    fn persist_admitted(&self, record: &PersistedRecord) -> Result<i64> {
        let mut state = self.lock();
        if state.ledger.iter().any(|e| e.fingerprint == record.fingerprint) {
            bail!("fingerprint {} already recorded", record.fingerprint);
        }

        let subject_id = state.records.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(subject_id);
        state.records.push(stored);
        state.ledger.push(LedgerEntry {
            fingerprint: record.fingerprint.clone(),
            subject_id,
            created_at: record.created_at,
            personnel_number: record.personnel_number.clone(),
        });
        Ok(subject_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_roundtrip() {
        let token = "W/\"JzEsNTYzNzE0NDU3OCc=\"";
        let fingerprint = Fingerprint::from_token(token);

        assert_ne!(fingerprint.as_str(), token);
        assert_eq!(fingerprint.decode_token().as_deref(), Some(token));
        assert_eq!(Fingerprint::from_token(token), fingerprint);
    }

    #[test]
    fn test_invalid_fingerprint_does_not_decode() {
        assert_eq!(Fingerprint::from_encoded("not base64!").decode_token(), None);
        assert_eq!(Fingerprint::from_encoded("").decode_token(), None);
    }

    #[test]
    fn test_memory_ledger_rejects_second_record() {
        let store = MemoryEventStore::new();
        let fingerprint = Fingerprint::from_token("W/\"1\"");
        let at = chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        assert!(!store.exists(&fingerprint).unwrap());
        store.record(&fingerprint, 1, at).unwrap();
        assert!(store.exists(&fingerprint).unwrap());
        assert!(store.record(&fingerprint, 2, at).is_err());
    }
}
