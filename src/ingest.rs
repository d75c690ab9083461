// 📥 Event Ingestion - parse, classify, gate, map, persist
//
// Events are processed one at a time in createdAt order. Every outcome is
// recorded per event; a failing event never stops the batch.

use crate::classifier::{Classification, EventClassifier, SkipReason};
use crate::error::SyncError;
use crate::events::{ChangeEvent, EventKind, EVENT_ENTITY};
use crate::gate::ChronologicalGate;
use crate::identity::RemoteRecord;
use crate::ledger::{EventHistory, FingerprintLedger, PersistenceBoundary};
use crate::mapper::to_persisted;
use crate::remote::RemoteCatalogClient;
use crate::workers::WorkerHistoryResolver;
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Everything ingestion needs from storage
pub trait EventStore:
    WorkerHistoryResolver + FingerprintLedger + EventHistory + PersistenceBoundary
{
}

impl<T> EventStore for T where
    T: WorkerHistoryResolver + FingerprintLedger + EventHistory + PersistenceBoundary
{
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Persisted {
        id: i64,
        kind: EventKind,
        worker_key: String,
    },
    Skipped {
        reason: String,
    },
    Error {
        reason: String,
        detail: Option<String>,
    },
}

impl IngestOutcome {
    fn skipped(reason: &str) -> Self {
        IngestOutcome::Skipped {
            reason: reason.to_string(),
        }
    }

    fn error(reason: &str, detail: Option<String>) -> Self {
        IngestOutcome::Error {
            reason: reason.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestDetail {
    /// 1-based position in processing order
    pub index: usize,
    pub fingerprint: Option<String>,
    pub result: IngestOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<IngestDetail>,
}

impl IngestStats {
    fn record(&mut self, fingerprint: Option<String>, result: IngestOutcome) {
        match &result {
            IngestOutcome::Persisted { .. } => self.processed += 1,
            IngestOutcome::Skipped { .. } => self.skipped += 1,
            IngestOutcome::Error { .. } => self.errors += 1,
        }
        self.details.push(IngestDetail {
            index: self.details.len() + 1,
            fingerprint,
            result,
        });
    }

    pub fn summary(&self) -> String {
        format!(
            "{} events: {} processed, {} skipped, {} errors",
            self.total, self.processed, self.skipped, self.errors
        )
    }
}

// ============================================================================
// INGESTOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EventIngestor {
    classifier: EventClassifier,
    gate: ChronologicalGate,
}

impl EventIngestor {
    pub fn new(classifier: EventClassifier) -> Self {
        EventIngestor {
            classifier,
            gate: ChronologicalGate::new(),
        }
    }

    /// Parse and process one raw event
    pub fn process<S: EventStore>(&self, payload: &RemoteRecord, store: &S) -> IngestOutcome {
        match ChangeEvent::from_remote(payload.clone()) {
            Ok(event) => self.process_event(&event, store),
            Err(err) => IngestOutcome::error(err.code(), Some(err.to_string())),
        }
    }

    /// Classify, gate, map and persist one parsed event
    pub fn process_event<S: EventStore>(&self, event: &ChangeEvent, store: &S) -> IngestOutcome {
        match self.admit(event, store) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Lost a race on the fingerprint between check and write
                if let Some(SyncError::DuplicateFingerprint(_)) = err.downcast_ref::<SyncError>() {
                    return IngestOutcome::skipped("duplicate");
                }
                error!(fingerprint = %event.fingerprint, error = %err, "event processing failed");
                IngestOutcome::error("storage_error", Some(format!("{:#}", err)))
            }
        }
    }

    fn admit<S: EventStore>(&self, event: &ChangeEvent, store: &S) -> Result<IngestOutcome> {
        let classification = self.classifier.classify(event, store, store, store)?;
        let code = classification.code();
        let assignment = match classification {
            Classification::Admit(assignment) => assignment,
            Classification::Skipped(reason) => {
                let detail = reason.to_error(event);
                match reason {
                    SkipReason::DateError(_) => warn!(fingerprint = %event.fingerprint, "{}", detail),
                    _ => debug!(fingerprint = %event.fingerprint, "{}", detail),
                }
                return Ok(IngestOutcome::skipped(code));
            }
            Classification::Rejected(err) => {
                return Ok(IngestOutcome::error(code, Some(err.to_string())));
            }
        };

        if !self.gate.check(event, &assignment, store)? {
            let reason = SkipReason::OutOfChronologicalOrder;
            debug!(fingerprint = %event.fingerprint, "{}", reason.to_error(event));
            return Ok(IngestOutcome::skipped(reason.code()));
        }

        let record = to_persisted(
            event,
            assignment.kind,
            &assignment.worker_key,
            assignment.reference.as_ref(),
        );
        let id = store.persist_admitted(&record)?;

        info!(
            id,
            kind = %assignment.kind,
            worker = %assignment.worker_key,
            subject = %record.subject,
            "event admitted"
        );
        Ok(IngestOutcome::Persisted {
            id,
            kind: assignment.kind,
            worker_key: assignment.worker_key,
        })
    }

    /// Process a batch oldest first; unparseable events are reported up front
    pub fn sync<S: EventStore>(
        &self,
        records: Vec<RemoteRecord>,
        limit: Option<usize>,
        store: &S,
    ) -> IngestStats {
        let mut parsed: Vec<(Option<NaiveDateTime>, RemoteRecord)> = records
            .into_iter()
            .map(|r| {
                let created_at = ChangeEvent::from_remote(r.clone()).ok().map(|e| e.created_at);
                (created_at, r)
            })
            .collect();
        // Stable: ties keep source order
        parsed.sort_by_key(|(created_at, _)| *created_at);
        if let Some(limit) = limit {
            parsed.truncate(limit);
        }

        let mut stats = IngestStats {
            total: parsed.len(),
            ..IngestStats::default()
        };

        for (position, (_, payload)) in parsed.iter().enumerate() {
            let fingerprint = ChangeEvent::from_remote(payload.clone())
                .ok()
                .map(|e| e.fingerprint.to_string());
            let outcome = self.process(payload, store);

            match &outcome {
                IngestOutcome::Persisted { id, .. } => {
                    info!(position = position + 1, total = stats.total, id, "processed")
                }
                IngestOutcome::Skipped { reason } => {
                    info!(position = position + 1, total = stats.total, reason = %reason, "skipped")
                }
                IngestOutcome::Error { reason, detail } => error!(
                    position = position + 1,
                    total = stats.total,
                    reason = %reason,
                    detail = detail.as_deref().unwrap_or(""),
                    "error"
                ),
            }
            stats.record(fingerprint, outcome);
        }

        info!("{}", stats.summary());
        stats
    }

    /// List pending events from the ERP and ingest them
    pub fn sync_remote<S: EventStore>(
        &self,
        client: &dyn RemoteCatalogClient,
        limit: Option<usize>,
        store: &S,
    ) -> Result<IngestStats, SyncError> {
        let records = client
            .list(EVENT_ENTITY, None)
            .map_err(|e| SyncError::source_read(EVENT_ENTITY, e))?;
        if records.is_empty() {
            warn!("no events returned by {}", EVENT_ENTITY);
        }
        Ok(self.sync(records, limit, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, SqliteStore};
    use crate::ledger::Fingerprint;
    use crate::remote::InMemoryRemoteCatalog;
    use crate::workers::WorkerRecord;
    use rusqlite::Connection;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        db::insert_worker(
            &conn,
            &WorkerRecord {
                worker_key: "77".to_string(),
                company: "0042".to_string(),
                first_name: "Ana".to_string(),
                last_name1: "Ruiz".to_string(),
                last_name2: "".to_string(),
                start_date: "2024-01-01".to_string(),
                end_date: None,
                phone: None,
                insurance_number: None,
                tax_id: None,
            },
        )
        .unwrap();
        conn
    }

    fn raw(etag: &str, created: &str) -> RemoteRecord {
        json!({
            "@odata.etag": etag,
            "CreatedDate": created,
            "CompanyIdATISA": "0042",
            "FirstName": "Ana",
            "LastName1": "Ruiz",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_process_persists_once() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let ingestor = EventIngestor::default();
        let event = raw("W/\"1\"", "2024-06-01T10:00:00Z");

        let first = ingestor.process(&event, &store);
        assert!(matches!(
            first,
            IngestOutcome::Persisted { kind: EventKind::Modification, ref worker_key, .. } if worker_key == "77"
        ));

        let second = ingestor.process(&event, &store);
        assert_eq!(second, IngestOutcome::skipped("duplicate"));
        assert_eq!(db::count_rows(&conn, "persisted_records").unwrap(), 1);
        assert_eq!(db::count_rows(&conn, "ledger").unwrap(), 1);
    }

    #[test]
    fn test_parse_failures_are_errors() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let ingestor = EventIngestor::default();

        let mut no_etag = raw("x", "2024-06-01");
        no_etag.remove("@odata.etag");
        assert!(matches!(
            ingestor.process(&no_etag, &store),
            IngestOutcome::Error { ref reason, .. } if reason == "missing_etag"
        ));

        let mut no_names = raw("W/\"9\"", "2024-06-01");
        no_names.remove("FirstName");
        assert!(matches!(
            ingestor.process(&no_names, &store),
            IngestOutcome::Error { ref reason, .. } if reason == "missing_fields"
        ));
        assert_eq!(db::count_rows(&conn, "persisted_records").unwrap(), 0);
    }

    #[test]
    fn test_sync_orders_by_created_date() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let ingestor = EventIngestor::default();

        // Source order is newest first; both must still be admitted
        let stats = ingestor.sync(
            vec![raw("W/\"2\"", "2024-06-15"), raw("W/\"1\"", "2024-06-10")],
            None,
            &store,
        );
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(
            stats.details[0].fingerprint,
            Some(Fingerprint::from_token("W/\"1\"").to_string())
        );
        assert_eq!(stats.details[1].index, 2);
    }

    #[test]
    fn test_sync_gate_and_limit() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let ingestor = EventIngestor::default();

        ingestor.process(&raw("W/\"1\"", "2024-06-10"), &store);
        let stats = ingestor.sync(
            vec![
                raw("W/\"3\"", "2024-06-20"),
                raw("W/\"2\"", "2024-06-05"),
                raw("W/\"4\"", "2024-06-25"),
            ],
            Some(2),
            &store,
        );

        assert_eq!(stats.total, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(
            stats.details[0].result,
            IngestOutcome::skipped("out_of_chronological_order")
        );
        assert_eq!(db::count_rows(&conn, "persisted_records").unwrap(), 2);
    }

    #[test]
    fn test_sync_remote_reads_event_entity() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let remote = InMemoryRemoteCatalog::new();
        remote.seed(EVENT_ENTITY, vec![raw("W/\"1\"", "2024-06-10")]);

        let stats = EventIngestor::default().sync_remote(&remote, None, &store).unwrap();
        assert_eq!(stats.processed, 1);

        remote.fail_next("list", crate::error::RemoteError::from_response(500, "down".to_string()));
        let err = EventIngestor::default().sync_remote(&remote, None, &store).unwrap_err();
        assert!(err.is_fatal());
    }
}
