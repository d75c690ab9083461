// 🧭 Event Classifier - Onboarding / termination / modification / skip
//
// Precondition checks run first (ledger, identity fields), then a fixed
// priority order:
//   1. explicit end date + located history   -> Termination
//   2. no history                            -> Onboarding
//   3. active record                         -> pending termination / tax-id drift / interval
//   4. closed history                        -> finalized onboarding / last end date

use crate::config::ClassifierOptions;
use crate::error::SyncError;
use crate::events::{ChangeEvent, EventKind, NO_PRIOR_WORKER};
use crate::ledger::{EventHistory, FingerprintLedger};
use crate::temporal::{is_open_ended, parse_timestamp};
use crate::workers::{LookupKeys, WorkerHistory, WorkerHistoryResolver, WorkerLocator, WorkerLookup, WorkerRecord};
use anyhow::Result;
use tracing::debug;

// ============================================================================
// OUTCOMES
// ============================================================================

/// Business-expected reasons for not admitting an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    OutOfRange,
    OldRequest,
    OutOfChronologicalOrder,
    DateError(String),
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::OutOfRange => "out_of_range",
            SkipReason::OldRequest => "old_request",
            SkipReason::OutOfChronologicalOrder => "out_of_chronological_order",
            SkipReason::DateError(_) => "date_error",
        }
    }

    /// Matching entry of the error taxonomy
    pub fn to_error(&self, event: &ChangeEvent) -> SyncError {
        match self {
            SkipReason::Duplicate => SyncError::DuplicateFingerprint(event.fingerprint.to_string()),
            SkipReason::OutOfRange => SyncError::OutOfTemporalRange,
            SkipReason::OldRequest => SyncError::StaleRequest,
            SkipReason::OutOfChronologicalOrder => SyncError::OutOfChronologicalOrder,
            SkipReason::DateError(detail) => SyncError::DateParseFailure {
                value: event.created_at.to_string(),
                reason: detail.clone(),
            },
        }
    }
}

/// Kind plus the worker the event attaches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub kind: EventKind,
    pub worker_key: String,
    pub reference: Option<WorkerRecord>,
    /// Lookup that located the worker history, if any
    pub matched_by: Option<WorkerLookup>,
}

impl Assignment {
    fn onboarding(matched_by: Option<WorkerLookup>) -> Self {
        Assignment {
            kind: EventKind::Onboarding,
            worker_key: NO_PRIOR_WORKER.to_string(),
            reference: None,
            matched_by,
        }
    }

    fn against(kind: EventKind, record: &WorkerRecord, matched_by: WorkerLookup) -> Self {
        Assignment {
            kind,
            worker_key: record.worker_key.clone(),
            reference: Some(record.clone()),
            matched_by: Some(matched_by),
        }
    }
}

#[derive(Debug)]
pub enum Classification {
    Admit(Assignment),
    Skipped(SkipReason),
    Rejected(SyncError),
}

impl Classification {
    /// Short outcome code for reports
    pub fn code(&self) -> &'static str {
        match self {
            Classification::Admit(a) => a.kind.as_str(),
            Classification::Skipped(reason) => reason.code(),
            Classification::Rejected(SyncError::MissingIdentityFields(_)) => "missing_fields",
            Classification::Rejected(_) => "error",
        }
    }
}

fn date_skip(err: SyncError) -> Classification {
    Classification::Skipped(SkipReason::DateError(err.to_string()))
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EventClassifier {
    options: ClassifierOptions,
    locator: WorkerLocator,
}

impl EventClassifier {
    pub fn new(options: ClassifierOptions) -> Self {
        EventClassifier {
            options,
            locator: WorkerLocator::default(),
        }
    }

    pub fn with_locator(mut self, locator: WorkerLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn options(&self) -> &ClassifierOptions {
        &self.options
    }

    pub fn classify(
        &self,
        event: &ChangeEvent,
        workers: &dyn WorkerHistoryResolver,
        ledger: &dyn FingerprintLedger,
        history: &dyn EventHistory,
    ) -> Result<Classification> {
        if ledger.exists(&event.fingerprint)? {
            return Ok(Classification::Skipped(SkipReason::Duplicate));
        }

        let missing = event.missing_identity_fields(self.options.require_tax_id);
        if !missing.is_empty() {
            return Ok(Classification::Rejected(SyncError::MissingIdentityFields(missing)));
        }

        let subject = event.subject();
        let insurance_number = event.insurance_number();
        let tax_id = event.tax_id();
        let keys = LookupKeys {
            subject: &subject,
            insurance_number: insurance_number.as_deref(),
            tax_id: tax_id.as_deref(),
        };
        let located = self.locator.locate(workers, &keys)?;

        // 1. Explicit end date on the event
        if self.options.detect_terminations {
            if let Some(raw_end) = event.end_date() {
                let end = match parse_timestamp(&raw_end) {
                    Ok(end) => end,
                    Err(err) => return Ok(date_skip(err)),
                };
                if !is_open_ended(end.date()) {
                    if let Some((lookup, found)) = &located {
                        if let Some(record) = found.reference_record() {
                            debug!(subject = %subject, worker = %record.worker_key, "explicit end date");
                            return Ok(Classification::Admit(Assignment::against(
                                EventKind::Termination,
                                record,
                                *lookup,
                            )));
                        }
                    }
                }
            }
        }

        // 2. Nobody to attach to
        let Some((lookup, found)) = located else {
            debug!(subject = %subject, "no worker history");
            return Ok(Classification::Admit(Assignment::onboarding(None)));
        };

        match found.active_record.clone() {
            Some(active) => self.classify_active(event, &found, &active, lookup, history),
            None => self.classify_closed(event, &found, lookup, history),
        }
    }

    /// 3. History with an active record
    fn classify_active(
        &self,
        event: &ChangeEvent,
        found: &WorkerHistory,
        active: &WorkerRecord,
        lookup: WorkerLookup,
        history: &dyn EventHistory,
    ) -> Result<Classification> {
        let interval = match active.interval() {
            Ok(interval) => interval,
            Err(err) => return Ok(date_skip(err)),
        };

        if self.options.detect_terminations {
            // Termination already admitted for this assignment: re-hire
            let pending = history.last_admitted_at(
                &event.subject(),
                EventKind::Termination,
                Some(&active.worker_key),
            )?;
            if pending.map_or(false, |at| at >= interval.start) {
                debug!(worker = %active.worker_key, "pending termination, treating as re-hire");
                return Ok(Classification::Admit(Assignment::onboarding(Some(lookup))));
            }

            if tax_id_drift(event.tax_id().as_deref(), active.tax_id.as_deref()) {
                debug!(worker = %active.worker_key, "tax id drift on active record");
                return Ok(Classification::Admit(Assignment::against(
                    EventKind::Modification,
                    active,
                    lookup,
                )));
            }
        }

        if interval.contains(event.created_at) {
            Ok(Classification::Admit(Assignment::against(
                EventKind::Modification,
                active,
                lookup,
            )))
        } else {
            debug!(
                worker = %active.worker_key,
                records = found.all_records.len(),
                "event outside active interval"
            );
            Ok(Classification::Skipped(SkipReason::OutOfRange))
        }
    }

    /// 4. History where every record has ended
    fn classify_closed(
        &self,
        event: &ChangeEvent,
        found: &WorkerHistory,
        lookup: WorkerLookup,
        history: &dyn EventHistory,
    ) -> Result<Classification> {
        let last_end = match found.last_end_date() {
            Ok(last_end) => last_end,
            Err(err) => return Ok(date_skip(err)),
        };

        let finalized = history.last_finalized_at(&event.subject(), EventKind::Onboarding)?;
        if let (Some(finalized_at), Some(newest)) = (finalized, found.newest_record()) {
            if last_end.map_or(true, |end| finalized_at > end) {
                debug!(worker = %newest.worker_key, "finalized onboarding on closed history");
                return Ok(Classification::Admit(Assignment::against(
                    EventKind::Modification,
                    newest,
                    lookup,
                )));
            }
        }

        match last_end {
            Some(end) if event.created_at <= end => {
                Ok(Classification::Skipped(SkipReason::OldRequest))
            }
            _ => Ok(Classification::Admit(Assignment::onboarding(Some(lookup)))),
        }
    }
}

/// Both sides present and different, ignoring case and surrounding spaces
fn tax_id_drift(inbound: Option<&str>, stored: Option<&str>) -> bool {
    match (inbound, stored) {
        (Some(a), Some(b)) => {
            let (a, b) = (a.trim(), b.trim());
            !a.is_empty() && !b.is_empty() && !a.eq_ignore_ascii_case(b)
        }
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryEventStore, PersistenceBoundary};
    use crate::mapper::to_persisted;
    use crate::workers::MemoryWorkerDirectory;
    use serde_json::{json, Value};

    fn event(etag: &str, created: &str, extra: Value) -> ChangeEvent {
        let mut payload = json!({
            "@odata.etag": etag,
            "CreatedDate": created,
            "CompanyIdATISA": "0042",
            "FirstName": "Ana",
            "LastName1": "Ruiz",
        });
        if let (Some(base), Some(more)) = (payload.as_object_mut(), extra.as_object()) {
            base.extend(more.clone());
        }
        ChangeEvent::from_remote(payload.as_object().cloned().unwrap()).unwrap()
    }

    fn worker(key: &str, start: &str, end: Option<&str>, tax_id: Option<&str>) -> WorkerRecord {
        WorkerRecord {
            worker_key: key.to_string(),
            company: "0042".to_string(),
            first_name: "Ana".to_string(),
            last_name1: "Ruiz".to_string(),
            last_name2: "".to_string(),
            start_date: start.to_string(),
            end_date: end.map(str::to_string),
            phone: None,
            insurance_number: None,
            tax_id: tax_id.map(str::to_string),
        }
    }

    fn classify(
        classifier: &EventClassifier,
        event: &ChangeEvent,
        workers: &MemoryWorkerDirectory,
        store: &MemoryEventStore,
    ) -> Classification {
        classifier.classify(event, workers, store, store).unwrap()
    }

    fn admitted(classification: Classification) -> Assignment {
        match classification {
            Classification::Admit(assignment) => assignment,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn test_modification_inside_active_interval() {
        let workers = MemoryWorkerDirectory::new(vec![worker("77", "2024-01-01", None, None)]);
        let store = MemoryEventStore::new();

        let assignment = admitted(classify(
            &EventClassifier::default(),
            &event("W/\"1\"", "2024-06-01", json!({})),
            &workers,
            &store,
        ));
        assert_eq!(assignment.kind, EventKind::Modification);
        assert_eq!(assignment.worker_key, "77");
        assert_eq!(assignment.matched_by, Some(WorkerLookup::ByName));
    }

    #[test]
    fn test_before_active_interval_is_out_of_range() {
        let workers = MemoryWorkerDirectory::new(vec![worker("77", "2024-01-01", None, None)]);
        let store = MemoryEventStore::new();

        let outcome = classify(
            &EventClassifier::default(),
            &event("W/\"1\"", "2023-01-01", json!({})),
            &workers,
            &store,
        );
        assert_eq!(outcome.code(), "out_of_range");
    }

    #[test]
    fn test_closed_history_onboarding_or_old_request() {
        let workers =
            MemoryWorkerDirectory::new(vec![worker("77", "2023-01-01", Some("2024-03-01"), None)]);
        let store = MemoryEventStore::new();
        let classifier = EventClassifier::default();

        let fresh = admitted(classify(&classifier, &event("W/\"1\"", "2024-04-01", json!({})), &workers, &store));
        assert_eq!(fresh.kind, EventKind::Onboarding);
        assert_eq!(fresh.worker_key, NO_PRIOR_WORKER);

        let stale = classify(&classifier, &event("W/\"2\"", "2024-02-01", json!({})), &workers, &store);
        assert_eq!(stale.code(), "old_request");
    }

    #[test]
    fn test_no_history_is_onboarding() {
        let workers = MemoryWorkerDirectory::default();
        let store = MemoryEventStore::new();

        let assignment = admitted(classify(
            &EventClassifier::default(),
            &event("W/\"1\"", "2024-06-01", json!({})),
            &workers,
            &store,
        ));
        assert_eq!(assignment.kind, EventKind::Onboarding);
        assert!(assignment.reference.is_none());
        assert!(assignment.matched_by.is_none());
    }

    #[test]
    fn test_preconditions() {
        let workers = MemoryWorkerDirectory::default();
        let store = MemoryEventStore::new();
        let classifier = EventClassifier::default();

        let incomplete = event("W/\"1\"", "2024-06-01", json!({"FirstName": " "}));
        assert_eq!(classify(&classifier, &incomplete, &workers, &store).code(), "missing_fields");

        let strict = EventClassifier::new(ClassifierOptions {
            require_tax_id: true,
            ..ClassifierOptions::default()
        });
        let no_tax_id = event("W/\"2\"", "2024-06-01", json!({}));
        assert_eq!(classify(&strict, &no_tax_id, &workers, &store).code(), "missing_fields");

        let seen = event("W/\"3\"", "2024-06-01", json!({}));
        store
            .persist_admitted(&to_persisted(&seen, EventKind::Onboarding, NO_PRIOR_WORKER, None))
            .unwrap();
        assert_eq!(classify(&classifier, &seen, &workers, &store).code(), "duplicate");
    }

    #[test]
    fn test_explicit_end_date_is_termination() {
        let workers = MemoryWorkerDirectory::new(vec![worker("77", "2024-01-01", None, None)]);
        let store = MemoryEventStore::new();
        let classifier = EventClassifier::default();

        let leaving = event("W/\"1\"", "2024-06-01", json!({"EndDate": "2024-06-30"}));
        let assignment = admitted(classify(&classifier, &leaving, &workers, &store));
        assert_eq!(assignment.kind, EventKind::Termination);
        assert_eq!(assignment.worker_key, "77");

        // Placeholder end dates are not terminations
        let open = event("W/\"2\"", "2024-06-01", json!({"EndDate": "2154-12-31T00:00:00Z"}));
        assert_eq!(admitted(classify(&classifier, &open, &workers, &store)).kind, EventKind::Modification);

        // Simpler variant ignores end dates entirely
        let simple = EventClassifier::new(ClassifierOptions {
            detect_terminations: false,
            ..ClassifierOptions::default()
        });
        assert_eq!(admitted(classify(&simple, &leaving, &workers, &store)).kind, EventKind::Modification);
    }

    #[test]
    fn test_tax_id_drift_is_modification() {
        let workers =
            MemoryWorkerDirectory::new(vec![worker("77", "2024-01-01", None, Some("12345678Z"))]);
        let store = MemoryEventStore::new();

        // Outside the interval, but the tax id changed
        let drifted = event("W/\"1\"", "2023-06-01", json!({"VATNum": "87654321X"}));
        let assignment = admitted(classify(&EventClassifier::default(), &drifted, &workers, &store));
        assert_eq!(assignment.kind, EventKind::Modification);

        let same = event("W/\"2\"", "2023-06-01", json!({"VATNum": " 12345678z "}));
        assert_eq!(classify(&EventClassifier::default(), &same, &workers, &store).code(), "out_of_range");
    }

    #[test]
    fn test_pending_termination_means_rehire() {
        let workers = MemoryWorkerDirectory::new(vec![worker("77", "2024-01-01", None, None)]);
        let store = MemoryEventStore::new();

        let termination = event("W/\"1\"", "2024-05-01", json!({"EndDate": "2024-05-31"}));
        store
            .persist_admitted(&to_persisted(&termination, EventKind::Termination, "77", None))
            .unwrap();

        let rehire = event("W/\"2\"", "2024-07-01", json!({}));
        let assignment = admitted(classify(&EventClassifier::default(), &rehire, &workers, &store));
        assert_eq!(assignment.kind, EventKind::Onboarding);
        assert_eq!(assignment.worker_key, NO_PRIOR_WORKER);
    }

    #[test]
    fn test_finalized_onboarding_on_closed_history() {
        let workers = MemoryWorkerDirectory::new(vec![
            worker("70", "2020-01-01", Some("2021-01-01"), None),
            worker("77", "2023-01-01", Some("2024-03-01"), None),
        ]);
        let store = MemoryEventStore::new();

        let onboarding = event("W/\"1\"", "2024-04-01", json!({}));
        let id = store
            .persist_admitted(&to_persisted(&onboarding, EventKind::Onboarding, NO_PRIOR_WORKER, None))
            .unwrap();
        store.mark_processed(id);

        let follow_up = event("W/\"2\"", "2024-05-01", json!({}));
        let assignment = admitted(classify(&EventClassifier::default(), &follow_up, &workers, &store));
        assert_eq!(assignment.kind, EventKind::Modification);
        assert_eq!(assignment.worker_key, "77");
    }

    #[test]
    fn test_unparseable_dates_skip() {
        let workers = MemoryWorkerDirectory::new(vec![worker("77", "not a date", None, None)]);
        let store = MemoryEventStore::new();
        let classifier = EventClassifier::default();

        let outcome = classify(&classifier, &event("W/\"1\"", "2024-06-01", json!({})), &workers, &store);
        assert_eq!(outcome.code(), "date_error");

        let bad_end = event("W/\"2\"", "2024-06-01", json!({"EndDate": "end of month"}));
        assert_eq!(classify(&classifier, &bad_end, &workers, &store).code(), "date_error");
    }
}
