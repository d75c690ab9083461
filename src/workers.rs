// 👷 Worker History - Assignment records and the lookup chain
//
// Payroll owns the workers table; this side only reads it. A worker may
// have several records (re-hires, transfers); the active one has no end date
// (or an open-ended placeholder).

use crate::error::SyncError;
use crate::events::SubjectKey;
use crate::temporal::{is_open_ended, parse_timestamp, ValidityInterval};
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

// ============================================================================
// WORKER RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_key: String,
    pub company: String,
    pub first_name: String,
    pub last_name1: String,
    pub last_name2: String,
    pub start_date: String,
    pub end_date: Option<String>,
    pub phone: Option<String>,
    pub insurance_number: Option<String>,
    pub tax_id: Option<String>,
}

impl WorkerRecord {
    /// Parsed end instant; blank and open-ended placeholders are None
    pub fn end_instant(&self) -> Result<Option<NaiveDateTime>, SyncError> {
        match self.end_date.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => {
                let parsed = parse_timestamp(raw)?;
                if is_open_ended(parsed.date()) {
                    Ok(None)
                } else {
                    Ok(Some(parsed))
                }
            }
        }
    }

    /// No end date, or an open-ended placeholder; unparseable end dates are not active
    pub fn is_active(&self) -> bool {
        matches!(self.end_instant(), Ok(None))
    }

    pub fn interval(&self) -> Result<ValidityInterval, SyncError> {
        Ok(ValidityInterval::new(
            parse_timestamp(&self.start_date)?,
            self.end_instant()?,
        ))
    }

    fn start_sort_key(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.start_date).ok()
    }
}

// ============================================================================
// WORKER HISTORY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHistory {
    pub has_active: bool,
    pub active_record: Option<WorkerRecord>,
    /// Newest start date first
    pub all_records: Vec<WorkerRecord>,
}

impl WorkerHistory {
    /// None when there are no records at all
    pub fn from_records(mut records: Vec<WorkerRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by_key(|r| Reverse(r.start_sort_key()));

        let active_record = records.iter().find(|r| r.is_active()).cloned();
        Some(WorkerHistory {
            has_active: active_record.is_some(),
            active_record,
            all_records: records,
        })
    }

    /// The active record, or the most recent one when none is active
    pub fn reference_record(&self) -> Option<&WorkerRecord> {
        self.active_record.as_ref().or_else(|| self.all_records.first())
    }

    pub fn newest_record(&self) -> Option<&WorkerRecord> {
        self.all_records.first()
    }

    /// Latest end date across all records
    pub fn last_end_date(&self) -> Result<Option<NaiveDateTime>, SyncError> {
        let mut latest = None;
        for record in &self.all_records {
            if let Some(end) = record.end_instant()? {
                latest = latest.max(Some(end));
            }
        }
        Ok(latest)
    }
}

// ============================================================================
// RESOLVER CONTRACT + LOOKUP CHAIN
// ============================================================================

pub trait WorkerHistoryResolver {
    fn find_by_identity(&self, subject: &SubjectKey) -> Result<Option<WorkerHistory>>;

    fn find_by_insurance_number(&self, company: &str, insurance_number: &str)
        -> Result<Option<WorkerHistory>>;

    fn find_by_tax_id(&self, company: &str, tax_id: &str) -> Result<Option<WorkerHistory>>;
}

/// What a lookup can key on
#[derive(Debug, Clone, Copy)]
pub struct LookupKeys<'a> {
    pub subject: &'a SubjectKey,
    pub insurance_number: Option<&'a str>,
    pub tax_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLookup {
    ByName,
    ByInsuranceNumber,
    ByTaxId,
}

impl WorkerLookup {
    pub fn find(
        &self,
        resolver: &dyn WorkerHistoryResolver,
        keys: &LookupKeys<'_>,
    ) -> Result<Option<WorkerHistory>> {
        let company = keys.subject.company.as_str();
        match self {
            WorkerLookup::ByName => resolver.find_by_identity(keys.subject),
            WorkerLookup::ByInsuranceNumber => match keys.insurance_number {
                Some(nass) => resolver.find_by_insurance_number(company, nass),
                None => Ok(None),
            },
            WorkerLookup::ByTaxId => match keys.tax_id {
                Some(tax_id) => resolver.find_by_tax_id(company, tax_id),
                None => Ok(None),
            },
        }
    }
}

/// Ordered lookups; the first one that finds a history wins
#[derive(Debug, Clone)]
pub struct WorkerLocator {
    lookups: Vec<WorkerLookup>,
}

impl WorkerLocator {
    pub fn new(lookups: Vec<WorkerLookup>) -> Self {
        WorkerLocator { lookups }
    }

    pub fn locate(
        &self,
        resolver: &dyn WorkerHistoryResolver,
        keys: &LookupKeys<'_>,
    ) -> Result<Option<(WorkerLookup, WorkerHistory)>> {
        for lookup in &self.lookups {
            if let Some(history) = lookup.find(resolver, keys)? {
                return Ok(Some((*lookup, history)));
            }
        }
        Ok(None)
    }
}

impl Default for WorkerLocator {
    fn default() -> Self {
        WorkerLocator::new(vec![
            WorkerLookup::ByName,
            WorkerLookup::ByInsuranceNumber,
            WorkerLookup::ByTaxId,
        ])
    }
}

// ============================================================================
// IN-MEMORY DIRECTORY
// ============================================================================

/// MemoryWorkerDirectory - resolver over a fixed list of records
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkerDirectory {
    records: Vec<WorkerRecord>,
}

impl MemoryWorkerDirectory {
    pub fn new(records: Vec<WorkerRecord>) -> Self {
        MemoryWorkerDirectory { records }
    }

    fn collect<F: Fn(&WorkerRecord) -> bool>(&self, predicate: F) -> Option<WorkerHistory> {
        WorkerHistory::from_records(self.records.iter().filter(|r| predicate(r)).cloned().collect())
    }
}

impl WorkerHistoryResolver for MemoryWorkerDirectory {
    fn find_by_identity(&self, subject: &SubjectKey) -> Result<Option<WorkerHistory>> {
        Ok(self.collect(|r| {
            r.company == subject.company
                && r.first_name == subject.first_name
                && r.last_name1 == subject.last_name1
                && r.last_name2 == subject.last_name2
        }))
    }

    fn find_by_insurance_number(&self, company: &str, insurance_number: &str) -> Result<Option<WorkerHistory>> {
        Ok(self.collect(|r| {
            r.company == company && r.insurance_number.as_deref() == Some(insurance_number)
        }))
    }

    fn find_by_tax_id(&self, company: &str, tax_id: &str) -> Result<Option<WorkerHistory>> {
        Ok(self.collect(|r| r.company == company && r.tax_id.as_deref() == Some(tax_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, start: &str, end: Option<&str>) -> WorkerRecord {
        WorkerRecord {
            worker_key: key.to_string(),
            company: "0042".to_string(),
            first_name: "Ana".to_string(),
            last_name1: "Ruiz".to_string(),
            last_name2: "".to_string(),
            start_date: start.to_string(),
            end_date: end.map(str::to_string),
            phone: None,
            insurance_number: Some("281234567890".to_string()),
            tax_id: Some("12345678Z".to_string()),
        }
    }

    #[test]
    fn test_history_picks_newest_active_record() {
        let history = WorkerHistory::from_records(vec![
            record("10", "2020-01-01", Some("2021-01-01")),
            record("11", "2022-01-01", None),
            record("12", "2023-01-01", Some("9999-12-31")),
        ])
        .unwrap();

        assert!(history.has_active);
        assert_eq!(history.active_record.as_ref().unwrap().worker_key, "12");
        assert_eq!(history.newest_record().unwrap().worker_key, "12");
        assert_eq!(
            history.last_end_date().unwrap().map(|d| d.date().to_string()),
            Some("2021-01-01".to_string())
        );
    }

    #[test]
    fn test_history_without_active_record() {
        let history = WorkerHistory::from_records(vec![
            record("10", "2020-01-01", Some("2021-01-01")),
            record("11", "2022-01-01", Some("2024-03-01")),
        ])
        .unwrap();

        assert!(!history.has_active);
        assert_eq!(history.reference_record().unwrap().worker_key, "11");
        assert_eq!(
            history.last_end_date().unwrap().map(|d| d.date().to_string()),
            Some("2024-03-01".to_string())
        );

        assert!(WorkerHistory::from_records(Vec::new()).is_none());
    }

    #[test]
    fn test_unparseable_end_date_is_not_active() {
        let broken = record("10", "2020-01-01", Some("someday"));
        assert!(!broken.is_active());
        assert!(broken.end_instant().is_err());
        assert!(record("11", "2020-01-01", Some("2154-12-31")).is_active());
    }

    #[test]
    fn test_locator_fallback_order() {
        let directory = MemoryWorkerDirectory::new(vec![record("10", "2022-01-01", None)]);
        let locator = WorkerLocator::default();

        // Name changed remotely; insurance number still matches
        let renamed = SubjectKey::new("0042", "Anna", "Ruiz", "");
        let keys = LookupKeys {
            subject: &renamed,
            insurance_number: Some("281234567890"),
            tax_id: None,
        };
        let (lookup, history) = locator.locate(&directory, &keys).unwrap().unwrap();
        assert_eq!(lookup, WorkerLookup::ByInsuranceNumber);
        assert_eq!(history.all_records.len(), 1);

        let keys = LookupKeys {
            subject: &renamed,
            insurance_number: None,
            tax_id: Some("12345678Z"),
        };
        let (lookup, _) = locator.locate(&directory, &keys).unwrap().unwrap();
        assert_eq!(lookup, WorkerLookup::ByTaxId);

        let keys = LookupKeys {
            subject: &renamed,
            insurance_number: None,
            tax_id: None,
        };
        assert!(locator.locate(&directory, &keys).unwrap().is_none());
    }
}
