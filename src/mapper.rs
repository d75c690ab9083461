// 🔁 Record Mapper - Inbound event <-> canonical persisted record
//
// Pure functions, no I/O. Inbound: blank -> absent, numeric best-value for
// phone and insurance number, decimal salary, dates to YYYY-MM-DD.
// Outbound: the minimal status payload reported back to the ERP.

use crate::events::{fields, ChangeEvent, EventKind, SubjectKey};
use crate::ledger::Fingerprint;
use crate::temporal::to_iso_date;
use crate::workers::WorkerRecord;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// PERSISTED RECORD
// ============================================================================

/// Canonical row written once an event clears the chronological gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Assigned by storage
    pub id: Option<i64>,
    pub kind: EventKind,
    pub worker_key: String,
    pub subject: SubjectKey,

    pub tax_id: Option<String>,
    pub gender: Option<String>,
    pub insurance_number: Option<String>,
    pub birth_date: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub zip_code: Option<String>,
    pub start_date: Option<String>,
    /// Decimal with a dot separator
    pub salary: Option<String>,
    pub bank_account: Option<String>,
    pub holiday_group: Option<i64>,
    pub library_group: Option<i64>,
    pub advance_group: Option<i64>,

    pub street: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub nationality: Option<i64>,

    pub job_position: Option<String>,
    pub contract_type: Option<String>,
    pub seniority_date: Option<String>,
    pub contract_end_date: Option<String>,
    pub contract_reason: Option<String>,

    pub personnel_number: Option<String>,
    pub fingerprint: Fingerprint,
    pub created_at: NaiveDateTime,
    /// Canonical URL of the remote event, when the ERP exposed one
    pub remote_url: Option<String>,
    /// Finalized downstream and reported back
    pub processed: bool,
}

// ============================================================================
// VALUE NORMALISATION
// ============================================================================

/// Digits with an optional leading minus and at most one decimal separator
pub fn is_numeric_string(value: &str) -> bool {
    let trimmed = value.trim();
    let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let mut separators = 0;
    let mut digits = 0;
    for c in unsigned.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' | ',' => separators += 1,
            _ => return false,
        }
    }
    digits > 0 && separators <= 1
}

/// Decimal text with a dot separator, or None when not numeric
pub fn parse_decimal(value: &str) -> Option<String> {
    if !is_numeric_string(value) {
        return None;
    }
    let normalized = value.trim().replace(',', ".");
    // Reject forms like "." or "-." that slipped through
    normalized.parse::<f64>().ok().map(|_| normalized)
}

pub fn parse_int(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok()
}

/// Inbound value when it is numeric; otherwise, for modifications only, the
/// stored history value when that one is numeric
fn best_numeric(
    inbound: Option<String>,
    stored: Option<&str>,
    kind: EventKind,
) -> Option<String> {
    if let Some(value) = inbound.as_deref() {
        if is_numeric_string(value) {
            return inbound;
        }
    }
    if kind != EventKind::Modification {
        return None;
    }
    stored
        .map(str::trim)
        .filter(|s| !s.is_empty() && is_numeric_string(s))
        .map(str::to_string)
}

// ============================================================================
// INBOUND -> CANONICAL
// ============================================================================

pub fn to_persisted(
    event: &ChangeEvent,
    kind: EventKind,
    worker_key: &str,
    reference: Option<&WorkerRecord>,
) -> PersistedRecord {
    let date = |name: &str| event.field(name).and_then(|v| to_iso_date(&v));
    let int = |name: &str| event.field(name).and_then(|v| parse_int(&v));

    PersistedRecord {
        id: None,
        kind,
        worker_key: worker_key.to_string(),
        subject: event.subject(),

        tax_id: event.tax_id(),
        gender: event.field(fields::GENDER),
        insurance_number: best_numeric(
            event.insurance_number(),
            reference.and_then(|r| r.insurance_number.as_deref()),
            kind,
        ),
        birth_date: date(fields::BIRTH_DATE),
        email: event.field(fields::EMAIL),
        phone: best_numeric(
            event.field(fields::PHONE),
            reference.and_then(|r| r.phone.as_deref()),
            kind,
        ),
        zip_code: event.field(fields::ZIP_CODE),
        start_date: date(fields::START_DATE),
        salary: event.field(fields::SALARY).and_then(|v| parse_decimal(&v)),
        bank_account: event.field(fields::BANK_ACCOUNT),
        holiday_group: int(fields::HOLIDAY_GROUP),
        library_group: int(fields::LIBRARY_GROUP),
        advance_group: int(fields::ADVANCE_GROUP),

        street: event.field(fields::STREET),
        city: event.field(fields::CITY),
        county: event.field(fields::COUNTY),
        nationality: int(fields::COUNTRY),

        job_position: event.field(fields::JOB_POSITION),
        contract_type: event.field(fields::CONTRACT_TYPE),
        seniority_date: date(fields::SENIORITY_DATE),
        contract_end_date: date(fields::END_DATE),
        contract_reason: event.field(fields::CONTRACT_REASON),

        personnel_number: event.personnel_number(),
        fingerprint: event.fingerprint.clone(),
        created_at: event.created_at,
        remote_url: event.odata_id(),
        processed: false,
    }
}

// ============================================================================
// CANONICAL -> OUTBOUND STATUS
// ============================================================================

/// Downstream outcome reported back to the ERP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingOutcome {
    Success,
    Failure { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub processed: bool,
    pub success: bool,
    pub error: bool,
    pub error_detail: Option<String>,
    pub personnel_number: Option<String>,
}

const DEFAULT_STATUS_DETAIL: &str = "Processed by payroll integration";

fn yes_no(flag: bool) -> Value {
    Value::String(if flag { "Yes" } else { "No" }.to_string())
}

impl StatusPayload {
    pub fn from_outcome(record: &PersistedRecord, outcome: &ProcessingOutcome) -> Self {
        let (success, error_detail) = match outcome {
            ProcessingOutcome::Success => (true, None),
            ProcessingOutcome::Failure { detail } => (false, Some(detail.clone())),
        };
        StatusPayload {
            processed: true,
            success,
            error: !success,
            error_detail,
            personnel_number: record.personnel_number.clone(),
        }
    }

    /// Remote field map for the PATCH body
    pub fn to_remote(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("Processed".to_string(), yes_no(self.processed));
        body.insert("ProcessedSuccess".to_string(), yes_no(self.success));
        body.insert("ProcessedError".to_string(), yes_no(self.error));
        body.insert(
            "TransitionReasonDescription".to_string(),
            Value::String(
                self.error_detail
                    .clone()
                    .unwrap_or_else(|| DEFAULT_STATUS_DETAIL.to_string()),
            ),
        );
        if let Some(number) = &self.personnel_number {
            body.insert(
                fields::PERSONNEL_NUMBER.to_string(),
                Value::String(number.clone()),
            );
        }
        body
    }
}
