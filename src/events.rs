// 📨 Change Events - Inbound worker lifecycle records from the ERP
//
// A ChangeEvent is immutable once parsed. It keeps the raw payload so the
// mapper can read every optional field, plus the parsed pieces the
// classifier and the gate need on every call.

use crate::error::SyncError;
use crate::identity::{field_text, RemoteRecord};
use crate::ledger::Fingerprint;
use crate::remote::{ETAG_FIELD, ODATA_ID_FIELD};
use crate::temporal::parse_timestamp;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Remote entity set carrying worker change events
pub const EVENT_ENTITY: &str = "EmployeeModifications";

/// Worker key attached to onboardings (no prior worker)
pub const NO_PRIOR_WORKER: &str = "0";

/// Payload field names
pub mod fields {
    pub const CREATED_DATE: &str = "CreatedDate";
    pub const COMPANY: &str = "CompanyIdATISA";
    pub const FIRST_NAME: &str = "FirstName";
    pub const LAST_NAME_1: &str = "LastName1";
    pub const LAST_NAME_2: &str = "LastName2";
    pub const TAX_ID: &str = "VATNum";
    pub const INSURANCE_NUMBER: &str = "NASS";
    pub const END_DATE: &str = "EndDate";
    pub const PERSONNEL_NUMBER: &str = "PersonnelNumber";
    pub const PHONE: &str = "Phone";
    pub const GENDER: &str = "Gender";
    pub const BIRTH_DATE: &str = "BirthDate";
    pub const EMAIL: &str = "Email";
    pub const ZIP_CODE: &str = "ZipCode";
    pub const START_DATE: &str = "StartDate";
    pub const SALARY: &str = "Salary";
    pub const BANK_ACCOUNT: &str = "BankAccount";
    pub const HOLIDAY_GROUP: &str = "HolidaysAbsencesGroupATISAId";
    pub const LIBRARY_GROUP: &str = "LibrariesGroupATISAId";
    pub const ADVANCE_GROUP: &str = "AdvanceGroupATISAId";
    pub const STREET: &str = "Street";
    pub const CITY: &str = "City";
    pub const COUNTY: &str = "County";
    pub const COUNTRY: &str = "CountryRegionId";
    pub const JOB_POSITION: &str = "JobPositionIdATISA";
    pub const CONTRACT_TYPE: &str = "ContractTypeID";
    pub const SENIORITY_DATE: &str = "SeniorityDate";
    pub const CONTRACT_REASON: &str = "Reasonforcontract";
}

// ============================================================================
// EVENT KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Onboarding,
    Termination,
    Modification,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Onboarding => "onboarding",
            EventKind::Termination => "termination",
            EventKind::Modification => "modification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "onboarding" => Some(EventKind::Onboarding),
            "termination" => Some(EventKind::Termination),
            "modification" => Some(EventKind::Modification),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SUBJECT KEY
// ============================================================================

/// Name identity of a worker within a company; the unit of ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub company: String,
    pub first_name: String,
    pub last_name1: String,
    /// Empty when the worker has no second surname
    pub last_name2: String,
}

impl SubjectKey {
    pub fn new(company: &str, first_name: &str, last_name1: &str, last_name2: &str) -> Self {
        SubjectKey {
            company: company.trim().to_string(),
            first_name: first_name.trim().to_string(),
            last_name1: last_name1.trim().to_string(),
            last_name2: last_name2.trim().to_string(),
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} {}",
            self.company, self.first_name, self.last_name1, self.last_name2
        )
    }
}

// ============================================================================
// CHANGE EVENT
// ============================================================================

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("event has no concurrency token")]
    MissingConcurrencyToken,

    #[error("event has no created date")]
    MissingCreatedDate,

    #[error("invalid created date: {0}")]
    InvalidCreatedDate(#[source] SyncError),
}

impl EventParseError {
    pub fn code(&self) -> &'static str {
        match self {
            EventParseError::MissingConcurrencyToken => "missing_etag",
            EventParseError::MissingCreatedDate => "missing_created_date",
            EventParseError::InvalidCreatedDate(_) => "date_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub fingerprint: Fingerprint,
    pub concurrency_token: String,
    pub created_at: NaiveDateTime,
    pub payload: RemoteRecord,
}

impl ChangeEvent {
    pub fn from_remote(payload: RemoteRecord) -> Result<Self, EventParseError> {
        let concurrency_token =
            field_text(&payload, ETAG_FIELD).ok_or(EventParseError::MissingConcurrencyToken)?;
        let created_raw = field_text(&payload, fields::CREATED_DATE)
            .ok_or(EventParseError::MissingCreatedDate)?;
        let created_at =
            parse_timestamp(&created_raw).map_err(EventParseError::InvalidCreatedDate)?;

        Ok(ChangeEvent {
            fingerprint: Fingerprint::from_token(&concurrency_token),
            concurrency_token,
            created_at,
            payload,
        })
    }

    /// Trimmed text of a payload field; blank means absent
    pub fn field(&self, name: &str) -> Option<String> {
        field_text(&self.payload, name)
    }

    pub fn company(&self) -> Option<String> {
        self.field(fields::COMPANY)
    }

    pub fn tax_id(&self) -> Option<String> {
        self.field(fields::TAX_ID)
    }

    pub fn insurance_number(&self) -> Option<String> {
        self.field(fields::INSURANCE_NUMBER)
    }

    pub fn end_date(&self) -> Option<String> {
        self.field(fields::END_DATE)
    }

    pub fn personnel_number(&self) -> Option<String> {
        self.field(fields::PERSONNEL_NUMBER)
    }

    pub fn odata_id(&self) -> Option<String> {
        self.field(ODATA_ID_FIELD)
    }

    /// Required identity fields that are absent
    pub fn missing_identity_fields(&self, require_tax_id: bool) -> Vec<String> {
        let mut required = vec![fields::COMPANY, fields::FIRST_NAME, fields::LAST_NAME_1];
        if require_tax_id {
            required.push(fields::TAX_ID);
        }
        required
            .into_iter()
            .filter(|f| self.field(f).is_none())
            .map(str::to_string)
            .collect()
    }

    /// Subject key; missing second surname becomes empty
    pub fn subject(&self) -> SubjectKey {
        SubjectKey::new(
            &self.company().unwrap_or_default(),
            &self.field(fields::FIRST_NAME).unwrap_or_default(),
            &self.field(fields::LAST_NAME_1).unwrap_or_default(),
            &self.field(fields::LAST_NAME_2).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> RemoteRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_event() {
        let event = ChangeEvent::from_remote(payload(json!({
            "@odata.etag": "W/\"JzEsNTYzNzE0NDU3OCc=\"",
            "CreatedDate": "2024-06-01T08:00:00Z",
            "CompanyIdATISA": "0042",
            "FirstName": " Ana ",
            "LastName1": "Ruiz",
            "LastName2": null
        })))
        .unwrap();

        assert_eq!(event.concurrency_token, "W/\"JzEsNTYzNzE0NDU3OCc=\"");
        assert_eq!(event.created_at.to_string(), "2024-06-01 08:00:00");
        assert_eq!(event.subject(), SubjectKey::new("0042", "Ana", "Ruiz", ""));
        assert!(event.missing_identity_fields(false).is_empty());
        assert_eq!(event.missing_identity_fields(true), vec!["VATNum"]);
    }

    #[test]
    fn test_parse_errors() {
        let err = ChangeEvent::from_remote(payload(json!({"CreatedDate": "2024-06-01"}))).unwrap_err();
        assert_eq!(err.code(), "missing_etag");

        let err = ChangeEvent::from_remote(payload(json!({"@odata.etag": "x"}))).unwrap_err();
        assert_eq!(err.code(), "missing_created_date");

        let err = ChangeEvent::from_remote(payload(json!({"@odata.etag": "x", "CreatedDate": "soon"})))
            .unwrap_err();
        assert_eq!(err.code(), "date_error");
    }

    #[test]
    fn test_event_kind_codes() {
        for kind in [EventKind::Onboarding, EventKind::Termination, EventKind::Modification] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("A"), None);
    }
}
