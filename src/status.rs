// 📤 Status Reporter - tell the ERP a persisted event was consumed
//
// The remote event is found again by its concurrency token (stored as the
// fingerprint), patched with If-Match, and only then is the local record
// marked processed.

use crate::db::{self, AuditAction, AuditEntry};
use crate::error::RemoteError;
use crate::events::EVENT_ENTITY;
use crate::identity::RemoteRecord;
use crate::mapper::{ProcessingOutcome, StatusPayload};
use crate::remote::{RemoteCatalogClient, RemoteKey, ETAG_FIELD, ODATA_ID_FIELD};
use crate::catalog::TENANT_FIELD;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Key fields tried in order when the event exposes no canonical URL
pub const EVENT_KEY_CANDIDATES: [&str; 4] = [
    "RecId",
    "EmployeeModificationsId",
    "EmployeeModificationId",
    "EQMEmployeeModificationsId",
];

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("persisted record {0} not found")]
    RecordNotFound(i64),

    #[error("record {0} carries an undecodable fingerprint")]
    InvalidFingerprint(i64),

    #[error("no remote event matches the concurrency token of record {0}")]
    RemoteEventNotFound(i64),

    #[error("remote event for record {0} exposes no key field")]
    NoKeyField(i64),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    Reported { id: i64 },
    Skipped { id: i64, reason: String },
}

pub struct StatusReporter<'a> {
    client: &'a dyn RemoteCatalogClient,
    tenant: String,
}

impl<'a> StatusReporter<'a> {
    pub fn new(client: &'a dyn RemoteCatalogClient, tenant: &str) -> Self {
        StatusReporter {
            client,
            tenant: tenant.to_string(),
        }
    }

    pub fn report(
        &self,
        conn: &Connection,
        record_id: i64,
        outcome: &ProcessingOutcome,
    ) -> Result<ReportOutcome, StatusError> {
        let record =
            db::get_persisted_record(conn, record_id)?.ok_or(StatusError::RecordNotFound(record_id))?;
        if record.processed {
            return Ok(ReportOutcome::Skipped {
                id: record_id,
                reason: "already_processed".to_string(),
            });
        }

        let token = record
            .fingerprint
            .decode_token()
            .ok_or(StatusError::InvalidFingerprint(record_id))?;
        let payload = StatusPayload::from_outcome(&record, outcome).to_remote();

        if let Some(url) = record.remote_url.as_deref() {
            self.client.update_by_url(url, &payload, Some(&token))?;
            return self.finish(conn, record_id, outcome);
        }

        let event = self
            .find_event(record.personnel_number.as_deref(), &token)?
            .ok_or(StatusError::RemoteEventNotFound(record_id))?;

        match event.get(ODATA_ID_FIELD).and_then(Value::as_str) {
            Some(url) => {
                self.client.update_by_url(url, &payload, Some(&token))?;
            }
            None => {
                let key = self.event_key(&event).ok_or(StatusError::NoKeyField(record_id))?;
                self.client.update(EVENT_ENTITY, &key, &payload, Some(&token))?;
            }
        }

        self.finish(conn, record_id, outcome)
    }

    fn finish(
        &self,
        conn: &Connection,
        record_id: i64,
        outcome: &ProcessingOutcome,
    ) -> Result<ReportOutcome, StatusError> {
        db::mark_processed(conn, record_id)?;
        db::record_audit(
            conn,
            &AuditEntry::for_record(
                AuditAction::WorkerEventReported,
                record_id,
                serde_json::json!({ "outcome": outcome }),
            ),
        )?;

        info!(id = record_id, "status reported");
        Ok(ReportOutcome::Reported { id: record_id })
    }

    /// Narrow by personnel number first, then fall back to the full listing
    fn find_event(
        &self,
        personnel_number: Option<&str>,
        token: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        let matches_token = |r: &RemoteRecord| {
            r.get(ETAG_FIELD).and_then(Value::as_str).map(str::trim) == Some(token.trim())
        };

        if let Some(number) = personnel_number {
            let filter = format!("PersonnelNumber eq '{}'", number.replace('\'', "''"));
            let rows = self.client.list(EVENT_ENTITY, Some(&filter))?;
            if let Some(found) = rows.into_iter().find(|r| matches_token(r)) {
                return Ok(Some(found));
            }
            warn!(personnel_number = number, "event not found by personnel number, scanning all");
        }

        let rows = self.client.list(EVENT_ENTITY, None)?;
        Ok(rows.into_iter().find(|r| matches_token(r)))
    }

    /// Row ids are numeric and global; the other candidates are tenant scoped
    fn event_key(&self, event: &RemoteRecord) -> Option<RemoteKey> {
        let (field, value) = EVENT_KEY_CANDIDATES
            .iter()
            .find_map(|f| event.get(*f).map(|v| (*f, v)))?;

        let key = match value {
            Value::Number(n) => RemoteKey::numeric(field, n.as_i64()?),
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(n) if s.trim().chars().all(|c| c.is_ascii_digit()) => RemoteKey::numeric(field, n),
                _ => RemoteKey::single(field, s),
            },
            _ => return None,
        };

        if field == EVENT_KEY_CANDIDATES[0] {
            return Some(key);
        }
        let tenant = event
            .get(TENANT_FIELD)
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(self.tenant.as_str());
        Some(key.scoped(tenant))
    }
}
