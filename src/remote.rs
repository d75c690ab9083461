// 🌐 Remote Catalog Client - Contract + in-memory implementation
//
// The engines only see the trait. `HttpRemoteCatalog` (erp_client.rs) talks
// to the ERP; `InMemoryRemoteCatalog` backs tests and dry runs.

use crate::catalog::{EntityDescriptor, TENANT_FIELD};
use crate::error::RemoteError;
use crate::identity::{field_text, RemoteRecord};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

/// Annotation carrying the optimistic-concurrency token
pub const ETAG_FIELD: &str = "@odata.etag";

/// Annotation carrying the canonical URL of a row
pub const ODATA_ID_FIELD: &str = "@odata.id";

// ============================================================================
// REMOTE KEY
// ============================================================================

/// One component of a key expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    /// Quoted in the key expression
    Text(String),
    /// Emitted bare (numeric row ids)
    Number(i64),
}

impl KeyValue {
    fn matches(&self, record: &RemoteRecord, field: &str) -> bool {
        let Some(actual) = raw_key_text(record, field) else {
            return false;
        };
        match self {
            KeyValue::Text(expected) => actual == *expected,
            KeyValue::Number(expected) => actual == expected.to_string(),
        }
    }
}

/// Key field value exactly as stored (padding kept), so rows whose values
/// differ only by surrounding spaces stay addressable one by one
fn raw_key_text(record: &RemoteRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Key expression addressing one remote row, e.g.
/// `(dataAreaId='itb',EQMIncidentGroupATISAId='I01')`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub parts: Vec<(String, KeyValue)>,
}

impl RemoteKey {
    pub fn single(field: &str, value: &str) -> Self {
        RemoteKey {
            parts: vec![(field.to_string(), KeyValue::Text(value.to_string()))],
        }
    }

    pub fn numeric(field: &str, value: i64) -> Self {
        RemoteKey {
            parts: vec![(field.to_string(), KeyValue::Number(value))],
        }
    }

    /// Prefix the tenant partition
    pub fn scoped(mut self, tenant: &str) -> Self {
        self.parts
            .insert(0, (TENANT_FIELD.to_string(), KeyValue::Text(tenant.to_string())));
        self
    }

    /// Key for a business identity of the given entity kind
    ///
    /// Composite kinds are addressed by all components jointly and never by
    /// tenant; a composite identity that does not split cleanly falls back to
    /// the first key field alone.
    pub fn for_identity(descriptor: &EntityDescriptor, tenant: &str, identity: &str) -> Self {
        if let Some(composite) = &descriptor.composite {
            let pieces = composite.split(identity);
            if pieces.len() == composite.fields.len() {
                return RemoteKey {
                    parts: composite
                        .fields
                        .iter()
                        .zip(pieces)
                        .map(|(f, v)| (f.clone(), KeyValue::Text(v.to_string())))
                        .collect(),
                };
            }
            return RemoteKey::single(&descriptor.key_field, identity);
        }

        let key = RemoteKey::single(&descriptor.key_field, identity);
        if descriptor.tenant_scoped {
            key.scoped(tenant)
        } else {
            key
        }
    }

    /// Key built from the row's own key field values, so a duplicate row is
    /// addressed by what it actually holds
    pub fn from_record(
        descriptor: &EntityDescriptor,
        tenant: &str,
        record: &RemoteRecord,
        identity: &str,
    ) -> Self {
        let fields = descriptor.key_fields();
        let values: Option<Vec<String>> = fields.iter().map(|f| raw_key_text(record, f)).collect();
        match values {
            Some(values) => {
                let key = RemoteKey {
                    parts: fields
                        .iter()
                        .zip(values)
                        .map(|(f, v)| (f.to_string(), KeyValue::Text(v)))
                        .collect(),
                };
                if descriptor.tenant_scoped && !descriptor.is_composite() {
                    key.scoped(tenant)
                } else {
                    key
                }
            }
            None => RemoteKey::for_identity(descriptor, tenant, identity),
        }
    }

    pub fn matches(&self, record: &RemoteRecord) -> bool {
        self.parts.iter().all(|(field, value)| value.matches(record, field))
    }

    /// OData key segment, values percent-encoded
    pub fn to_odata(&self) -> String {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|(field, value)| match value {
                KeyValue::Text(v) => format!("{}='{}'", field, urlencoding::encode(v)),
                KeyValue::Number(n) => format!("{}={}", field, n),
            })
            .collect();
        format!("({})", parts.join(","))
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_odata())
    }
}

/// Listing filter restricting rows to one tenant partition
pub fn tenant_filter(tenant: &str) -> String {
    format!("{} eq '{}'", TENANT_FIELD, tenant.replace('\'', "''"))
}

// ============================================================================
// CLIENT CONTRACT
// ============================================================================

pub trait RemoteCatalogClient {
    fn list(&self, entity: &str, filter: Option<&str>) -> Result<Vec<RemoteRecord>, RemoteError>;

    fn create(&self, entity: &str, payload: &RemoteRecord) -> Result<RemoteRecord, RemoteError>;

    fn update(
        &self,
        entity: &str,
        key: &RemoteKey,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Update a row addressed by its canonical URL (`@odata.id`)
    fn update_by_url(
        &self,
        url: &str,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError>;

    fn delete(&self, entity: &str, key: &RemoteKey) -> Result<(), RemoteError>;
}

// ============================================================================
// IN-MEMORY CATALOG
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<String, Vec<RemoteRecord>>,
    unique_keys: HashMap<String, Vec<String>>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    calls: Vec<String>,
    etag_counter: u64,
}

/// InMemoryRemoteCatalog - remote ERP double with call log and injectable failures
#[derive(Debug, Default)]
pub struct InMemoryRemoteCatalog {
    state: Mutex<MemoryState>,
}

impl InMemoryRemoteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows for an entity set (appended in order)
    pub fn seed(&self, entity: &str, rows: Vec<RemoteRecord>) {
        let mut state = self.lock();
        state
            .entities
            .entry(entity.to_string())
            .or_default()
            .extend(rows);
    }

    /// Reject creates whose values for these fields collide with an existing row
    pub fn with_unique_key(self, entity: &str, fields: &[&str]) -> Self {
        self.lock().unique_keys.insert(
            entity.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    /// Fail the next call of `operation` ("list", "create", "update", "delete")
    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn rows(&self, entity: &str) -> Vec<RemoteRecord> {
        self.lock().entities.get(entity).cloned().unwrap_or_default()
    }

    /// Mutating calls issued so far, e.g. `create CompanyATISAs`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MemoryState {
    fn take_failure(&mut self, operation: &'static str) -> Result<(), RemoteError> {
        match self.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("W/\"{}\"", self.etag_counter)
    }

    fn check_token(row: &RemoteRecord, token: Option<&str>) -> Result<(), RemoteError> {
        if let (Some(expected), Some(Value::String(actual))) = (token, row.get(ETAG_FIELD)) {
            if expected != actual {
                return Err(RemoteError::PreconditionFailed(format!(
                    "token {} does not match {}",
                    expected, actual
                )));
            }
        }
        Ok(())
    }

    fn apply_patch(&mut self, row_etag_present: bool, payload: &RemoteRecord) -> RemoteRecord {
        let mut patch = payload.clone();
        if row_etag_present {
            patch.insert(ETAG_FIELD.to_string(), Value::String(self.next_etag()));
        }
        patch
    }
}

impl RemoteCatalogClient for InMemoryRemoteCatalog {
    fn list(&self, entity: &str, filter: Option<&str>) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut state = self.lock();
        state.take_failure("list")?;

        let rows = state.entities.get(entity).cloned().unwrap_or_default();
        let Some(filter) = filter else {
            return Ok(rows);
        };

        // Only `Field eq 'value'` is understood, which is all the engines issue
        match filter.split_once(" eq ") {
            Some((field, value)) => {
                let field = field.trim();
                let value = value.trim().trim_matches('\'').replace("''", "'");
                Ok(rows
                    .into_iter()
                    .filter(|r| field_text(r, field).as_deref() == Some(value.as_str()))
                    .collect())
            }
            None => Ok(rows),
        }
    }

    fn create(&self, entity: &str, payload: &RemoteRecord) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock();
        state.calls.push(format!("create {}", entity));
        state.take_failure("create")?;

        if let Some(fields) = state.unique_keys.get(entity).cloned() {
            let rows = state.entities.get(entity).map(Vec::as_slice).unwrap_or(&[]);
            let collides = rows.iter().any(|row| {
                fields
                    .iter()
                    .all(|f| field_text(row, f).is_some() && field_text(row, f) == field_text(payload, f))
            });
            if collides {
                return Err(RemoteError::AlreadyExists(format!(
                    "The record already exists in {}",
                    entity
                )));
            }
        }

        let mut row = payload.clone();
        let etag = state.next_etag();
        row.insert(ETAG_FIELD.to_string(), Value::String(etag));
        state
            .entities
            .entry(entity.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    fn update(
        &self,
        entity: &str,
        key: &RemoteKey,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock();
        state.calls.push(format!("update {}", entity));
        state.take_failure("update")?;

        let position = state
            .entities
            .get(entity)
            .and_then(|rows| rows.iter().position(|r| key.matches(r)))
            .ok_or_else(|| RemoteError::NotFound(format!("No route data was found for {}", key)))?;

        let (etag_present, snapshot) = {
            let row = &state.entities[entity][position];
            MemoryState::check_token(row, concurrency_token)?;
            (row.contains_key(ETAG_FIELD), row.clone())
        };
        let patch = state.apply_patch(etag_present, payload);

        let mut updated = snapshot;
        updated.extend(patch);
        if let Some(rows) = state.entities.get_mut(entity) {
            rows[position] = updated.clone();
        }
        Ok(updated)
    }

    fn update_by_url(
        &self,
        url: &str,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock();
        state.calls.push(format!("update_by_url {}", url));
        state.take_failure("update")?;

        let located = state.entities.iter().find_map(|(entity, rows)| {
            rows.iter()
                .position(|r| field_text(r, ODATA_ID_FIELD).as_deref() == Some(url))
                .map(|pos| (entity.clone(), pos))
        });
        let (entity, position) =
            located.ok_or_else(|| RemoteError::NotFound(format!("No HTTP resource was found at {}", url)))?;

        let (etag_present, snapshot) = {
            let row = &state.entities[&entity][position];
            MemoryState::check_token(row, concurrency_token)?;
            (row.contains_key(ETAG_FIELD), row.clone())
        };
        let patch = state.apply_patch(etag_present, payload);

        let mut updated = snapshot;
        updated.extend(patch);
        if let Some(rows) = state.entities.get_mut(&entity) {
            rows[position] = updated.clone();
        }
        Ok(updated)
    }

    fn delete(&self, entity: &str, key: &RemoteKey) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.calls.push(format!("delete {}", entity));
        state.take_failure("delete")?;

        let rows = state
            .entities
            .get_mut(entity)
            .ok_or_else(|| RemoteError::NotFound(format!("No route data was found for {}", key)))?;

        // One row per call; among rows sharing a key the latest goes first
        match rows.iter().rposition(|r| key.matches(r)) {
            Some(pos) => {
                rows.remove(pos);
                Ok(())
            }
            None => Err(RemoteError::NotFound(format!(
                "No route data was found for {}",
                key
            ))),
        }
    }
}
