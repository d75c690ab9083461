// ⚖️ Reconciliation Engine - Local catalog vs remote snapshot
//
// One pass per entity kind:
//   1. index local rows by identity (composites by the full joined key)
//   2. walk the remote snapshot in source order: purge duplicates, compare,
//      update or delete
//   3. create every local identity the snapshot never showed
//
// Per-record failures land in the report and never stop the pass. The
// engine keeps no cache; callers re-list the remote afterwards.

use crate::catalog::{EntityDescriptor, LocalValue, TemplateSource};
use crate::error::{RemoteError, SyncError};
use crate::identity::{field_text, IdentityOutcome, IdentityResolver, RemoteRecord};
use crate::local::LocalRecord;
use crate::remote::{RemoteCatalogClient, RemoteKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

// ============================================================================
// ACTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconciliationAction {
    Created,
    Updated { fields: Vec<String> },
    Deleted,
    Unchanged,
    DuplicateRemoved,
    Errored { error: String },
}

impl ReconciliationAction {
    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationAction::Created => "created",
            ReconciliationAction::Updated { .. } => "updated",
            ReconciliationAction::Deleted => "deleted",
            ReconciliationAction::Unchanged => "unchanged",
            ReconciliationAction::DuplicateRemoved => "duplicate_removed",
            ReconciliationAction::Errored { .. } => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub identity: String,
    #[serde(flatten)]
    pub action: ReconciliationAction,
}

/// Remote record left out of the pass (no usable identity)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Position in the remote snapshot
    pub position: usize,
    pub reason: String,
}

// ============================================================================
// ACTION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub duplicates_removed: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub run_id: String,
    pub entity: String,
    pub entries: Vec<ActionEntry>,
    pub skipped: Vec<SkippedRecord>,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ActionReport {
    fn new(entity: &str) -> Self {
        ActionReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            entries: Vec::new(),
            skipped: Vec::new(),
            reconciled_at: chrono::Utc::now(),
        }
    }

    fn push(&mut self, identity: &str, action: ReconciliationAction) {
        self.entries.push(ActionEntry {
            identity: identity.to_string(),
            action,
        });
    }

    pub fn counts(&self) -> ActionCounts {
        let mut counts = ActionCounts::default();
        for entry in &self.entries {
            match entry.action {
                ReconciliationAction::Created => counts.created += 1,
                ReconciliationAction::Updated { .. } => counts.updated += 1,
                ReconciliationAction::Deleted => counts.deleted += 1,
                ReconciliationAction::Unchanged => counts.unchanged += 1,
                ReconciliationAction::DuplicateRemoved => counts.duplicates_removed += 1,
                ReconciliationAction::Errored { .. } => counts.errored += 1,
            }
        }
        counts
    }

    /// Entries for one identity, in the order they were recorded
    pub fn actions_for(&self, identity: &str) -> Vec<&ReconciliationAction> {
        self.entries
            .iter()
            .filter(|e| e.identity == identity)
            .map(|e| &e.action)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.counts().errored > 0
    }

    /// Nothing was mutated remotely
    pub fn is_converged(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.action == ReconciliationAction::Unchanged)
    }

    pub fn summary(&self) -> String {
        let c = self.counts();
        format!(
            "{}: {} created, {} updated, {} deleted, {} unchanged, {} duplicates removed, {} errors, {} skipped",
            self.entity,
            c.created,
            c.updated,
            c.deleted,
            c.unchanged,
            c.duplicates_removed,
            c.errored,
            self.skipped.len()
        )
    }
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

// ============================================================================
// LOCAL INDEX
// ============================================================================

/// Local rows by identity; composite rows match only on the full joined key
struct LocalIndex<'a> {
    by_identity: HashMap<&'a str, &'a LocalRecord>,
    ordered: Vec<&'a LocalRecord>,
}

impl<'a> LocalIndex<'a> {
    fn build(records: &'a [LocalRecord]) -> Self {
        let mut by_identity = HashMap::new();
        let mut ordered = Vec::new();

        for record in records {
            let id = record.id.trim();
            if id.is_empty() || by_identity.contains_key(id) {
                continue;
            }
            by_identity.insert(id, record);
            ordered.push(record);
        }

        LocalIndex {
            by_identity,
            ordered,
        }
    }

    fn lookup(&self, identity: &str) -> Option<&'a LocalRecord> {
        self.by_identity.get(identity).copied()
    }
}

fn local_value<'a>(record: &'a LocalRecord, source: &LocalValue) -> &'a str {
    match source {
        LocalValue::Display => record.display_value.trim(),
        LocalValue::Extra(name) => record.extra(name).unwrap_or("").trim(),
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Tenant partition written into payloads and key expressions
    pub tenant: String,
}

impl ReconciliationEngine {
    pub fn new(tenant: &str) -> Self {
        ReconciliationEngine {
            tenant: tenant.to_string(),
        }
    }

    /// Diff `local` against `remote` and issue the mutations through `client`
    pub fn reconcile(
        &self,
        client: &dyn RemoteCatalogClient,
        descriptor: &EntityDescriptor,
        local: &[LocalRecord],
        remote: &[RemoteRecord],
    ) -> ActionReport {
        let mut report = ActionReport::new(&descriptor.name);
        let index = LocalIndex::build(local);
        let resolver = IdentityResolver::for_entity(descriptor);
        let mut seen: HashSet<String> = HashSet::new();

        for (position, record) in remote.iter().enumerate() {
            let identity = match resolver.resolve(record) {
                IdentityOutcome::Found(identity) => identity,
                IdentityOutcome::Incomplete { missing } => {
                    let err = SyncError::MissingIdentityFields(missing);
                    debug!(entity = %descriptor.name, position, "{}", err);
                    report.skipped.push(SkippedRecord {
                        position,
                        reason: err.to_string(),
                    });
                    continue;
                }
                IdentityOutcome::Missing => {
                    let err = SyncError::UnresolvableIdentity {
                        entity: descriptor.name.clone(),
                    };
                    debug!(position, "{}", err);
                    report.skipped.push(SkippedRecord {
                        position,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let key = RemoteKey::from_record(descriptor, &self.tenant, record, &identity);

            if !seen.insert(identity.clone()) {
                let action = self.remove_duplicate(client, descriptor, &identity, &key);
                report.push(&identity, action);
                continue;
            }

            let action = match index.lookup(&identity) {
                Some(counterpart) => self.compare_and_update(client, descriptor, counterpart, record, &key),
                None => self.delete_orphan(client, descriptor, &identity, &key),
            };
            report.push(&identity, action);
        }

        for record in &index.ordered {
            let identity = record.id.trim();
            if seen.contains(identity) {
                continue;
            }
            let action = self.create_missing(client, descriptor, record);
            report.push(identity, action);
        }

        info!(
            entity = %descriptor.name,
            run_id = %report.run_id,
            "{}",
            report.summary()
        );
        report
    }

    fn remove_duplicate(
        &self,
        client: &dyn RemoteCatalogClient,
        descriptor: &EntityDescriptor,
        identity: &str,
        key: &RemoteKey,
    ) -> ReconciliationAction {
        warn!(
            "{}",
            SyncError::DuplicateIdentity {
                entity: descriptor.name.clone(),
                identity: identity.to_string(),
            }
        );
        match client.delete(&descriptor.name, key) {
            Ok(()) => ReconciliationAction::DuplicateRemoved,
            Err(e) if e.is_not_found() => ReconciliationAction::DuplicateRemoved,
            Err(e) => errored(e),
        }
    }

    fn compare_and_update(
        &self,
        client: &dyn RemoteCatalogClient,
        descriptor: &EntityDescriptor,
        local: &LocalRecord,
        remote: &RemoteRecord,
        key: &RemoteKey,
    ) -> ReconciliationAction {
        let mut changes = RemoteRecord::new();
        for field in &descriptor.comparable {
            let wanted = local_value(local, &field.local);
            let current = field_text(remote, &field.remote_field).unwrap_or_default();
            if current != wanted {
                changes.insert(field.remote_field.clone(), Value::String(wanted.to_string()));
            }
        }

        if changes.is_empty() {
            return ReconciliationAction::Unchanged;
        }

        let fields: Vec<String> = changes.keys().cloned().collect();
        let payload = if descriptor.partial_update {
            changes
        } else {
            self.build_payload(descriptor, local)
        };

        match client.update(&descriptor.name, key, &payload, None) {
            Ok(_) => ReconciliationAction::Updated { fields },
            Err(e) => {
                warn!(entity = %descriptor.name, key = %key, error = %e, "update failed");
                errored(e)
            }
        }
    }

    fn delete_orphan(
        &self,
        client: &dyn RemoteCatalogClient,
        descriptor: &EntityDescriptor,
        identity: &str,
        key: &RemoteKey,
    ) -> ReconciliationAction {
        match client.delete(&descriptor.name, key) {
            Ok(()) => ReconciliationAction::Deleted,
            // Already gone remotely
            Err(e) if e.is_not_found() => {
                debug!(entity = %descriptor.name, identity, "delete target already absent");
                ReconciliationAction::Deleted
            }
            Err(e) => {
                warn!(entity = %descriptor.name, key = %key, error = %e, "delete failed");
                errored(e)
            }
        }
    }

    fn create_missing(
        &self,
        client: &dyn RemoteCatalogClient,
        descriptor: &EntityDescriptor,
        local: &LocalRecord,
    ) -> ReconciliationAction {
        let payload = self.build_payload(descriptor, local);
        match client.create(&descriptor.name, &payload) {
            Ok(_) => ReconciliationAction::Created,
            Err(e) if e.is_already_exists() => {
                debug!("{}", SyncError::AlreadyExists(local.id.trim().to_string()));
                ReconciliationAction::Unchanged
            }
            Err(e) => {
                warn!(entity = %descriptor.name, identity = %local.id, error = %e, "create failed");
                errored(e)
            }
        }
    }

    /// Create payload from the entity kind's template
    pub fn build_payload(&self, descriptor: &EntityDescriptor, local: &LocalRecord) -> RemoteRecord {
        let identity = local.id.trim();
        let mut payload = RemoteRecord::new();

        for field in &descriptor.create_template {
            let value = match &field.source {
                TemplateSource::Tenant => Some(self.tenant.clone()),
                TemplateSource::Identity => Some(identity.to_string()),
                TemplateSource::Display => Some(local.display_value.trim().to_string()),
                TemplateSource::IdentityPart(index) => match &descriptor.composite {
                    Some(composite) => composite.split(identity).get(*index).map(|p| p.to_string()),
                    None if *index == 0 => Some(identity.to_string()),
                    None => None,
                },
                TemplateSource::Extra(name) => local
                    .extra(name)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
                TemplateSource::Literal(value) => Some(value.clone()),
            };
            if let Some(value) = value {
                payload.insert(field.field.clone(), Value::String(value));
            }
        }
        payload
    }
}

fn errored(err: RemoteError) -> ReconciliationAction {
    ReconciliationAction::Errored {
        error: SyncError::RemoteCallFailure(err).to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
