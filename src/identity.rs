// 🔑 Identity Resolver - Business identity of a remote record
//
// Ordered list of strategies tried in sequence. Each one answers
// found / not found; the first hit wins. Adding a fallback means adding a
// strategy, not another branch.

use crate::catalog::{CompositeKey, EntityDescriptor, RAW_ROW_ID_FIELD, TENANT_FIELD};
use serde_json::{Map, Value};

/// Raw remote row as returned by the Remote Catalog Client
pub type RemoteRecord = Map<String, Value>;

// ============================================================================
// FIELD ACCESS
// ============================================================================

/// Render a scalar field as trimmed text; null, blank and nested values are absent
pub fn field_text(record: &RemoteRecord, field: &str) -> Option<String> {
    let text = match record.get(field)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// A single named field
    Field(String),
    /// All components present, joined by the separator
    Composite(CompositeKey),
    /// First field whose name contains "id" (case-insensitive), excluding
    /// the raw row id, the tenant field and OData annotations
    IdLikeField,
}

impl IdentityStrategy {
    pub fn resolve(&self, record: &RemoteRecord) -> Option<String> {
        match self {
            IdentityStrategy::Field(name) => field_text(record, name),
            IdentityStrategy::Composite(key) => {
                let parts: Option<Vec<String>> =
                    key.fields.iter().map(|f| field_text(record, f)).collect();
                parts.map(|p| p.join(&key.separator))
            }
            IdentityStrategy::IdLikeField => record
                .keys()
                .filter(|k| is_id_like(k))
                .find_map(|k| field_text(record, k)),
        }
    }
}

fn is_id_like(name: &str) -> bool {
    !name.starts_with('@')
        && name != RAW_ROW_ID_FIELD
        && name != TENANT_FIELD
        && name.to_lowercase().contains("id")
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Outcome with enough detail for the engine to tell a broken composite
/// apart from a record with no identity at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    Found(String),
    /// Composite identity with some required components missing
    Incomplete { missing: Vec<String> },
    Missing,
}

/// IdentityResolver - strategies for one entity kind, in priority order
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    strategies: Vec<IdentityStrategy>,
    composite: Option<CompositeKey>,
}

impl IdentityResolver {
    pub fn for_entity(descriptor: &EntityDescriptor) -> Self {
        let mut strategies = Vec::new();

        if let Some(key) = &descriptor.composite {
            strategies.push(IdentityStrategy::Composite(key.clone()));
        } else {
            strategies.push(IdentityStrategy::Field(descriptor.key_field.clone()));
            for fallback in &descriptor.fallback_key_fields {
                strategies.push(IdentityStrategy::Field(fallback.clone()));
            }
            if descriptor.heuristic_identity {
                strategies.push(IdentityStrategy::IdLikeField);
            }
        }

        IdentityResolver {
            strategies,
            composite: descriptor.composite.clone(),
        }
    }

    pub fn with_strategies(strategies: Vec<IdentityStrategy>) -> Self {
        IdentityResolver {
            strategies,
            composite: None,
        }
    }

    /// Total and deterministic: never fails, returns None when unresolvable
    pub fn extract(&self, record: &RemoteRecord) -> Option<String> {
        self.strategies.iter().find_map(|s| s.resolve(record))
    }

    pub fn resolve(&self, record: &RemoteRecord) -> IdentityOutcome {
        if let Some(identity) = self.extract(record) {
            return IdentityOutcome::Found(identity);
        }
        match &self.composite {
            Some(key) => {
                let missing: Vec<String> = key
                    .fields
                    .iter()
                    .filter(|f| field_text(record, f).is_none())
                    .cloned()
                    .collect();
                if missing.len() == key.fields.len() {
                    IdentityOutcome::Missing
                } else {
                    IdentityOutcome::Incomplete { missing }
                }
            }
            None => IdentityOutcome::Missing,
        }
    }
}

/// Convenience wrapper: `extractIdentity(remoteRecord, entityKind)`
pub fn extract_identity(record: &RemoteRecord, descriptor: &EntityDescriptor) -> Option<String> {
    IdentityResolver::for_entity(descriptor).extract(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityCatalog;
    use serde_json::json;

    fn record(value: Value) -> RemoteRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_primary_field() {
        let catalog = EntityCatalog::builtin();
        let companies = catalog.get("CompanyATISAs").unwrap();

        let r = record(json!({"dataAreaId": "itb", "EQMCompanyIdATISA": " 0042 ", "RecId": 7}));
        assert_eq!(extract_identity(&r, companies).as_deref(), Some("0042"));
    }

    #[test]
    fn test_fallback_chain() {
        let catalog = EntityCatalog::builtin();
        let holidays = catalog.get("HolidaysAbsencesGroupATISAs").unwrap();

        let legacy = record(json!({"HolidaysAbsencesGroupId": "H1", "groupId": "G1"}));
        assert_eq!(extract_identity(&legacy, holidays).as_deref(), Some("H1"));

        let blank_primary = record(json!({"EQMHolidaysAbsencesGroupATISAId": "  ", "groupId": "G1"}));
        assert_eq!(extract_identity(&blank_primary, holidays).as_deref(), Some("G1"));

        // Heuristic skips RecId, dataAreaId and annotations
        let heuristic = record(json!({
            "@odata.etag": "W/\"1\"",
            "RecId": 99,
            "dataAreaId": "itb",
            "SomeGroupID": "S1"
        }));
        assert_eq!(extract_identity(&heuristic, holidays).as_deref(), Some("S1"));

        let nothing = record(json!({"RecId": 99, "Description": "x"}));
        assert_eq!(extract_identity(&nothing, holidays), None);
    }

    #[test]
    fn test_composite_identity() {
        let catalog = EntityCatalog::builtin();
        let ccc = catalog.get("ContributionAccountCodeCCs").unwrap();
        let resolver = IdentityResolver::for_entity(ccc);

        let full = record(json!({"EQMCCC": "281234", "EQMWorkerPlaceID": "0001A"}));
        assert_eq!(
            resolver.resolve(&full),
            IdentityOutcome::Found("281234_0001A".to_string())
        );

        let partial = record(json!({"EQMCCC": "281234", "EQMWorkerPlaceID": null}));
        assert_eq!(
            resolver.resolve(&partial),
            IdentityOutcome::Incomplete {
                missing: vec!["EQMWorkerPlaceID".to_string()]
            }
        );

        // Composite kinds never fall back to the heuristic scan
        let unrelated = record(json!({"OtherId": "x"}));
        assert_eq!(resolver.resolve(&unrelated), IdentityOutcome::Missing);
    }

    #[test]
    fn test_numeric_identity_rendered_as_text() {
        let resolver =
            IdentityResolver::with_strategies(vec![IdentityStrategy::Field("Key".to_string())]);
        assert_eq!(resolver.extract(&record(json!({"Key": 15}))).as_deref(), Some("15"));
    }
}
