// 🗂️ Entity Catalog - Entity kinds as data
// One declarative row per synchronizable entity kind. The reconciliation
// engine, identity resolver and local catalog consult this table instead of
// branching on entity names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Field that carries the tenant/company partition on remote rows
pub const TENANT_FIELD: &str = "dataAreaId";

/// Field that carries the remote display value
pub const DESCRIPTION_FIELD: &str = "Description";

/// Raw row id, never treated as a business identity
pub const RAW_ROW_ID_FIELD: &str = "RecId";

// ============================================================================
// DESCRIPTOR BUILDING BLOCKS
// ============================================================================

/// Composite identity: several remote fields joined by a separator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeKey {
    pub fields: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "_".to_string()
}

impl CompositeKey {
    /// Split a composite identity back into its components
    pub fn split<'a>(&self, identity: &'a str) -> Vec<&'a str> {
        identity.splitn(self.fields.len().max(1), self.separator.as_str()).collect()
    }

    pub fn join(&self, parts: &[&str]) -> String {
        parts.join(&self.separator)
    }
}

/// Where a local-side value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", content = "name", rename_all = "snake_case")]
pub enum LocalValue {
    /// LocalRecord.display_value
    Display,
    /// LocalRecord.extra_fields[name]
    Extra(String),
}

/// A remote field compared against a local value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparableField {
    pub remote_field: String,
    pub local: LocalValue,
}

/// Source of one field in a create payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", content = "value", rename_all = "snake_case")]
pub enum TemplateSource {
    /// The configured tenant partition
    Tenant,
    /// The local identity
    Identity,
    /// The local display value
    Display,
    /// One component of a composite identity, by index
    IdentityPart(usize),
    /// LocalRecord.extra_fields[name]
    Extra(String),
    /// A fixed value
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateField {
    pub field: String,
    pub source: TemplateSource,
}

/// How the local system of record supplies rows for an entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalSource {
    Companies,
    ServiceGroup { service_id: i64 },
    VacationCalendars,
    ContributionAccounts,
    WorkerPlaceExport,
    VacationBalanceExport,
}

// ============================================================================
// ENTITY DESCRIPTOR
// ============================================================================

/// EntityDescriptor - everything the engines need to know about one kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Remote entity set name (e.g. "CompanyATISAs")
    pub name: String,

    /// Human-readable label
    pub label: String,

    /// Primary identity field; also the update/delete key field
    pub key_field: String,

    /// Legacy field names tried after the primary field
    #[serde(default)]
    pub fallback_key_fields: Vec<String>,

    /// Last-resort scan for any "*id*" field
    #[serde(default)]
    pub heuristic_identity: bool,

    /// Present when the identity spans several fields
    #[serde(default)]
    pub composite: Option<CompositeKey>,

    /// Fields compared between local and remote
    #[serde(default)]
    pub comparable: Vec<ComparableField>,

    /// Create payload template
    pub create_template: Vec<TemplateField>,

    /// Participates in reconciliation runs
    #[serde(default = "default_true")]
    pub reconcile: bool,

    /// Rows are partitioned by tenant (filtered listing, tenant-qualified keys)
    #[serde(default = "default_true")]
    pub tenant_scoped: bool,

    /// Remote supports PATCH of individual fields
    #[serde(default = "default_true")]
    pub partial_update: bool,

    pub local_source: LocalSource,
}

fn default_true() -> bool {
    true
}

impl EntityDescriptor {
    /// Descriptor for a plain "id + Description" entity kind
    pub fn described(
        name: &str,
        label: &str,
        key_field: &str,
        local_source: LocalSource,
    ) -> Self {
        EntityDescriptor {
            name: name.to_string(),
            label: label.to_string(),
            key_field: key_field.to_string(),
            fallback_key_fields: legacy_fallbacks(),
            heuristic_identity: true,
            composite: None,
            comparable: vec![ComparableField {
                remote_field: DESCRIPTION_FIELD.to_string(),
                local: LocalValue::Display,
            }],
            create_template: vec![
                template(TENANT_FIELD, TemplateSource::Tenant),
                template(key_field, TemplateSource::Identity),
                template(DESCRIPTION_FIELD, TemplateSource::Display),
            ],
            reconcile: true,
            tenant_scoped: true,
            partial_update: true,
            local_source,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    /// Key fields used to address a remote row (one, or all composite parts)
    pub fn key_fields(&self) -> Vec<&str> {
        match &self.composite {
            Some(c) => c.fields.iter().map(String::as_str).collect(),
            None => vec![self.key_field.as_str()],
        }
    }

    /// Builder: add a comparable field sourced from an extra local field
    pub fn with_compared_extra(mut self, remote_field: &str, extra: &str) -> Self {
        self.comparable.push(ComparableField {
            remote_field: remote_field.to_string(),
            local: LocalValue::Extra(extra.to_string()),
        });
        self.create_template
            .push(template(remote_field, TemplateSource::Extra(extra.to_string())));
        self
    }

    /// Builder: add a create-only field
    pub fn with_template(mut self, field: &str, source: TemplateSource) -> Self {
        self.create_template.push(template(field, source));
        self
    }
}

fn template(field: &str, source: TemplateSource) -> TemplateField {
    TemplateField {
        field: field.to_string(),
        source,
    }
}

/// Field names older remote deployments used for group identities
fn legacy_fallbacks() -> Vec<String> {
    ["HolidaysAbsencesGroupId", "IncidentGroupId", "groupId"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ============================================================================
// ENTITY CATALOG
// ============================================================================

/// EntityCatalog - ordered table of all known entity kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCatalog {
    entities: Vec<EntityDescriptor>,
}

impl EntityCatalog {
    /// Built-in table for the payroll ERP
    pub fn builtin() -> Self {
        let entities = vec![
            EntityDescriptor::described(
                "CompanyATISAs",
                "Companies",
                "EQMCompanyIdATISA",
                LocalSource::Companies,
            )
            .with_compared_extra("VATNum", "tax_id")
            .with_compared_extra("QuotationAccount", "quotation_account"),
            EntityDescriptor::described(
                "WorkerPlaces",
                "Worksites",
                "EQMWorkerPlaceID",
                LocalSource::WorkerPlaceExport,
            )
            .with_template("CompanyIdAtisa", TemplateSource::Extra("company".to_string())),
            EntityDescriptor {
                name: "ContributionAccountCodeCCs".to_string(),
                label: "Contribution account codes".to_string(),
                key_field: "EQMCCC".to_string(),
                fallback_key_fields: Vec::new(),
                heuristic_identity: false,
                composite: Some(CompositeKey {
                    fields: vec!["EQMCCC".to_string(), "EQMWorkerPlaceID".to_string()],
                    separator: default_separator(),
                }),
                comparable: Vec::new(),
                create_template: vec![
                    template("EQMCCC", TemplateSource::IdentityPart(0)),
                    template("EQMWorkerPlaceID", TemplateSource::IdentityPart(1)),
                    template("VATNum", TemplateSource::Extra("tax_id".to_string())),
                ],
                reconcile: true,
                tenant_scoped: false,
                partial_update: false,
                local_source: LocalSource::ContributionAccounts,
            },
            EntityDescriptor::described(
                "HolidaysAbsencesGroupATISAs",
                "Holiday and absence groups",
                "EQMHolidaysAbsencesGroupATISAId",
                LocalSource::ServiceGroup { service_id: 30 },
            ),
            EntityDescriptor::described(
                "IncidentGroupATISAs",
                "Incident groups",
                "EQMIncidentGroupATISAId",
                LocalSource::ServiceGroup { service_id: 10 },
            ),
            EntityDescriptor::described(
                "AdvanceGroupATISAs",
                "Advance groups",
                "EQMAdvanceGroupATISAId",
                LocalSource::ServiceGroup { service_id: 20 },
            ),
            EntityDescriptor::described(
                "LibrariesGroupATISAs",
                "Library groups",
                "EQMLibrariesGroupATISAId",
                LocalSource::ServiceGroup { service_id: 80 },
            ),
            EntityDescriptor::described(
                "LeaveGroupATISAs",
                "Leave groups",
                "EQMLeaveGroupATISAId",
                LocalSource::ServiceGroup { service_id: 100 },
            ),
            EntityDescriptor::described(
                "HighsLowsChanges",
                "Hire and termination change groups",
                "EQMHighsLowsChangesID",
                LocalSource::ServiceGroup { service_id: 110 },
            ),
            EntityDescriptor::described(
                "VacationCalenders",
                "Vacation calendars",
                "EQMVacationCalenderId",
                LocalSource::VacationCalendars,
            ),
            EntityDescriptor {
                name: "VacationBalances".to_string(),
                label: "Vacation balances".to_string(),
                key_field: "EQMVacationBalanceId".to_string(),
                fallback_key_fields: Vec::new(),
                heuristic_identity: false,
                composite: None,
                comparable: Vec::new(),
                create_template: vec![
                    template(TENANT_FIELD, TemplateSource::Tenant),
                    template("EQMVacationBalanceId", TemplateSource::Identity),
                ],
                reconcile: true,
                tenant_scoped: false,
                partial_update: false,
                local_source: LocalSource::VacationBalanceExport,
            },
        ];

        EntityCatalog { entities }
    }

    /// Load the table from a JSON file (array of descriptors)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read entity catalog: {:?}", path.as_ref()))?;

        let entities: Vec<EntityDescriptor> =
            serde_json::from_str(&content).context("Failed to parse entity catalog JSON")?;

        Ok(EntityCatalog { entities })
    }

    pub fn get(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity kinds that take part in reconciliation, in table order
    pub fn reconcilable(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter().filter(|e| e.reconcile)
    }

    pub fn all(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = EntityCatalog::builtin();

        assert_eq!(catalog.len(), 11);
        assert_eq!(catalog.reconcilable().count(), 11);

        let companies = catalog.get("CompanyATISAs").unwrap();
        assert_eq!(companies.key_field, "EQMCompanyIdATISA");
        assert_eq!(companies.comparable.len(), 3);
        assert!(companies.tenant_scoped);

        let holidays = catalog.get("HolidaysAbsencesGroupATISAs").unwrap();
        assert_eq!(
            holidays.local_source,
            LocalSource::ServiceGroup { service_id: 30 }
        );

        assert!(catalog.get("Unknown").is_none());
    }

    #[test]
    fn test_composite_descriptor() {
        let catalog = EntityCatalog::builtin();
        let ccc = catalog.get("ContributionAccountCodeCCs").unwrap();

        assert!(ccc.is_composite());
        assert!(!ccc.partial_update);
        assert_eq!(ccc.key_fields(), vec!["EQMCCC", "EQMWorkerPlaceID"]);

        let key = ccc.composite.as_ref().unwrap();
        assert_eq!(key.split("123_0001A"), vec!["123", "0001A"]);
        // Separator inside the second part stays in the second part
        assert_eq!(key.split("123_00_1"), vec!["123", "00_1"]);
        assert_eq!(key.join(&["123", "0001A"]), "123_0001A");
    }

    #[test]
    fn test_catalog_json_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let catalog = EntityCatalog::builtin();
        fs::write(&path, serde_json::to_string_pretty(catalog.all()).unwrap()).unwrap();

        let loaded = EntityCatalog::from_file(&path).unwrap();
        assert_eq!(loaded.all(), catalog.all());
    }

    #[test]
    fn test_catalog_from_minimal_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            r#"[{
                "name": "IncidentGroupATISAs",
                "label": "Incidents",
                "key_field": "EQMIncidentGroupATISAId",
                "create_template": [
                    {"field": "EQMIncidentGroupATISAId", "source": {"from": "identity"}}
                ],
                "local_source": {"kind": "service_group", "service_id": 10}
            }]"#,
        )
        .unwrap();

        let catalog = EntityCatalog::from_file(&path).unwrap();
        let incidents = catalog.get("IncidentGroupATISAs").unwrap();
        assert!(incidents.reconcile);
        assert!(incidents.tenant_scoped);
        assert!(incidents.partial_update);
        assert!(incidents.fallback_key_fields.is_empty());
    }
}
