// 🏢 Local Catalog - Authoritative rows from the system of record
//
// Relational sources: companies, service groups, vacation calendars,
// contribution accounts. Flat-file exports: worker places, vacation
// balances. Export rows are only kept for companies the database knows.

use crate::catalog::{EntityDescriptor, LocalSource};
use crate::db;
use crate::error::SyncError;
use crate::exports;
use chrono::{Datelike, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

// ============================================================================
// LOCAL RECORD
// ============================================================================

/// One authoritative row, rebuilt on every reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub display_value: String,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
}

impl LocalRecord {
    pub fn new(id: impl Into<String>, display_value: impl Into<String>) -> Self {
        LocalRecord {
            id: id.into(),
            display_value: display_value.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Builder: attach an extra field
    pub fn with_extra(mut self, name: &str, value: impl Into<String>) -> Self {
        self.extra_fields.insert(name.to_string(), value.into());
        self
    }

    pub fn extra(&self, name: &str) -> Option<&str> {
        self.extra_fields.get(name).map(String::as_str)
    }
}

pub trait LocalCatalogProvider {
    /// Full authoritative dataset for one entity kind; any read failure is fatal
    fn list(&self, descriptor: &EntityDescriptor) -> Result<Vec<LocalRecord>, SyncError>;
}

// ============================================================================
// SQLITE + EXPORTS
// ============================================================================

pub struct SqliteLocalCatalog<'a> {
    conn: &'a Connection,
    export_dir: PathBuf,
    calendar_year: i32,
}

impl<'a> SqliteLocalCatalog<'a> {
    pub fn new(conn: &'a Connection, export_dir: impl AsRef<Path>) -> Self {
        SqliteLocalCatalog {
            conn,
            export_dir: export_dir.as_ref().to_path_buf(),
            calendar_year: Utc::now().year(),
        }
    }

    /// Override the calendar year used for vacation calendars
    pub fn with_calendar_year(mut self, year: i32) -> Self {
        self.calendar_year = year;
        self
    }

    /// Company code -> tax id, for every company the database knows
    fn known_companies(&self) -> Result<HashMap<String, Option<String>>, SyncError> {
        let companies =
            db::list_companies(self.conn).map_err(|e| SyncError::source_read("companies", e))?;
        Ok(companies.into_iter().map(|c| (c.code, c.tax_id)).collect())
    }

    fn companies(&self) -> Result<Vec<LocalRecord>, SyncError> {
        let companies =
            db::list_companies(self.conn).map_err(|e| SyncError::source_read("companies", e))?;

        Ok(companies
            .into_iter()
            .map(|c| {
                LocalRecord::new(c.code, c.name)
                    .with_extra("tax_id", c.tax_id.unwrap_or_default())
                    .with_extra("quotation_account", c.quotation_account.unwrap_or_default())
            })
            .collect())
    }

    fn service_groups(&self, service_id: i64) -> Result<Vec<LocalRecord>, SyncError> {
        let groups = db::list_service_groups(self.conn, service_id)
            .map_err(|e| SyncError::source_read(format!("service group {}", service_id), e))?;
        Ok(groups.into_iter().map(|(id, name)| LocalRecord::new(id, name)).collect())
    }

    fn vacation_calendars(&self) -> Result<Vec<LocalRecord>, SyncError> {
        let calendars = db::list_vacation_calendars(self.conn, self.calendar_year)
            .map_err(|e| SyncError::source_read("vacation calendars", e))?;
        Ok(calendars.into_iter().map(|(code, name)| LocalRecord::new(code, name)).collect())
    }

    fn worker_places(&self) -> Result<Vec<LocalRecord>, SyncError> {
        let known = self.known_companies()?;
        let rows = exports::read_worker_places(&self.export_dir)
            .map_err(|e| SyncError::source_read(exports::WORKER_PLACE_EXPORT, e))?;

        Ok(rows
            .into_iter()
            .filter(|r| known.contains_key(r.company.trim()))
            .map(|r| {
                LocalRecord::new(r.worker_place_id(), r.description())
                    .with_extra("company", r.company.trim())
            })
            .collect())
    }

    /// Company account x worker places of that company
    fn contribution_accounts(&self) -> Result<Vec<LocalRecord>, SyncError> {
        let known = self.known_companies()?;
        let accounts = db::list_company_accounts(self.conn)
            .map_err(|e| SyncError::source_read("contribution accounts", e))?;
        let rows = exports::read_worker_places(&self.export_dir)
            .map_err(|e| SyncError::source_read(exports::WORKER_PLACE_EXPORT, e))?;

        let ccc_by_company: HashMap<String, String> = accounts
            .into_iter()
            .filter(|(_, ccc)| !ccc.trim().is_empty())
            .collect();

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for row in rows {
            let company = row.company.trim();
            let (Some(tax_id), Some(ccc)) = (known.get(company), ccc_by_company.get(company)) else {
                continue;
            };
            let worker_place = row.worker_place_id();
            let id = format!("{}_{}", ccc.trim(), worker_place);
            if !seen.insert(id.clone()) {
                continue;
            }
            records.push(
                LocalRecord::new(id, format!("CCC {} for {}", ccc.trim(), worker_place))
                    .with_extra("tax_id", tax_id.clone().unwrap_or_default()),
            );
        }
        Ok(records)
    }

    fn vacation_balances(&self) -> Result<Vec<LocalRecord>, SyncError> {
        let known = self.known_companies()?;
        let rows = exports::read_vacation_balances(&self.export_dir)
            .map_err(|e| SyncError::source_read(exports::VACATION_BALANCE_EXPORT, e))?;

        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|r| known.contains_key(r.company.trim()))
            .map(|r| r.identifier())
            .filter(|id| seen.insert(id.clone()))
            .map(|id| LocalRecord::new(id.clone(), id))
            .collect())
    }
}

impl LocalCatalogProvider for SqliteLocalCatalog<'_> {
    fn list(&self, descriptor: &EntityDescriptor) -> Result<Vec<LocalRecord>, SyncError> {
        match &descriptor.local_source {
            LocalSource::Companies => self.companies(),
            LocalSource::ServiceGroup { service_id } => self.service_groups(*service_id),
            LocalSource::VacationCalendars => self.vacation_calendars(),
            LocalSource::ContributionAccounts => self.contribution_accounts(),
            LocalSource::WorkerPlaceExport => self.worker_places(),
            LocalSource::VacationBalanceExport => self.vacation_balances(),
        }
    }
}

// ============================================================================
// STATIC CATALOG
// ============================================================================

/// StaticLocalCatalog - fixed rows per entity name (dry runs, tests)
#[derive(Debug, Clone, Default)]
pub struct StaticLocalCatalog {
    rows: HashMap<String, Vec<LocalRecord>>,
}

impl StaticLocalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, entity: &str, rows: Vec<LocalRecord>) -> Self {
        self.rows.insert(entity.to_string(), rows);
        self
    }
}

impl LocalCatalogProvider for StaticLocalCatalog {
    fn list(&self, descriptor: &EntityDescriptor) -> Result<Vec<LocalRecord>, SyncError> {
        self.rows
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| SyncError::source_read(&descriptor.name, "no local rows configured"))
    }
}
