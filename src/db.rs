// 🗄️ System of Record - SQLite schema, queries and the event store
//
// One database holds the payroll reference data (companies, groups,
// calendars, workers), the admitted worker events with their ledger, the
// remote mirror and the audit trail.

use crate::error::SyncError;
use crate::events::{EventKind, SubjectKey};
use crate::identity::RemoteRecord;
use crate::ledger::{EventHistory, Fingerprint, FingerprintLedger, LedgerEntry, PersistenceBoundary};
use crate::mapper::PersistedRecord;
use crate::workers::{WorkerHistory, WorkerHistoryResolver, WorkerRecord};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Fixed-width so that text order is chronological order
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_stored_timestamp(idx: usize, raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_PARSE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<NaiveDateTime>> {
    raw.map(|s| {
        NaiveDateTime::parse_from_str(&s, TIMESTAMP_PARSE_FORMAT)
            .with_context(|| format!("Invalid stored timestamp: {}", s))
    })
    .transpose()
}

// ============================================================================
// AUDIT LOG
// ============================================================================

/// What happened to an audited subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EntityReconciled,
    WorkerEventAdmitted,
    WorkerEventReported,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::EntityReconciled => "entity_reconciled",
            AuditAction::WorkerEventAdmitted => "worker_event_admitted",
            AuditAction::WorkerEventReported => "worker_event_reported",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entity_reconciled" => Some(AuditAction::EntityReconciled),
            "worker_event_admitted" => Some(AuditAction::WorkerEventAdmitted),
            "worker_event_reported" => Some(AuditAction::WorkerEventReported),
            _ => None,
        }
    }
}

/// Either an entity kind reconciled by a run or one persisted worker event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    Entity(String),
    Record(i64),
}

/// One audit log row; `id` is assigned on insert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub subject: AuditSubject,
    /// Reconciliation run that produced the row, if any
    pub run_id: Option<String>,
    pub recorded_at: NaiveDateTime,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn reconciled(entity: &str, run_id: &str, detail: serde_json::Value) -> Self {
        Self::new(AuditAction::EntityReconciled, AuditSubject::Entity(entity.to_string()), Some(run_id), detail)
    }

    pub fn for_record(action: AuditAction, record_id: i64, detail: serde_json::Value) -> Self {
        Self::new(action, AuditSubject::Record(record_id), None, detail)
    }

    fn new(
        action: AuditAction,
        subject: AuditSubject,
        run_id: Option<&str>,
        detail: serde_json::Value,
    ) -> Self {
        AuditEntry {
            id: 0,
            action,
            subject,
            run_id: run_id.map(str::to_string),
            recorded_at: Utc::now().naive_utc(),
            detail,
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Payroll reference data (read by the local catalog)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS companies (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tax_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contribution_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company TEXT NOT NULL,
            ccc TEXT NOT NULL,
            account_type TEXT NOT NULL DEFAULT 'Principal'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_groups (
            service_id INTEGER NOT NULL,
            group_id TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (service_id, group_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS vacation_calendars (
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            year INTEGER NOT NULL,
            PRIMARY KEY (code, year)
        )",
        [],
    )?;

    // ==========================================================================
    // Worker assignment history (written by payroll, read-only here)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_key TEXT NOT NULL,
            company TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name1 TEXT NOT NULL,
            last_name2 TEXT NOT NULL DEFAULT '',
            start_date TEXT NOT NULL,
            end_date TEXT,
            phone TEXT,
            insurance_number TEXT,
            tax_id TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Admitted worker events + fingerprint ledger
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS persisted_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            worker_key TEXT NOT NULL,
            company TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name1 TEXT NOT NULL,
            last_name2 TEXT NOT NULL DEFAULT '',
            tax_id TEXT,
            gender TEXT,
            insurance_number TEXT,
            birth_date TEXT,
            email TEXT,
            phone TEXT,
            zip_code TEXT,
            start_date TEXT,
            salary TEXT,
            bank_account TEXT,
            holiday_group INTEGER,
            library_group INTEGER,
            advance_group INTEGER,
            street TEXT,
            city TEXT,
            county TEXT,
            nationality INTEGER,
            job_position TEXT,
            contract_type TEXT,
            seniority_date TEXT,
            contract_end_date TEXT,
            contract_reason TEXT,
            personnel_number TEXT,
            fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL,
            remote_url TEXT,
            processed INTEGER NOT NULL DEFAULT 0,
            persisted_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT UNIQUE NOT NULL,
            subject_id INTEGER NOT NULL REFERENCES persisted_records(id),
            created_at TEXT NOT NULL,
            personnel_number TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Remote mirror (write-through cache, replaced after each reconciliation)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mirror_records (
            entity TEXT NOT NULL,
            position INTEGER NOT NULL,
            payload TEXT NOT NULL,
            refreshed_at TEXT NOT NULL,
            PRIMARY KEY (entity, position)
        )",
        [],
    )?;

    // ==========================================================================
    // Audit Log (exactly one of entity / record_id is set)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            entity TEXT,
            record_id INTEGER REFERENCES persisted_records(id),
            run_id TEXT,
            recorded_at TEXT NOT NULL,
            detail TEXT NOT NULL,
            CHECK ((entity IS NULL) <> (record_id IS NULL))
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workers_identity
         ON workers(company, first_name, last_name1, last_name2)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workers_nass ON workers(company, insurance_number)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_subject
         ON persisted_records(company, first_name, last_name1, last_name2, kind)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity, id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_log(record_id, id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// REFERENCE DATA
// ============================================================================

/// Company row with its main quotation account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyRow {
    pub code: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub quotation_account: Option<String>,
}

pub fn insert_company(conn: &Connection, code: &str, name: &str, tax_id: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO companies (code, name, tax_id) VALUES (?1, ?2, ?3)",
        params![code, name, tax_id],
    )?;
    Ok(())
}

pub fn insert_contribution_account(
    conn: &Connection,
    company: &str,
    ccc: &str,
    account_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO contribution_accounts (company, ccc, account_type) VALUES (?1, ?2, ?3)",
        params![company, ccc, account_type],
    )?;
    Ok(())
}

pub fn insert_service_group(conn: &Connection, service_id: i64, group_id: &str, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO service_groups (service_id, group_id, name) VALUES (?1, ?2, ?3)",
        params![service_id, group_id, name],
    )?;
    Ok(())
}

pub fn insert_vacation_calendar(conn: &Connection, code: &str, name: &str, year: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vacation_calendars (code, name, year) VALUES (?1, ?2, ?3)",
        params![code, name, year],
    )?;
    Ok(())
}

pub fn list_companies(conn: &Connection) -> Result<Vec<CompanyRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.code, c.name, c.tax_id,
                (SELECT MAX(a.ccc) FROM contribution_accounts a
                 WHERE a.company = c.code AND a.account_type = 'Principal')
         FROM companies c
         ORDER BY c.code",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(CompanyRow {
                code: row.get(0)?,
                name: row.get(1)?,
                tax_id: row.get(2)?,
                quotation_account: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// (group id, name) pairs of one payroll service, ordered by id
pub fn list_service_groups(conn: &Connection, service_id: i64) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, name FROM service_groups WHERE service_id = ?1 ORDER BY group_id",
    )?;
    let rows = stmt
        .query_map(params![service_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// (code, name) pairs of the calendars defined for `year`
pub fn list_vacation_calendars(conn: &Connection, year: i32) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT code, name FROM vacation_calendars WHERE year = ?1 ORDER BY code",
    )?;
    let rows = stmt
        .query_map(params![year], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One contribution account per company: the main one when present, else the highest
pub fn list_company_accounts(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT company,
                COALESCE(MAX(CASE WHEN account_type = 'Principal' THEN ccc END), MAX(ccc))
         FROM contribution_accounts
         GROUP BY company
         ORDER BY company",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// WORKERS
// ============================================================================

const WORKER_COLUMNS: &str = "worker_key, company, first_name, last_name1, last_name2,
    start_date, end_date, phone, insurance_number, tax_id";

pub fn insert_worker(conn: &Connection, worker: &WorkerRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO workers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            WORKER_COLUMNS
        ),
        params![
            worker.worker_key,
            worker.company,
            worker.first_name,
            worker.last_name1,
            worker.last_name2,
            worker.start_date,
            worker.end_date,
            worker.phone,
            worker.insurance_number,
            worker.tax_id,
        ],
    )?;
    Ok(())
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<WorkerRecord> {
    Ok(WorkerRecord {
        worker_key: row.get(0)?,
        company: row.get(1)?,
        first_name: row.get(2)?,
        last_name1: row.get(3)?,
        last_name2: row.get(4)?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        phone: row.get(7)?,
        insurance_number: row.get(8)?,
        tax_id: row.get(9)?,
    })
}

fn query_workers(
    conn: &Connection,
    condition: &str,
    values: &[&dyn rusqlite::ToSql],
) -> Result<Option<WorkerHistory>> {
    let sql = format!(
        "SELECT {} FROM workers WHERE {} ORDER BY start_date DESC",
        WORKER_COLUMNS, condition
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(values, worker_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read worker history")?;
    Ok(WorkerHistory::from_records(records))
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

const RECORD_COLUMNS: &str = "id, kind, worker_key, company, first_name, last_name1, last_name2,
    tax_id, gender, insurance_number, birth_date, email, phone, zip_code, start_date,
    salary, bank_account, holiday_group, library_group, advance_group,
    street, city, county, nationality, job_position, contract_type, seniority_date,
    contract_end_date, contract_reason, personnel_number, fingerprint, created_at,
    remote_url, processed";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedRecord> {
    let kind_raw: String = row.get(1)?;
    let kind = EventKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown event kind '{}'", kind_raw).into(),
        )
    })?;
    let created_raw: String = row.get(31)?;

    Ok(PersistedRecord {
        id: row.get(0)?,
        kind,
        worker_key: row.get(2)?,
        subject: SubjectKey {
            company: row.get(3)?,
            first_name: row.get(4)?,
            last_name1: row.get(5)?,
            last_name2: row.get(6)?,
        },
        tax_id: row.get(7)?,
        gender: row.get(8)?,
        insurance_number: row.get(9)?,
        birth_date: row.get(10)?,
        email: row.get(11)?,
        phone: row.get(12)?,
        zip_code: row.get(13)?,
        start_date: row.get(14)?,
        salary: row.get(15)?,
        bank_account: row.get(16)?,
        holiday_group: row.get(17)?,
        library_group: row.get(18)?,
        advance_group: row.get(19)?,
        street: row.get(20)?,
        city: row.get(21)?,
        county: row.get(22)?,
        nationality: row.get(23)?,
        job_position: row.get(24)?,
        contract_type: row.get(25)?,
        seniority_date: row.get(26)?,
        contract_end_date: row.get(27)?,
        contract_reason: row.get(28)?,
        personnel_number: row.get(29)?,
        fingerprint: Fingerprint::from_encoded(row.get::<_, String>(30)?),
        created_at: parse_stored_timestamp(31, &created_raw)?,
        remote_url: row.get(32)?,
        processed: row.get(33)?,
    })
}

fn insert_record(conn: &Connection, record: &PersistedRecord) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO persisted_records (
            kind, worker_key, company, first_name, last_name1, last_name2,
            tax_id, gender, insurance_number, birth_date, email, phone, zip_code, start_date,
            salary, bank_account, holiday_group, library_group, advance_group,
            street, city, county, nationality, job_position, contract_type, seniority_date,
            contract_end_date, contract_reason, personnel_number, fingerprint, created_at,
            remote_url, processed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                  ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33)",
        params![
            record.kind.as_str(),
            record.worker_key,
            record.subject.company,
            record.subject.first_name,
            record.subject.last_name1,
            record.subject.last_name2,
            record.tax_id,
            record.gender,
            record.insurance_number,
            record.birth_date,
            record.email,
            record.phone,
            record.zip_code,
            record.start_date,
            record.salary,
            record.bank_account,
            record.holiday_group,
            record.library_group,
            record.advance_group,
            record.street,
            record.city,
            record.county,
            record.nationality,
            record.job_position,
            record.contract_type,
            record.seniority_date,
            record.contract_end_date,
            record.contract_reason,
            record.personnel_number,
            record.fingerprint.as_str(),
            format_timestamp(&record.created_at),
            record.remote_url,
            record.processed,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_ledger_entry(conn: &Connection, entry: &LedgerEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ledger (fingerprint, subject_id, created_at, personnel_number)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.fingerprint.as_str(),
            entry.subject_id,
            format_timestamp(&entry.created_at),
            entry.personnel_number,
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub fn get_persisted_record(conn: &Connection, id: i64) -> Result<Option<PersistedRecord>> {
    let sql = format!("SELECT {} FROM persisted_records WHERE id = ?1", RECORD_COLUMNS);
    conn.query_row(&sql, params![id], record_from_row)
        .optional()
        .with_context(|| format!("Failed to load persisted record {}", id))
}

pub fn list_persisted_records(conn: &Connection) -> Result<Vec<PersistedRecord>> {
    let sql = format!("SELECT {} FROM persisted_records ORDER BY id", RECORD_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Flag a record as finalized downstream; false when it does not exist
pub fn mark_processed(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE persisted_records SET processed = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(changed > 0)
}

pub fn list_ledger_entries(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, subject_id, created_at, personnel_number FROM ledger ORDER BY id",
    )?;
    let entries = stmt
        .query_map([], |row| {
            let created_raw: String = row.get(2)?;
            Ok(LedgerEntry {
                fingerprint: Fingerprint::from_encoded(row.get::<_, String>(0)?),
                subject_id: row.get(1)?,
                created_at: parse_stored_timestamp(2, &created_raw)?,
                personnel_number: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SqliteStore - worker history, ledger, watermarks and persistence over one connection
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteStore { conn }
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

impl WorkerHistoryResolver for SqliteStore<'_> {
    fn find_by_identity(&self, subject: &SubjectKey) -> Result<Option<WorkerHistory>> {
        query_workers(
            self.conn,
            "company = ?1 AND first_name = ?2 AND last_name1 = ?3 AND last_name2 = ?4",
            &[
                &subject.company,
                &subject.first_name,
                &subject.last_name1,
                &subject.last_name2,
            ],
        )
    }

    fn find_by_insurance_number(&self, company: &str, insurance_number: &str) -> Result<Option<WorkerHistory>> {
        query_workers(
            self.conn,
            "company = ?1 AND TRIM(insurance_number) = ?2",
            &[&company, &insurance_number.trim()],
        )
    }

    fn find_by_tax_id(&self, company: &str, tax_id: &str) -> Result<Option<WorkerHistory>> {
        query_workers(
            self.conn,
            "company = ?1 AND UPPER(TRIM(tax_id)) = ?2",
            &[&company, &tax_id.trim().to_uppercase()],
        )
    }
}

impl FingerprintLedger for SqliteStore<'_> {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM ledger WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record(&self, fingerprint: &Fingerprint, subject_id: i64, admitted_at: NaiveDateTime) -> Result<()> {
        let entry = LedgerEntry {
            fingerprint: fingerprint.clone(),
            subject_id,
            created_at: admitted_at,
            personnel_number: None,
        };
        match insert_ledger_entry(self.conn, &entry) {
            Ok(()) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(SyncError::DuplicateFingerprint(fingerprint.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl EventHistory for SqliteStore<'_> {
    fn last_admitted_at(
        &self,
        subject: &SubjectKey,
        kind: EventKind,
        worker_key: Option<&str>,
    ) -> Result<Option<NaiveDateTime>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM persisted_records
             WHERE company = ?1 AND first_name = ?2 AND last_name1 = ?3 AND last_name2 = ?4
               AND kind = ?5 AND (?6 IS NULL OR worker_key = ?6)",
            params![
                subject.company,
                subject.first_name,
                subject.last_name1,
                subject.last_name2,
                kind.as_str(),
                worker_key,
            ],
            |row| row.get(0),
        )?;
        parse_optional_timestamp(latest)
    }

    fn last_finalized_at(&self, subject: &SubjectKey, kind: EventKind) -> Result<Option<NaiveDateTime>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM persisted_records
             WHERE company = ?1 AND first_name = ?2 AND last_name1 = ?3 AND last_name2 = ?4
               AND kind = ?5 AND processed = 1",
            params![
                subject.company,
                subject.first_name,
                subject.last_name1,
                subject.last_name2,
                kind.as_str(),
            ],
            |row| row.get(0),
        )?;
        parse_optional_timestamp(latest)
    }
}

impl PersistenceBoundary for SqliteStore<'_> {
    fn persist_admitted(&self, record: &PersistedRecord) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        let subject_id = insert_record(&tx, record).context("Failed to insert persisted record")?;
        let entry = LedgerEntry {
            fingerprint: record.fingerprint.clone(),
            subject_id,
            created_at: record.created_at,
            personnel_number: record.personnel_number.clone(),
        };
        match insert_ledger_entry(&tx, &entry) {
            Ok(()) => {}
            // Dropping the transaction rolls back the record insert
            Err(e) if is_constraint_violation(&e) => {
                return Err(SyncError::DuplicateFingerprint(record.fingerprint.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        }

        record_audit(
            &tx,
            &AuditEntry::for_record(
                AuditAction::WorkerEventAdmitted,
                subject_id,
                serde_json::json!({
                    "kind": record.kind.as_str(),
                    "worker_key": record.worker_key,
                    "created_at": format_timestamp(&record.created_at),
                }),
            ),
        )?;

        tx.commit()?;
        Ok(subject_id)
    }
}

// ============================================================================
// REMOTE MIRROR
// ============================================================================

/// Replace every mirrored row of `entity` in one transaction
pub fn replace_mirror(conn: &Connection, entity: &str, records: &[RemoteRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM mirror_records WHERE entity = ?1", params![entity])?;

    let refreshed_at = Utc::now().to_rfc3339();
    for (position, record) in records.iter().enumerate() {
        let payload = serde_json::to_string(record)?;
        tx.execute(
            "INSERT INTO mirror_records (entity, position, payload, refreshed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entity, position as i64, payload, refreshed_at],
        )?;
    }

    tx.commit()?;
    Ok(records.len())
}

pub fn load_mirror(conn: &Connection, entity: &str) -> Result<Vec<RemoteRecord>> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM mirror_records WHERE entity = ?1 ORDER BY position",
    )?;
    let payloads = stmt
        .query_map(params![entity], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    payloads
        .iter()
        .map(|p| serde_json::from_str(p).context("Corrupt mirror payload"))
        .collect()
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Append `entry` to the audit log and return its row id
pub fn record_audit(conn: &Connection, entry: &AuditEntry) -> Result<i64> {
    let (entity, record_id) = match &entry.subject {
        AuditSubject::Entity(name) => (Some(name.as_str()), None),
        AuditSubject::Record(id) => (None, Some(*id)),
    };

    conn.execute(
        "INSERT INTO audit_log (action, entity, record_id, run_id, recorded_at, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.action.as_str(),
            entity,
            record_id,
            entry.run_id,
            format_timestamp(&entry.recorded_at),
            serde_json::to_string(&entry.detail)?,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

const AUDIT_COLUMNS: &str = "id, action, entity, record_id, run_id, recorded_at, detail";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action: String = row.get(1)?;
    let entity: Option<String> = row.get(2)?;
    let record_id: Option<i64> = row.get(3)?;
    let recorded_at: String = row.get(5)?;
    let detail: String = row.get(6)?;

    let subject = match (entity, record_id) {
        (Some(name), _) => AuditSubject::Entity(name),
        (None, Some(id)) => AuditSubject::Record(id),
        (None, None) => return Err(rusqlite::Error::InvalidColumnType(2, "entity".into(), Type::Null)),
    };

    Ok(AuditEntry {
        id: row.get(0)?,
        action: AuditAction::parse(&action).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown audit action: {}", action).into(),
            )
        })?,
        subject,
        run_id: row.get(4)?,
        recorded_at: parse_stored_timestamp(5, &recorded_at)?,
        detail: serde_json::from_str(&detail)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
    })
}

/// Audit rows about `subject`, newest first
pub fn audit_trail(conn: &Connection, subject: &AuditSubject) -> Result<Vec<AuditEntry>> {
    let (filter, value): (&str, rusqlite::types::Value) = match subject {
        AuditSubject::Entity(name) => ("entity", name.clone().into()),
        AuditSubject::Record(id) => ("record_id", (*id).into()),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM audit_log WHERE {} = ?1 ORDER BY id DESC",
        AUDIT_COLUMNS, filter
    ))?;
    let entries = stmt
        .query_map(params![value], audit_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Audit rows written by one reconciliation run, in insertion order
pub fn audit_for_run(conn: &Connection, run_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM audit_log WHERE run_id = ?1 ORDER BY id",
        AUDIT_COLUMNS
    ))?;
    let entries = stmt
        .query_map(params![run_id], audit_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Row count of a known table
pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    const TABLES: [&str; 9] = [
        "companies",
        "contribution_accounts",
        "service_groups",
        "vacation_calendars",
        "workers",
        "persisted_records",
        "ledger",
        "mirror_records",
        "audit_log",
    ];
    if !TABLES.contains(&table) {
        anyhow::bail!("Unknown table: {}", table);
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeEvent;
    use crate::mapper::to_persisted;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn record(etag: &str, created: &str, kind: EventKind, worker_key: &str) -> PersistedRecord {
        let payload = json!({
            "@odata.etag": etag,
            "CreatedDate": created,
            "CompanyIdATISA": "0042",
            "FirstName": "Ana",
            "LastName1": "Ruiz",
            "PersonnelNumber": "E-1",
            "Salary": "1500,5",
            "HolidaysAbsencesGroupATISAId": "30",
        });
        let event = ChangeEvent::from_remote(payload.as_object().cloned().unwrap()).unwrap();
        to_persisted(&event, kind, worker_key, None)
    }

    #[test]
    fn test_persist_writes_record_and_ledger_together() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let admitted = record("W/\"1\"", "2024-06-01T08:00:00Z", EventKind::Modification, "77");

        let id = store.persist_admitted(&admitted).unwrap();
        assert!(store.exists(&admitted.fingerprint).unwrap());

        let loaded = get_persisted_record(&conn, id).unwrap().unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.kind, EventKind::Modification);
        assert_eq!(loaded.salary.as_deref(), Some("1500.5"));
        assert_eq!(loaded.holiday_group, Some(30));
        assert_eq!(loaded.created_at, admitted.created_at);

        let ledger = list_ledger_entries(&conn).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].subject_id, id);
        assert_eq!(ledger[0].personnel_number.as_deref(), Some("E-1"));
    }

    #[test]
    fn test_duplicate_fingerprint_rolls_back() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let admitted = record("W/\"1\"", "2024-06-01", EventKind::Onboarding, "0");

        store.persist_admitted(&admitted).unwrap();
        let err = store.persist_admitted(&admitted).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::DuplicateFingerprint(_))
        ));

        assert_eq!(count_rows(&conn, "persisted_records").unwrap(), 1);
        assert_eq!(count_rows(&conn, "ledger").unwrap(), 1);
    }

    #[test]
    fn test_watermarks() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let subject = SubjectKey::new("0042", "Ana", "Ruiz", "");

        store
            .persist_admitted(&record("W/\"1\"", "2024-06-10", EventKind::Modification, "77"))
            .unwrap();
        store
            .persist_admitted(&record("W/\"2\"", "2024-06-03", EventKind::Modification, "78"))
            .unwrap();
        let onboarding = store
            .persist_admitted(&record("W/\"3\"", "2024-05-01", EventKind::Onboarding, "0"))
            .unwrap();

        let day = |d: u32| {
            chrono::NaiveDate::from_ymd_opt(2024, 6, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        assert_eq!(
            store.last_admitted_at(&subject, EventKind::Modification, None).unwrap(),
            Some(day(10))
        );
        assert_eq!(
            store.last_admitted_at(&subject, EventKind::Modification, Some("78")).unwrap(),
            Some(day(3))
        );
        assert_eq!(
            store.last_admitted_at(&subject, EventKind::Termination, None).unwrap(),
            None
        );

        assert_eq!(store.last_finalized_at(&subject, EventKind::Onboarding).unwrap(), None);
        assert!(mark_processed(&conn, onboarding).unwrap());
        assert!(store.last_finalized_at(&subject, EventKind::Onboarding).unwrap().is_some());
        assert!(!mark_processed(&conn, 999).unwrap());
    }

    #[test]
    fn test_worker_lookups() {
        let conn = setup();
        let worker = |key: &str, start: &str, end: Option<&str>| WorkerRecord {
            worker_key: key.to_string(),
            company: "0042".to_string(),
            first_name: "Ana".to_string(),
            last_name1: "Ruiz".to_string(),
            last_name2: "".to_string(),
            start_date: start.to_string(),
            end_date: end.map(str::to_string),
            phone: None,
            insurance_number: Some("281234567890".to_string()),
            tax_id: Some("12345678z".to_string()),
        };
        insert_worker(&conn, &worker("10", "2020-01-01", Some("2021-01-01"))).unwrap();
        insert_worker(&conn, &worker("11", "2022-01-01", None)).unwrap();

        let store = SqliteStore::new(&conn);
        let history = store
            .find_by_identity(&SubjectKey::new("0042", "Ana", "Ruiz", ""))
            .unwrap()
            .unwrap();
        assert_eq!(history.all_records.len(), 2);
        assert_eq!(history.active_record.unwrap().worker_key, "11");

        assert!(store.find_by_insurance_number("0042", " 281234567890 ").unwrap().is_some());
        assert!(store.find_by_tax_id("0042", "12345678Z").unwrap().is_some());
        assert!(store.find_by_tax_id("0099", "12345678Z").unwrap().is_none());
    }

    #[test]
    fn test_reference_queries() {
        let conn = setup();
        insert_company(&conn, "0042", "ACME", Some("B12345678")).unwrap();
        insert_company(&conn, "0043", "Globex", None).unwrap();
        insert_contribution_account(&conn, "0042", "28111111111", "Principal").unwrap();
        insert_contribution_account(&conn, "0042", "28999999999", "Secundaria").unwrap();
        insert_contribution_account(&conn, "0043", "08222222222", "Secundaria").unwrap();

        let companies = list_companies(&conn).unwrap();
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].quotation_account.as_deref(), Some("28111111111"));
        assert_eq!(companies[1].quotation_account, None);

        let accounts = list_company_accounts(&conn).unwrap();
        assert_eq!(
            accounts,
            vec![
                ("0042".to_string(), "28111111111".to_string()),
                ("0043".to_string(), "08222222222".to_string()),
            ]
        );
    }

    #[test]
    fn test_mirror_is_replaced() {
        let conn = setup();
        let rows = |ids: &[&str]| -> Vec<RemoteRecord> {
            ids.iter()
                .map(|id| json!({"EQMWorkerPlaceID": id}).as_object().cloned().unwrap())
                .collect()
        };

        replace_mirror(&conn, "WorkerPlaces", &rows(&["A", "B"])).unwrap();
        replace_mirror(&conn, "WorkerPlaces", &rows(&["C"])).unwrap();
        replace_mirror(&conn, "VacationCalenders", &rows(&["X"])).unwrap();

        let mirrored = load_mirror(&conn, "WorkerPlaces").unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0]["EQMWorkerPlaceID"], "C");
        assert_eq!(count_rows(&conn, "mirror_records").unwrap(), 2);
    }

    #[test]
    fn test_audit_trail_by_entity_and_run() {
        let conn = setup();

        let first = record_audit(
            &conn,
            &AuditEntry::reconciled("WorkerPlaces", "run-1", json!({"created": 1})),
        )
        .unwrap();
        let second = record_audit(
            &conn,
            &AuditEntry::reconciled("WorkerPlaces", "run-2", json!({"created": 0})),
        )
        .unwrap();
        record_audit(&conn, &AuditEntry::reconciled("Companies", "run-2", json!({}))).unwrap();

        let trail = audit_trail(&conn, &AuditSubject::Entity("WorkerPlaces".to_string())).unwrap();
        assert_eq!(trail.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(trail[1].action, AuditAction::EntityReconciled);
        assert_eq!(trail[1].run_id.as_deref(), Some("run-1"));
        assert_eq!(trail[1].detail["created"], 1);

        let run = audit_for_run(&conn, "run-2").unwrap();
        assert_eq!(run.len(), 2);
        assert_eq!(run[1].subject, AuditSubject::Entity("Companies".to_string()));
    }

    #[test]
    fn test_admitted_event_is_audited_against_its_record() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let id = store
            .persist_admitted(&record("W/\"9\"", "2024-06-01T08:00:00Z", EventKind::Onboarding, "0"))
            .unwrap();

        let trail = audit_trail(&conn, &AuditSubject::Record(id)).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::WorkerEventAdmitted);
        assert_eq!(trail[0].run_id, None);
        assert_eq!(trail[0].detail["kind"], "onboarding");
        assert!(audit_trail(&conn, &AuditSubject::Entity(id.to_string())).unwrap().is_empty());
    }
}
