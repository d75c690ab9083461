// ERP Sync - CLI
// One command per operation; every run reads Settings from the environment.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erp_sync::logging::init_logging;
use erp_sync::{
    setup_database, ActionReport, EntityCatalog, EventClassifier, EventIngestor,
    HttpRemoteCatalog, ProcessingOutcome, ReconciliationAction, ReportOutcome, Settings, SqliteLocalCatalog,
    SqliteStore, StatusReporter, SyncService,
};
use rusqlite::Connection;

#[derive(Parser)]
#[command(name = "erp-sync", version, about = "Catalog reconciliation and worker event ingestion")]
struct Cli {
    /// Print reports as JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the system-of-record tables
    InitDb,
    /// List known entity kinds
    Entities,
    /// Reconcile one entity kind into the ERP
    SyncEntity { name: String },
    /// Reconcile every entity kind
    SyncAll,
    /// Pull worker change events from the ERP and persist admitted ones
    IngestEvents {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report a persisted event back to the ERP as processed
    ReportStatus {
        id: i64,
        /// Report a failure with this detail instead of success
        #[arg(long)]
        error: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;
    init_logging(&settings.log_level);

    match cli.command {
        Command::InitDb => {
            open_database(&settings)?;
            println!("✓ Database initialized at {:?}", settings.db_path);
        }
        Command::Entities => {
            let catalog = load_catalog(&settings)?;
            for entity in catalog.all() {
                println!(
                    "{:<30} {:<35} {}{}",
                    entity.name,
                    entity.key_field,
                    entity.label,
                    if entity.reconcile { "" } else { " (not reconciled)" }
                );
            }
        }
        Command::SyncEntity { name } => {
            let conn = open_database(&settings)?;
            let catalog = load_catalog(&settings)?;
            let client = HttpRemoteCatalog::from_settings(&settings)?;
            let local = SqliteLocalCatalog::new(&conn, &settings.export_dir);
            let service = SyncService::new(&conn, &catalog, &local, &client, &settings.tenant);

            let report = service.sync_entity(&name)?;
            print_reports(&[report], cli.json)?;
        }
        Command::SyncAll => {
            let conn = open_database(&settings)?;
            let catalog = load_catalog(&settings)?;
            let client = HttpRemoteCatalog::from_settings(&settings)?;
            let local = SqliteLocalCatalog::new(&conn, &settings.export_dir);
            let service = SyncService::new(&conn, &catalog, &local, &client, &settings.tenant);

            let reports = service.sync_all()?;
            print_reports(&reports, cli.json)?;
        }
        Command::IngestEvents { limit } => {
            let conn = open_database(&settings)?;
            let client = HttpRemoteCatalog::from_settings(&settings)?;
            let ingestor = EventIngestor::new(EventClassifier::new(settings.classifier));

            let stats = ingestor.sync_remote(&client, limit, &SqliteStore::new(&conn))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", stats.summary());
            }
        }
        Command::ReportStatus { id, error } => {
            let conn = open_database(&settings)?;
            let client = HttpRemoteCatalog::from_settings(&settings)?;
            let outcome = match error {
                Some(detail) => ProcessingOutcome::Failure { detail },
                None => ProcessingOutcome::Success,
            };

            match StatusReporter::new(&client, &settings.tenant).report(&conn, id, &outcome)? {
                ReportOutcome::Reported { id } => println!("✓ Record {} reported", id),
                ReportOutcome::Skipped { id, reason } => println!("⏭ Record {} skipped: {}", id, reason),
            }
        }
    }

    Ok(())
}

fn open_database(settings: &Settings) -> Result<Connection> {
    let conn = Connection::open(&settings.db_path)
        .with_context(|| format!("Failed to open database {:?}", settings.db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn load_catalog(settings: &Settings) -> Result<EntityCatalog> {
    match &settings.entity_catalog {
        Some(path) => EntityCatalog::from_file(path),
        None => Ok(EntityCatalog::builtin()),
    }
}

fn print_reports(reports: &[ActionReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for report in reports {
        let marker = if report.has_errors() { "⚠" } else { "✓" };
        println!("{} {}", marker, report);
        for entry in report.entries.iter().filter(|e| matches!(e.action, ReconciliationAction::Errored { .. })) {
            println!("    {} {:?}", entry.identity, entry.action);
        }
    }
    Ok(())
}
