// ERP Sync - Core Library
// Reconciles authoritative catalogs into a remote ERP and ingests worker
// change events back into the system of record.

pub mod catalog;        // Entity kinds: keys, comparable fields, payload templates
pub mod classifier;     // Event Classifier - Onboarding / Modification / Termination
pub mod config;         // Settings from the environment
pub mod db;             // SQLite system of record + stores
pub mod erp_client;     // HTTP Remote Catalog Client
pub mod error;
pub mod events;         // Inbound change events
pub mod exports;        // Legacy flat-file exports
pub mod gate;           // Chronological Gate
pub mod identity;       // Identity Resolver
pub mod ingest;         // Event ingestion pipeline
pub mod ledger;         // Fingerprint ledger + event history contracts
pub mod local;          // Local Catalog Provider
pub mod logging;
pub mod mapper;         // Record Mapper
pub mod reconciliation; // Reconciliation Engine
pub mod remote;         // Remote Catalog Client contract + in-memory catalog
pub mod status;         // Outbound status reporting
pub mod sync;           // Per-entity reconciliation runs
pub mod temporal;       // Timestamps, sentinels, validity intervals
pub mod workers;        // Worker History Resolver

// Re-export commonly used types
pub use catalog::{EntityCatalog, EntityDescriptor, LocalSource};
pub use classifier::{Assignment, Classification, EventClassifier, SkipReason};
pub use config::{ClassifierOptions, ConfigError, Settings};
pub use db::{setup_database, AuditAction, AuditEntry, AuditSubject, SqliteStore};
pub use erp_client::HttpRemoteCatalog;
pub use error::{RemoteError, SyncError};
pub use events::{ChangeEvent, EventKind, SubjectKey};
pub use gate::ChronologicalGate;
pub use identity::{IdentityResolver, RemoteRecord};
pub use ingest::{EventIngestor, IngestOutcome, IngestStats};
pub use ledger::{Fingerprint, MemoryEventStore};
pub use local::{LocalCatalogProvider, LocalRecord, SqliteLocalCatalog, StaticLocalCatalog};
pub use mapper::{PersistedRecord, ProcessingOutcome, StatusPayload};
pub use reconciliation::{ActionReport, ReconciliationAction, ReconciliationEngine};
pub use remote::{InMemoryRemoteCatalog, RemoteCatalogClient, RemoteKey};
pub use status::{ReportOutcome, StatusError, StatusReporter};
pub use sync::SyncService;
pub use temporal::ValidityInterval;
pub use workers::{WorkerHistory, WorkerHistoryResolver, WorkerRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
