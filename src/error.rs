// ⚠️ Error taxonomy - per-item outcomes vs fatal run failures
//
// Only SourceReadFailure and Config abort a run. Everything else is
// captured per item into a report and never interrupts sibling items.

use crate::config::ConfigError;
use thiserror::Error;

// ============================================================================
// SYNC ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    /// Event lacks one or more identity fields (company, names, tax id)
    #[error("missing identity fields: {}", .0.join(", "))]
    MissingIdentityFields(Vec<String>),

    /// Remote record has no resolvable business identity
    #[error("unresolvable identity in {entity} record")]
    UnresolvableIdentity { entity: String },

    /// A create/update/delete call against the remote ERP failed
    #[error("remote call failed: {0}")]
    RemoteCallFailure(#[from] RemoteError),

    /// Two remote records claim the same business identity
    #[error("duplicate identity {identity} in {entity}")]
    DuplicateIdentity { entity: String, identity: String },

    /// Create rejected because the identity is already present remotely
    #[error("identity {0} already exists remotely")]
    AlreadyExists(String),

    /// Fingerprint already admitted
    #[error("fingerprint {0} already admitted")]
    DuplicateFingerprint(String),

    /// Event timestamp outside the active record's validity interval
    #[error("event outside the active assignment interval")]
    OutOfTemporalRange,

    /// Event is not newer than the worker's last termination
    #[error("event predates the last known termination")]
    StaleRequest,

    /// Event is not newer than the last admitted event of the same kind
    #[error("event is out of chronological order")]
    OutOfChronologicalOrder,

    /// A date/timestamp could not be parsed
    #[error("cannot parse date '{value}': {reason}")]
    DateParseFailure { value: String, reason: String },

    /// An entire source collection could not be read (fatal for the run)
    #[error("failed to read {source_name}: {message}")]
    SourceReadFailure { source_name: String, message: String },

    /// Entity kind not present in the catalog
    #[error("unknown entity kind: {0}")]
    UnknownEntity(String),

    /// Configuration is missing or invalid (fatal at startup)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Wrap any error as a fatal source read failure
    pub fn source_read(source_name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::SourceReadFailure {
            source_name: source_name.into(),
            message: format!("{:#}", err),
        }
    }

    /// Whether this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SourceReadFailure { .. }
                | SyncError::UnknownEntity(_)
                | SyncError::Config(_)
        )
    }
}

// ============================================================================
// REMOTE ERROR
// ============================================================================

/// Failure reported by the Remote Catalog Client
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Addressed row does not exist remotely
    #[error("not found: {0}")]
    NotFound(String),

    /// Create rejected: a row with the same key exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency token no longer matches
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Any other non-success HTTP response
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS, or decoding failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Bearer credential could not be obtained
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Markers the ERP uses in error bodies for rows that are already gone
const NOT_FOUND_MARKERS: [&str; 2] = ["No HTTP resource was found", "No route data was found"];

/// Markers the ERP uses in error bodies for duplicate creates
const ALREADY_EXISTS_MARKERS: [&str; 2] = ["already exists", "ya existe"];

impl RemoteError {
    /// Classify a non-success HTTP response into a typed error
    pub fn from_response(status: u16, body: String) -> Self {
        if status == 404 || NOT_FOUND_MARKERS.iter().any(|m| body.contains(m)) {
            return RemoteError::NotFound(body);
        }
        if ALREADY_EXISTS_MARKERS.iter().any(|m| body.contains(m)) {
            return RemoteError::AlreadyExists(body);
        }
        if status == 412 {
            return RemoteError::PreconditionFailed(body);
        }
        RemoteError::Http { status, body }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, RemoteError::AlreadyExists(_))
    }
}
