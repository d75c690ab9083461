// ⚙️ Settings - Resolved once at startup, passed into constructors
//
// Fail-fast: a missing or malformed variable is a ConfigError before any
// engine runs. Nothing here is cached globally.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors raised while reading the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

// ============================================================================
// SECTIONS
// ============================================================================

/// How the bearer credential for the ERP is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSettings {
    /// Pre-issued token, used as-is
    Static { token: String },
    /// Client-credentials grant against a token endpoint
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
    /// No credential configured; remote calls will fail with Auth
    None,
}

/// Switches for the event classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierOptions {
    /// The event's tax id is a required identity field
    pub require_tax_id: bool,
    /// Fast-path termination and tax-id drift branches are active
    pub detect_terminations: bool,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        ClassifierOptions {
            require_tax_id: false,
            detect_terminations: true,
        }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    /// ERP root, e.g. `https://erp.example.com` (required for remote work)
    pub api_base_url: Option<String>,
    /// Tenant/company partition (`dataAreaId`)
    pub tenant: String,
    pub auth: AuthSettings,
    pub db_path: PathBuf,
    pub export_dir: PathBuf,
    /// Optional JSON file overriding the built-in entity table
    pub entity_catalog: Option<PathBuf>,
    pub classifier: ClassifierOptions,
    pub log_level: String,
    pub http_timeout: Duration,
    pub server_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_base_url: None,
            tenant: "itb".to_string(),
            auth: AuthSettings::None,
            db_path: PathBuf::from("erp_sync.db"),
            export_dir: PathBuf::from("exports"),
            entity_catalog: None,
            classifier: ClassifierOptions::default(),
            log_level: "info".to_string(),
            http_timeout: Duration::from_secs(60),
            server_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Settings {
    /// Load from process environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is present but malformed, or when
    /// client-credentials auth is partially configured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load through an arbitrary lookup (tests pass a map)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let auth = match get("ERP_BEARER_TOKEN") {
            Some(token) => AuthSettings::Static { token },
            None => match get("ERP_TOKEN_URL") {
                Some(token_url) => AuthSettings::ClientCredentials {
                    token_url,
                    client_id: get("ERP_CLIENT_ID")
                        .ok_or_else(|| ConfigError::MissingVar("ERP_CLIENT_ID".to_string()))?,
                    client_secret: get("ERP_CLIENT_SECRET")
                        .ok_or_else(|| ConfigError::MissingVar("ERP_CLIENT_SECRET".to_string()))?,
                    scope: get("ERP_SCOPE"),
                },
                None => AuthSettings::None,
            },
        };

        let http_timeout = match get("SYNC_HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue {
                    var: "SYNC_HTTP_TIMEOUT_SECS".to_string(),
                    message: e.to_string(),
                }
            })?),
            None => defaults.http_timeout,
        };

        Ok(Settings {
            api_base_url: get("ERP_API_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            tenant: get("ERP_TENANT").unwrap_or(defaults.tenant),
            auth,
            db_path: get("SYNC_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            export_dir: get("SYNC_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            entity_catalog: get("SYNC_ENTITY_CATALOG").map(PathBuf::from),
            classifier: ClassifierOptions {
                require_tax_id: parse_bool(
                    "SYNC_REQUIRE_TAX_ID",
                    get("SYNC_REQUIRE_TAX_ID"),
                    defaults.classifier.require_tax_id,
                )?,
                detect_terminations: parse_bool(
                    "SYNC_DETECT_TERMINATIONS",
                    get("SYNC_DETECT_TERMINATIONS"),
                    defaults.classifier.detect_terminations,
                )?,
            },
            log_level: get("SYNC_LOG_LEVEL").unwrap_or(defaults.log_level),
            http_timeout,
            server_addr: get("SYNC_SERVER_ADDR").unwrap_or(defaults.server_addr),
        })
    }

    /// Base URL, or an error naming the variable to set
    pub fn require_api_base_url(&self) -> Result<&str, ConfigError> {
        self.api_base_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("ERP_API_BASE_URL".to_string()))
    }
}

fn parse_bool(var: &str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
