// 🛰️ ERP HTTP Client - OData transport for the Remote Catalog Client
//
// GET    /data/{Entity}?$filter=...
// POST   /data/{Entity}?company={tenant}
// PATCH  /data/{Entity}{key}?company={tenant}     (If-Match when a token is given)
// DELETE /data/{Entity}{key}?company={tenant}

use crate::config::{AuthSettings, Settings};
use crate::error::RemoteError;
use crate::identity::RemoteRecord;
use crate::remote::{RemoteCatalogClient, RemoteKey};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Refresh a cached token this long before it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Assumed lifetime when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

// ============================================================================
// TOKEN PROVIDER
// ============================================================================

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// TokenProvider - supplies the bearer credential
pub struct TokenProvider {
    auth: AuthSettings,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(auth: AuthSettings) -> Self {
        TokenProvider {
            auth,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, fetching a new one when the cached one is stale
    pub fn bearer(&self, client: &Client) -> Result<String, RemoteError> {
        match &self.auth {
            AuthSettings::Static { token } => Ok(token.clone()),
            AuthSettings::None => Err(RemoteError::Auth(
                "no ERP credential configured (set ERP_BEARER_TOKEN or ERP_TOKEN_URL)".to_string(),
            )),
            AuthSettings::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let mut cached = self
                    .cached
                    .lock()
                    .map_err(|_| RemoteError::Auth("token cache poisoned".to_string()))?;

                if let Some(current) = cached.as_ref() {
                    if Instant::now() + TOKEN_EXPIRY_MARGIN < current.expires_at {
                        return Ok(current.token.clone());
                    }
                }

                let fresh = Self::fetch(client, token_url, client_id, client_secret, scope.as_deref())?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(token)
            }
        }
    }

    fn fetch(
        client: &Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<CachedToken, RemoteError> {
        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.to_string()),
            ("client_secret", client_secret.to_string()),
        ];
        if let Some(scope) = scope {
            // v1 endpoints take `resource`, v2 endpoints take `scope`
            let name = if scope.contains("/.default") { "scope" } else { "resource" };
            params.push((name, scope.to_string()));
        }

        info!(token_url, "Requesting ERP access token");
        let response = client
            .post(token_url)
            .form(&params)
            .send()
            .map_err(|e| RemoteError::Auth(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| RemoteError::Auth(format!("invalid token response: {}", e)))?;
        if !status.is_success() {
            return Err(RemoteError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Auth("access_token missing from response".to_string()))?;

        // Some endpoints send expires_in as a string
        let lifetime = match body.get("expires_in") {
            Some(Value::Number(n)) => n.as_u64().map(Duration::from_secs),
            Some(Value::String(s)) => s.parse::<u64>().ok().map(Duration::from_secs),
            _ => None,
        }
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        Ok(CachedToken {
            token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

// ============================================================================
// HTTP REMOTE CATALOG
// ============================================================================

pub struct HttpRemoteCatalog {
    base_url: String,
    tenant: String,
    client: Client,
    tokens: TokenProvider,
}

impl HttpRemoteCatalog {
    pub fn new(base_url: &str, tenant: &str, auth: AuthSettings, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpRemoteCatalog {
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant: tenant.to_string(),
            client,
            tokens: TokenProvider::new(auth),
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_api_base_url()?;
        Ok(Self::new(
            base_url,
            &settings.tenant,
            settings.auth.clone(),
            settings.http_timeout,
        )?)
    }

    fn entity_url(&self, entity: &str) -> String {
        format!("{}/data/{}", self.base_url, entity)
    }

    fn keyed_url(&self, entity: &str, key: &RemoteKey) -> String {
        format!(
            "{}{}?company={}",
            self.entity_url(entity),
            key.to_odata(),
            urlencoding::encode(&self.tenant)
        )
    }

    /// Absolute URLs are used as-is; relative ones hang off the base URL
    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        let token = self.tokens.bearer(&self.client)?;
        Ok(builder
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json"))
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(RemoteError::from_response(status.as_u16(), body))
    }

    /// PATCH/POST may answer 204 with no body
    fn record_body(response: Response) -> Result<RemoteRecord, RemoteError> {
        let text = response
            .text()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(RemoteRecord::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Ok(RemoteRecord::new()),
            Err(e) => Err(RemoteError::Transport(format!("invalid JSON body: {}", e))),
        }
    }

    fn patch(&self, url: &str, payload: &RemoteRecord, token: Option<&str>) -> Result<RemoteRecord, RemoteError> {
        info!(method = "PATCH", url, "ERP request");
        let mut builder = self.authorized(self.client.patch(url))?.json(payload);
        if let Some(token) = token {
            builder = builder.header(header::IF_MATCH, token);
        }
        let response = self.send(builder)?;
        Self::record_body(response)
    }
}

impl RemoteCatalogClient for HttpRemoteCatalog {
    fn list(&self, entity: &str, filter: Option<&str>) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = match filter {
            Some(f) => format!("{}?$filter={}", self.entity_url(entity), urlencoding::encode(f)),
            None => self.entity_url(entity),
        };
        info!(method = "GET", url = %url, "ERP request");

        let response = self.send(self.authorized(self.client.get(&url))?)?;
        let body: Value = response
            .json()
            .map_err(|e| RemoteError::Transport(format!("invalid listing for {}: {}", entity, e)))?;

        // OData wraps rows in `value`
        let rows = match body.get("value") {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(|r| r.as_object().cloned())
                .collect(),
            _ => {
                warn!(entity, "Listing without a value array, treating as empty");
                Vec::new()
            }
        };
        debug!(entity, count = rows.len(), "Listed remote rows");
        Ok(rows)
    }

    fn create(&self, entity: &str, payload: &RemoteRecord) -> Result<RemoteRecord, RemoteError> {
        let url = format!(
            "{}?company={}",
            self.entity_url(entity),
            urlencoding::encode(&self.tenant)
        );
        info!(method = "POST", url = %url, "ERP request");

        let builder = self.authorized(self.client.post(&url))?.json(payload);
        let response = self.send(builder)?;
        Self::record_body(response)
    }

    fn update(
        &self,
        entity: &str,
        key: &RemoteKey,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError> {
        let url = self.keyed_url(entity, key);
        self.patch(&url, payload, concurrency_token)
    }

    fn update_by_url(
        &self,
        url: &str,
        payload: &RemoteRecord,
        concurrency_token: Option<&str>,
    ) -> Result<RemoteRecord, RemoteError> {
        let url = self.resolve_url(url);
        self.patch(&url, payload, concurrency_token)
    }

    fn delete(&self, entity: &str, key: &RemoteKey) -> Result<(), RemoteError> {
        let url = self.keyed_url(entity, key);
        info!(method = "DELETE", url = %url, "ERP request");

        self.send(self.authorized(self.client.delete(&url))?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> HttpRemoteCatalog {
        HttpRemoteCatalog::new(
            "https://erp.example.com/",
            "itb",
            AuthSettings::Static {
                token: "t".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_url_building() {
        let erp = catalog();

        assert_eq!(
            erp.keyed_url("IncidentGroupATISAs", &RemoteKey::single("EQMIncidentGroupATISAId", "I01").scoped("itb")),
            "https://erp.example.com/data/IncidentGroupATISAs(dataAreaId='itb',EQMIncidentGroupATISAId='I01')?company=itb"
        );
        assert_eq!(
            erp.resolve_url("https://other.example.com/data/X(RecId=1)"),
            "https://other.example.com/data/X(RecId=1)"
        );
        assert_eq!(
            erp.resolve_url("/data/X(RecId=1)"),
            "https://erp.example.com/data/X(RecId=1)"
        );
    }

    #[test]
    fn test_static_and_missing_credentials() {
        let client = Client::new();

        let provider = TokenProvider::new(AuthSettings::Static {
            token: "abc".to_string(),
        });
        assert_eq!(provider.bearer(&client).unwrap(), "abc");

        let provider = TokenProvider::new(AuthSettings::None);
        assert!(matches!(provider.bearer(&client), Err(RemoteError::Auth(_))));
    }
}
