//! Object store credentials.
//!
//! Resolves a bearer token for Cloud Storage from, in order of precedence:
//!   - a directly supplied access token (`GCP_ACCESS_TOKEN`)
//!   - a service-account key (`GCP_SERVICE_ACCOUNT_KEY`), exchanged through
//!     the OAuth2 JWT-bearer grant
//!   - the runtime's ambient identity (GCE metadata server)
//!
//! The JWT-bearer exchange signs a one-hour assertion with the key's RSA
//! private key (RS256) and posts it to the key's `token_uri`.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CredentialsConfig;
use crate::errors::UploadError;
use crate::metrics::TOKEN_EXCHANGES_TOTAL;

/// OAuth2 scope granting object read/write.
pub const DEVSTORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Grant type for the JWT-bearer exchange.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Token endpoint used when a key omits `token_uri`.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Validity window of a signed assertion, in seconds.
pub const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Cached tokens are dropped this long before their reported expiry.
const CACHE_SAFETY_MARGIN_SECS: u64 = 60;

// -- Service-account key -----------------------------------------------------

/// A parsed service-account key file.
#[derive(Clone, Deserialize, Serialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default)]
    pub key_type: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub auth_uri: String,
    #[serde(default)]
    pub token_uri: String,
    #[serde(default)]
    pub auth_provider_x509_cert_url: String,
    #[serde(default)]
    pub client_x509_cert_url: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Parse and validate a service-account key from its JSON text.
    ///
    /// Fails with [`UploadError::Configuration`] when the text is not JSON or
    /// when `private_key` / `client_email` are missing or malformed.
    pub fn parse(json: &str) -> Result<Self, UploadError> {
        let key: ServiceAccountKey = serde_json::from_str(json).map_err(|e| {
            debug!("Service account JSON rejected: {}", e);
            UploadError::Configuration(
                "Failed to parse Service Account JSON. Please ensure it is a valid JSON file."
                    .to_string(),
            )
        })?;
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<(), UploadError> {
        if self.private_key.trim().is_empty() || self.client_email.trim().is_empty() {
            return Err(UploadError::Configuration(
                "Invalid Service Account JSON: Missing private_key or client_email.".to_string(),
            ));
        }
        let pem = self.private_key.trim();
        if !pem.starts_with("-----BEGIN") || !pem.contains("PRIVATE KEY-----") {
            return Err(UploadError::Configuration(
                "Invalid Service Account JSON: private_key is not a PEM-encoded private key."
                    .to_string(),
            ));
        }
        let email = self.client_email.trim();
        match email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(UploadError::Configuration(
                "Invalid Service Account JSON: client_email is not an email address.".to_string(),
            )),
        }
    }

    /// The token endpoint, falling back to Google's default.
    pub fn token_endpoint(&self) -> &str {
        if self.token_uri.trim().is_empty() {
            DEFAULT_TOKEN_URI
        } else {
            self.token_uri.trim()
        }
    }
}

// -- Assertion ---------------------------------------------------------------

/// Claims of the JWT-bearer assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub scope: String,
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl AssertionClaims {
    pub fn for_key(key: &ServiceAccountKey, issued_at: i64) -> Self {
        Self {
            scope: DEVSTORAGE_SCOPE.to_string(),
            iss: key.client_email.clone(),
            sub: key.client_email.clone(),
            aud: key.token_endpoint().to_string(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        }
    }
}

/// Sign a compact RS256 assertion for `key`, issued at `issued_at` (unix
/// seconds).
pub fn sign_assertion(key: &ServiceAccountKey, issued_at: i64) -> Result<String, UploadError> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| UploadError::Authentication(format!("Failed to load private key: {e}")))?;
    let claims = AssertionClaims::for_key(key, issued_at);
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| UploadError::Authentication(format!("Failed to sign assertion: {e}")))
}

// -- Tokens ------------------------------------------------------------------

/// A bearer token for the object store.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    /// Lifetime reported by the issuer. Informational unless caching is on.
    pub expires_in_seconds: u64,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_in_seconds", &self.expires_in_seconds)
            .finish()
    }
}

impl AccessToken {
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

/// Outcome of credential resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// An explicit bearer token.
    Bearer(AccessToken),
    /// Use whatever identity the runtime environment provides.
    Ambient,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchange a signed assertion for `key` at its token endpoint.
pub async fn exchange_service_account_token(
    client: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<AccessToken, UploadError> {
    let endpoint = key.token_endpoint();
    let assertion = sign_assertion(key, chrono::Utc::now().timestamp())?;

    let resp = client
        .post(endpoint)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await
        .map_err(|e| UploadError::Authentication(format!("Auth failed: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        let detail = resp
            .json::<TokenErrorResponse>()
            .await
            .unwrap_or_default()
            .error_description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| status.as_u16().to_string())
            });
        warn!(
            "Token exchange for {} rejected ({}): {}",
            key.client_email, status, detail
        );
        metrics::counter!(TOKEN_EXCHANGES_TOTAL, "outcome" => "rejected").increment(1);
        return Err(UploadError::Authentication(format!("Auth failed: {detail}")));
    }

    let token: TokenResponse = resp.json().await.map_err(|e| {
        UploadError::Authentication(format!("Auth failed: unreadable token response: {e}"))
    })?;

    metrics::counter!(TOKEN_EXCHANGES_TOTAL, "outcome" => "success").increment(1);
    debug!("Exchanged assertion for {} at {}", key.client_email, endpoint);

    Ok(AccessToken {
        value: token.access_token,
        expires_in_seconds: token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
    })
}

// -- Provider ----------------------------------------------------------------

/// Where credentials come from, fixed at construction.
#[derive(Debug, Clone)]
enum CredentialSource {
    DirectToken(String),
    ServiceAccount(ServiceAccountKey),
    /// A key was configured but failed validation; every request fails.
    Invalid(String),
    Ambient,
}

/// Cached access token with expiry.
struct CachedToken {
    identity: String,
    token: AccessToken,
    expiry: Instant,
}

/// Resolves credentials for object store writes.
pub struct CredentialProvider {
    client: reqwest::Client,
    source: CredentialSource,
    cache_tokens: bool,
    token_cache: Mutex<Option<CachedToken>>,
}

impl CredentialProvider {
    /// Build a provider from configuration.
    ///
    /// A malformed key does not fail construction: the problem is logged and
    /// surfaced as a configuration error on every token request instead.
    pub fn from_config(config: &CredentialsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &CredentialsConfig) -> Self {
        let source = if let Some(token) = config.access_token.clone() {
            info!("Using directly supplied access token");
            CredentialSource::DirectToken(token)
        } else if let Some(json) = config.service_account_key.as_deref() {
            match ServiceAccountKey::parse(json) {
                Ok(key) => {
                    info!("Using service account {}", key.client_email);
                    CredentialSource::ServiceAccount(key)
                }
                Err(e) => {
                    tracing::error!("Failed to parse GCP_SERVICE_ACCOUNT_KEY: {}", e);
                    CredentialSource::Invalid(e.to_string())
                }
            }
        } else {
            warn!(
                "GCP_SERVICE_ACCOUNT_KEY is not set. Falling back to default credentials; \
                 uploads may fail outside Google Cloud."
            );
            CredentialSource::Ambient
        };

        Self {
            client,
            source,
            cache_tokens: config.cache_tokens,
            token_cache: Mutex::new(None),
        }
    }

    /// Short label for the active credential source.
    pub fn mode(&self) -> &'static str {
        match self.source {
            CredentialSource::DirectToken(_) => "access_token",
            CredentialSource::ServiceAccount(_) => "service_account",
            CredentialSource::Invalid(_) => "invalid",
            CredentialSource::Ambient => "ambient",
        }
    }

    /// Resolve a credential for one write.
    pub async fn obtain_access_token(&self) -> Result<Credential, UploadError> {
        match &self.source {
            CredentialSource::DirectToken(token) => Ok(Credential::Bearer(AccessToken {
                value: token.clone(),
                expires_in_seconds: DEFAULT_TOKEN_LIFETIME_SECS,
            })),
            CredentialSource::Invalid(message) => {
                Err(UploadError::Configuration(message.clone()))
            }
            CredentialSource::Ambient => Ok(Credential::Ambient),
            CredentialSource::ServiceAccount(key) => {
                if let Some(token) = self.cached(&key.client_email) {
                    return Ok(Credential::Bearer(token));
                }
                let token = exchange_service_account_token(&self.client, key).await?;
                self.store(&key.client_email, &token);
                Ok(Credential::Bearer(token))
            }
        }
    }

    fn cached(&self, identity: &str) -> Option<AccessToken> {
        if !self.cache_tokens {
            return None;
        }
        let cache = self.token_cache.lock().expect("token cache mutex poisoned");
        cache
            .as_ref()
            .filter(|c| c.identity == identity && c.expiry > Instant::now())
            .map(|c| c.token.clone())
    }

    fn store(&self, identity: &str, token: &AccessToken) {
        if !self.cache_tokens {
            return;
        }
        let expiry = Instant::now()
            + Duration::from_secs(
                token
                    .expires_in_seconds
                    .saturating_sub(CACHE_SAFETY_MARGIN_SECS),
            );
        let mut cache = self.token_cache.lock().expect("token cache mutex poisoned");
        *cache = Some(CachedToken {
            identity: identity.to_string(),
            token: token.clone(),
            expiry,
        });
    }
}

// -- Ambient credentials -----------------------------------------------------

/// Fetches tokens for the runtime's own identity from the metadata server.
pub struct AmbientTokenSource {
    client: reqwest::Client,
    url: String,
}

impl AmbientTokenSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub async fn fetch(&self) -> Result<AccessToken, UploadError> {
        let resp = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                UploadError::Authentication(format!(
                    "Default credentials unavailable: {e}. Set GCP_SERVICE_ACCOUNT_KEY or GCP_ACCESS_TOKEN."
                ))
            })?;

        if !resp.status().is_success() {
            return Err(UploadError::Authentication(format!(
                "Default credentials unavailable: metadata server returned {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await.map_err(|e| {
            UploadError::Authentication(format!("Default credentials unavailable: {e}"))
        })?;

        Ok(AccessToken {
            value: token.access_token,
            expires_in_seconds: token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        })
    }

    /// Turn a resolved credential into a bearer token.
    pub async fn bearer(&self, credential: &Credential) -> Result<AccessToken, UploadError> {
        match credential {
            Credential::Bearer(token) => Ok(token.clone()),
            Credential::Ambient => self.fetch().await,
        }
    }
}

// -- Tests -------------------------------------------------------------------
