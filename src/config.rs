//! Configuration loading and types for assetlift.
//!
//! Configuration is read from an optional YAML file and deserialized into
//! the [`Config`] struct, then overlaid with the environment variables the
//! uploader has always recognized (`GCP_BUCKET_NAME`, `GCP_ACCESS_TOKEN`,
//! `GCP_SERVICE_ACCOUNT_KEY`, `BACKEND_URL`, `API_KEY`, `PORT`).
//!
//! The resulting object is passed explicitly to the credential provider,
//! the object store writer and the upload endpoint at construction time.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on a single uploaded file: 10 MiB.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Default bucket used by the client when none is configured.
pub const DEFAULT_BUCKET_NAME: &str = "imges_my_custom";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Default target bucket for uploads without a `bucketName` field.
    #[serde(default)]
    pub bucket_name: Option<String>,

    /// Base URL of the upload backend, as seen by the client.
    #[serde(default = "default_backend_base_url")]
    pub backend_base_url: String,

    /// Credential sources for the object store.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Object store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload client settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Image description settings.
    #[serde(default)]
    pub ai: AiConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bucket_name: None,
            backend_base_url: default_backend_base_url(),
            credentials: CredentialsConfig::default(),
            storage: StorageConfig::default(),
            client: ClientConfig::default(),
            ai: AiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted file size in bytes. Clamped to [`MAX_UPLOAD_BYTES`].
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Effective upload limit in bytes.
    pub fn upload_limit(&self) -> u64 {
        self.max_upload_bytes.min(MAX_UPLOAD_BYTES)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Credential sources.
///
/// `access_token` wins over `service_account_key`; with neither set the
/// runtime's ambient identity is used.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Full JSON text of a service-account key.
    #[serde(default)]
    pub service_account_key: Option<String>,

    /// Pre-issued bearer token.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Reuse exchanged tokens until shortly before they expire.
    #[serde(default)]
    pub cache_tokens: bool,

    /// Metadata server token URL used for ambient credentials.
    #[serde(default = "default_metadata_token_url")]
    pub metadata_token_url: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            service_account_key: None,
            access_token: None,
            cache_tokens: false,
            metadata_token_url: default_metadata_token_url(),
        }
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `gcs` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Media upload base URL.
    #[serde(default = "default_upload_base")]
    pub upload_base: String,

    /// HTTP timeout for object writes, in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            upload_base: default_upload_base(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Upload client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Whole-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Size of the chunks fed to the request body, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Image description settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    /// API key for the inference service. Absent disables descriptions.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name.
    #[serde(default = "default_ai_model")]
    pub model: String,

    /// REST base URL of the inference service.
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_ai_model(),
            endpoint: default_ai_endpoint(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_backend_base_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_max_upload_bytes() -> u64 {
    MAX_UPLOAD_BYTES
}

fn default_request_timeout() -> u64 {
    120
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_metadata_token_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

fn default_storage_backend() -> String {
    "gcs".to_string()
}

fn default_upload_base() -> String {
    "https://storage.googleapis.com/upload/storage/v1".to_string()
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_ai_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_ai_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load configuration from the YAML file at `path` (if any) and apply
/// environment overrides from the process environment.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path.as_ref())?;
            serde_yaml::from_str(&contents)?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Overlay environment variables on `config`.
///
/// `lookup` returns the value of a variable; empty values count as unset.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(bucket) = get("GCP_BUCKET_NAME") {
        config.bucket_name = Some(bucket);
    }
    if let Some(token) = get("GCP_ACCESS_TOKEN") {
        config.credentials.access_token = Some(token);
    }
    if let Some(key) = get("GCP_SERVICE_ACCOUNT_KEY") {
        config.credentials.service_account_key = Some(key);
    }
    if let Some(url) = get("REACT_APP_BACKEND_URL").or_else(|| get("BACKEND_URL")) {
        config.backend_base_url = url;
    }
    if let Some(key) = get("API_KEY") {
        config.ai.api_key = Some(key);
    }
    if let Some(port) = get("PORT").and_then(|p| p.parse().ok()) {
        config.server.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.server.upload_limit(), MAX_UPLOAD_BYTES);
        assert_eq!(config.storage.backend, "gcs");
        assert!(config.bucket_name.is_none());
        assert!(!config.credentials.cache_tokens);
    }

    #[test]
    fn test_yaml_sections_are_optional() {
        let yaml = "bucket_name: assets\nstorage:\n  backend: memory\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bucket_name.as_deref(), Some("assets"));
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.ai.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_metadata_url_defaults_without_credentials_section() {
        let gce = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
        assert_eq!(Config::default().credentials.metadata_token_url, gce);

        let config: Config = serde_yaml::from_str("bucket_name: a").unwrap();
        assert_eq!(config.credentials.metadata_token_url, gce);

        let config: Config = serde_yaml::from_str("credentials:\n  cache_tokens: true\n").unwrap();
        assert_eq!(config.credentials.metadata_token_url, gce);
        assert!(config.credentials.cache_tokens);
    }

    #[test]
    fn test_upload_limit_is_clamped() {
        let yaml = "server:\n  max_upload_bytes: 104857600\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.upload_limit(), MAX_UPLOAD_BYTES);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("GCP_BUCKET_NAME", "assets"),
                ("GCP_ACCESS_TOKEN", "ya29.token"),
                ("GCP_SERVICE_ACCOUNT_KEY", "{}"),
                ("BACKEND_URL", "https://api.example.com"),
                ("API_KEY", "secret"),
                ("PORT", "8080"),
            ]),
        );
        assert_eq!(config.bucket_name.as_deref(), Some("assets"));
        assert_eq!(config.credentials.access_token.as_deref(), Some("ya29.token"));
        assert_eq!(config.credentials.service_account_key.as_deref(), Some("{}"));
        assert_eq!(config.backend_base_url, "https://api.example.com");
        assert_eq!(config.ai.api_key.as_deref(), Some("secret"));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_react_backend_url_wins() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("BACKEND_URL", "https://b.example.com"),
                ("REACT_APP_BACKEND_URL", "https://a.example.com"),
            ]),
        );
        assert_eq!(config.backend_base_url, "https://a.example.com");
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.bucket_name = Some("from-file".to_string());
        apply_env_overrides(&mut config, env(&[("GCP_BUCKET_NAME", "  "), ("PORT", "nope")]));
        assert_eq!(config.bucket_name.as_deref(), Some("from-file"));
        assert_eq!(config.server.port, 3001);
    }
}
