use serde::Deserialize;
use std::path::PathBuf;

use crate::models::common::Product;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub verification: VerificationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Remote verification endpoint; app receipts cannot be validated without it
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Retried once when the endpoint answers status 21007
    #[serde(default)]
    pub sandbox_endpoint_url: Option<String>,
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Key that signs the endpoint's responses (PEM or base64 DER)
    #[serde(default)]
    pub response_public_key: Option<String>,
    #[serde(default = "default_response_algorithm")]
    pub response_algorithm: String,
    #[serde(default = "default_signature_header")]
    pub response_signature_header: String,
    /// Trust anchor for locally verified signed transactions (PEM or base64 DER)
    #[serde(default)]
    pub local_public_key: Option<String>,
    #[serde(default = "default_local_algorithm")]
    pub local_algorithm: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    pub retry_attempts: u8,
    pub retry_backoff_ms: u64,
    pub change_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub products: Vec<Product>,
}

fn default_response_algorithm() -> String {
    "RS256".to_string()
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_local_algorithm() -> String {
    "ES256".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            sandbox_endpoint_url: None,
            shared_secret: None,
            response_public_key: None,
            response_algorithm: default_response_algorithm(),
            response_signature_header: default_signature_header(),
            local_public_key: None,
            local_algorithm: default_local_algorithm(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 500,
            change_buffer: 64,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("entitlements.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,owlstore=debug".to_string(),
            json: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for environment variable overrides)
        dotenvy::dotenv().ok();

        Self::load_from("config")
    }

    /// Load from an explicit file (extension picks the format), still allowing
    /// `OWLSTORE__SECTION__KEY` environment overrides
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(
                config::Environment::with_prefix("OWLSTORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
