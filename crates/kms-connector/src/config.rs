//! Configuration loading and validation for the KMS connector.
//!
//! All values are read from environment variables at startup. The hosting
//! process will exit with a clear error message if any required variable is
//! missing or invalid.

use anyhow::{Context, Result};
use serde::Deserialize;

/// The only discovery mode with an implementation; any other configured value
/// fails with *not-implemented* when discovery runs.
pub const DISCOVERY_MODE_FILE: &str = "file";

/// The only validation-token mode with an implementation.
pub const VALIDATION_TOKEN_MODE_FILE: &str = "file";

/// Validated connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KMS URL discovery mode; `"file"` is the only recognised value.
    #[serde(default = "default_mode")]
    pub discovery_mode: String,

    /// Path of the newline-separated KMS URL discovery file. **Required.**
    pub discovery_url_file: String,

    /// Validation-token procurement mode; `"file"` is the only recognised value.
    #[serde(default = "default_mode")]
    pub validation_token_mode: String,

    /// Token details string: `name$path` tuples separated by `,`. **Required.**
    pub validation_token_details: String,

    /// Whether lookups may ask the KMS to piggyback a fresh URL list.
    #[serde(default = "default_refresh_kms_urls")]
    pub refresh_kms_urls: bool,

    /// Minimum seconds between piggybacked URL refresh requests.
    #[serde(default = "default_refresh_kms_urls_interval_secs")]
    pub refresh_kms_urls_interval_secs: u64,

    /// Maximum size in bytes of a single validation-token file.
    #[serde(default = "default_validation_token_max_size")]
    pub validation_token_max_size: u64,

    /// Maximum combined size in bytes of all validation tokens.
    #[serde(default = "default_validation_tokens_max_payload_size")]
    pub validation_tokens_max_payload_size: u64,

    /// Maximum accepted length in bytes of a returned base cipher.
    #[serde(default = "default_max_base_cipher_len")]
    pub max_base_cipher_len: usize,

    /// Strip trailing newline bytes from token file contents.
    #[serde(default = "default_remove_trailing_newline")]
    pub remove_trailing_newline: bool,

    /// Wire version serialised into cipher-key requests.
    #[serde(default = "default_request_version")]
    pub cipher_request_version: u32,

    /// Newest cipher-family response version this process accepts.
    #[serde(default = "default_request_version")]
    pub max_cipher_request_version: u32,

    /// Wire version serialised into blob-metadata requests.
    #[serde(default = "default_request_version")]
    pub blob_metadata_request_version: u32,

    /// Newest blob-metadata response version this process accepts.
    #[serde(default = "default_request_version")]
    pub max_blob_metadata_request_version: u32,

    /// URL suffix for by-key-ids cipher lookups.
    #[serde(default = "default_get_encryption_keys_endpoint")]
    pub get_encryption_keys_endpoint: String,

    /// URL suffix for latest-by-domain cipher lookups.
    #[serde(default = "default_get_latest_encryption_keys_endpoint")]
    pub get_latest_encryption_keys_endpoint: String,

    /// URL suffix for blob-metadata lookups.
    #[serde(default = "default_get_blob_metadata_endpoint")]
    pub get_blob_metadata_endpoint: String,

    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_mode() -> String {
    DISCOVERY_MODE_FILE.into()
}
fn default_refresh_kms_urls() -> bool {
    true
}
fn default_refresh_kms_urls_interval_secs() -> u64 {
    600
}
fn default_validation_token_max_size() -> u64 {
    1024
}
fn default_validation_tokens_max_payload_size() -> u64 {
    10 * 1024
}
fn default_max_base_cipher_len() -> usize {
    96
}
fn default_remove_trailing_newline() -> bool {
    true
}
fn default_request_version() -> u32 {
    1
}
fn default_get_encryption_keys_endpoint() -> String {
    "/getEncryptionKeys".into()
}
fn default_get_latest_encryption_keys_endpoint() -> String {
    "/getLatestEncryptionKeys".into()
}
fn default_get_blob_metadata_endpoint() -> String {
    "/getBlobMetadata".into()
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be
    /// parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build connector configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise connector configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.discovery_url_file, "DISCOVERY_URL_FILE")?;
        ensure_non_empty(&self.validation_token_details, "VALIDATION_TOKEN_DETAILS")?;
        ensure_non_empty(
            &self.get_encryption_keys_endpoint,
            "GET_ENCRYPTION_KEYS_ENDPOINT",
        )?;
        ensure_non_empty(
            &self.get_latest_encryption_keys_endpoint,
            "GET_LATEST_ENCRYPTION_KEYS_ENDPOINT",
        )?;
        ensure_non_empty(&self.get_blob_metadata_endpoint, "GET_BLOB_METADATA_ENDPOINT")?;

        if self.validation_token_max_size == 0 {
            anyhow::bail!("VALIDATION_TOKEN_MAX_SIZE must be > 0");
        }
        if self.validation_tokens_max_payload_size < self.validation_token_max_size {
            anyhow::bail!(
                "VALIDATION_TOKENS_MAX_PAYLOAD_SIZE must be >= VALIDATION_TOKEN_MAX_SIZE"
            );
        }
        if self.max_base_cipher_len == 0 {
            anyhow::bail!("MAX_BASE_CIPHER_LEN must be > 0");
        }
        if self.cipher_request_version == 0 || self.blob_metadata_request_version == 0 {
            anyhow::bail!("request versions must be > 0");
        }
        if self.cipher_request_version > self.max_cipher_request_version {
            anyhow::bail!("CIPHER_REQUEST_VERSION exceeds MAX_CIPHER_REQUEST_VERSION");
        }
        if self.blob_metadata_request_version > self.max_blob_metadata_request_version {
            anyhow::bail!(
                "BLOB_METADATA_REQUEST_VERSION exceeds MAX_BLOB_METADATA_REQUEST_VERSION"
            );
        }
        if self.http_timeout_secs == 0 {
            anyhow::bail!("HTTP_TIMEOUT_SECS must be > 0");
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
impl Config {
    /// A fully-populated configuration for unit tests.
    pub(crate) fn for_tests() -> Self {
        Self {
            discovery_mode: DISCOVERY_MODE_FILE.into(),
            discovery_url_file: "/tmp/kms-urls".into(),
            validation_token_mode: VALIDATION_TOKEN_MODE_FILE.into(),
            validation_token_details: "t1$/tmp/t1".into(),
            refresh_kms_urls: true,
            refresh_kms_urls_interval_secs: default_refresh_kms_urls_interval_secs(),
            validation_token_max_size: default_validation_token_max_size(),
            validation_tokens_max_payload_size: default_validation_tokens_max_payload_size(),
            max_base_cipher_len: default_max_base_cipher_len(),
            remove_trailing_newline: true,
            cipher_request_version: 1,
            max_cipher_request_version: 1,
            blob_metadata_request_version: 1,
            max_blob_metadata_request_version: 1,
            get_encryption_keys_endpoint: default_get_encryption_keys_endpoint(),
            get_latest_encryption_keys_endpoint: default_get_latest_encryption_keys_endpoint(),
            get_blob_metadata_endpoint: default_get_blob_metadata_endpoint(),
            http_timeout_secs: default_http_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}
