//! Validation-token procurement and storage.
//!
//! Tokens are opaque bearer credentials this process presents to the KMS
//! inside every request body. They are read from files named by the
//! `validation_token_details` configuration string and held in memory for the
//! life of the connector; a re-procure replaces the whole generation.

use std::collections::BTreeMap;
use std::time::SystemTime;

use common::protocol::ValidationTokenEntry;
use common::ConnectorError;
use tokio::fs;
use tracing::info;

use crate::config::VALIDATION_TOKEN_MODE_FILE;
use crate::context::ConnectorContext;

/// Separates a token name from its file path within one tuple.
pub const TOKEN_NAME_FILE_SEP: char = '$';
/// Separates token tuples from each other.
pub const TOKEN_TUPLE_SEP: char = ',';

/// Where a token's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTokenSource {
    /// Read from a file on local disk.
    File,
}

/// One named bearer token.
#[derive(Clone)]
pub struct ValidationToken {
    /// Unique token name, sent to the KMS alongside the value.
    pub name: String,
    /// Opaque token value.
    pub value: String,
    /// Provenance of the value.
    pub source: ValidationTokenSource,
    /// Origin path for file-sourced tokens.
    pub file_path: Option<String>,
    /// When the value was read.
    pub read_ts: SystemTime,
}

impl std::fmt::Debug for ValidationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print token values, not even in debug builds.
        f.debug_struct("ValidationToken")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("file_path", &self.file_path)
            .finish()
    }
}

/// In-memory store of the current token generation, keyed by name.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: BTreeMap<String, ValidationToken>,
}

impl TokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens currently held.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the store holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Look up a token by name.
    pub fn get(&self, name: &str) -> Option<&ValidationToken> {
        self.tokens.get(name)
    }

    /// Insert a token, replacing any previous one with the same name.
    pub fn insert(&mut self, token: ValidationToken) {
        self.tokens.insert(token.name.clone(), token);
    }

    /// Drop every stored token.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// Wire entries for every stored token, in name order.
    pub fn entries(&self) -> Vec<ValidationTokenEntry> {
        self.tokens
            .values()
            .map(|t| ValidationTokenEntry {
                token_name: t.name.clone(),
                token_value: t.value.clone(),
            })
            .collect()
    }
}

/// Procure validation tokens according to the configured mode.
///
/// # Errors
///
/// Returns [`ConnectorError::NotImplemented`] for any mode other than
/// `"file"`, and the file-mode errors of [`procure_from_files`] otherwise.
pub async fn procure(ctx: &ConnectorContext) -> Result<(), ConnectorError> {
    match ctx.config.validation_token_mode.as_str() {
        VALIDATION_TOKEN_MODE_FILE => {
            procure_from_files(ctx, &ctx.config.validation_token_details).await
        }
        _ => Err(ConnectorError::NotImplemented("validation token mode")),
    }
}

/// Read tokens from the files named by `details` and replace the store's
/// contents with them.
///
/// `details` has the shape `name1$path1,name2$path2,…`. The existing token
/// generation is discarded before any new token lands, so the store is never
/// a mix of stale and fresh values.
///
/// # Errors
///
/// - empty `details`, or a named file that does not exist →
///   [`ConnectorError::InvalidKmsConfig`]
/// - a tuple with a name but no path → [`ConnectorError::OperationFailed`]
/// - per-token size over `validation_token_max_size` →
///   [`ConnectorError::FileTooLarge`]
/// - running total over `validation_tokens_max_payload_size` →
///   [`ConnectorError::ValueTooLarge`]
/// - a short read → [`ConnectorError::IoError`]
pub async fn procure_from_files(
    ctx: &ConnectorContext,
    details: &str,
) -> Result<(), ConnectorError> {
    if details.is_empty() {
        return Err(ConnectorError::InvalidKmsConfig(
            "validation token details string is empty".into(),
        ));
    }

    info!(uid = %ctx.uid, details, "procuring validation tokens from files");

    // First pass: parse the tuples and verify every named file exists.
    let mut token_files: BTreeMap<String, String> = BTreeMap::new();
    let mut rest = details;
    loop {
        let name = eat(&mut rest, TOKEN_NAME_FILE_SEP);
        if name.is_empty() {
            break;
        }
        let path = eat(&mut rest, TOKEN_TUPLE_SEP);
        let name = name.trim();
        let path = path.trim();
        if path.is_empty() {
            return Err(ConnectorError::OperationFailed(format!(
                "malformed validation token tuple: token {name:?} has no file path"
            )));
        }

        let exists = fs::try_exists(path).await.unwrap_or(false);
        if !exists {
            return Err(ConnectorError::InvalidKmsConfig(format!(
                "validation token file {path} for token {name} not found"
            )));
        }
        token_files.insert(name.to_owned(), path.to_owned());
    }

    // The previous generation is discarded before any fresh token lands.
    ctx.with_tokens_mut(TokenStore::clear);

    let max_size = ctx.config.validation_token_max_size;
    let max_payload = ctx.config.validation_tokens_max_payload_size;
    let mut payload_total: u64 = 0;

    for (name, path) in token_files {
        let meta = fs::metadata(&path).await.map_err(|e| map_file_error(&path, e))?;
        let size = meta.len();
        if size > max_size {
            return Err(ConnectorError::FileTooLarge {
                path,
                size,
                max: max_size,
            });
        }

        payload_total += size;
        if payload_total > max_payload {
            return Err(ConnectorError::ValueTooLarge { max: max_payload });
        }

        let buf = fs::read(&path).await.map_err(|e| map_file_error(&path, e))?;
        if buf.len() as u64 != size {
            return Err(ConnectorError::IoError(format!(
                "short read from token file {path}: expected {size} bytes, got {}",
                buf.len()
            )));
        }

        let mut value = String::from_utf8(buf).map_err(|_| {
            ConnectorError::OperationFailed(format!("token file {path} is not valid UTF-8"))
        })?;
        if ctx.config.remove_trailing_newline {
            while value.ends_with('\n') {
                value.pop();
            }
        }

        // Token values never reach the logs.
        info!(
            uid = %ctx.uid,
            token_name = %name,
            token_size = value.len(),
            token_file = %path,
            total_payload = payload_total,
            "validation token read"
        );

        ctx.with_tokens_mut(|store| {
            store.insert(ValidationToken {
                name: name.clone(),
                value,
                source: ValidationTokenSource::File,
                file_path: Some(path.clone()),
                read_ts: SystemTime::now(),
            });
        });
    }

    Ok(())
}

/// Consume `rest` up to the first `sep` (or to the end when absent) and
/// return the consumed slice without the separator.
fn eat<'a>(rest: &mut &'a str, sep: char) -> &'a str {
    match rest.find(sep) {
        Some(i) => {
            let token = &rest[..i];
            *rest = &rest[i + sep.len_utf8()..];
            token
        }
        None => {
            let token = *rest;
            *rest = "";
            token
        }
    }
}

fn map_file_error(path: &str, e: std::io::Error) -> ConnectorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ConnectorError::FileNotFound(path.to_owned())
    } else {
        ConnectorError::IoError(format!("failed to read {path}: {e}"))
    }
}
