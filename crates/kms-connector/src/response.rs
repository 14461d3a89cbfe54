//! KMS response parsing and validation.
//!
//! Responses are validated by hand over `serde_json::Value` so failures carry
//! a structured [`SchemaViolation`] instead of a deserialiser string. Checks
//! run in a fixed order: wire version, explicit KMS error object, then the
//! family's detail array. A well-formed `kms_urls` section re-seeds the
//! endpoint pool as a side effect; once the primary details have been
//! extracted, a malformed `kms_urls` section is logged and swallowed.

use std::time::{SystemTime, UNIX_EPOCH};

use common::protocol::{
    BlobMetadataDetails, BlobMetadataLocation, CipherKeyDetails, BASE_CIPHER_ID_TAG,
    BASE_CIPHER_TAG, BLOB_METADATA_DETAILS_TAG, BLOB_METADATA_DOMAIN_ID_TAG,
    BLOB_METADATA_LOCATIONS_TAG, BLOB_METADATA_LOCATION_ID_TAG, BLOB_METADATA_LOCATION_PATH_TAG,
    CIPHER_KEY_DETAILS_TAG, ENCRYPT_DOMAIN_ID_TAG, ERROR_CODE_TAG, ERROR_MSG_TAG, ERROR_TAG,
    EXPIRE_AFTER_SEC_TAG, INVALID_REQUEST_VERSION, KMS_URLS_TAG, REFRESH_AFTER_SEC_TAG,
    REQUEST_VERSION_TAG,
};
use common::{ConnectorError, SchemaViolation};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::ConnectorContext;
use crate::discovery::{drop_cached_urls, normalize_url};
use crate::pool::KmsEndpoint;

/// Parse and validate a cipher-key response body.
///
/// # Errors
///
/// Returns [`ConnectorError::MalformedResponse`] on any schema or version
/// violation, [`ConnectorError::KeysFetchFailed`] when the KMS reports an
/// explicit error, and [`ConnectorError::MaxBaseCipherLen`] when a returned
/// cipher exceeds the configured bound.
pub fn parse_cipher_response(
    ctx: &ConnectorContext,
    body: &str,
) -> Result<Vec<CipherKeyDetails>, ConnectorError> {
    let doc = parse_document(body)?;
    check_version(ctx, &doc, ctx.config.max_cipher_request_version)?;
    check_error_object(ctx, &doc)?;

    let details = doc
        .get(CIPHER_KEY_DETAILS_TAG)
        .ok_or(SchemaViolation::MissingField(CIPHER_KEY_DETAILS_TAG))?
        .as_array()
        .ok_or(SchemaViolation::WrongType {
            field: CIPHER_KEY_DETAILS_TAG,
            expected: "array",
        })?;

    let mut result = Vec::with_capacity(details.len());
    for detail in details {
        let detail = detail.as_object().ok_or(SchemaViolation::WrongType {
            field: CIPHER_KEY_DETAILS_TAG,
            expected: "object",
        })?;

        let base_cipher_id = require(detail, BASE_CIPHER_ID_TAG)?
            .as_u64()
            .ok_or(SchemaViolation::WrongType {
                field: BASE_CIPHER_ID_TAG,
                expected: "unsigned integer",
            })?;
        let encrypt_domain_id = require(detail, ENCRYPT_DOMAIN_ID_TAG)?
            .as_i64()
            .ok_or(SchemaViolation::WrongType {
                field: ENCRYPT_DOMAIN_ID_TAG,
                expected: "integer",
            })?;
        let base_cipher = require(detail, BASE_CIPHER_TAG)?
            .as_str()
            .ok_or(SchemaViolation::WrongType {
                field: BASE_CIPHER_TAG,
                expected: "string",
            })?
            .as_bytes()
            .to_vec();

        // The KCV is persisted downstream in encryption headers; digest
        // generation only accepts bounded key buffers.
        let max_len = ctx.config.max_base_cipher_len;
        if base_cipher.len() > max_len {
            warn!(
                uid = %ctx.uid,
                base_cipher_id,
                len = base_cipher.len(),
                max = max_len,
                "KMS returned base cipher over the allowed length"
            );
            return Err(ConnectorError::MaxBaseCipherLen {
                len: base_cipher.len(),
                max: max_len,
            });
        }
        let base_cipher_kcv = ctx.compute_kcv(&base_cipher);

        let refresh_after_sec = detail
            .get(REFRESH_AFTER_SEC_TAG)
            .and_then(Value::as_i64)
            .filter(|v| *v > 0);
        let expire_after_sec = detail.get(EXPIRE_AFTER_SEC_TAG).and_then(Value::as_i64);

        debug!(
            uid = %ctx.uid,
            domain_id = encrypt_domain_id,
            base_cipher_id,
            base_cipher_len = base_cipher.len(),
            kcv = base_cipher_kcv,
            "parsed cipher key detail"
        );

        result.push(CipherKeyDetails {
            encrypt_domain_id,
            base_cipher_id,
            base_cipher,
            base_cipher_kcv,
            refresh_after_sec,
            expire_after_sec,
        });
    }

    check_for_new_kms_urls(ctx, &doc);
    Ok(result)
}

/// Parse and validate a blob-metadata response body.
///
/// Refresh and expiry hints are converted to absolute UNIX deadlines,
/// `f64::INFINITY` when absent.
///
/// # Errors
///
/// Returns [`ConnectorError::MalformedResponse`] on any schema or version
/// violation and [`ConnectorError::KeysFetchFailed`] when the KMS reports an
/// explicit error.
pub fn parse_blob_metadata_response(
    ctx: &ConnectorContext,
    body: &str,
) -> Result<Vec<BlobMetadataDetails>, ConnectorError> {
    let doc = parse_document(body)?;
    check_version(ctx, &doc, ctx.config.max_blob_metadata_request_version)?;
    check_error_object(ctx, &doc)?;

    let details = doc
        .get(BLOB_METADATA_DETAILS_TAG)
        .ok_or(SchemaViolation::MissingField(BLOB_METADATA_DETAILS_TAG))?
        .as_array()
        .ok_or(SchemaViolation::WrongType {
            field: BLOB_METADATA_DETAILS_TAG,
            expected: "array",
        })?;

    let now = unix_now_secs();
    let mut result = Vec::with_capacity(details.len());
    for detail in details {
        let detail = detail.as_object().ok_or(SchemaViolation::WrongType {
            field: BLOB_METADATA_DETAILS_TAG,
            expected: "object",
        })?;

        let domain_id = require(detail, BLOB_METADATA_DOMAIN_ID_TAG)?
            .as_i64()
            .ok_or(SchemaViolation::WrongType {
                field: BLOB_METADATA_DOMAIN_ID_TAG,
                expected: "integer",
            })?;
        let raw_locations = require(detail, BLOB_METADATA_LOCATIONS_TAG)?
            .as_array()
            .ok_or(SchemaViolation::WrongType {
                field: BLOB_METADATA_LOCATIONS_TAG,
                expected: "array",
            })?;

        let mut locations = Vec::with_capacity(raw_locations.len());
        for location in raw_locations {
            let location = location.as_object().ok_or(SchemaViolation::WrongType {
                field: BLOB_METADATA_LOCATIONS_TAG,
                expected: "object",
            })?;
            let location_id = require(location, BLOB_METADATA_LOCATION_ID_TAG)?
                .as_i64()
                .ok_or(SchemaViolation::WrongType {
                    field: BLOB_METADATA_LOCATION_ID_TAG,
                    expected: "integer",
                })?;
            let path = require(location, BLOB_METADATA_LOCATION_PATH_TAG)?
                .as_str()
                .ok_or(SchemaViolation::WrongType {
                    field: BLOB_METADATA_LOCATION_PATH_TAG,
                    expected: "string",
                })?
                .to_owned();
            locations.push(BlobMetadataLocation { location_id, path });
        }

        let refresh_at = detail
            .get(REFRESH_AFTER_SEC_TAG)
            .and_then(Value::as_i64)
            .filter(|v| *v > 0)
            .map_or(f64::INFINITY, |v| now + v as f64);
        let expire_at = detail
            .get(EXPIRE_AFTER_SEC_TAG)
            .and_then(Value::as_i64)
            .map_or(f64::INFINITY, |v| now + v as f64);

        result.push(BlobMetadataDetails {
            domain_id,
            locations,
            refresh_at,
            expire_at,
        });
    }

    check_for_new_kms_urls(ctx, &doc);
    Ok(result)
}

fn parse_document(body: &str) -> Result<Map<String, Value>, ConnectorError> {
    let doc: Value = serde_json::from_str(body).map_err(|_| SchemaViolation::InvalidJson)?;
    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(SchemaViolation::WrongType {
            field: "response",
            expected: "object",
        }
        .into()),
    }
}

fn require<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, SchemaViolation> {
    obj.get(field).ok_or(SchemaViolation::MissingField(field))
}

fn check_version(
    ctx: &ConnectorContext,
    doc: &Map<String, Value>,
    max_supported: u32,
) -> Result<(), ConnectorError> {
    let version = doc
        .get(REQUEST_VERSION_TAG)
        .ok_or(SchemaViolation::MissingField(REQUEST_VERSION_TAG))?
        .as_i64()
        .ok_or(SchemaViolation::WrongType {
            field: REQUEST_VERSION_TAG,
            expected: "integer",
        })?;

    if version == INVALID_REQUEST_VERSION {
        warn!(uid = %ctx.uid, version, "KMS response carries the invalid version");
        return Err(SchemaViolation::InvalidVersion.into());
    }
    if version > i64::from(max_supported) {
        warn!(
            uid = %ctx.uid,
            version,
            max_supported,
            "KMS response version exceeds max supported"
        );
        return Err(SchemaViolation::UnsupportedVersion {
            version,
            max: max_supported,
        }
        .into());
    }
    Ok(())
}

/// An explicit `error` object aborts the parse; any detail array present is
/// ignored.
fn check_error_object(ctx: &ConnectorContext, doc: &Map<String, Value>) -> Result<(), ConnectorError> {
    let Some(error) = doc.get(ERROR_TAG) else {
        return Ok(());
    };
    if error.is_null() {
        return Ok(());
    }

    let err_msg = error.get(ERROR_MSG_TAG).and_then(Value::as_str).unwrap_or("");
    let err_code = error.get(ERROR_CODE_TAG).and_then(Value::as_str).unwrap_or("");
    warn!(uid = %ctx.uid, err_msg, err_code, "KMS returned an error response");
    Err(ConnectorError::KeysFetchFailed)
}

/// Apply a side-band URL refresh when the response carries a non-null
/// `kms_urls` array. A malformed section is logged and swallowed; the primary
/// result has already been extracted by the time this runs.
fn check_for_new_kms_urls(ctx: &ConnectorContext, doc: &Map<String, Value>) {
    let Some(urls) = doc.get(KMS_URLS_TAG) else {
        return;
    };
    if urls.is_null() {
        return;
    }
    if let Err(e) = extract_kms_urls(ctx, urls) {
        warn!(
            uid = %ctx.uid,
            error = %e,
            "side-band KMS URL refresh failed; keeping primary result"
        );
    }
}

fn extract_kms_urls(ctx: &ConnectorContext, urls: &Value) -> Result<(), ConnectorError> {
    let urls = urls.as_array().ok_or(SchemaViolation::WrongType {
        field: KMS_URLS_TAG,
        expected: "array",
    })?;

    // Validate every entry before touching the pool so a malformed section
    // cannot leave it half replaced.
    let mut fresh = Vec::with_capacity(urls.len());
    for url in urls {
        let url = url.as_str().ok_or_else(|| {
            ConnectorError::OperationFailed("non-string entry in kms_urls".into())
        })?;
        if let Some(url) = normalize_url(url) {
            debug!(uid = %ctx.uid, url = %url, "side-band refresh discovered KMS URL");
            fresh.push(url);
        }
    }

    ctx.with_pool(|pool| {
        drop_cached_urls(ctx, pool);
        for url in fresh {
            pool.push(KmsEndpoint::new(url));
        }
    });
    ctx.mark_kms_urls_refreshed();
    Ok(())
}

fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
