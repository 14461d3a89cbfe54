//! Wire-protocol definitions for the KMS JSON dialect.
//!
//! Request bodies are serialised with serde; responses are validated by hand
//! against the field tags below, so the parser can report structured schema
//! violations instead of deserialisation strings.

use serde::Serialize;

/// Reserved version value a KMS must never return.
pub const INVALID_REQUEST_VERSION: i64 = 0;

// ---------------------------------------------------------------------------
// JSON field tags
// ---------------------------------------------------------------------------

/// Top-level wire-version field, present in every request and response.
pub const REQUEST_VERSION_TAG: &str = "version";
/// Detail array tag for the cipher-key request family.
pub const CIPHER_KEY_DETAILS_TAG: &str = "cipher_key_details";
/// Detail array tag for the blob-metadata request family.
pub const BLOB_METADATA_DETAILS_TAG: &str = "blob_metadata_details";

pub const BASE_CIPHER_ID_TAG: &str = "base_cipher_id";
pub const BASE_CIPHER_TAG: &str = "base_cipher";
pub const ENCRYPT_DOMAIN_ID_TAG: &str = "encrypt_domain_id";
pub const REFRESH_AFTER_SEC_TAG: &str = "refresh_after_sec";
pub const EXPIRE_AFTER_SEC_TAG: &str = "expire_after_sec";

pub const BLOB_METADATA_DOMAIN_ID_TAG: &str = "domain_id";
pub const BLOB_METADATA_LOCATIONS_TAG: &str = "locations";
pub const BLOB_METADATA_LOCATION_ID_TAG: &str = "id";
pub const BLOB_METADATA_LOCATION_PATH_TAG: &str = "path";

/// Optional top-level array re-seeding the endpoint pool (side-band refresh).
pub const KMS_URLS_TAG: &str = "kms_urls";

/// Optional top-level error object; when present the rest of the payload is
/// ignored.
pub const ERROR_TAG: &str = "error";
pub const ERROR_MSG_TAG: &str = "err_msg";
pub const ERROR_CODE_TAG: &str = "err_code";

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// One `validation_tokens` array element.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationTokenEntry {
    /// Token name as configured in the token details string.
    pub token_name: String,
    /// Opaque bearer value read from the token file.
    pub token_value: String,
}

/// One `cipher_key_details` entry of a by-key-ids request.
#[derive(Debug, Clone, Serialize)]
pub struct CipherKeyIdEntry {
    /// Identifier of the requested base cipher.
    pub base_cipher_id: u64,
    /// Domain the key is expected to belong to, when the caller knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypt_domain_id: Option<i64>,
}

/// One `cipher_key_details` entry of a latest-by-domain request.
#[derive(Debug, Clone, Serialize)]
pub struct CipherDomainIdEntry {
    /// Domain whose latest cipher is requested.
    pub encrypt_domain_id: i64,
}

/// One `blob_metadata_details` entry of a blob-metadata request.
#[derive(Debug, Clone, Serialize)]
pub struct BlobDomainIdEntry {
    /// Domain whose blob locations are requested.
    pub domain_id: i64,
}

/// Request body for both cipher-key lookup families.
///
/// `details` entries preserve caller order; the KMS is free to reply in any
/// order.
#[derive(Debug, Clone, Serialize)]
pub struct CipherRequestBody<D: Serialize> {
    /// Current wire version for the cipher request family.
    pub version: u32,
    /// Per-request entries, shape depending on the lookup kind.
    pub cipher_key_details: Vec<D>,
    /// Every token currently held by the validation-token store.
    pub validation_tokens: Vec<ValidationTokenEntry>,
    /// Ask the KMS to piggyback a fresh URL list on the reply.
    pub refresh_kms_urls: bool,
    /// Caller-supplied identifier for cross-system request tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_uid: Option<String>,
}

/// Request body for the blob-metadata lookup family.
#[derive(Debug, Clone, Serialize)]
pub struct BlobMetadataRequestBody {
    /// Current wire version for the blob-metadata request family.
    pub version: u32,
    /// Requested domains, in caller order.
    pub blob_metadata_details: Vec<BlobDomainIdEntry>,
    /// Every token currently held by the validation-token store.
    pub validation_tokens: Vec<ValidationTokenEntry>,
    /// Ask the KMS to piggyback a fresh URL list on the reply.
    pub refresh_kms_urls: bool,
    /// Caller-supplied identifier for cross-system request tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_uid: Option<String>,
}

// ---------------------------------------------------------------------------
// Reply records
// ---------------------------------------------------------------------------

/// A single cipher key returned by the KMS, with its integrity checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherKeyDetails {
    /// Logical encryption namespace the key belongs to.
    pub encrypt_domain_id: i64,
    /// KMS-assigned identifier of the base cipher.
    pub base_cipher_id: u64,
    /// Raw long-lived key material.
    pub base_cipher: Vec<u8>,
    /// 32-bit Key Check Value derived from SHA-256 of `base_cipher`.
    pub base_cipher_kcv: u32,
    /// Refresh hint in seconds, verbatim from the KMS when positive.
    pub refresh_after_sec: Option<i64>,
    /// Expiry hint in seconds, verbatim from the KMS.
    pub expire_after_sec: Option<i64>,
}

/// One blob-storage location record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadataLocation {
    /// KMS-assigned location identifier.
    pub location_id: i64,
    /// Storage path, e.g. `blobstore://partition1`.
    pub path: String,
}

/// Blob-storage location metadata for one domain.
///
/// Deadlines are absolute UNIX timestamps in seconds; `f64::INFINITY` when the
/// KMS supplied no hint.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobMetadataDetails {
    /// Domain the locations belong to.
    pub domain_id: i64,
    /// Location records, in KMS reply order.
    pub locations: Vec<BlobMetadataLocation>,
    /// Absolute deadline after which the metadata should be refreshed.
    pub refresh_at: f64,
    /// Absolute deadline after which the metadata must not be used.
    pub expire_at: f64,
}
