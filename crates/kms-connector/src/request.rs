//! KMS request-body construction.
//!
//! Every body carries the family's wire version, the caller's detail entries
//! in order, the full validation-token set, the URL-refresh flag, and the
//! optional debug id.

use common::protocol::{
    BlobDomainIdEntry, BlobMetadataRequestBody, CipherDomainIdEntry, CipherKeyIdEntry,
    CipherRequestBody,
};
use common::ConnectorError;
use serde::Serialize;

use crate::context::ConnectorContext;
use crate::rpc::CipherKeyRef;
use crate::tokens::TokenStore;

/// Body for a by-key-ids cipher lookup.
pub fn by_key_ids_body(
    ctx: &ConnectorContext,
    keys: &[CipherKeyRef],
    refresh_kms_urls: bool,
    debug_uid: Option<&str>,
) -> Result<String, ConnectorError> {
    let body = CipherRequestBody {
        version: ctx.config.cipher_request_version,
        cipher_key_details: keys
            .iter()
            .map(|k| CipherKeyIdEntry {
                base_cipher_id: k.base_cipher_id,
                encrypt_domain_id: k.domain_id,
            })
            .collect(),
        validation_tokens: ctx.with_tokens(TokenStore::entries),
        refresh_kms_urls,
        debug_uid: debug_uid.map(str::to_owned),
    };
    to_json(&body)
}

/// Body for a latest-cipher-by-domain lookup.
pub fn latest_by_domain_ids_body(
    ctx: &ConnectorContext,
    domain_ids: &[i64],
    refresh_kms_urls: bool,
    debug_uid: Option<&str>,
) -> Result<String, ConnectorError> {
    let body = CipherRequestBody {
        version: ctx.config.cipher_request_version,
        cipher_key_details: domain_ids
            .iter()
            .map(|&encrypt_domain_id| CipherDomainIdEntry { encrypt_domain_id })
            .collect(),
        validation_tokens: ctx.with_tokens(TokenStore::entries),
        refresh_kms_urls,
        debug_uid: debug_uid.map(str::to_owned),
    };
    to_json(&body)
}

/// Body for a blob-metadata-by-domain lookup.
pub fn blob_metadata_body(
    ctx: &ConnectorContext,
    domain_ids: &[i64],
    refresh_kms_urls: bool,
    debug_uid: Option<&str>,
) -> Result<String, ConnectorError> {
    let body = BlobMetadataRequestBody {
        version: ctx.config.blob_metadata_request_version,
        blob_metadata_details: domain_ids
            .iter()
            .map(|&domain_id| BlobDomainIdEntry { domain_id })
            .collect(),
        validation_tokens: ctx.with_tokens(TokenStore::entries),
        refresh_kms_urls,
        debug_uid: debug_uid.map(str::to_owned),
    };
    to_json(&body)
}

fn to_json<T: Serialize>(body: &T) -> Result<String, ConnectorError> {
    serde_json::to_string(body)
        .map_err(|e| ConnectorError::OperationFailed(format!("failed to serialise KMS request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::scripted_context;
    use crate::tokens::{ValidationToken, ValidationTokenSource};
    use common::protocol::{
        BLOB_METADATA_DETAILS_TAG, CIPHER_KEY_DETAILS_TAG, ENCRYPT_DOMAIN_ID_TAG,
        REQUEST_VERSION_TAG,
    };
    use serde_json::Value;
    use std::time::SystemTime;

    fn ctx_with_token() -> crate::context::ConnectorContext {
        let ctx = scripted_context(Config::for_tests());
        ctx.with_tokens_mut(|store| {
            store.insert(ValidationToken {
                name: "t1".into(),
                value: "secret".into(),
                source: ValidationTokenSource::File,
                file_path: None,
                read_ts: SystemTime::now(),
            });
        });
        ctx
    }

    #[test]
    fn by_key_ids_round_trips_in_order() {
        let ctx = ctx_with_token();
        let keys: Vec<CipherKeyRef> = (0..8)
            .map(|i| CipherKeyRef {
                base_cipher_id: 100 + i,
                domain_id: Some(i as i64),
            })
            .collect();

        let body = by_key_ids_body(&ctx, &keys, false, Some("dbg-7")).unwrap();
        let doc: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(doc[REQUEST_VERSION_TAG], 1);
        let details = doc[CIPHER_KEY_DETAILS_TAG].as_array().unwrap();
        assert_eq!(details.len(), keys.len());
        for (i, entry) in details.iter().enumerate() {
            assert_eq!(entry["base_cipher_id"].as_u64().unwrap(), 100 + i as u64);
            assert_eq!(entry[ENCRYPT_DOMAIN_ID_TAG].as_i64().unwrap(), i as i64);
        }
        assert_eq!(doc["debug_uid"], "dbg-7");
        assert_eq!(doc["validation_tokens"][0]["token_value"], "secret");
    }

    #[test]
    fn latest_by_domain_ids_carries_domains() {
        let ctx = ctx_with_token();
        let body = latest_by_domain_ids_body(&ctx, &[9, 4, 7], true, None).unwrap();
        let doc: Value = serde_json::from_str(&body).unwrap();

        let ids: Vec<i64> = doc[CIPHER_KEY_DETAILS_TAG]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e[ENCRYPT_DOMAIN_ID_TAG].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![9, 4, 7]);
        assert_eq!(doc["refresh_kms_urls"], true);
        assert!(doc.get("debug_uid").is_none());
    }

    #[test]
    fn blob_metadata_uses_blob_family_version() {
        let cfg = Config {
            blob_metadata_request_version: 2,
            max_blob_metadata_request_version: 2,
            ..Config::for_tests()
        };
        let ctx = scripted_context(cfg);
        let body = blob_metadata_body(&ctx, &[42], false, None).unwrap();
        let doc: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(doc[REQUEST_VERSION_TAG], 2);
        assert_eq!(doc[BLOB_METADATA_DETAILS_TAG][0]["domain_id"], 42);
    }

    #[test]
    fn every_stored_token_is_attached() {
        let ctx = ctx_with_token();
        ctx.with_tokens_mut(|store| {
            store.insert(ValidationToken {
                name: "t2".into(),
                value: "other".into(),
                source: ValidationTokenSource::File,
                file_path: None,
                read_ts: SystemTime::now(),
            });
        });

        let body = blob_metadata_body(&ctx, &[1], false, None).unwrap();
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["validation_tokens"].as_array().unwrap().len(), 2);
    }
}
