//! The connector event loop.
//!
//! A single long-lived task owns the [`ConnectorContext`] and multiplexes the
//! three RPC request streams onto the request engine. Each incoming request
//! spawns a worker that builds the body, drives the engine, and answers on
//! the request's reply channel. Workers are tracked in a [`JoinSet`] scoped
//! to the loop: cancelling the loop cancels every worker, and a worker
//! failing with a non-reportable error stops the connector (fail-fast — such
//! an error is a bug, never a routine failure).

use std::sync::Arc;

use common::ConnectorError;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::context::ConnectorContext;
use crate::discovery;
use crate::engine;
use crate::request;
use crate::response;
use crate::rpc::{
    BlobMetadataReply, CipherKeyRef, CipherKeysReply, ConnectorClient, LookupBlobMetadataRequest,
    LookupKeysByDomainIdsRequest, LookupKeysByKeyIdsRequest, RequestStreams,
};
use crate::tokens::{self, TokenStore};

/// Bound on each request stream; senders back off when the connector falls
/// behind.
const RPC_CHANNEL_CAPACITY: usize = 64;

/// Spawn a connector over `ctx` and hand back the caller-side client plus the
/// loop's join handle.
pub fn spawn(
    ctx: Arc<ConnectorContext>,
) -> (ConnectorClient, JoinHandle<Result<(), ConnectorError>>) {
    let (client, streams) = ConnectorClient::channels(RPC_CHANNEL_CAPACITY);
    let handle = tokio::spawn(run(ctx, streams));
    (client, handle)
}

/// Run the connector loop until every request sender is dropped.
///
/// Startup discovers KMS URLs and procures validation tokens; both must
/// succeed before any RPC is accepted.
///
/// # Errors
///
/// Returns the startup error when discovery or token procurement fails, and
/// any non-reply-safe worker error thereafter.
pub async fn run(
    ctx: Arc<ConnectorContext>,
    mut streams: RequestStreams,
) -> Result<(), ConnectorError> {
    info!(uid = %ctx.uid, "KMS connector starting");

    discovery::discover(&ctx, false).await?;
    tokens::procure(&ctx).await?;

    info!(
        uid = %ctx.uid,
        pool_size = ctx.with_pool(|p| p.len()),
        token_count = ctx.with_tokens(TokenStore::len),
        "KMS connector ready"
    );

    let mut workers: JoinSet<Result<(), ConnectorError>> = JoinSet::new();
    loop {
        tokio::select! {
            req = streams.by_key_ids.recv() => match req {
                Some(req) => {
                    let ctx = ctx.clone();
                    workers.spawn(handle_keys_by_key_ids(ctx, req));
                }
                None => break,
            },
            req = streams.by_domain_ids.recv() => match req {
                Some(req) => {
                    let ctx = ctx.clone();
                    workers.spawn(handle_keys_by_domain_ids(ctx, req));
                }
                None => break,
            },
            req = streams.blob_metadata.recv() => match req {
                Some(req) => {
                    let ctx = ctx.clone();
                    workers.spawn(handle_blob_metadata(ctx, req));
                }
                None => break,
            },
            Some(joined) = workers.join_next() => {
                check_worker(&ctx, joined)?;
            }
        }
    }

    // Streams closed: let in-flight workers finish, then shut down.
    while let Some(joined) = workers.join_next().await {
        check_worker(&ctx, joined)?;
    }
    info!(uid = %ctx.uid, "KMS connector shutting down");
    Ok(())
}

fn check_worker(
    ctx: &ConnectorContext,
    joined: Result<Result<(), ConnectorError>, tokio::task::JoinError>,
) -> Result<(), ConnectorError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(
                uid = %ctx.uid,
                error = %e,
                "worker failed with a non-reportable error; stopping connector"
            );
            Err(e)
        }
        Err(e) => {
            error!(uid = %ctx.uid, error = %e, "worker task died");
            Err(ConnectorError::OperationFailed(format!(
                "connector worker died: {e}"
            )))
        }
    }
}

async fn handle_keys_by_key_ids(
    ctx: Arc<ConnectorContext>,
    req: LookupKeysByKeyIdsRequest,
) -> Result<(), ConnectorError> {
    let result = lookup_keys_by_key_ids(&ctx, &req.keys, req.debug_id.as_deref()).await;
    deliver(&ctx, req.reply, result)
}

async fn lookup_keys_by_key_ids(
    ctx: &ConnectorContext,
    keys: &[CipherKeyRef],
    debug_id: Option<&str>,
) -> CipherKeysReply {
    let refresh_urls = ctx.should_refresh_kms_urls();
    let body = request::by_key_ids_body(ctx, keys, refresh_urls, debug_id)?;
    engine::send_request(
        ctx,
        &ctx.config.get_encryption_keys_endpoint,
        &body,
        response::parse_cipher_response,
    )
    .await
}

async fn handle_keys_by_domain_ids(
    ctx: Arc<ConnectorContext>,
    req: LookupKeysByDomainIdsRequest,
) -> Result<(), ConnectorError> {
    let result = lookup_keys_by_domain_ids(&ctx, &req.domain_ids, req.debug_id.as_deref()).await;
    deliver(&ctx, req.reply, result)
}

async fn lookup_keys_by_domain_ids(
    ctx: &ConnectorContext,
    domain_ids: &[i64],
    debug_id: Option<&str>,
) -> CipherKeysReply {
    let refresh_urls = ctx.should_refresh_kms_urls();
    let body = request::latest_by_domain_ids_body(ctx, domain_ids, refresh_urls, debug_id)?;
    engine::send_request(
        ctx,
        &ctx.config.get_latest_encryption_keys_endpoint,
        &body,
        response::parse_cipher_response,
    )
    .await
}

async fn handle_blob_metadata(
    ctx: Arc<ConnectorContext>,
    req: LookupBlobMetadataRequest,
) -> Result<(), ConnectorError> {
    let result = lookup_blob_metadata(&ctx, &req.domain_ids, req.debug_id.as_deref()).await;
    deliver(&ctx, req.reply, result)
}

async fn lookup_blob_metadata(
    ctx: &ConnectorContext,
    domain_ids: &[i64],
    debug_id: Option<&str>,
) -> BlobMetadataReply {
    let refresh_urls = ctx.should_refresh_kms_urls();
    let body = request::blob_metadata_body(ctx, domain_ids, refresh_urls, debug_id)?;
    engine::send_request(
        ctx,
        &ctx.config.get_blob_metadata_endpoint,
        &body,
        response::parse_blob_metadata_response,
    )
    .await
}

/// Send `result` to the caller when it is reportable; rethrow it otherwise so
/// the loop fails fast.
fn deliver<T>(
    ctx: &ConnectorContext,
    reply: oneshot::Sender<Result<T, ConnectorError>>,
    result: Result<T, ConnectorError>,
) -> Result<(), ConnectorError> {
    match result {
        Ok(value) => {
            let _ = reply.send(Ok(value));
            Ok(())
        }
        Err(e) if e.is_reply_safe() => {
            warn!(uid = %ctx.uid, error = %e, "KMS lookup failed; reporting to caller");
            let _ = reply.send(Err(e));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kcv::sha256_kcv;
    use crate::testutil::{ok_response, ScriptedClient};
    use serde_json::{json, Value};
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Fixture {
        ctx: Arc<ConnectorContext>,
        http: Arc<ScriptedClient>,
        // Keep the temp files alive for the duration of the test.
        _discovery_file: NamedTempFile,
        _token_file: NamedTempFile,
    }

    fn fixture() -> Fixture {
        let mut discovery_file = NamedTempFile::new().unwrap();
        writeln!(discovery_file, "https://kms").unwrap();
        discovery_file.flush().unwrap();

        let mut token_file = NamedTempFile::new().unwrap();
        token_file.write_all(b"abc\n").unwrap();
        token_file.flush().unwrap();

        let cfg = Config {
            discovery_url_file: discovery_file.path().display().to_string(),
            validation_token_details: format!("t1${}", token_file.path().display()),
            ..Config::for_tests()
        };

        let http = Arc::new(ScriptedClient::new());
        let ctx = Arc::new(ConnectorContext::new(cfg, http.clone()));
        Fixture {
            ctx,
            http,
            _discovery_file: discovery_file,
            _token_file: token_file,
        }
    }

    fn cipher_response_body() -> String {
        json!({
            "version": 1,
            "cipher_key_details": [{
                "base_cipher_id": 12345u64,
                "encrypt_domain_id": 5,
                "base_cipher": "0123456789abcdef0123456789abcdef",
            }],
        })
        .to_string()
    }

    #[tokio::test]
    async fn lookup_by_key_ids_end_to_end() {
        let f = fixture();
        f.http.set_fallback(
            "https://kms/getEncryptionKeys",
            ok_response(&cipher_response_body()),
        );

        let (client, handle) = spawn(f.ctx);
        let details = client
            .fetch_keys_by_key_ids(
                vec![CipherKeyRef {
                    base_cipher_id: 12345,
                    domain_id: Some(5),
                }],
                Some("dbg-1".into()),
            )
            .await
            .unwrap();

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].encrypt_domain_id, 5);
        assert_eq!(details[0].base_cipher_id, 12345);
        assert_eq!(details[0].base_cipher, b"0123456789abcdef0123456789abcdef");
        assert_eq!(
            details[0].base_cipher_kcv,
            sha256_kcv(b"0123456789abcdef0123456789abcdef")
        );

        // The request body carried the procured token, the refresh flag (no
        // refresh has happened yet), and the debug id.
        let sent: Value = serde_json::from_str(&f.http.bodies()[0]).unwrap();
        assert_eq!(sent["validation_tokens"][0]["token_name"], "t1");
        assert_eq!(sent["validation_tokens"][0]["token_value"], "abc");
        assert_eq!(sent["refresh_kms_urls"], true);
        assert_eq!(sent["debug_uid"], "dbg-1");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn blob_metadata_end_to_end() {
        let f = fixture();
        let body = json!({
            "version": 1,
            "blob_metadata_details": [{
                "domain_id": 9,
                "locations": [{"id": 1, "path": "blobstore://p1"}],
            }],
        })
        .to_string();
        f.http
            .set_fallback("https://kms/getBlobMetadata", ok_response(&body));

        let (client, handle) = spawn(f.ctx);
        let details = client.fetch_blob_metadata(vec![9], None).await.unwrap();

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].domain_id, 9);
        assert_eq!(details[0].locations[0].path, "blobstore://p1");
        assert_eq!(details[0].expire_at, f64::INFINITY);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn side_band_refresh_redirects_later_requests() {
        let f = fixture();
        let first = json!({
            "version": 1,
            "cipher_key_details": [],
            "kms_urls": ["https://kms2"],
        })
        .to_string();
        f.http.enqueue(
            "https://kms/getLatestEncryptionKeys",
            ok_response(&first),
        );
        let second = json!({"version": 1, "cipher_key_details": []}).to_string();
        f.http
            .set_fallback("https://kms2/getLatestEncryptionKeys", ok_response(&second));

        let ctx = f.ctx.clone();
        let (client, handle) = spawn(f.ctx);

        client
            .fetch_latest_keys_by_domain_ids(vec![1], None)
            .await
            .unwrap();
        assert_eq!(ctx.with_pool(|p| p.urls()), vec!["https://kms2"]);
        assert!(ctx.last_kms_urls_refresh().is_some());

        client
            .fetch_latest_keys_by_domain_ids(vec![2], None)
            .await
            .unwrap();
        let hits = f.http.hits();
        assert_eq!(hits[1], "https://kms2/getLatestEncryptionKeys");

        // The refresh just happened, so the second request must not ask again.
        let sent: Value = serde_json::from_str(&f.http.bodies()[1]).unwrap();
        assert_eq!(sent["refresh_kms_urls"], false);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn kms_error_reply_reaches_caller_and_connector_survives() {
        let f = fixture();
        let error_body = json!({
            "version": 1,
            "error": {"err_msg": "denied", "err_code": "403"},
        })
        .to_string();
        f.http
            .set_fallback("https://kms/getEncryptionKeys", ok_response(&error_body));
        let good = cipher_response_body();
        f.http
            .set_fallback("https://kms/getLatestEncryptionKeys", ok_response(&good));

        let (client, handle) = spawn(f.ctx);

        let err = client
            .fetch_keys_by_key_ids(
                vec![CipherKeyRef {
                    base_cipher_id: 1,
                    domain_id: None,
                }],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::KeysFetchFailed));

        // The connector is still serving.
        let details = client
            .fetch_latest_keys_by_domain_ids(vec![5], None)
            .await
            .unwrap();
        assert_eq!(details.len(), 1);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn startup_fails_without_discovery_file() {
        let mut token_file = NamedTempFile::new().unwrap();
        token_file.write_all(b"abc").unwrap();
        token_file.flush().unwrap();

        let cfg = Config {
            discovery_url_file: "/imaginary-dir/kms-urls".into(),
            validation_token_details: format!("t1${}", token_file.path().display()),
            ..Config::for_tests()
        };
        let ctx = Arc::new(ConnectorContext::new(cfg, Arc::new(ScriptedClient::new())));

        let (client, handle) = spawn(ctx);
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidKmsConfig(_)));

        // Requests against the dead connector fail cleanly.
        let err = client.fetch_blob_metadata(vec![1], None).await.unwrap_err();
        assert!(matches!(err, ConnectorError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn deliver_rethrows_non_reply_safe_errors() {
        let f = fixture();
        let (tx, rx) = oneshot::channel::<CipherKeysReply>();

        let err = deliver(&f.ctx, tx, Err(ConnectorError::NotImplemented("mode"))).unwrap_err();
        assert!(matches!(err, ConnectorError::NotImplemented(_)));
        // Nothing was sent to the caller.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn deliver_reports_reply_safe_errors() {
        let f = fixture();
        let (tx, rx) = oneshot::channel::<CipherKeysReply>();

        deliver(&f.ctx, tx, Err(ConnectorError::KeysFetchFailed)).unwrap();
        assert!(matches!(
            rx.await.unwrap(),
            Err(ConnectorError::KeysFetchFailed)
        ));
    }
}
