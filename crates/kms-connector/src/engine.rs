//! The request engine: two-pass failover across the endpoint pool.
//!
//! Pass 1 walks the pooled endpoints healthiest-first, tolerating transport
//! errors and parse failures. If the whole pool is exhausted, the engine
//! re-discovers URLs from the source of truth and runs pass 2; there, an
//! unreachable endpoint (timeout, connection refused) is terminal, because
//! re-running discovery will not help.
//!
//! Every endpoint popped during a pass is stashed in a staging buffer and
//! restored afterwards, so the pool never loses endpoints and their counters
//! survive: dead URLs merely sink in the heap. When a concurrent wholesale
//! replacement (side-band refresh, rediscovery) advanced the pool generation
//! while entries were staged, the stale entries are discarded instead, last
//! writer wins.

use common::ConnectorError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ConnectorContext;
use crate::discovery;
use crate::http::ambient_headers;
use crate::pool::{KmsEndpoint, UrlPool};

/// Join an endpoint base URL with a request suffix, inserting a `/` when the
/// suffix lacks one.
fn full_request_url(base: &str, suffix: &str) -> String {
    if suffix.starts_with('/') {
        format!("{base}{suffix}")
    } else {
        format!("{base}/{suffix}")
    }
}

/// Deliver `request_body` to some KMS endpoint and return the parsed reply.
///
/// # Errors
///
/// Returns the parse error's kind only indirectly: a response that fails
/// `parse` sends the engine to the next endpoint. The terminal errors are
/// [`ConnectorError::InvalidKmsConfig`] for an empty suffix, a transport
/// error on pass 2 when the endpoint is unreachable, any discovery failure,
/// and [`ConnectorError::KeysFetchFailed`] once both passes are exhausted.
pub async fn send_request<T>(
    ctx: &ConnectorContext,
    url_suffix: &str,
    request_body: &str,
    parse: impl Fn(&ConnectorContext, &str) -> Result<T, ConnectorError>,
) -> Result<T, ConnectorError> {
    if url_suffix.is_empty() {
        warn!(uid = %ctx.uid, "rejecting KMS request with empty endpoint suffix");
        return Err(ConnectorError::InvalidKmsConfig(
            "empty KMS endpoint suffix".into(),
        ));
    }

    let request_id = Uuid::new_v4();
    let headers = ambient_headers();

    for pass in 1..=2u8 {
        let generation = ctx.with_pool(|p| p.generation());
        let mut staging: Vec<KmsEndpoint> = Vec::new();

        while let Some(mut endpoint) = ctx.with_pool(UrlPool::pop) {
            let full_url = full_request_url(&endpoint.url, url_suffix);
            debug!(
                uid = %ctx.uid,
                request_id = %request_id,
                pass,
                url = %full_url,
                "sending KMS request"
            );

            match ctx.http.post(&full_url, request_body, &headers).await {
                Ok(resp) => {
                    endpoint.requests += 1;
                    if resp.status != 200 {
                        debug!(
                            uid = %ctx.uid,
                            request_id = %request_id,
                            url = %endpoint.url,
                            status = resp.status,
                            "KMS endpoint returned non-200 status"
                        );
                        endpoint.failed_responses += 1;
                        staging.push(endpoint);
                        continue;
                    }

                    match parse(ctx, &resp.body) {
                        Ok(parsed) => {
                            staging.push(endpoint);
                            restore_staging(ctx, generation, staging);
                            return Ok(parsed);
                        }
                        Err(e) => {
                            warn!(
                                uid = %ctx.uid,
                                request_id = %request_id,
                                url = %endpoint.url,
                                error = %e,
                                "failed to parse KMS response"
                            );
                            endpoint.parse_failures += 1;
                            staging.push(endpoint);
                            // Never retried against the same endpoint.
                        }
                    }
                }
                Err(e) => {
                    endpoint.failed_responses += 1;
                    staging.push(endpoint);
                    if pass == 2 && e.is_kms_unreachable() {
                        debug!(
                            uid = %ctx.uid,
                            request_id = %request_id,
                            error = %e,
                            "KMS unreachable on second pass, giving up"
                        );
                        restore_staging(ctx, generation, staging);
                        return Err(e);
                    }
                    debug!(
                        uid = %ctx.uid,
                        request_id = %request_id,
                        error = %e,
                        "KMS request transport error, trying next endpoint"
                    );
                }
            }
        }

        restore_staging(ctx, generation, staging);

        if pass == 1 {
            // The pool is rebuilt from the source of truth before the retry.
            discovery::discover(ctx, true).await?;
        }
    }

    warn!(
        uid = %ctx.uid,
        request_id = %request_id,
        "KMS request failed against every endpoint on both passes"
    );
    Err(ConnectorError::KeysFetchFailed)
}

/// Put staged endpoints back unless the pool was replaced wholesale while
/// they were out; stale entries from a superseded generation are dropped.
fn restore_staging(ctx: &ConnectorContext, generation: u64, staging: Vec<KmsEndpoint>) {
    ctx.with_pool(|pool| {
        if pool.generation() == generation {
            pool.restore(staging);
        } else {
            for ep in &staging {
                debug!(
                    uid = %ctx.uid,
                    url = %ep.url,
                    "discarding endpoint staged across a URL refresh"
                );
            }
        }
    });
}
