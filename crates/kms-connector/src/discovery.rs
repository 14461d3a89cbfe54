//! KMS endpoint discovery.
//!
//! Discovery runs in two scenarios: once at connector bootstrap, and again
//! whenever a request exhausts every pooled endpoint. The documented intent
//! is to prefer a URL list persisted in the cluster configuration store and
//! fall back to the discovery file; the persisted read is not wired up yet,
//! so every discovery currently comes from the file.

use common::ConnectorError;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::DISCOVERY_MODE_FILE;
use crate::context::ConnectorContext;
use crate::pool::{KmsEndpoint, UrlPool};

/// Normalise one raw discovery line: trim surrounding whitespace and strip
/// every trailing `/`. Returns `None` when nothing is left.
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Discover KMS URLs according to the configured mode and load them into the
/// pool.
///
/// With `refresh_persisted` set, the freshly discovered URLs replace the
/// pool's contents and the URL-refresh timestamp advances; otherwise the
/// URLs are added to whatever the pool already holds.
///
/// # Errors
///
/// Returns [`ConnectorError::NotImplemented`] for any mode other than
/// `"file"`; file mode returns [`ConnectorError::InvalidKmsConfig`] when the
/// discovery file is missing and [`ConnectorError::IoError`] on a short read.
pub async fn discover(ctx: &ConnectorContext, refresh_persisted: bool) -> Result<(), ConnectorError> {
    match ctx.config.discovery_mode.as_str() {
        DISCOVERY_MODE_FILE => discover_from_file(ctx, refresh_persisted).await,
        _ => Err(ConnectorError::NotImplemented("KMS URL discovery mode")),
    }
}

async fn discover_from_file(
    ctx: &ConnectorContext,
    refresh_persisted: bool,
) -> Result<(), ConnectorError> {
    let path = &ctx.config.discovery_url_file;
    if path.is_empty() || !fs::try_exists(path).await.unwrap_or(false) {
        warn!(uid = %ctx.uid, file = %path, "KMS URL discovery file not found");
        return Err(ConnectorError::InvalidKmsConfig(format!(
            "KMS URL discovery file {path} not found"
        )));
    }

    let meta = fs::metadata(path)
        .await
        .map_err(|e| ConnectorError::IoError(format!("failed to stat {path}: {e}")))?;
    let buf = fs::read(path)
        .await
        .map_err(|e| ConnectorError::IoError(format!("failed to read {path}: {e}")))?;
    if buf.len() as u64 != meta.len() {
        warn!(
            uid = %ctx.uid,
            file = %path,
            expected = meta.len(),
            actual = buf.len(),
            "short read from KMS URL discovery file"
        );
        return Err(ConnectorError::IoError(format!(
            "short read from discovery file {path}"
        )));
    }

    let contents = String::from_utf8(buf).map_err(|_| {
        ConnectorError::InvalidKmsConfig(format!("discovery file {path} is not valid UTF-8"))
    })?;

    // Acceptable file format, one URL per line:
    //   <url1>\n
    //   <url2>\n
    let mut urls = Vec::new();
    for line in contents.lines() {
        let Some(url) = normalize_url(line) else {
            continue;
        };
        debug!(uid = %ctx.uid, raw = line, url = %url, "discovered KMS URL");
        urls.push(url);
    }

    ctx.with_pool(|pool| {
        if refresh_persisted {
            drop_cached_urls(ctx, pool);
        }
        for url in urls {
            pool.push(KmsEndpoint::new(url));
        }
    });

    if refresh_persisted {
        ctx.mark_kms_urls_refreshed();
    }

    info!(
        uid = %ctx.uid,
        file = %path,
        refresh_persisted,
        pool_size = ctx.with_pool(|p| p.len()),
        "KMS URL discovery complete"
    );
    Ok(())
}

/// Drop every cached endpoint ahead of a wholesale replacement, logging each
/// one's accounting for the operator.
pub(crate) fn drop_cached_urls(ctx: &ConnectorContext, pool: &mut UrlPool) {
    for ep in pool.drain() {
        info!(
            uid = %ctx.uid,
            url = %ep.url,
            requests = ep.requests,
            failed_responses = ep.failed_responses,
            parse_failures = ep.parse_failures,
            "dropping cached KMS URL"
        );
    }
}
