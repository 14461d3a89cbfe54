//! Shared state owned by one connector instance.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::Config;
use crate::http::RestClient;
use crate::kcv::{sha256_kcv, KcvFn};
use crate::pool::UrlPool;
use crate::tokens::TokenStore;

/// State shared between the connector loop and its worker tasks.
///
/// The pool, token store, and refresh timestamp are guarded by plain std
/// locks: every critical section is a handful of instructions and none is
/// held across an await point.
pub struct ConnectorContext {
    /// Unique id of this connector instance, carried in every trace event.
    pub uid: Uuid,
    /// Immutable configuration captured at construction.
    pub config: Config,
    /// Shared HTTP transport.
    pub http: Arc<dyn RestClient>,
    kcv: KcvFn,
    pool: Mutex<UrlPool>,
    tokens: RwLock<TokenStore>,
    last_urls_refresh: Mutex<Option<Instant>>,
}

impl ConnectorContext {
    /// Create a context with the default SHA-256 KCV reduction.
    pub fn new(config: Config, http: Arc<dyn RestClient>) -> Self {
        Self::with_kcv(config, http, sha256_kcv)
    }

    /// Create a context with an injected KCV reduction, for hosts whose
    /// encryption subsystem uses a different digest-to-u32 mapping.
    pub fn with_kcv(config: Config, http: Arc<dyn RestClient>, kcv: KcvFn) -> Self {
        Self {
            uid: Uuid::new_v4(),
            config,
            http,
            kcv,
            pool: Mutex::new(UrlPool::new()),
            tokens: RwLock::new(TokenStore::new()),
            last_urls_refresh: Mutex::new(None),
        }
    }

    /// Run `f` against the URL pool under its lock.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut UrlPool) -> R) -> R {
        let mut pool = self.pool.lock().expect("url pool lock poisoned");
        f(&mut pool)
    }

    /// Run `f` against the token store under a read lock.
    pub fn with_tokens<R>(&self, f: impl FnOnce(&TokenStore) -> R) -> R {
        let tokens = self.tokens.read().expect("token store lock poisoned");
        f(&tokens)
    }

    /// Run `f` against the token store under a write lock.
    pub fn with_tokens_mut<R>(&self, f: impl FnOnce(&mut TokenStore) -> R) -> R {
        let mut tokens = self.tokens.write().expect("token store lock poisoned");
        f(&mut tokens)
    }

    /// Compute the Key Check Value for `base_cipher` with the injected
    /// reduction.
    pub fn compute_kcv(&self, base_cipher: &[u8]) -> u32 {
        (self.kcv)(base_cipher)
    }

    /// Refresh policy: URL refresh is requested when enabled and the last
    /// successful refresh is older than the configured interval.
    pub fn should_refresh_kms_urls(&self) -> bool {
        if !self.config.refresh_kms_urls {
            return false;
        }
        let interval = Duration::from_secs(self.config.refresh_kms_urls_interval_secs);
        let last = self
            .last_urls_refresh
            .lock()
            .expect("refresh timestamp lock poisoned");
        last.map_or(true, |ts| ts.elapsed() > interval)
    }

    /// Record a successful URL refresh at the current instant.
    pub fn mark_kms_urls_refreshed(&self) {
        let mut last = self
            .last_urls_refresh
            .lock()
            .expect("refresh timestamp lock poisoned");
        *last = Some(Instant::now());
    }

    /// When the URL list was last refreshed, if ever.
    pub fn last_kms_urls_refresh(&self) -> Option<Instant> {
        *self
            .last_urls_refresh
            .lock()
            .expect("refresh timestamp lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use async_trait::async_trait;
    use common::ConnectorError;

    struct NoopClient;

    #[async_trait]
    impl RestClient for NoopClient {
        async fn post(
            &self,
            _url: &str,
            _body: &str,
            _headers: &[(String, String)],
        ) -> Result<HttpResponse, ConnectorError> {
            Err(ConnectorError::ConnectionFailed("noop".into()))
        }
    }

    fn ctx_with(config: Config) -> ConnectorContext {
        ConnectorContext::new(config, Arc::new(NoopClient))
    }

    #[test]
    fn refresh_wanted_before_first_refresh() {
        let ctx = ctx_with(Config::for_tests());
        assert!(ctx.should_refresh_kms_urls());
    }

    #[test]
    fn refresh_suppressed_right_after_mark() {
        let ctx = ctx_with(Config::for_tests());
        ctx.mark_kms_urls_refreshed();
        assert!(!ctx.should_refresh_kms_urls());
        assert!(ctx.last_kms_urls_refresh().is_some());
    }

    #[test]
    fn refresh_disabled_by_config() {
        let cfg = Config {
            refresh_kms_urls: false,
            ..Config::for_tests()
        };
        let ctx = ctx_with(cfg);
        assert!(!ctx.should_refresh_kms_urls());
    }

    #[test]
    fn injected_kcv_is_used() {
        fn ones(_: &[u8]) -> u32 {
            0xffff_ffff
        }
        let ctx = ConnectorContext::with_kcv(Config::for_tests(), Arc::new(NoopClient), ones);
        assert_eq!(ctx.compute_kcv(b"anything"), 0xffff_ffff);
    }
}
