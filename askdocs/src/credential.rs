use async_trait::async_trait;
use std::{
    fmt::{self, Debug},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

use crate::Result;

/// Scope requested for Azure OpenAI access tokens.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Tokens are refreshed once they get this close to expiring.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// Expiry as a unix timestamp, in seconds.
    pub expires_on: i64,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: i64) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Whether the token can still be presented at `now`, leaving [`EXPIRY_MARGIN_SECS`] of slack.
    #[must_use]
    pub const fn is_valid_at(&self, now: i64) -> bool {
        self.expires_on > now + EXPIRY_MARGIN_SECS
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Requests a fresh token for `scope`.
    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

pub trait Clock: Send + Sync {
    /// Current unix time, in seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Shared bearer token for single-tenant mode.
///
/// The check and the refresh both happen on the calling path. Concurrent callers that all see
/// an expiring token will each fetch a new one; the last write wins.
pub struct TokenCache {
    scope: String,
    provider: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self::with_clock(provider, Arc::new(SystemClock))
    }

    pub fn with_clock(provider: Arc<dyn TokenProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            provider,
            current: RwLock::new(None),
            scope: COGNITIVE_SERVICES_SCOPE.to_string(),
        }
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Seeds the cache, e.g. with a token obtained at startup.
    pub fn store(&self, token: AccessToken) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    #[must_use]
    pub fn cached(&self) -> Option<AccessToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns a token that is valid for at least [`EXPIRY_MARGIN_SECS`], refreshing it first if needed.
    ///
    /// # Errors
    ///
    /// Propagates whatever the identity provider returns when a refresh fails.
    pub async fn get_valid_token(&self) -> Result<AccessToken> {
        let now = self.clock.now();

        if let Some(token) = self.cached().filter(|token| token.is_valid_at(now)) {
            return Ok(token);
        }

        debug!(scope = %self.scope, "Refreshing access token");
        let token = self.provider.get_token(&self.scope).await?;
        self.store(token.clone());

        Ok(token)
    }
}

impl Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("scope", &self.scope)
            .field("current", &self.cached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Mutex,
    };

    pub const NOW: i64 = 1_700_000_000;

    #[derive(Debug)]
    pub struct FixedClock(pub AtomicI64);

    impl FixedClock {
        pub fn at(now: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(now)))
        }

        pub fn advance(&self, secs: i64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Hands out `token-1`, `token-2`, ... each valid for `lifetime` seconds from the fixed clock.
    pub struct CountingProvider {
        pub calls: AtomicUsize,
        pub scopes: Mutex<Vec<String>>,
        clock: Arc<FixedClock>,
        lifetime: i64,
    }

    impl CountingProvider {
        pub fn new(clock: Arc<FixedClock>, lifetime: i64) -> Arc<Self> {
            Arc::new(Self {
                clock,
                lifetime,
                calls: AtomicUsize::new(0),
                scopes: Mutex::new(vec![]),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn get_token(&self, scope: &str) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.scopes.lock().unwrap().push(scope.to_string());

            Ok(AccessToken::new(
                format!("token-{n}"),
                self.clock.now() + self.lifetime,
            ))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TokenProvider for FailingProvider {
        async fn get_token(&self, _: &str) -> Result<AccessToken> {
            Err(Error::identity("no credential available"))
        }
    }

    #[test]
    fn validity_respects_margin() {
        assert!(AccessToken::new("t", NOW + 61).is_valid_at(NOW));
        assert!(!AccessToken::new("t", NOW + 60).is_valid_at(NOW));
        assert!(!AccessToken::new("t", NOW + 30).is_valid_at(NOW));
        assert!(!AccessToken::new("t", NOW - 5).is_valid_at(NOW));
    }

    #[tokio::test]
    async fn fetches_on_first_use() {
        let clock = FixedClock::at(NOW);
        let provider = CountingProvider::new(clock.clone(), 3600);
        let cache = TokenCache::with_clock(provider.clone(), clock);

        let token = cache.get_valid_token().await.unwrap();

        assert_eq!(token.token, "token-1");
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            provider.scopes.lock().unwrap().as_slice(),
            [COGNITIVE_SERVICES_SCOPE]
        );
    }

    #[tokio::test]
    async fn refreshes_token_inside_margin() {
        let clock = FixedClock::at(NOW);
        let provider = CountingProvider::new(clock.clone(), 3600);
        let cache = TokenCache::with_clock(provider.clone(), clock);
        cache.store(AccessToken::new("stale", NOW + 30));

        let token = cache.get_valid_token().await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(token.token, "token-1");
        assert_eq!(cache.cached().unwrap().token, "token-1");
    }

    #[tokio::test]
    async fn reuses_token_outside_margin() {
        let clock = FixedClock::at(NOW);
        let provider = CountingProvider::new(clock.clone(), 3600);
        let cache = TokenCache::with_clock(provider.clone(), clock);
        cache.store(AccessToken::new("fresh", NOW + 120));

        let token = cache.get_valid_token().await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(token.token, "fresh");
    }

    #[tokio::test]
    async fn refreshes_again_once_clock_passes_margin() {
        let clock = FixedClock::at(NOW);
        let provider = CountingProvider::new(clock.clone(), 120);
        let cache = TokenCache::with_clock(provider.clone(), clock.clone());

        cache.get_valid_token().await.unwrap();
        cache.get_valid_token().await.unwrap();
        assert_eq!(provider.calls(), 1);

        clock.advance(70);
        let token = cache.get_valid_token().await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(token.token, "token-2");
    }

    #[tokio::test]
    async fn provider_errors_propagate_and_keep_cache() {
        let cache = TokenCache::with_clock(Arc::new(FailingProvider), FixedClock::at(NOW));
        cache.store(AccessToken::new("expired", NOW - 1));

        let err = cache.get_valid_token().await.unwrap_err();

        assert!(matches!(err, Error::Identity { message, .. } if message == "no credential available"));
        assert_eq!(cache.cached().unwrap().token, "expired");
    }

    /// Parks each fetch at a barrier so that two callers are always in flight together.
    struct GatedProvider {
        gate: tokio::sync::Barrier,
        calls: AtomicUsize,
        finished: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenProvider for GatedProvider {
        async fn get_token(&self, _: &str) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.gate.wait().await;

            let token = format!("token-{n}");
            self.finished.lock().unwrap().push(token.clone());

            Ok(AccessToken::new(token, NOW + 3600))
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_are_not_deduplicated() {
        let clock = FixedClock::at(NOW);
        let provider = Arc::new(GatedProvider {
            gate: tokio::sync::Barrier::new(2),
            calls: AtomicUsize::new(0),
            finished: Mutex::new(vec![]),
        });
        let cache = TokenCache::with_clock(provider.clone(), clock.clone());
        cache.store(AccessToken::new("held", NOW + 120));

        clock.advance(90);
        let (first, second) = tokio::join!(cache.get_valid_token(), cache.get_valid_token());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.token, second.token);

        let last = provider.finished.lock().unwrap().last().cloned().unwrap();
        assert_eq!(cache.cached().unwrap().token, last);
    }

    #[tokio::test]
    async fn uses_custom_scope() {
        let clock = FixedClock::at(NOW);
        let provider = CountingProvider::new(clock.clone(), 3600);
        let cache = TokenCache::with_clock(provider.clone(), clock).scope("api://custom/.default");

        cache.get_valid_token().await.unwrap();

        assert_eq!(
            provider.scopes.lock().unwrap().as_slice(),
            ["api://custom/.default"]
        );
    }
}
