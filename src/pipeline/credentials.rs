//! Long-lived credential handle for request signing.
//!
//! Credentials are resolved once and reused until they are older than the
//! configured window (measured on the monotonic clock) or close to their
//! own expiry. Rotation is therefore picked up within a bounded delay.

use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::debug;

/// Credentials expiring sooner than this are refreshed regardless of age.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

struct CachedCredentials {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Caches resolved credentials with a maximum staleness.
pub struct CredentialCache {
    provider: SharedCredentialsProvider,
    max_age: Duration,
    cached: RwLock<Option<CachedCredentials>>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn new(provider: SharedCredentialsProvider, max_age: Duration) -> Self {
        Self {
            provider,
            max_age,
            cached: RwLock::new(None),
        }
    }

    /// Current credentials, refreshed from the provider when stale.
    pub async fn get(&self) -> Result<Credentials, CredentialsError> {
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref().filter(|e| self.is_fresh(e)) {
                return Ok(entry.credentials.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some(entry) = cached.as_ref().filter(|e| self.is_fresh(e)) {
            return Ok(entry.credentials.clone());
        }

        let credentials = self.provider.provide_credentials().await?;
        debug!(expiry = ?credentials.expiry(), "refreshed signing credentials");
        *cached = Some(CachedCredentials {
            credentials: credentials.clone(),
            fetched_at: Instant::now(),
        });
        Ok(credentials)
    }

    /// Drop the cached credentials so the next call resolves new ones.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }

    fn is_fresh(&self, entry: &CachedCredentials) -> bool {
        if entry.fetched_at.elapsed() >= self.max_age {
            return false;
        }
        match entry.credentials.expiry() {
            Some(expiry) => expiry > SystemTime::now() + EXPIRY_BUFFER,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::provider::future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        lifetime: Option<Duration>,
    }

    impl ProvideCredentials for CountingProvider {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let expiry = self.lifetime.map(|l| SystemTime::now() + l);
            future::ProvideCredentials::ready(Ok(Credentials::new(
                format!("AKID{}", n),
                "secret",
                None,
                expiry,
                "counting",
            )))
        }
    }

    fn cache(max_age: Duration, lifetime: Option<Duration>) -> (CredentialCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = SharedCredentialsProvider::new(CountingProvider {
            calls: calls.clone(),
            lifetime,
        });
        (CredentialCache::new(provider, max_age), calls)
    }

    #[tokio::test]
    async fn test_reuses_credentials_within_window() {
        let (cache, calls) = cache(Duration::from_secs(300), None);
        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();
        assert_eq!(first.access_key_id(), second.access_key_id());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_after_window() {
        let (cache, calls) = cache(Duration::from_millis(20), None);
        cache.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let refreshed = cache.get().await.unwrap();
        assert_eq!(refreshed.access_key_id(), "AKID1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refreshes_credentials_near_expiry() {
        let (cache, calls) = cache(Duration::from_secs(300), Some(Duration::from_secs(10)));
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (cache, calls) = cache(Duration::from_secs(300), Some(Duration::from_secs(3600)));
        cache.get().await.unwrap();
        cache.invalidate().await;
        cache.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
