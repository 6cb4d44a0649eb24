//! A fixed-size pool of browsers, each checked out by one worker at a time.
//!
//! Checkout hands back a `PooledBrowser` guard. However the guard goes away
//! (explicit release, early return, a cancelled render) the browser is health
//! checked and either returned to the pool or thrown away, with a
//! replacement launched lazily on a later checkout.
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{Browser, BrowserFactory};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PoolStats {
    /// number of browser slots
    #[serde(rename = "pool-size")]
    pub size: u64,
    /// launched browsers waiting for work
    #[serde(rename = "pool-idle")]
    pub idle: u64,
    /// browsers checked out by workers
    #[serde(rename = "pool-in-use")]
    pub in_use: u64,
    /// cumulative count of browsers launched
    #[serde(rename = "pool-launched")]
    pub launched: u64,
    /// cumulative count of browsers thrown away as unhealthy
    #[serde(rename = "pool-discarded")]
    pub discarded: u64,
}

struct Inner {
    factory: Box<dyn BrowserFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Browser>>>,
    size: usize,
    launched: AtomicU64,
    discarded: AtomicU64,
}

impl Inner {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn Browser>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn launch(&self) -> Result<Box<dyn Browser>> {
        let browser = self.factory.launch().await.map_err(|error| {
            Error::RenderFailure(format!("launching browser: {error}"))
        })?;
        self.launched.fetch_add(1, Ordering::Relaxed);
        Ok(browser)
    }

    /// Returns a healthy browser to the idle list, or disposes of it.
    fn put_back(&self, browser: Box<dyn Browser>) {
        if browser.is_healthy() {
            self.idle().push(browser);
            return;
        }

        self.discarded.fetch_add(1, Ordering::Relaxed);
        warn!("discarding unhealthy browser");
        // Closing is async; without a runtime the browser's own drop has to
        // do.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(browser.close());
        }
    }
}

#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<Inner>,
}

impl ResourcePool {
    pub fn new(factory: Box<dyn BrowserFactory>, size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                size,
                launched: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Launches browsers until every slot has one.
    pub async fn warm_up(&self) -> Result<()> {
        let missing = self.inner.size.saturating_sub(self.inner.idle().len());
        for _ in 0..missing {
            let browser = self.inner.launch().await?;
            self.inner.idle().push(browser);
        }
        info!(size = self.inner.size, "browser pool ready");
        Ok(())
    }

    /// Checks out a browser, waiting up to `wait` for one to come free.
    pub async fn acquire(&self, wait: Duration) -> Result<PooledBrowser> {
        let permit =
            match timeout(wait, self.inner.permits.clone().acquire_owned())
                .await
            {
                Err(_) => return Err(Error::ResourceExhausted(wait)),
                Ok(Err(_)) => return Err(Error::ShuttingDown),
                Ok(Ok(permit)) => permit,
            };

        // Idle browsers were healthy when they came back, but may have
        // degraded since.
        let browser = loop {
            let candidate = self.inner.idle().pop();
            match candidate {
                Some(b) if b.is_healthy() => break Some(b),
                Some(b) => self.inner.put_back(b),
                None => break None,
            }
        };

        let browser = match browser {
            Some(b) => b,
            None => {
                debug!("launching replacement browser");
                self.inner.launch().await?
            },
        };

        Ok(PooledBrowser {
            browser: Some(browser),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Waits for every checked-out browser to come back, then closes them
    /// all. Later checkouts fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let size = u32::try_from(self.inner.size).unwrap_or(u32::MAX);
        let drained = self.inner.permits.acquire_many(size).await;
        self.inner.permits.close();
        drop(drained);

        let browsers: Vec<_> = self.inner.idle().drain(..).collect();
        let n = browsers.len();
        for browser in browsers {
            browser.close().await;
        }
        info!(closed = n, "browser pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let in_use = self
            .inner
            .size
            .saturating_sub(self.inner.permits.available_permits());
        PoolStats {
            size: self.inner.size as u64,
            idle: self.inner.idle().len() as u64,
            in_use: in_use as u64,
            launched: self.inner.launched.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out browser. Dropping it returns it to the pool.
pub struct PooledBrowser {
    browser: Option<Box<dyn Browser>>,
    pool: Arc<Inner>,
    // Released after the browser is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl PooledBrowser {
    pub async fn capture(&mut self, url: &Url, out: &Path) -> Result<()> {
        match self.browser.as_mut() {
            Some(browser) => browser.capture(url, out).await,
            None => {
                Err(Error::RenderFailure("browser already released".into()))
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.browser.as_ref().is_some_and(|b| b.is_healthy())
    }

    pub fn mark_unhealthy(&mut self) {
        if let Some(browser) = self.browser.as_mut() {
            browser.mark_unhealthy();
        }
    }

    /// Returns the browser to the pool, closing it first if it's unhealthy.
    pub async fn release(mut self) {
        if let Some(browser) = self.browser.take() {
            if browser.is_healthy() {
                self.pool.idle().push(browser);
            } else {
                self.pool.discarded.fetch_add(1, Ordering::Relaxed);
                warn!("closing unhealthy browser");
                browser.close().await;
            }
        }
    }
}

impl fmt::Debug for PooledBrowser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBrowser")
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl Drop for PooledBrowser {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            self.pool.put_back(browser);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedFactory, Step};

    const WAIT: Duration = Duration::from_secs(2);

    fn pool(size: usize) -> (ResourcePool, Script) {
        let (factory, script) = ScriptedFactory::new();
        (ResourcePool::new(Box::new(factory), size), script)
    }

    #[tokio::test]
    async fn test_warm_up_launches_every_slot() {
        let (pool, script) = pool(3);
        pool.warm_up().await.unwrap();
        assert_eq!(script.launched(), 3);
        assert_eq!(pool.stats().idle, 3);

        let a = pool.acquire(WAIT).await.unwrap();
        let b = pool.acquire(WAIT).await.unwrap();
        assert_eq!(pool.stats().in_use, 2);
        // Reused, not relaunched.
        assert_eq!(script.launched(), 3);
        a.release().await;
        drop(b);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (pool, _) = pool(1);
        let _held = pool.acquire(WAIT).await.unwrap();

        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (pool, _) = pool(1);
        let held = pool.acquire(WAIT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(WAIT).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_browser_is_never_handed_out_again() {
        let (pool, script) = pool(1);
        pool.warm_up().await.unwrap();

        let mut first = pool.acquire(WAIT).await.unwrap();
        first.mark_unhealthy();
        drop(first);
        assert_eq!(pool.stats().idle, 0);

        let second = pool.acquire(WAIT).await.unwrap();
        assert!(second.is_healthy());
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(script.launched(), 2);
    }

    #[tokio::test]
    async fn test_crashed_render_replaces_browser() {
        let (pool, script) = pool(1);
        script.push(Step::Crash);

        let mut b = pool.acquire(WAIT).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("1.png");
        assert!(b
            .capture(&"https://example.com".parse().unwrap(), &out)
            .await
            .is_err());
        assert!(!b.is_healthy());
        b.release().await;
        assert_eq!(script.closed(), 1);

        let b = pool.acquire(WAIT).await.unwrap();
        assert!(b.is_healthy());
        assert_eq!(script.launched(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_render_still_returns_browser() {
        let (pool, script) = pool(1);
        script.push(Step::Hang);

        {
            let mut b = pool.acquire(WAIT).await.unwrap();
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("1.png");
            let url = "https://example.com".parse().unwrap();
            let res =
                timeout(Duration::from_millis(20), b.capture(&url, &out)).await;
            assert!(res.is_err());
        }

        assert_eq!(pool.stats().in_use, 0);
        let _again = pool.acquire(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight() {
        let (pool, script) = pool(2);
        pool.warm_up().await.unwrap();
        let held = pool.acquire(WAIT).await.unwrap();

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        drop(held);
        shutdown.await.unwrap();
        assert_eq!(script.closed(), 2);
        assert!(matches!(
            pool.acquire(WAIT).await,
            Err(Error::ShuttingDown)
        ));
    }
}
