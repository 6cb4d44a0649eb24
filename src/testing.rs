//! A scripted stand-in for the browser, shared by unit tests.
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::browser::{Browser, BrowserFactory};
use crate::error::{Error, Result};

/// What the next capture does. Captures beyond the script succeed.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Succeed,
    /// Fails with a navigation error.
    Fail(&'static str),
    /// Never finishes.
    Hang,
    /// Fails and leaves the browser unhealthy.
    Crash,
    /// Succeeds after a pause.
    Slow(Duration),
}

#[derive(Default)]
struct Shared {
    steps: Mutex<VecDeque<Step>>,
    launched: AtomicU64,
    closed: AtomicU64,
    captures: AtomicU64,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Handle for steering and inspecting a `ScriptedFactory`.
#[derive(Clone)]
pub(crate) struct Script(Arc<Shared>);

impl Script {
    pub(crate) fn push(&self, step: Step) {
        self.0.steps.lock().unwrap().push_back(step);
    }

    pub(crate) fn launched(&self) -> u64 {
        self.0.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> u64 {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn captures(&self) -> u64 {
        self.0.captures.load(Ordering::SeqCst)
    }

    /// Most captures that were ever running at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.0.peak.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedFactory(Arc<Shared>);

impl ScriptedFactory {
    pub(crate) fn new() -> (Self, Script) {
        let shared = Arc::new(Shared::default());
        (Self(shared.clone()), Script(shared))
    }
}

#[async_trait]
impl BrowserFactory for ScriptedFactory {
    async fn launch(&self) -> Result<Box<dyn Browser>> {
        self.0.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBrowser {
            shared: self.0.clone(),
            healthy: true,
        }))
    }
}

struct ScriptedBrowser {
    shared: Arc<Shared>,
    healthy: bool,
}

struct Running<'a>(&'a Shared);

impl<'a> Running<'a> {
    fn start(shared: &'a Shared) -> Self {
        let now = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn capture(&mut self, _url: &Url, out: &Path) -> Result<()> {
        self.shared.captures.fetch_add(1, Ordering::SeqCst);
        let step = self
            .shared
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);
        let _running = Running::start(&self.shared);

        match step {
            Step::Succeed => {},
            Step::Fail(msg) => return Err(Error::RenderFailure(msg.into())),
            Step::Hang => std::future::pending::<()>().await,
            Step::Crash => {
                self.healthy = false;
                return Err(Error::RenderFailure("browser crashed".into()));
            },
            Step::Slow(pause) => tokio::time::sleep(pause).await,
        }

        tokio::fs::write(out, b"\x89PNG\r\n\x1a\nscripted").await?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    async fn close(self: Box<Self>) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
