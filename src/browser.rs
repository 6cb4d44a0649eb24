//! The render capability, treated as a black box: navigate to a URL, let the
//! network settle, write a full-page PNG, report how it went.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

/// One heavyweight render-capable instance.
#[async_trait]
pub trait Browser: Send {
    /// Renders `url` and writes the screenshot to `out`.
    async fn capture(&mut self, url: &Url, out: &Path) -> Result<()>;

    /// False once the instance can't be trusted with another render.
    fn is_healthy(&self) -> bool;

    /// Flags the instance as damaged, e.g. after a render was cancelled.
    fn mark_unhealthy(&mut self);

    /// Releases whatever the instance holds.
    async fn close(self: Box<Self>);
}

/// Creates browsers for the pool.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>>;
}

/// Settings for driving a local headless Chromium.
#[derive(Clone, Debug)]
pub struct ChromiumOptions {
    pub executable: PathBuf,
    pub width: u32,
    /// Height of the window, and so of every screenshot. Headless Chromium
    /// captures only what fits in the window; longer pages are cut off at
    /// this height and shorter ones padded out to it.
    pub height: u32,
    /// Virtual time the page is given to finish loading before capture.
    pub settle_time: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromium"),
            width: 1280,
            height: 4096,
            settle_time: Duration::from_secs(5),
        }
    }
}

pub struct ChromiumFactory {
    options: ChromiumOptions,
}

impl ChromiumFactory {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrowserFactory for ChromiumFactory {
    async fn launch(&self) -> Result<Box<dyn Browser>> {
        // Each instance gets a profile of its own so concurrent renders don't
        // fight over the same user data directory.
        let profile = tempfile::Builder::new()
            .prefix("shutter-chromium-")
            .tempdir()?;

        debug!(profile = %profile.path().display(), "launched chromium slot");

        Ok(Box::new(Chromium {
            options: self.options.clone(),
            profile: Some(profile),
            healthy: true,
        }))
    }
}

/// A Chromium slot. Each capture runs a headless process against the slot's
/// profile; the process is killed if the capture future is dropped.
pub struct Chromium {
    options: ChromiumOptions,
    profile: Option<TempDir>,
    healthy: bool,
}

impl Chromium {
    fn command(&self, url: &Url, out: &Path, profile: &Path) -> Command {
        let mut cmd = Command::new(&self.options.executable);
        cmd.arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg(format!(
                "--window-size={},{}",
                self.options.width, self.options.height
            ))
            .arg(format!(
                "--virtual-time-budget={}",
                self.options.settle_time.as_millis()
            ))
            .arg(format!("--screenshot={}", out.display()))
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Browser for Chromium {
    async fn capture(&mut self, url: &Url, out: &Path) -> Result<()> {
        let Some(profile) = self.profile.as_ref() else {
            return Err(Error::RenderFailure("browser already closed".into()));
        };

        let child = match self.command(url, out, profile.path()).spawn() {
            Ok(child) => child,
            Err(error) => {
                // Nothing to retry against if the binary can't start.
                self.healthy = false;
                return Err(Error::RenderFailure(format!(
                    "launching {}: {error}",
                    self.options.executable.display()
                )));
            },
        };

        let output = child.wait_with_output().await.map_err(|error| {
            self.healthy = false;
            Error::RenderFailure(format!("waiting for chromium: {error}"))
        })?;

        trace!(%url, status = %output.status, "chromium exited");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or_default().trim();
            // Killed by a signal: the slot is suspect.
            if output.status.code().is_none() {
                self.healthy = false;
            }
            return Err(Error::RenderFailure(format!(
                "chromium exited with {}: {last}",
                output.status
            )));
        }

        match tokio::fs::metadata(out).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(Error::RenderFailure(
                "chromium exited cleanly but wrote no screenshot".into(),
            )),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.profile.is_some()
    }

    fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if let Some(profile) = this.profile.take() {
            let path = profile.path().to_owned();
            if let Err(error) = profile.close() {
                let path = path.display();
                warn!(%error, path = %path, "failed to remove profile");
            }
        }
    }
}
