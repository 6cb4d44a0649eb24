use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shutter_queue::{
    Browser, BrowserFactory, Engine, EngineConfig, Error, Job, JobId, JobStatus,
    Result,
};
use url::Url;

/// How every browser from a `FakeFactory` behaves.
#[derive(Clone, Copy)]
enum Mode {
    Succeed,
    /// Never finishes a capture.
    Hang,
    /// The first capture made by any browser fails; the rest succeed.
    FailFirst,
}

#[derive(Clone)]
struct FakeFactory {
    mode: Mode,
    captures: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            captures: Arc::default(),
        }
    }
}

#[async_trait]
impl BrowserFactory for FakeFactory {
    async fn launch(&self) -> Result<Box<dyn Browser>> {
        Ok(Box::new(FakeBrowser {
            factory: self.clone(),
            healthy: true,
        }))
    }
}

struct FakeBrowser {
    factory: FakeFactory,
    healthy: bool,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn capture(&mut self, _url: &Url, out: &Path) -> Result<()> {
        let n = self.factory.captures.fetch_add(1, Ordering::SeqCst);

        match self.factory.mode {
            Mode::Succeed => {},
            Mode::Hang => std::future::pending::<()>().await,
            Mode::FailFirst if n == 0 => {
                let error = "net::ERR_CONNECTION_RESET".to_owned();
                return Err(Error::RenderFailure(error));
            },
            Mode::FailFirst => {},
        }

        tokio::fs::write(out, b"\x89PNG\r\n\x1a\nfake").await?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    async fn close(self: Box<Self>) {}
}

fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        max_attempts: 2,
        retry_delay: Duration::from_millis(20),
        render_timeout: Duration::from_millis(200),
        acquire_timeout: Duration::from_millis(500),
        lease_timeout: Duration::from_secs(5),
        dequeue_wait: Duration::from_millis(20),
        workers: 2,
        pool_size: 2,
        storage_root: root.join("shots"),
        journal_dir: None,
    }
}

async fn start(config: EngineConfig, mode: Mode) -> Engine {
    Engine::start(config, Box::new(FakeFactory::new(mode)))
        .await
        .unwrap()
}

/// Polls until the job reaches a terminal state.
async fn settled(engine: &Engine, id: JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = engine.get(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never settled")
}

#[tokio::test]
async fn test_successful_capture() {
    let root = tempfile::tempdir().unwrap();
    let engine = start(config(root.path()), Mode::Succeed).await;

    let id = engine.enqueue("https://example.com").unwrap();
    let job = settled(&engine, id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.is_none());

    let artifact = engine.artifact_path(id);
    let expected = root.path().join("shots").join(format!("{id}.png"));
    assert_eq!(artifact, expected);
    assert!(tokio::fs::metadata(&artifact).await.unwrap().len() > 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_malformed_url_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let engine = start(config(root.path()), Mode::Succeed).await;

    for bad in ["not-a-url", "", "ftp://example.com/file", "/relative/path"] {
        assert!(
            matches!(engine.enqueue(bad), Err(Error::InvalidInput(_))),
            "{bad:?} was admitted"
        );
    }

    let stats = engine.stats();
    assert_eq!(stats.jobs.pending, 0);
    assert_eq!(stats.queue.ready, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_timeouts_exhaust_attempts() {
    let root = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new(Mode::Hang);
    let captures = factory.captures.clone();
    let engine = Engine::start(config(root.path()), Box::new(factory))
        .await
        .unwrap();

    let id = engine.enqueue("https://slow.example.com").unwrap();
    let job = settled(&engine, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("timed out"));
    assert_eq!(captures.load(Ordering::SeqCst), 2);
    assert!(!engine.artifact_path(id).exists());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let root = tempfile::tempdir().unwrap();
    let engine = start(config(root.path()), Mode::FailFirst).await;

    let id = engine.enqueue("https://flaky.example.com").unwrap();
    let job = settled(&engine, id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert!(engine.artifact_path(id).exists());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_many_jobs_each_complete_once() {
    let root = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new(Mode::Succeed);
    let captures = factory.captures.clone();
    let engine = Engine::start(config(root.path()), Box::new(factory))
        .await
        .unwrap();

    let ids: Vec<_> = (0..20)
        .map(|n| engine.enqueue(&format!("https://example.com/{n}")).unwrap())
        .collect();

    for &id in &ids {
        let job = settled(&engine, id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }
    assert_eq!(captures.load(Ordering::SeqCst), ids.len());
    assert_eq!(engine.stats().jobs.completed, ids.len() as u64);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_drain_refuses_new_jobs() {
    let root = tempfile::tempdir().unwrap();
    let engine = start(config(root.path()), Mode::Succeed).await;

    assert!(engine.drain());
    assert!(!engine.drain());
    assert!(matches!(
        engine.enqueue("https://example.com"),
        Err(Error::ShuttingDown)
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_journal_survives_restart() {
    let root = tempfile::tempdir().unwrap();
    let journal = root.path().join("wal");

    // First run: the only attempt so far times out, and the retry is still
    // waiting out its delay when the engine stops.
    let first = EngineConfig {
        journal_dir: Some(journal.clone()),
        retry_delay: Duration::from_secs(60),
        workers: 1,
        pool_size: 1,
        ..config(root.path())
    };
    let engine = start(first.clone(), Mode::Hang).await;
    let id = engine.enqueue("https://example.com/restart").unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.get(id).unwrap().attempts == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.shutdown().await;
    drop(engine);

    // Second run picks the job up again, with its attempt history intact.
    let second = EngineConfig {
        retry_delay: Duration::from_millis(20),
        ..first
    };
    let engine = start(second, Mode::Succeed).await;

    let job = settled(&engine, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert!(engine.artifact_path(id).exists());

    // Ids keep counting from where the last run left off.
    let next = engine.enqueue("https://example.com/next").unwrap();
    assert!(next > id);

    engine.shutdown().await;
}
