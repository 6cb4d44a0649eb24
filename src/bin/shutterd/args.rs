use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shutter_queue::{ChromiumOptions, EngineConfig};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub(crate) port: u16,
    /// Number of concurrent render workers.
    #[arg(short, long, default_value_t = 4)]
    pub(crate) workers: usize,
    /// Number of browser instances. Defaults to one per worker.
    #[arg(long)]
    pub(crate) pool_size: Option<usize>,
    /// Attempts each job gets before it's marked failed.
    #[arg(short = 'a', long, default_value_t = 2)]
    pub(crate) max_attempts: u32,
    /// Seconds before a transiently failed job is tried again.
    #[arg(long, default_value_t = 5)]
    pub(crate) retry_delay_secs: u64,
    /// Seconds a single render may take.
    #[arg(long, default_value_t = 30)]
    pub(crate) render_timeout_secs: u64,
    /// Seconds a worker may wait for a free browser.
    #[arg(long, default_value_t = 60)]
    pub(crate) acquire_timeout_secs: u64,
    /// Seconds a dequeued job stays claimed before it's redelivered.
    #[arg(long, default_value_t = 120)]
    pub(crate) lease_timeout_secs: u64,
    /// Directory screenshots are written to.
    #[arg(short = 's', long, default_value = "screenshots")]
    pub(crate) storage_root: PathBuf,
    /// Enables the job journal and sets the directory to keep it in.
    #[arg(short = 'b', long)]
    pub(crate) wal_dir: Option<PathBuf>,
    /// Chromium (or Chrome) executable to render with.
    #[arg(long, default_value = "chromium")]
    pub(crate) chromium: PathBuf,
    /// Viewport width in pixels.
    #[arg(long, default_value_t = 1280)]
    pub(crate) width: u32,
    /// Screenshot height in pixels. Longer pages are cut off.
    #[arg(long, default_value_t = 4096)]
    pub(crate) height: u32,
    /// Seconds a page is given to settle before it's captured.
    #[arg(long, default_value_t = 5)]
    pub(crate) settle_secs: u64,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            render_timeout: Duration::from_secs(self.render_timeout_secs),
            workers: self.workers,
            pool_size: self.pool_size.unwrap_or(self.workers),
            lease_timeout: Duration::from_secs(self.lease_timeout_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            storage_root: self.storage_root.clone(),
            journal_dir: self.wal_dir.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn chromium_options(&self) -> ChromiumOptions {
        ChromiumOptions {
            executable: self.chromium.clone(),
            width: self.width,
            height: self.height,
            settle_time: Duration::from_secs(self.settle_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_make_a_valid_config() {
        let args = Args::parse_from(["shutterd"]);
        let config = args.engine_config();

        assert_eq!(config.pool_size, config.workers);
        assert_eq!(config.max_attempts, 2);
        assert!(config.journal_dir.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_pool_size_override() {
        let args = Args::parse_from([
            "shutterd", "-w", "2", "--pool-size", "3", "-b", "/var/lib/shutter",
        ]);
        let config = args.engine_config();

        assert_eq!(config.workers, 2);
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.journal_dir, Some(PathBuf::from("/var/lib/shutter")));
    }
}
