pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod server;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;

#[cfg(test)]
mod testing;

pub use crate::browser::{
    Browser, BrowserFactory, ChromiumFactory, ChromiumOptions,
};
pub use crate::config::EngineConfig;
pub use crate::engine::{Engine, EngineStats};
pub use crate::error::{Error, Result};
pub use crate::types::job::{Job, JobEvent, JobId};
pub use crate::types::states::JobStatus;
