mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shutter_queue::server::serve_conn;
use shutter_queue::{ChromiumFactory, Engine, Error};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter(LevelFilter::TRACE))
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter(LevelFilter::INFO))
            .init();
    }

    let factory = ChromiumFactory::new(args.chromium_options());
    let engine = match Engine::start(args.engine_config(), Box::new(factory))
        .await
    {
        Ok(engine) => Arc::new(engine),
        Err(error @ Error::Config(_)) => {
            error!(%error, "unsupported configuration");
            return ExitCode::from(2);
        },
        Err(error) => {
            error!(%error, "failed to start engine");
            return ExitCode::FAILURE;
        },
    };

    // Cancellation fires on ctrl-c or when a client asks us to drain.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let drain = engine.drain_requested();
        tokio::spawn(async move {
            select! {
                x = signal::ctrl_c() => if let Err(error) = x {
                    warn!(%error, "something strange with ctrl-c handling!");
                },
                _ = drain.cancelled() => {},
            }
            cancel.cancel();
        });
    }

    // Every connection task holds a sender; once they've all gone the
    // receiver sees the channel close.
    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) =
        begin(&args, engine.clone(), cancel, shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    shutdown_wait.recv().await;

    info!("waiting for in-flight renders");
    engine.shutdown().await;

    exit_code
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

async fn begin(
    args: &Args,
    engine: Arc<Engine>,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle each
    // connection as its own task.
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            engine.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    engine: Arc<Engine>,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let ret = serve_conn(&engine, cancel, &mut conn).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    Ok(ret?)
}
