//! skypush: push notifications from the ATProto firehose
//!
//! Subcommands:
//! - `serve` (default): stream the firehose, deliver notifications, serve the API
//! - `compact`: rewrite the store logs down to their live entries

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use skypush_atproto::{FirehoseClient, FirehoseConfig, firehose::DEFAULT_RELAY_URL};
use skypush_relay::{DEFAULT_PUSH_URL, ExpoPushSender, Relay, RelayConfig, create_router};
use skypush_store::ReplayMode;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "skypush=info,skypush_relay=info,skypush_atproto=info,skypush_store=info";

/// Parse boolean from environment variable, accepting common truthy values.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "skypush")]
#[command(about = "Push notifications from the ATProto firehose", long_about = None)]
struct Cli {
    /// Directory holding the store logs
    #[arg(long, env = "SKYPUSH_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Skip malformed store lines on startup instead of refusing to start
    #[arg(
        long,
        env = "SKYPUSH_LENIENT_STORE",
        value_parser = parse_bool_env,
        default_value = "false",
        global = true
    )]
    lenient_store: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the firehose and serve the API (the default)
    Serve,

    /// Rewrite the store logs so they hold only live entries
    Compact,
}

#[derive(Args)]
struct ServeArgs {
    /// Firehose relay WebSocket URL
    #[arg(long, env = "SKYPUSH_RELAY", default_value = DEFAULT_RELAY_URL, global = true)]
    relay: String,

    /// HTTP listen address
    #[arg(long, env = "SKYPUSH_LISTEN", default_value = "0.0.0.0:3000", global = true)]
    listen: SocketAddr,

    /// HTTP port, overriding the port of --listen
    #[arg(long, env = "SKYPUSH_PORT", global = true)]
    port: Option<u16>,

    /// Push service endpoint
    #[arg(long, env = "SKYPUSH_PUSH_URL", default_value = DEFAULT_PUSH_URL, global = true)]
    push_url: String,

    /// Bearer credential for the push service
    #[arg(long, env = "SKYPUSH_PUSH_ACCESS_TOKEN", hide_env_values = true, global = true)]
    push_access_token: Option<String>,

    /// Notification flush interval in milliseconds
    #[arg(long, env = "SKYPUSH_FLUSH_INTERVAL_MS", default_value = "1000", global = true)]
    flush_interval_ms: u64,

    /// Reconnect when no firehose message arrives for this many seconds
    #[arg(long, env = "SKYPUSH_WATCHDOG_SECS", default_value = "10", global = true)]
    watchdog_secs: u64,

    /// Seconds to wait before reconnecting to the firehose
    #[arg(long, env = "SKYPUSH_RECONNECT_DELAY_SECS", default_value = "2", global = true)]
    reconnect_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = RelayConfig::new(&cli.data_dir);
    if cli.lenient_store {
        config.replay = ReplayMode::Lenient;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, cli.serve).await,
        Commands::Compact => compact(&config),
    }
}

async fn serve(config: RelayConfig, args: ServeArgs) -> Result<()> {
    let sender = ExpoPushSender::new(args.push_url.clone(), args.push_access_token)
        .into_diagnostic()
        .wrap_err("failed to build push client")?;

    let firehose = Arc::new(FirehoseClient::new(FirehoseConfig {
        url: args.relay.clone(),
        watchdog: Duration::from_secs(args.watchdog_secs),
        reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
    }));

    let relay = Relay::open(&config, Arc::new(sender))
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to open stores in {}", config.data_dir.display()))?
        .with_firehose(firehose.monitor());
    let relay = Arc::new(relay);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    let firehose_task = tokio::spawn({
        let firehose = Arc::clone(&firehose);
        let shutdown = shutdown_rx.clone();
        async move { firehose.run(commit_tx, shutdown).await }
    });

    let pipeline_task = tokio::spawn({
        let relay = Arc::clone(&relay);
        let shutdown = shutdown_rx.clone();
        async move { relay.run_pipeline(commit_rx, shutdown).await }
    });

    let flush_task = tokio::spawn({
        let queue = Arc::clone(relay.queue());
        let period = Duration::from_millis(args.flush_interval_ms);
        let shutdown = shutdown_rx.clone();
        async move { queue.run(period, shutdown).await }
    });

    let mut addr = args.listen;
    if let Some(port) = args.port {
        addr.set_port(port);
    }
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| miette::miette!("failed to bind {}: {}", addr, e))?;

    info!(
        listen = %addr,
        relay = %args.relay,
        push = %args.push_url,
        data_dir = %config.data_dir.display(),
        "skypush started"
    );

    axum::serve(listener, create_router(Arc::clone(&relay)))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    for (name, task) in [
        ("firehose", firehose_task),
        ("pipeline", pipeline_task),
        ("flush", flush_task),
    ] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }

    for store in [relay.registrations(), relay.quotes().store()] {
        if let Err(e) = store.sync() {
            warn!(path = %store.path().display(), error = %e, "failed to sync store");
        }
    }

    info!("skypush stopped");
    Ok(())
}

fn compact(config: &RelayConfig) -> Result<()> {
    for path in [config.registrations_path(), config.quotes_path()] {
        let store = config
            .open_store(path.clone())
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;
        let before = store.file_size().into_diagnostic()?;
        let lines = store
            .compact()
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to compact {}", path.display()))?;
        let after = store.file_size().into_diagnostic()?;
        info!(
            path = %path.display(),
            lines,
            before_bytes = before,
            after_bytes = after,
            "store compacted"
        );
    }
    Ok(())
}
