//! Signaling relay binary entry point
//!
//! Accepts WebSocket connections from broadcasters and viewers and routes
//! their signaling messages.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:3000)
//! cargo run -p livecast-relay-server
//!
//! # Custom address and outbound queue bound
//! cargo run -p livecast-relay-server -- \
//!   --address 127.0.0.1:4000 \
//!   --outbound-queue 512
//! ```

use anyhow::Context;
use clap::Parser;
use livecast_signaling::{RelayConfig, RelayServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Livecast signaling relay
///
/// Routes join, start, offer, answer and candidate messages between the
/// broadcaster of a live and its viewers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listener address (host:port)
    #[arg(long, default_value = "0.0.0.0:3000", env = "LIVECAST_RELAY_ADDRESS")]
    address: String,

    /// Per-connection outbound queue bound
    #[arg(long, default_value_t = 256, env = "LIVECAST_RELAY_QUEUE")]
    outbound_queue: usize,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "LIVECAST_LOG_JSON")]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down relay...");

        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("failed to install Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %args.address,
        outbound_queue = args.outbound_queue,
        "Livecast signaling relay starting"
    );

    let config = RelayConfig {
        outbound_queue: args.outbound_queue,
        ..RelayConfig::default().with_bind_address(args.address)
    };

    let handle = RelayServer::new(config)
        .context("invalid relay configuration")?
        .start()
        .await
        .context("failed to start relay")?;

    info!(url = %handle.url(), "Relay ready");

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, stopping relay...");
    handle.shutdown().await;
    info!("Relay shut down gracefully");

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    // RUST_LOG overrides the default level
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
