use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_agent::{ClaudeCliBackend, Dispatcher, ExecutionBackend, TextExtractor};
use relay_core::RelayConfig;
use relay_telegram::adapter::bot_from_config;
use relay_telegram::{TelegramAdapter, TelegramTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod http;

#[derive(Parser)]
#[command(name = "relay-gateway")]
#[command(about = "Relay Telegram messages to a coding agent CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (overrides RELAY_CONFIG and ~/.relay/relay.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_gateway=info,relay_agent=info,relay_telegram=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref())?;
    if cli.check_config {
        println!("configuration OK\n{config:#?}");
        return Ok(());
    }

    if which::which(&config.backend.command).is_err() {
        warn!(
            command = %config.backend.command,
            "backend CLI not found on PATH; requests will fail until it is installed"
        );
    }
    let backend: Arc<dyn ExecutionBackend> = Arc::new(ClaudeCliBackend::from_config(&config.backend)?);
    let extractor = Arc::new(TextExtractor::new(config.files.max_extracted_chars));

    let bot = bot_from_config(&config.telegram)?;
    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let dispatcher = Arc::new(Dispatcher::new(&config, transport, backend, extractor)?);

    let shutdown = CancellationToken::new();

    if config.gateway.health_enabled {
        let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
        let router = app::build_router(Arc::new(app::AppState {
            dispatcher: Arc::clone(&dispatcher),
        }));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "health endpoint listening");
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "health server failed");
            }
        });
    }

    let adapter = TelegramAdapter::new(bot, &config.telegram, Arc::clone(&dispatcher));
    let polling = tokio::spawn(adapter.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    dispatcher.shutdown();
    shutdown.cancel();

    let budget = Duration::from_secs(config.gateway.shutdown_timeout_secs);
    let drained = tokio::time::timeout(budget, async {
        while dispatcher.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            in_flight = dispatcher.in_flight(),
            "shutdown timeout reached with dispatches still running"
        );
    }

    if let Err(e) = polling.await {
        warn!(error = %e, "polling task ended abnormally");
    }
    info!("relay gateway stopped");
    Ok(())
}
