use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use lib_common::core::{ChannelRegistry, Orchestrator};
use lib_common::delivery::chat_summarizer::{ChatCompletionSummarizer, DEFAULT_MODEL, DEFAULT_SUMMARIZER_URL};
use lib_common::delivery::telegram_bot::{BotApiSink, DEFAULT_BOT_API_URL};
use lib_common::delivery::DeliveryPipeline;
use lib_common::ingestors::{HandlerChain, LogEcho};
use lib_common::loggers;
use lib_common::upstream::bridge::BridgeTransport;
use lib_common::upstream::UpstreamTransport;

mod chanrelay_logic;
use chanrelay_logic::config;

const APP_NAME: &str = "server_chanrelay";

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Could not install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    loggers::setup_logging(&log_dir, &log_level, APP_NAME)?;

    let channels = config.validate()?;
    let settings = config.pipeline_settings();
    log::info!(
        "Starting {} for {} channels (poll {}s, batch {}s)",
        APP_NAME,
        channels.len(),
        settings.poll_interval.as_secs(),
        settings.batch_window.as_secs()
    );

    // --- Upstream ---
    let bridge = Arc::new(
        BridgeTransport::connect(config.bridge_config())
            .await
            .context("Failed to connect to the upstream gateway")?,
    );
    let transport: Arc<dyn UpstreamTransport> = bridge.clone();

    let registry = Arc::new(ChannelRegistry::new());
    let registered = registry.register_all(&channels, bridge.as_ref(), bridge.as_ref()).await;
    log::info!("Monitoring {} of {} configured channels", registered.len(), channels.len());
    if registered.is_empty() {
        log::warn!("No channel could be registered; nothing will be relayed until the process restarts");
    }

    // --- Delivery ---
    let targets = config.targets();
    if targets.is_empty() {
        log::warn!("No delivery targets configured (BOT_CHAT_ID / BOT_CHANNEL_ID); batches will not be relayed");
    }
    let sink = Arc::new(BotApiSink::new(
        config.bot_api_url.as_deref().unwrap_or(DEFAULT_BOT_API_URL),
        config.bot_token.as_deref().unwrap_or_default(),
    )?);
    let mut pipeline = DeliveryPipeline::new(sink, targets);
    match &config.summarizer_api_key {
        Some(key) if !key.trim().is_empty() => {
            let summarizer = ChatCompletionSummarizer::new(
                config.summarizer_url.as_deref().unwrap_or(DEFAULT_SUMMARIZER_URL),
                key.clone(),
                config.summarizer_model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                config.summarizer_timeout(),
            )?;
            pipeline = pipeline.with_summarizer(Arc::new(summarizer), config.summarizer_timeout());
        }
        _ => log::warn!("No summarizer API key configured; batches are sent without a summary"),
    }
    let pipeline = Arc::new(pipeline);

    if config.send_startup_notice.unwrap_or(true) && !pipeline.targets().is_empty() {
        pipeline.send_startup_notice().await;
    }

    // --- Background loops ---
    let handlers = if log::log_enabled!(log::Level::Debug) {
        HandlerChain::new().with(Arc::new(LogEcho))
    } else {
        HandlerChain::new()
    };
    let mut orchestrator = Orchestrator::new(transport, registry, handlers, pipeline, settings);
    orchestrator.start();
    log::info!("Handler chain: {:?}", orchestrator.chain().names());

    tokio::select! {
        _ = wait_for_signal() => {}
        _ = orchestrator.wait_for_disconnect() => {
            log::warn!("Upstream connection closed permanently");
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
