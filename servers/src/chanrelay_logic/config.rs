use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use lib_common::core::PipelineSettings;
use lib_common::delivery::chat_summarizer::{DEFAULT_MODEL, DEFAULT_SUMMARIZER_URL};
use lib_common::delivery::telegram_bot::DEFAULT_BOT_API_URL;
use lib_common::upstream::bridge::BridgeConfig;
use lib_common::DeliveryTarget;

use super::channels::load_channels_file;

const DEFAULT_CONFIG_FILE: &str = "server_chanrelay.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no channels configured (set --channels, CHANRELAY_CHANNELS or channelsFile)")]
    NoChannels,

    #[error("failed to read channels file {}: {source}", path.display())]
    ChannelsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Channel watch, batching and relay server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CHANRELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CHANRELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CHANRELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CHANRELAY_BRIDGE_HTTP_URL", help = "Base HTTP URL of the upstream gateway.")]
    pub bridge_http_url: Option<String>,

    #[clap(long, env = "CHANRELAY_BRIDGE_WS_URL", help = "WebSocket URL of the upstream gateway push stream.")]
    pub bridge_ws_url: Option<String>,

    #[clap(long, env = "CHANRELAY_BRIDGE_TOKEN", hide_env_values = true, help = "Bearer token for the upstream gateway.")]
    pub bridge_token: Option<String>,

    #[clap(long, env = "CHANRELAY_CHANNELS", value_delimiter = ',', help = "Comma separated channel handles or links to watch.")]
    pub channels: Option<Vec<String>>,

    #[clap(long, env = "CHANRELAY_CHANNELS_FILE", help = "File with one https://t.me/<handle> link per line.")]
    pub channels_file: Option<PathBuf>,

    #[clap(long, env = "CHANRELAY_BOT_API_URL", help = "Base URL of the chat-bot HTTP API.")]
    pub bot_api_url: Option<String>,

    #[clap(long, env = "BOT_TOKEN", hide_env_values = true, help = "Chat-bot token.")]
    pub bot_token: Option<String>,

    #[clap(long, env = "BOT_CHAT_ID", help = "Primary target: personal chat id.")]
    pub bot_chat_id: Option<String>,

    #[clap(long, env = "BOT_CHANNEL_ID", help = "Secondary target: broadcast channel id.")]
    pub bot_channel_id: Option<String>,

    #[clap(long, env = "CHANRELAY_SUMMARIZER_URL", help = "Base URL of the chat-completion API.")]
    pub summarizer_url: Option<String>,

    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true, help = "API key for the summarizer. Summaries are disabled without it.")]
    pub summarizer_api_key: Option<String>,

    #[clap(long, env = "CHANRELAY_SUMMARIZER_MODEL", help = "Model used for batch summaries.")]
    pub summarizer_model: Option<String>,

    #[clap(long, env = "CHANRELAY_SUMMARIZER_TIMEOUT_SECONDS", help = "Upper bound for one summarizer call.")]
    pub summarizer_timeout_seconds: Option<u64>,

    #[clap(long, env = "CHANRELAY_POLLING_INTERVAL_SECONDS", help = "Seconds between reconciliation requests per channel.")]
    pub polling_interval_seconds: Option<u64>,

    #[clap(long, env = "CHANRELAY_POLL_PAGE_LIMIT", help = "Maximum items per reconciliation request.")]
    pub poll_page_limit: Option<u32>,

    #[clap(long, env = "CHANRELAY_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between upstream liveness probes.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "CHANRELAY_BATCH_INTERVAL_SECONDS", help = "Batch window in seconds.")]
    pub batch_interval_seconds: Option<u64>,

    #[clap(long, env = "CHANRELAY_BATCH_CHECK_INTERVAL_SECONDS", help = "How often the batch timer checks the window.")]
    pub batch_check_interval_seconds: Option<u64>,

    #[clap(long, env = "CHANRELAY_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for push stream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "CHANRELAY_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for push stream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "CHANRELAY_SEND_STARTUP_NOTICE", help = "Send a test message to every target at startup.")]
    pub send_startup_notice: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            bridge_http_url: other.bridge_http_url.or(self.bridge_http_url),
            bridge_ws_url: other.bridge_ws_url.or(self.bridge_ws_url),
            bridge_token: other.bridge_token.or(self.bridge_token),
            channels: other.channels.or(self.channels),
            channels_file: other.channels_file.or(self.channels_file),
            bot_api_url: other.bot_api_url.or(self.bot_api_url),
            bot_token: other.bot_token.or(self.bot_token),
            bot_chat_id: other.bot_chat_id.or(self.bot_chat_id),
            bot_channel_id: other.bot_channel_id.or(self.bot_channel_id),
            summarizer_url: other.summarizer_url.or(self.summarizer_url),
            summarizer_api_key: other.summarizer_api_key.or(self.summarizer_api_key),
            summarizer_model: other.summarizer_model.or(self.summarizer_model),
            summarizer_timeout_seconds: other.summarizer_timeout_seconds.or(self.summarizer_timeout_seconds),
            polling_interval_seconds: other.polling_interval_seconds.or(self.polling_interval_seconds),
            poll_page_limit: other.poll_page_limit.or(self.poll_page_limit),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            batch_interval_seconds: other.batch_interval_seconds.or(self.batch_interval_seconds),
            batch_check_interval_seconds: other.batch_check_interval_seconds.or(self.batch_check_interval_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            send_startup_notice: other.send_startup_notice.or(self.send_startup_notice),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            bridge_http_url: Some("http://127.0.0.1:8088".to_string()),
            bridge_ws_url: Some("ws://127.0.0.1:8088/updates".to_string()),
            bot_api_url: Some(DEFAULT_BOT_API_URL.to_string()),
            summarizer_url: Some(DEFAULT_SUMMARIZER_URL.to_string()),
            summarizer_model: Some(DEFAULT_MODEL.to_string()),
            summarizer_timeout_seconds: Some(120),
            polling_interval_seconds: Some(5),
            poll_page_limit: Some(100),
            heartbeat_interval_seconds: Some(840),
            batch_interval_seconds: Some(300),
            batch_check_interval_seconds: Some(10),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            send_startup_notice: Some(true),
            ..Default::default()
        }
    }

    /// Channel identifiers from `channels` followed by those from
    /// `channels_file`, deduplicated in first-seen order.
    pub fn channel_identifiers(&self) -> Result<Vec<String>, ConfigError> {
        let mut identifiers: Vec<String> = self
            .channels
            .iter()
            .flatten()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(path) = &self.channels_file {
            identifiers.extend(load_channels_file(path)?);
        }

        let mut seen = std::collections::HashSet::new();
        identifiers.retain(|c| seen.insert(c.to_lowercase()));
        Ok(identifiers)
    }

    /// Checks the settings the process cannot run without and returns the
    /// channels to watch.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let channels = self.channel_identifiers()?;
        if channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        Ok(channels)
    }

    /// Primary target first, then the secondary one.
    pub fn targets(&self) -> Vec<DeliveryTarget> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        let mut targets = Vec::new();
        if let Some(id) = non_empty(&self.bot_chat_id) {
            targets.push(DeliveryTarget::primary(id));
        }
        if let Some(id) = non_empty(&self.bot_channel_id) {
            targets.push(DeliveryTarget::secondary(id));
        }
        targets
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let defaults = PipelineSettings::default();
        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
        PipelineSettings {
            poll_interval: secs(self.polling_interval_seconds, defaults.poll_interval),
            page_limit: self.poll_page_limit.unwrap_or(defaults.page_limit),
            heartbeat_interval: secs(self.heartbeat_interval_seconds, defaults.heartbeat_interval),
            batch_window: secs(self.batch_interval_seconds, defaults.batch_window),
            batch_check_interval: secs(self.batch_check_interval_seconds, defaults.batch_check_interval),
            ..defaults
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            http_url: self.bridge_http_url.clone().unwrap_or(defaults.http_url),
            ws_url: self.bridge_ws_url.clone().unwrap_or(defaults.ws_url),
            token: self.bridge_token.clone(),
            reconnect_base_delay: self
                .reconnect_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_base_delay),
            reconnect_max_delay: self
                .reconnect_max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_max_delay),
        }
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_seconds.unwrap_or(120))
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let Ok(config_str) = fs::read_to_string(path) else {
        log::warn!("Failed to read config file: {}. Falling back to other sources.", path.display());
        return None;
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(file_config) => Some(file_config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the JSON config file and `cli` (CLI arguments plus
/// environment variables), later layers winning.
pub fn resolve_config(cli: Config) -> Config {
    // 1. Defaults
    let mut current_config = Config::defaults();

    // 2. Config file, path overridable from the CLI
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // 3. Environment variables and CLI arguments
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve_config(Config::parse())
}
