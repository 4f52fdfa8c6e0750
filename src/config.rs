use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Discord caps `GET /channels/{id}/messages` at 100 messages per page.
pub const DISCORD_MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub discord_api_base: String,
    pub slack_webhook_url: Option<String>,
    pub channels_file: PathBuf,
    pub baselines_file: PathBuf,
    pub logs_dir: PathBuf,
    pub lock_file: PathBuf,
    pub poll_interval: Duration,
    pub fetch_limit: usize,
    /// Durable baseline writes go to the channel config instead of the
    /// legacy baselines file. Also controls persisting enrichment results.
    pub write_enriched_config: bool,
    pub enrich_channels: bool,
    pub http_max_attempts: u32,
    pub webhook_max_attempts: u32,
    pub http_max_connections: usize,
    pub http_timeout: Duration,
    /// Gateway bot token for the `/lastmessage` responder. Unset disables it.
    pub discord_bot_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            discord_api_base: env::var("DISCORD_API_BASE")
                .unwrap_or_else(|_| "https://discord.com/api/v10".to_string())
                .trim_end_matches('/')
                .to_string(),
            slack_webhook_url: env::var("SLACK_WEBHOOK_URL")
                .ok()
                .filter(|u| !u.trim().is_empty()),
            channels_file: env::var("CHANNELS_FILE")
                .unwrap_or_else(|_| "channels.json".to_string())
                .into(),
            baselines_file: env::var("BASELINES_FILE")
                .unwrap_or_else(|_| "data/baselines.json".to_string())
                .into(),
            logs_dir: env::var("LOGS_DIR")
                .unwrap_or_else(|_| "data/logs".to_string())
                .into(),
            lock_file: env::var("LOCK_FILE")
                .unwrap_or_else(|_| "data/echocord.pid".to_string())
                .into(),
            poll_interval: parse_duration_var("POLL_INTERVAL", Duration::from_secs(30)),
            fetch_limit: env::var("FETCH_LIMIT")
                .unwrap_or_else(|_| "50".to_string())
                .parse::<usize>()
                .unwrap_or(50)
                .clamp(1, DISCORD_MAX_PAGE_SIZE),
            write_enriched_config: env::var("WRITE_ENRICHED_CONFIG")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            enrich_channels: env::var("ENRICH_CHANNELS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            http_max_attempts: env::var("HTTP_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            webhook_max_attempts: env::var("WEBHOOK_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            http_max_connections: env::var("HTTP_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "16".to_string())
                .parse()
                .unwrap_or(16),
            http_timeout: parse_duration_var("HTTP_TIMEOUT", Duration::from_secs(15)),
            discord_bot_token: env::var("DISCORD_BOT_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        })
    }
}

fn parse_duration_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| humantime::parse_duration(raw.trim()).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(default)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("discord_api_base", &self.discord_api_base)
            .field(
                "slack_webhook_url",
                &self.slack_webhook_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("channels_file", &self.channels_file)
            .field("baselines_file", &self.baselines_file)
            .field("logs_dir", &self.logs_dir)
            .field("lock_file", &self.lock_file)
            .field("poll_interval", &self.poll_interval)
            .field("fetch_limit", &self.fetch_limit)
            .field("write_enriched_config", &self.write_enriched_config)
            .field("enrich_channels", &self.enrich_channels)
            .field("http_max_attempts", &self.http_max_attempts)
            .field("webhook_max_attempts", &self.webhook_max_attempts)
            .field("http_max_connections", &self.http_max_connections)
            .field("http_timeout", &self.http_timeout)
            .field(
                "discord_bot_token",
                &self.discord_bot_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
