use std::sync::Arc;

use anyhow::Context as AnyhowContext;
use echocord::baseline::{BaselineStore, WriteTarget};
use echocord::channel_log::ChannelLog;
use echocord::config::Config;
use echocord::discord::{DiscordApi, MessageSource};
use echocord::enrich::enrich_targets;
use echocord::lock::PidLock;
use echocord::notify::{Notifier, WebhookNotifier};
use echocord::poller::ChannelPoller;
use echocord::query::LastMessageQuery;
use echocord::scheduler::{PollSummary, Scheduler};
use echocord::targets::ChannelConfig;
use echocord::transport::HttpTransport;
use echocord::{commands, Data};
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(?config, "Configuration loaded");

    let _lock = PidLock::acquire(&config.lock_file)?;

    let channel_config = ChannelConfig::load(&config.channels_file)
        .with_context(|| format!("Failed to load {}", config.channels_file.display()))?;

    let transport = HttpTransport::new(&config)?;
    let source: Arc<dyn MessageSource> = Arc::new(DiscordApi::new(&config, transport.clone())?);
    let store = Arc::new(BaselineStore::new(
        channel_config,
        &config.baselines_file,
        WriteTarget::from_flag(config.write_enriched_config),
    ));
    let log = ChannelLog::new(&config.logs_dir);
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(&config, transport));
    if config.slack_webhook_url.is_none() {
        warn!("SLACK_WEBHOOK_URL is not set, notifications are disabled");
    }

    let mut targets = store.targets().await;
    if targets.is_empty() {
        warn!(path = %config.channels_file.display(), "No channels configured");
    }
    if config.enrich_channels {
        targets = enrich_targets(source.as_ref(), &store, targets, config.write_enriched_config).await;
    }

    let pollers: Vec<ChannelPoller> = targets
        .into_iter()
        .map(|target| {
            ChannelPoller::new(
                target,
                source.clone(),
                store.clone(),
                log.clone(),
                notifier.clone(),
                config.fetch_limit,
            )
        })
        .collect();

    let scheduler = Scheduler::start(pollers, config.poll_interval, Arc::new(PollSummary::default()));

    let bot = match config.discord_bot_token.clone() {
        Some(token) => {
            let query = Arc::new(LastMessageQuery::new(store.clone(), source.clone()));
            Some(tokio::spawn(run_bot(token, config.clone(), query)))
        }
        None => {
            info!("DISCORD_BOT_TOKEN not set, /lastmessage is disabled");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    if let Some(bot) = bot {
        bot.abort();
    }
    scheduler.shutdown().await;
    Ok(())
}

async fn run_bot(token: String, config: Config, query: Arc<LastMessageQuery>) {
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(Data { config, query })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged();
    let client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await;

    let mut client = match client {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create client: {}", e);
            return;
        }
    };

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }
}
