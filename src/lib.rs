pub mod baseline;
pub mod channel_log;
pub mod commands;
pub mod config;
pub mod discord;
pub mod enrich;
pub mod error;
pub mod lock;
pub mod notify;
pub mod persist;
pub mod poller;
pub mod query;
pub mod scheduler;
pub mod targets;
pub mod transport;

#[cfg(test)]
mod testing;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub query: std::sync::Arc<query::LastMessageQuery>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
