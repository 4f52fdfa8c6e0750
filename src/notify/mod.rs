//! Forwarding of new messages to a Slack incoming webhook.

pub mod format;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::discord::SourceMessage;
use crate::targets::ChannelTarget;
use crate::transport::{rate_limit_wait, HttpTransport, RequestOptions, RetryPolicy};

pub use format::format_message;

/// Best-effort delivery of a polled message. Implementations never fail the
/// caller; undeliverable notifications are logged and dropped.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &SourceMessage, target: &ChannelTarget);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryFailure {
    RateLimited(Duration),
    Failed(String),
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailure::RateLimited(wait) => write!(f, "rate limited (retry after {:?})", wait),
            DeliveryFailure::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Retry `op` up to `max_attempts` times. Rate limits wait for the server's
/// delay; other failures back off exponentially. Returns the attempts used.
pub async fn deliver_with_retry<F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    mut op: F,
) -> Result<u32, (u32, DeliveryFailure)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), DeliveryFailure>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(()) => return Ok(attempt),
            Err(failure) => {
                if attempt >= max_attempts {
                    return Err((attempt, failure));
                }
                let wait = match &failure {
                    DeliveryFailure::RateLimited(wait) => *wait,
                    DeliveryFailure::Failed(_) => policy.backoff(attempt),
                };
                warn!(
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %failure,
                    "Webhook delivery failed, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

pub struct WebhookNotifier {
    transport: HttpTransport,
    url: Option<String>,
    max_attempts: u32,
}

impl WebhookNotifier {
    pub fn new(config: &Config, transport: HttpTransport) -> Self {
        Self::with_url(transport, config.slack_webhook_url.clone(), config.webhook_max_attempts)
    }

    pub fn with_url(transport: HttpTransport, url: Option<String>, max_attempts: u32) -> Self {
        Self {
            transport,
            url,
            max_attempts,
        }
    }

    /// Deliver `payload`, giving up after `max_attempts`. Never fails the caller.
    pub async fn send(&self, payload: &Value, max_attempts: u32) {
        let Some(url) = self.url.as_deref() else {
            debug!("No webhook configured, skipping notification");
            return;
        };

        let options = RequestOptions::new().json(payload.clone());
        let result = deliver_with_retry(self.transport.policy(), max_attempts, |_| {
            self.post_once(url, &options)
        })
        .await;

        match result {
            Ok(attempts) => debug!(attempts, "Webhook notification delivered"),
            Err((attempts, failure)) => error!(
                attempts,
                error = %failure,
                "Dropping notification after exhausting webhook attempts"
            ),
        }
    }

    async fn post_once(&self, url: &str, options: &RequestOptions) -> Result<(), DeliveryFailure> {
        // The webhook loop owns retries, so the transport gets a single attempt.
        let response = self
            .transport
            .request(Method::POST, url, options, 1)
            .await
            .map_err(|e| DeliveryFailure::Failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = rate_limit_wait(response.headers());
            return Err(DeliveryFailure::RateLimited(wait));
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryFailure::Failed(format!("webhook returned {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &SourceMessage, target: &ChannelTarget) {
        let payload = format_message(message, target);
        if let Some(blocks) = payload["blocks"].as_array() {
            if blocks.len() > format::MAX_BLOCKS {
                warn!(
                    guild = %target.guild_id,
                    channel = %target.channel_id,
                    message = %message.id,
                    blocks = blocks.len(),
                    "Notification exceeds the webhook block limit and may be rejected"
                );
            }
        }
        self.send(&payload, self.max_attempts).await;
    }
}
