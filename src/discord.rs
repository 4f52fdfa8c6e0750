//! Discord REST client used for polling, enrichment and interactive queries.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::Config;
use crate::error::SourceError;
use crate::transport::{rate_limit_wait, HttpTransport, RequestOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A message as returned by `GET /channels/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceMessage {
    pub id: String,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Where the poll engine reads messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `limit` most recent messages, newest first, optionally only
    /// those strictly after message `after`.
    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    async fn message(&self, channel_id: &str, message_id: &str) -> Result<SourceMessage, SourceError>;

    async fn channel(&self, channel_id: &str) -> Result<ChannelInfo, SourceError>;

    async fn guild(&self, guild_id: &str) -> Result<GuildInfo, SourceError>;
}

pub struct DiscordApi {
    transport: HttpTransport,
    base_url: String,
    auth: HeaderValue,
    max_attempts: u32,
}

impl DiscordApi {
    pub fn new(config: &Config, transport: HttpTransport) -> anyhow::Result<Self> {
        Self::with_base(
            transport,
            &config.discord_api_base,
            &config.discord_token,
            config.http_max_attempts,
        )
    }

    pub fn with_base(
        transport: HttpTransport,
        base_url: &str,
        token: &str,
        max_attempts: u32,
    ) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(token.trim())
            .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN contains invalid header characters"))?;
        auth.set_sensitive(true);

        Ok(Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            max_attempts: max_attempts.max(1),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut options = RequestOptions::new().header(AUTHORIZATION, self.auth.clone());
        for (key, value) in query {
            options = options.query(key, value.clone());
        }

        let mut attempt = 1;
        loop {
            let response = self
                .transport
                .request(Method::GET, &url, &options, self.max_attempts)
                .await?;
            let status = response.status();

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| SourceError::Malformed(format!("{}: {}", path, e)));
            }

            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    error!(path, %status, "Discord refused the request, check DISCORD_TOKEN and channel access");
                    return Err(SourceError::Unauthorized { status });
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let wait = rate_limit_wait(response.headers());
                    if attempt >= self.max_attempts {
                        return Err(SourceError::RateLimited {
                            attempts: attempt,
                            retry_after: wait,
                        });
                    }
                    warn!(path, attempt, wait_ms = wait.as_millis() as u64, "Discord rate limited, waiting");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SourceError::Http {
                        status,
                        body: truncate(&body, 300),
                    });
                }
            }
        }
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    let mut snippet: String = body.chars().take(max_chars).collect();
    if body.chars().count() > max_chars {
        snippet.push_str("...");
    }
    snippet
}

#[async_trait]
impl MessageSource for DiscordApi {
    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.get_json(&format!("/channels/{}/messages", channel_id), &query)
            .await
    }

    async fn message(&self, channel_id: &str, message_id: &str) -> Result<SourceMessage, SourceError> {
        self.get_json(
            &format!("/channels/{}/messages/{}", channel_id, message_id),
            &[],
        )
        .await
    }

    async fn channel(&self, channel_id: &str) -> Result<ChannelInfo, SourceError> {
        self.get_json(&format!("/channels/{}", channel_id), &[]).await
    }

    async fn guild(&self, guild_id: &str) -> Result<GuildInfo, SourceError> {
        self.get_json(&format!("/guilds/{}", guild_id), &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_stub, StubResponse};
    use crate::transport::RetryPolicy;
    use std::time::Duration;

    fn api(base: &str) -> DiscordApi {
        let transport = HttpTransport::build(
            Duration::from_secs(5),
            4,
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                jitter_max: Duration::ZERO,
            },
        )
        .unwrap();
        DiscordApi::with_base(transport, base, "Bot secret-token", 3).unwrap()
    }

    const MESSAGES: &str = r#"[
        {"id": "12", "author": {"id": "1", "username": "ferris"}, "content": "second",
         "timestamp": "2026-01-01T00:00:02+00:00",
         "attachments": [{"id": "a", "url": "https://cdn/x.png", "filename": "x.png", "size": 10}]},
        {"id": "11", "author": {"id": "1", "username": "ferris"}, "content": "first",
         "timestamp": "2026-01-01T00:00:01+00:00", "pinned": false}
    ]"#;

    #[tokio::test]
    async fn test_recent_messages_sends_auth_and_query() {
        let stub = spawn_stub(vec![StubResponse::json(200, MESSAGES)]).await;
        let messages = api(&stub.url(""))
            .recent_messages("555", 50, Some("10"))
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "12");
        assert_eq!(messages[0].attachments[0].filename.as_deref(), Some("x.png"));

        let request = &stub.requests()[0];
        assert!(request.request_line.starts_with("GET /channels/555/messages?"));
        assert!(request.request_line.contains("limit=50"));
        assert!(request.request_line.contains("after=10"));
        assert_eq!(request.header("authorization").as_deref(), Some("Bot secret-token"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let stub = spawn_stub(vec![StubResponse::json(401, r#"{"message": "401: Unauthorized"}"#)]).await;
        let err = api(&stub.url("")).message("1", "2").await.unwrap_err();

        assert!(matches!(err, SourceError::Unauthorized { status } if status == StatusCode::UNAUTHORIZED));
        assert_eq!(stub.request_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_waits_and_retries() {
        let stub = spawn_stub(vec![
            StubResponse::json(429, r#"{"retry_after": 0.05}"#).with_header("Retry-After", "0.05"),
            StubResponse::json(200, r#"{"id": "9", "name": "general", "guild_id": "3"}"#),
        ])
        .await;

        let channel = api(&stub.url("")).channel("9").await.unwrap();
        assert_eq!(channel.name.as_deref(), Some("general"));
        assert_eq!(stub.request_count(), 2);
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_surfaces() {
        let stub = spawn_stub(vec![
            StubResponse::json(429, "{}").with_header("Retry-After", "0"),
        ])
        .await;

        let err = api(&stub.url("")).guild("3").await.unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { attempts: 3, .. }));
        assert_eq!(stub.request_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_body_is_reported() {
        let stub = spawn_stub(vec![StubResponse::json(200, r#"{"not": "an array"}"#)]).await;
        let err = api(&stub.url(""))
            .recent_messages("1", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }
}
