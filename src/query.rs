//! Answers "what was the last message in channel X?" on demand.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::baseline::{Baseline, BaselineStore};
use crate::discord::MessageSource;
use crate::error::QueryError;
use crate::notify::format::message_link;
use crate::targets::ChannelTarget;

/// Discord rejects replies over 2000 characters.
const MAX_REPLY_CONTENT_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessageAnswer {
    pub target: ChannelTarget,
    pub message_id: String,
    pub author: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<String>,
    /// False when the message could not be re-fetched and the cached
    /// baseline was used instead.
    pub fresh: bool,
}

impl LastMessageAnswer {
    pub fn render(&self) -> String {
        let mut out = format!(
            "**{}** · {}\n",
            self.target.display_channel(),
            self.target.display_guild()
        );
        match (&self.author, &self.timestamp) {
            (Some(author), Some(ts)) => out.push_str(&format!("**{}** at {}\n", author, ts)),
            (Some(author), None) => out.push_str(&format!("**{}**\n", author)),
            (None, Some(ts)) => out.push_str(&format!("{}\n", ts)),
            (None, None) => {}
        }

        match self.content.as_deref().filter(|c| !c.is_empty()) {
            Some(content) => {
                let mut body: String = content.chars().take(MAX_REPLY_CONTENT_CHARS).collect();
                if content.chars().count() > MAX_REPLY_CONTENT_CHARS {
                    body.push_str("...");
                }
                out.push_str(&body);
            }
            None => out.push_str("_(no text content)_"),
        }
        if !self.fresh {
            out.push_str("\n_(cached)_");
        }
        out.push('\n');
        out.push_str(&message_link(&self.target, &self.message_id));
        out
    }
}

pub struct LastMessageQuery {
    store: Arc<BaselineStore>,
    source: Arc<dyn MessageSource>,
}

impl LastMessageQuery {
    pub fn new(store: Arc<BaselineStore>, source: Arc<dyn MessageSource>) -> Self {
        Self { store, source }
    }

    /// Find a monitored channel by id, `guild_channel` key, name or mention.
    pub async fn resolve(&self, needle: &str) -> Result<ChannelTarget, QueryError> {
        let trimmed = needle.trim();
        let wanted = trimmed
            .strip_prefix("<#")
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);
        let wanted = wanted.strip_prefix('#').unwrap_or(wanted);

        let targets = self.store.targets().await;
        targets
            .iter()
            .find(|t| t.channel_id == wanted || t.key() == wanted)
            .or_else(|| {
                targets.iter().find(|t| {
                    t.channel_name
                        .as_deref()
                        .is_some_and(|name| name.eq_ignore_ascii_case(wanted))
                })
            })
            .cloned()
            .ok_or_else(|| QueryError::UnknownTarget(needle.trim().to_string()))
    }

    /// The newest message we know of. Establishes a baseline when the channel
    /// has none yet.
    pub async fn last_message(&self, target: &ChannelTarget) -> Result<LastMessageAnswer, QueryError> {
        if let Some(baseline) = self.store.get_baseline(target).await {
            return Ok(self.refresh(target, baseline).await);
        }

        let latest = self
            .source
            .recent_messages(&target.channel_id, 1, None)
            .await?;
        let newest = latest
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::EmptyChannel(target.display_channel()))?;

        if let Err(e) = self.store.set_baseline(target, Baseline::from(&newest)).await {
            debug!(
                guild = %target.guild_id,
                channel = %target.channel_id,
                error = %e,
                "Query baseline not persisted, kept in memory"
            );
        }
        debug!(
            guild = %target.guild_id,
            channel = %target.channel_id,
            cursor = %newest.id,
            "Baseline established by query"
        );

        Ok(LastMessageAnswer {
            target: target.clone(),
            author: Some(display_author(&newest.author)),
            message_id: newest.id,
            content: Some(newest.content),
            timestamp: Some(newest.timestamp),
            fresh: true,
        })
    }

    async fn refresh(&self, target: &ChannelTarget, baseline: Baseline) -> LastMessageAnswer {
        match self
            .source
            .message(&target.channel_id, &baseline.last_message_id)
            .await
        {
            Ok(message) => LastMessageAnswer {
                target: target.clone(),
                author: Some(display_author(&message.author)),
                message_id: message.id,
                content: Some(message.content),
                timestamp: Some(message.timestamp),
                fresh: true,
            },
            Err(e) => {
                warn!(
                    guild = %target.guild_id,
                    channel = %target.channel_id,
                    error = %e,
                    "Could not re-fetch last message, answering from baseline"
                );
                LastMessageAnswer {
                    target: target.clone(),
                    message_id: baseline.last_message_id,
                    author: None,
                    content: baseline.content,
                    timestamp: baseline.timestamp,
                    fresh: false,
                }
            }
        }
    }
}

fn display_author(author: &crate::discord::Author) -> String {
    author
        .global_name
        .clone()
        .or_else(|| author.username.clone())
        .unwrap_or_else(|| author.id.clone())
}
