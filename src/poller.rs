//! Per-channel poll state machine.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::baseline::{compare_message_ids, Baseline, BaselineStore};
use crate::channel_log::{ChannelLog, MessageRecord};
use crate::discord::MessageSource;
use crate::error::SourceError;
use crate::notify::Notifier;
use crate::targets::ChannelTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    /// No cursor yet; the next tick looks one up or establishes it.
    Uninitialized,
    /// Cursor set from the channel's newest message on this run.
    Baselined(Baseline),
    Steady(Baseline),
}

impl PollState {
    pub fn cursor(&self) -> Option<&Baseline> {
        match self {
            PollState::Uninitialized => None,
            PollState::Baselined(cursor) | PollState::Steady(cursor) => Some(cursor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Baselined { message_id: String },
    EmptyChannel,
    Idle,
    Processed { count: usize },
}

pub struct ChannelPoller {
    target: ChannelTarget,
    source: Arc<dyn MessageSource>,
    store: Arc<BaselineStore>,
    log: ChannelLog,
    notifier: Arc<dyn Notifier>,
    fetch_limit: usize,
    state: PollState,
}

impl ChannelPoller {
    pub fn new(
        target: ChannelTarget,
        source: Arc<dyn MessageSource>,
        store: Arc<BaselineStore>,
        log: ChannelLog,
        notifier: Arc<dyn Notifier>,
        fetch_limit: usize,
    ) -> Self {
        Self {
            target,
            source,
            store,
            log,
            notifier,
            fetch_limit: fetch_limit.max(1),
            state: PollState::Uninitialized,
        }
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Run one poll cycle. On error the state is left untouched so the next
    /// tick retries from the same cursor.
    pub async fn tick(&mut self) -> Result<TickOutcome, SourceError> {
        let cursor = match self.state.cursor().cloned() {
            Some(cursor) => cursor,
            None => match self.store.get_baseline(&self.target).await {
                Some(existing) => {
                    debug!(
                        guild = %self.target.guild_id,
                        channel = %self.target.channel_id,
                        cursor = %existing.last_message_id,
                        "Resuming from stored baseline"
                    );
                    self.state = PollState::Steady(existing.clone());
                    existing
                }
                None => return self.establish_baseline().await,
            },
        };

        self.poll_after(cursor).await
    }

    async fn establish_baseline(&mut self) -> Result<TickOutcome, SourceError> {
        let latest = self
            .source
            .recent_messages(&self.target.channel_id, 1, None)
            .await?;

        let Some(newest) = latest.first() else {
            debug!(
                guild = %self.target.guild_id,
                channel = %self.target.channel_id,
                "Channel has no messages yet, will retry"
            );
            return Ok(TickOutcome::EmptyChannel);
        };

        let baseline = Baseline::from(newest);
        if let Err(e) = self.store.set_baseline(&self.target, baseline.clone()).await {
            debug!(
                guild = %self.target.guild_id,
                channel = %self.target.channel_id,
                error = %e,
                "Baseline not persisted, cursor kept in memory"
            );
        }
        info!(
            guild = %self.target.guild_id,
            channel = %self.target.channel_id,
            cursor = %baseline.last_message_id,
            "Baseline established"
        );

        let message_id = baseline.last_message_id.clone();
        self.state = PollState::Baselined(baseline);
        Ok(TickOutcome::Baselined { message_id })
    }

    async fn poll_after(&mut self, cursor: Baseline) -> Result<TickOutcome, SourceError> {
        let mut fresh = self
            .source
            .recent_messages(
                &self.target.channel_id,
                self.fetch_limit,
                Some(&cursor.last_message_id),
            )
            .await?;

        fresh.reverse();
        fresh.sort_by(|a, b| compare_message_ids(&a.id, &b.id));
        fresh.dedup_by(|a, b| a.id == b.id);
        fresh.retain(|m| compare_message_ids(&m.id, &cursor.last_message_id) == Ordering::Greater);

        let Some(newest) = fresh.last() else {
            debug!(
                guild = %self.target.guild_id,
                channel = %self.target.channel_id,
                "No new messages"
            );
            self.state = PollState::Steady(cursor);
            return Ok(TickOutcome::Idle);
        };
        let next_cursor = Baseline::from(newest);

        let records: Vec<MessageRecord> = fresh.iter().map(MessageRecord::from).collect();
        if let Err(e) = self.log.append_messages(&self.target, &records).await {
            error!(
                guild = %self.target.guild_id,
                channel = %self.target.channel_id,
                error = %e,
                "Failed to append channel log"
            );
        }

        if let Err(e) = self.store.set_baseline(&self.target, next_cursor.clone()).await {
            debug!(
                guild = %self.target.guild_id,
                channel = %self.target.channel_id,
                error = %e,
                "Cursor not persisted, continuing in memory"
            );
        }
        self.state = PollState::Steady(next_cursor);

        for message in &fresh {
            self.notifier.notify(message, &self.target).await;
        }

        debug!(
            guild = %self.target.guild_id,
            channel = %self.target.channel_id,
            count = fresh.len(),
            "Processed new messages"
        );
        Ok(TickOutcome::Processed { count: fresh.len() })
    }
}
