//! Per-channel cursor ("baseline") tracking across two stores.
//!
//! The primary store is the `baseline` object embedded in each channel config
//! entry; the legacy store is a flat JSON map keyed by `guild_channel`. Reads
//! merge both, writes go to exactly one of them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::discord::SourceMessage;
use crate::error::StoreError;
use crate::persist::{read_optional, sibling_with_suffix, write_atomic};
use crate::targets::{ChannelConfig, ChannelTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    #[serde(alias = "last_message_id")]
    pub last_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl From<&SourceMessage> for Baseline {
    fn from(message: &SourceMessage) -> Self {
        Baseline {
            last_message_id: message.id.clone(),
            content: Some(message.content.clone()),
            timestamp: Some(message.timestamp.clone()),
        }
    }
}

impl Baseline {
    fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    }
}

/// Order Discord snowflakes. Ids are decimal u64s, so compare numerically;
/// anything unparseable falls back to length, then lexical order.
pub fn compare_message_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// Pick the authoritative baseline when both stores may hold one.
///
/// The later parseable timestamp wins. A side with a parseable timestamp beats
/// one without. With no usable timestamps (or equal ones) the legacy store wins.
pub fn merge_baselines(primary: Option<Baseline>, legacy: Option<Baseline>) -> Option<Baseline> {
    match (primary, legacy) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(l)) => Some(l),
        (Some(p), Some(l)) => match (p.parsed_timestamp(), l.parsed_timestamp()) {
            (Some(pt), Some(lt)) if pt > lt => Some(p),
            (Some(_), None) => Some(p),
            _ => Some(l),
        },
    }
}

/// Which store receives durable baseline writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// The channel config file (write-enriched mode).
    Primary,
    Legacy,
}

impl WriteTarget {
    pub fn from_flag(write_enriched_config: bool) -> Self {
        if write_enriched_config {
            WriteTarget::Primary
        } else {
            WriteTarget::Legacy
        }
    }
}

pub struct BaselineStore {
    primary: Mutex<ChannelConfig>,
    legacy_path: PathBuf,
    /// Serializes read-modify-write cycles on the legacy file.
    legacy_lock: Mutex<()>,
    write_target: WriteTarget,
}

impl BaselineStore {
    pub fn new(config: ChannelConfig, legacy_path: impl Into<PathBuf>, write_target: WriteTarget) -> Self {
        Self {
            primary: Mutex::new(config),
            legacy_path: legacy_path.into(),
            legacy_lock: Mutex::new(()),
            write_target,
        }
    }

    pub fn write_target(&self) -> WriteTarget {
        self.write_target
    }

    /// Snapshot of the configured channels.
    pub async fn targets(&self) -> Vec<ChannelTarget> {
        self.primary.lock().await.targets()
    }

    /// Merged cursor for `target`. Never fails: unreadable stores count as absent.
    pub async fn get_baseline(&self, target: &ChannelTarget) -> Option<Baseline> {
        let primary = self.primary.lock().await.baseline(target);
        let legacy = self.read_legacy_entry(target).await;
        merge_baselines(primary, legacy)
    }

    /// Record a new cursor. The in-memory primary store is always updated; the
    /// durable write goes to the configured store and is logged on failure.
    pub async fn set_baseline(&self, target: &ChannelTarget, baseline: Baseline) -> Result<(), StoreError> {
        let result = match self.write_target {
            WriteTarget::Primary => {
                let mut primary = self.primary.lock().await;
                primary.set_baseline(target, baseline);
                primary.save().await
            }
            WriteTarget::Legacy => {
                self.primary.lock().await.set_baseline(target, baseline.clone());
                self.write_legacy_entry(target, baseline).await
            }
        };

        match &result {
            Ok(()) => debug!(
                guild = %target.guild_id,
                channel = %target.channel_id,
                store = ?self.write_target,
                "Baseline persisted"
            ),
            Err(e) => error!(
                guild = %target.guild_id,
                channel = %target.channel_id,
                error = %e,
                "Failed to persist baseline, continuing with in-memory cursor"
            ),
        }
        result
    }

    /// Apply enrichment results to the primary document, keeping baselines.
    pub async fn update_display(&self, target: &ChannelTarget) {
        self.primary.lock().await.set_display(target);
    }

    /// Write the channel config back to disk.
    pub async fn persist_primary(&self) -> Result<(), StoreError> {
        self.primary.lock().await.save().await
    }

    /// Tolerant read for lookups: anything unreadable counts as empty.
    async fn read_legacy_map(&self) -> BTreeMap<String, Value> {
        let content = match read_optional(&self.legacy_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    path = %self.legacy_path.display(),
                    error = %e,
                    "Failed to read legacy baselines, treating as empty"
                );
                return BTreeMap::new();
            }
        };

        match parse_legacy_map(content.as_deref()) {
            Ok(map) => map,
            Err(reason) => {
                warn!(
                    path = %self.legacy_path.display(),
                    reason = %reason,
                    "Legacy baselines file is unusable, treating as empty"
                );
                BTreeMap::new()
            }
        }
    }

    /// Strict read for read-modify-write. An unreadable file aborts the write
    /// so other channels' cursors survive; an unparsable one is moved aside to
    /// `<name>.corrupt` before being replaced.
    async fn load_legacy_map_for_write(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let content = read_optional(&self.legacy_path)
            .await
            .map_err(|e| StoreError::io(&self.legacy_path, e))?;

        match parse_legacy_map(content.as_deref()) {
            Ok(map) => Ok(map),
            Err(reason) => {
                let aside = sibling_with_suffix(&self.legacy_path, ".corrupt");
                tokio::fs::copy(&self.legacy_path, &aside)
                    .await
                    .map_err(|e| StoreError::io(&aside, e))?;
                warn!(
                    path = %self.legacy_path.display(),
                    saved_to = %aside.display(),
                    reason = %reason,
                    "Legacy baselines file is unusable, keeping a copy and starting fresh"
                );
                Ok(BTreeMap::new())
            }
        }
    }

    async fn read_legacy_entry(&self, target: &ChannelTarget) -> Option<Baseline> {
        let key = target.key();
        let value = self.read_legacy_map().await.remove(&key)?;
        match serde_json::from_value::<Baseline>(value) {
            Ok(baseline) => Some(baseline),
            Err(e) => {
                warn!(key = %key, error = %e, "Malformed legacy baseline entry, ignoring");
                None
            }
        }
    }

    async fn write_legacy_entry(&self, target: &ChannelTarget, baseline: Baseline) -> Result<(), StoreError> {
        let _guard = self.legacy_lock.lock().await;

        let mut map = self.load_legacy_map_for_write().await?;
        let value = serde_json::to_value(&baseline).map_err(|e| StoreError::Serialize {
            path: self.legacy_path.clone(),
            reason: e.to_string(),
        })?;
        map.insert(target.key(), value);

        let rendered = serde_json::to_string_pretty(&map).map_err(|e| StoreError::Serialize {
            path: self.legacy_path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.legacy_path, rendered.as_bytes()).await
    }
}

fn parse_legacy_map(content: Option<&str>) -> Result<BTreeMap<String, Value>, String> {
    let Some(content) = content.filter(|c| !c.trim().is_empty()) else {
        return Ok(BTreeMap::new());
    };
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err("not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
