//! Per-channel JSON archive of every message the poller has seen.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::discord::{Attachment, SourceMessage};
use crate::error::StoreError;
use crate::persist::{read_optional, write_atomic};
use crate::targets::ChannelTarget;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAuthor {
    pub id: String,
    pub username: Option<String>,
}

/// The simplified message shape stored in channel logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub author: RecordAuthor,
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl From<&SourceMessage> for MessageRecord {
    fn from(message: &SourceMessage) -> Self {
        Self {
            id: message.id.clone(),
            author: RecordAuthor {
                id: message.author.id.clone(),
                username: message.author.username.clone(),
            },
            content: message.content.clone(),
            timestamp: message.timestamp.clone(),
            attachments: if message.attachments.is_empty() {
                None
            } else {
                Some(message.attachments.clone())
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelLog {
    dir: PathBuf,
}

impl ChannelLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, target: &ChannelTarget) -> PathBuf {
        self.dir.join(format!("{}.json", target.key()))
    }

    /// Append `records` to the target's log. Existing entries are kept in order;
    /// a missing or corrupt log starts over as an empty array.
    pub async fn append_messages(
        &self,
        target: &ChannelTarget,
        records: &[MessageRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let path = self.path_for(target);
        let mut entries = read_existing(&path).await;
        let previous = entries.len();
        for record in records {
            let value = serde_json::to_value(record).map_err(|e| StoreError::Serialize {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            entries.push(value);
        }

        let rendered = serde_json::to_string_pretty(&entries).map_err(|e| StoreError::Serialize {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, rendered.as_bytes()).await?;

        debug!(
            guild = %target.guild_id,
            channel = %target.channel_id,
            appended = records.len(),
            total = previous + records.len(),
            "Channel log updated"
        );
        Ok(())
    }
}

/// Existing entries are kept as raw JSON so records written by older versions
/// survive a rewrite untouched.
async fn read_existing(path: &Path) -> Vec<Value> {
    let content = match read_optional(path).await {
        Ok(Some(content)) => content,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read channel log, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => {
            warn!(path = %path.display(), "Channel log is not a JSON array, starting empty");
            Vec::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Channel log is not valid JSON, starting empty");
            Vec::new()
        }
    }
}
