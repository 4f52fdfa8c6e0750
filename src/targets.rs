//! Monitored channels and the channel configuration document.
//!
//! The config file may list channels flat or grouped by guild, as JSON or
//! TOML. Shape detection happens once, at deserialization; the rest of the
//! crate only sees [`ChannelTarget`]. The document also hosts the primary
//! baseline store, so it is written back in the shape and format it was read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::baseline::Baseline;
use crate::error::StoreError;
use crate::persist::write_atomic;

/// One monitored `(guild, channel)` pair plus optional display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub guild_id: String,
    pub channel_id: String,
    pub guild_name: Option<String>,
    pub channel_name: Option<String>,
    /// Guild icon hash as returned by Discord (`a_` prefix means animated).
    pub guild_icon: Option<String>,
}

impl ChannelTarget {
    pub fn new(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            guild_name: None,
            channel_name: None,
            guild_icon: None,
        }
    }

    /// `"<guild_id>_<channel_id>"`, the legacy store and log file key.
    pub fn key(&self) -> String {
        format!("{}_{}", self.guild_id, self.channel_id)
    }

    pub fn display_channel(&self) -> String {
        match &self.channel_name {
            Some(name) => format!("#{}", name),
            None => format!("#{}", self.channel_id),
        }
    }

    pub fn display_guild(&self) -> &str {
        self.guild_name.as_deref().unwrap_or(&self.guild_id)
    }

    pub fn needs_enrichment(&self) -> bool {
        self.channel_name.is_none() || self.guild_name.is_none() || self.guild_icon.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    #[serde(alias = "guild_id")]
    pub guild_id: String,
    #[serde(alias = "channel_id")]
    pub channel_id: String,
    #[serde(default, alias = "guild_name", skip_serializing_if = "Option::is_none")]
    pub guild_name: Option<String>,
    #[serde(default, alias = "channel_name", skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, alias = "guild_icon", skip_serializing_if = "Option::is_none")]
    pub guild_icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedChannelEntry {
    #[serde(alias = "channel_id")]
    pub channel_id: String,
    #[serde(default, alias = "channel_name", skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
}

/// A channel inside a guild group: either a bare id or a full entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupedChannel {
    Id(String),
    Entry(GroupedChannelEntry),
}

impl GroupedChannel {
    fn channel_id(&self) -> &str {
        match self {
            GroupedChannel::Id(id) => id,
            GroupedChannel::Entry(entry) => &entry.channel_id,
        }
    }

    /// Upgrade a bare id to a full entry so it can carry a baseline or name.
    fn entry_mut(&mut self) -> &mut GroupedChannelEntry {
        if let GroupedChannel::Id(id) = self {
            *self = GroupedChannel::Entry(GroupedChannelEntry {
                channel_id: std::mem::take(id),
                channel_name: None,
                baseline: None,
            });
        }
        match self {
            GroupedChannel::Entry(entry) => entry,
            GroupedChannel::Id(_) => unreachable!("bare id upgraded above"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildGroup {
    #[serde(alias = "guild_id")]
    pub guild_id: String,
    #[serde(default, alias = "guild_name", skip_serializing_if = "Option::is_none")]
    pub guild_name: Option<String>,
    #[serde(default, alias = "guild_icon", skip_serializing_if = "Option::is_none")]
    pub guild_icon: Option<String>,
    pub channels: Vec<GroupedChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigEntry {
    Group(GuildGroup),
    Channel(ChannelEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigRoot {
    List(Vec<ConfigEntry>),
    Table { channels: Vec<ConfigEntry> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// The channel configuration file, held in memory as the primary store.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    path: PathBuf,
    format: ConfigFormat,
    root: ConfigRoot,
}

impl ChannelConfig {
    /// Read and parse the config file. Any failure here is a startup error.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let format = ConfigFormat::from_path(&path);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read channel config {}: {}", path.display(), e)
        })?;
        let root = Self::parse(&content, format).map_err(|e| {
            anyhow::anyhow!("Invalid channel config {}: {}", path.display(), e)
        })?;
        Ok(Self { path, format, root })
    }

    pub fn parse(content: &str, format: ConfigFormat) -> anyhow::Result<ConfigRoot> {
        let root = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        Ok(root)
    }

    pub fn from_root(path: impl Into<PathBuf>, format: ConfigFormat, root: ConfigRoot) -> Self {
        Self {
            path: path.into(),
            format,
            root,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> &Vec<ConfigEntry> {
        match &self.root {
            ConfigRoot::List(entries) => entries,
            ConfigRoot::Table { channels } => channels,
        }
    }

    fn entries_mut(&mut self) -> &mut Vec<ConfigEntry> {
        match &mut self.root {
            ConfigRoot::List(entries) => entries,
            ConfigRoot::Table { channels } => channels,
        }
    }

    /// Normalize both config shapes into a flat, de-duplicated target list.
    pub fn targets(&self) -> Vec<ChannelTarget> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        let mut push = |target: ChannelTarget| {
            if seen.insert(target.key()) {
                targets.push(target);
            } else {
                warn!(
                    guild = %target.guild_id,
                    channel = %target.channel_id,
                    "Duplicate channel in config, ignoring"
                );
            }
        };

        for entry in self.entries() {
            match entry {
                ConfigEntry::Channel(c) => push(ChannelTarget {
                    guild_id: c.guild_id.clone(),
                    channel_id: c.channel_id.clone(),
                    guild_name: c.guild_name.clone(),
                    channel_name: c.channel_name.clone(),
                    guild_icon: c.guild_icon.clone(),
                }),
                ConfigEntry::Group(g) => {
                    for channel in &g.channels {
                        let channel_name = match channel {
                            GroupedChannel::Entry(e) => e.channel_name.clone(),
                            GroupedChannel::Id(_) => None,
                        };
                        push(ChannelTarget {
                            guild_id: g.guild_id.clone(),
                            channel_id: channel.channel_id().to_string(),
                            guild_name: g.guild_name.clone(),
                            channel_name,
                            guild_icon: g.guild_icon.clone(),
                        });
                    }
                }
            }
        }
        targets
    }

    /// The embedded baseline for `target`, if any.
    pub fn baseline(&self, target: &ChannelTarget) -> Option<Baseline> {
        for entry in self.entries() {
            match entry {
                ConfigEntry::Channel(c)
                    if c.guild_id == target.guild_id && c.channel_id == target.channel_id =>
                {
                    return c.baseline.clone();
                }
                ConfigEntry::Group(g) if g.guild_id == target.guild_id => {
                    for channel in &g.channels {
                        if channel.channel_id() == target.channel_id {
                            return match channel {
                                GroupedChannel::Entry(e) => e.baseline.clone(),
                                GroupedChannel::Id(_) => None,
                            };
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn set_baseline(&mut self, target: &ChannelTarget, baseline: Baseline) {
        match self.locate_mut(target) {
            Slot::Flat(entry) => entry.baseline = Some(baseline),
            Slot::Grouped(channel) => channel.entry_mut().baseline = Some(baseline),
        }
    }

    /// Copy display metadata from an enriched target into the document.
    pub fn set_display(&mut self, target: &ChannelTarget) {
        let grouped = self
            .entries()
            .iter()
            .any(|e| matches!(e, ConfigEntry::Group(g) if g.guild_id == target.guild_id));

        if grouped {
            for entry in self.entries_mut() {
                if let ConfigEntry::Group(g) = entry {
                    if g.guild_id == target.guild_id {
                        if target.guild_name.is_some() {
                            g.guild_name = target.guild_name.clone();
                        }
                        if target.guild_icon.is_some() {
                            g.guild_icon = target.guild_icon.clone();
                        }
                    }
                }
            }
        }

        match self.locate_mut(target) {
            Slot::Flat(entry) => {
                if target.guild_name.is_some() {
                    entry.guild_name = target.guild_name.clone();
                }
                if target.guild_icon.is_some() {
                    entry.guild_icon = target.guild_icon.clone();
                }
                if target.channel_name.is_some() {
                    entry.channel_name = target.channel_name.clone();
                }
            }
            Slot::Grouped(channel) => {
                if target.channel_name.is_some() {
                    channel.entry_mut().channel_name = target.channel_name.clone();
                }
            }
        }
    }

    /// Find the entry for `target`, creating it when missing. New channels join
    /// an existing group for their guild, otherwise they are added flat.
    fn locate_mut(&mut self, target: &ChannelTarget) -> Slot<'_> {
        let entries = self.entries_mut();

        let flat = entries.iter().position(|e| {
            matches!(e, ConfigEntry::Channel(c)
                if c.guild_id == target.guild_id && c.channel_id == target.channel_id)
        });
        let group = entries.iter().position(
            |e| matches!(e, ConfigEntry::Group(g) if g.guild_id == target.guild_id),
        );

        // Prefer an existing flat entry, then a group already holding the
        // channel, then any group for the guild.
        let grouped_with_channel = entries.iter().position(|e| {
            matches!(e, ConfigEntry::Group(g)
                if g.guild_id == target.guild_id
                    && g.channels.iter().any(|c| c.channel_id() == target.channel_id))
        });

        let index = match (flat, grouped_with_channel, group) {
            (Some(i), _, _) => i,
            (None, Some(i), _) => i,
            (None, None, Some(i)) => {
                if let ConfigEntry::Group(g) = &mut entries[i] {
                    g.channels.push(GroupedChannel::Id(target.channel_id.clone()));
                }
                i
            }
            (None, None, None) => {
                entries.push(ConfigEntry::Channel(ChannelEntry {
                    guild_id: target.guild_id.clone(),
                    channel_id: target.channel_id.clone(),
                    guild_name: target.guild_name.clone(),
                    channel_name: target.channel_name.clone(),
                    guild_icon: target.guild_icon.clone(),
                    baseline: None,
                }));
                entries.len() - 1
            }
        };

        match &mut entries[index] {
            ConfigEntry::Channel(entry) => Slot::Flat(entry),
            ConfigEntry::Group(g) => {
                let pos = g
                    .channels
                    .iter()
                    .position(|c| c.channel_id() == target.channel_id)
                    .unwrap_or(g.channels.len() - 1);
                Slot::Grouped(&mut g.channels[pos])
            }
        }
    }

    pub fn render(&self) -> Result<String, StoreError> {
        let rendered = match self.format {
            ConfigFormat::Json => serde_json::to_string_pretty(&self.root).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::to_string_pretty(&self.root).map_err(|e| e.to_string()),
        };
        rendered.map_err(|reason| StoreError::Serialize {
            path: self.path.clone(),
            reason,
        })
    }

    /// Rewrite the file, preserving shape, format and every baseline.
    pub async fn save(&self) -> Result<(), StoreError> {
        let rendered = self.render()?;
        write_atomic(&self.path, rendered.as_bytes()).await
    }
}

enum Slot<'a> {
    Flat(&'a mut ChannelEntry),
    Grouped(&'a mut GroupedChannel),
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUPED: &str = r#"[
        {
            "guildId": "100",
            "guildName": "Rustaceans",
            "channels": ["200", {"channelId": "201", "channelName": "general"}]
        },
        {"guild_id": "300", "channel_id": "400"}
    ]"#;

    fn grouped() -> ChannelConfig {
        let root = ChannelConfig::parse(GROUPED, ConfigFormat::Json).unwrap();
        ChannelConfig::from_root("channels.json", ConfigFormat::Json, root)
    }

    fn baseline(id: &str) -> Baseline {
        Baseline {
            last_message_id: id.to_string(),
            content: Some("hi".to_string()),
            timestamp: Some("2026-01-01T00:00:00+00:00".to_string()),
        }
    }

    #[test]
    fn test_both_shapes_normalize() {
        let targets = grouped().targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].key(), "100_200");
        assert_eq!(targets[0].guild_name.as_deref(), Some("Rustaceans"));
        assert_eq!(targets[1].channel_name.as_deref(), Some("general"));
        assert_eq!(targets[2].key(), "300_400");
        assert_eq!(targets[2].guild_name, None);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let json = r#"[{"guildId": "1", "channelId": "2"}, {"guildId": "1", "channelId": "2"}]"#;
        let root = ChannelConfig::parse(json, ConfigFormat::Json).unwrap();
        let config = ChannelConfig::from_root("c.json", ConfigFormat::Json, root);
        assert_eq!(config.targets().len(), 1);
    }

    #[test]
    fn test_set_baseline_upgrades_bare_id_and_keeps_others() {
        let mut config = grouped();
        let target = ChannelTarget::new("100", "200");
        config.set_baseline(&target, baseline("555"));

        assert_eq!(config.baseline(&target), Some(baseline("555")));
        assert_eq!(config.baseline(&ChannelTarget::new("100", "201")), None);
        assert_eq!(config.targets().len(), 3);

        let rendered = config.render().unwrap();
        assert!(rendered.contains("\"lastMessageId\": \"555\""));
        assert!(rendered.contains("\"channelName\": \"general\""));
    }

    #[test]
    fn test_set_baseline_creates_missing_entries() {
        let mut config = grouped();

        // Known guild: joins the existing group.
        let in_group = ChannelTarget::new("100", "202");
        config.set_baseline(&in_group, baseline("1"));
        // Unknown guild: added as a flat entry.
        let new_guild = ChannelTarget::new("900", "901");
        config.set_baseline(&new_guild, baseline("2"));

        assert_eq!(config.baseline(&in_group), Some(baseline("1")));
        assert_eq!(config.baseline(&new_guild), Some(baseline("2")));
        let keys: Vec<_> = config.targets().iter().map(|t| t.key()).collect();
        assert_eq!(keys, vec!["100_200", "100_201", "100_202", "300_400", "900_901"]);
    }

    #[test]
    fn test_toml_round_trip_keeps_table_shape() {
        let toml_src = r#"
[[channels]]
guildId = "1"
channelId = "2"
channelName = "alerts"
"#;
        let root = ChannelConfig::parse(toml_src, ConfigFormat::Toml).unwrap();
        let mut config = ChannelConfig::from_root("c.toml", ConfigFormat::Toml, root);
        let target = ChannelTarget::new("1", "2");
        config.set_baseline(&target, baseline("77"));

        let rendered = config.render().unwrap();
        let reparsed = ChannelConfig::parse(&rendered, ConfigFormat::Toml).unwrap();
        assert!(matches!(reparsed, ConfigRoot::Table { .. }));
        let config = ChannelConfig::from_root("c.toml", ConfigFormat::Toml, reparsed);
        assert_eq!(config.baseline(&target), Some(baseline("77")));
        assert_eq!(config.targets()[0].channel_name.as_deref(), Some("alerts"));
    }

    #[test]
    fn test_set_display_updates_group_and_channel() {
        let mut config = grouped();
        let mut target = ChannelTarget::new("100", "200");
        target.guild_name = Some("Renamed".to_string());
        target.guild_icon = Some("a_abc".to_string());
        target.channel_name = Some("announcements".to_string());
        config.set_baseline(&ChannelTarget::new("100", "201"), baseline("9"));
        config.set_display(&target);

        let targets = config.targets();
        assert_eq!(targets[0].channel_name.as_deref(), Some("announcements"));
        assert_eq!(targets[1].guild_name.as_deref(), Some("Renamed"));
        assert_eq!(targets[1].guild_icon.as_deref(), Some("a_abc"));
        assert_eq!(config.baseline(&ChannelTarget::new("100", "201")), Some(baseline("9")));
    }
}
