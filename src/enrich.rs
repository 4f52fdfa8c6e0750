//! One-shot startup lookup of channel and guild display names.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::baseline::BaselineStore;
use crate::discord::{GuildInfo, MessageSource};
use crate::targets::ChannelTarget;

/// Fill in missing channel names, guild names and icons. Lookups are best
/// effort; a failed lookup leaves that target as it was. When `persist` is set
/// the channel config is written back once at the end.
pub async fn enrich_targets(
    source: &dyn MessageSource,
    store: &BaselineStore,
    targets: Vec<ChannelTarget>,
    persist: bool,
) -> Vec<ChannelTarget> {
    let mut guilds: HashMap<String, Option<GuildInfo>> = HashMap::new();
    let mut enriched = Vec::with_capacity(targets.len());
    let mut updated = 0usize;

    for mut target in targets {
        if !target.needs_enrichment() {
            enriched.push(target);
            continue;
        }

        if target.channel_name.is_none() {
            match source.channel(&target.channel_id).await {
                Ok(channel) => target.channel_name = channel.name,
                Err(e) => warn!(
                    guild = %target.guild_id,
                    channel = %target.channel_id,
                    error = %e,
                    "Channel lookup failed"
                ),
            }
        }

        if target.guild_name.is_none() || target.guild_icon.is_none() {
            if !guilds.contains_key(&target.guild_id) {
                let info = match source.guild(&target.guild_id).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!(guild = %target.guild_id, error = %e, "Guild lookup failed");
                        None
                    }
                };
                guilds.insert(target.guild_id.clone(), info);
            }
            if let Some(Some(info)) = guilds.get(&target.guild_id) {
                if target.guild_name.is_none() {
                    target.guild_name = info.name.clone();
                }
                if target.guild_icon.is_none() {
                    target.guild_icon = info.icon.clone();
                }
            }
        }

        store.update_display(&target).await;
        updated += 1;
        enriched.push(target);
    }

    info!(updated, "Channel enrichment finished");

    if persist && updated > 0 {
        if let Err(e) = store.persist_primary().await {
            warn!(error = %e, "Failed to write enriched channel config");
        }
    }

    enriched
}
