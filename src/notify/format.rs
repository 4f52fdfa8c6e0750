//! Slack Block Kit rendering of a Discord message.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::discord::{Attachment, SourceMessage};
use crate::targets::ChannelTarget;

/// Slack rejects text blocks longer than this.
pub const MAX_BLOCK_CHARS: usize = 3000;
/// Slack rejects messages with more blocks than this.
pub const MAX_BLOCKS: usize = 50;
const ICON_SIZE: u32 = 64;
/// Length of `&amp;`, the longest mrkdwn entity.
const LONGEST_ENTITY_CHARS: usize = 5;
const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".webp"];

pub fn guild_icon_url(guild_id: &str, icon_hash: &str) -> String {
    let ext = if icon_hash.starts_with("a_") { "gif" } else { "png" };
    format!(
        "https://cdn.discordapp.com/icons/{}/{}.{}?size={}",
        guild_id, icon_hash, ext, ICON_SIZE
    )
}

pub fn message_link(target: &ChannelTarget, message_id: &str) -> String {
    format!(
        "https://discord.com/channels/{}/{}/{}",
        target.guild_id, target.channel_id, message_id
    )
}

/// Cut `content` into consecutive pieces of at most `max_chars` characters.
pub fn split_chunks(content: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

fn has_image_extension(candidate: &str) -> bool {
    let path = candidate.split(['?', '#']).next().unwrap_or_default();
    let lowered = path.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

pub fn is_image(attachment: &Attachment) -> bool {
    attachment.filename.as_deref().is_some_and(has_image_extension)
        || attachment.url.as_deref().is_some_and(has_image_extension)
}

fn mrkdwn_entity(c: char) -> Option<&'static str> {
    match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        _ => None,
    }
}

fn escape_mrkdwn(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match mrkdwn_entity(c) {
            Some(entity) => out.push_str(entity),
            None => out.push(c),
        }
    }
    out
}

/// Escape `content` for mrkdwn and cut it into pieces of at most `max_chars`
/// escaped characters. Entities are never split across pieces.
pub fn split_escaped_chunks(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(LONGEST_ENTITY_CHARS);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut used = 0usize;

    for c in content.chars() {
        let (piece_len, entity) = match mrkdwn_entity(c) {
            Some(entity) => (entity.len(), Some(entity)),
            None => (1, None),
        };
        if used + piece_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        match entity {
            Some(entity) => current.push_str(entity),
            None => current.push(c),
        }
        used += piece_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn format_timestamp(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| {
            dt.with_timezone(&Utc)
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
        })
        .unwrap_or_else(|_| raw.to_string())
}

fn author_name(message: &SourceMessage) -> &str {
    message
        .author
        .global_name
        .as_deref()
        .or(message.author.username.as_deref())
        .unwrap_or("unknown")
}

fn header_block(target: &ChannelTarget) -> Value {
    let mut elements = Vec::new();
    if let Some(icon) = &target.guild_icon {
        elements.push(json!({
            "type": "image",
            "image_url": guild_icon_url(&target.guild_id, icon),
            "alt_text": target.display_guild(),
        }));
    }
    elements.push(json!({
        "type": "mrkdwn",
        "text": format!(
            "*{}* · {}",
            escape_mrkdwn(&target.display_channel()),
            escape_mrkdwn(target.display_guild())
        ),
    }));
    json!({ "type": "context", "elements": elements })
}

fn body_blocks(content: &str) -> Vec<Value> {
    if content.contains('\n') {
        split_chunks(content, MAX_BLOCK_CHARS)
            .into_iter()
            .map(|chunk| {
                json!({
                    "type": "rich_text",
                    "elements": [{
                        "type": "rich_text_preformatted",
                        "elements": [{ "type": "text", "text": chunk }],
                    }],
                })
            })
            .collect()
    } else {
        split_escaped_chunks(content, MAX_BLOCK_CHARS)
            .into_iter()
            .map(|chunk| {
                json!({
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": chunk },
                })
            })
            .collect()
    }
}

/// Build the webhook payload for one message.
pub fn format_message(message: &SourceMessage, target: &ChannelTarget) -> Value {
    let author = author_name(message);
    let mut blocks = vec![
        header_block(target),
        json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("*{}* · {}", escape_mrkdwn(author), format_timestamp(&message.timestamp)),
            }],
        }),
    ];

    let images: Vec<&Attachment> = message.attachments.iter().filter(|a| is_image(a)).collect();

    if message.content.is_empty() {
        if images.is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": "_(no text content)_" },
            }));
        }
    } else {
        blocks.extend(body_blocks(&message.content));
    }

    for attachment in images {
        let Some(url) = attachment.url.as_deref().or(attachment.proxy_url.as_deref()) else {
            continue;
        };
        blocks.push(json!({
            "type": "image",
            "image_url": url,
            "alt_text": attachment.filename.as_deref().unwrap_or("attachment"),
        }));
    }

    blocks.push(json!({
        "type": "actions",
        "elements": [{
            "type": "button",
            "text": { "type": "plain_text", "text": "Open in Discord" },
            "url": message_link(target, &message.id),
        }],
    }));

    let preview: String = message.content.chars().take(150).collect();
    json!({
        "text": format!("{} in {}: {}", author, target.display_channel(), preview),
        "blocks": blocks,
    })
}
