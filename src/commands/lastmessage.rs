use crate::error::QueryError;
use crate::{Context, Error};
use tracing::{info, warn};

/// Show the newest message of a monitored channel
#[poise::command(slash_command)]
pub async fn lastmessage(
    ctx: Context<'_>,
    #[description = "Channel id, #name or guild_channel key"] target: String,
) -> Result<(), Error> {
    if target.trim().is_empty() {
        ctx.say("❌ Please name a channel.").await?;
        return Ok(());
    }

    ctx.defer().await?;

    let query = &ctx.data().query;
    let resolved = match query.resolve(&target).await {
        Ok(resolved) => resolved,
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
    };

    info!(
        user = %ctx.author().id,
        guild = %resolved.guild_id,
        channel = %resolved.channel_id,
        "lastmessage requested"
    );

    match query.last_message(&resolved).await {
        Ok(answer) => {
            ctx.say(answer.render()).await?;
        }
        Err(QueryError::Source(e)) => {
            warn!(channel = %resolved.channel_id, error = %e, "lastmessage lookup failed");
            ctx.say("❌ Could not reach Discord for that channel, try again shortly.")
                .await?;
        }
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
    }

    Ok(())
}
