use crate::antiraid::RaidModeState;
use crate::cache::CacheStats;
use crate::{Context, Error};
use poise::command;

/// Manage raid mode for this server
#[command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("raidmode_on", "raidmode_off", "raidmode_status")
)]
pub async fn raidmode(ctx: Context<'_>) -> Result<(), Error> {
    raidmode_status_inner(ctx).await
}

/// Turn raid mode on, locking the configured channels
#[command(slash_command, prefix_command, guild_only, rename = "on")]
pub async fn raidmode_on(
    ctx: Context<'_>,
    #[description = "Why raid mode is being enabled"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let data = ctx.data();
    let config = data.guild_configs.get(guild_id.get()).await;
    let reason = reason.unwrap_or_else(|| "manual activation".to_string());
    let state = data
        .raids
        .activate_raid_mode(guild_id.get(), &ctx.author().name, &reason, &config.raid)
        .await;
    ctx.say(format!("Raid mode is on. {}", describe(&state))).await?;
    Ok(())
}

/// Turn raid mode off and unlock channels
#[command(slash_command, prefix_command, guild_only, rename = "off")]
pub async fn raidmode_off(ctx: Context<'_>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let ended = ctx
        .data()
        .raids
        .deactivate_raid_mode(guild_id.get(), &ctx.author().name)
        .await;
    let reply = if ended.is_some() {
        "Raid mode is off."
    } else {
        "Raid mode was not active."
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Show whether raid mode is active
#[command(slash_command, prefix_command, guild_only, rename = "status")]
pub async fn raidmode_status(ctx: Context<'_>) -> Result<(), Error> {
    raidmode_status_inner(ctx).await
}

async fn raidmode_status_inner(ctx: Context<'_>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let reply = match ctx.data().raids.raid_state(guild_id.get()) {
        Some(state) if state.active => format!("Raid mode is on. {}", describe(&state)),
        _ => "Raid mode is off.".to_string(),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Show shared cache statistics for this shard
#[command(slash_command, prefix_command, required_permissions = "MANAGE_GUILD")]
pub async fn cachestats(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let reply = format_stats(&data.cache.stats(), data.cache.is_connected());
    ctx.say(reply).await?;
    Ok(())
}

fn describe(state: &RaidModeState) -> String {
    let unlock_at = chrono::DateTime::from_timestamp_millis(
        i64::try_from(state.auto_unlock_at_ms).unwrap_or(i64::MAX),
    )
    .map_or_else(|| "unknown".to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string());
    format!(
        "Enabled by {} ({}), auto-unlock at {unlock_at}, {} channel(s) locked.",
        state.activated_by,
        state.reason,
        state.locked_channels.len()
    )
}

fn format_stats(stats: &CacheStats, connected: bool) -> String {
    format!(
        "Shared store: {}\nEntries: {}\nHits: {} / Misses: {} ({:.1}% hit rate)\nEvictions: {}",
        if connected { "connected" } else { "local fallback" },
        stats.size,
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0,
        stats.evictions
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raidmode_command_definition() {
        let cmd = raidmode();
        assert_eq!(cmd.name, "raidmode");
        assert!(cmd.guild_only);
        let names: Vec<_> = cmd.subcommands.iter().map(|sub| sub.name.as_str()).collect();
        assert_eq!(names, vec!["on", "off", "status"]);
    }

    #[test]
    fn test_cachestats_command_definition() {
        let cmd = cachestats();
        assert_eq!(cmd.name, "cachestats");
        assert!(cmd.create_as_slash_command().is_some());
    }

    #[test]
    fn test_format_stats() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            evictions: 2,
            size: 10,
        };
        let text = format_stats(&stats, false);
        assert!(text.contains("local fallback"));
        assert!(text.contains("75.0% hit rate"));
        assert!(text.contains("Evictions: 2"));
    }

    #[test]
    fn test_describe_raid_state() {
        let state = RaidModeState {
            active: true,
            activated_at_ms: 0,
            activated_by: "mod".to_string(),
            reason: "join burst".to_string(),
            auto_unlock_at_ms: 600_000,
            locked_channels: vec![1, 2],
        };
        let text = describe(&state);
        assert!(text.contains("mod (join burst)"));
        assert!(text.contains("1970-01-01 00:10 UTC"));
        assert!(text.contains("2 channel(s)"));
    }
}
