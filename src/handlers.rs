use crate::error::{ModerationError, ModerationResult};
use crate::events::{JoinEvent, MessageEvent, VoiceStateEvent};
use crate::moderation::ModerationSink;
use crate::voice::VoiceDisconnector;
use crate::{Data, EVENT_TARGET};
use async_trait::async_trait;
use poise::serenity_prelude::{
    self as serenity, ChannelId, Context, EventHandler, GuildId, Http, Member, Message, MessageId,
    PermissionOverwrite, PermissionOverwriteType, Permissions, Ready, RoleId, Timestamp,
    UnavailableGuild, UserId, VoiceState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Gateway events in, core events out
pub struct Handler;

async fn shard_data(ctx: &Context) -> Option<Data> {
    ctx.data.read().await.get::<Data>().cloned()
}

fn timestamp_ms(timestamp: Timestamp) -> u64 {
    u64::try_from(timestamp.unix_timestamp()).unwrap_or_default() * 1000
}

fn message_event(message: &Message, guild_id: GuildId) -> MessageEvent {
    MessageEvent {
        guild_id: guild_id.get(),
        channel_id: message.channel_id.get(),
        message_id: message.id.get(),
        author_id: message.author.id.get(),
        author_role_ids: message
            .member
            .as_ref()
            .map(|member| member.roles.iter().map(|role| role.get()).collect())
            .unwrap_or_default(),
        content: message.content.clone(),
        timestamp_ms: timestamp_ms(message.timestamp),
        account_created_at_ms: Some(timestamp_ms(message.author.id.created_at())),
    }
}

/// Occupancy of the bot's voice channel, if this update concerns it
fn voice_observation(
    ctx: &Context,
    guild_id: GuildId,
    old: Option<&VoiceState>,
    new: &VoiceState,
) -> Option<VoiceStateEvent> {
    let me = ctx.cache.current_user().id;
    let guild = ctx.cache.guild(guild_id)?;
    let bot_channel = guild.voice_states.get(&me).and_then(|state| state.channel_id);

    let touches_bot_channel = bot_channel.is_some_and(|channel| {
        new.channel_id == Some(channel) || old.and_then(|state| state.channel_id) == Some(channel)
    });
    if new.user_id != me && !touches_bot_channel {
        return None;
    }

    let human_member_count = bot_channel.map_or(0, |channel| {
        guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel) && state.user_id != me)
            .filter(|state| {
                let is_bot = state
                    .member
                    .as_ref()
                    .map(|member| member.user.bot)
                    .or_else(|| guild.members.get(&state.user_id).map(|member| member.user.bot));
                !is_bot.unwrap_or(false)
            })
            .count()
    });

    Some(VoiceStateEvent {
        guild_id: guild_id.get(),
        channel_id: bot_channel.map(ChannelId::get),
        human_member_count,
    })
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!("Connected as {user_name}, shard {shard_id}");

        if let Some(data) = shard_data(&ctx).await {
            let guild_ids: Vec<u64> = ready.guilds.iter().map(|guild| guild.id.get()).collect();
            let restored = data.restore_guilds(&guild_ids).await;
            if restored > 0 {
                info!(target: EVENT_TARGET, restored, "Restored raid mode for guilds");
            }
        }
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!("Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn message(&self, ctx: Context, message: Message) {
        let Some(guild_id) = message.guild_id else { return };
        if message.author.bot {
            return;
        }
        let Some(data) = shard_data(&ctx).await else { return };

        let config = data.guild_configs.get(guild_id.get()).await;
        if let Some((violation, outcome)) = data
            .automod
            .handle_message(message_event(&message, guild_id), config)
            .await
        {
            debug!(
                target: EVENT_TARGET,
                kind = %violation.kind,
                warn_count = outcome.warn_count,
                failures = outcome.failures,
                "Automod handled message"
            );
        }
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        let Some(data) = shard_data(&ctx).await else { return };
        let event = JoinEvent {
            guild_id: new_member.guild_id.get(),
            user_id: new_member.user.id.get(),
            account_created_at_ms: timestamp_ms(new_member.user.id.created_at()),
            joined_at_ms: timestamp_ms(new_member.joined_at.unwrap_or_else(Timestamp::now)),
        };
        let config = data.guild_configs.get(event.guild_id).await;
        let analysis = data.raids.handle_join(&event, &config.raid).await;
        if analysis.is_suspicious {
            debug!(
                target: EVENT_TARGET,
                guild_id = event.guild_id,
                joins = analysis.stats.join_count,
                new_accounts = analysis.stats.new_accounts,
                "Suspicious join activity"
            );
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        // Cache guards are not Send, so read everything before awaiting
        let Some(event) = voice_observation(&ctx, guild_id, old.as_ref(), &new) else {
            return;
        };
        let Some(data) = shard_data(&ctx).await else { return };
        data.voice.handle_voice_state(event).await;
    }

    async fn guild_delete(
        &self,
        ctx: Context,
        incomplete: UnavailableGuild,
        _full: Option<serenity::Guild>,
    ) {
        // An unavailable guild is an outage, not a leave
        if incomplete.unavailable {
            return;
        }
        if let Some(data) = shard_data(&ctx).await {
            data.forget_guild(incomplete.id.get()).await;
        }
    }
}

/// Map an HTTP failure onto the moderation error it stands for
fn classify(error: serenity::Error) -> ModerationError {
    if let serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(response)) = &error {
        match response.status_code.as_u16() {
            403 => return ModerationError::MissingPermission(response.error.message.clone()),
            404 => return ModerationError::NotFound(response.error.message.clone()),
            _ => {}
        }
    }
    ModerationError::from(error)
}

/// Carries out moderation decisions through the Discord HTTP API
#[derive(Clone)]
pub struct SerenityModeration {
    http: Arc<Http>,
}

impl SerenityModeration {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    async fn member(&self, guild_id: u64, user_id: u64) -> ModerationResult<Member> {
        GuildId::new(guild_id)
            .member(&*self.http, UserId::new(user_id))
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl ModerationSink for SerenityModeration {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> ModerationResult<()> {
        ChannelId::new(channel_id)
            .delete_message(&*self.http, MessageId::new(message_id))
            .await
            .map_err(classify)
    }

    async fn warn_user(
        &self,
        _guild_id: u64,
        channel_id: u64,
        user_id: u64,
        reason: &str,
    ) -> ModerationResult<()> {
        ChannelId::new(channel_id)
            .say(&*self.http, format!("<@{user_id}> {reason}"))
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn mute_user(
        &self,
        guild_id: u64,
        user_id: u64,
        duration: Duration,
        reason: &str,
    ) -> ModerationResult<()> {
        let mut member = self.member(guild_id, user_id).await?;
        let seconds = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        let until = chrono::Utc::now() + chrono::Duration::seconds(seconds);
        member
            .disable_communication_until_datetime(&*self.http, until.into())
            .await
            .map_err(classify)?;
        info!(target: EVENT_TARGET, guild_id, user_id, %until, reason, "Muted member");
        Ok(())
    }

    async fn kick_user(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()> {
        let member = self.member(guild_id, user_id).await?;
        member.kick_with_reason(&*self.http, reason).await.map_err(classify)
    }

    async fn ban_user(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .ban_with_reason(&*self.http, UserId::new(user_id), 0, reason)
            .await
            .map_err(classify)
    }

    async fn lock_channel(&self, guild_id: u64, channel_id: u64) -> ModerationResult<()> {
        // The @everyone role shares the guild's id
        let overwrite = PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::SEND_MESSAGES,
            kind: PermissionOverwriteType::Role(RoleId::new(guild_id)),
        };
        ChannelId::new(channel_id)
            .create_permission(&*self.http, overwrite)
            .await
            .map_err(classify)
    }

    async fn unlock_channel(&self, guild_id: u64, channel_id: u64) -> ModerationResult<()> {
        ChannelId::new(channel_id)
            .delete_permission(&*self.http, PermissionOverwriteType::Role(RoleId::new(guild_id)))
            .await
            .map_err(classify)
    }

    async fn send_notification(&self, channel_id: u64, message: &str) -> ModerationResult<()> {
        ChannelId::new(channel_id)
            .say(&*self.http, message)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Leaves voice by disconnecting the bot's own member
#[derive(Clone)]
pub struct SerenityVoice {
    http: Arc<Http>,
}

impl SerenityVoice {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl VoiceDisconnector for SerenityVoice {
    async fn disconnect(&self, guild_id: u64) -> ModerationResult<()> {
        let me = self.http.get_current_user().await.map_err(classify)?;
        let member = GuildId::new(guild_id)
            .member(&*self.http, me.id)
            .await
            .map_err(classify)?;
        member.disconnect_from_voice(&*self.http).await.map_err(classify)?;
        Ok(())
    }
}
