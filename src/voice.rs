//! Leave voice channels that nobody is listening in.

use crate::error::ModerationResult;
use crate::events::VoiceStateEvent;
use crate::scheduler::{DeferredActionScheduler, DeferredExecutor, ShardFilter};
use crate::store::SharedStoreClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline namespace for idle disconnects
pub const VOICE_NAMESPACE: &str = "deadline:voice";

/// Payload stored with an idle-disconnect deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDisconnect {
    pub guild_id: u64,
    pub channel_id: u64,
}

/// Leaves a guild's voice channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceDisconnector: Send + Sync {
    async fn disconnect(&self, guild_id: u64) -> ModerationResult<()>;
}

struct IdleDisconnectExecutor {
    disconnector: Arc<dyn VoiceDisconnector>,
    shards: ShardFilter,
}

#[async_trait]
impl DeferredExecutor<VoiceDisconnect> for IdleDisconnectExecutor {
    fn owns(&self, subject: &str) -> bool {
        subject
            .parse::<u64>()
            .is_ok_and(|guild_id| self.shards.owns_guild(guild_id))
    }

    async fn execute(&self, _subject: &str, payload: VoiceDisconnect) {
        match self.disconnector.disconnect(payload.guild_id).await {
            Ok(()) => info!(
                guild_id = payload.guild_id,
                channel_id = payload.channel_id,
                "Left idle voice channel"
            ),
            Err(e) => warn!(guild_id = payload.guild_id, error = %e, "Failed to leave idle voice channel"),
        }
    }
}

/// Schedules a disconnect once the bot is alone in a voice channel, and
/// cancels it when someone comes back.
#[derive(Debug, Clone)]
pub struct VoiceIdleMonitor {
    scheduler: DeferredActionScheduler<VoiceDisconnect>,
    idle_timeout: Duration,
}

impl VoiceIdleMonitor {
    #[must_use]
    pub fn new(
        store: SharedStoreClient,
        disconnector: Arc<dyn VoiceDisconnector>,
        shards: ShardFilter,
        idle_timeout: Duration,
        ttl_margin: Duration,
    ) -> Self {
        let executor = Arc::new(IdleDisconnectExecutor {
            disconnector,
            shards,
        });
        Self {
            scheduler: DeferredActionScheduler::new(VOICE_NAMESPACE, store, executor, ttl_margin),
            idle_timeout,
        }
    }

    /// Start polling for disconnects whose shard went away
    pub fn start(&self, poll_interval: Duration) {
        self.scheduler.start(poll_interval);
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub async fn is_pending(&self, guild_id: u64) -> bool {
        self.scheduler.is_pending(&guild_id.to_string()).await
    }

    /// React to a voice state change of the bot's channel in a guild.
    pub async fn handle_voice_state(&self, event: VoiceStateEvent) {
        let subject = event.guild_id.to_string();
        // Any change restarts the idle clock from scratch
        self.scheduler.cancel(&subject).await;

        let Some(channel_id) = event.channel_id else {
            debug!(guild_id = event.guild_id, "Not in voice, nothing to watch");
            return;
        };
        if event.human_member_count > 0 {
            return;
        }

        debug!(guild_id = event.guild_id, channel_id, "Voice channel idle, scheduling disconnect");
        self.scheduler
            .schedule(
                &subject,
                self.idle_timeout,
                VoiceDisconnect {
                    guild_id: event.guild_id,
                    channel_id,
                },
            )
            .await;
    }
}
