use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};

use crate::antiraid::{JoinRateMonitor, RaidModeState};
use crate::automod::ViolationEscalationEngine;
use crate::cache::NamespacedCache;
use crate::config::{GUILD_NAMESPACE, GuildConfigStore, Settings};
use crate::counters::SlidingWindowCounters;
use crate::error::ConfigError;
use crate::moderation::ModerationSink;
use crate::store::{RedisStore, SharedStore, SharedStoreClient};
use crate::voice::{VoiceDisconnector, VoiceIdleMonitor};
use poise::serenity_prelude::prelude::TypeMapKey;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Namespace active raids are published under
pub const RAID_NAMESPACE: &str = "raid";

/// Services of one shard, shared by the event handler and the commands
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("store", &self.store)
            .field("guild_configs", &self.guild_configs)
            .field("raids", &self.raids)
            .field("automod", &self.automod)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct DataInner {
    pub settings: Settings,
    pub store: SharedStoreClient,
    pub cache: Arc<NamespacedCache>,
    pub counters: SlidingWindowCounters,
    pub guild_configs: GuildConfigStore,
    pub raids: Arc<JoinRateMonitor>,
    pub automod: ViolationEscalationEngine,
    pub voice: VoiceIdleMonitor,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Data {
    /// Wire every service of a shard. The shared store connects in the
    /// background; until it answers everything runs on local state.
    ///
    /// # Errors
    ///
    /// Returns an error if the guild configuration file cannot be read or
    /// parsed.
    pub async fn build(
        settings: Settings,
        sink: Arc<dyn ModerationSink>,
        disconnector: Arc<dyn VoiceDisconnector>,
    ) -> Result<Self, ConfigError> {
        let store = Self::connect_store(&settings);
        let cache = Arc::new(NamespacedCache::new(store.clone(), settings.cache_options()));
        let counters = SlidingWindowCounters::new(store.clone());
        let sweeper = counters.spawn_sweeper(settings.sweep_interval());

        let guild_configs =
            GuildConfigStore::load(&settings.guild_configs_file, cache.namespace(GUILD_NAMESPACE))
                .await?;
        let raids = Arc::new(
            JoinRateMonitor::new()
                .with_sink(Arc::clone(&sink))
                .with_persistence(cache.namespace::<RaidModeState>(RAID_NAMESPACE)),
        );
        let automod = ViolationEscalationEngine::new(counters.clone(), Arc::clone(&raids), sink);
        let voice = VoiceIdleMonitor::new(
            store.clone(),
            disconnector,
            settings.shard_filter(),
            settings.voice_idle_timeout(),
            settings.scheduler_ttl_margin(),
        );
        voice.start(settings.scheduler_poll_interval());

        Ok(Self(Arc::new(DataInner {
            settings,
            store,
            cache,
            counters,
            guild_configs,
            raids,
            automod,
            voice,
            sweeper: Mutex::new(Some(sweeper)),
        })))
    }

    fn connect_store(settings: &Settings) -> SharedStoreClient {
        let Some(url) = settings.redis_url.as_deref() else {
            return SharedStoreClient::local_only();
        };
        match RedisStore::new(url, settings.key_prefix.clone(), settings.op_timeout()) {
            Ok(redis) => {
                let client = SharedStoreClient::new(Arc::new(redis) as Arc<dyn SharedStore>);
                client.connect_in_background();
                client
            }
            Err(e) => {
                warn!("Shared store disabled: {e}");
                SharedStoreClient::local_only()
            }
        }
    }

    /// Restore raid state published before a restart, for the guilds this
    /// shard just received.
    pub async fn restore_guilds(&self, guild_ids: &[u64]) -> usize {
        let mut restored = 0;
        for &guild_id in guild_ids {
            if self.raids.restore_guild(guild_id).await.is_some() {
                restored += 1;
            }
        }
        restored
    }

    /// Forget every per-guild timer and counter after leaving a guild.
    pub async fn forget_guild(&self, guild_id: u64) {
        self.raids.forget_guild(guild_id).await;
        self.automod.forget_guild(guild_id).await;
        self.guild_configs.invalidate(guild_id).await;
        info!(guild_id, "Forgot guild state");
    }

    /// Stop every background task of the shard. Idempotent.
    pub fn shutdown(&self) {
        self.voice.shutdown();
        self.raids.shutdown();
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        self.cache.destroy();
        self.store.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuildConfig;
    use crate::events::{JoinEvent, MessageEvent};
    use crate::moderation::MockModerationSink;
    use crate::voice::MockVoiceDisconnector;

    fn settings() -> Settings {
        Settings {
            guild_configs_file: "data/does-not-exist.yaml".to_string(),
            ..Settings::default()
        }
    }

    async fn data(sink: MockModerationSink) -> Data {
        Data::build(settings(), Arc::new(sink), Arc::new(MockVoiceDisconnector::new()))
            .await
            .expect("builds without a config file")
    }

    #[tokio::test]
    async fn test_build_without_shared_store() {
        let data = data(MockModerationSink::new()).await;
        assert!(!data.store.is_connected());
        assert!(data.guild_configs.is_empty());
        let debug_output = format!("{data:?}");
        assert!(debug_output.contains("Data"));
        assert!(debug_output.contains("guild_configs"));
        data.shutdown();
        data.shutdown();
    }

    #[tokio::test]
    async fn test_message_flows_through_configured_guild() {
        let mut sink = MockModerationSink::new();
        sink.expect_delete_message().times(1).returning(|_, _| Ok(()));
        sink.expect_warn_user().times(1).returning(|_, _, _, _| Ok(()));
        let data = data(sink).await;

        let mut config = GuildConfig::for_guild(5);
        config.filter.words = vec!["forbidden".to_string()];
        data.guild_configs.upsert(config).await;

        let event = MessageEvent {
            guild_id: 5,
            channel_id: 6,
            message_id: 7,
            author_id: 8,
            author_role_ids: Vec::new(),
            content: "this is f0rbidden".to_string(),
            timestamp_ms: 1_000_000_000_000,
            account_created_at_ms: None,
        };
        let config = data.guild_configs.get(5).await;
        let (violation, outcome) = data
            .automod
            .handle_message(event, config)
            .await
            .expect("filtered word is caught");
        assert_eq!(violation.trigger, "forbidden");
        assert_eq!(outcome.warn_count, 1);
        data.shutdown();
    }

    #[tokio::test]
    async fn test_restore_guilds_picks_up_published_raid() {
        fn assert_send<T: Send>(_: &T) {}

        let data = data(MockModerationSink::new()).await;
        let config = GuildConfig::for_guild(4);
        data.raids
            .activate_raid_mode(4, "moderator", "testing", &config.raid)
            .await;
        // A restart drops in-memory raid state but keeps the published copy
        data.raids.forget_local(4);

        let guild_ids = vec![4, 5];
        let restore = data.restore_guilds(&guild_ids);
        assert_send(&restore);
        assert_eq!(restore.await, 1);
        assert!(data.raids.is_raid_mode_active(4));
        data.shutdown();
    }

    #[tokio::test]
    async fn test_forget_guild_ends_raid() {
        let data = data(MockModerationSink::new()).await;
        let config = GuildConfig::for_guild(3);
        data.raids
            .activate_raid_mode(3, "moderator", "testing", &config.raid)
            .await;
        assert!(data.raids.is_raid_mode_active(3));

        data.forget_guild(3).await;
        assert!(!data.raids.is_raid_mode_active(3));
        assert_eq!(data.restore_guilds(&[3]).await, 0);
        let analysis = data.raids.track_join(
            &JoinEvent {
                guild_id: 3,
                user_id: 1,
                account_created_at_ms: 0,
                joined_at_ms: 1_000,
            },
            &config.raid,
        );
        assert_eq!(analysis.stats.join_count, 1);
        data.shutdown();
    }
}
