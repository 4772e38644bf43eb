//! Join-burst detection and raid mode.
//!
//! Joins are kept per guild in a rolling buffer covering the detection
//! window. Raid mode is a per-guild state that only changes through
//! [`JoinRateMonitor::activate_raid_mode`], [`JoinRateMonitor::deactivate_raid_mode`]
//! or the auto-unlock timer armed on activation.

use crate::ANTIRAID_TARGET;
use crate::cache::TypedNamespace;
use crate::clock::{duration_ms, now_ms};
use crate::config::{NewAccountAction, RaidConfig};
use crate::events::JoinEvent;
use crate::logging::log_raid_event;
use crate::moderation::ModerationSink;
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upper bound on buffered joins per guild, whatever the window
const MAX_BUFFERED_JOINS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRecord {
    pub user_id: u64,
    pub joined_at_ms: u64,
    pub account_created_at_ms: u64,
}

impl JoinRecord {
    fn account_age_ms(&self) -> u64 {
        self.joined_at_ms.saturating_sub(self.account_created_at_ms)
    }
}

/// Why a join looked bad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RaidTrigger {
    #[display("join_burst({_0})")]
    JoinBurst(usize),
    #[display("new_account_cluster({_0})")]
    NewAccountCluster(usize),
    #[display("new_account")]
    NewAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinStats {
    pub join_count: usize,
    pub new_accounts: usize,
}

/// Result of [`JoinRateMonitor::track_join`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAnalysis {
    pub is_raid: bool,
    /// The joining account itself is younger than the configured age
    pub is_suspicious: bool,
    pub triggers: Vec<RaidTrigger>,
    pub stats: JoinStats,
}

/// Result of [`JoinRateMonitor::check_account_age`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountAgeCheck {
    pub suspicious: bool,
    pub account_age: Duration,
    /// Suggested handling when suspicious
    pub action: Option<NewAccountAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidModeState {
    pub active: bool,
    pub activated_at_ms: u64,
    pub activated_by: String,
    pub reason: String,
    pub auto_unlock_at_ms: u64,
    pub locked_channels: Vec<u64>,
}

pub struct JoinRateMonitor {
    joins: DashMap<u64, VecDeque<JoinRecord>>,
    raids: DashMap<u64, RaidModeState>,
    unlock_timers: DashMap<u64, JoinHandle<()>>,
    sink: Option<Arc<dyn ModerationSink>>,
    /// Published raid states, so a restarted shard can pick raid mode back up
    persisted: Option<TypedNamespace<RaidModeState>>,
}

impl std::fmt::Debug for JoinRateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRateMonitor")
            .field("tracked_guilds", &self.joins.len())
            .field("raids", &self.raids.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for JoinRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinRateMonitor {
    /// Monitor that only tracks state, without platform side effects.
    #[must_use]
    pub fn new() -> Self {
        Self {
            joins: DashMap::new(),
            raids: DashMap::new(),
            unlock_timers: DashMap::new(),
            sink: None,
            persisted: None,
        }
    }

    /// Lock channels, notify and act on suspicious joins through `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ModerationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publish raid states to a cache namespace.
    #[must_use]
    pub fn with_persistence(mut self, namespace: TypedNamespace<RaidModeState>) -> Self {
        self.persisted = Some(namespace);
        self
    }

    /// Record a join and analyse the guild's recent joins.
    pub fn track_join(&self, event: &JoinEvent, config: &RaidConfig) -> JoinAnalysis {
        let record = JoinRecord {
            user_id: event.user_id,
            joined_at_ms: event.joined_at_ms,
            account_created_at_ms: event.account_created_at_ms,
        };
        let now = event.joined_at_ms;
        let new_account_ms = duration_ms(config.new_account_age());

        let stats = {
            let mut buffer = self.joins.entry(event.guild_id).or_default();
            buffer.push_back(record);
            while buffer
                .front()
                .is_some_and(|oldest| now.saturating_sub(oldest.joined_at_ms) > config.window_ms)
            {
                buffer.pop_front();
            }
            while buffer.len() > MAX_BUFFERED_JOINS {
                buffer.pop_front();
            }
            JoinStats {
                join_count: buffer.len(),
                new_accounts: buffer
                    .iter()
                    .filter(|join| join.account_age_ms() < new_account_ms)
                    .count(),
            }
        };

        let is_raid = stats.join_count >= config.join_threshold;
        let is_suspicious = record.account_age_ms() < new_account_ms;
        let mut triggers = Vec::new();
        if is_raid {
            triggers.push(RaidTrigger::JoinBurst(stats.join_count));
            if stats.new_accounts * 2 >= stats.join_count {
                triggers.push(RaidTrigger::NewAccountCluster(stats.new_accounts));
            }
        }
        if is_suspicious {
            triggers.push(RaidTrigger::NewAccount);
        }

        JoinAnalysis {
            is_raid,
            is_suspicious,
            triggers,
            stats,
        }
    }

    /// Flag a young account joining while raid mode is on.
    #[must_use]
    pub fn check_account_age(&self, event: &JoinEvent, config: &RaidConfig) -> AccountAgeCheck {
        let age_ms = event.joined_at_ms.saturating_sub(event.account_created_at_ms);
        let account_age = Duration::from_millis(age_ms);
        let suspicious =
            account_age < config.new_account_age() && self.is_raid_mode_active(event.guild_id);
        AccountAgeCheck {
            suspicious,
            account_age,
            action: suspicious.then_some(config.new_account_action),
        }
    }

    #[must_use]
    pub fn is_raid_mode_active(&self, guild_id: u64) -> bool {
        self.raids.get(&guild_id).is_some_and(|state| state.active)
    }

    #[must_use]
    pub fn raid_state(&self, guild_id: u64) -> Option<RaidModeState> {
        self.raids.get(&guild_id).map(|entry| entry.value().clone())
    }

    /// Turn raid mode on and arm the auto-unlock timer.
    ///
    /// Activating a guild that is already in raid mode changes nothing and
    /// returns the current state.
    pub async fn activate_raid_mode(
        self: &Arc<Self>,
        guild_id: u64,
        activated_by: &str,
        reason: &str,
        config: &RaidConfig,
    ) -> RaidModeState {
        let now = now_ms();
        let state = {
            let mut entry = self.raids.entry(guild_id).or_insert_with(|| RaidModeState {
                active: false,
                activated_at_ms: 0,
                activated_by: String::new(),
                reason: String::new(),
                auto_unlock_at_ms: 0,
                locked_channels: Vec::new(),
            });
            if entry.active {
                return entry.clone();
            }
            *entry = RaidModeState {
                active: true,
                activated_at_ms: now,
                activated_by: activated_by.to_string(),
                reason: reason.to_string(),
                auto_unlock_at_ms: now.saturating_add(config.auto_unlock_ms),
                locked_channels: config.lock_channels.clone(),
            };
            entry.clone()
        };

        self.arm_unlock_timer(guild_id, config.auto_unlock());
        log_raid_event(guild_id, "activated", &format!("by {activated_by}: {reason}"));

        if let Some(sink) = &self.sink {
            for channel_id in &state.locked_channels {
                if let Err(e) = sink.lock_channel(guild_id, *channel_id).await {
                    warn!(target: ANTIRAID_TARGET, guild_id, channel_id, error = %e, "Failed to lock channel");
                }
            }
            if let Some(channel_id) = config.notify_channel_id {
                let unlock_at = chrono::DateTime::from_timestamp_millis(
                    i64::try_from(state.auto_unlock_at_ms).unwrap_or(i64::MAX),
                )
                .map_or_else(|| "later".to_string(), |at| at.format("%H:%M UTC").to_string());
                let message = format!(
                    "Raid mode enabled by {activated_by}: {reason}. Auto-unlock at {unlock_at}."
                );
                if let Err(e) = sink.send_notification(channel_id, &message).await {
                    warn!(target: ANTIRAID_TARGET, guild_id, error = %e, "Failed to send raid notification");
                }
            }
        }

        if let Some(persisted) = &self.persisted {
            persisted
                .set_with_ttl(&guild_id.to_string(), &state, config.auto_unlock())
                .await;
        }
        state
    }

    /// Turn raid mode off, unlocking channels. Returns the state that ended.
    pub async fn deactivate_raid_mode(
        &self,
        guild_id: u64,
        deactivated_by: &str,
    ) -> Option<RaidModeState> {
        if let Some((_, timer)) = self.unlock_timers.remove(&guild_id) {
            timer.abort();
        }
        self.end_raid(guild_id, deactivated_by).await
    }

    async fn end_raid(&self, guild_id: u64, deactivated_by: &str) -> Option<RaidModeState> {
        let (_, state) = self.raids.remove_if(&guild_id, |_, state| state.active)?;
        log_raid_event(guild_id, "deactivated", &format!("by {deactivated_by}"));

        if let Some(sink) = &self.sink {
            for channel_id in &state.locked_channels {
                if let Err(e) = sink.unlock_channel(guild_id, *channel_id).await {
                    warn!(target: ANTIRAID_TARGET, guild_id, channel_id, error = %e, "Failed to unlock channel");
                }
            }
        }
        if let Some(persisted) = &self.persisted {
            persisted.delete(&guild_id.to_string()).await;
        }
        Some(state)
    }

    fn arm_unlock_timer(self: &Arc<Self>, guild_id: u64, after: Duration) {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(monitor) = monitor.upgrade() else { return };
            // Drop our own handle first so ending the raid cannot abort this task
            monitor.unlock_timers.remove(&guild_id);
            monitor.end_raid(guild_id, "auto-unlock").await;
        });
        if let Some(previous) = self.unlock_timers.insert(guild_id, handle) {
            previous.abort();
        }
    }

    /// Pick up a raid published by a previous run of this shard.
    pub async fn restore_guild(self: &Arc<Self>, guild_id: u64) -> Option<RaidModeState> {
        let persisted = self.persisted.as_ref()?;
        let state = persisted.get(&guild_id.to_string()).await?;
        let now = now_ms();
        if !state.active || state.auto_unlock_at_ms <= now || self.is_raid_mode_active(guild_id) {
            return None;
        }
        self.raids.insert(guild_id, state.clone());
        self.arm_unlock_timer(guild_id, Duration::from_millis(state.auto_unlock_at_ms - now));
        info!(target: ANTIRAID_TARGET, guild_id, "Restored raid mode");
        Some(state)
    }

    /// Track a join, switch raid mode on for a burst when configured to,
    /// and act on a suspicious account.
    pub async fn handle_join(
        self: &Arc<Self>,
        event: &JoinEvent,
        config: &RaidConfig,
    ) -> JoinAnalysis {
        let analysis = self.track_join(event, config);
        if !config.enabled {
            return analysis;
        }

        if analysis.is_raid && config.auto_activate && !self.is_raid_mode_active(event.guild_id) {
            let reason = format!(
                "{} joins within {}s",
                analysis.stats.join_count,
                config.window().as_secs()
            );
            self.activate_raid_mode(event.guild_id, "automatic detection", &reason, config)
                .await;
        }

        let check = self.check_account_age(event, config);
        if let (Some(action), Some(sink)) = (check.action, &self.sink) {
            let reason = format!(
                "Account created {}h ago joined during raid mode",
                check.account_age.as_secs() / 3600
            );
            let result = match action {
                NewAccountAction::Flag => Ok(()),
                NewAccountAction::Kick => {
                    sink.kick_user(event.guild_id, event.user_id, &reason).await
                }
                NewAccountAction::Ban => {
                    sink.ban_user(event.guild_id, event.user_id, &reason).await
                }
            };
            log_raid_event(
                event.guild_id,
                &format!("new_account_{action}"),
                &format!("user {}", event.user_id),
            );
            if let Err(e) = result {
                warn!(target: ANTIRAID_TARGET, guild_id = event.guild_id, user_id = event.user_id, error = %e, "Failed to act on new account");
            }
        }
        analysis
    }

    /// Drop all state and timers of a guild, including its published raid.
    pub async fn forget_guild(&self, guild_id: u64) {
        self.forget_local(guild_id);
        if let Some(persisted) = &self.persisted {
            persisted.delete(&guild_id.to_string()).await;
        }
    }

    /// Drop this shard's joins, raid state and timer for a guild, leaving
    /// the published raid in place.
    pub(crate) fn forget_local(&self, guild_id: u64) {
        self.joins.remove(&guild_id);
        self.raids.remove(&guild_id);
        if let Some((_, timer)) = self.unlock_timers.remove(&guild_id) {
            timer.abort();
        }
    }

    /// Abort every auto-unlock timer.
    pub fn shutdown(&self) {
        self.unlock_timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::MockModerationSink;
    use mockall::predicate::eq;

    const HOUR_MS: u64 = 3_600_000;
    const BASE: u64 = 1_000 * HOUR_MS;

    fn config() -> RaidConfig {
        RaidConfig {
            join_threshold: 3,
            window_ms: 10_000,
            new_account_age_hours: 24,
            auto_unlock_ms: 60_000,
            lock_channels: vec![100, 101],
            notify_channel_id: Some(200),
            ..RaidConfig::default()
        }
    }

    fn join(user_id: u64, joined_at_ms: u64, age_ms: u64) -> JoinEvent {
        JoinEvent {
            guild_id: 1,
            user_id,
            account_created_at_ms: joined_at_ms.saturating_sub(age_ms),
            joined_at_ms,
        }
    }

    #[test]
    fn test_burst_within_window_is_raid() {
        let monitor = JoinRateMonitor::new();
        let config = config();
        let base = BASE;
        assert!(!monitor.track_join(&join(1, base, 100 * HOUR_MS), &config).is_raid);
        assert!(!monitor.track_join(&join(2, base + 1_000, HOUR_MS), &config).is_raid);

        let analysis = monitor.track_join(&join(3, base + 2_000, HOUR_MS), &config);
        assert!(analysis.is_raid);
        assert!(analysis.is_suspicious);
        assert_eq!(analysis.stats, JoinStats { join_count: 3, new_accounts: 2 });
        assert_eq!(
            analysis.triggers,
            vec![
                RaidTrigger::JoinBurst(3),
                RaidTrigger::NewAccountCluster(2),
                RaidTrigger::NewAccount
            ]
        );
    }

    #[test]
    fn test_joins_spaced_beyond_window_never_trigger() {
        let monitor = JoinRateMonitor::new();
        let config = config();
        for i in 0..10 {
            let analysis = monitor.track_join(&join(i, BASE + i * 11_000, 100 * HOUR_MS), &config);
            assert!(!analysis.is_raid);
            assert_eq!(analysis.stats.join_count, 1);
        }
    }

    #[test]
    fn test_account_age_only_suspicious_during_raid() {
        let monitor = JoinRateMonitor::new();
        let config = config();
        let young = join(9, BASE, HOUR_MS);
        assert!(!monitor.check_account_age(&young, &config).suspicious);

        monitor.raids.insert(
            1,
            RaidModeState {
                active: true,
                activated_at_ms: 0,
                activated_by: "test".to_string(),
                reason: String::new(),
                auto_unlock_at_ms: u64::MAX,
                locked_channels: Vec::new(),
            },
        );
        let check = monitor.check_account_age(&young, &config);
        assert!(check.suspicious);
        assert_eq!(check.action, Some(NewAccountAction::Kick));
        assert_eq!(check.account_age, Duration::from_millis(HOUR_MS));

        let old = join(10, BASE, 48 * HOUR_MS);
        assert!(!monitor.check_account_age(&old, &config).suspicious);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_is_idempotent_and_auto_unlocks() {
        let mut sink = MockModerationSink::new();
        sink.expect_lock_channel().times(2).returning(|_, _| Ok(()));
        sink.expect_send_notification()
            .with(eq(200), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));
        sink.expect_unlock_channel().times(2).returning(|_, _| Ok(()));

        let monitor = Arc::new(JoinRateMonitor::new().with_sink(Arc::new(sink)));
        let config = config();

        let first = monitor.activate_raid_mode(1, "mod", "burst", &config).await;
        let second = monitor.activate_raid_mode(1, "other", "again", &config).await;
        assert_eq!(first, second);
        assert_eq!(second.activated_by, "mod");
        assert_eq!(second.locked_channels, vec![100, 101]);
        assert!(monitor.is_raid_mode_active(1));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!monitor.is_raid_mode_active(1));
        assert!(monitor.unlock_timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_deactivate_cancels_timer() {
        let monitor = Arc::new(JoinRateMonitor::new());
        let config = config();
        monitor.activate_raid_mode(1, "mod", "burst", &config).await;

        let ended = monitor.deactivate_raid_mode(1, "mod").await;
        assert!(ended.is_some_and(|state| state.active));
        assert!(monitor.deactivate_raid_mode(1, "mod").await.is_none());
        assert!(monitor.unlock_timers.is_empty());

        // A fresh activation gets a full window of its own
        tokio::time::sleep(Duration::from_secs(30)).await;
        monitor.activate_raid_mode(1, "mod", "again", &config).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(monitor.is_raid_mode_active(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_join_auto_activates_and_kicks_new_accounts() {
        let mut sink = MockModerationSink::new();
        sink.expect_lock_channel().returning(|_, _| Ok(()));
        sink.expect_send_notification().returning(|_, _| Ok(()));
        sink.expect_kick_user()
            .with(eq(1), eq(3), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let monitor = Arc::new(JoinRateMonitor::new().with_sink(Arc::new(sink)));
        let config = config();
        let base = now_ms();
        monitor.handle_join(&join(1, base, 100 * HOUR_MS), &config).await;
        monitor.handle_join(&join(2, base + 1, 100 * HOUR_MS), &config).await;
        let analysis = monitor.handle_join(&join(3, base + 2, HOUR_MS), &config).await;

        assert!(analysis.is_raid);
        assert!(monitor.is_raid_mode_active(1));
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_forget_guild_clears_state() {
        let monitor = Arc::new(JoinRateMonitor::new());
        let config = config();
        monitor.track_join(&join(1, BASE, HOUR_MS), &config);
        monitor.activate_raid_mode(1, "mod", "burst", &config).await;

        monitor.forget_guild(1).await;
        assert!(!monitor.is_raid_mode_active(1));
        assert!(monitor.joins.is_empty());
        assert!(monitor.unlock_timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_guild_from_persisted_state() {
        use crate::cache::{NamespacedCache, NamespacedCacheOptions};
        use crate::store::SharedStoreClient;

        let cache = Arc::new(NamespacedCache::new(
            SharedStoreClient::local_only(),
            NamespacedCacheOptions::default(),
        ));
        let config = config();
        let first = Arc::new(JoinRateMonitor::new().with_persistence(cache.namespace("raid")));
        first.activate_raid_mode(1, "mod", "burst", &config).await;
        first.shutdown();

        let restarted = Arc::new(JoinRateMonitor::new().with_persistence(cache.namespace("raid")));
        let restored = restarted.restore_guild(1).await;
        assert_eq!(restored.map(|state| state.activated_by).as_deref(), Some("mod"));
        assert!(restarted.is_raid_mode_active(1));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!restarted.is_raid_mode_active(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_auto_unlock_saturates() {
        let monitor = Arc::new(JoinRateMonitor::new());
        let config = RaidConfig {
            auto_unlock_ms: u64::MAX,
            ..config()
        };
        let state = monitor.activate_raid_mode(1, "mod", "burst", &config).await;
        assert_eq!(state.auto_unlock_at_ms, u64::MAX);
        assert!(monitor.is_raid_mode_active(1));
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_guild_is_not_restored_on_rejoin() {
        use crate::cache::{NamespacedCache, NamespacedCacheOptions};
        use crate::store::SharedStoreClient;

        let cache = Arc::new(NamespacedCache::new(
            SharedStoreClient::local_only(),
            NamespacedCacheOptions::default(),
        ));
        let monitor = Arc::new(JoinRateMonitor::new().with_persistence(cache.namespace("raid")));
        monitor.activate_raid_mode(1, "mod", "burst", &config()).await;
        monitor.forget_guild(1).await;

        assert!(monitor.restore_guild(1).await.is_none());
        assert!(!monitor.is_raid_mode_active(1));
    }
}
