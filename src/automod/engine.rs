use crate::AUTOMOD_TARGET;
use crate::antiraid::JoinRateMonitor;
use crate::automod::normalize::{
    caps_counts, count_mentions, domain_matches, domain_of, extract_urls, filter_tokens,
    filter_word, is_invite, normalize, strip_exempt_spans,
};
use crate::automod::{ActionOutcome, Escalation, Violation, ViolationKind};
use crate::config::{AutomodAction, EscalationAction, GuildConfig, NewAccountAction};
use crate::counters::SlidingWindowCounters;
use crate::error::{DetectionError, ModerationResult};
use crate::events::MessageEvent;
use crate::logging::log_violation;
use crate::moderation::ModerationSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Classifies messages and carries out the configured response.
#[derive(Clone)]
pub struct ViolationEscalationEngine {
    counters: SlidingWindowCounters,
    raids: Arc<JoinRateMonitor>,
    sink: Arc<dyn ModerationSink>,
}

impl std::fmt::Debug for ViolationEscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationEscalationEngine")
            .field("counters", &self.counters)
            .field("raids", &self.raids)
            .finish_non_exhaustive()
    }
}

impl ViolationEscalationEngine {
    #[must_use]
    pub fn new(
        counters: SlidingWindowCounters,
        raids: Arc<JoinRateMonitor>,
        sink: Arc<dyn ModerationSink>,
    ) -> Self {
        Self {
            counters,
            raids,
            sink,
        }
    }

    #[must_use]
    pub fn counters(&self) -> &SlidingWindowCounters {
        &self.counters
    }

    /// Classify a message. Detection failures, panics included, are logged and
    /// the message is let through.
    pub async fn check_message(
        &self,
        event: MessageEvent,
        config: Arc<GuildConfig>,
    ) -> Option<Violation> {
        let engine = self.clone();
        let guild_id = event.guild_id;
        let message_id = event.message_id;
        let detection = tokio::spawn(async move { engine.detect(&event, &config).await });

        match detection.await {
            Ok(Ok(violation)) => violation,
            Ok(Err(e)) => {
                warn!(target: AUTOMOD_TARGET, guild_id, message_id, error = %e, "Detection failed, message allowed");
                None
            }
            Err(e) => {
                let e = DetectionError::Panicked(e.to_string());
                error!(target: AUTOMOD_TARGET, guild_id, message_id, error = %e, "Detection failed, message allowed");
                None
            }
        }
    }

    /// Check a message and act on any violation found.
    pub async fn handle_message(
        &self,
        event: MessageEvent,
        config: Arc<GuildConfig>,
    ) -> Option<(Violation, ActionOutcome)> {
        let violation = self.check_message(event, Arc::clone(&config)).await?;
        let outcome = self.execute_action(&violation, &config).await;
        Some((violation, outcome))
    }

    fn is_exempt(event: &MessageEvent, config: &GuildConfig) -> bool {
        config.ignored_users.contains(&event.author_id)
            || config.ignored_channels.contains(&event.channel_id)
            || event
                .author_role_ids
                .iter()
                .any(|role| config.ignored_roles.contains(role))
    }

    async fn detect(
        &self,
        event: &MessageEvent,
        config: &GuildConfig,
    ) -> Result<Option<Violation>, DetectionError> {
        if config.guild_id != 0 && config.guild_id != event.guild_id {
            return Err(DetectionError::InvalidInput(format!(
                "Config for guild {} applied to a message from guild {}",
                config.guild_id, event.guild_id
            )));
        }
        if !config.automod_enabled || Self::is_exempt(event, config) {
            return Ok(None);
        }

        let violation = |kind: ViolationKind, trigger: String, action: AutomodAction| Violation {
            kind,
            trigger,
            severity: kind.severity(),
            action,
            guild_id: event.guild_id,
            channel_id: event.channel_id,
            message_id: event.message_id,
            user_id: event.author_id,
        };
        let text = strip_exempt_spans(&event.content);

        if config.raid.enabled && self.raids.is_raid_mode_active(event.guild_id) {
            if let Some(created) = event.account_created_at_ms {
                let age = Duration::from_millis(event.timestamp_ms.saturating_sub(created));
                if age < config.raid.new_account_age() {
                    let action = match config.raid.new_account_action {
                        NewAccountAction::Flag => AutomodAction::DeleteWarn,
                        NewAccountAction::Kick => AutomodAction::Kick,
                        NewAccountAction::Ban => AutomodAction::Ban,
                    };
                    let trigger = format!("account age {}h", age.as_secs() / 3600);
                    return Ok(Some(violation(ViolationKind::NewAccountRaid, trigger, action)));
                }
            }
        }

        if config.filter.enabled && !config.filter.words.is_empty() {
            let tokens = filter_tokens(&text);
            let hit = config.filter.words.iter().find(|word| {
                let word = filter_word(word);
                !word.is_empty() && tokens.contains(&word)
            });
            if let Some(word) = hit {
                return Ok(Some(violation(
                    ViolationKind::FilteredWord,
                    word.clone(),
                    config.filter.action,
                )));
            }
        }

        if config.spam.enabled {
            let window = Duration::from_secs(config.spam.window_secs);
            let count = self
                .counters
                .track_spam_message(event.guild_id, event.author_id, window)
                .await;
            if count > config.spam.threshold {
                let trigger = format!("{count} messages in {}s", config.spam.window_secs);
                return Ok(Some(violation(ViolationKind::Spam, trigger, config.spam.action)));
            }
        }

        if config.duplicate.enabled && !event.content.trim().is_empty() {
            let window = Duration::from_secs(config.duplicate.window_secs);
            let hit = self
                .counters
                .track_duplicate_message(event.guild_id, event.author_id, &event.content, window)
                .await;
            if hit.count > config.duplicate.threshold {
                let trigger = format!("{} identical messages", hit.count);
                return Ok(Some(violation(
                    ViolationKind::Duplicate,
                    trigger,
                    config.duplicate.action,
                )));
            }
        }

        if config.mentions.enabled {
            let mentions = count_mentions(&text);
            if mentions > config.mentions.max_mentions {
                let trigger = format!("{mentions} mentions");
                return Ok(Some(violation(
                    ViolationKind::Mentions,
                    trigger,
                    config.mentions.action,
                )));
            }
        }

        if config.caps.enabled {
            let (letters, upper) = caps_counts(&normalize(&text));
            #[allow(clippy::cast_precision_loss)]
            let ratio = if letters == 0 { 0.0 } else { upper as f64 / letters as f64 };
            if letters >= config.caps.min_length && ratio > config.caps.max_ratio {
                let trigger = format!("{:.0}% caps", ratio * 100.0);
                return Ok(Some(violation(ViolationKind::Caps, trigger, config.caps.action)));
            }
        }

        if config.links.enabled {
            let whitelisted = |url: &str| {
                domain_of(url).is_some_and(|domain| {
                    config
                        .links
                        .whitelist
                        .iter()
                        .any(|allowed| domain_matches(&domain, allowed))
                })
            };
            for url in extract_urls(&event.content) {
                if whitelisted(&url) {
                    continue;
                }
                if is_invite(&url) {
                    if config.links.block_invites {
                        return Ok(Some(violation(ViolationKind::Invite, url, config.links.action)));
                    }
                } else if config.links.block_all_links {
                    return Ok(Some(violation(ViolationKind::Link, url, config.links.action)));
                }
            }
        }

        Ok(None)
    }

    /// Carry out the configured action and count the warning, escalating
    /// when the count lands on a multiple of the warn threshold.
    ///
    /// Sink failures are logged; the warning is counted regardless so
    /// repeated failures cannot reset a user's record.
    pub async fn execute_action(
        &self,
        violation: &Violation,
        config: &GuildConfig,
    ) -> ActionOutcome {
        let reason = violation.reason();
        let (guild_id, user_id) = (violation.guild_id, violation.user_id);
        let mut failures = 0;

        let needs_delete = !matches!(violation.action, AutomodAction::Warn);
        if needs_delete {
            let result = self
                .sink
                .delete_message(violation.channel_id, violation.message_id)
                .await;
            failures += self.report("delete_message", violation, result);
        }
        let result = match violation.action {
            AutomodAction::Delete => Ok(()),
            AutomodAction::DeleteWarn | AutomodAction::Warn => {
                self.sink
                    .warn_user(guild_id, violation.channel_id, user_id, &reason)
                    .await
            }
            AutomodAction::Mute => {
                self.sink
                    .mute_user(guild_id, user_id, config.escalation.mute_duration(1), &reason)
                    .await
            }
            AutomodAction::Kick => self.sink.kick_user(guild_id, user_id, &reason).await,
            AutomodAction::Ban => self.sink.ban_user(guild_id, user_id, &reason).await,
        };
        failures += self.report(&violation.action.to_string(), violation, result);

        let warn_count = self
            .counters
            .track_automod_warn(guild_id, user_id, config.escalation.warn_reset())
            .await;
        let threshold = config.escalation.warn_threshold.max(1);

        let escalation = if warn_count > 0 && warn_count % threshold == 0 {
            let level = u32::try_from(warn_count / threshold).unwrap_or(u32::MAX);
            let escalation_reason = format!("Automod escalation: {warn_count} warnings");
            let (escalation, result) = match config.escalation.action {
                EscalationAction::Mute => {
                    let duration = config.escalation.mute_duration(level);
                    let result = self
                        .sink
                        .mute_user(guild_id, user_id, duration, &escalation_reason)
                        .await;
                    (Escalation::Mute { level, duration }, result)
                }
                EscalationAction::Kick => {
                    let result = self.sink.kick_user(guild_id, user_id, &escalation_reason).await;
                    (Escalation::Kick { level }, result)
                }
            };
            failures += self.report("escalation", violation, result);
            Some(escalation)
        } else {
            None
        };

        log_violation(violation, warn_count, escalation.as_ref());
        if let Some(channel_id) = config.log_channel_id {
            let mut summary = format!(
                "<@{user_id}> {}: {} (warning {warn_count})",
                violation.kind, violation.trigger
            );
            if let Some(escalation) = &escalation {
                summary.push_str(&format!(", escalated: {escalation:?}"));
            }
            let result = self.sink.send_notification(channel_id, &summary).await;
            failures += self.report("send_notification", violation, result);
        }

        ActionOutcome {
            warn_count,
            escalation,
            failures,
        }
    }

    fn report(&self, step: &str, violation: &Violation, result: ModerationResult<()>) -> usize {
        match result {
            Ok(()) => 0,
            Err(e) => {
                warn!(
                    target: AUTOMOD_TARGET,
                    guild_id = violation.guild_id,
                    user_id = violation.user_id,
                    kind = %violation.kind,
                    step,
                    error = %e,
                    "Moderation action failed"
                );
                1
            }
        }
    }

    /// Drop a guild's counters after the bot leaves it.
    pub async fn forget_guild(&self, guild_id: u64) {
        self.counters.forget_guild(guild_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModerationError;
    use crate::moderation::MockModerationSink;
    use crate::store::SharedStoreClient;
    use mockall::predicate::{always, eq};

    fn engine_with(sink: MockModerationSink) -> (ViolationEscalationEngine, Arc<JoinRateMonitor>) {
        let raids = Arc::new(JoinRateMonitor::new());
        let engine = ViolationEscalationEngine::new(
            SlidingWindowCounters::new(SharedStoreClient::local_only()),
            Arc::clone(&raids),
            Arc::new(sink),
        );
        (engine, raids)
    }

    fn engine() -> ViolationEscalationEngine {
        engine_with(MockModerationSink::new()).0
    }

    fn config() -> Arc<GuildConfig> {
        let mut config = GuildConfig::for_guild(1);
        config.filter.words = vec!["badword".to_string()];
        Arc::new(config)
    }

    fn message(content: &str) -> MessageEvent {
        MessageEvent {
            guild_id: 1,
            channel_id: 10,
            message_id: 100,
            author_id: 7,
            author_role_ids: vec![50],
            content: content.to_string(),
            timestamp_ms: 1_000_000_000,
            account_created_at_ms: Some(0),
        }
    }

    async fn kind_of(
        engine: &ViolationEscalationEngine,
        content: &str,
        config: Arc<GuildConfig>,
    ) -> Option<ViolationKind> {
        engine.check_message(message(content), config).await.map(|v| v.kind)
    }

    #[tokio::test]
    async fn test_filter_outranks_caps() {
        let engine = engine();
        let violation = engine
            .check_message(message("THIS IS A B4DW0RD MESSAGE"), config())
            .await
            .expect("violation");
        assert_eq!(violation.kind, ViolationKind::FilteredWord);
        assert_eq!(violation.trigger, "badword");
        assert_eq!(violation.action, AutomodAction::DeleteWarn);
    }

    #[tokio::test]
    async fn test_code_blocks_are_exempt() {
        let engine = engine();
        assert_eq!(kind_of(&engine, "look ```badword``` here", config()).await, None);
        assert_eq!(kind_of(&engine, "`SHOUTING INSIDE CODE IS FINE` ok", config()).await, None);
    }

    #[tokio::test]
    async fn test_mentions_inside_code_are_not_counted() {
        let engine = engine();
        let mut config = (*config()).clone();
        config.spam.enabled = false;
        config.duplicate.enabled = false;
        let config = Arc::new(config);

        let quoted = "ping syntax: ```<@1> <@2> <@3> <@4> <@5> <@6>``` <@7>";
        assert_eq!(kind_of(&engine, quoted, Arc::clone(&config)).await, None);
        let bare = "<@1> <@2> <@3> <@4> <@5> <@6> <@7>";
        assert_eq!(kind_of(&engine, bare, config).await, Some(ViolationKind::Mentions));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spam_flags_message_after_threshold() {
        let engine = engine();
        let config = config();
        for i in 0..5 {
            let kind = kind_of(&engine, &format!("hello {i}"), Arc::clone(&config)).await;
            assert_eq!(kind, None);
        }
        assert_eq!(kind_of(&engine, "hello 5", config).await, Some(ViolationKind::Spam));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_content() {
        let engine = engine();
        let mut config = (*config()).clone();
        config.spam.enabled = false;
        let config = Arc::new(config);
        for _ in 0..3 {
            assert_eq!(kind_of(&engine, "same thing", Arc::clone(&config)).await, None);
        }
        assert_eq!(
            kind_of(&engine, "same thing", Arc::clone(&config)).await,
            Some(ViolationKind::Duplicate)
        );
        assert_eq!(kind_of(&engine, "something else", config).await, None);
    }

    #[tokio::test]
    async fn test_mentions_caps_and_links() {
        let engine = engine();
        let mut config = (*config()).clone();
        config.spam.enabled = false;
        config.duplicate.enabled = false;
        config.links.whitelist = vec!["example.com".to_string()];
        let config = Arc::new(config);

        let mentions = "<@1> <@2> <@3> <@4> <@5> <@6>";
        assert_eq!(
            kind_of(&engine, mentions, Arc::clone(&config)).await,
            Some(ViolationKind::Mentions)
        );
        assert_eq!(
            kind_of(&engine, "WHY IS EVERYONE YELLING", Arc::clone(&config)).await,
            Some(ViolationKind::Caps)
        );
        assert_eq!(kind_of(&engine, "OK", Arc::clone(&config)).await, None);
        assert_eq!(
            kind_of(&engine, "join discord.gg/raiders", Arc::clone(&config)).await,
            Some(ViolationKind::Invite)
        );
        assert_eq!(
            kind_of(&engine, "see https://docs.example.com/x", Arc::clone(&config)).await,
            None
        );
        assert_eq!(kind_of(&engine, "see https://other.test/x", Arc::clone(&config)).await, None);

        let mut strict = (*config).clone();
        strict.links.block_all_links = true;
        assert_eq!(
            kind_of(&engine, "see https://other.test/x", Arc::new(strict)).await,
            Some(ViolationKind::Link)
        );
    }

    #[tokio::test]
    async fn test_exempt_authors_channels_and_roles() {
        let engine = engine();
        let base = (*config()).clone();

        let mut by_user = base.clone();
        by_user.ignored_users = vec![7];
        let mut by_channel = base.clone();
        by_channel.ignored_channels = vec![10];
        let mut by_role = base;
        by_role.ignored_roles = vec![50];

        for config in [by_user, by_channel, by_role] {
            assert_eq!(kind_of(&engine, "badword", Arc::new(config)).await, None);
        }
    }

    #[tokio::test]
    async fn test_new_account_during_raid_outranks_everything() {
        let (engine, raids) = engine_with(MockModerationSink::new());
        let config = config();
        let mut young = message("badword");
        young.account_created_at_ms = Some(young.timestamp_ms - 3_600_000);

        let before = engine.check_message(young.clone(), Arc::clone(&config)).await;
        assert_eq!(before.map(|v| v.kind), Some(ViolationKind::FilteredWord));

        raids.activate_raid_mode(1, "mod", "test", &config.raid).await;
        let during = engine.check_message(young, config).await.expect("violation");
        assert_eq!(during.kind, ViolationKind::NewAccountRaid);
        assert_eq!(during.action, AutomodAction::Kick);
        raids.shutdown();
    }

    #[tokio::test]
    async fn test_detection_error_fails_open() {
        let engine = engine();
        let other_guild = Arc::new(GuildConfig::for_guild(2));
        assert_eq!(kind_of(&engine, "badword", other_guild).await, None);
    }

    #[tokio::test]
    async fn test_delete_warn_calls_sink() {
        let mut sink = MockModerationSink::new();
        sink.expect_delete_message()
            .with(eq(10), eq(100))
            .times(1)
            .returning(|_, _| Ok(()));
        sink.expect_warn_user()
            .with(eq(1), eq(10), eq(7), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (engine, _) = engine_with(sink);
        let config = config();

        let violation = engine
            .check_message(message("badword"), Arc::clone(&config))
            .await
            .expect("violation");
        let outcome = engine.execute_action(&violation, &config).await;
        assert_eq!(outcome, ActionOutcome { warn_count: 1, escalation: None, failures: 0 });
    }

    #[tokio::test]
    async fn test_escalation_fires_once_per_threshold_crossing() {
        let mut sink = MockModerationSink::new();
        sink.expect_delete_message().returning(|_, _| Ok(()));
        sink.expect_warn_user().returning(|_, _, _, _| Ok(()));
        sink.expect_mute_user()
            .with(eq(1), eq(7), eq(Duration::from_secs(600)), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        sink.expect_mute_user()
            .with(eq(1), eq(7), eq(Duration::from_secs(1200)), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (engine, _) = engine_with(sink);
        let config = config();
        let violation = engine
            .check_message(message("badword"), Arc::clone(&config))
            .await
            .expect("violation");

        let mut escalations = Vec::new();
        for _ in 0..6 {
            escalations.push(engine.execute_action(&violation, &config).await.escalation);
        }
        assert_eq!(
            escalations,
            vec![
                None,
                None,
                Some(Escalation::Mute { level: 1, duration: Duration::from_secs(600) }),
                None,
                None,
                Some(Escalation::Mute { level: 2, duration: Duration::from_secs(1200) }),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_warns_reset_after_quiet_period() {
        let mut sink = MockModerationSink::new();
        sink.expect_delete_message().returning(|_, _| Ok(()));
        sink.expect_warn_user().returning(|_, _, _, _| Ok(()));
        let (engine, _) = engine_with(sink);
        let config = config();
        let violation = engine
            .check_message(message("badword"), Arc::clone(&config))
            .await
            .expect("violation");

        assert_eq!(engine.execute_action(&violation, &config).await.warn_count, 1);
        assert_eq!(engine.execute_action(&violation, &config).await.warn_count, 2);
        tokio::time::advance(config.escalation.warn_reset()).await;
        assert_eq!(engine.execute_action(&violation, &config).await.warn_count, 1);
    }

    #[tokio::test]
    async fn test_failed_actions_still_count_warns() {
        let mut sink = MockModerationSink::new();
        sink.expect_delete_message().returning(|_, _| {
            Err(ModerationError::MissingPermission("MANAGE_MESSAGES".to_string()))
        });
        sink.expect_warn_user()
            .returning(|_, _, _, _| Err(ModerationError::NotFound("member".to_string())));
        let (engine, _) = engine_with(sink);
        let config = config();
        let violation = engine
            .check_message(message("badword"), Arc::clone(&config))
            .await
            .expect("violation");

        let first = engine.execute_action(&violation, &config).await;
        let second = engine.execute_action(&violation, &config).await;
        assert_eq!((first.warn_count, first.failures), (1, 2));
        assert_eq!(second.warn_count, 2);
    }
}
