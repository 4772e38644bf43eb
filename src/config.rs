//! Process settings and per-guild moderation configuration.

use crate::cache::{NamespacedCacheOptions, TypedNamespace};
use crate::error::ConfigError;
use crate::scheduler::ShardFilter;
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SETTINGS_FILE: &str = "data/shardguard.yaml";
pub const GUILD_CONFIGS_FILE: &str = "data/guild_configs.yaml";

/// Namespace the guild config snapshots are cached under
pub const GUILD_NAMESPACE: &str = "guild";

/// Upper bounds for guild config values; anything above is replaced with
/// the default.
const MAX_WINDOW_SECS: u64 = 24 * 3600;
const MAX_WARN_RESET_HOURS: u64 = 365 * 24;
/// Discord refuses timeouts longer than 28 days
const MAX_MUTE_SECS: u64 = 28 * 24 * 3600;
const MAX_RAID_WINDOW_MS: u64 = 24 * 3600 * 1000;
const MAX_NEW_ACCOUNT_AGE_HOURS: u64 = 5 * 365 * 24;
const MAX_AUTO_UNLOCK_MS: u64 = 7 * 24 * 3600 * 1000;

/// Bootstrap settings of one shard process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Shared store URL; without one the shard runs on local state only
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub op_timeout_ms: u64,
    pub cache_capacity: usize,
    pub cache_default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub namespace_ttls_secs: HashMap<String, u64>,
    pub scheduler_poll_secs: u64,
    /// Extra lifetime given to stored deadlines beyond their delay
    pub scheduler_ttl_margin_secs: u64,
    pub voice_idle_timeout_secs: u64,
    pub guild_configs_file: String,
    /// Shard this process runs; ignored when `shard_count` is 1
    pub shard_id: u32,
    pub shard_count: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "shardguard:".to_string(),
            op_timeout_ms: 500,
            cache_capacity: 10_000,
            cache_default_ttl_secs: 300,
            sweep_interval_secs: 60,
            namespace_ttls_secs: HashMap::from([
                (GUILD_NAMESPACE.to_string(), 600),
                ("automod".to_string(), 300),
                ("voice".to_string(), 900),
            ]),
            scheduler_poll_secs: 5,
            scheduler_ttl_margin_secs: 60,
            voice_idle_timeout_secs: 300,
            guild_configs_file: GUILD_CONFIGS_FILE.to_string(),
            shard_id: 0,
            shard_count: 1,
        }
    }
}

impl Settings {
    /// Read settings from `path` (defaults when the file does not exist),
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// an override holds an invalid value.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut settings = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str::<Self>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Apply `REDIS_URL` and `SHARDGUARD_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a numeric override does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.trim().is_empty()) {
            self.redis_url = Some(url);
        }
        if let Some(prefix) = lookup("SHARDGUARD_KEY_PREFIX") {
            self.key_prefix = prefix;
        }
        if let Some(file) = lookup("SHARDGUARD_GUILD_CONFIGS") {
            self.guild_configs_file = file;
        }
        override_number(&lookup, "SHARDGUARD_OP_TIMEOUT_MS", &mut self.op_timeout_ms)?;
        override_number(&lookup, "SHARDGUARD_CACHE_CAPACITY", &mut self.cache_capacity)?;
        override_number(
            &lookup,
            "SHARDGUARD_SCHEDULER_POLL_SECS",
            &mut self.scheduler_poll_secs,
        )?;
        override_number(
            &lookup,
            "SHARDGUARD_VOICE_IDLE_SECS",
            &mut self.voice_idle_timeout_secs,
        )?;
        override_number(&lookup, "SHARDGUARD_SHARD_ID", &mut self.shard_id)?;
        override_number(&lookup, "SHARDGUARD_SHARD_COUNT", &mut self.shard_count)?;
        if self.shard_count == 0 || self.shard_id >= self.shard_count {
            return Err(ConfigError::Invalid(format!(
                "shard {} is outside a shard count of {}",
                self.shard_id, self.shard_count
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.max(1))
    }

    #[must_use]
    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_secs.max(1))
    }

    #[must_use]
    pub fn scheduler_ttl_margin(&self) -> Duration {
        Duration::from_secs(self.scheduler_ttl_margin_secs)
    }

    #[must_use]
    pub fn voice_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.voice_idle_timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    #[must_use]
    pub fn shard_filter(&self) -> ShardFilter {
        ShardFilter {
            shard_id: u64::from(self.shard_id),
            shard_count: u64::from(self.shard_count),
        }
    }

    #[must_use]
    pub fn cache_options(&self) -> NamespacedCacheOptions {
        NamespacedCacheOptions {
            local_capacity: self.cache_capacity,
            default_ttl: Duration::from_secs(self.cache_default_ttl_secs.max(1)),
            sweep_interval: self.sweep_interval(),
            namespace_ttls: self
                .namespace_ttls_secs
                .iter()
                .map(|(ns, secs)| (ns.clone(), Duration::from_secs((*secs).max(1))))
                .collect(),
        }
    }
}

fn override_number<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{name}={raw} is not a valid number")))?;
    }
    Ok(())
}

/// What automod does about a violation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum AutomodAction {
    #[display("delete")]
    Delete,
    #[default]
    #[display("delete_warn")]
    DeleteWarn,
    #[display("warn")]
    Warn,
    #[display("mute")]
    Mute,
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
}

/// Punishment applied when a user crosses the warn threshold
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    #[default]
    #[display("mute")]
    Mute,
    #[display("kick")]
    Kick,
}

/// Suggested handling of a young account joining during a raid
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum NewAccountAction {
    #[default]
    #[display("flag")]
    Flag,
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    /// Words matched against normalized content, case-insensitively
    pub words: Vec<String>,
    pub action: AutomodAction,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            words: Vec::new(),
            action: AutomodAction::DeleteWarn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub enabled: bool,
    /// Messages allowed inside the window; the next one is a violation
    pub threshold: i64,
    pub window_secs: u64,
    pub action: AutomodAction,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_secs: 5,
            action: AutomodAction::Mute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    pub enabled: bool,
    /// Identical messages allowed in a row; the next one is a violation
    pub threshold: i64,
    pub window_secs: u64,
    pub action: AutomodAction,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            window_secs: 30,
            action: AutomodAction::DeleteWarn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionConfig {
    pub enabled: bool,
    pub max_mentions: usize,
    pub action: AutomodAction,
}

impl Default for MentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mentions: 5,
            action: AutomodAction::DeleteWarn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsConfig {
    pub enabled: bool,
    /// Letters needed before the ratio is considered
    pub min_length: usize,
    /// Uppercase share of letters above which a message is flagged
    pub max_ratio: f64,
    pub action: AutomodAction,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: 10,
            max_ratio: 0.7,
            action: AutomodAction::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub enabled: bool,
    pub block_invites: bool,
    pub block_all_links: bool,
    /// Domains (and their subdomains) that are always allowed
    pub whitelist: Vec<String>,
    pub action: AutomodAction,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_invites: true,
            block_all_links: false,
            whitelist: Vec::new(),
            action: AutomodAction::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub warn_threshold: i64,
    pub warn_reset_hours: u64,
    pub action: EscalationAction,
    pub base_mute_secs: u64,
    /// Multiplier applied per escalation level
    pub factor: f64,
    pub max_mute_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 3,
            warn_reset_hours: 24,
            action: EscalationAction::Mute,
            base_mute_secs: 600,
            factor: 2.0,
            max_mute_secs: 7 * 24 * 3600,
        }
    }
}

impl EscalationConfig {
    #[must_use]
    pub fn warn_reset(&self) -> Duration {
        Duration::from_secs(self.warn_reset_hours.saturating_mul(3600))
    }

    /// Mute length for an escalation `level` (1-based), capped at the maximum
    #[must_use]
    pub fn mute_duration(&self, level: u32) -> Duration {
        let exponent = i32::try_from(level.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = (self.base_mute_secs as f64) * self.factor.powi(exponent);
        let capped = secs.min(self.max_mute_secs as f64).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::from_secs(self.max_mute_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidConfig {
    pub enabled: bool,
    pub join_threshold: usize,
    pub window_ms: u64,
    pub new_account_age_hours: u64,
    pub new_account_action: NewAccountAction,
    /// Turn raid mode on by itself when a burst is detected
    pub auto_activate: bool,
    pub auto_unlock_ms: u64,
    pub lock_channels: Vec<u64>,
    pub notify_channel_id: Option<u64>,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            join_threshold: 10,
            window_ms: 10_000,
            new_account_age_hours: 24,
            new_account_action: NewAccountAction::Kick,
            auto_activate: true,
            auto_unlock_ms: 10 * 60 * 1000,
            lock_channels: Vec::new(),
            notify_channel_id: None,
        }
    }
}

impl RaidConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    #[must_use]
    pub fn auto_unlock(&self) -> Duration {
        Duration::from_millis(self.auto_unlock_ms)
    }

    #[must_use]
    pub fn new_account_age(&self) -> Duration {
        Duration::from_secs(self.new_account_age_hours.saturating_mul(3600))
    }
}

/// Per-guild automod and anti-raid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildConfig {
    pub guild_id: u64,
    pub automod_enabled: bool,
    pub log_channel_id: Option<u64>,
    pub ignored_users: Vec<u64>,
    pub ignored_channels: Vec<u64>,
    pub ignored_roles: Vec<u64>,
    pub filter: FilterConfig,
    pub spam: SpamConfig,
    pub duplicate: DuplicateConfig,
    pub mentions: MentionConfig,
    pub caps: CapsConfig,
    pub links: LinkConfig,
    pub escalation: EscalationConfig,
    pub raid: RaidConfig,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            automod_enabled: true,
            log_channel_id: None,
            ignored_users: Vec::new(),
            ignored_channels: Vec::new(),
            ignored_roles: Vec::new(),
            filter: FilterConfig::default(),
            spam: SpamConfig::default(),
            duplicate: DuplicateConfig::default(),
            mentions: MentionConfig::default(),
            caps: CapsConfig::default(),
            links: LinkConfig::default(),
            escalation: EscalationConfig::default(),
            raid: RaidConfig::default(),
        }
    }
}

impl GuildConfig {
    #[must_use]
    pub fn for_guild(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Self::default()
        }
    }

    /// Replace invalid values with their defaults, returning the names of
    /// the fields that were reset.
    pub fn sanitize(&mut self) -> Vec<&'static str> {
        let mut fixed = Vec::new();
        let spam = SpamConfig::default();
        let duplicate = DuplicateConfig::default();
        let escalation = EscalationConfig::default();
        let raid = RaidConfig::default();

        if self.spam.threshold < 1 {
            self.spam.threshold = spam.threshold;
            fixed.push("spam.threshold");
        }
        if self.spam.window_secs == 0 || self.spam.window_secs > MAX_WINDOW_SECS {
            self.spam.window_secs = spam.window_secs;
            fixed.push("spam.window_secs");
        }
        if self.duplicate.threshold < 1 {
            self.duplicate.threshold = duplicate.threshold;
            fixed.push("duplicate.threshold");
        }
        if self.duplicate.window_secs == 0 || self.duplicate.window_secs > MAX_WINDOW_SECS {
            self.duplicate.window_secs = duplicate.window_secs;
            fixed.push("duplicate.window_secs");
        }
        if self.mentions.max_mentions == 0 {
            self.mentions.max_mentions = MentionConfig::default().max_mentions;
            fixed.push("mentions.max_mentions");
        }
        if !(self.caps.max_ratio > 0.0 && self.caps.max_ratio <= 1.0) {
            self.caps.max_ratio = CapsConfig::default().max_ratio;
            fixed.push("caps.max_ratio");
        }
        if self.escalation.warn_threshold < 1 {
            self.escalation.warn_threshold = escalation.warn_threshold;
            fixed.push("escalation.warn_threshold");
        }
        if self.escalation.warn_reset_hours == 0
            || self.escalation.warn_reset_hours > MAX_WARN_RESET_HOURS
        {
            self.escalation.warn_reset_hours = escalation.warn_reset_hours;
            fixed.push("escalation.warn_reset_hours");
        }
        if !(self.escalation.factor >= 1.0 && self.escalation.factor.is_finite()) {
            self.escalation.factor = escalation.factor;
            fixed.push("escalation.factor");
        }
        if self.escalation.max_mute_secs == 0 || self.escalation.max_mute_secs > MAX_MUTE_SECS {
            self.escalation.max_mute_secs = escalation.max_mute_secs;
            fixed.push("escalation.max_mute_secs");
        }
        if self.escalation.base_mute_secs > self.escalation.max_mute_secs {
            self.escalation.base_mute_secs = self.escalation.max_mute_secs;
            fixed.push("escalation.base_mute_secs");
        }
        if self.raid.join_threshold == 0 {
            self.raid.join_threshold = raid.join_threshold;
            fixed.push("raid.join_threshold");
        }
        if self.raid.window_ms == 0 || self.raid.window_ms > MAX_RAID_WINDOW_MS {
            self.raid.window_ms = raid.window_ms;
            fixed.push("raid.window_ms");
        }
        if self.raid.new_account_age_hours > MAX_NEW_ACCOUNT_AGE_HOURS {
            self.raid.new_account_age_hours = raid.new_account_age_hours;
            fixed.push("raid.new_account_age_hours");
        }
        if self.raid.auto_unlock_ms == 0 || self.raid.auto_unlock_ms > MAX_AUTO_UNLOCK_MS {
            self.raid.auto_unlock_ms = raid.auto_unlock_ms;
            fixed.push("raid.auto_unlock_ms");
        }

        if !fixed.is_empty() {
            warn!(
                guild_id = self.guild_id,
                fields = ?fixed,
                "Invalid guild configuration values replaced with defaults"
            );
        }
        fixed
    }
}

/// Source of guild configuration snapshots.
///
/// The YAML file is the source of truth; snapshots are served through the
/// `guild` cache namespace so an update made on one shard reaches the others
/// once they miss their cached copy.
pub struct GuildConfigStore {
    configs: DashMap<u64, GuildConfig>,
    cache: TypedNamespace<GuildConfig>,
}

impl std::fmt::Debug for GuildConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildConfigStore")
            .field("configs", &self.configs.len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl GuildConfigStore {
    #[must_use]
    pub fn new(cache: TypedNamespace<GuildConfig>) -> Self {
        Self {
            configs: DashMap::new(),
            cache,
        }
    }

    /// Load the guild list from `path`. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(
        path: impl AsRef<Path>,
        cache: TypedNamespace<GuildConfig>,
    ) -> Result<Self, ConfigError> {
        let store = Self::new(cache);
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
        };
        for mut config in serde_yaml::from_str::<Vec<GuildConfig>>(&content)? {
            config.sanitize();
            store.configs.insert(config.guild_id, config);
        }
        info!("Loaded {} guild configurations", store.configs.len());
        Ok(store)
    }

    /// Write every known guild configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut configs: Vec<GuildConfig> =
            self.configs.iter().map(|entry| entry.value().clone()).collect();
        configs.sort_by_key(|config| config.guild_id);
        tokio::fs::write(path, serde_yaml::to_string(&configs)?).await?;
        Ok(())
    }

    /// Current snapshot for a guild; unknown guilds get the defaults.
    pub async fn get(&self, guild_id: u64) -> Arc<GuildConfig> {
        let key = guild_id.to_string();
        if let Some(config) = self.cache.get(&key).await {
            return Arc::new(config);
        }
        let config = self
            .configs
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| GuildConfig::for_guild(guild_id));
        self.cache.set(&key, &config).await;
        Arc::new(config)
    }

    /// Replace a guild's configuration and publish it to the cache.
    pub async fn upsert(&self, mut config: GuildConfig) {
        config.sanitize();
        self.cache.set(&config.guild_id.to_string(), &config).await;
        self.configs.insert(config.guild_id, config);
    }

    /// Drop the cached snapshot so every shard re-reads it.
    pub async fn invalidate(&self, guild_id: u64) {
        self.cache.delete(&guild_id.to_string()).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
