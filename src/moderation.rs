//! The seam between detection and the platform.
//!
//! Detectors decide what should happen and why; a [`ModerationSink`] carries
//! it out. Failures are reported back so they can be logged, but detection
//! state is updated regardless.

use crate::error::ModerationResult;
use async_trait::async_trait;
use std::time::Duration;

/// Platform-side execution of moderation decisions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModerationSink: Send + Sync {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> ModerationResult<()>;

    /// Tell a user in `channel_id` that they were warned.
    async fn warn_user(
        &self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
        reason: &str,
    ) -> ModerationResult<()>;

    /// Time a member out for `duration`.
    async fn mute_user(
        &self,
        guild_id: u64,
        user_id: u64,
        duration: Duration,
        reason: &str,
    ) -> ModerationResult<()>;

    async fn kick_user(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()>;

    async fn ban_user(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()>;

    /// Deny `@everyone` the right to send messages in a channel.
    async fn lock_channel(&self, guild_id: u64, channel_id: u64) -> ModerationResult<()>;

    /// Undo [`lock_channel`](Self::lock_channel).
    async fn unlock_channel(&self, guild_id: u64, channel_id: u64) -> ModerationResult<()>;

    async fn send_notification(&self, channel_id: u64, message: &str) -> ModerationResult<()>;
}
