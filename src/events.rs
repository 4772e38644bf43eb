//! Inbound platform events, reduced to what the detectors need.
//!
//! The serenity adapter converts gateway events into these so the core never
//! sees platform types.

use serde::{Deserialize, Serialize};

/// A guild message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_role_ids: Vec<u64>,
    pub content: String,
    pub timestamp_ms: u64,
    /// Creation time of the author's account, when known
    pub account_created_at_ms: Option<u64>,
}

/// A member joining a guild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEvent {
    pub guild_id: u64,
    pub user_id: u64,
    pub account_created_at_ms: u64,
    pub joined_at_ms: u64,
}

/// Occupancy change of the voice channel the bot sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateEvent {
    pub guild_id: u64,
    /// The bot's channel, `None` once the bot is no longer connected
    pub channel_id: Option<u64>,
    /// Members in the channel that are not bots
    pub human_member_count: usize,
}
