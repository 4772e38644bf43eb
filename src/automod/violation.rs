use crate::config::AutomodAction;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Detection categories, in evaluation priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    #[display("new_account_raid")]
    NewAccountRaid,
    #[display("filtered_word")]
    FilteredWord,
    #[display("spam")]
    Spam,
    #[display("duplicate")]
    Duplicate,
    #[display("mentions")]
    Mentions,
    #[display("caps")]
    Caps,
    #[display("invite")]
    Invite,
    #[display("link")]
    Link,
}

impl ViolationKind {
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::NewAccountRaid => Severity::Critical,
            Self::FilteredWord | Self::Mentions => Severity::High,
            Self::Spam | Self::Invite => Severity::Medium,
            Self::Duplicate | Self::Caps | Self::Link => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[display("low")]
    Low,
    #[display("medium")]
    Medium,
    #[display("high")]
    High,
    #[display("critical")]
    Critical,
}

/// A message that broke a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// What matched, e.g. the filtered word or the message count
    pub trigger: String,
    pub severity: Severity,
    pub action: AutomodAction,
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
}

impl Violation {
    /// Reason attached to moderation actions and audit logs
    #[must_use]
    pub fn reason(&self) -> String {
        format!("Automod: {} ({})", self.kind, self.trigger)
    }
}

/// Punishment applied after crossing the warn threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Mute { level: u32, duration: Duration },
    Kick { level: u32 },
}

/// What [`execute_action`](super::ViolationEscalationEngine::execute_action) did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Automod warnings inside the current reset window, this one included
    pub warn_count: i64,
    pub escalation: Option<Escalation>,
    /// Sink calls that failed
    pub failures: usize,
}
