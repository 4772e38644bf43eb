//! Message automod: normalization, violation detection and escalation

mod engine;
pub mod normalize;
mod violation;

pub use engine::ViolationEscalationEngine;
pub use violation::{ActionOutcome, Escalation, Severity, Violation, ViolationKind};
