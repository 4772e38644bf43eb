//! Shard-safe caching, rate limiting and abuse detection for a Discord
//! moderation bot.
//!
//! Every shard builds its own services over a [`store::SharedStoreClient`];
//! the shared store is the only thing shards coordinate through, and each
//! service keeps working on local state when the store is unreachable.

pub mod antiraid;
pub mod automod;
pub mod cache;
pub mod clock;
pub mod commands;
pub mod config;
pub mod counters;
pub mod data;
pub mod error;
pub mod events;
pub mod handlers;
pub mod logging;
pub mod moderation;
pub mod scheduler;
pub mod store;
pub mod voice;

pub const BOT_NAME: &str = "shardguard";
pub const AUTOMOD_TARGET: &str = "shardguard::automod";
pub const ANTIRAID_TARGET: &str = "shardguard::antiraid";
pub const CACHE_TARGET: &str = "shardguard::cache";
pub const COMMAND_TARGET: &str = "shardguard::command";
pub const ERROR_TARGET: &str = "shardguard::error";
pub const EVENT_TARGET: &str = "shardguard::handlers";
pub const CONSOLE_TARGET: &str = "shardguard";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
