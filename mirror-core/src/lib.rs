//! Shared engine for the Magic Mirror fork-synchronization bot.
//!
//! Everything the two processes (the polling syncer and the webhook
//! receiver) have in common lives here: configuration, the GitHub host
//! client, the SQLite state store, the cherry-pick workspace, message
//! formatting, and the terminal-resolution helpers both sides invoke.

pub mod config;
pub mod github;
pub mod host;
pub mod messages;
pub mod resolution;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use github::GitHubClient;
pub use host::HostClient;
pub use store::Store;
