//! Polling half of Magic Mirror: discovers newly merged upstream pull
//! requests and drives each fork branch's sync state one step per tick.

pub mod sync;

pub use sync::Syncer;
