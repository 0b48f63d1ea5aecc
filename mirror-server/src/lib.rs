//! Webhook half of Magic Mirror: reacts to issue, check, status and
//! pull-request events by advancing the same per-branch state machine the
//! syncer drives.

pub mod reactor;
pub mod webhook;

use std::sync::Arc;

use mirror_core::{Config, HostClient, Store};

pub struct AppState {
    pub config: Arc<Config>,
    pub host: Arc<dyn HostClient>,
    pub store: Arc<Store>,
}
