//! Shared state for the REST API.
//!
//! Grounded on `src/rest/state.rs`'s `ApiState` (a small `Clone`-able struct
//! of `Arc`-wrapped shared singletons handed to every handler via axum's
//! `State` extractor), restructured around this crate's actual
//! construction order (§9: EventBus, then Manager, then Poller/Dispatcher).

use std::sync::Arc;

use crate::config::Config;
use crate::debug::DebugTracker;
use crate::eventbus::EventBus;
use crate::manager::Manager;
use crate::webhook::WebhookDispatcher;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<Manager>,
    pub event_bus: Arc<EventBus>,
    pub webhook: Arc<WebhookDispatcher>,
    pub debug: Arc<DebugTracker>,
    pub config: Arc<Config>,
}
