//! Eventline server: streams execution events (workflow runs, chat token
//! generation, operational telemetry) to subscribed WebSocket clients with
//! per-topic ordering and bounded memory under backpressure.

pub mod api;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod conn;
pub mod ops;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};

use crate::bridge::EnvelopeBridge;
use crate::bus::EventBus;
use crate::config::Settings;
use crate::conn::ConnectionManager;

/// Shared application state. The bus is an explicit injected instance;
/// collaborators publish through `state.bus`, nothing is global.
pub struct AppState {
    pub settings: Settings,
    pub bus: Arc<EventBus>,
    pub manager: Arc<ConnectionManager>,
    pub bridge: Arc<EnvelopeBridge>,
    /// Unparseable client frames dropped without closing the connection.
    pub malformed_messages: AtomicU64,
}

/// Wire bus → bridge → connection manager together.
pub async fn build_state(settings: Settings) -> Arc<AppState> {
    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(ConnectionManager::new(settings.queue_capacity));
    let bridge = EnvelopeBridge::new(manager.clone());
    bridge.attach(&bus).await;

    Arc::new(AppState {
        settings,
        bus,
        manager,
        bridge,
        malformed_messages: AtomicU64::new(0),
    })
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/events", get(api::ws_events))
        .route("/healthz", get(api::healthz))
        .with_state(state)
}

/// Spawn the heartbeat loop and, when enabled, the ops ticker.
pub fn spawn_background_tasks(state: &Arc<AppState>) {
    tokio::spawn(conn::run_heartbeat(
        state.manager.clone(),
        Duration::from_secs(state.settings.heartbeat_secs),
        Duration::from_secs(state.settings.idle_timeout_secs),
    ));

    if state.settings.ops_tick_secs > 0 {
        tokio::spawn(ops::run_ops_ticker(
            state.bus.clone(),
            state.manager.clone(),
            state.bridge.clone(),
            Duration::from_secs(state.settings.ops_tick_secs),
        ));
    }
}
