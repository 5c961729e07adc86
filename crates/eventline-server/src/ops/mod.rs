//! Operational ticker: periodic `ops_event` publications carrying the
//! subsystem's own counters. Lands on the admin-only `ops` topic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use eventline_protocol::EventKind;

use crate::bridge::EnvelopeBridge;
use crate::bus::EventBus;
use crate::conn::ConnectionManager;

pub async fn run_ops_ticker(
    bus: Arc<EventBus>,
    manager: Arc<ConnectionManager>,
    bridge: Arc<EnvelopeBridge>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so counters have settled.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        bus.publish(
            EventKind::OPS_EVENT,
            json!({
                "connections": manager.connection_count().await,
                "broadcast_evictions": manager.broadcast_evictions(),
                "normalize_failures": bridge.normalize_failures(),
                "bus_dropped_events": bus.dropped_events(),
            }),
        )
        .await;
    }
}
