//! Typed telemetry event bus.
//!
//! The executor and the multi-tier cascade emit [`TelemetryEvent`]s: a name
//! of the form `prefix.suffix`, a numeric `measurements` map, and a string
//! `metadata` map. Consumers attach either as synchronous callback
//! subscribers (delivered in emission order, which preserves the per-request
//! ordering guarantee) or over a broadcast stream.
//!
//! Per-request ordering: `start` → (`hedge.fired` → (`hedge.won`)?)* →
//! (`request.cancelled`)* → (`stop` | `exception`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel capacity (events in flight per lagging receiver).
const BUS_CHANNEL_CAP: usize = 256;

/// Event leaf suffixes emitted under the caller-chosen prefix.
pub mod suffix {
    pub const REQUEST_START: &str = "request.start";
    pub const REQUEST_STOP: &str = "request.stop";
    pub const REQUEST_EXCEPTION: &str = "request.exception";
    pub const REQUEST_CANCELLED: &str = "request.cancelled";
    pub const HEDGE_FIRED: &str = "hedge.fired";
    pub const HEDGE_WON: &str = "hedge.won";

    pub const MULTI_LEVEL_START: &str = "multi_level.start";
    pub const MULTI_LEVEL_STOP: &str = "multi_level.stop";
    pub const MULTI_LEVEL_EXCEPTION: &str = "multi_level.exception";
    pub const TIER_START: &str = "multi_level.tier.start";
    pub const TIER_COMPLETED: &str = "multi_level.tier.completed";
    pub const TIER_TIMEOUT: &str = "multi_level.tier.timeout";
    pub const TIER_CANCELLED: &str = "multi_level.tier.cancelled";
}

/// A single telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Full event name, `prefix.suffix`.
    pub name: String,
    /// Numeric measurements (durations, delays, timestamps).
    pub measurements: HashMap<String, f64>,
    /// String metadata (request id, strategy kind, outcome fields).
    pub metadata: HashMap<String, String>,
    /// Wall-clock emission time.
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    /// The suffix portion of the name, after the caller-chosen prefix.
    pub fn suffix_of(&self, prefix: &str) -> Option<&str> {
        self.name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
    }
}

type Subscriber = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Fan-out bus for telemetry events.
///
/// Callback subscribers run synchronously on the emitting task, so they see
/// events in exactly the order the engine produced them. The broadcast
/// stream is best-effort: lagging receivers drop the oldest events.
pub struct TelemetryBus {
    subscribers: RwLock<Vec<Subscriber>>,
    tx: broadcast::Sender<TelemetryEvent>,
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CHANNEL_CAP);
        Self {
            subscribers: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Attach a synchronous subscriber. Keep callbacks cheap; they run on
    /// the request path.
    pub fn subscribe(&self, f: impl Fn(&TelemetryEvent) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .expect("telemetry subscriber lock poisoned")
            .push(Arc::new(f));
    }

    /// A broadcast receiver of all subsequently emitted events.
    pub fn watch(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Emit `prefix.suffix` with the given measurements and metadata.
    pub fn emit(
        &self,
        prefix: &str,
        suffix: &str,
        measurements: HashMap<String, f64>,
        metadata: HashMap<String, String>,
    ) {
        let event = TelemetryEvent {
            name: format!("{prefix}.{suffix}"),
            measurements,
            metadata,
            at: Utc::now(),
        };
        debug!(event = %event.name, "telemetry");

        let subscribers = self
            .subscribers
            .read()
            .expect("telemetry subscriber lock poisoned")
            .clone();
        for subscriber in &subscribers {
            subscriber(&event);
        }
        // No receivers is fine; the callback path is the primary consumer.
        let _ = self.tx.send(event);
    }
}

/// Single-entry measurements map.
pub fn measure(name: &str, value: f64) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    map.insert(name.to_string(), value);
    map
}

/// Single-entry metadata map.
pub fn meta(name: &str, value: impl Into<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(name.to_string(), value.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_name_prefixing() {
        let bus = TelemetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cl = seen.clone();
        bus.subscribe(move |e| seen_cl.lock().unwrap().push(e.name.clone()));

        bus.emit("myapp", suffix::REQUEST_START, HashMap::new(), HashMap::new());
        bus.emit("myapp", suffix::REQUEST_STOP, HashMap::new(), HashMap::new());

        let names = seen.lock().unwrap().clone();
        assert_eq!(names, vec!["myapp.request.start", "myapp.request.stop"]);
    }

    #[test]
    fn test_subscribers_see_emission_order() {
        let bus = TelemetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cl = seen.clone();
        bus.subscribe(move |e| seen_cl.lock().unwrap().push(e.name.clone()));

        for s in [
            suffix::REQUEST_START,
            suffix::HEDGE_FIRED,
            suffix::HEDGE_WON,
            suffix::REQUEST_CANCELLED,
            suffix::REQUEST_STOP,
        ] {
            bus.emit("h", s, HashMap::new(), HashMap::new());
        }

        let names = seen.lock().unwrap().clone();
        assert_eq!(
            names,
            vec![
                "h.request.start",
                "h.hedge.fired",
                "h.hedge.won",
                "h.request.cancelled",
                "h.request.stop",
            ]
        );
    }

    #[test]
    fn test_suffix_of() {
        let bus = TelemetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cl = seen.clone();
        bus.subscribe(move |e| seen_cl.lock().unwrap().push(e.clone()));

        bus.emit(
            "svc",
            suffix::HEDGE_FIRED,
            measure("delay", 50.0),
            meta("request_id", "abc"),
        );

        let events = seen.lock().unwrap().clone();
        assert_eq!(events[0].suffix_of("svc"), Some("hedge.fired"));
        assert_eq!(events[0].suffix_of("other"), None);
        assert_eq!(events[0].measurements["delay"], 50.0);
        assert_eq!(events[0].metadata["request_id"], "abc");
    }

    #[tokio::test]
    async fn test_broadcast_stream_delivery() {
        let bus = TelemetryBus::new();
        let mut rx = bus.watch();
        bus.emit("h", suffix::REQUEST_START, HashMap::new(), HashMap::new());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "h.request.start");
    }
}
