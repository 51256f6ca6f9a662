use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::sensor::Measurement;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared(state: SystemState) -> SharedState {
    Arc::new(RwLock::new(state))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub sensors: HashMap<String, SensorState>,
    pub relays: HashMap<String, RelayState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SensorState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub measurement: Measurement,
    /// Monotonic timestamp for staleness checks; not part of snapshots.
    #[serde(skip)]
    pub taken_at: Instant,
}

#[derive(Clone, Serialize)]
pub struct RelayState {
    pub on: bool,
    pub channel: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Relay,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON snapshot (the seam for any future status surface)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub sensors: HashMap<String, SensorState>,
    pub relays: HashMap<String, RelayState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(channels: &[(String, u8)]) -> Self {
        let mut relays = HashMap::new();
        for (name, channel) in channels {
            relays.insert(
                name.clone(),
                RelayState {
                    on: false,
                    channel: *channel,
                    last_changed: None,
                },
            );
        }

        Self {
            started_at: Instant::now(),
            sensors: HashMap::new(),
            relays,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a fresh sensor measurement.
    pub fn record_measurement(&mut self, sensor_id: &str, measurement: Measurement) {
        self.sensors.insert(
            sensor_id.to_string(),
            SensorState {
                last_seen: OffsetDateTime::now_utc(),
                measurement,
                taken_at: Instant::now(),
            },
        );
        self.push_event(EventKind::Reading, format!("{sensor_id}: {measurement}"));
    }

    /// Latest measurement for a sensor along with its age, or `None` if the
    /// sensor has never reported.
    pub fn reading(&self, sensor_id: &str) -> Option<(Measurement, Duration)> {
        self.sensors
            .get(sensor_id)
            .map(|s| (s.measurement, s.taken_at.elapsed()))
    }

    /// Record a relay state change.
    pub fn record_relay(&mut self, name: &str, on: bool) {
        if let Some(relay) = self.relays.get_mut(name) {
            relay.on = on;
            relay.last_changed = Some(OffsetDateTime::now_utc());
        }

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Relay, format!("{name} set {state_str}"));
    }

    /// Record a scheduler decision (cycle start/stop, failsafe, reload).
    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            sensors: self.sensors.clone(),
            relays: self.relays.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
