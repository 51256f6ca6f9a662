//! Sensor register maps and payload decoding.
//!
//! Each probe kind has a fixed holding-register window and its own packing.
//! Decoders are pure functions over the response payload; anything
//! malformed, truncated, or physically implausible decodes to `None` — a
//! missing reading, never a stale or default value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::MissedTickBehavior;

use crate::config::SensorEntry;
use crate::protocol;
use crate::state::SharedState;
use crate::transport::TransportMux;

// ---------------------------------------------------------------------------
// Sensor kinds and register map
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Ph,
    Ec,
    Do,
    WaterLevel,
}

impl SensorKind {
    /// Holding-register window: (start, count).
    fn registers(self) -> (u16, u16) {
        match self {
            SensorKind::Ph => (0x0000, 2),
            SensorKind::Ec => (0x0000, 16),
            SensorKind::Do => (0x0014, 2),
            SensorKind::WaterLevel => (0x0000, 8),
        }
    }

    /// The read request for this probe kind.
    pub fn request(self, address: u8) -> Vec<u8> {
        let (start, count) = self.registers();
        protocol::read_holding_registers(address, start, count)
    }

    /// Expected response frame length.
    pub fn response_len(self) -> usize {
        let (_, count) = self.registers();
        protocol::read_response_len(count as usize * 2)
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurement {
    Ph {
        ph: f64,
        temperature: f64,
    },
    Ec {
        /// mS/cm
        ec: f64,
        resistance: f64,
        temperature: f64,
        /// ppm
        tds: f64,
        salinity: f64,
        coefficient: f64,
    },
    Do {
        /// mg/L
        mg_l: f64,
    },
    WaterLevel {
        /// cm relative to the reference mark; negative is below it.
        level: i16,
    },
}

impl Measurement {
    /// The scalar compared against a setpoint.
    pub fn primary(&self) -> f64 {
        match *self {
            Measurement::Ph { ph, .. } => ph,
            Measurement::Ec { ec, .. } => ec,
            Measurement::Do { mg_l } => mg_l,
            Measurement::WaterLevel { level } => level as f64,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Measurement::Ph { ph, temperature } => {
                write!(f, "ph={ph:.2} temp={temperature:.1}C")
            }
            Measurement::Ec { ec, tds, temperature, .. } => {
                write!(f, "ec={ec:.2}mS/cm tds={tds:.0}ppm temp={temperature:.1}C")
            }
            Measurement::Do { mg_l } => write!(f, "do={mg_l:.2}mg/L"),
            Measurement::WaterLevel { level } => write!(f, "level={level}cm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a read-holding-registers payload (leading byte count included)
/// for the given probe kind.
pub fn decode(kind: SensorKind, payload: &[u8]) -> Option<Measurement> {
    let (_, count) = kind.registers();
    let expected = count as usize * 2;
    if payload.len() != expected + 1 || payload[0] as usize != expected {
        return None;
    }
    let data = &payload[1..];

    match kind {
        SensorKind::Ph => decode_ph(data),
        SensorKind::Ec => decode_ec(data),
        SensorKind::Do => decode_do(data),
        SensorKind::WaterLevel => decode_water_level(data),
    }
}

fn reg_u16(data: &[u8], index: usize) -> u16 {
    u16::from_be_bytes([data[index * 2], data[index * 2 + 1]])
}

fn decode_ph(data: &[u8]) -> Option<Measurement> {
    let ph = reg_u16(data, 0) as f64 / 100.0;
    let temperature = reg_u16(data, 1) as f64 / 10.0;
    if !(0.0..=14.0).contains(&ph) || !(-10.0..=120.0).contains(&temperature) {
        return None;
    }
    Some(Measurement::Ph { ph, temperature })
}

fn decode_do(data: &[u8]) -> Option<Measurement> {
    let mg_l = reg_u16(data, 0) as f64 / 100.0;
    Some(Measurement::Do { mg_l })
}

fn decode_water_level(data: &[u8]) -> Option<Measurement> {
    // Signed level lives in register 4 of the block.
    let level = i16::from_be_bytes([data[8], data[9]]);
    Some(Measurement::WaterLevel { level })
}

/// The EC board streams eight 32-bit floats, each word-swapped relative to
/// big-endian: the wire carries `[b2, b3, b0, b1]`.
fn wire_f32(chunk: &[u8]) -> f32 {
    f32::from_be_bytes([chunk[2], chunk[3], chunk[0], chunk[1]])
}

fn decode_ec(data: &[u8]) -> Option<Measurement> {
    let slot = |i: usize| wire_f32(&data[i * 4..i * 4 + 4]) as f64;
    let (ec, resistance, temperature) = (slot(0), slot(1), slot(2));
    let (tds, salinity, coefficient) = (slot(3), slot(4), slot(5));

    let values = [ec, resistance, temperature, tds, salinity, coefficient];
    if values.iter().any(|v| !v.is_finite()) || ec < 0.0 {
        return None;
    }
    Some(Measurement::Ec {
        ec,
        resistance,
        temperature,
        tds,
        salinity,
        coefficient,
    })
}

// ---------------------------------------------------------------------------
// Bus access + poll task
// ---------------------------------------------------------------------------

/// One full read of a configured sensor.
pub async fn read_sensor(mux: &TransportMux, entry: &SensorEntry) -> Result<Measurement> {
    let frame = entry.kind.request(entry.address);
    let resp = mux
        .request(&entry.port, entry.baud, frame, entry.kind.response_len())
        .await?;
    decode(entry.kind, &resp.payload)
        .ok_or_else(|| anyhow!("implausible or malformed payload ({} bytes)", resp.payload.len()))
}

/// Refresh every configured sensor on a fixed cadence, recording readings
/// and failures in shared state.  Read failures are events, not crashes.
pub fn spawn_poll_task(
    mux: Arc<TransportMux>,
    sensors: Vec<SensorEntry>,
    poll_interval: Duration,
    state: SharedState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for sensor in &sensors {
                match read_sensor(&mux, sensor).await {
                    Ok(measurement) => {
                        tracing::debug!(sensor = %sensor.id, value = %measurement, "reading");
                        state.write().await.record_measurement(&sensor.id, measurement);
                    }
                    Err(e) => {
                        tracing::warn!(sensor = %sensor.id, error = %e, "sensor read failed");
                        state
                            .write()
                            .await
                            .record_error(format!("sensor {}: {e:#}", sensor.id));
                    }
                }
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
