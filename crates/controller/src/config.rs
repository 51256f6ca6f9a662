//! TOML config file loading and validation: serial port tuning, sensor and
//! relay definitions, dosing loops, and setpoints.
//!
//! Tunables are dual-valued `"default,operational"` pairs.  The default slot
//! is the factory baseline an operator can fall back to; only the
//! operational slot ever governs behavior.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::policy::{CyclePlan, Ratio};
use crate::sensor::SensorKind;

// ---------------------------------------------------------------------------
// Dual values
// ---------------------------------------------------------------------------

/// A `"default,operational"` pair.  Everything past the parse boundary reads
/// `operational` exclusively.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual<T> {
    pub default: T,
    pub operational: T,
}

impl<T> FromStr for Dual<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (default, operational) = s
            .split_once(',')
            .ok_or_else(|| format!("expected \"default,operational\" pair, got '{s}'"))?;
        let default = default
            .trim()
            .parse::<T>()
            .map_err(|e| format!("bad default value '{}': {e}", default.trim()))?;
        let operational = operational
            .trim()
            .parse::<T>()
            .map_err(|e| format!("bad operational value '{}': {e}", operational.trim()))?;
        Ok(Dual {
            default,
            operational,
        })
    }
}

impl<'de, T> Deserialize<'de> for Dual<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Cycle durations
// ---------------------------------------------------------------------------

/// An `HH:MM:SS` loop duration.  `00:00:00` and the `99:99:99` sentinel both
/// mean the slot is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleDuration(Option<Duration>);

impl CycleDuration {
    pub fn disabled() -> Self {
        CycleDuration(None)
    }

    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            CycleDuration(None)
        } else {
            CycleDuration(Some(Duration::from_secs(secs)))
        }
    }

    pub fn get(self) -> Option<Duration> {
        self.0
    }

    pub fn is_disabled(self) -> bool {
        self.0.is_none()
    }
}

impl FromStr for CycleDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "99:99:99" {
            return Ok(CycleDuration(None));
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("invalid duration '{s}' (expected HH:MM:SS)"));
        }
        let field = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| format!("invalid duration '{s}' (expected HH:MM:SS)"))
        };
        let (h, m, sec) = (field(parts[0])?, field(parts[1])?, field(parts[2])?);
        if m >= 60 || sec >= 60 {
            return Err(format!("invalid duration '{s}' (minutes/seconds must be < 60)"));
        }
        Ok(CycleDuration::from_secs(h * 3600 + m * 60 + sec))
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortSettings,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    pub relay: RelayEntry,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopEntry>,
    #[serde(default)]
    pub setpoints: BTreeMap<String, SetpointEntry>,
}

/// Shared serial bus tuning.  Applies to every port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Read timeout per request.
    pub timeout_ms: u64,
    /// Wait between writing a request and reading the response.
    pub settle_ms: u64,
    /// Minimum gap between consecutive commands on the same port.
    pub spacing_ms: u64,
    /// Sensor poll cadence.
    pub poll_interval_secs: u64,
}

impl Default for PortSettings {
    fn default() -> Self {
        PortSettings {
            timeout_ms: 1000,
            settle_ms: 200,
            spacing_ms: 300,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub kind: SensorKind,
    pub port: String,
    pub address: u8,
    pub baud: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub port: String,
    pub address: u8,
    pub baud: u32,
    /// Actuator name -> relay channel index (0-15).
    pub channels: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopEntry {
    pub on_duration: Dual<CycleDuration>,
    pub wait_duration: Dual<CycleDuration>,
    /// Relay channel names driven by this loop, in ratio order.
    #[serde(default)]
    pub pumps: Vec<String>,
    /// Nutrient loops only: which pumps participate in a dose.
    pub ratio: Option<Dual<Ratio>>,
    /// Nutrient loops only: sensor consulted before dosing.
    pub sensor: Option<String>,
    /// Nutrient loops only: key into `[setpoints]`.
    pub setpoint: Option<String>,
}

impl LoopEntry {
    /// The loop's governing timing.
    pub fn plan(&self) -> CyclePlan {
        CyclePlan {
            on: self.on_duration.operational.get(),
            wait: self.wait_duration.operational.get(),
        }
    }

    pub fn is_nutrient(&self) -> bool {
        self.ratio.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetpointEntry {
    pub target: Dual<f64>,
    pub deadband: Dual<f64>,
    pub min: Dual<f64>,
    pub max: Dual<f64>,
}

/// Channels on one relay board.
const RELAY_CHANNEL_COUNT: u8 = 16;

/// Valid Modbus unit address range (0 is broadcast, 248+ reserved).
const ADDRESS_RANGE: std::ops::RangeInclusive<u8> = 1..=247;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_ports(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_relay(&mut errors);
        self.validate_setpoints(&mut errors);
        self.validate_loops(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_ports(&self, errors: &mut Vec<String>) {
        if self.ports.timeout_ms == 0 {
            errors.push("ports: timeout_ms must be positive".into());
        }
        if self.ports.poll_interval_secs == 0 {
            errors.push("ports: poll_interval_secs must be positive".into());
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.id)
                }
            };

            if s.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&s.id) {
                errors.push(format!("{}: duplicate sensor id", ctx()));
            }

            if s.port.trim().is_empty() {
                errors.push(format!("{}: port is empty", ctx()));
            }
            if !ADDRESS_RANGE.contains(&s.address) {
                errors.push(format!(
                    "{}: address {} out of Modbus unit range [1, 247]",
                    ctx(),
                    s.address
                ));
            }
            if s.baud == 0 {
                errors.push(format!("{}: baud must be positive", ctx()));
            }
        }
    }

    fn validate_relay(&self, errors: &mut Vec<String>) {
        if self.relay.port.trim().is_empty() {
            errors.push("relay: port is empty".into());
        }
        if !ADDRESS_RANGE.contains(&self.relay.address) {
            errors.push(format!(
                "relay: address {} out of Modbus unit range [1, 247]",
                self.relay.address
            ));
        }
        if self.relay.baud == 0 {
            errors.push("relay: baud must be positive".into());
        }

        let mut seen_channels: HashSet<u8> = HashSet::new();
        for (name, &channel) in &self.relay.channels {
            if name.trim().is_empty() {
                errors.push("relay: channel name is empty".into());
            }
            if channel >= RELAY_CHANNEL_COUNT {
                errors.push(format!(
                    "relay channel '{name}': index {channel} out of range [0, {}]",
                    RELAY_CHANNEL_COUNT - 1
                ));
            } else if !seen_channels.insert(channel) {
                errors.push(format!(
                    "relay channel '{name}': index {channel} is already used by another channel"
                ));
            }
        }
    }

    fn validate_setpoints(&self, errors: &mut Vec<String>) {
        for (name, sp) in &self.setpoints {
            let op = |d: &Dual<f64>| d.operational;
            if op(&sp.deadband) <= 0.0 {
                errors.push(format!(
                    "setpoint '{name}': deadband must be positive, got {}",
                    op(&sp.deadband)
                ));
            }
            if op(&sp.min) >= op(&sp.max) {
                errors.push(format!(
                    "setpoint '{name}': min ({}) must be less than max ({})",
                    op(&sp.min),
                    op(&sp.max)
                ));
            }
            if op(&sp.target) < op(&sp.min) || op(&sp.target) > op(&sp.max) {
                errors.push(format!(
                    "setpoint '{name}': target ({}) outside [min, max]",
                    op(&sp.target)
                ));
            }
        }
    }

    fn validate_loops(&self, errors: &mut Vec<String>) {
        let channel_names: HashSet<&str> =
            self.relay.channels.keys().map(String::as_str).collect();
        let sensor_ids: HashSet<&str> = self.sensors.iter().map(|s| s.id.as_str()).collect();

        for (id, lp) in &self.loops {
            let ctx = || format!("loop '{id}'");

            if lp.pumps.is_empty() {
                errors.push(format!("{}: no pumps configured", ctx()));
            }
            for pump in &lp.pumps {
                if !channel_names.contains(pump.as_str()) {
                    errors.push(format!(
                        "{}: pump '{pump}' does not match any relay channel",
                        ctx()
                    ));
                }
            }

            if let Some(ratio) = &lp.ratio {
                if ratio.operational.len() != lp.pumps.len() {
                    errors.push(format!(
                        "{}: ratio has {} components for {} pumps",
                        ctx(),
                        ratio.operational.len(),
                        lp.pumps.len()
                    ));
                }
                if lp.sensor.is_none() {
                    errors.push(format!("{}: ratio set but no sensor configured", ctx()));
                }
                if lp.setpoint.is_none() {
                    errors.push(format!("{}: ratio set but no setpoint configured", ctx()));
                }
            }

            if let Some(sensor) = &lp.sensor {
                if !sensor_ids.contains(sensor.as_str()) {
                    errors.push(format!(
                        "{}: sensor '{sensor}' does not match any defined sensor",
                        ctx()
                    ));
                }
            }
            if let Some(setpoint) = &lp.setpoint {
                if !self.setpoints.contains_key(setpoint) {
                    errors.push(format!(
                        "{}: setpoint '{setpoint}' does not match any defined setpoint",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// How often the watcher checks the config file's mtime.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Watch the config file and hand validated configs to the engine when it
/// changes.  An edit that fails to parse or validate is ignored with a
/// warning; the running config stays in effect.
pub fn spawn_watcher(
    path: String,
    tx: tokio::sync::mpsc::Sender<Config>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        loop {
            ticker.tick().await;
            let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => Some(m),
                Err(_) => continue,
            };
            if mtime == last_mtime {
                continue;
            }
            last_mtime = mtime;
            match load(&path) {
                Ok(config) => {
                    tracing::info!(%path, "config file changed; applying");
                    if tx.send(config).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(%path, "ignoring invalid config change: {e:#}");
                }
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
