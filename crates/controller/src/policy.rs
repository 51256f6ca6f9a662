//! Control-loop decision functions.
//!
//! Everything in here is a pure function over plain values so the rules can
//! be tested without a bus, a store, or a clock.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Deadband dosing
// ---------------------------------------------------------------------------

/// Dose only when the reading has fallen strictly below `target - deadband`.
/// An absent reading never doses: no measurement, no actuation.
pub fn dose_needed(reading: Option<f64>, target: f64, deadband: f64) -> bool {
    match reading {
        Some(value) => value < target - deadband,
        None => false,
    }
}

/// A reading older than three poll intervals is treated as absent.
pub fn is_stale(age: Duration, poll_interval: Duration) -> bool {
    age > poll_interval * 3
}

// ---------------------------------------------------------------------------
// Ratio gate
// ---------------------------------------------------------------------------

/// A colon-separated pump ratio such as `"2:1:0"`.
///
/// Only presence matters: a component greater than zero activates the
/// corresponding pump, zero leaves it off.  Relative magnitudes are not
/// interpreted (`"2:1:0"` behaves the same as `"1:1:0"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ratio(Vec<u32>);

impl Ratio {
    /// One gate per component, in order.
    pub fn gates(&self) -> Vec<bool> {
        self.0.iter().map(|&c| c > 0).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every component is zero — nothing to dose.
    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }
}

impl FromStr for Ratio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components: Result<Vec<u32>, _> = s
            .split(':')
            .map(|part| part.trim().parse::<u32>())
            .collect();
        match components {
            Ok(parts) if !parts.is_empty() => Ok(Ratio(parts)),
            _ => Err(format!("invalid ratio '{s}' (expected e.g. \"1:1:0\")")),
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(":"))
    }
}

// ---------------------------------------------------------------------------
// Config-reload reconciliation
// ---------------------------------------------------------------------------

/// A cycle loop's effective timing: `None` means the slot is disabled
/// (configured as `00:00:00` or the `99:99:99` sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub on: Option<Duration>,
    pub wait: Option<Duration>,
}

impl CyclePlan {
    pub fn enabled(&self) -> bool {
        self.on.is_some() && self.wait.is_some()
    }
}

/// What the engine should do with a loop after its config changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadAction {
    /// Cancel pending jobs and stop the loop's actuators.
    Disable,
    /// Cancel pending jobs and start a fresh cycle now.
    ImmediateRun,
    /// Keep the running cycle; only future jobs pick up the new timing.
    RescheduleOnly,
}

/// Decide how a cycle loop reacts to a config change.
///
/// A longer on-duration or a shorter wait both mean the operator asked for
/// more output — honor that immediately rather than at the end of the
/// current wait period.  A shorter on-duration or longer wait asks for
/// less, which the existing schedule already satisfies until its next run.
pub fn reconcile(old: CyclePlan, new: CyclePlan) -> ReloadAction {
    if !new.enabled() {
        return ReloadAction::Disable;
    }
    if !old.enabled() {
        return ReloadAction::ImmediateRun;
    }
    let on_increased = new.on > old.on;
    let wait_decreased = new.wait < old.wait;
    if on_increased || wait_decreased {
        ReloadAction::ImmediateRun
    } else {
        ReloadAction::RescheduleOnly
    }
}

// ===========================================================================
// Tests
// ===========================================================================
