//! Synchronization descriptions and the timing values derived from them.
//!
//! A synchronization description is an ordered list of [`SynchGroup`]s. Each group describes
//! `repeats` identical acquisition windows: an initial `delay`, an `active` period during which
//! channels integrate, and a `total` period after which the next window starts. Values are
//! expressed per domain (time, position); only the time domain drives the acquisition core.
//!
//! The JSON form uses the same keys as the instrument definitions:
//! ```
//! use acqconfig_backend::synch::*;
//!
//! let synch: Vec<SynchGroup> =
//!     serde_json::from_str(r#"[{"Active": {"Time": 0.1}, "Total": {"Time": 0.2}, "Repeats": 3}]"#)
//!         .unwrap();
//! assert_eq!(synch[0].repeats, 3);
//! assert_eq!(extract_integration_time(&synch).unwrap(), TimingValue::Scalar(0.1));
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Value of one synchronization parameter in each of its domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SynchDomainValue {
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}
impl SynchDomainValue {
    pub fn time(time: f64) -> Self {
        Self {
            time,
            position: None,
        }
    }
}

fn default_repeats() -> u64 {
    1
}

/// One group of identical acquisition windows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SynchGroup {
    #[serde(default)]
    pub delay: SynchDomainValue,
    pub active: SynchDomainValue,
    #[serde(default)]
    pub total: SynchDomainValue,
    #[serde(default = "default_repeats")]
    pub repeats: u64,
}
impl SynchGroup {
    pub fn new(active_time: f64, repeats: u64) -> Self {
        Self {
            delay: SynchDomainValue::default(),
            active: SynchDomainValue::time(active_time),
            total: SynchDomainValue::time(active_time),
            repeats,
        }
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = SynchDomainValue::time(delay);
        self
    }

    pub fn with_total(mut self, total: f64) -> Self {
        self.total = SynchDomainValue::time(total);
        self
    }

    /// Time between the start of two consecutive windows. A total shorter than the active
    /// period is treated as back-to-back windows.
    pub fn period(&self) -> f64 {
        self.total.time.max(self.active.time)
    }
}

/// Integration time (or negated monitor count) handed to controllers for one cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum TimingValue {
    Scalar(f64),
    Sequence(Vec<f64>),
}
impl TimingValue {
    /// The value of the first window, which is what single-shot controllers load.
    pub fn first(&self) -> Option<f64> {
        match self {
            TimingValue::Scalar(value) => Some(*value),
            TimingValue::Sequence(values) => values.first().copied(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TimingValue::Scalar(_) => 1,
            TimingValue::Sequence(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl From<f64> for TimingValue {
    fn from(value: f64) -> Self {
        TimingValue::Scalar(value)
    }
}
impl fmt::Display for TimingValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimingValue::Scalar(value) => write!(f, "{}", value),
            TimingValue::Sequence(values) => write!(f, "{:?}", values),
        }
    }
}

/// Extracts the integration time(s) from a synchronization description.
///
/// A single group yields its scalar active time. Several groups yield the sequence obtained by
/// repeating each group's active time `repeats` times, concatenated in group order.
///
/// # Errors
/// [`ConfigError::EmptySynchronization`] if the description has no group.
pub fn extract_integration_time(synchronization: &[SynchGroup]) -> ConfigResult<TimingValue> {
    match synchronization {
        [] => Err(ConfigError::EmptySynchronization),
        [group] => Ok(TimingValue::Scalar(group.active.time)),
        groups => Ok(TimingValue::Sequence(
            groups
                .iter()
                .flat_map(|group| {
                    std::iter::repeat(group.active.time).take(group.repeats as usize)
                })
                .collect(),
        )),
    }
}

/// Active time of the window numbered `index`, windows being counted from 0 across groups.
pub fn window_active_time(synchronization: &[SynchGroup], index: u64) -> Option<f64> {
    let mut first = 0;
    for group in synchronization {
        if index < first + group.repeats {
            return Some(group.active.time);
        }
        first += group.repeats;
    }
    None
}

/// Converts a time in seconds, negative times meaning zero.
///
/// # Errors
/// [`ConfigError::InvalidDuration`] for NaN and for times too large to be represented.
pub fn duration_from_secs(what: &'static str, secs: f64) -> ConfigResult<Duration> {
    let clamped = if secs < 0. { 0. } else { secs };
    Duration::try_from_secs_f64(clamped).map_err(|_| ConfigError::InvalidDuration { what, value: secs })
}

/// Time from the start of the description to the end of its last window.
///
/// # Errors
/// [`ConfigError::InvalidDuration`] if the span can not be represented.
pub fn synchronization_span(synchronization: &[SynchGroup]) -> ConfigResult<Duration> {
    let mut offset = 0.;
    let mut end: f64 = 0.;
    for group in synchronization {
        offset += group.delay.time;
        if group.repeats > 0 {
            let last_start = offset + group.period() * (group.repeats - 1) as f64;
            end = end.max(last_start + group.active.time);
            offset += group.period() * group.repeats as f64;
        }
    }
    duration_from_secs("synchronization", end.max(offset))
}
