//! State and value vocabulary shared between the acquisition loops and the publication layer.
//!
//! ## Acquirable elements
//! Every experimental channel taking part in an acquisition is seen through the [`Acquirable`]
//! trait. The acquisition loops never talk to observers directly: they hand states and values
//! to the element, which decides how (and whether) to propagate them. The `propagate` argument
//! mirrors the three levels the publication layer understands, see [`Propagate`].
//!
//! ## Acquisition state
//! The aggregate [`AcquisitionState`] of a set of elements is never stored. It is derived from
//! the raw controller states with [`AcquisitionState::from_states`]: a single element in
//! progress (see [`is_in_action`]) makes the whole set acquiring.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::{Array1, ArrayD, Axis as ArrayAxis, IxDyn};
use parking_lot::ReentrantMutex;

use crate::controller::Axis;

/// Element states as reported by controllers and published to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    On,
    Off,
    Moving,
    Standby,
    Fault,
    Init,
    Alarm,
    Disable,
    Invalid,
    Unknown,
}
impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                State::On => "On",
                State::Off => "Off",
                State::Moving => "Moving",
                State::Standby => "Standby",
                State::Fault => "Fault",
                State::Init => "Init",
                State::Alarm => "Alarm",
                State::Disable => "Disable",
                State::Invalid => "Invalid",
                State::Unknown => "Unknown",
            }
        )
    }
}

/// A state together with its status message, as returned by `StateOne`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateInfo {
    pub state: State,
    pub status: String,
}
impl StateInfo {
    pub fn new(state: State, status: impl Into<String>) -> Self {
        Self {
            state,
            status: status.into(),
        }
    }
}
impl From<State> for StateInfo {
    fn from(state: State) -> Self {
        Self::new(state, "")
    }
}

/// Propagation level of a state or value change.
///
/// `None` only updates the element cache, `Changed` notifies observers if the value changed and
/// `Priority` forces a notification (used for first samples and final publications).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Propagate {
    None = 0,
    Changed = 1,
    Priority = 2,
}

/// The "in progress" predicate applied to raw controller states.
pub fn is_in_action(state: State) -> bool {
    state == State::Moving
}

/// Aggregate state of a set of acquiring elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    Stopped,
    Acquiring,
    Invalid,
}
impl AcquisitionState {
    /// Derives the aggregate state: any element in progress means `Acquiring`.
    pub fn from_states<'a, I>(states: I) -> Self
    where
        I: IntoIterator<Item = &'a StateInfo>,
    {
        let mut invalid = false;
        for info in states {
            if is_in_action(info.state) {
                return AcquisitionState::Acquiring;
            }
            invalid |= info.state == State::Invalid;
        }
        if invalid {
            AcquisitionState::Invalid
        } else {
            AcquisitionState::Stopped
        }
    }
}

/// Seconds since the unix epoch, used to timestamp readouts.
pub fn timestamp_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

/// A single readout of an experimental channel.
///
/// The payload is an n-dimensional array: scalar channels read 0-dimensional arrays, continuous
/// counters return one sample per trigger as a 1-dimensional array.
#[derive(Clone, Debug, PartialEq)]
pub struct AcqValue {
    pub value: ArrayD<f64>,
    pub idx: Option<Vec<u64>>,
    pub timestamp: f64,
}
impl AcqValue {
    pub fn new(value: ArrayD<f64>) -> Self {
        Self {
            value,
            idx: None,
            timestamp: timestamp_now(),
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self::new(Array1::from(values).into_dyn())
    }

    /// A payload without samples, e.g. a continuous counter that has not been triggered yet.
    pub fn is_empty(&self) -> bool {
        self.value.len() == 0
    }

    /// Wraps the payload into a single-element sequence tagged with `index`, so that the
    /// transport layer publishes it as indexed data instead of a scalar.
    pub fn into_indexed(self, index: u64) -> Self {
        Self {
            value: self.value.insert_axis(ArrayAxis(0)),
            idx: Some(vec![index]),
            timestamp: self.timestamp,
        }
    }
}

/// An experimental channel as seen by the acquisition loops.
///
/// Implementations must be thread safe: the hardware loop, the worker pool and the trigger
/// source may all reach the same element.
pub trait Acquirable: Send + Sync {
    fn name(&self) -> &str;
    fn axis(&self) -> Axis;
    /// Name of the controller owning this element.
    fn ctrl_name(&self) -> &str;

    /// Per-element lock held while the pending operation is cleared and the final state published.
    fn operation_lock(&self) -> &ReentrantMutex<()>;

    fn put_value(&self, value: AcqValue, index: Option<u64>, propagate: Propagate);
    fn set_state(&self, state: State, propagate: Propagate);
    fn set_state_info(&self, info: StateInfo, propagate: Propagate);
    fn clear_operation(&self);
    /// Publishes whatever has been accumulated through `put_value(.., Propagate::None)`.
    fn propagate_value(&self, priority: u8);

    /// Translates the raw controller state into the externally reported one.
    fn from_ctrl_state_info(&self, info: StateInfo) -> StateInfo {
        info
    }

    /// Clears the accumulation buffer of integrating channels.
    fn clear_buffer(&self) {}
}
