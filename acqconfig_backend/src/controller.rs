//! Controller capability interface. See [`Controller`] for details.
//!
//! A controller plugin drives one piece of hardware (or a software emulation of it) exposing
//! several axes. Each axis is bound to one element: a counter/timer channel, an integrating
//! (ZeroD) channel, a trigger/gate, ...
//!
//! The acquisition core only ever calls the capability methods of [`Controller`]; concrete
//! hardware families implement it and are bound to the measurement configuration when the
//! configuration is built, never at acquisition time.
//!
//! ## Call protocol
//! A timer-driven acquisition walks all involved controllers through the following phases,
//! each phase being completed for every controller before the next one starts:
//! 1. `PreLoadAll`, `PreLoadOne`, `LoadOne`, `LoadAll` (per controller)
//! 2. `PreStartAll`
//! 3. `PreStartOne`, `StartOne` (per enabled channel)
//! 4. `StartAll`
//!
//! State and value reads follow the same "all / one / all" pattern
//! (`PreStateAll`, `StateAll`, `StateOne` and `PreReadAll`, `PreReadOne`, `ReadAll`, `ReadOne`).

use std::fmt;
use std::sync::Arc;

use crate::element::{AcqValue, StateInfo};
use crate::error::ControllerError;
use crate::synch::TimingValue;

/// Axis number of an element inside its controller.
pub type Axis = usize;

/// Result type of controller capability calls.
pub type CtrlResult<T> = Result<T, ControllerError>;

/// Element types a controller may handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    CTExpChannel,
    ZeroDExpChannel,
    OneDExpChannel,
    TwoDExpChannel,
    TriggerGate,
}
impl ElementType {
    /// Timerable elements can be started and stopped by a timer or monitor channel.
    pub fn is_timerable(self) -> bool {
        matches!(
            self,
            ElementType::CTExpChannel | ElementType::OneDExpChannel | ElementType::TwoDExpChannel
        )
    }
}

/// Value of a controller parameter, see [`Controller::set_ctrl_par`].
#[derive(Clone, Debug, PartialEq)]
pub enum CtrlParValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// The capability interface implemented by controller plugins.
///
/// All methods take `&self`: a controller is shared between the sub-acquisitions through an
/// `Arc` and serialized by the hardware-access context of the acquisition driving it, so
/// implementations keep their mutable state behind a lock.
///
/// Only [`Controller::name`], [`Controller::ctrl_types`], [`Controller::state_one`] and
/// [`Controller::read_one`] are mandatory, every other method defaults to a successful no-op.
///
/// ## Repetitions-aware loading
/// `pre_load_one` and `load_one` receive the number of repetitions of the acquisition when it
/// is known. Controllers predating this argument answer a `Some(_)` with
/// [`ControllerError::RepetitionsUnsupported`]; the caller then repeats the call with `None`.
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;
    fn ctrl_types(&self) -> &[ElementType];

    /// A controller is timerable if it handles at least one timerable element type.
    fn is_timerable(&self) -> bool {
        self.ctrl_types().iter().any(|t| t.is_timerable())
    }
    /// Integrating controllers are recognized by their main (first) element type.
    fn is_zerod(&self) -> bool {
        self.ctrl_types().first() == Some(&ElementType::ZeroDExpChannel)
    }
    /// Software-implemented trigger/gate controllers return `true`.
    fn is_software(&self) -> bool {
        false
    }

    fn pre_load_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn pre_load_one(
        &self,
        _axis: Axis,
        _value: &TimingValue,
        _repetitions: Option<u64>,
    ) -> CtrlResult<bool> {
        Ok(true)
    }
    fn load_one(&self, _axis: Axis, _value: &TimingValue, _repetitions: Option<u64>) -> CtrlResult<()> {
        Ok(())
    }
    fn load_all(&self) -> CtrlResult<()> {
        Ok(())
    }

    fn pre_start_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn pre_start_one(&self, _axis: Axis, _value: &TimingValue) -> CtrlResult<bool> {
        Ok(true)
    }
    fn start_one(&self, _axis: Axis, _value: &TimingValue) -> CtrlResult<()> {
        Ok(())
    }
    fn start_all(&self) -> CtrlResult<()> {
        Ok(())
    }

    fn pre_state_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn state_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn state_one(&self, axis: Axis) -> CtrlResult<StateInfo>;

    fn pre_read_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn pre_read_one(&self, _axis: Axis) -> CtrlResult<()> {
        Ok(())
    }
    fn read_all(&self) -> CtrlResult<()> {
        Ok(())
    }
    fn read_one(&self, axis: Axis) -> CtrlResult<AcqValue>;

    fn stop_one(&self, _axis: Axis) -> CtrlResult<()> {
        Ok(())
    }
    fn abort_one(&self, _axis: Axis) -> CtrlResult<()> {
        Ok(())
    }

    /// Sets a controller-wide parameter such as `repetitions`.
    fn set_ctrl_par(&self, name: &str, _value: CtrlParValue) -> CtrlResult<()> {
        Err(ControllerError::UnsupportedParameter(name.to_string()))
    }
}

/// A trigger/gate element: one axis of a trigger/gate controller.
///
/// Two trigger/gate elements are the same element if they share their full name.
#[derive(Clone)]
pub struct TriggerGate {
    name: String,
    full_name: String,
    axis: Axis,
    ctrl: Arc<dyn Controller>,
}
impl TriggerGate {
    pub fn new(name: &str, full_name: &str, axis: Axis, ctrl: Arc<dyn Controller>) -> Self {
        Self {
            name: name.to_string(),
            full_name: full_name.to_string(),
            axis,
            ctrl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
    pub fn axis(&self) -> Axis {
        self.axis
    }
    pub fn ctrl(&self) -> &Arc<dyn Controller> {
        &self.ctrl
    }
    /// Whether this trigger/gate is implemented in software.
    pub fn is_software(&self) -> bool {
        self.ctrl.is_software()
    }
}
impl PartialEq for TriggerGate {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}
impl Eq for TriggerGate {}
impl fmt::Debug for TriggerGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerGate")
            .field("name", &self.name)
            .field("full_name", &self.full_name)
            .field("axis", &self.axis)
            .field("ctrl", &self.ctrl.name())
            .finish()
    }
}
