//! # Actions: the common skeleton of every sub-acquisition
//!
//! Every sub-acquisition (hardware, software, integrator, trigger generation) is an action built
//! around an [`ActionBase`], which provides:
//!
//! - **Running bookkeeping**: [`ActionBase::try_set_running`] returns a [`RunningGuard`] which
//!   clears the running flag when dropped, whatever the exit path of the cycle.
//! - **Stop/abort flags**: reset when a cycle starts, set from any thread.
//! - **Hardware-access context**: [`ActionBase::context`] returns an [`ActionContext`], an RAII
//!   guard over the reentrant lock serializing controller calls of the action. Raw state and
//!   value reads are only available on a context, so they can not be issued outside of one.
//! - **Channel set**: the [`ChannelSet`] of the current cycle.
//!
//! ## Reads
//! State reads follow the controller protocol `PreStateAll`, `StateAll`, `StateOne`. A failing
//! call does not abort the read: the affected channels report [`State::Fault`] with the error as
//! status. Value reads follow `PreReadAll`, `PreReadOne`, `ReadAll`, `ReadOne` and keep the error
//! per channel, see [`ValueReadout`].
//!
//! ## Starting actions
//! [`Action`] is the object-safe control surface (stop, abort, running state). [`CycleAction`]
//! adds the two halves of a cycle, `start_action` and `action_loop`, together with their request
//! type. [`spawn_action`] starts an action synchronously, so that configuration and protocol
//! errors reach the caller, then runs its loop on a dedicated named thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use acqconfig_backend::{
    AcqValue, AcquisitionState, ConfigError, CtrlResult, MasterKey, MeasurementConfig, State,
    StateInfo, TimingValue,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{error, trace, warn};

use crate::channel_set::ChannelSet;
use crate::error::{AcqError, AcqResult, InCtrl};

/// Raw controller states of a read, keyed by element name.
pub type StateReadout = IndexMap<String, StateInfo>;

/// Raw values of a read, keyed by element name. Failed reads keep their error.
pub type ValueReadout = IndexMap<String, CtrlResult<AcqValue>>;

/// Whether any of the read states means the acquisition is still in progress.
pub fn in_acquisition(states: &StateReadout) -> bool {
    AcquisitionState::from_states(states.values()) == AcquisitionState::Acquiring
}

/// Parameters of one timer- or monitor-driven cycle.
///
/// Exactly one of `integ_time` and `monitor_count` must be given. `sleep_time` and
/// `states_per_value` override the loop settings of the acquisition for this cycle only.
#[derive(Clone, Debug)]
pub struct AcqRequest {
    pub config: Arc<MeasurementConfig>,
    pub integ_time: Option<TimingValue>,
    pub monitor_count: Option<f64>,
    pub repetitions: Option<u64>,
    /// Trigger index assigned to the values of this cycle.
    pub index: Option<u64>,
    pub sleep_time: Option<Duration>,
    pub states_per_value: Option<u32>,
}
impl AcqRequest {
    pub fn new(config: Arc<MeasurementConfig>) -> Self {
        Self {
            config,
            integ_time: None,
            monitor_count: None,
            repetitions: None,
            index: None,
            sleep_time: None,
            states_per_value: None,
        }
    }

    pub fn with_integ_time(mut self, integ_time: impl Into<TimingValue>) -> Self {
        self.integ_time = Some(integ_time.into());
        self
    }

    pub fn with_monitor_count(mut self, count: f64) -> Self {
        self.monitor_count = Some(count);
        self
    }

    pub fn with_repetitions(mut self, repetitions: u64) -> Self {
        self.repetitions = Some(repetitions);
        self
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = Some(sleep_time);
        self
    }

    pub fn with_states_per_value(mut self, states_per_value: u32) -> Self {
        self.states_per_value = Some(states_per_value);
        self
    }

    /// The master key and the value loaded into the master channels: the integration time for
    /// the timer, the negated count for the monitor.
    ///
    /// # Errors
    /// [`ConfigError::MissingTimingParameter`] or [`ConfigError::ConflictingTimingParameters`]
    /// unless exactly one of integration time and monitor count is set.
    pub fn master(&self) -> AcqResult<(MasterKey, TimingValue)> {
        match (&self.integ_time, self.monitor_count) {
            (None, None) => Err(ConfigError::MissingTimingParameter.into()),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingTimingParameters.into()),
            (Some(integ_time), None) => Ok((MasterKey::Timer, integ_time.clone())),
            (None, Some(count)) => Ok((MasterKey::Monitor, TimingValue::Scalar(-count))),
        }
    }
}

/// Clears the running flag of an action when dropped.
pub struct RunningGuard {
    flag: Arc<AtomicBool>,
}
impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Scoped hardware access of an action. Controller calls are only issued while one is alive.
pub struct ActionContext<'a> {
    action: &'a str,
    _guard: ReentrantMutexGuard<'a, ()>,
}
impl<'a> ActionContext<'a> {
    /// Reads the state of every channel of `set`.
    pub fn raw_read_state_info(&self, set: &ChannelSet) -> StateReadout {
        let mut states = StateReadout::new();
        for group in set.groups() {
            let ctrl = &group.ctrl;
            let prepared = ctrl.pre_state_all().and_then(|_| ctrl.state_all());
            for channel in group.channels.iter() {
                let info = match &prepared {
                    Ok(()) => ctrl.state_one(channel.axis()),
                    Err(err) => Err(err.clone()),
                }
                .unwrap_or_else(|err| {
                    warn!(action = self.action, ctrl = ctrl.name(), "state read failed: {}", err);
                    StateInfo::new(State::Fault, err.to_string())
                });
                states.insert(channel.name().to_string(), info);
            }
        }
        states
    }

    /// Reads the value of every channel of `set`.
    pub fn raw_read_value(&self, set: &ChannelSet) -> ValueReadout {
        let mut values = ValueReadout::new();
        for group in set.groups() {
            let ctrl = &group.ctrl;
            let prepared = ctrl
                .pre_read_all()
                .and_then(|_| {
                    group
                        .channels
                        .iter()
                        .try_for_each(|channel| ctrl.pre_read_one(channel.axis()))
                })
                .and_then(|_| ctrl.read_all());
            for channel in group.channels.iter() {
                let value = match &prepared {
                    Ok(()) => ctrl.read_one(channel.axis()),
                    Err(err) => Err(err.clone()),
                };
                values.insert(channel.name().to_string(), value);
            }
        }
        values
    }
}
impl<'a> Drop for ActionContext<'a> {
    fn drop(&mut self) {
        trace!(action = self.action, "left hardware context");
    }
}

/// State shared by every action, see the [module documentation](self).
pub struct ActionBase {
    name: String,
    hw_lock: ReentrantMutex<()>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    aborted: AtomicBool,
    channels: Mutex<Arc<ChannelSet>>,
}
impl ActionBase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hw_lock: ReentrantMutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            channels: Mutex::new(Arc::new(ChannelSet::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> ActionContext<'_> {
        let guard = self.hw_lock.lock();
        trace!(action = %self.name, "entered hardware context");
        ActionContext {
            action: &self.name,
            _guard: guard,
        }
    }

    /// Marks the action as running.
    ///
    /// # Errors
    /// [`AcqError::AlreadyRunning`] if a previous cycle is still running.
    pub fn try_set_running(&self) -> AcqResult<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AcqError::AlreadyRunning(self.name.clone()))?;
        Ok(RunningGuard {
            flag: self.running.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn reset_flags(&self) {
        self.stopped.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Installs the channel set of a new cycle.
    pub fn set_channels(&self, set: ChannelSet) -> Arc<ChannelSet> {
        let set = Arc::new(set);
        *self.channels.lock() = set.clone();
        set
    }

    pub fn channels(&self) -> Arc<ChannelSet> {
        self.channels.lock().clone()
    }

    pub fn read_state_info(&self, set: &ChannelSet) -> StateReadout {
        self.context().raw_read_state_info(set)
    }

    pub fn read_value(&self, set: &ChannelSet) -> ValueReadout {
        self.context().raw_read_value(set)
    }

    /// Issues `StopOne` (or `AbortOne`) to every channel of the current cycle.
    ///
    /// Every channel is attempted; the first failure is returned.
    pub fn stop_channels(&self, abort: bool) -> AcqResult<()> {
        let set = self.channels();
        let _ctx = self.context();
        let mut result = Ok(());
        for group in set.groups() {
            for channel in group.channels.iter() {
                let res = if abort {
                    group.ctrl.abort_one(channel.axis())
                } else {
                    group.ctrl.stop_one(channel.axis())
                };
                if let Err(err) = res.in_ctrl(group.ctrl.name()) {
                    error!(action = %self.name, channel = channel.name(), "{}", err);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }
}

/// Control surface shared by every sub-acquisition.
pub trait Action: Send + Sync {
    fn base(&self) -> &ActionBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn is_running(&self) -> bool {
        self.base().is_running()
    }

    fn stop_action(&self) -> AcqResult<()> {
        self.base().request_stop();
        Ok(())
    }

    fn abort_action(&self) -> AcqResult<()> {
        self.base().request_abort();
        Ok(())
    }
}

/// An action driven through cycles: `start_action` prepares and launches, `action_loop` waits
/// for completion and publishes the final states and values.
pub trait CycleAction: Action {
    type Request;

    fn start_action(&self, request: &Self::Request) -> AcqResult<()>;
    fn action_loop(&self) -> AcqResult<()>;

    /// Runs a whole cycle on the calling thread.
    fn run(&self, request: &Self::Request) -> AcqResult<()> {
        let _running = self.base().try_set_running()?;
        self.start_action(request)?;
        self.action_loop()
    }
}

/// Starts `action` on the calling thread and runs its loop on a dedicated thread named after it.
///
/// The action is reported running until its loop returns. A loop failure is logged, it can not
/// reach the caller any more.
pub fn spawn_action<A>(action: Arc<A>, request: &A::Request) -> AcqResult<JoinHandle<()>>
where
    A: CycleAction + 'static,
{
    let running = action.base().try_set_running()?;
    action.start_action(request)?;
    let name = action.name().to_string();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _running = running;
            if let Err(err) = action.action_loop() {
                error!(action = action.name(), "acquisition loop has failed: {}", err);
            }
        })
        .map_err(|source| AcqError::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CallLog, DummyCounterTimer, SimElement};
    use acqconfig_backend::{Channel, ChannelInfo};

    #[test]
    fn request_master_selection() {
        let config = Arc::new(MeasurementConfig::new());
        let req = AcqRequest::new(config.clone());
        assert!(matches!(
            req.master(),
            Err(AcqError::Config(ConfigError::MissingTimingParameter))
        ));
        let req = AcqRequest::new(config.clone())
            .with_integ_time(0.1)
            .with_monitor_count(100.);
        assert!(matches!(
            req.master(),
            Err(AcqError::Config(ConfigError::ConflictingTimingParameters))
        ));
        let (key, value) = AcqRequest::new(config.clone()).with_integ_time(0.1).master().unwrap();
        assert_eq!((key, value), (MasterKey::Timer, TimingValue::Scalar(0.1)));
        let (key, value) = AcqRequest::new(config).with_monitor_count(100.).master().unwrap();
        assert_eq!((key, value), (MasterKey::Monitor, TimingValue::Scalar(-100.)));
    }

    #[test]
    fn running_guard_resets_flag() {
        let base = ActionBase::new("test");
        {
            let _running = base.try_set_running().unwrap();
            assert!(base.is_running());
            assert!(matches!(base.try_set_running(), Err(AcqError::AlreadyRunning(_))));
        }
        assert!(!base.is_running());
    }

    #[test]
    fn context_is_reentrant() {
        let base = ActionBase::new("test");
        let _outer = base.context();
        let _inner = base.context();
    }

    #[test]
    fn failed_reads_are_kept_per_channel() {
        let log = CallLog::new();
        let ctrl = DummyCounterTimer::shared("ctctrl01", &log);
        ctrl.failures().read_error = true;
        ctrl.failures().state_error = true;
        let mut set = ChannelSet::new();
        set.push(
            ctrl.clone(),
            vec![
                Channel::new(SimElement::shared("ct01", "ctctrl01", 1), ChannelInfo::indexed(0)),
                Channel::new(SimElement::shared("ct02", "ctctrl01", 2), ChannelInfo::indexed(1)),
            ],
        );
        let base = ActionBase::new("test");
        let states = base.read_state_info(&set);
        assert_eq!(states["ct02"].state, State::Fault);
        assert!(!in_acquisition(&states));
        let values = base.read_value(&set);
        assert_eq!(values.len(), 2);
        assert!(values.values().all(|value| value.is_err()));
    }
}
