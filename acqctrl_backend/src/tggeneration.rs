//! Trigger/gate generation.
//!
//! The generator implements a synchronization description in two ways at once:
//!
//! - hardware trigger/gate controllers of the [`TgConfig`] are loaded with the window periods
//!   and started through the controller protocol, then polled until they are done;
//! - in software, when requested, an `Active` event is emitted at the start of every window and
//!   a `Passive` event at the end of its active period. Event ids count windows from 0 across
//!   all groups.
//!
//! Events go to the registered [`TriggerListener`]s, held weakly: a listener that has been
//! dropped is forgotten. A stop request interrupts both the software sequence and the
//! hardware polling.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use acqconfig_backend::{
    synchronization_span, Axis, ConfigError, Controller, State, SynchGroup, TgConfig, TimingValue,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::action::{Action, ActionBase, CycleAction};
use crate::error::{AcqError, AcqResult, InCtrl};
use crate::sequencer::with_repetitions;
use crate::settings::AcqSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerEventType {
    Active,
    Passive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerEvent {
    pub event_type: TriggerEventType,
    pub id: u64,
}
impl TriggerEvent {
    pub fn active(id: u64) -> Self {
        Self {
            event_type: TriggerEventType::Active,
            id,
        }
    }

    pub fn passive(id: u64) -> Self {
        Self {
            event_type: TriggerEventType::Passive,
            id,
        }
    }
}

/// Receiver of trigger events. Called on the generator thread; implementations must return
/// quickly.
pub trait TriggerListener: Send + Sync {
    fn event_received(&self, source: &str, event: TriggerEvent);
}

#[derive(Clone, Debug)]
pub struct TgRequest {
    pub config: TgConfig,
    pub synchronization: Vec<SynchGroup>,
    /// Emit software events to the listeners.
    pub software_events: bool,
}

/// Checks that the whole sequence of windows can be scheduled from now.
///
/// # Errors
/// [`ConfigError::EmptySynchronization`] and [`ConfigError::InvalidDuration`].
pub fn check_timeline(synchronization: &[SynchGroup]) -> AcqResult<Duration> {
    if synchronization.is_empty() {
        return Err(ConfigError::EmptySynchronization.into());
    }
    let span = synchronization_span(synchronization)?;
    Instant::now()
        .checked_add(span)
        .ok_or(ConfigError::InvalidDuration {
            what: "synchronization",
            value: span.as_secs_f64(),
        })?;
    Ok(span)
}

/// Period of every window, and the number of windows.
fn window_periods(synchronization: &[SynchGroup]) -> (TimingValue, u64) {
    let windows: u64 = synchronization.iter().map(|group| group.repeats).sum();
    match synchronization {
        [group] => (TimingValue::Scalar(group.period()), windows),
        groups => (
            TimingValue::Sequence(
                groups
                    .iter()
                    .flat_map(|group| std::iter::repeat(group.period()).take(group.repeats as usize))
                    .collect(),
            ),
            windows,
        ),
    }
}

struct HwTrigger {
    ctrl: Arc<dyn Controller>,
    axes: Vec<Axis>,
}

struct TgCycle {
    synchronization: Vec<SynchGroup>,
    software_events: bool,
    stop_rx: Receiver<()>,
}

pub struct TriggerGeneration {
    base: ActionBase,
    sleep_time: Duration,
    listeners: Mutex<Vec<Weak<dyn TriggerListener>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    hardware: Mutex<Arc<Vec<HwTrigger>>>,
    cycle: Mutex<Option<TgCycle>>,
}
impl TriggerGeneration {
    pub fn new(name: &str, settings: &AcqSettings) -> Self {
        Self {
            base: ActionBase::new(name),
            sleep_time: settings.sleep_time(),
            listeners: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
            hardware: Mutex::new(Arc::new(Vec::new())),
            cycle: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Weak<dyn TriggerListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| l.ptr_eq(&listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Weak<dyn TriggerListener>) {
        self.listeners.lock().retain(|l| !l.ptr_eq(listener));
    }

    /// Controllers of the hardware trigger/gate elements of the current cycle.
    pub fn controllers(&self) -> Vec<String> {
        self.hardware
            .lock()
            .iter()
            .map(|hw| hw.ctrl.name().to_string())
            .collect()
    }

    fn emit(&self, event: TriggerEvent) {
        let listeners: Vec<Arc<dyn TriggerListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        debug!(action = self.base.name(), ?event, "trigger event");
        for listener in listeners {
            listener.event_received(self.base.name(), event);
        }
    }

    fn interrupted(&self) -> bool {
        self.base.is_stopped() || self.base.is_aborted()
    }

    /// Waits until `offset` seconds after `origin`; `false` if stopped meanwhile.
    ///
    /// An unrepresentable deadline waits for the stop request.
    fn wait_until(&self, origin: Instant, offset: f64, stop_rx: &Receiver<()>) -> bool {
        let deadline = Duration::try_from_secs_f64(offset.max(0.))
            .ok()
            .and_then(|offset| origin.checked_add(offset));
        let received = match deadline {
            Some(deadline) => stop_rx.recv_deadline(deadline),
            None => stop_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Err(RecvTimeoutError::Timeout) => !self.interrupted(),
            _ => false,
        }
    }

    /// Emits the events of every window, `false` if interrupted.
    fn generate(&self, synchronization: &[SynchGroup], stop_rx: &Receiver<()>) -> bool {
        let origin = Instant::now();
        let mut offset = 0.;
        let mut id = 0;
        for group in synchronization {
            offset += group.delay.time;
            for _ in 0..group.repeats {
                if !self.wait_until(origin, offset, stop_rx) {
                    return false;
                }
                self.emit(TriggerEvent::active(id));
                if !self.wait_until(origin, offset + group.active.time, stop_rx) {
                    return false;
                }
                self.emit(TriggerEvent::passive(id));
                offset += group.period();
                id += 1;
            }
        }
        true
    }

    fn hardware_generating(&self, hardware: &[HwTrigger]) -> bool {
        let _ctx = self.base.context();
        hardware.iter().any(|hw| {
            hw.axes.iter().any(|axis| match hw.ctrl.state_one(*axis) {
                Ok(info) => info.state == State::Moving,
                Err(err) => {
                    error!(action = self.base.name(), ctrl = hw.ctrl.name(), "state read failed: {}", err);
                    false
                }
            })
        })
    }

    fn load_and_start(&self, hardware: &[HwTrigger], synchronization: &[SynchGroup]) -> AcqResult<()> {
        let action = self.base.name();
        let (periods, windows) = window_periods(synchronization);
        let _ctx = self.base.context();
        for hw in hardware {
            let name = hw.ctrl.name();
            hw.ctrl.pre_load_all().in_ctrl(name)?;
            for axis in hw.axes.iter().copied() {
                let ready = with_repetitions(action, name, "PreLoadOne", Some(windows), |reps| {
                    hw.ctrl.pre_load_one(axis, &periods, reps)
                })?;
                if !ready {
                    return Err(AcqError::ControllerProtocol {
                        ctrl: name.to_string(),
                        call: "PreLoadOne",
                        axis,
                    });
                }
                with_repetitions(action, name, "LoadOne", Some(windows), |reps| {
                    hw.ctrl.load_one(axis, &periods, reps)
                })?;
            }
            hw.ctrl.load_all().in_ctrl(name)?;
        }
        for hw in hardware {
            hw.ctrl.pre_start_all().in_ctrl(hw.ctrl.name())?;
        }
        for hw in hardware {
            let name = hw.ctrl.name();
            for axis in hw.axes.iter().copied() {
                if !hw.ctrl.pre_start_one(axis, &periods).in_ctrl(name)? {
                    return Err(AcqError::ControllerProtocol {
                        ctrl: name.to_string(),
                        call: "PreStartOne",
                        axis,
                    });
                }
                hw.ctrl.start_one(axis, &periods).in_ctrl(name)?;
            }
        }
        for hw in hardware {
            hw.ctrl.start_all().in_ctrl(hw.ctrl.name())?;
        }
        Ok(())
    }

    fn end_hardware(&self, abort: bool) -> AcqResult<()> {
        let hardware = self.hardware.lock().clone();
        let _ctx = self.base.context();
        let mut result = Ok(());
        for hw in hardware.iter() {
            for axis in hw.axes.iter().copied() {
                let res = if abort {
                    hw.ctrl.abort_one(axis)
                } else {
                    hw.ctrl.stop_one(axis)
                };
                if let Err(err) = res.in_ctrl(hw.ctrl.name()) {
                    error!(action = self.base.name(), axis, "{}", err);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    fn wake(&self) {
        if let Some(tx) = self.stop_tx.lock().as_ref() {
            // a full channel already holds a wake-up
            let _ = tx.try_send(());
        }
    }
}

impl Action for TriggerGeneration {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn stop_action(&self) -> AcqResult<()> {
        self.base.request_stop();
        self.wake();
        self.end_hardware(false)
    }

    fn abort_action(&self) -> AcqResult<()> {
        self.base.request_abort();
        self.wake();
        self.end_hardware(true)
    }
}

impl CycleAction for TriggerGeneration {
    type Request = TgRequest;

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn start_action(&self, request: &TgRequest) -> AcqResult<()> {
        self.base.reset_flags();
        let span = check_timeline(&request.synchronization)?;
        debug!(action = self.base.name(), span = ?span, "generating windows");
        let hardware: Vec<HwTrigger> = request
            .config
            .controllers
            .values()
            .filter(|tg_ctrl| !tg_ctrl.ctrl.is_software())
            .map(|tg_ctrl| HwTrigger {
                ctrl: tg_ctrl.ctrl.clone(),
                axes: tg_ctrl.channels.values().map(|info| info.axis).collect(),
            })
            .collect();
        let hardware = Arc::new(hardware);
        *self.hardware.lock() = hardware.clone();

        let (stop_tx, stop_rx) = channel::bounded(1);
        *self.stop_tx.lock() = Some(stop_tx);

        self.load_and_start(&hardware, &request.synchronization)?;
        *self.cycle.lock() = Some(TgCycle {
            synchronization: request.synchronization.clone(),
            software_events: request.software_events,
            stop_rx,
        });
        Ok(())
    }

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn action_loop(&self) -> AcqResult<()> {
        let Some(cycle) = self.cycle.lock().take() else {
            return Ok(());
        };
        let action = self.base.name();
        let completed = !cycle.software_events || self.generate(&cycle.synchronization, &cycle.stop_rx);
        if completed {
            let hardware = self.hardware.lock().clone();
            while self.hardware_generating(&hardware) {
                match cycle.stop_rx.recv_timeout(self.sleep_time) {
                    Err(RecvTimeoutError::Timeout) if !self.interrupted() => {}
                    _ => break,
                }
            }
        }
        info!(action, completed, "trigger generation finished");
        Ok(())
    }
}
