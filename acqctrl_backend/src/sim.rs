//! Simulated controllers and elements.
//!
//! The dummy controllers emulate the timing behavior of real hardware closely enough to drive
//! every acquisition loop: a counter/timer counts while its loaded windows elapse, an
//! integrating (ZeroD) controller returns a sample on every read, and a trigger/gate either
//! declares itself software-implemented or generates hardware windows.
//!
//! Every controller protocol call that changes hardware state (load, start, stop, parameters)
//! is recorded in a shared [`CallLog`] as `"<ctrl>.<Call>(<axis>)"`, and [`SimElement`]s can
//! record their publications in the same log as `"<element>.<method>(..)"`, so that tests can
//! assert on the interleaving of both.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use acqconfig_backend::{
    Acquirable, AcqValue, Axis, Controller, ControllerError, CtrlParValue, CtrlResult,
    ElementType, Propagate, State, StateInfo, TimingValue,
};
use ndarray::Array1;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};

/// Counts per second of the simulated counters, also the monitor rate.
pub const COUNT_RATE: f64 = 1000.;

#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}
impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|c| c == call)
    }

    pub fn first_index(&self, prefix: &str) -> Option<usize> {
        self.calls.lock().iter().position(|c| c.starts_with(prefix))
    }

    pub fn last_index(&self, prefix: &str) -> Option<usize> {
        self.calls.lock().iter().rposition(|c| c.starts_with(prefix))
    }

    /// Calls of `owner` starting with `call`; every call of `owner` for an empty `call`.
    pub fn calls_of(&self, owner: &str, call: &str) -> Vec<String> {
        let prefix = format!("{}.{}", owner, call);
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// Seconds of one window for a loaded value: positive values are times, negative values are
/// monitor counts.
fn window_secs(value: f64) -> f64 {
    if value >= 0. {
        value
    } else {
        -value / COUNT_RATE
    }
}

fn window_plan(value: &TimingValue, repetitions: u64) -> Vec<f64> {
    match value {
        TimingValue::Scalar(value) => vec![window_secs(*value); repetitions.max(1) as usize],
        TimingValue::Sequence(values) => values.iter().copied().map(window_secs).collect(),
    }
}

/// One started sequence of windows.
struct Run {
    started: Instant,
    windows: Vec<f64>,
    axes: HashSet<Axis>,
    stopped_at: Option<Instant>,
}
impl Run {
    fn new(windows: Vec<f64>, axes: HashSet<Axis>) -> Self {
        Self {
            started: Instant::now(),
            windows,
            axes,
            stopped_at: None,
        }
    }

    fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.windows.iter().sum::<f64>()).unwrap_or(Duration::MAX)
    }

    fn elapsed(&self) -> Duration {
        let end = self.stopped_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started).min(self.duration())
    }

    fn is_active(&self, axis: Axis) -> bool {
        self.axes.contains(&axis)
            && self.stopped_at.is_none()
            && self.started.elapsed() < self.duration()
    }

    fn completed_windows(&self) -> usize {
        if self.stopped_at.is_none() && self.started.elapsed() >= self.duration() {
            return self.windows.len();
        }
        let elapsed = self.elapsed().as_secs_f64();
        let mut end = 0.;
        self.windows
            .iter()
            .take_while(|window| {
                end += **window;
                end <= elapsed
            })
            .count()
    }

    fn stop(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
    }
}

/// Failures injected into a [`DummyCounterTimer`].
#[derive(Debug, Default)]
pub struct Failures {
    /// `PreLoadOne` answers `false`.
    pub pre_load_one_false: bool,
    /// `PreStartOne` answers `false` for this axis.
    pub pre_start_one_false: Option<Axis>,
    pub read_error: bool,
    pub state_error: bool,
    /// Repetitions-aware `PreLoadOne`/`LoadOne` are rejected.
    pub reject_repetitions: bool,
    pub stop_error: bool,
}

#[derive(Default)]
struct Counting {
    loaded: Option<TimingValue>,
    repetitions: u64,
    armed: HashSet<Axis>,
    run: Option<Run>,
}

/// A counter/timer card. Loaded with a positive value, it counts for that many seconds (timer
/// mode); with a negative value, until the monitor reached that many counts.
///
/// A scalar is read while a single window is loaded, one sample per completed window
/// otherwise.
pub struct DummyCounterTimer {
    name: String,
    types: [ElementType; 1],
    log: CallLog,
    counting: Mutex<Counting>,
    failures: Mutex<Failures>,
}
impl DummyCounterTimer {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            types: [ElementType::CTExpChannel],
            log: log.clone(),
            counting: Mutex::new(Counting {
                repetitions: 1,
                ..Counting::default()
            }),
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn shared(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self::new(name, log))
    }

    pub fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures.lock()
    }

    /// First window of the last loaded value.
    pub fn loaded_value(&self) -> Option<f64> {
        self.counting.lock().loaded.as_ref().and_then(TimingValue::first)
    }

    pub fn repetitions(&self) -> u64 {
        self.counting.lock().repetitions
    }

    fn record(&self, call: &str, axis: Option<Axis>) {
        match axis {
            Some(axis) => self.log.record(format!("{}.{}({})", self.name, call, axis)),
            None => self.log.record(format!("{}.{}", self.name, call)),
        }
    }

    fn check_repetitions(&self, repetitions: Option<u64>) -> CtrlResult<()> {
        if repetitions.is_some() && self.failures.lock().reject_repetitions {
            return Err(ControllerError::RepetitionsUnsupported);
        }
        Ok(())
    }

    fn end(&self, call: &str, axis: Axis) -> CtrlResult<()> {
        self.record(call, Some(axis));
        if self.failures.lock().stop_error {
            return Err(ControllerError::Hardware(format!("{} refused", call)));
        }
        if let Some(run) = self.counting.lock().run.as_mut() {
            run.stop();
        }
        Ok(())
    }
}

impl Controller for DummyCounterTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn ctrl_types(&self) -> &[ElementType] {
        &self.types
    }

    fn pre_load_all(&self) -> CtrlResult<()> {
        self.record("PreLoadAll", None);
        Ok(())
    }

    fn pre_load_one(
        &self,
        axis: Axis,
        _value: &TimingValue,
        repetitions: Option<u64>,
    ) -> CtrlResult<bool> {
        self.record("PreLoadOne", Some(axis));
        self.check_repetitions(repetitions)?;
        Ok(!self.failures.lock().pre_load_one_false)
    }

    fn load_one(&self, axis: Axis, value: &TimingValue, repetitions: Option<u64>) -> CtrlResult<()> {
        self.record("LoadOne", Some(axis));
        self.check_repetitions(repetitions)?;
        let mut counting = self.counting.lock();
        counting.loaded = Some(value.clone());
        if let Some(repetitions) = repetitions {
            counting.repetitions = repetitions;
        }
        Ok(())
    }

    fn load_all(&self) -> CtrlResult<()> {
        self.record("LoadAll", None);
        Ok(())
    }

    fn pre_start_all(&self) -> CtrlResult<()> {
        self.record("PreStartAll", None);
        self.counting.lock().armed.clear();
        Ok(())
    }

    fn pre_start_one(&self, axis: Axis, _value: &TimingValue) -> CtrlResult<bool> {
        self.record("PreStartOne", Some(axis));
        Ok(self.failures.lock().pre_start_one_false != Some(axis))
    }

    fn start_one(&self, axis: Axis, _value: &TimingValue) -> CtrlResult<()> {
        self.record("StartOne", Some(axis));
        self.counting.lock().armed.insert(axis);
        Ok(())
    }

    fn start_all(&self) -> CtrlResult<()> {
        self.record("StartAll", None);
        let mut counting = self.counting.lock();
        let loaded = counting
            .loaded
            .clone()
            .ok_or_else(|| ControllerError::Hardware("nothing loaded".to_string()))?;
        let axes = std::mem::take(&mut counting.armed);
        let windows = window_plan(&loaded, counting.repetitions);
        counting.run = Some(Run::new(windows, axes));
        Ok(())
    }

    fn state_one(&self, axis: Axis) -> CtrlResult<StateInfo> {
        if self.failures.lock().state_error {
            return Err(ControllerError::Hardware("state not available".to_string()));
        }
        let counting = self.counting.lock();
        Ok(match &counting.run {
            Some(run) if run.is_active(axis) => StateInfo::new(State::Moving, "counting"),
            _ => StateInfo::new(State::On, "ready"),
        })
    }

    fn read_one(&self, axis: Axis) -> CtrlResult<AcqValue> {
        if self.failures.lock().read_error {
            return Err(ControllerError::Hardware("value not available".to_string()));
        }
        let counting = self.counting.lock();
        let rate = COUNT_RATE * axis as f64;
        let Some(run) = &counting.run else {
            return Ok(AcqValue::scalar(0.));
        };
        if run.windows.len() > 1 {
            let samples = run.windows[..run.completed_windows()]
                .iter()
                .map(|window| window * rate)
                .collect();
            Ok(AcqValue::from_vec(samples))
        } else {
            Ok(AcqValue::scalar(run.elapsed().as_secs_f64() * rate))
        }
    }

    fn stop_one(&self, axis: Axis) -> CtrlResult<()> {
        self.end("StopOne", axis)
    }

    fn abort_one(&self, axis: Axis) -> CtrlResult<()> {
        self.end("AbortOne", axis)
    }

    fn set_ctrl_par(&self, name: &str, value: CtrlParValue) -> CtrlResult<()> {
        self.log
            .record(format!("{}.SetCtrlPar({})", self.name, name));
        match (name, value) {
            ("repetitions", CtrlParValue::Int(repetitions)) if repetitions > 0 => {
                self.counting.lock().repetitions = repetitions as u64;
                Ok(())
            }
            _ => Err(ControllerError::UnsupportedParameter(name.to_string())),
        }
    }
}

/// An integrating controller: every read of axis `n` returns `n`.
pub struct DummyZeroD {
    name: String,
    types: [ElementType; 1],
    log: CallLog,
    read_error: Mutex<bool>,
}
impl DummyZeroD {
    pub fn shared(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            types: [ElementType::ZeroDExpChannel],
            log: log.clone(),
            read_error: Mutex::new(false),
        })
    }

    pub fn set_read_error(&self, read_error: bool) {
        *self.read_error.lock() = read_error;
    }
}

impl Controller for DummyZeroD {
    fn name(&self) -> &str {
        &self.name
    }

    fn ctrl_types(&self) -> &[ElementType] {
        &self.types
    }

    fn state_one(&self, _axis: Axis) -> CtrlResult<StateInfo> {
        Ok(StateInfo::new(State::On, "ready"))
    }

    fn read_one(&self, axis: Axis) -> CtrlResult<AcqValue> {
        if *self.read_error.lock() {
            return Err(ControllerError::Hardware("value not available".to_string()));
        }
        Ok(AcqValue::scalar(axis as f64))
    }

    fn stop_one(&self, axis: Axis) -> CtrlResult<()> {
        self.log.record(format!("{}.StopOne({})", self.name, axis));
        Ok(())
    }

    fn abort_one(&self, axis: Axis) -> CtrlResult<()> {
        self.log.record(format!("{}.AbortOne({})", self.name, axis));
        Ok(())
    }
}

/// A trigger/gate controller. The software flavor only marks its elements as software
/// triggers; the hardware flavor generates the loaded windows once started.
pub struct DummyTriggerGate {
    name: String,
    types: [ElementType; 1],
    software: bool,
    log: CallLog,
    generation: Mutex<Counting>,
}
impl DummyTriggerGate {
    fn new(name: &str, log: &CallLog, software: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            types: [ElementType::TriggerGate],
            software,
            log: log.clone(),
            generation: Mutex::new(Counting {
                repetitions: 1,
                ..Counting::default()
            }),
        })
    }

    pub fn software(name: &str, log: &CallLog) -> Arc<Self> {
        Self::new(name, log, true)
    }

    pub fn hardware(name: &str, log: &CallLog) -> Arc<Self> {
        Self::new(name, log, false)
    }

    fn record(&self, call: &str, axis: Option<Axis>) {
        match axis {
            Some(axis) => self.log.record(format!("{}.{}({})", self.name, call, axis)),
            None => self.log.record(format!("{}.{}", self.name, call)),
        }
    }
}

impl Controller for DummyTriggerGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn ctrl_types(&self) -> &[ElementType] {
        &self.types
    }

    fn is_software(&self) -> bool {
        self.software
    }

    fn load_one(&self, axis: Axis, value: &TimingValue, repetitions: Option<u64>) -> CtrlResult<()> {
        self.record("LoadOne", Some(axis));
        let mut generation = self.generation.lock();
        generation.loaded = Some(value.clone());
        generation.repetitions = repetitions.unwrap_or(1);
        Ok(())
    }

    fn start_one(&self, axis: Axis, _value: &TimingValue) -> CtrlResult<()> {
        self.record("StartOne", Some(axis));
        self.generation.lock().armed.insert(axis);
        Ok(())
    }

    fn start_all(&self) -> CtrlResult<()> {
        self.record("StartAll", None);
        let mut generation = self.generation.lock();
        let windows = generation
            .loaded
            .as_ref()
            .map(|loaded| window_plan(loaded, generation.repetitions))
            .unwrap_or_default();
        let axes = std::mem::take(&mut generation.armed);
        generation.run = Some(Run::new(windows, axes));
        Ok(())
    }

    fn state_one(&self, axis: Axis) -> CtrlResult<StateInfo> {
        let generation = self.generation.lock();
        Ok(match &generation.run {
            Some(run) if run.is_active(axis) => StateInfo::new(State::Moving, "generating"),
            _ => StateInfo::new(State::On, "ready"),
        })
    }

    fn read_one(&self, _axis: Axis) -> CtrlResult<AcqValue> {
        Ok(AcqValue::scalar(0.))
    }

    fn stop_one(&self, axis: Axis) -> CtrlResult<()> {
        self.record("StopOne", Some(axis));
        if let Some(run) = self.generation.lock().run.as_mut() {
            run.stop();
        }
        Ok(())
    }

    fn abort_one(&self, axis: Axis) -> CtrlResult<()> {
        self.record("AbortOne", Some(axis));
        if let Some(run) = self.generation.lock().run.as_mut() {
            run.stop();
        }
        Ok(())
    }
}

#[derive(Default)]
struct Record {
    states: Vec<(StateInfo, Propagate)>,
    values: Vec<(AcqValue, Propagate)>,
    buffer: Vec<f64>,
    buffer_index: Option<u64>,
    cleared_operations: usize,
}

/// An element recording everything it is asked to publish.
///
/// Integrating elements buffer the values put without propagation and publish their mean on
/// `propagate_value`.
pub struct SimElement {
    name: String,
    ctrl_name: String,
    axis: Axis,
    integrating: bool,
    log: Option<CallLog>,
    operation: ReentrantMutex<()>,
    record: Mutex<Record>,
}
impl SimElement {
    fn build(name: &str, ctrl_name: &str, axis: Axis, integrating: bool, log: Option<&CallLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ctrl_name: ctrl_name.to_string(),
            axis,
            integrating,
            log: log.cloned(),
            operation: ReentrantMutex::new(()),
            record: Mutex::new(Record::default()),
        })
    }

    pub fn shared(name: &str, ctrl_name: &str, axis: Axis) -> Arc<Self> {
        Self::build(name, ctrl_name, axis, false, None)
    }

    /// An element recording its publications in `log`.
    pub fn logged(name: &str, ctrl_name: &str, axis: Axis, log: &CallLog) -> Arc<Self> {
        Self::build(name, ctrl_name, axis, false, Some(log))
    }

    pub fn zerod(name: &str, ctrl_name: &str, axis: Axis, log: &CallLog) -> Arc<Self> {
        Self::build(name, ctrl_name, axis, true, Some(log))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> Vec<(StateInfo, Propagate)> {
        self.record.lock().states.clone()
    }

    pub fn last_state(&self) -> Option<StateInfo> {
        self.record.lock().states.last().map(|(info, _)| info.clone())
    }

    pub fn values(&self) -> Vec<(AcqValue, Propagate)> {
        self.record.lock().values.clone()
    }

    pub fn final_value(&self) -> Option<AcqValue> {
        self.record.lock().values.last().map(|(value, _)| value.clone())
    }

    pub fn cleared_operations(&self) -> usize {
        self.record.lock().cleared_operations
    }

    /// Number of samples accumulated since the buffer was last cleared.
    pub fn buffered(&self) -> usize {
        self.record.lock().buffer.len()
    }

    fn trace(&self, call: String) {
        if let Some(log) = &self.log {
            log.record(format!("{}.{}", self.name, call));
        }
    }
}

impl Acquirable for SimElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn axis(&self) -> Axis {
        self.axis
    }

    fn ctrl_name(&self) -> &str {
        &self.ctrl_name
    }

    fn operation_lock(&self) -> &ReentrantMutex<()> {
        &self.operation
    }

    fn put_value(&self, mut value: AcqValue, index: Option<u64>, propagate: Propagate) {
        self.trace(format!("put_value({:?})", propagate));
        let mut record = self.record.lock();
        if self.integrating && propagate == Propagate::None {
            record.buffer.extend(value.value.iter().copied());
            record.buffer_index = index.or(record.buffer_index);
            return;
        }
        if value.idx.is_none() {
            value.idx = index.map(|index| vec![index]);
        }
        record.values.push((value, propagate));
    }

    fn set_state(&self, state: State, propagate: Propagate) {
        self.trace(format!("set_state({})", state));
        self.record.lock().states.push((state.into(), propagate));
    }

    fn set_state_info(&self, info: StateInfo, propagate: Propagate) {
        self.trace(format!("set_state_info({}, {:?})", info.state, propagate));
        self.record.lock().states.push((info, propagate));
    }

    fn clear_operation(&self) {
        self.trace("clear_operation".to_string());
        self.record.lock().cleared_operations += 1;
    }

    fn propagate_value(&self, priority: u8) {
        self.trace(format!("propagate_value({})", priority));
        let mut record = self.record.lock();
        let Some(mean) = Array1::from(record.buffer.clone()).mean() else {
            return;
        };
        let mut value = AcqValue::scalar(mean);
        value.idx = record.buffer_index.map(|index| vec![index]);
        let propagate = match priority {
            0 => Propagate::None,
            1 => Propagate::Changed,
            _ => Propagate::Priority,
        };
        record.values.push((value, propagate));
    }

    fn clear_buffer(&self) {
        self.trace("clear_buffer".to_string());
        let mut record = self.record.lock();
        record.buffer.clear();
        record.buffer_index = None;
    }
}
