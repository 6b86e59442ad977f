//! Master-last load and start sequencing of timerable controllers.
//!
//! The controller owning the master channel (the timer, or the monitor for monitor-driven
//! cycles) is armed last so that it can not finish before its peers started counting. Within
//! every controller, the controller's own master channel is started after its siblings.
//!
//! For a master value `v` and controllers `a`, `b` and master controller `m`, the calls are:
//! ```text
//! a.PreLoadAll a.PreLoadOne(v) a.LoadOne(v) a.LoadAll   b...   m...
//! a.PreStartAll b.PreStartAll m.PreStartAll
//! a.PreStartOne/StartOne(channels, master last)   b...   m...
//! all channels Moving
//! a.StartAll b.StartAll m.StartAll
//! ```
//! Every call happens inside the hardware-access context of the action, which is released on
//! every exit path. A `false` answer from `PreLoadOne` or `PreStartOne` aborts the sequence
//! with [`AcqError::ControllerProtocol`]; controllers already started are left as they are.

use acqconfig_backend::{
    Axis, Channel, ConfigError, ControllerConfig, ControllerError, CtrlParValue, CtrlResult,
    MasterKey, MeasurementConfig, Propagate, State, TimingValue,
};
use tracing::{debug, warn};

use crate::action::{AcqRequest, ActionBase};
use crate::channel_set::ChannelSet;
use crate::error::{AcqError, AcqResult, InCtrl};
use crate::utils::TickTimer;

/// Variant-specific steps of the sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sequencing {
    /// Push the `repetitions` controller parameter to every controller before loading.
    pub push_repetitions: bool,
}

/// One controller of the plan, with the axis of its own master channel.
struct Step<'a> {
    cfg: &'a ControllerConfig,
    master_axis: Axis,
    channels: Vec<Channel>,
}

/// Resolves the controllers in sequencing order. No controller is called here.
fn plan<'a>(config: &'a MeasurementConfig, key: MasterKey) -> AcqResult<Vec<Step<'a>>> {
    let master = config.master(key).ok_or(ConfigError::NoMaster(key))?;
    let (master_ctrl, _) = config
        .find_channel(master)
        .ok_or_else(|| ConfigError::MasterNotFound {
            key,
            channel: master.to_string(),
        })?;
    let master_ctrl_name = master_ctrl.name();

    let ordered = config
        .controllers
        .values()
        .filter(|cfg| cfg.ctrl.is_timerable() && cfg.name() != master_ctrl_name)
        .chain(std::iter::once(master_ctrl));

    let mut steps = Vec::new();
    for cfg in ordered {
        let own_master = cfg.master(key).ok_or_else(|| ConfigError::ControllerWithoutMaster {
            ctrl: cfg.name().to_string(),
            key,
        })?;
        let master_entry = cfg.channels.get(own_master).ok_or_else(|| {
            ConfigError::MasterNotFound {
                key,
                channel: own_master.to_string(),
            }
        })?;
        let mut channels: Vec<Channel> = cfg
            .channels
            .iter()
            .filter(|(name, _)| name.as_str() != own_master)
            .map(|(_, entry)| Channel::new(entry.element.clone(), entry.info.clone()))
            .collect();
        channels.push(Channel::new(
            master_entry.element.clone(),
            master_entry.info.clone(),
        ));
        steps.push(Step {
            cfg,
            master_axis: master_entry.element.axis(),
            channels,
        });
    }
    Ok(steps)
}

/// Calls `call` with the repetitions, falling back to the plain form for controllers which
/// do not support it.
pub(crate) fn with_repetitions<T>(
    action: &str,
    ctrl: &str,
    name: &str,
    repetitions: Option<u64>,
    call: impl Fn(Option<u64>) -> CtrlResult<T>,
) -> AcqResult<T> {
    match call(repetitions) {
        Err(ControllerError::RepetitionsUnsupported) if repetitions.is_some() => {
            warn!(action, ctrl, "{} API has changed, calling it without repetitions", name);
            call(None).in_ctrl(ctrl)
        }
        res => res.in_ctrl(ctrl),
    }
}

/// Loads and starts every timerable controller of `request.config`.
///
/// Returns the channel set of the cycle, ordered as the controllers were driven.
///
/// # Errors
/// - [`AcqError::Config`] for an invalid request or configuration, before any controller call,
/// - [`AcqError::ControllerProtocol`] if a controller refuses `PreLoadOne` or `PreStartOne`,
/// - [`AcqError::Controller`] if a controller call fails.
pub fn load_and_start(
    base: &ActionBase,
    request: &AcqRequest,
    sequencing: Sequencing,
) -> AcqResult<ChannelSet> {
    let action = base.name();
    let (key, value) = request.master()?;
    let steps = plan(&request.config, key)?;
    let mut timer = TickTimer::new();

    let _ctx = base.context();

    if sequencing.push_repetitions {
        let repetitions = request.repetitions.unwrap_or(1) as i64;
        for step in steps.iter() {
            step.cfg
                .ctrl
                .set_ctrl_par("repetitions", CtrlParValue::Int(repetitions))
                .in_ctrl(step.cfg.name())?;
        }
    }

    // PreLoadAll, PreLoadOne, LoadOne and LoadAll
    for step in steps.iter() {
        let ctrl = &step.cfg.ctrl;
        let name = step.cfg.name();
        ctrl.pre_load_all().in_ctrl(name)?;
        let ready = with_repetitions(action, name, "PreLoadOne", request.repetitions, |reps| {
            ctrl.pre_load_one(step.master_axis, &value, reps)
        })?;
        if !ready {
            return Err(AcqError::ControllerProtocol {
                ctrl: name.to_string(),
                call: "PreLoadOne",
                axis: step.master_axis,
            });
        }
        with_repetitions(action, name, "LoadOne", request.repetitions, |reps| {
            ctrl.load_one(step.master_axis, &value, reps)
        })?;
        ctrl.load_all().in_ctrl(name)?;
    }
    timer.tick_log(action, "load");

    for step in steps.iter() {
        step.cfg.ctrl.pre_start_all().in_ctrl(step.cfg.name())?;
    }

    // PreStartOne and StartOne, the master channel of each controller last
    for step in steps.iter() {
        start_channels(step, &value)?;
    }

    for step in steps.iter() {
        for channel in step.channels.iter() {
            channel.set_state(State::Moving, Propagate::Priority);
        }
    }

    for step in steps.iter() {
        step.cfg.ctrl.start_all().in_ctrl(step.cfg.name())?;
    }
    timer.tick_log(action, "start");
    debug!(action, master = %key, value = %value, "started {} controllers", steps.len());

    let mut set = ChannelSet::new();
    for step in steps {
        set.push(step.cfg.ctrl.clone(), step.channels);
    }
    Ok(set)
}

fn start_channels(step: &Step, value: &TimingValue) -> AcqResult<()> {
    let ctrl = &step.cfg.ctrl;
    let name = step.cfg.name();
    for channel in step.channels.iter().filter(|channel| channel.enabled()) {
        let axis = channel.axis();
        if !ctrl.pre_start_one(axis, value).in_ctrl(name)? {
            return Err(AcqError::ControllerProtocol {
                ctrl: name.to_string(),
                call: "PreStartOne",
                axis,
            });
        }
        ctrl.start_one(axis, value).in_ctrl(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use acqconfig_backend::{ChannelInfo, StateInfo};

    use crate::sim::{CallLog, DummyCounterTimer, SimElement};

    struct Fixture {
        ctrl: Arc<DummyCounterTimer>,
        cfg: ControllerConfig,
        elements: Vec<Arc<SimElement>>,
    }

    /// Three channels; the timer is the second one, the monitor the third one.
    fn ct_ctrl(name: &str, log: &CallLog, disabled: &[&str]) -> Fixture {
        let ctrl = DummyCounterTimer::shared(name, log);
        let mut cfg = ControllerConfig::new(ctrl.clone());
        let mut elements = Vec::new();
        for axis in 1..=3 {
            let element_name = format!("{}_{}", name, axis);
            let info = if disabled.contains(&element_name.as_str()) {
                ChannelInfo::disabled(axis)
            } else {
                ChannelInfo::indexed(axis)
            };
            let element = SimElement::logged(&element_name, name, axis, log);
            cfg = cfg.with_channel(element.clone(), info);
            elements.push(element);
        }
        Fixture {
            ctrl,
            cfg: cfg
                .with_timer(&format!("{}_2", name))
                .with_monitor(&format!("{}_3", name)),
            elements,
        }
    }

    fn single(fixture: &Fixture) -> MeasurementConfig {
        MeasurementConfig::new()
            .with_controller(fixture.cfg.clone())
            .with_timer(&format!("{}_2", fixture.cfg.name()))
    }

    fn three_ctrls(log: &CallLog, master: &str) -> (MeasurementConfig, Vec<Fixture>) {
        let fixtures: Vec<Fixture> = ["ctctrl01", "ctctrl02", "ctctrl03"]
            .iter()
            .map(|name| ct_ctrl(name, log, &[]))
            .collect();
        let mut config = MeasurementConfig::new();
        for fixture in fixtures.iter() {
            config = config.with_controller(fixture.cfg.clone());
        }
        let config = config
            .with_timer(&format!("{}_2", master))
            .with_monitor(&format!("{}_3", master));
        (config, fixtures)
    }

    fn sequence(request: &AcqRequest) -> AcqResult<ChannelSet> {
        load_and_start(&ActionBase::new("test"), request, Sequencing::default())
    }

    #[test]
    fn master_controller_is_sequenced_last() {
        let log = CallLog::new();
        let (config, _) = three_ctrls(&log, "ctctrl02");
        let request = AcqRequest::new(Arc::new(config)).with_integ_time(0.01);
        let set = sequence(&request).unwrap();
        assert_eq!(set.controller_names(), vec!["ctctrl01", "ctctrl03", "ctctrl02"]);

        for call in ["PreLoadOne", "LoadOne", "PreStartOne", "StartOne", "StartAll"] {
            let master_first = log.first_index(&format!("ctctrl02.{}", call)).unwrap();
            for other in ["ctctrl01", "ctctrl03"] {
                let other_last = log.last_index(&format!("{}.{}", other, call)).unwrap();
                assert!(other_last < master_first, "{}.{} after master", other, call);
            }
        }
    }

    #[test]
    fn master_channel_is_started_last_within_its_controller() {
        let log = CallLog::new();
        let (config, _) = three_ctrls(&log, "ctctrl01");
        let request = AcqRequest::new(Arc::new(config)).with_integ_time(0.01);
        sequence(&request).unwrap();
        assert_eq!(
            log.calls_of("ctctrl01", "StartOne"),
            vec!["ctctrl01.StartOne(1)", "ctctrl01.StartOne(3)", "ctctrl01.StartOne(2)"]
        );
        // loading goes to the timer axis
        assert_eq!(log.calls_of("ctctrl03", "LoadOne"), vec!["ctctrl03.LoadOne(2)"]);
    }

    #[test]
    fn monitor_count_loads_negated_value_on_monitor() {
        let log = CallLog::new();
        let (config, fixtures) = three_ctrls(&log, "ctctrl03");
        let request = AcqRequest::new(Arc::new(config)).with_monitor_count(50.);
        sequence(&request).unwrap();
        assert_eq!(log.calls_of("ctctrl03", "LoadOne"), vec!["ctctrl03.LoadOne(3)"]);
        assert_eq!(fixtures[2].ctrl.loaded_value(), Some(-50.));
        assert_eq!(
            log.calls_of("ctctrl03", "StartOne").last().map(String::as_str),
            Some("ctctrl03.StartOne(3)")
        );
    }

    #[test]
    fn invalid_timing_parameters_issue_no_call() {
        let log = CallLog::new();
        let (config, _) = three_ctrls(&log, "ctctrl01");
        let config = Arc::new(config);
        for request in [
            AcqRequest::new(config.clone()),
            AcqRequest::new(config.clone()).with_integ_time(1.).with_monitor_count(10.),
        ] {
            assert!(matches!(sequence(&request), Err(AcqError::Config(_))));
        }
        assert!(log.calls().is_empty());
    }

    #[test]
    fn unresolvable_master_issues_no_call() {
        let log = CallLog::new();
        let (config, _) = three_ctrls(&log, "ctctrl01");
        let request = AcqRequest::new(Arc::new(config.with_timer("ct99"))).with_integ_time(1.);
        assert!(matches!(
            sequence(&request),
            Err(AcqError::Config(ConfigError::MasterNotFound { .. }))
        ));
        assert!(log.calls().is_empty());
    }

    #[test]
    fn disabled_channels_are_not_started() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &["ctctrl01_1"]);
        let request = AcqRequest::new(Arc::new(single(&fixture))).with_integ_time(0.01);
        let set = sequence(&request).unwrap();
        assert_eq!(
            log.calls_of("ctctrl01", "StartOne"),
            vec!["ctctrl01.StartOne(3)", "ctctrl01.StartOne(2)"]
        );
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn pre_start_refusal_never_starts_the_channel() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &[]);
        fixture.ctrl.failures().pre_start_one_false = Some(3);
        let request = AcqRequest::new(Arc::new(single(&fixture))).with_integ_time(0.01);
        assert!(matches!(
            sequence(&request),
            Err(AcqError::ControllerProtocol { call: "PreStartOne", axis: 3, .. })
        ));
        assert!(log.contains("ctctrl01.PreStartOne(3)"));
        assert!(!log.contains("ctctrl01.StartOne(3)"));
        assert!(!log.contains("ctctrl01.StartAll"));
    }

    #[test]
    fn pre_load_refusal_is_a_protocol_error() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &[]);
        fixture.ctrl.failures().pre_load_one_false = true;
        let request = AcqRequest::new(Arc::new(single(&fixture))).with_integ_time(0.01);
        assert!(matches!(
            sequence(&request),
            Err(AcqError::ControllerProtocol { call: "PreLoadOne", axis: 2, .. })
        ));
        assert!(!log.contains("ctctrl01.LoadOne(2)"));
    }

    #[test]
    fn repetitions_fall_back_to_plain_calls() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &[]);
        fixture.ctrl.failures().reject_repetitions = true;
        let request = AcqRequest::new(Arc::new(single(&fixture)))
            .with_integ_time(0.01)
            .with_repetitions(4);
        sequence(&request).unwrap();
        // one rejected attempt, then the plain form
        assert_eq!(
            log.calls_of("ctctrl01", "LoadOne"),
            vec!["ctctrl01.LoadOne(2)", "ctctrl01.LoadOne(2)"]
        );
        assert_eq!(fixture.ctrl.loaded_value(), Some(0.01));
    }

    #[test]
    fn repetitions_are_pushed_before_loading() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &[]);
        let request = AcqRequest::new(Arc::new(single(&fixture)))
            .with_integ_time(0.01)
            .with_repetitions(5);
        let sequencing = Sequencing {
            push_repetitions: true,
        };
        load_and_start(&ActionBase::new("test"), &request, sequencing).unwrap();
        let set_par = log.first_index("ctctrl01.SetCtrlPar(repetitions)").unwrap();
        assert!(set_par < log.first_index("ctctrl01.PreLoadAll").unwrap());
        assert_eq!(fixture.ctrl.repetitions(), 5);
    }

    #[test]
    fn channels_are_moving_before_start_all() {
        let log = CallLog::new();
        let fixture = ct_ctrl("ctctrl01", &log, &[]);
        let request = AcqRequest::new(Arc::new(single(&fixture))).with_integ_time(0.01);
        sequence(&request).unwrap();
        let start_all = log.first_index("ctctrl01.StartAll").unwrap();
        for element in fixture.elements.iter() {
            assert_eq!(
                element.states()[0],
                (StateInfo::from(State::Moving), Propagate::Priority)
            );
            let moving = log
                .first_index(&format!("{}.set_state(Moving)", element.name()))
                .unwrap();
            assert!(moving < start_all);
        }
    }
}
