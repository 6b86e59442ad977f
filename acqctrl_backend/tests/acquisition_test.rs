use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use acqconfig_backend::*;
use acqctrl_backend::sim::{CallLog, DummyCounterTimer, DummyTriggerGate, DummyZeroD, SimElement};
use acqctrl_backend::{AcqError, AcqSettings, AcquisitionCoordinator};
use maplit::hashset;

const LAB_CONFIG: &str = r#"{
    "controllers": {
        "ctctrl01": {
            "channels": {"ct01": {"index": 0}, "ct02": {"index": 1}},
            "timer": "ct01",
            "monitor": "ct02",
            "trigger_element": "tg01"
        },
        "ctctrl02": {
            "channels": {"ct11": {"index": 2}},
            "timer": "ct11",
            "monitor": "ct11"
        },
        "zerodctrl01": {
            "channels": {"zerod01": {"index": 3}}
        }
    },
    "timer": "ct01",
    "monitor": "ct02"
}"#;

struct Lab {
    log: CallLog,
    hw_ctrl: Arc<DummyCounterTimer>,
    sw_ctrl: Arc<DummyCounterTimer>,
    elements: Vec<Arc<SimElement>>,
    registry: Registry,
}
impl Lab {
    fn element(&self, name: &str) -> &Arc<SimElement> {
        self.elements
            .iter()
            .find(|element| element.name() == name)
            .unwrap()
    }
}

fn lab() -> Lab {
    let log = CallLog::new();
    let hw_ctrl = DummyCounterTimer::shared("ctctrl01", &log);
    let sw_ctrl = DummyCounterTimer::shared("ctctrl02", &log);
    let elements = vec![
        SimElement::shared("ct01", "ctctrl01", 1),
        SimElement::shared("ct02", "ctctrl01", 2),
        SimElement::shared("ct11", "ctctrl02", 1),
        SimElement::zerod("zerod01", "zerodctrl01", 1, &log),
    ];

    let mut registry = Registry::new();
    registry.add_controller(hw_ctrl.clone());
    registry.add_controller(sw_ctrl.clone());
    registry.add_controller(DummyZeroD::shared("zerodctrl01", &log));
    let tg_ctrl = DummyTriggerGate::hardware("tgctrl01", &log);
    registry.add_trigger_gate(TriggerGate::new("tg01", "lab/tg01", 1, tg_ctrl));
    for element in elements.iter() {
        registry.add_element(element.clone());
    }
    Lab {
        log,
        hw_ctrl,
        sw_ctrl,
        elements,
        registry,
    }
}

fn settings() -> AcqSettings {
    AcqSettings {
        acq_loop_sleep_time: 0.001,
        acq_loop_states_per_value: 2,
        worker_pool_size: 2,
        zerod_loop_sleep_time: Some(0.001),
    }
}

fn wait_idle(coordinator: &AcquisitionCoordinator) {
    coordinator.wait();
    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator.is_running() || coordinator.is_software_busy() || coordinator.is_zerod_busy() {
        assert!(Instant::now() < deadline, "acquisition did not settle");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn acquisition_fans_out_to_every_modality() {
    let lab = lab();
    let config = lab
        .registry
        .bind(&ConfigDescription::from_json(LAB_CONFIG).unwrap())
        .unwrap();
    let coordinator = AcquisitionCoordinator::new("acq", &settings()).unwrap();
    let synchronization = vec![SynchGroup::new(0.01, 3).with_total(0.03)];
    coordinator
        .run(&config, &synchronization, None, Some(3))
        .unwrap();
    wait_idle(&coordinator);

    // hardware: one sample per window
    assert_eq!(lab.hw_ctrl.repetitions(), 3);
    let ct02 = lab.element("ct02").final_value().unwrap();
    assert_eq!(ct02.value.len(), 3);
    assert_eq!(ct02.idx, None);
    assert_eq!(lab.element("ct01").last_state().unwrap().state, State::On);

    // software: single-shot cycles tagged with their trigger index
    let ct11 = lab.element("ct11").values();
    assert!(!ct11.is_empty());
    for (value, propagate) in ct11.iter() {
        assert_eq!(*propagate, Propagate::Priority);
        assert_eq!(value.value.shape(), &[1]);
        assert!(matches!(value.idx.as_deref(), Some([0..=2])));
    }
    assert_eq!(lab.sw_ctrl.loaded_value(), Some(0.01));

    // zerod: stopped at the end of a window, mean of the samples
    let zerod = lab.element("zerod01").final_value().unwrap();
    assert_eq!(zerod.value.as_slice(), Some(&[1.][..]));

    // the hardware trigger/gate generated the three windows
    assert!(lab.log.contains("tgctrl01.StartAll"));
    let controllers: HashSet<String> = coordinator.controllers().into_iter().collect();
    assert_eq!(
        controllers,
        hashset! {
            "ctctrl01".to_string(),
            "ctctrl02".to_string(),
            "zerodctrl01".to_string(),
            "tgctrl01".to_string(),
        }
    );
}

#[test]
fn hardware_master_controller_is_started_last() {
    let log = CallLog::new();
    let mut config = MeasurementConfig::new();
    let tg = TriggerGate::new("tg01", "lab/tg01", 1, DummyTriggerGate::hardware("tgctrl01", &log));
    // the representative master is the least controller name, ctctrl01
    for name in ["ctctrl03", "ctctrl01", "ctctrl02"] {
        let ctrl = DummyCounterTimer::shared(name, &log);
        let timer = format!("{}_1", name);
        config = config.with_controller(
            ControllerConfig::new(ctrl)
                .with_channel(SimElement::shared(&timer, name, 1), ChannelInfo::indexed(0))
                .with_timer(&timer)
                .with_trigger_element(tg.clone()),
        );
    }
    let coordinator = AcquisitionCoordinator::new("acq", &settings()).unwrap();
    coordinator
        .run(&config, &[SynchGroup::new(0.005, 1)], None, None)
        .unwrap();
    wait_idle(&coordinator);

    let start_all: Vec<String> = log
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("ctctrl") && call.ends_with(".StartAll"))
        .collect();
    assert_eq!(
        start_all,
        vec!["ctctrl03.StartAll", "ctctrl02.StartAll", "ctctrl01.StartAll"]
    );
    assert_eq!(
        coordinator.hardware().controllers(),
        vec!["ctctrl03", "ctctrl02", "ctctrl01"]
    );
}

#[test]
fn configuration_errors_surface_before_any_call() {
    let log = CallLog::new();
    let tg = TriggerGate::new("tg01", "lab/tg01", 1, DummyTriggerGate::hardware("tgctrl01", &log));
    let config = MeasurementConfig::new().with_controller(
        ControllerConfig::new(DummyCounterTimer::shared("ctctrl01", &log))
            .with_channel(SimElement::shared("ct01", "ctctrl01", 1), ChannelInfo::indexed(0))
            .with_timer("ct99")
            .with_trigger_element(tg),
    );
    let coordinator = AcquisitionCoordinator::new("acq", &settings()).unwrap();
    let synchronization = [SynchGroup::new(0.005, 1)];

    assert!(matches!(
        coordinator.run(&config, &synchronization, None, None),
        Err(AcqError::Config(ConfigError::MasterNotFound { .. }))
    ));
    assert!(log.calls().is_empty());
    assert!(!coordinator.is_running());
}

#[test]
fn refused_start_surfaces_from_run() {
    let lab = lab();
    let config = lab
        .registry
        .bind(&ConfigDescription::from_json(LAB_CONFIG).unwrap())
        .unwrap();
    lab.hw_ctrl.failures().pre_start_one_false = Some(2);
    let coordinator = AcquisitionCoordinator::new("acq", &settings()).unwrap();
    assert!(matches!(
        coordinator.run(&config, &[SynchGroup::new(0.005, 1)], None, None),
        Err(AcqError::ControllerProtocol { call: "PreStartOne", axis: 2, .. })
    ));
    assert!(!lab.log.contains("ctctrl01.StartOne(2)"));
    // the trigger generation is never started
    assert!(!lab.log.contains("tgctrl01.StartAll"));
    assert!(!coordinator.is_running());
}

#[test]
fn monitor_count_drives_software_cycles() {
    let lab = lab();
    let mut desc = ConfigDescription::from_json(LAB_CONFIG).unwrap();
    desc.controllers.shift_remove("ctctrl01");
    desc.controllers.shift_remove("zerodctrl01");
    let config = lab.registry.bind(&desc).unwrap();

    let coordinator = AcquisitionCoordinator::new("acq", &settings()).unwrap();
    coordinator
        .run(&config, &[SynchGroup::new(0.01, 2).with_total(0.03)], Some(5.), None)
        .unwrap();
    wait_idle(&coordinator);
    assert_eq!(lab.sw_ctrl.loaded_value(), Some(-5.));
    assert!(lab.element("ct11").final_value().is_some());
    // nothing hardware-triggered
    assert!(lab.log.calls_of("ctctrl01", "").is_empty());
}
