use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acqconfig_backend::*;
use acqctrl_backend::sim::{CallLog, DummyCounterTimer, DummyTriggerGate, DummyZeroD, SimElement};
use acqctrl_backend::{AcqResult, AcqSettings, AcquisitionCoordinator};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> AcqResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = AcqSettings::load(std::env::args().nth(1).map(PathBuf::from).as_deref())?;
    let log = CallLog::new();

    // one hardware-triggered counter card, one software-triggered card, one integrator
    let hw_tg_ctrl = DummyTriggerGate::hardware("tgctrl01", &log);
    let sw_tg_ctrl = DummyTriggerGate::software("swtgctrl01", &log);
    let hw_ctrl = DummyCounterTimer::shared("ctctrl01", &log);
    let sw_ctrl = DummyCounterTimer::shared("ctctrl02", &log);
    let zerod_ctrl = DummyZeroD::shared("zerodctrl01", &log);

    let hw_counters: Vec<Arc<SimElement>> = (1..=2)
        .map(|axis| SimElement::shared(&format!("ct0{}", axis), "ctctrl01", axis))
        .collect();
    let sw_counter = SimElement::shared("ct11", "ctctrl02", 1);
    let zerod = SimElement::zerod("zerod01", "zerodctrl01", 1, &log);

    let config = MeasurementConfig::new()
        .with_controller(
            ControllerConfig::new(hw_ctrl)
                .with_channel(hw_counters[0].clone(), ChannelInfo::indexed(0))
                .with_channel(hw_counters[1].clone(), ChannelInfo::indexed(1))
                .with_timer("ct01")
                .with_monitor("ct02")
                .with_trigger_element(TriggerGate::new("tg01", "lab/tg01", 1, hw_tg_ctrl)),
        )
        .with_controller(
            ControllerConfig::new(sw_ctrl)
                .with_channel(sw_counter.clone(), ChannelInfo::indexed(2))
                .with_timer("ct11")
                .with_monitor("ct11")
                .with_trigger_element(TriggerGate::new("swtg01", "lab/swtg01", 1, sw_tg_ctrl)),
        )
        .with_controller(
            ControllerConfig::new(zerod_ctrl).with_channel(zerod.clone(), ChannelInfo::indexed(3)),
        )
        .with_timer("ct01")
        .with_monitor("ct02");

    let synchronization = vec![SynchGroup::new(0.05, 5).with_total(0.1).with_delay(0.02)];

    let coordinator = AcquisitionCoordinator::new("acquisition", &settings)?;
    coordinator.run(&config, &synchronization, None, Some(5))?;
    coordinator.wait();
    while coordinator.is_running() || coordinator.is_software_busy() || coordinator.is_zerod_busy() {
        thread::sleep(Duration::from_millis(10));
    }

    info!(controllers = ?coordinator.controllers(), "acquisition done");
    for element in hw_counters.iter().chain([&sw_counter, &zerod]) {
        if let Some(value) = element.final_value() {
            info!(element = element.name(), value = ?value.value.as_slice(), idx = ?value.idx, "final value");
        }
    }
    Ok(())
}
