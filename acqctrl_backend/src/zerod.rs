//! Continuous sampling of integrating (ZeroD) channels.
//!
//! A ZeroD cycle does not end by itself: it samples its channels until it is stopped or
//! aborted, accumulating every sample in the element buffer. When the loop exits, each element
//! publishes its accumulated value, then its final state.
//!
//! Starting a cycle keeps the stop and abort requests: a stop arriving between
//! [`ZeroDAcquisition::prepare`] and the start ends the cycle after its first sample.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acqconfig_backend::{MeasurementConfig, Propagate, State};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::action::{Action, ActionBase, CycleAction};
use crate::channel_set::ChannelSet;
use crate::error::AcqResult;
use crate::settings::AcqSettings;
use crate::utils::TickTimer;

/// Priority of the accumulated value publication when a cycle ends.
const FLUSH_PRIORITY: u8 = 1;

#[derive(Clone, Debug)]
pub struct ZeroDRequest {
    pub config: Arc<MeasurementConfig>,
    /// Trigger index tagging the samples of this cycle.
    pub index: Option<u64>,
}
impl ZeroDRequest {
    pub fn new(config: Arc<MeasurementConfig>) -> Self {
        Self {
            config,
            index: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }
}

pub struct ZeroDAcquisition {
    base: ActionBase,
    sleep_time: Duration,
    index: Mutex<Option<u64>>,
}
impl ZeroDAcquisition {
    pub fn new(name: &str, settings: &AcqSettings) -> Self {
        Self {
            base: ActionBase::new(name),
            sleep_time: settings.zerod_sleep_time(),
            index: Mutex::new(None),
        }
    }

    /// Clears the stop and abort requests left by the previous cycle. Called before a cycle is
    /// queued.
    pub fn prepare(&self) {
        self.base.reset_flags();
    }

    pub fn controllers(&self) -> Vec<String> {
        self.base
            .channels()
            .controller_names()
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Action for ZeroDAcquisition {
    fn base(&self) -> &ActionBase {
        &self.base
    }
}

impl CycleAction for ZeroDAcquisition {
    type Request = ZeroDRequest;

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn start_action(&self, request: &ZeroDRequest) -> AcqResult<()> {
        let channels = self
            .base
            .set_channels(ChannelSet::from_config(&request.config, |ctrl| ctrl.is_zerod()));
        *self.index.lock() = request.index;

        let _ctx = self.base.context();
        for channel in channels.iter() {
            channel.clear_buffer();
            channel.set_state(State::Moving, Propagate::Priority);
        }
        debug!(action = self.base.name(), channels = channels.len(), "integration started");
        Ok(())
    }

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn action_loop(&self) -> AcqResult<()> {
        let action = self.base.name();
        let channels = self.base.channels();
        let index = *self.index.lock();
        let mut timer = TickTimer::new();

        loop {
            for (name, value) in self.base.read_value(&channels) {
                let Some(channel) = channels.get(&name) else {
                    continue;
                };
                match value {
                    Ok(value) => channel.put_value(value, index, Propagate::None),
                    Err(err) => debug!(action, channel = %name, "sample read failed: {}", err),
                }
            }
            if self.base.is_stopped() || self.base.is_aborted() {
                break;
            }
            thread::sleep(self.sleep_time);
        }
        timer.tick_log(action, "integration");

        for channel in channels.iter() {
            channel.propagate_value(FLUSH_PRIORITY);
        }

        let states = self.base.context().raw_read_state_info(&channels);
        for channel in channels.iter() {
            let Some(info) = states.get(channel.name()) else {
                continue;
            };
            let info = channel.from_ctrl_state_info(info.clone());
            channel.set_state_info(info.clone(), Propagate::None);
            let _operation = channel.operation_lock().lock();
            channel.clear_operation();
            channel.set_state_info(info, Propagate::Priority);
        }
        info!(action, channels = channels.len(), "integration finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use acqconfig_backend::{ChannelInfo, ControllerConfig};

    use crate::action::spawn_action;
    use crate::sim::{CallLog, DummyCounterTimer, DummyZeroD, SimElement};

    fn settings() -> AcqSettings {
        AcqSettings {
            zerod_loop_sleep_time: Some(0.001),
            ..AcqSettings::default()
        }
    }

    #[test]
    fn integrates_until_stopped() {
        let log = CallLog::new();
        let ctrl = DummyZeroD::shared("zerodctrl01", &log);
        let first = SimElement::zerod("zerod01", "zerodctrl01", 1, &log);
        let second = SimElement::zerod("zerod02", "zerodctrl01", 2, &log);
        let counter = DummyCounterTimer::shared("ctctrl01", &log);
        let config = MeasurementConfig::new()
            .with_controller(
                ControllerConfig::new(ctrl)
                    .with_channel(first.clone(), ChannelInfo::indexed(0))
                    .with_channel(second.clone(), ChannelInfo::indexed(1)),
            )
            .with_controller(ControllerConfig::new(counter).with_channel(
                SimElement::logged("ct01", "ctctrl01", 1, &log),
                ChannelInfo::indexed(2),
            ));

        let zerod = Arc::new(ZeroDAcquisition::new("zerod", &settings()));
        zerod.stop_action().unwrap();
        zerod.prepare();
        let request = ZeroDRequest::new(Arc::new(config)).with_index(5);
        let handle = spawn_action(zerod.clone(), &request).unwrap();
        assert_eq!(first.last_state().unwrap().state, State::Moving);
        thread::sleep(Duration::from_millis(20));
        assert!(zerod.is_running());

        zerod.stop_action().unwrap();
        handle.join().unwrap();
        assert!(!zerod.is_running());

        // only integrating controllers take part
        assert_eq!(zerod.controllers(), vec!["zerodctrl01".to_string()]);
        assert!(log.calls_of("ct01", "").is_empty());

        let value = second.final_value().unwrap();
        assert_eq!(value.value.as_slice(), Some(&[2.][..]));
        assert_eq!(value.idx, Some(vec![5]));
        let (info, propagate) = first.states().pop().unwrap();
        assert_eq!((info.state, propagate), (State::On, Propagate::Priority));
        assert_eq!(first.cleared_operations(), 1);

        let calls = log.calls_of("zerod01", "");
        assert_eq!(calls[0], "zerod01.clear_buffer");
        assert_eq!(calls[1], "zerod01.set_state(Moving)");
        let tail: Vec<&str> = calls[calls.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "zerod01.propagate_value(1)",
                "zerod01.set_state_info(On, None)",
                "zerod01.clear_operation",
                "zerod01.set_state_info(On, Priority)",
            ]
        );
    }

    #[test]
    fn failed_reads_skip_samples() {
        let log = CallLog::new();
        let ctrl = DummyZeroD::shared("zerodctrl01", &log);
        ctrl.set_read_error(true);
        let element = SimElement::zerod("zerod01", "zerodctrl01", 1, &log);
        let config = MeasurementConfig::new().with_controller(
            ControllerConfig::new(ctrl).with_channel(element.clone(), ChannelInfo::indexed(0)),
        );
        let zerod = Arc::new(ZeroDAcquisition::new("zerod", &settings()));
        // aborted before the start: a single sample is taken
        zerod.abort_action().unwrap();
        let handle = spawn_action(zerod.clone(), &ZeroDRequest::new(Arc::new(config))).unwrap();
        handle.join().unwrap();
        assert!(element.final_value().is_none());
        assert_eq!(element.last_state().unwrap().state, State::On);
    }
}
