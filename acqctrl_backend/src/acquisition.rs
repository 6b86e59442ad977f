//! Timer- and monitor-driven sub-acquisitions.
//!
//! One [`TimerableAcquisition`] type covers every variant; the constructors pick the
//! [`PollPolicy`] and [`Sequencing`] of the variant:
//!
//! | constructor             | first sample | incremental | empty payloads | index tag | repetitions pushed |
//! |-------------------------|--------------|-------------|----------------|-----------|--------------------|
//! | `hardware`              | yes          | yes         | dropped        | no        | no                 |
//! | `software`              | no           | no          | kept           | yes       | no                 |
//! | `continuous_count`      | yes          | yes         | dropped        | no        | no                 |
//! | `continuous_hardware`   | yes          | yes         | dropped        | no        | yes                |
//!
//! Slaves registered with [`TimerableAcquisition::add_slave`] are stopped when the loop ends,
//! before the final read.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument};

use crate::action::{AcqRequest, Action, ActionBase, CycleAction};
use crate::error::AcqResult;
use crate::poll::{PollLoop, PollPolicy};
use crate::sequencer::{load_and_start, Sequencing};
use crate::settings::AcqSettings;

/// Loop parameters of the current cycle.
#[derive(Clone, Copy, Debug)]
struct CycleParams {
    sleep_time: Duration,
    states_per_value: u32,
    index: Option<u64>,
}

pub struct TimerableAcquisition {
    base: ActionBase,
    policy: PollPolicy,
    sequencing: Sequencing,
    sleep_time: Duration,
    states_per_value: u32,
    slaves: RwLock<Vec<Arc<dyn Action>>>,
    cycle: Mutex<Option<CycleParams>>,
}
impl TimerableAcquisition {
    pub fn new(name: &str, settings: &AcqSettings, policy: PollPolicy, sequencing: Sequencing) -> Self {
        Self {
            base: ActionBase::new(name),
            policy,
            sequencing,
            sleep_time: settings.sleep_time(),
            states_per_value: settings.states_per_value(),
            slaves: RwLock::new(Vec::new()),
            cycle: Mutex::new(None),
        }
    }

    pub fn hardware(name: &str, settings: &AcqSettings) -> Self {
        Self::new(name, settings, PollPolicy::HARDWARE, Sequencing::default())
    }

    pub fn software(name: &str, settings: &AcqSettings) -> Self {
        Self::new(name, settings, PollPolicy::SOFTWARE, Sequencing::default())
    }

    pub fn continuous_count(name: &str, settings: &AcqSettings) -> Self {
        Self::new(name, settings, PollPolicy::CONTINUOUS_COUNT, Sequencing::default())
    }

    pub fn continuous_hardware(name: &str, settings: &AcqSettings) -> Self {
        Self::new(
            name,
            settings,
            PollPolicy::CONTINUOUS_COUNT,
            Sequencing {
                push_repetitions: true,
            },
        )
    }

    pub fn add_slave(&self, slave: Arc<dyn Action>) {
        self.slaves.write().push(slave);
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Controllers driven by the current cycle, in sequencing order.
    pub fn controllers(&self) -> Vec<String> {
        self.base
            .channels()
            .controller_names()
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Action for TimerableAcquisition {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    /// Stops every channel of the current cycle with `StopOne`.
    fn stop_action(&self) -> AcqResult<()> {
        self.base.request_stop();
        self.base.stop_channels(false)
    }

    /// Aborts every channel of the current cycle with `AbortOne`.
    fn abort_action(&self) -> AcqResult<()> {
        self.base.request_abort();
        self.base.stop_channels(true)
    }
}

impl CycleAction for TimerableAcquisition {
    type Request = AcqRequest;

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn start_action(&self, request: &AcqRequest) -> AcqResult<()> {
        self.base.reset_flags();
        let channels = load_and_start(&self.base, request, self.sequencing)?;
        self.base.set_channels(channels);
        *self.cycle.lock() = Some(CycleParams {
            sleep_time: request.sleep_time.unwrap_or(self.sleep_time),
            states_per_value: request.states_per_value.unwrap_or(self.states_per_value),
            index: request.index,
        });
        Ok(())
    }

    #[instrument(skip_all, fields(action = %self.base.name()))]
    fn action_loop(&self) -> AcqResult<()> {
        let Some(params) = *self.cycle.lock() else {
            return Ok(());
        };
        let channels = self.base.channels();
        let slaves = self.slaves.read().clone();
        PollLoop {
            base: &self.base,
            channels: &channels,
            policy: self.policy,
            sleep_time: params.sleep_time,
            states_per_value: params.states_per_value,
            index: params.index,
            slaves: &slaves,
        }
        .run();
        info!(action = self.base.name(), channels = channels.len(), "acquisition finished");
        Ok(())
    }
}
