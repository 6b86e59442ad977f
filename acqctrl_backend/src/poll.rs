//! The poll loop shared by every timer- or monitor-driven acquisition.
//!
//! A loop samples the aggregate state of its channels until none of them is in acquisition,
//! publishing intermediate values on the way, then performs one authoritative read and
//! converges every element to its final value and state. What differs between the acquisition
//! variants is captured by a [`PollPolicy`].
//!
//! ## Convergence
//! The authoritative read happens inside the hardware-access context and produces a
//! [`FinalReadout`]. Publication happens only once the context is released: for every
//! element, the raw state is set without propagation, the final value is published, then,
//! under the element operation lock, the pending operation is cleared and the translated state
//! is published with priority.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acqconfig_backend::{AcqValue, Propagate};
use tracing::{debug, warn};

use crate::action::{in_acquisition, Action, ActionBase, StateReadout, ValueReadout};
use crate::channel_set::ChannelSet;
use crate::utils::TickTimer;

/// Variant-specific behavior of a [`PollLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Publish the values read right after the start, before polling.
    pub first_sample: bool,
    /// Read and publish values every `states_per_value` state reads.
    pub incremental_values: bool,
    /// Drop payloads without samples instead of publishing them.
    pub skip_empty: bool,
    /// Publish the final value as a single-element sequence tagged with the trigger index.
    pub tag_index: bool,
}
impl PollPolicy {
    /// Hardware-triggered acquisitions.
    pub const HARDWARE: Self = Self {
        first_sample: true,
        incremental_values: true,
        skip_empty: true,
        tag_index: false,
    };
    /// Single software-triggered reads.
    pub const SOFTWARE: Self = Self {
        first_sample: false,
        incremental_values: false,
        skip_empty: false,
        tag_index: true,
    };
    /// Timer- or monitor-driven counts over a window.
    pub const CONTINUOUS_COUNT: Self = Self {
        first_sample: true,
        incremental_values: true,
        skip_empty: true,
        tag_index: false,
    };

    fn accepts(&self, value: &AcqValue) -> bool {
        !(self.skip_empty && value.is_empty())
    }

    /// Shapes the final value, `None` if it must not be published.
    pub fn final_value(&self, value: AcqValue, index: Option<u64>) -> Option<AcqValue> {
        if !self.accepts(&value) {
            return None;
        }
        match (self.tag_index, index) {
            (true, Some(index)) => Some(value.into_indexed(index)),
            _ => Some(value),
        }
    }
}

/// The authoritative read taken when a loop ends.
pub struct FinalReadout {
    pub states: StateReadout,
    pub values: ValueReadout,
}
impl FinalReadout {
    /// Publishes the final values and states of every channel of `set`.
    pub fn converge(mut self, action: &str, set: &ChannelSet, policy: PollPolicy, index: Option<u64>) {
        for channel in set.iter() {
            let Some(info) = self.states.shift_remove(channel.name()) else {
                continue;
            };
            // update the state first so that the value publication sees it
            channel.set_state_info(info.clone(), Propagate::None);
            match self.values.shift_remove(channel.name()) {
                Some(Ok(value)) => {
                    if let Some(value) = policy.final_value(value, index) {
                        channel.put_value(value, None, Propagate::Priority);
                    }
                }
                Some(Err(err)) => {
                    warn!(action, channel = channel.name(), "final value read failed: {}", err)
                }
                None => {}
            }
            let _operation = channel.operation_lock().lock();
            channel.clear_operation();
            let info = channel.from_ctrl_state_info(info);
            channel.set_state_info(info, Propagate::Priority);
        }
    }
}

/// One run of the poll loop over the channels of a cycle.
pub struct PollLoop<'a> {
    pub base: &'a ActionBase,
    pub channels: &'a ChannelSet,
    pub policy: PollPolicy,
    pub sleep_time: Duration,
    pub states_per_value: u32,
    pub index: Option<u64>,
    pub slaves: &'a [Arc<dyn Action>],
}
impl<'a> PollLoop<'a> {
    fn publish(&self, values: ValueReadout, propagate: Propagate) {
        for (name, value) in values {
            let Some(channel) = self.channels.get(&name) else {
                continue;
            };
            match value {
                Ok(value) if self.policy.accepts(&value) => {
                    channel.put_value(value, None, propagate)
                }
                Ok(_) => {}
                Err(err) => debug!(action = self.base.name(), channel = %name, "value read failed: {}", err),
            }
        }
    }

    fn stop_slaves(&self) {
        for slave in self.slaves.iter() {
            if let Err(err) = slave.stop_action() {
                warn!(
                    action = self.base.name(),
                    slave = slave.name(),
                    "unable to stop slave acquisition: {}",
                    err
                );
            }
        }
    }

    pub fn run(&self) {
        let action = self.base.name();
        let mut timer = TickTimer::new();

        if self.policy.first_sample {
            let values = self.base.context().raw_read_value(self.channels);
            self.publish(values, Propagate::Priority);
        }

        let states_per_value = u64::from(self.states_per_value.max(1));
        let mut i: u64 = 0;
        loop {
            let states = self.base.read_state_info(self.channels);
            if !in_acquisition(&states) {
                break;
            }
            if self.policy.incremental_values && i % states_per_value == 0 {
                let values = self.base.read_value(self.channels);
                self.publish(values, Propagate::Changed);
            }
            thread::sleep(self.sleep_time);
            i += 1;
        }
        timer.tick_log(action, "acquisition");

        self.stop_slaves();

        let readout = {
            let ctx = self.base.context();
            FinalReadout {
                states: ctx.raw_read_state_info(self.channels),
                values: ctx.raw_read_value(self.channels),
            }
        };
        readout.converge(action, self.channels, self.policy, self.index);
        timer.tick_log(action, "convergence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acqconfig_backend::{Channel, ChannelInfo, State, StateInfo};

    use crate::sim::{CallLog, DummyCounterTimer, SimElement};

    #[test]
    fn final_value_shaping() {
        let empty = AcqValue::from_vec(vec![]);
        assert_eq!(PollPolicy::HARDWARE.final_value(empty.clone(), Some(3)), None);
        assert!(PollPolicy::SOFTWARE.final_value(empty, Some(3)).is_some());

        let tagged = PollPolicy::SOFTWARE
            .final_value(AcqValue::scalar(2.), Some(3))
            .unwrap();
        assert_eq!(tagged.idx, Some(vec![3]));
        assert_eq!(tagged.value.shape(), &[1]);

        let plain = PollPolicy::HARDWARE
            .final_value(AcqValue::scalar(2.), Some(3))
            .unwrap();
        assert_eq!(plain.idx, None);
    }

    #[test]
    fn converge_sets_state_before_value_and_clears_operation() {
        let log = CallLog::new();
        let ctrl = DummyCounterTimer::shared("ctctrl01", &log);
        let element = SimElement::logged("ct01", "ctctrl01", 1, &log);
        let mut set = ChannelSet::new();
        set.push(ctrl, vec![Channel::new(element.clone(), ChannelInfo::indexed(0))]);

        let readout = FinalReadout {
            states: [("ct01".to_string(), StateInfo::new(State::On, "done"))]
                .into_iter()
                .collect(),
            values: [("ct01".to_string(), Ok(AcqValue::scalar(5.)))]
                .into_iter()
                .collect(),
        };
        readout.converge("test", &set, PollPolicy::SOFTWARE, Some(7));

        assert_eq!(
            log.calls_of("ct01", ""),
            vec![
                "ct01.set_state_info(On, None)",
                "ct01.put_value(Priority)",
                "ct01.clear_operation",
                "ct01.set_state_info(On, Priority)",
            ]
        );
        let value = element.final_value().unwrap();
        assert_eq!(value.idx, Some(vec![7]));
        assert_eq!(value.value.as_slice(), Some(&[5.][..]));
    }
}
