//! Per-cycle channel sets, grouped by controller.
//!
//! A [`ChannelSet`] is built when a cycle starts and replaced when the next one starts. Groups
//! keep the order in which their controllers must be driven, and channels inside a group keep
//! the order in which they are started.

use std::sync::Arc;

use acqconfig_backend::{Channel, Controller, MeasurementConfig};

pub struct CtrlChannels {
    pub ctrl: Arc<dyn Controller>,
    pub channels: Vec<Channel>,
}

#[derive(Default)]
pub struct ChannelSet {
    groups: Vec<CtrlChannels>,
}
impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels of every controller of `config` accepted by `select`, in configuration order.
    pub fn from_config<F>(config: &MeasurementConfig, select: F) -> Self
    where
        F: Fn(&dyn Controller) -> bool,
    {
        let mut set = Self::new();
        for ctrl_cfg in config.controllers.values() {
            if !select(ctrl_cfg.ctrl.as_ref()) {
                continue;
            }
            let channels = ctrl_cfg
                .channels
                .values()
                .map(|entry| Channel::new(entry.element.clone(), entry.info.clone()))
                .collect();
            set.push(ctrl_cfg.ctrl.clone(), channels);
        }
        set
    }

    pub fn push(&mut self, ctrl: Arc<dyn Controller>, channels: Vec<Channel>) {
        self.groups.push(CtrlChannels { ctrl, channels });
    }

    pub fn groups(&self) -> &[CtrlChannels] {
        &self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.groups.iter().flat_map(|group| group.channels.iter())
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.iter().find(|channel| channel.name() == name)
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|group| group.channels.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn controller_names(&self) -> Vec<&str> {
        self.groups.iter().map(|group| group.ctrl.name()).collect()
    }
}
