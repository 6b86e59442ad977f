//! The measurement configuration and its partitioning by trigger modality.
//!
//! ## Overview
//!
//! A [`MeasurementConfig`] maps controller names to [`ControllerConfig`]s. Each controller entry
//! lists its channels (element handle plus [`ChannelInfo`]), the channels it uses as timer and
//! monitor, and optionally the trigger/gate element driving it. The group-level `timer` and
//! `monitor` name the master channels of the whole configuration.
//!
//! Controllers and channels are kept in insertion order ([`IndexMap`]), which is the order in
//! which non-master controllers are later sequenced.
//!
//! ## Splitting
//!
//! [`MeasurementConfig::split_by_trigger_modality`] partitions the controllers into:
//! 1. **hardware**: controllers with a trigger/gate element implemented in hardware,
//! 2. **software**: controllers without trigger/gate element or with a software one,
//! 3. **zerod**: integrating controllers, whatever their trigger element.
//!
//! The timer and monitor of the hardware and software subsets are taken from one member
//! controller: the one with the lexicographically least name. This is a representative, not a
//! canonical master.
//!
//! [`MeasurementConfig::trigger_gate_config`] collects the trigger/gate elements referenced by
//! the controllers, grouped by the trigger/gate controller owning them.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::channel::ChannelInfo;
use crate::controller::{Axis, Controller, TriggerGate};
use crate::element::Acquirable;

/// Which kind of master channel governs a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MasterKey {
    Timer,
    Monitor,
}
impl fmt::Display for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MasterKey::Timer => "timer",
                MasterKey::Monitor => "monitor",
            }
        )
    }
}

/// A configured channel: the element handle and its descriptive info.
#[derive(Clone)]
pub struct ChannelEntry {
    pub element: Arc<dyn Acquirable>,
    pub info: ChannelInfo,
}
impl fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("element", &self.element.name())
            .field("info", &self.info)
            .finish()
    }
}

/// Configuration of one controller inside a measurement configuration.
#[derive(Clone)]
pub struct ControllerConfig {
    pub ctrl: Arc<dyn Controller>,
    pub channels: IndexMap<String, ChannelEntry>,
    pub timer: Option<String>,
    pub monitor: Option<String>,
    pub trigger_element: Option<TriggerGate>,
}
impl ControllerConfig {
    pub fn new(ctrl: Arc<dyn Controller>) -> Self {
        Self {
            ctrl,
            channels: IndexMap::new(),
            timer: None,
            monitor: None,
            trigger_element: None,
        }
    }

    pub fn with_channel(mut self, element: Arc<dyn Acquirable>, info: ChannelInfo) -> Self {
        self.channels
            .insert(element.name().to_string(), ChannelEntry { element, info });
        self
    }

    pub fn with_timer(mut self, channel: &str) -> Self {
        self.timer = Some(channel.to_string());
        self
    }

    pub fn with_monitor(mut self, channel: &str) -> Self {
        self.monitor = Some(channel.to_string());
        self
    }

    pub fn with_trigger_element(mut self, tg: TriggerGate) -> Self {
        self.trigger_element = Some(tg);
        self
    }

    pub fn name(&self) -> &str {
        self.ctrl.name()
    }

    /// Name of this controller's own timer or monitor channel.
    pub fn master(&self, key: MasterKey) -> Option<&str> {
        match key {
            MasterKey::Timer => self.timer.as_deref(),
            MasterKey::Monitor => self.monitor.as_deref(),
        }
    }

    /// Whether the controller is triggered in software: no trigger/gate element, or a
    /// software-implemented one.
    pub fn is_software_triggered(&self) -> bool {
        self.trigger_element
            .as_ref()
            .map_or(true, |tg| tg.is_software())
    }
}
impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("ctrl", &self.ctrl.name())
            .field("channels", &self.channels.values().collect::<Vec<_>>())
            .field("timer", &self.timer)
            .field("monitor", &self.monitor)
            .field("trigger_element", &self.trigger_element)
            .finish()
    }
}

/// Configuration of a whole measurement group for one acquisition.
#[derive(Clone, Debug, Default)]
pub struct MeasurementConfig {
    pub controllers: IndexMap<String, ControllerConfig>,
    pub timer: Option<String>,
    pub monitor: Option<String>,
}
impl MeasurementConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a controller entry, keyed by the controller name.
    pub fn with_controller(mut self, ctrl_cfg: ControllerConfig) -> Self {
        self.controllers
            .insert(ctrl_cfg.name().to_string(), ctrl_cfg);
        self
    }

    pub fn with_timer(mut self, channel: &str) -> Self {
        self.timer = Some(channel.to_string());
        self
    }

    pub fn with_monitor(mut self, channel: &str) -> Self {
        self.monitor = Some(channel.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Name of the group-level timer or monitor channel.
    pub fn master(&self, key: MasterKey) -> Option<&str> {
        match key {
            MasterKey::Timer => self.timer.as_deref(),
            MasterKey::Monitor => self.monitor.as_deref(),
        }
    }

    /// Looks a channel up by element name across all controllers.
    pub fn find_channel(&self, name: &str) -> Option<(&ControllerConfig, &ChannelEntry)> {
        self.controllers
            .values()
            .find_map(|ctrl_cfg| ctrl_cfg.channels.get(name).map(|entry| (ctrl_cfg, entry)))
    }

    /// Total number of configured channels.
    pub fn channel_count(&self) -> usize {
        self.controllers.values().map(|c| c.channels.len()).sum()
    }

    /// Partitions the configuration into `(hardware, software, zerod)` subsets.
    ///
    /// Every controller ends up in exactly one subset. See the [module documentation](self)
    /// for the routing rules and the choice of the representative timer/monitor.
    pub fn split_by_trigger_modality(&self) -> (Self, Self, Self) {
        let mut hardware = Self::new();
        let mut software = Self::new();
        let mut zerod = Self::new();
        for (name, ctrl_cfg) in self.controllers.iter() {
            let subset = if ctrl_cfg.ctrl.is_zerod() {
                &mut zerod
            } else if ctrl_cfg.is_software_triggered() {
                &mut software
            } else {
                &mut hardware
            };
            subset.controllers.insert(name.clone(), ctrl_cfg.clone());
        }
        hardware.select_representative_master();
        software.select_representative_master();
        (hardware, software, zerod)
    }

    fn select_representative_master(&mut self) {
        if let Some(representative) = self.controllers.keys().min().cloned() {
            let ctrl_cfg = &self.controllers[&representative];
            self.timer = ctrl_cfg.timer.clone();
            self.monitor = ctrl_cfg.monitor.clone();
        }
    }

    /// Builds the trigger/gate configuration from the trigger elements referenced by the
    /// controllers.
    ///
    /// Returns the configuration grouped by trigger/gate controller, and the distinct trigger
    /// elements in order of first reference.
    pub fn trigger_gate_config(&self) -> (TgConfig, Vec<TriggerGate>) {
        let mut tg_elements: Vec<TriggerGate> = Vec::new();
        for tg in self
            .controllers
            .values()
            .filter_map(|ctrl_cfg| ctrl_cfg.trigger_element.as_ref())
        {
            if !tg_elements.contains(tg) {
                tg_elements.push(tg.clone());
            }
        }

        let mut tg_cfg = TgConfig::default();
        for tg in tg_elements.iter() {
            tg_cfg
                .controllers
                .entry(tg.ctrl().name().to_string())
                .or_insert_with(|| TgControllerConfig {
                    ctrl: tg.ctrl().clone(),
                    channels: IndexMap::new(),
                })
                .channels
                .insert(
                    tg.name().to_string(),
                    TgChannelInfo {
                        full_name: tg.full_name().to_string(),
                        axis: tg.axis(),
                    },
                );
        }
        (tg_cfg, tg_elements)
    }
}

/// Trigger/gate element description inside a [`TgConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct TgChannelInfo {
    pub full_name: String,
    pub axis: Axis,
}

/// Trigger/gate elements of one trigger/gate controller.
#[derive(Clone)]
pub struct TgControllerConfig {
    pub ctrl: Arc<dyn Controller>,
    pub channels: IndexMap<String, TgChannelInfo>,
}
impl fmt::Debug for TgControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TgControllerConfig")
            .field("ctrl", &self.ctrl.name())
            .field("channels", &self.channels)
            .finish()
    }
}

/// Configuration consumed by the trigger generation sub-action.
#[derive(Clone, Debug, Default)]
pub struct TgConfig {
    pub controllers: IndexMap<String, TgControllerConfig>,
}
impl TgConfig {
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Whether any of the trigger/gate elements is implemented in software.
    pub fn has_software_elements(&self) -> bool {
        self.controllers.values().any(|c| c.ctrl.is_software())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ElementType;
    use crate::testing::{element, DummyCtrl};

    fn ct_ctrl(name: &str, tg: Option<TriggerGate>) -> ControllerConfig {
        let ctrl = DummyCtrl::shared(name, &[ElementType::CTExpChannel]);
        let timer = format!("{}_1", name);
        let mut cfg = ControllerConfig::new(ctrl.clone())
            .with_channel(element(&timer, name, 1), ChannelInfo::indexed(0))
            .with_channel(element(&format!("{}_2", name), name, 2), ChannelInfo::indexed(1))
            .with_timer(&timer)
            .with_monitor(&format!("{}_2", name));
        cfg.trigger_element = tg;
        cfg
    }

    fn tg(name: &str, ctrl: &Arc<DummyCtrl>, axis: Axis) -> TriggerGate {
        TriggerGate::new(name, &format!("pool/{}", name), axis, ctrl.clone())
    }

    fn mixed_config() -> MeasurementConfig {
        let hw_tg_ctrl = DummyCtrl::shared("tgctrl01", &[ElementType::TriggerGate]);
        let sw_tg_ctrl = DummyCtrl::software("swtgctrl", &[ElementType::TriggerGate]);
        let zerod_ctrl = DummyCtrl::shared("zerodctrl01", &[ElementType::ZeroDExpChannel]);
        MeasurementConfig::new()
            .with_controller(ct_ctrl("ctctrl03", Some(tg("tg01", &hw_tg_ctrl, 1))))
            .with_controller(ct_ctrl("ctctrl02", None))
            .with_controller(ct_ctrl("ctctrl01", Some(tg("tg01", &hw_tg_ctrl, 1))))
            .with_controller(ct_ctrl("ctctrl04", Some(tg("swtg", &sw_tg_ctrl, 1))))
            .with_controller(
                ControllerConfig::new(zerod_ctrl)
                    .with_channel(element("zerod01", "zerodctrl01", 1), ChannelInfo::indexed(8))
                    .with_trigger_element(tg("tg02", &hw_tg_ctrl, 2)),
            )
            .with_timer("ctctrl01_1")
            .with_monitor("ctctrl01_2")
    }

    #[test]
    fn split_routes_every_controller_once() {
        let config = mixed_config();
        let (hw, sw, zerod) = config.split_by_trigger_modality();

        assert_eq!(
            hw.controllers.keys().collect::<Vec<_>>(),
            vec!["ctctrl03", "ctctrl01"]
        );
        assert_eq!(
            sw.controllers.keys().collect::<Vec<_>>(),
            vec!["ctctrl02", "ctctrl04"]
        );
        assert_eq!(zerod.controllers.keys().collect::<Vec<_>>(), vec!["zerodctrl01"]);

        for name in config.controllers.keys() {
            let hits = [&hw, &sw, &zerod]
                .iter()
                .filter(|subset| subset.controllers.contains_key(name))
                .count();
            assert_eq!(hits, 1, "controller {} routed {} times", name, hits);
        }
    }

    #[test]
    fn split_picks_least_controller_as_representative() {
        let (hw, sw, zerod) = mixed_config().split_by_trigger_modality();
        assert_eq!(hw.timer.as_deref(), Some("ctctrl01_1"));
        assert_eq!(hw.monitor.as_deref(), Some("ctctrl01_2"));
        assert_eq!(sw.timer.as_deref(), Some("ctctrl02_1"));
        assert_eq!(zerod.timer, None);
    }

    #[test]
    fn split_of_empty_config() {
        let (hw, sw, zerod) = MeasurementConfig::new().split_by_trigger_modality();
        assert!(hw.is_empty() && sw.is_empty() && zerod.is_empty());
        assert_eq!(hw.timer, None);
    }

    #[test]
    fn trigger_gate_config_groups_distinct_elements() {
        let (tg_cfg, elements) = mixed_config().trigger_gate_config();
        assert_eq!(
            elements.iter().map(|tg| tg.name()).collect::<Vec<_>>(),
            vec!["tg01", "swtg", "tg02"]
        );
        assert_eq!(
            tg_cfg.controllers.keys().collect::<Vec<_>>(),
            vec!["tgctrl01", "swtgctrl"]
        );
        let hw_tg = &tg_cfg.controllers["tgctrl01"];
        assert_eq!(hw_tg.channels.keys().collect::<Vec<_>>(), vec!["tg01", "tg02"]);
        assert_eq!(hw_tg.channels["tg02"].full_name, "pool/tg02");
        assert!(tg_cfg.has_software_elements());
    }

    #[test]
    fn find_channel_across_controllers() {
        let config = mixed_config();
        let (ctrl_cfg, entry) = config.find_channel("ctctrl02_2").unwrap();
        assert_eq!(ctrl_cfg.name(), "ctctrl02");
        assert_eq!(entry.info.index, 1);
        assert!(config.find_channel("nope").is_none());
        assert_eq!(config.channel_count(), 9);
    }
}
