//! Declarative configuration descriptions and their binding to live objects.
//!
//! Measurement configurations are usually authored as data (e.g. JSON) referring to
//! controllers, elements and trigger/gate elements by name. A [`ConfigDescription`] is that data;
//! [`Registry::bind`] resolves the names against registered objects and produces the
//! [`MeasurementConfig`] the acquisition core works with.
//!
//! # Example
//! ```ignore
//! let desc = ConfigDescription::from_json(r#"{
//!     "controllers": {
//!         "ctctrl01": {
//!             "channels": {"ct01": {"index": 0}, "ct02": {"index": 1}},
//!             "timer": "ct01",
//!             "monitor": "ct02"
//!         }
//!     },
//!     "timer": "ct01",
//!     "monitor": "ct02"
//! }"#)?;
//! let config = registry.bind(&desc)?;
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::ChannelInfo;
use crate::config::{ControllerConfig, MeasurementConfig};
use crate::controller::{Controller, TriggerGate};
use crate::element::Acquirable;
use crate::error::{ConfigError, ConfigResult};

/// Description of one controller entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerDescription {
    #[serde(default)]
    pub channels: IndexMap<String, ChannelInfo>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub trigger_element: Option<String>,
}

/// Description of a whole measurement configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDescription {
    #[serde(default)]
    pub controllers: IndexMap<String, ControllerDescription>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default)]
    pub monitor: Option<String>,
}
impl ConfigDescription {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Named controllers, elements and trigger/gate elements available for binding.
#[derive(Default)]
pub struct Registry {
    controllers: IndexMap<String, Arc<dyn Controller>>,
    elements: IndexMap<String, Arc<dyn Acquirable>>,
    trigger_gates: IndexMap<String, TriggerGate>,
}
impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_controller(&mut self, ctrl: Arc<dyn Controller>) {
        self.controllers.insert(ctrl.name().to_string(), ctrl);
    }

    pub fn add_element(&mut self, element: Arc<dyn Acquirable>) {
        self.elements.insert(element.name().to_string(), element);
    }

    pub fn add_trigger_gate(&mut self, tg: TriggerGate) {
        self.trigger_gates.insert(tg.name().to_string(), tg);
    }

    /// Resolves a description into a measurement configuration.
    ///
    /// # Errors
    /// - unknown controller, element or trigger/gate names,
    /// - a channel whose element belongs to another controller,
    /// - a controller timer/monitor that is not one of its own channels.
    pub fn bind(&self, desc: &ConfigDescription) -> ConfigResult<MeasurementConfig> {
        let mut config = MeasurementConfig::new();
        config.timer = desc.timer.clone();
        config.monitor = desc.monitor.clone();

        for (ctrl_name, ctrl_desc) in desc.controllers.iter() {
            let ctrl = self
                .controllers
                .get(ctrl_name)
                .ok_or_else(|| ConfigError::UnknownController(ctrl_name.clone()))?;
            let mut ctrl_cfg = ControllerConfig::new(ctrl.clone());

            for (elem_name, info) in ctrl_desc.channels.iter() {
                let element = self
                    .elements
                    .get(elem_name)
                    .ok_or_else(|| ConfigError::UnknownElement(elem_name.clone()))?;
                if element.ctrl_name() != ctrl_name {
                    return Err(ConfigError::ElementControllerMismatch {
                        element: elem_name.clone(),
                        expected: ctrl_name.clone(),
                        found: element.ctrl_name().to_string(),
                    });
                }
                ctrl_cfg = ctrl_cfg.with_channel(element.clone(), info.clone());
            }

            for master in [&ctrl_desc.timer, &ctrl_desc.monitor].into_iter().flatten() {
                if !ctrl_cfg.channels.contains_key(master) {
                    return Err(ConfigError::UnknownElement(master.clone()));
                }
            }
            ctrl_cfg.timer = ctrl_desc.timer.clone();
            ctrl_cfg.monitor = ctrl_desc.monitor.clone();

            if let Some(tg_name) = &ctrl_desc.trigger_element {
                let tg = self
                    .trigger_gates
                    .get(tg_name)
                    .ok_or_else(|| ConfigError::UnknownTriggerGate(tg_name.clone()))?;
                ctrl_cfg.trigger_element = Some(tg.clone());
            }
            debug!(ctrl = %ctrl_name, channels = ctrl_cfg.channels.len(), "bound controller");
            config = config.with_controller(ctrl_cfg);
        }
        Ok(config)
    }
}
