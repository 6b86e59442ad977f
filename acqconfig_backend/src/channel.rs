//! Per-cycle channel handles.
//!
//! A [`Channel`] wraps one acquirable element together with a copy of the descriptive
//! [`ChannelInfo`] it was configured with. Channels are created fresh by a sub-acquisition when
//! a cycle starts and dropped when the cycle ends, so the info never changes under a running
//! loop. Through `Deref`, a channel can be used wherever the element itself is expected.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::Acquirable;

/// Descriptive information attached to a channel in the measurement configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelInfo {
    /// Disabled channels are configured but never started.
    pub enabled: bool,
    /// Position of the channel in the measurement group, used to order published records.
    pub index: usize,
    pub label: String,
    pub full_name: String,
    /// Whether the channel is shown in the scan output.
    pub output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}
impl Default for ChannelInfo {
    fn default() -> Self {
        Self {
            enabled: true,
            index: 0,
            label: String::new(),
            full_name: String::new(),
            output: true,
            format: None,
        }
    }
}
impl ChannelInfo {
    pub fn indexed(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn disabled(index: usize) -> Self {
        Self {
            enabled: false,
            ..Self::indexed(index)
        }
    }
}

#[derive(Clone)]
pub struct Channel {
    element: Arc<dyn Acquirable>,
    info: ChannelInfo,
}
impl Channel {
    pub fn new(element: Arc<dyn Acquirable>, info: ChannelInfo) -> Self {
        Self { element, info }
    }

    pub fn element(&self) -> &Arc<dyn Acquirable> {
        &self.element
    }
    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }
    pub fn enabled(&self) -> bool {
        self.info.enabled
    }
}
impl Deref for Channel {
    type Target = dyn Acquirable;

    fn deref(&self) -> &Self::Target {
        self.element.as_ref()
    }
}
impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("element", &self.element.name())
            .field("info", &self.info)
            .finish()
    }
}
