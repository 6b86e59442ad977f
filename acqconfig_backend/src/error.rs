//! Error types of the configuration layer.
//!
//! - [`ConfigError`] covers everything that makes a measurement configuration unusable before
//!   any hardware is touched: missing or conflicting timing parameters, a master (timer/monitor)
//!   channel that cannot be resolved, and failures while binding a declarative description.
//! - [`ControllerError`] is what controller plugins return from their capability methods.

use thiserror::Error;

use crate::config::MasterKey;
use crate::controller::Axis;

/// Convenience alias for results of configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("must give integration time or monitor counts")]
    MissingTimingParameter,

    #[error("must give either integration time or monitor counts (not both)")]
    ConflictingTimingParameters,

    #[error("no {0} channel selected in the configuration")]
    NoMaster(MasterKey),

    #[error("{key} channel {channel} is not part of the configuration")]
    MasterNotFound { key: MasterKey, channel: String },

    #[error("controller {ctrl} does not define a {key} channel")]
    ControllerWithoutMaster { ctrl: String, key: MasterKey },

    #[error("synchronization description is empty")]
    EmptySynchronization,

    #[error("{what} of {value} s can not be represented as a duration")]
    InvalidDuration { what: &'static str, value: f64 },

    #[error("unknown controller {0}")]
    UnknownController(String),

    #[error("unknown element {0}")]
    UnknownElement(String),

    #[error("unknown trigger/gate element {0}")]
    UnknownTriggerGate(String),

    #[error("element {element} belongs to controller {found}, not to {expected}")]
    ElementControllerMismatch {
        element: String,
        expected: String,
        found: String,
    },

    #[error("invalid configuration description: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by controller plugins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// The controller only implements the load calls without a repetitions argument.
    #[error("repetitions-aware loading is not supported")]
    RepetitionsUnsupported,

    #[error("controller parameter {0} is not supported")]
    UnsupportedParameter(String),

    #[error("axis {0} is not defined")]
    UnknownAxis(Axis),

    #[error("{0}")]
    Hardware(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::ControllerWithoutMaster {
            ctrl: "ctctrl01".to_string(),
            key: MasterKey::Monitor,
        };
        assert_eq!(
            err.to_string(),
            "controller ctctrl01 does not define a monitor channel"
        );
        assert_eq!(
            ControllerError::Hardware("card not responding".into()).to_string(),
            "card not responding"
        );
    }
}
