//! Error type of the acquisition control layer.
//!
//! [`AcqError`] consolidates everything that can make a cycle fail:
//!
//! - **`Config`**: the measurement configuration or the request is unusable. Raised before any
//!   controller call.
//! - **`ControllerProtocol`**: a `PreLoadOne`/`PreStartOne` call answered `false`. The remaining
//!   sequencing is abandoned, already started controllers are left as they are.
//! - **`Controller`**: a controller capability call returned an error.
//! - **`AlreadyRunning`**, **`Spawn`**, **`WorkerPool`**, **`Settings`**: infrastructure failures.

use acqconfig_backend::{Axis, ConfigError, ControllerError, CtrlResult};
use thiserror::Error;

/// Convenience alias for results of acquisition operations.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{ctrl}.{call}({axis}) returned false")]
    ControllerProtocol {
        ctrl: String,
        call: &'static str,
        axis: Axis,
    },

    #[error("controller {ctrl} failed: {source}")]
    Controller {
        ctrl: String,
        #[source]
        source: ControllerError,
    },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("unable to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("settings error: {0}")]
    Settings(#[from] figment::Error),
}

/// Attaches the controller name to the result of a capability call.
pub(crate) trait InCtrl<T> {
    fn in_ctrl(self, ctrl: &str) -> AcqResult<T>;
}
impl<T> InCtrl<T> for CtrlResult<T> {
    fn in_ctrl(self, ctrl: &str) -> AcqResult<T> {
        self.map_err(|source| AcqError::Controller {
            ctrl: ctrl.to_string(),
            source,
        })
    }
}
