//! Loop timing and pool sizing of the acquisition engine.
//!
//! Settings are layered with `figment`:
//! 1. built-in defaults ([`AcqSettings::default`]),
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `ACQ_`, e.g. `ACQ_WORKER_POOL_SIZE=8`.
//!
//! ```toml
//! acq_loop_sleep_time = 0.01
//! acq_loop_states_per_value = 10
//! worker_pool_size = 4
//! zerod_loop_sleep_time = 0.05
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use acqconfig_backend::{duration_from_secs, ConfigResult};

use crate::error::AcqResult;

const DEFAULT_SLEEP_TIME: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcqSettings {
    /// Seconds slept between two state reads of a poll loop.
    pub acq_loop_sleep_time: f64,
    /// Number of state reads between two incremental value reads.
    pub acq_loop_states_per_value: u32,
    /// Threads of the pool running trigger-fired cycles.
    pub worker_pool_size: usize,
    /// Seconds slept between two samples of the integrator loop. Defaults to
    /// `acq_loop_sleep_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zerod_loop_sleep_time: Option<f64>,
}
impl Default for AcqSettings {
    fn default() -> Self {
        Self {
            acq_loop_sleep_time: DEFAULT_SLEEP_TIME.as_secs_f64(),
            acq_loop_states_per_value: 10,
            worker_pool_size: 4,
            zerod_loop_sleep_time: None,
        }
    }
}
impl AcqSettings {
    /// The layered provider, without extracting it.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AcqSettings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("ACQ_"))
    }

    /// Extracts and validates the settings.
    ///
    /// # Errors
    /// [`AcqError::Settings`](crate::AcqError::Settings) for unreadable or mistyped values,
    /// [`ConfigError::InvalidDuration`](acqconfig_backend::ConfigError::InvalidDuration) for sleep times that are not representable.
    pub fn load(path: Option<&Path>) -> AcqResult<Self> {
        let settings: Self = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        duration_from_secs("acq_loop_sleep_time", self.acq_loop_sleep_time)?;
        if let Some(secs) = self.zerod_loop_sleep_time {
            duration_from_secs("zerod_loop_sleep_time", secs)?;
        }
        Ok(())
    }

    /// Loop sleep time; the default one if the configured value is not representable.
    pub fn sleep_time(&self) -> Duration {
        duration_from_secs("acq_loop_sleep_time", self.acq_loop_sleep_time)
            .unwrap_or(DEFAULT_SLEEP_TIME)
    }

    pub fn zerod_sleep_time(&self) -> Duration {
        self.zerod_loop_sleep_time
            .and_then(|secs| duration_from_secs("zerod_loop_sleep_time", secs).ok())
            .unwrap_or_else(|| self.sleep_time())
    }

    /// States per value, never zero.
    pub fn states_per_value(&self) -> u32 {
        self.acq_loop_states_per_value.max(1)
    }
}
