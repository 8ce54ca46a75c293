//! Run configuration

use serde::{Deserialize, Serialize};

use ecmc_core::{EcmcError, EcmcResult};

use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerKind;

/// Mediator that drives the handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediatorKind {
    #[default]
    SingleProcess,
    /// One worker thread per handler instance; at most `cores - 1` event
    /// time computations run at the same time.
    MultiProcess { cores: usize },
}

/// Run configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seed of the per-handler random streams
    pub seed: u64,
    pub scheduler: SchedulerKind,
    /// Log a warning when two consecutive events share the same time
    pub warn_on_equal_event_times: bool,
    pub mediator: MediatorKind,
    /// Tolerated bounding potential violations per handler, unlimited if unset
    pub bounding_violation_limit: Option<u64>,
    pub logging: LoggingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            scheduler: SchedulerKind::Heap,
            warn_on_equal_event_times: false,
            mediator: MediatorKind::SingleProcess,
            bounding_violation_limit: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RunConfig {
    /// Configuration for the multi-process mediator.
    pub fn multi_process(cores: usize) -> Self {
        Self {
            mediator: MediatorKind::MultiProcess { cores },
            ..Default::default()
        }
    }

    /// Configuration with the given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> EcmcResult<Self> {
        let config: RunConfig =
            toml::from_str(text).map_err(|e| EcmcError::configuration(format!("invalid run configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EcmcResult<()> {
        if let MediatorKind::MultiProcess { cores } = self.mediator {
            if cores <= 1 {
                return Err(EcmcError::configuration(format!(
                    "the multi-process mediator needs more than one core, got {}",
                    cores
                )));
            }
        }
        Ok(())
    }
}
