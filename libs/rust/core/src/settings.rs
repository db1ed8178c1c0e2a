//! Layered settings: defaults, optional file (`PULSE_CONFIG_FILE`), then
//! `PULSE__SECTION__KEY` environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlError, FlResult};
use crate::session::{FederatedConfig, MIN_PARTICIPANTS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub min_participants: usize,
    pub convergence_patience: u32,
    /// Inter-round delay is `base_delay * min(round_time / reference_round_time, delay_cap)`,
    /// all expressed in `time_unit_ms` units.
    pub base_delay: f64,
    pub reference_round_time: f64,
    pub delay_cap: f64,
    pub time_unit_ms: u64,
    pub round_timeout_ms: u64,
    pub max_concurrent_batches: usize,
    pub optimal_batch_size: usize,
    pub l2_coefficient: f32,
    pub max_grad_norm: f32,
    pub momentum: f32,
    pub rollback_factor: f32,
    pub validation_split: f32,
    pub cache_capacity: usize,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            min_participants: MIN_PARTICIPANTS,
            convergence_patience: 3,
            base_delay: 1.0,
            reference_round_time: 5.0,
            delay_cap: 2.0,
            time_unit_ms: 1000,
            round_timeout_ms: 120_000,
            max_concurrent_batches: 4,
            optimal_batch_size: 32,
            l2_coefficient: 0.01,
            max_grad_norm: 1.0,
            momentum: 0.9,
            rollback_factor: 1.5,
            validation_split: 0.2,
            cache_capacity: 8,
            snapshot_dir: None,
        }
    }
}

fn finite_at_least(name: &str, value: f64, floor: f64) -> FlResult<()> {
    if value.is_finite() && value >= floor { Ok(()) } else { Err(FlError::Configuration(format!("{name} must be finite and >= {floor}, got {value}"))) }
}

impl ControllerSettings {
    /// Rejects values that would stall the trainer or panic when turned into a `Duration`.
    pub fn validate(&self) -> FlResult<()> {
        if self.convergence_patience == 0 { return Err(FlError::Configuration("convergence_patience must be at least 1".into())); }
        if self.max_concurrent_batches == 0 { return Err(FlError::Configuration("max_concurrent_batches must be at least 1".into())); }
        if self.optimal_batch_size == 0 { return Err(FlError::Configuration("optimal_batch_size must be at least 1".into())); }
        if self.time_unit_ms == 0 { return Err(FlError::Configuration("time_unit_ms must be at least 1".into())); }
        if self.round_timeout_ms == 0 { return Err(FlError::Configuration("round_timeout_ms must be at least 1".into())); }
        finite_at_least("base_delay", self.base_delay, 0.0)?;
        finite_at_least("delay_cap", self.delay_cap, 0.0)?;
        if !(self.reference_round_time.is_finite() && self.reference_round_time > 0.0) {
            return Err(FlError::Configuration(format!("reference_round_time must be finite and positive, got {}", self.reference_round_time)));
        }
        finite_at_least("l2_coefficient", self.l2_coefficient as f64, 0.0)?;
        finite_at_least("rollback_factor", self.rollback_factor as f64, 1.0)?;
        if !(self.max_grad_norm.is_finite() && self.max_grad_norm > 0.0) {
            return Err(FlError::Configuration(format!("max_grad_norm must be finite and positive, got {}", self.max_grad_norm)));
        }
        if !(self.momentum.is_finite() && (0.0..1.0).contains(&self.momentum)) {
            return Err(FlError::Configuration(format!("momentum must lie in [0, 1), got {}", self.momentum)));
        }
        if !(self.validation_split.is_finite() && (0.0..1.0).contains(&self.validation_split)) {
            return Err(FlError::Configuration(format!("validation_split must lie in [0, 1), got {}", self.validation_split)));
        }
        Ok(())
    }

    pub fn time_unit(&self) -> Duration { Duration::from_millis(self.time_unit_ms.max(1)) }
    pub fn round_timeout(&self) -> Duration { Duration::from_millis(self.round_timeout_ms) }

    /// Delay before the next round, scaled by how long this one took.
    pub fn adaptive_delay(&self, round_time: Duration) -> Duration {
        let unit = self.time_unit().as_secs_f64();
        let ratio = (round_time.as_secs_f64() / unit) / self.reference_round_time;
        let factor = ratio.min(self.delay_cap).max(0.0);
        Duration::from_secs_f64(self.base_delay * factor * unit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub federated: FederatedConfig,
    pub controller: ControllerSettings,
}

impl Settings {
    pub fn load() -> FlResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("controller.min_participants", MIN_PARTICIPANTS as i64)?;
        if let Ok(file) = std::env::var("PULSE_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("PULSE").prefix_separator("__").separator("__").try_parsing(true));
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.federated.validate()?;
        settings.controller.validate()?;
        info!(max_rounds = settings.federated.max_rounds, epochs = settings.federated.local_epochs, "settings loaded");
        Ok(settings)
    }
}
