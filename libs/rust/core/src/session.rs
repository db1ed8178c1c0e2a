//! Federated session and its lifecycle state machine.
//!
//! States:
//! - Initializing
//! - Training
//! - Completed (terminal)
//! - Failed (terminal)
//!
//! Tracks timestamps for each transition, like the bootstrap FSM does for
//! node phases.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlError, FlResult};

pub const MIN_PARTICIPANTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    HeartRateAnomaly,
    SleepQuality,
    ActivityLevel,
    StressLevel,
    GlucoseTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus { Initializing, Training, Completed, Failed }

impl SessionStatus {
    pub fn is_terminal(self) -> bool { matches!(self, SessionStatus::Completed | SessionStatus::Failed) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    pub max_rounds: u32,
    pub local_epochs: u32,
    pub learning_rate: f32,
    pub convergence_threshold: f32,
    pub privacy_budget: f32,
    pub batch_size: usize,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self { max_rounds: 10, local_epochs: 3, learning_rate: 0.05, convergence_threshold: 0.001, privacy_budget: 0.01, batch_size: 32 }
    }
}

impl FederatedConfig {
    pub fn validate(&self) -> FlResult<()> {
        if self.max_rounds == 0 { return Err(FlError::Configuration("max_rounds must be at least 1".into())); }
        if self.local_epochs == 0 { return Err(FlError::Configuration("local_epochs must be at least 1".into())); }
        if self.batch_size == 0 { return Err(FlError::Configuration("batch_size must be at least 1".into())); }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FlError::Configuration("learning_rate must be finite and positive".into()));
        }
        if !(self.convergence_threshold.is_finite() && self.convergence_threshold >= 0.0) {
            return Err(FlError::Configuration("convergence_threshold must be finite and non-negative".into()));
        }
        if !(self.privacy_budget.is_finite() && self.privacy_budget >= 0.0) {
            return Err(FlError::Configuration("privacy_budget must be finite and non-negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self { ParticipantId(s.to_string()) }
}

#[derive(Debug)]
pub struct FederatedSession {
    id: Uuid,
    model_type: ModelType,
    participants: Vec<ParticipantId>,
    config: FederatedConfig,
    started_at: DateTime<Utc>,
    status: SessionStatus,
    current_round: u32,
    status_since: Instant,
    transitions: Vec<(SessionStatus, Duration)>,
}

impl FederatedSession {
    pub fn new(model_type: ModelType, participants: Vec<ParticipantId>, config: FederatedConfig) -> FlResult<Self> {
        Self::with_min_participants(model_type, participants, config, MIN_PARTICIPANTS)
    }

    pub fn with_min_participants(model_type: ModelType, participants: Vec<ParticipantId>, config: FederatedConfig, min_participants: usize) -> FlResult<Self> {
        if participants.len() < min_participants {
            return Err(FlError::Configuration(format!("{} participants, at least {} required", participants.len(), min_participants)));
        }
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            model_type,
            participants,
            config,
            started_at: Utc::now(),
            status: SessionStatus::Initializing,
            current_round: 0,
            status_since: Instant::now(),
            transitions: Vec::new(),
        })
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn model_type(&self) -> ModelType { self.model_type }
    pub fn participants(&self) -> &[ParticipantId] { &self.participants }
    pub fn participant_count(&self) -> usize { self.participants.len() }
    pub fn config(&self) -> &FederatedConfig { &self.config }
    pub fn started_at(&self) -> DateTime<Utc> { self.started_at }
    pub fn status(&self) -> SessionStatus { self.status }
    pub fn current_round(&self) -> u32 { self.current_round }
    pub fn transitions(&self) -> &[(SessionStatus, Duration)] { &self.transitions }

    fn transition(&mut self, next: SessionStatus) -> FlResult<()> {
        let allowed = matches!(
            (self.status, next),
            (SessionStatus::Initializing, SessionStatus::Training)
                | (SessionStatus::Initializing, SessionStatus::Failed)
                | (SessionStatus::Training, SessionStatus::Completed)
                | (SessionStatus::Training, SessionStatus::Failed)
        );
        if !allowed {
            return Err(FlError::Configuration(format!("illegal session transition {:?} -> {:?}", self.status, next)));
        }
        let now = Instant::now();
        self.transitions.push((self.status, now - self.status_since));
        self.status = next;
        self.status_since = now;
        Ok(())
    }

    pub fn begin_training(&mut self) -> FlResult<()> { self.transition(SessionStatus::Training) }
    pub fn complete(&mut self) -> FlResult<()> { self.transition(SessionStatus::Completed) }
    pub fn fail(&mut self) -> FlResult<()> { self.transition(SessionStatus::Failed) }

    /// Records one more completed round. Bounded by `max_rounds`.
    pub fn advance_round(&mut self) -> FlResult<u32> {
        if self.status != SessionStatus::Training {
            return Err(FlError::Configuration(format!("cannot advance round while {:?}", self.status)));
        }
        if self.current_round >= self.config.max_rounds {
            return Err(FlError::Configuration("round cap already reached".into()));
        }
        self.current_round += 1;
        Ok(self.current_round)
    }
}
