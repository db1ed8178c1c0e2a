//! Round controller: drives train → privatize → exchange → apply → evaluate
//! until the loss plateaus or the round cap is hit, then finalizes.
//!
//! One run per controller at a time. Suspension points are the data fetch,
//! the channel exchange and the inter-round delay; the delay is cancellable
//! through [`RoundController::stop`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, SecurityEvent, SecurityEventKind};
use crate::backend::NumericBackend;
use crate::channel::{ChannelKeys, SecureChannelClient, Transport};
use crate::data::{cache_key, TrainingDataCache, TrainingDataSource, TrainingSample};
use crate::error::{FlError, FlResult};
use crate::metrics::{record_session_finished, PerformanceMetrics, RoundMetric, FL_METRICS};
use crate::model_state::{ApplyOutcome, ModelStateManager, ModelVersion, SnapshotStore};
use crate::privacy::PrivacyEngine;
use crate::session::{FederatedSession, ModelType, ParticipantId, SessionStatus};
use crate::settings::ControllerSettings;
use crate::trainer::LocalTrainer;

/// Injected collaborators. Everything external to the core comes in here.
pub struct Collaborators {
    pub backend: Arc<dyn NumericBackend>,
    pub data_source: Arc<dyn TrainingDataSource>,
    pub transport: Arc<dyn Transport>,
    pub keys: ChannelKeys,
    pub participant: ParticipantId,
    pub audit: Arc<dyn AuditLog>,
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Shared cache; a private one sized by the settings is created when absent.
    pub cache: Option<Arc<TrainingDataCache>>,
    /// Fixed seed for the privacy noise stream.
    pub privacy_seed: Option<u64>,
    pub initial_version: ModelVersion,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub session_id: Uuid,
    pub model_type: ModelType,
    pub status: SessionStatus,
    /// Number of rounds that ran to completion.
    pub rounds_completed: u32,
    /// Zero-based index of the round on which the plateau rule fired.
    pub converged_at: Option<u32>,
    pub final_loss: Option<f32>,
    pub model_version: ModelVersion,
    pub metrics: PerformanceMetrics,
    pub warnings: Vec<String>,
    pub failure: Option<FlError>,
    pub last_good_round: Option<u32>,
}

impl TrainingReport {
    pub fn converged(&self) -> bool { self.converged_at.is_some() }

    pub fn into_result(self) -> FlResult<TrainingReport> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(self),
        }
    }
}

struct RoundOutput {
    training_loss: f32,
    outcome: ApplyOutcome,
}

struct LoopOutcome {
    converged_at: Option<u32>,
}

struct ActiveGuard<'a> {
    active: &'a AtomicBool,
    stop: &'a watch::Sender<bool>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stop.send_replace(false);
        self.active.store(false, Ordering::SeqCst);
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() { return; }
        if rx.changed().await.is_err() { std::future::pending::<()>().await; }
    }
}

pub struct RoundController {
    settings: ControllerSettings,
    data_source: Arc<dyn TrainingDataSource>,
    cache: Arc<TrainingDataCache>,
    trainer: LocalTrainer,
    privacy: PrivacyEngine,
    channel: SecureChannelClient,
    model: Arc<ModelStateManager>,
    audit: Arc<dyn AuditLog>,
    metrics: Mutex<PerformanceMetrics>,
    warnings: Mutex<Vec<String>>,
    active: AtomicBool,
    stop: watch::Sender<bool>,
}

impl RoundController {
    pub fn new(settings: ControllerSettings, c: Collaborators) -> Self {
        let cache = c.cache.unwrap_or_else(|| Arc::new(TrainingDataCache::new(settings.cache_capacity)));
        let privacy = match c.privacy_seed {
            Some(seed) => PrivacyEngine::with_seed(c.audit.clone(), seed),
            None => PrivacyEngine::new(c.audit.clone()),
        };
        let model = Arc::new(ModelStateManager::new(c.backend.clone(), c.snapshots, settings.rollback_factor, c.initial_version));
        let (stop, _) = watch::channel(false);
        Self {
            trainer: LocalTrainer::new(c.backend, (&settings).into()),
            channel: SecureChannelClient::new(c.participant, c.keys, c.transport),
            data_source: c.data_source,
            cache,
            privacy,
            model,
            audit: c.audit,
            metrics: Mutex::new(PerformanceMetrics::default()),
            warnings: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            stop,
            settings,
        }
    }

    pub fn model(&self) -> &Arc<ModelStateManager> { &self.model }
    pub fn trainer(&self) -> &LocalTrainer { &self.trainer }
    pub fn metrics(&self) -> PerformanceMetrics { self.metrics.lock().clone() }
    pub fn is_active(&self) -> bool { self.active.load(Ordering::SeqCst) }

    /// Interrupts the inter-round delay and refuses further rounds of the
    /// active run. Batches already in flight finish.
    pub fn stop(&self) {
        if self.is_active() {
            info!("stop requested");
            self.stop.send_replace(true);
        }
    }

    fn emit(&self, kind: SecurityEventKind, session_id: Uuid, detail: impl Into<String>) {
        self.audit.record(SecurityEvent::new(kind, session_id, detail));
    }

    #[instrument(skip(self, session), fields(session_id = %session.id(), model_type = ?session.model_type()))]
    pub async fn start_training(&self, mut session: FederatedSession) -> FlResult<TrainingReport> {
        if self.active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            warn!("training already active, refusing");
            return Err(FlError::AlreadyRunning);
        }
        let _guard = ActiveGuard { active: &self.active, stop: &self.stop };
        if session.status() != SessionStatus::Initializing {
            return Err(FlError::Configuration(format!("session {} is {:?}, a new session is required", session.id(), session.status())));
        }
        self.metrics.lock().reset();
        self.warnings.lock().clear();
        let key = cache_key(&self.model.version().to_string());

        if let Err(e) = self.admit(&session) {
            return Ok(self.fail(session, e));
        }
        self.emit(
            SecurityEventKind::SessionInitialized,
            session.id(),
            format!("participants={} max_rounds={} model_version={}", session.participant_count(), session.config().max_rounds, self.model.version()),
        );
        info!(participants = session.participant_count(), max_rounds = session.config().max_rounds, "session initialized");

        let result = match session.begin_training() {
            Ok(()) => self.run_rounds(&mut session, &key).await,
            Err(e) => Err(e),
        };

        let report = match result {
            Ok(outcome) => self.finalize(session, outcome),
            Err(e) => self.fail(session, e),
        };
        self.cache.invalidate(&key);
        Ok(report)
    }

    fn admit(&self, session: &FederatedSession) -> FlResult<()> {
        self.settings.validate()?;
        if session.participant_count() < self.settings.min_participants {
            return Err(FlError::Configuration(format!("{} participants, at least {} required", session.participant_count(), self.settings.min_participants)));
        }
        Ok(())
    }

    async fn load_round_data(&self, key: &str) -> FlResult<Arc<Vec<TrainingSample>>> {
        let data = self.cache.get_or_fetch(self.data_source.as_ref(), key).await?;
        if data.is_empty() { return Err(FlError::Data(format!("no training data for {key}"))); }
        data.validate()?;
        let (train, valid) = data.split_validation(self.settings.validation_split);
        self.model.set_validation_set(valid);
        Ok(Arc::new(train))
    }

    /// Loads the session data and scores the starting weights on it.
    async fn baseline(&self, key: &str) -> FlResult<f32> {
        self.load_round_data(key).await?;
        self.model.validate()
    }

    async fn execute_round(&self, session: &FederatedSession, key: &str, round: u32) -> FlResult<RoundOutput> {
        let samples = self.load_round_data(key).await?;
        let cfg = session.config();
        let local = self.trainer.train(self.model.weights(), samples, cfg, round).await?;
        let training_loss = local.loss;
        let private = self.privacy.apply_privacy(session.id(), local, cfg.privacy_budget, round);
        let aggregated = self.channel.exchange(&private, session.id(), round).await?;
        let outcome = self.model.apply(&aggregated)?;
        Ok(RoundOutput { training_loss, outcome })
    }

    async fn run_rounds(&self, session: &mut FederatedSession, key: &str) -> FlResult<LoopOutcome> {
        let cfg = session.config().clone();
        let timeout = self.settings.round_timeout();
        let mut previous_loss = tokio::select! {
            res = tokio::time::timeout(timeout, self.baseline(key)) => match res {
                Ok(loss) => loss?,
                Err(_) => return Err(FlError::Timeout { round: 0, millis: timeout.as_millis() as u64 }),
            },
            _ = stopped(self.stop.subscribe()) => return Err(FlError::Cancelled(0)),
        };
        info!(baseline_loss = previous_loss, "baseline evaluated");

        let mut streak = 0u32;
        let mut round = 0u32;
        while round < cfg.max_rounds {
            if *self.stop.borrow() { return Err(FlError::Cancelled(round)); }
            let started = Instant::now();
            let timeout = self.settings.round_timeout();
            let out = match tokio::time::timeout(timeout, self.execute_round(session, key, round)).await {
                Ok(res) => res?,
                Err(_) => return Err(FlError::Timeout { round, millis: timeout.as_millis() as u64 }),
            };

            let current_loss = out.outcome.committed_loss();
            if out.outcome.is_rollback() {
                streak = 0;
                FL_METRICS.rollbacks_total.add(1, &[]);
                self.emit(
                    SecurityEventKind::UpdateRolledBack,
                    session.id(),
                    format!("round={round} attempted_loss={:.6} restored_loss={:.6}", out.outcome.attempted_loss(), current_loss),
                );
            } else {
                let improvement = previous_loss - current_loss;
                if improvement.abs() < cfg.convergence_threshold { streak += 1; } else { streak = 0; }
                previous_loss = current_loss;
            }

            if let Err(e) = self.model.snapshot(Some(round)) {
                warn!(round, error = %e, "snapshot failed, continuing with in-memory model");
                self.warnings.lock().push(format!("round {round}: {e}"));
            }

            let elapsed = started.elapsed();
            self.metrics.lock().record_round(RoundMetric {
                round,
                training_loss: out.training_loss,
                validation_loss: out.outcome.attempted_loss(),
                committed_loss: current_loss,
                rolled_back: out.outcome.is_rollback(),
                duration: elapsed,
            });
            FL_METRICS.rounds_total.add(1, &[]);
            FL_METRICS.round_latency_ms.record(elapsed.as_secs_f64() * 1000.0, &[]);
            session.advance_round()?;
            info!(round, loss = current_loss, training_loss = out.training_loss, streak, rolled_back = out.outcome.is_rollback(), elapsed_ms = elapsed.as_millis() as u64, "round complete");

            if streak >= self.settings.convergence_patience {
                self.metrics.lock().convergence_rounds = round + 1;
                info!(round, "loss plateau reached");
                return Ok(LoopOutcome { converged_at: Some(round) });
            }

            round += 1;
            if round < cfg.max_rounds {
                let delay = self.settings.adaptive_delay(elapsed);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(self.stop.subscribe()) => return Err(FlError::Cancelled(round)),
                }
            }
        }
        Ok(LoopOutcome { converged_at: None })
    }

    fn finalize(&self, mut session: FederatedSession, outcome: LoopOutcome) -> TrainingReport {
        let mut warnings = std::mem::take(&mut *self.warnings.lock());
        if let Err(e) = self.model.snapshot(None) {
            warn!(error = %e, "final snapshot failed");
            warnings.push(format!("final snapshot: {e}"));
        }
        let version = self.model.bump_patch();
        if let Err(e) = session.complete() { warnings.push(e.to_string()); }
        let rounds = session.current_round();
        self.emit(
            SecurityEventKind::SessionCompleted,
            session.id(),
            format!("rounds={rounds} converged={} version={version}", outcome.converged_at.is_some()),
        );
        record_session_finished("completed");
        info!(rounds, converged = outcome.converged_at.is_some(), %version, "session completed");
        TrainingReport {
            session_id: session.id(),
            model_type: session.model_type(),
            status: session.status(),
            rounds_completed: rounds,
            converged_at: outcome.converged_at,
            final_loss: self.model.committed_loss(),
            model_version: version,
            metrics: self.metrics(),
            warnings,
            failure: None,
            last_good_round: rounds.checked_sub(1),
        }
    }

    fn fail(&self, mut session: FederatedSession, err: FlError) -> TrainingReport {
        let mut warnings = std::mem::take(&mut *self.warnings.lock());
        if let Err(e) = session.fail() { warnings.push(e.to_string()); }
        if matches!(err, FlError::Channel { .. }) {
            self.emit(SecurityEventKind::ChannelFailure, session.id(), format!("round={} {err}", session.current_round()));
        }
        self.emit(SecurityEventKind::SessionFailed, session.id(), err.to_string());
        record_session_finished("failed");
        error!(error = %err, kind = err.label(), rounds = session.current_round(), "session failed");
        let rounds = session.current_round();
        TrainingReport {
            session_id: session.id(),
            model_type: session.model_type(),
            status: session.status(),
            rounds_completed: rounds,
            converged_at: None,
            final_loss: self.model.committed_loss(),
            model_version: self.model.version(),
            metrics: self.metrics(),
            warnings,
            failure: Some(err),
            last_good_round: rounds.checked_sub(1),
        }
    }
}

impl std::fmt::Debug for RoundController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundController")
            .field("participant", &self.channel.participant())
            .field("active", &self.is_active())
            .field("version", &self.model.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn report_into_result_surfaces_failure() {
        let report = TrainingReport {
            session_id: Uuid::nil(),
            model_type: ModelType::SleepQuality,
            status: SessionStatus::Failed,
            rounds_completed: 1,
            converged_at: None,
            final_loss: None,
            model_version: ModelVersion::default(),
            metrics: PerformanceMetrics::default(),
            warnings: vec![],
            failure: Some(FlError::Cancelled(1)),
            last_good_round: Some(0),
        };
        assert_eq!(report.clone().into_result().unwrap_err(), FlError::Cancelled(1));
        assert!(!report.converged());
    }

    #[tokio::test]
    async fn stopped_resolves_once_flag_is_set() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(stopped(rx));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
