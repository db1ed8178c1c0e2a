#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulse_core::{
    AuditLog, BatchGradients, ChannelKeys, Collaborators, ControllerSettings, Envelope, FederatedConfig, FederatedSession, FlError, FlResult,
    InMemoryAuditLog, InMemorySnapshotStore, LinearModel, LoopbackCoordinator, ModelSnapshot, ModelType, ModelVersion,
    NumericBackend, ParticipantId, RoundController, SnapshotStore, Tensor, TrainingData, TrainingDataSource, TrainingSample,
    Transport,
};

pub const PARTICIPANT: &str = "wearable-0";

/// `y = 2*x0 - x1 + 0.5` on a small deterministic grid.
pub fn synthetic_samples(n: usize) -> Vec<TrainingSample> {
    (0..n)
        .map(|i| {
            let x0 = (i % 7) as f32 / 7.0;
            let x1 = (i % 5) as f32 / 5.0;
            TrainingSample::new(vec![x0, x1], 2.0 * x0 - x1 + 0.5)
        })
        .collect()
}

pub struct StaticSource {
    samples: Vec<TrainingSample>,
    pub fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(samples: Vec<TrainingSample>) -> Self { Self { samples, fetches: AtomicUsize::new(0) } }
}

#[async_trait]
impl TrainingDataSource for StaticSource {
    async fn fetch(&self, version_key: &str) -> FlResult<TrainingData> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(TrainingData::new(format!("static:{version_key}"), self.samples.clone()))
    }
}

/// Source whose fetch never resolves.
pub struct HangingSource;

#[async_trait]
impl TrainingDataSource for HangingSource {
    async fn fetch(&self, _version_key: &str) -> FlResult<TrainingData> {
        std::future::pending().await
    }
}

/// Linear model whose held-out evaluation follows a fixed script; the last
/// value repeats once the script runs out.
pub struct ScriptedBackend {
    inner: LinearModel,
    losses: Vec<f32>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(losses: Vec<f32>) -> Self { Self { inner: LinearModel::new(2), losses, calls: AtomicUsize::new(0) } }
    pub fn evaluations(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

impl NumericBackend for ScriptedBackend {
    fn initial_weights(&self) -> Vec<Tensor> { self.inner.initial_weights() }

    fn predict(&self, weights: &[Tensor], features: &[f32]) -> FlResult<f32> { self.inner.predict(weights, features) }

    fn batch_gradients(&self, weights: &[Tensor], batch: &[TrainingSample], l2: f32) -> FlResult<BatchGradients> {
        self.inner.batch_gradients(weights, batch, l2)
    }

    fn evaluate(&self, _weights: &[Tensor], _samples: &[TrainingSample]) -> FlResult<f32> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.losses.get(i).or(self.losses.last()).copied().unwrap_or(1.0))
    }
}

/// Forwards to the loopback coordinator and corrupts the response
/// signature on the `nth` exchange (1-based).
pub struct TamperingTransport {
    inner: Arc<LoopbackCoordinator>,
    nth: usize,
    calls: AtomicUsize,
}

impl TamperingTransport {
    pub fn new(inner: Arc<LoopbackCoordinator>, nth: usize) -> Self { Self { inner, nth, calls: AtomicUsize::new(0) } }
}

#[async_trait]
impl Transport for TamperingTransport {
    async fn send(&self, envelope: Vec<u8>) -> FlResult<Vec<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let response = self.inner.send(envelope).await?;
        if call != self.nth { return Ok(response); }
        let mut env = Envelope::from_bytes(&response)?;
        env.signature[0] ^= 0xff;
        env.to_bytes()
    }
}

pub struct SlowTransport {
    pub inner: Arc<LoopbackCoordinator>,
    pub delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(&self, envelope: Vec<u8>) -> FlResult<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(envelope).await
    }
}

pub type TransportWrapper = Box<dyn FnOnce(Arc<LoopbackCoordinator>) -> Arc<dyn Transport>>;

pub fn tampering(nth: usize) -> TransportWrapper {
    Box::new(move |coord: Arc<LoopbackCoordinator>| -> Arc<dyn Transport> { Arc::new(TamperingTransport::new(coord, nth)) })
}

pub fn slow(delay: Duration) -> TransportWrapper {
    Box::new(move |coord: Arc<LoopbackCoordinator>| -> Arc<dyn Transport> { Arc::new(SlowTransport { inner: coord, delay }) })
}

pub struct FailingStore;

impl SnapshotStore for FailingStore {
    fn persist(&self, _: &ModelSnapshot) -> FlResult<()> { Err(FlError::Persistence("disk full".into())) }
}

/// Millisecond time unit so inter-round delays stay tiny.
pub fn fast_settings() -> ControllerSettings {
    ControllerSettings { time_unit_ms: 1, round_timeout_ms: 10_000, ..ControllerSettings::default() }
}

pub fn session(max_rounds: u32, threshold: f32) -> FederatedSession {
    let config = FederatedConfig { max_rounds, convergence_threshold: threshold, local_epochs: 2, batch_size: 8, ..FederatedConfig::default() };
    FederatedSession::new(ModelType::HeartRateAnomaly, participants(3), config).expect("valid session")
}

pub fn participants(n: usize) -> Vec<ParticipantId> {
    (0..n).map(|i| ParticipantId(format!("wearable-{i}"))).collect()
}

pub struct Harness {
    pub controller: Arc<RoundController>,
    pub audit: Arc<InMemoryAuditLog>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub coordinator: Arc<LoopbackCoordinator>,
}

pub struct HarnessBuilder {
    pub settings: ControllerSettings,
    pub backend: Arc<dyn NumericBackend>,
    pub source: Arc<dyn TrainingDataSource>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub wrap_transport: Option<TransportWrapper>,
    pub seed: Option<u64>,
}

impl HarnessBuilder {
    pub fn new(backend: Arc<dyn NumericBackend>) -> Self {
        Self {
            settings: fast_settings(),
            backend,
            source: Arc::new(StaticSource::new(synthetic_samples(40))),
            snapshots: None,
            wrap_transport: None,
            seed: Some(7),
        }
    }

    pub fn linear() -> Self { Self::new(Arc::new(LinearModel::new(2))) }

    pub fn build(self) -> Harness {
        let (client_keys, coordinator_keys) = ChannelKeys::generate_pair();
        let coordinator = Arc::new(LoopbackCoordinator::new(coordinator_keys, PARTICIPANT));
        let transport: Arc<dyn Transport> = match self.wrap_transport {
            Some(wrap) => wrap(coordinator.clone()),
            None => coordinator.clone(),
        };
        let audit = Arc::new(InMemoryAuditLog::new());
        let memory_store = Arc::new(InMemorySnapshotStore::new());
        let store: Arc<dyn SnapshotStore> = self.snapshots.unwrap_or_else(|| memory_store.clone() as Arc<dyn SnapshotStore>);
        let controller = RoundController::new(
            self.settings,
            Collaborators {
                backend: self.backend,
                data_source: self.source,
                transport,
                keys: client_keys,
                participant: ParticipantId::from(PARTICIPANT),
                audit: audit.clone() as Arc<dyn AuditLog>,
                snapshots: store,
                cache: None,
                privacy_seed: self.seed,
                initial_version: ModelVersion::default(),
            },
        );
        Harness { controller: Arc::new(controller), audit, snapshots: memory_store, coordinator }
    }
}
