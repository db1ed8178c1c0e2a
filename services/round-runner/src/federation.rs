use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use pulse_core::{
    ChannelKeys, Collaborators, FederatedSession, FileSnapshotStore, FlResult, InMemorySnapshotStore, LinearModel,
    LoopbackCoordinator, ModelUpdate, ModelVersion, NumericBackend, RoundController, Settings,
    SnapshotStore, Tensor, TracingAuditLog, TrainingData, TrainingDataSource, TrainingSample,
};

/// Resting heart rate, HRV and step cadence, all normalized, against a
/// synthetic anomaly score.
const FEATURES: usize = 3;

pub struct SyntheticWearableSource {
    samples: usize,
    seed: u64,
}

#[async_trait]
impl TrainingDataSource for SyntheticWearableSource {
    async fn fetch(&self, version_key: &str) -> FlResult<TrainingData> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let samples = (0..self.samples)
            .map(|_| {
                let hr: f32 = rng.gen_range(0.0..1.0);
                let hrv: f32 = rng.gen_range(0.0..1.0);
                let cadence: f32 = rng.gen_range(0.0..1.0);
                let score = 0.8 * hr - 0.5 * hrv + 0.1 * cadence + rng.gen_range(-0.02..0.02);
                TrainingSample::new(vec![hr, hrv, cadence], score)
            })
            .collect();
        Ok(TrainingData::new(format!("synthetic:{version_key}"), samples))
    }
}

pub struct FederationModule {
    controller: Arc<RoundController>,
}

impl FederationModule {
    /// Wires the controller against an in-process coordinator. The remaining
    /// participants are simulated with pre-trained peer contributions.
    pub fn new(settings: &Settings, session: &FederatedSession) -> Result<Self> {
        let (client_keys, coordinator_keys) = ChannelKeys::generate_pair();
        let me = session.participants().first().cloned().ok_or_else(|| anyhow!("session has no participants"))?;
        let coordinator = Arc::new(LoopbackCoordinator::new(coordinator_keys, &me.0));
        let backend = Arc::new(LinearModel::new(FEATURES));
        seed_peers(&coordinator, session, backend.as_ref());

        let snapshots: Arc<dyn SnapshotStore> = match &settings.controller.snapshot_dir {
            Some(dir) => Arc::new(FileSnapshotStore::new(dir.clone())),
            None => Arc::new(InMemorySnapshotStore::new()),
        };
        let controller = RoundController::new(
            settings.controller.clone(),
            Collaborators {
                backend,
                data_source: Arc::new(SyntheticWearableSource { samples: 512, seed: 11 }),
                transport: coordinator,
                keys: client_keys,
                participant: me.clone(),
                audit: Arc::new(TracingAuditLog),
                snapshots,
                cache: None,
                privacy_seed: None,
                initial_version: ModelVersion::default(),
            },
        );
        info!(participant = %me.0, peers = session.participant_count() - 1, "federation_module_initialized");
        Ok(Self { controller: Arc::new(controller) })
    }

    pub fn controller(&self) -> Arc<RoundController> { self.controller.clone() }

    pub fn shutdown(&self) {
        info!("federation_module_shutdown");
    }
}

fn seed_peers(coordinator: &LoopbackCoordinator, session: &FederatedSession, backend: &dyn NumericBackend) {
    let mut rng = StdRng::seed_from_u64(session.id().as_u128() as u64);
    let layout = backend.initial_weights();
    for round in 0..session.config().max_rounds {
        for _ in 1..session.participant_count() {
            let weights = layout
                .iter()
                .map(|t| Tensor::from_vec((0..t.len()).map(|_| rng.gen_range(-0.05..0.05)).collect()))
                .collect();
            coordinator.submit_peer_update(session.id(), round, ModelUpdate::new(weights, 0.0, 64));
        }
    }
}
