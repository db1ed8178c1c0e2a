//! Core of the Pulse federated learning client: session lifecycle, local
//! training, differential privacy, the secure channel and the round
//! controller that drives them.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once per process. `RUST_LOG` drives the
/// filter; `PULSE_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("PULSE_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

pub mod audit;
pub mod backend;
pub mod channel;
pub mod controller;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model_state;
pub mod privacy;
pub mod session;
pub mod settings;
pub mod tensor;
pub mod trainer;
pub mod update;

pub use audit::{AuditLog, InMemoryAuditLog, SecurityEvent, SecurityEventKind, TeeAuditLog, TracingAuditLog};
pub use backend::{BatchGradients, LinearModel, NumericBackend};
pub use channel::{fed_avg, ChannelKeys, Envelope, LoopbackCoordinator, SecureChannelClient, Transport};
pub use controller::{Collaborators, RoundController, TrainingReport};
pub use data::{cache_key, TrainingData, TrainingDataCache, TrainingDataSource, TrainingSample};
pub use error::{ChannelErrorKind, FlError, FlResult};
pub use metrics::{PerformanceMetrics, RoundMetric, FL_METRICS};
pub use model_state::{ApplyOutcome, FileSnapshotStore, InMemorySnapshotStore, ModelSnapshot, ModelStateManager, ModelVersion, SnapshotStore};
pub use privacy::{noise_multiplier, PrivacyEngine};
pub use session::{FederatedConfig, FederatedSession, ModelType, ParticipantId, SessionStatus, MIN_PARTICIPANTS};
pub use settings::{ControllerSettings, Settings};
pub use tensor::Tensor;
pub use trainer::{LocalTrainer, TrainerOptions};
pub use update::ModelUpdate;
