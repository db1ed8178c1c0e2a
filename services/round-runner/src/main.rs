use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use pulse_core::{init_tracing, FederatedSession, ModelType, ParticipantId, Settings};

mod federation;

use federation::FederationModule;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("round-runner")?;
    let settings = Settings::load()?;
    info!(?settings, "config_loaded");

    let participants: Vec<ParticipantId> = (0..settings.controller.min_participants.max(3))
        .map(|i| ParticipantId(format!("wearable-{i}")))
        .collect();
    let session = FederatedSession::with_min_participants(
        ModelType::HeartRateAnomaly,
        participants,
        settings.federated.clone(),
        settings.controller.min_participants,
    )?;

    let module = FederationModule::new(&settings, &session)?;
    let controller = module.controller();
    let mut run = tokio::spawn(async move { controller.start_training(session).await });

    let report = tokio::select! {
        res = &mut run => res??,
        _ = signal::ctrl_c() => {
            warn!("interrupt received, stopping after the current round");
            module.controller().stop();
            run.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    module.shutdown();
    report.into_result()?;
    Ok(())
}
