// Example runner: drives the gate mission against a simulated gate feed and a
// command log in place of the thrusters. Set `MISSION_CONFIG` to a JSON file
// to override the defaults, and `RUST_LOG` to change verbosity.

use anyhow::{Context, bail};
use mission_control::missions::gate::GateMission;
use mission_control::{
    ChannelPerception, CommandLog, Detection, DetectionBatch, MissionConfig, MissionOutcome, MissionScheduler,
    PerceptionFeed, ResetSignal,
};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SIMULATED_FRAMES: u32 = 400;
const FRAMES_WITH_GATE: u32 = 60;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var_os("MISSION_CONFIG") {
        Some(path) => MissionConfig::load(&path)
            .with_context(|| format!("loading mission config from {}", path.to_string_lossy()))?,
        None => MissionConfig::default(),
    };

    let reset = ResetSignal::new();
    let operator = reset.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, resetting mission");
            operator.trigger();
        }
    });

    let (feed, perception) = ChannelPerception::new(16);
    tokio::spawn(simulate_gate(feed, config.gate.channel.clone(), config.scheduler.poll_interval));

    let mission = GateMission::new(config.gate, CommandLog::auto_completing())?;
    let mut scheduler = MissionScheduler::new(mission, perception, reset, config.scheduler)?;

    match scheduler.run().await {
        MissionOutcome::Done { success: true } => {
            let navigator = scheduler.mission().navigator();
            info!(
                cycles = scheduler.cycles(),
                commands = navigator.issued().len(),
                "gate mission complete"
            );
            Ok(())
        }
        MissionOutcome::Done { success: false } => bail!("gate mission failed after {} cycles", scheduler.cycles()),
        MissionOutcome::Reset => bail!("gate mission reset by operator"),
    }
}

/// Stands in for the vision process: a gate that grows and drifts towards the
/// image centre, then drops out of view as the vehicle passes it.
async fn simulate_gate(feed: PerceptionFeed, channel: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    for frame in 0..SIMULATED_FRAMES {
        ticker.tick().await;
        let detections = if frame < FRAMES_WITH_GATE {
            let progress = f64::from(frame);
            vec![Detection::at(80.0 - progress * 1.5, 10.0).with_area(1_000.0 + progress * 40.0)]
        } else {
            Vec::new()
        };
        if feed
            .send(DetectionBatch::new().with_channel(channel.clone(), detections))
            .await
            .is_err()
        {
            break;
        }
    }
}
