// THEORY:
// The `scheduler` module is the top-level API of the crate. It runs exactly one
// mission as a cooperative loop and reports how that run ended.
//
// Each cycle does the same thing in the same order:
// 1.  **Reset check**: the externally owned `ResetSignal` is read first. If it
//     is set the run ends as `Reset` and the mission does not step.
// 2.  **Poll**: wait at most `poll_interval` for a detection batch. This is the
//     only await in the loop, so the reset check runs at a bounded cadence.
// 3.  **Track**: every channel in the batch goes through that channel's
//     `TemporalTracker`; the confirmed snapshots become an `Observation`.
// 4.  **Step**: the mission gets the observation, or `None` when no batch
//     arrived (rate-limited by the mission's entity timeout, if it set one).
// 5.  **Tick**: due timers fire.
// 6.  **Settle**: if anything signalled completion during this cycle, the run
//     ends as `Done`.
//
// The loop never propagates an error. Reset and mission failure are both values
// of `MissionOutcome`, and callers have to match on them.

use crate::config;
use crate::core_modules::control::{MissionControl, ResetSignal};
use crate::core_modules::detection::DetectionBatch;
use crate::core_modules::mission::{Mission, Observation};
use crate::core_modules::perception::PerceptionSource;
use crate::core_modules::tracker::{TemporalTracker, TrackerConfig};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Slower than this and a reset would go unnoticed for too long.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Loop cadence and the tracker used for each perception channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on one perception poll, and so on one cycle without a sample.
    #[serde(with = "crate::config::secs")]
    pub poll_interval: Duration,
    /// Channels without an entry here are ignored.
    pub channels: BTreeMap<String, TrackerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            channels: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_channel(mut self, channel: impl Into<String>, tracker: TrackerConfig) -> Self {
        self.channels.insert(channel.into(), tracker);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        config::check_duration("poll_interval", self.poll_interval, MAX_POLL_INTERVAL)?;
        for (name, tracker) in &self.channels {
            tracker.validate().map_err(|err| match err {
                ConfigError::Invalid { field, reason } => {
                    ConfigError::invalid(format!("channels.{name}.{field}"), reason)
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Where a run currently is. Moves left to right exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionRunState {
    Running,
    Done { success: bool },
    Reset,
}

impl MissionRunState {
    /// The final outcome, once the run has ended.
    pub fn outcome(self) -> Option<MissionOutcome> {
        match self {
            Self::Running => None,
            Self::Done { success } => Some(MissionOutcome::Done { success }),
            Self::Reset => Some(MissionOutcome::Reset),
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// How a run ended. `Reset` is an operator abort and is not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionOutcome {
    Done { success: bool },
    Reset,
}

impl MissionOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Done { success: true }
    }

    pub fn is_reset(self) -> bool {
        self == Self::Reset
    }
}

impl From<MissionOutcome> for MissionRunState {
    fn from(outcome: MissionOutcome) -> Self {
        match outcome {
            MissionOutcome::Done { success } => Self::Done { success },
            MissionOutcome::Reset => Self::Reset,
        }
    }
}

/// Drives one mission against one perception source.
pub struct MissionScheduler<M: Mission, P> {
    mission: M,
    perception: P,
    reset: ResetSignal,
    config: SchedulerConfig,
    control: MissionControl<M>,
    trackers: BTreeMap<String, TemporalTracker>,
    state: MissionRunState,
    cycles: u64,
}

impl<M: Mission, P: PerceptionSource> MissionScheduler<M, P> {
    pub fn new(mission: M, perception: P, reset: ResetSignal, config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let trackers = config
            .channels
            .iter()
            .map(|(name, tracker)| TemporalTracker::new(tracker.clone()).map(|tracker| (name.clone(), tracker)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        Ok(Self {
            mission,
            perception,
            reset,
            config,
            control: MissionControl::new(),
            trackers,
            state: MissionRunState::Running,
            cycles: 0,
        })
    }

    /// Runs the mission until it finishes, fails, or is reset. Calling this on
    /// a scheduler that has already ended returns the same outcome again.
    pub async fn run(&mut self) -> MissionOutcome {
        if let Some(outcome) = self.state.outcome() {
            return outcome;
        }

        info!(
            mission = self.mission.name(),
            poll_interval = ?self.config.poll_interval,
            channels = ?self.trackers.keys().collect::<Vec<_>>(),
            "mission started"
        );

        if let Err(err) = self.mission.init(&mut self.control) {
            error!(mission = self.mission.name(), error = %format!("{err:#}"), "mission init failed");
            return self.settle(MissionOutcome::Done { success: false });
        }
        if let Some(success) = self.control.outcome() {
            return self.settle(MissionOutcome::Done { success });
        }

        let mut quiet_since = Instant::now();
        loop {
            if self.reset.is_set() {
                return self.settle(MissionOutcome::Reset);
            }

            let batch = self.perception.poll(self.config.poll_interval).await;
            self.cycles += 1;
            let now = Instant::now();

            match batch {
                Some(batch) => {
                    quiet_since = now;
                    let observation = self.observe(&batch, now);
                    self.mission.step(&mut self.control, Some(&observation));
                }
                None => match self.control.entity_timeout() {
                    None => self.mission.step(&mut self.control, None),
                    Some(timeout) if now.saturating_duration_since(quiet_since) >= timeout => {
                        debug!(mission = self.mission.name(), ?timeout, "entity timeout elapsed");
                        quiet_since = now;
                        self.mission.step(&mut self.control, None);
                    }
                    Some(_) => {}
                },
            }

            self.control.tick(&mut self.mission, Instant::now());

            if let Some(success) = self.control.outcome() {
                return self.settle(MissionOutcome::Done { success });
            }
        }
    }

    fn observe(&mut self, batch: &DetectionBatch, now: Instant) -> Observation {
        let mut observation = Observation::new(now);
        for (channel, detections) in batch.channels() {
            match self.trackers.get_mut(channel) {
                Some(tracker) => {
                    let confirmed = tracker.update(detections, now).to_vec();
                    observation.insert(channel, confirmed);
                }
                None => debug!(channel, count = detections.len(), "no tracker for channel, batch ignored"),
            }
        }
        observation
    }

    fn settle(&mut self, outcome: MissionOutcome) -> MissionOutcome {
        self.state = outcome.into();
        let mission = self.mission.name();
        match outcome {
            MissionOutcome::Done { success: true } => info!(mission, cycles = self.cycles, "mission finished"),
            MissionOutcome::Done { success: false } => info!(mission, cycles = self.cycles, "mission failed"),
            MissionOutcome::Reset => warn!(mission, cycles = self.cycles, "mission reset"),
        }
        outcome
    }

    pub fn state(&self) -> MissionRunState {
        self.state
    }

    /// Completed cycles, i.e. perception polls.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn mission(&self) -> &M {
        &self.mission
    }

    pub fn mission_mut(&mut self) -> &mut M {
        &mut self.mission
    }

    pub fn control(&self) -> &MissionControl<M> {
        &self.control
    }

    pub fn tracker(&self, channel: &str) -> Option<&TemporalTracker> {
        self.trackers.get(channel)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Gives back the mission and perception source.
    pub fn into_parts(self) -> (M, P) {
        (self.mission, self.perception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::Detection;
    use crate::core_modules::perception::{ChannelPerception, PerceptionFeed};

    type Setup = Box<dyn FnOnce(&mut MissionControl<Scripted>) -> anyhow::Result<()>>;

    /// Records what the scheduler did to it.
    #[derive(Default)]
    struct Scripted {
        setup: Option<Setup>,
        finish_after: Option<usize>,
        steps: usize,
        empty_steps: usize,
        observations: Vec<Observation>,
    }

    impl Scripted {
        fn with_setup(setup: impl FnOnce(&mut MissionControl<Scripted>) -> anyhow::Result<()> + 'static) -> Self {
            Self {
                setup: Some(Box::new(setup)),
                ..Self::default()
            }
        }

        fn finishing_after(steps: usize) -> Self {
            Self {
                finish_after: Some(steps),
                ..Self::default()
            }
        }
    }

    impl Mission for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn init(&mut self, control: &mut MissionControl<Self>) -> anyhow::Result<()> {
            match self.setup.take() {
                Some(setup) => setup(control),
                None => Ok(()),
            }
        }

        fn step(&mut self, control: &mut MissionControl<Self>, observation: Option<&Observation>) {
            self.steps += 1;
            match observation {
                Some(observation) => self.observations.push(observation.clone()),
                None => self.empty_steps += 1,
            }
            if self.finish_after == Some(self.steps) {
                control.finish_mission();
            }
        }
    }

    fn gate_config() -> SchedulerConfig {
        SchedulerConfig::default().with_channel("gate", TrackerConfig::default())
    }

    fn scheduler(mission: Scripted, reset: &ResetSignal) -> (PerceptionFeed, MissionScheduler<Scripted, ChannelPerception>) {
        let (feed, perception) = ChannelPerception::new(8);
        let scheduler =
            MissionScheduler::new(mission, perception, reset.clone(), gate_config()).expect("valid config");
        (feed, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn reset_before_first_poll_skips_step() {
        let reset = ResetSignal::new();
        reset.trigger();
        let (_feed, mut scheduler) = scheduler(Scripted::default(), &reset);

        assert_eq!(scheduler.run().await, MissionOutcome::Reset);
        assert_eq!(scheduler.mission().steps, 0);
        assert_eq!(scheduler.cycles(), 0);
        assert_eq!(scheduler.state(), MissionRunState::Reset);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_raised_mid_run_ends_before_next_step() {
        let reset = ResetSignal::new();
        let operator = reset.clone();
        let scripted = Scripted::with_setup(move |control| {
            control.set_timer("abort", Duration::from_millis(200), move |_, _| {
                operator.trigger();
                Ok(())
            });
            Ok(())
        });
        let (_feed, mut scheduler) = scheduler(scripted, &reset);

        assert_eq!(scheduler.run().await, MissionOutcome::Reset);
        assert!(scheduler.cycles() >= 4);
        assert_eq!(scheduler.mission().steps as u64, scheduler.cycles());
    }

    #[tokio::test(start_paused = true)]
    async fn finish_from_step_ends_the_same_cycle() {
        let reset = ResetSignal::new();
        let (_feed, mut scheduler) = scheduler(Scripted::finishing_after(3), &reset);

        assert_eq!(scheduler.run().await, MissionOutcome::Done { success: true });
        assert_eq!(scheduler.cycles(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_from_timer_callback() {
        let reset = ResetSignal::new();
        let scripted = Scripted::with_setup(|control| {
            control.set_timer("done", Duration::from_secs(1), |_, control| {
                control.finish_mission();
                Ok(())
            });
            Ok(())
        });
        let (_feed, mut scheduler) = scheduler(scripted, &reset);

        let start = Instant::now();
        assert!(scheduler.run().await.is_success());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(scheduler.mission().steps > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_from_timer_callback() {
        let reset = ResetSignal::new();
        let scripted = Scripted::with_setup(|control| {
            control.set_timer("timeout", Duration::from_millis(300), |_, control| {
                control.fail_mission();
                Ok(())
            });
            Ok(())
        });
        let (_feed, mut scheduler) = scheduler(scripted, &reset);

        assert_eq!(scheduler.run().await, MissionOutcome::Done { success: false });
    }

    #[tokio::test(start_paused = true)]
    async fn entity_timeout_rate_limits_empty_steps() {
        let reset = ResetSignal::new();
        let scripted = Scripted::with_setup(|control| {
            control.set_entity_timeout(Some(Duration::from_secs(2)));
            control.set_timer("stop", Duration::from_secs(5), |_, control| {
                control.finish_mission();
                Ok(())
            });
            Ok(())
        });
        let (_feed, mut scheduler) = scheduler(scripted, &reset);

        assert!(scheduler.run().await.is_success());
        let scripted = scheduler.mission();
        assert!((2..=3).contains(&scripted.empty_steps), "{} empty steps", scripted.empty_steps);
        assert_eq!(scripted.steps, scripted.empty_steps);
        assert!(scheduler.cycles() >= 90);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_flow_through_the_channel_tracker() {
        let reset = ResetSignal::new();
        let (feed, mut scheduler) = scheduler(Scripted::finishing_after(3), &reset);
        for _ in 0..3 {
            feed.try_send(DetectionBatch::new().with_channel("gate", vec![Detection::at(10.0, -4.0)]))
                .expect("buffer has room");
        }

        assert!(scheduler.run().await.is_success());
        let observations = &scheduler.mission().observations;
        let confirmed: Vec<usize> = observations
            .iter()
            .map(|o| o.channel("gate").map_or(0, |objects| objects.len()))
            .collect();
        assert_eq!(confirmed, [0, 1, 1]);
        assert_eq!(observations[2].channel("gate").expect("gate reported")[0].seen_count, 3);
        assert_eq!(scheduler.tracker("gate").expect("gate tracker").confirmed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_channels_are_ignored() {
        let reset = ResetSignal::new();
        let (feed, mut scheduler) = scheduler(Scripted::finishing_after(1), &reset);
        feed.try_send(DetectionBatch::new().with_channel("buoy", vec![Detection::at(0.0, 0.0)]))
            .expect("buffer has room");

        assert!(scheduler.run().await.is_success());
        assert!(scheduler.mission().observations[0].is_empty());
        assert!(scheduler.tracker("buoy").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_init_fails_the_run() {
        let reset = ResetSignal::new();
        let scripted = Scripted::with_setup(|_| anyhow::bail!("camera not found"));
        let (_feed, mut scheduler) = scheduler(scripted, &reset);

        assert_eq!(scheduler.run().await, MissionOutcome::Done { success: false });
        assert_eq!(scheduler.mission().steps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_scheduler_keeps_its_outcome() {
        let reset = ResetSignal::new();
        let (_feed, mut scheduler) = scheduler(Scripted::finishing_after(2), &reset);

        let outcome = scheduler.run().await;
        let cycles = scheduler.cycles();
        reset.trigger();
        assert_eq!(scheduler.run().await, outcome);
        assert_eq!(scheduler.cycles(), cycles);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_perception_keeps_the_cycle_cadence() {
        let reset = ResetSignal::new();
        let (feed, mut scheduler) = scheduler(Scripted::finishing_after(4), &reset);
        drop(feed);

        let start = Instant::now();
        assert!(scheduler.run().await.is_success());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(250), "{elapsed:?}");
    }

    #[test]
    fn rejects_invalid_configs() {
        let (_feed, perception) = ChannelPerception::new(1);
        let config = SchedulerConfig {
            poll_interval: Duration::ZERO,
            ..gate_config()
        };
        let err = MissionScheduler::new(Scripted::default(), perception, ResetSignal::new(), config).err();
        assert!(matches!(err, Some(ConfigError::Invalid { ref field, .. }) if field == "poll_interval"));

        let (_feed, perception) = ChannelPerception::new(1);
        let config = SchedulerConfig {
            poll_interval: Duration::MAX,
            ..gate_config()
        };
        let err = MissionScheduler::new(Scripted::default(), perception, ResetSignal::new(), config).err();
        assert!(matches!(err, Some(ConfigError::Invalid { ref field, .. }) if field == "poll_interval"));

        let (_feed, perception) = ChannelPerception::new(1);
        let config = SchedulerConfig::default().with_channel(
            "gate",
            TrackerConfig {
                promotion_threshold: 0,
                ..TrackerConfig::default()
            },
        );
        let err = MissionScheduler::new(Scripted::default(), perception, ResetSignal::new(), config).err();
        assert!(matches!(err, Some(ConfigError::Invalid { ref field, .. }) if field == "channels.gate.promotion_threshold"));
    }
}
