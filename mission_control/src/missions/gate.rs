// THEORY:
// The gate mission dives to working depth, drives forward, and keeps the gate
// centred until it has driven through it. "Through" is inferred: once the gate
// has been seen often enough, a long enough run of cycles without it means it
// has passed out of the camera's view. The mission then turns about, backs
// through, turns back, and finishes when the navigator reports that last turn
// done. A mission-wide timer fails the run if the gate is never passed, and a
// second, shorter one fails it if the turn-about never reports done.
//
// Gate centres are expected in pixels relative to the image centre, positive
// to starboard, so `degrees_per_pixel * x` is the bearing correction.

use crate::config::{self, MAX_MISSION_DURATION};
use crate::core_modules::control::MissionControl;
use crate::core_modules::mission::{Mission, Observation};
use crate::core_modules::navigation::{NavCommand, NavRoutine, Navigator};
use crate::core_modules::tracker::TrackedObject;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const MISSION_TIMEOUT_TIMER: &str = "mission_timeout";
const PASS_TIMEOUT_TIMER: &str = "pass_timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateMissionConfig {
    /// Perception channel carrying gate detections.
    pub channel: String,
    pub forward_speed: f64,
    /// Speed used while correcting heading.
    pub slow_forward_speed: f64,
    pub degrees_per_pixel: f64,
    /// Bearing (degrees) under which the gate counts as straight ahead.
    pub straight_tolerance: f64,
    /// Sightings needed before missing cycles count towards "lost".
    pub sightings_before_lost: u32,
    /// Missing cycles tolerated before the gate is considered passed.
    pub lost_patience: u32,
    #[serde(with = "crate::config::secs")]
    pub mission_timeout: Duration,
    #[serde(with = "crate::config::option_secs")]
    pub entity_timeout: Option<Duration>,
    pub depth: f64,
    pub backup_speed: f64,
    #[serde(with = "crate::config::secs")]
    pub backup_time: Duration,
    /// Time the turn-about routine gets to report done before the run fails.
    #[serde(with = "crate::config::secs")]
    pub pass_timeout: Duration,
}

impl Default for GateMissionConfig {
    fn default() -> Self {
        Self {
            channel: "gate".to_owned(),
            forward_speed: 0.5,
            slow_forward_speed: 0.4,
            degrees_per_pixel: 0.10,
            straight_tolerance: 3.0,
            sightings_before_lost: 15,
            lost_patience: 30,
            mission_timeout: Duration::from_secs(120),
            entity_timeout: None,
            depth: 10.0,
            backup_speed: -0.9,
            backup_time: Duration::from_secs(13),
            pass_timeout: Duration::from_secs(45),
        }
    }
}

impl GateMissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::invalid("gate.channel", "must not be empty"));
        }
        for (field, speed) in [
            ("gate.forward_speed", self.forward_speed),
            ("gate.slow_forward_speed", self.slow_forward_speed),
            ("gate.backup_speed", self.backup_speed),
        ] {
            if !(-1.0..=1.0).contains(&speed) {
                return Err(ConfigError::invalid(field, "must be within [-1, 1]"));
            }
        }
        if !self.degrees_per_pixel.is_finite() || self.degrees_per_pixel <= 0.0 {
            return Err(ConfigError::invalid("gate.degrees_per_pixel", "must be positive"));
        }
        if !self.straight_tolerance.is_finite() || self.straight_tolerance < 0.0 {
            return Err(ConfigError::invalid("gate.straight_tolerance", "must not be negative"));
        }
        if !self.depth.is_finite() {
            return Err(ConfigError::invalid("gate.depth", "must be finite"));
        }
        config::check_duration("gate.mission_timeout", self.mission_timeout, MAX_MISSION_DURATION)?;
        if let Some(entity_timeout) = self.entity_timeout {
            config::check_duration("gate.entity_timeout", entity_timeout, MAX_MISSION_DURATION)?;
        }
        config::check_duration("gate.backup_time", self.backup_time, MAX_MISSION_DURATION)?;
        config::check_duration("gate.pass_timeout", self.pass_timeout, MAX_MISSION_DURATION)?;
        if self.pass_timeout <= self.backup_time {
            return Err(ConfigError::invalid("gate.pass_timeout", "must exceed gate.backup_time"));
        }
        Ok(())
    }
}

/// Steers through a gate using one navigator.
#[derive(Debug)]
pub struct GateMission<N> {
    config: GateMissionConfig,
    navigator: N,
    sightings: u32,
    lost_cycles: u32,
    passing: bool,
}

impl<N: Navigator> GateMission<N> {
    pub fn new(config: GateMissionConfig, navigator: N) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            navigator,
            sightings: 0,
            lost_cycles: 0,
            passing: false,
        })
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    pub fn navigator_mut(&mut self) -> &mut N {
        &mut self.navigator
    }

    pub fn sightings(&self) -> u32 {
        self.sightings
    }

    pub fn lost_cycles(&self) -> u32 {
        self.lost_cycles
    }

    /// True once the pass-through routine has been issued.
    pub fn is_passing(&self) -> bool {
        self.passing
    }

    fn steer(&mut self, gate: &TrackedObject) {
        let bearing = self.config.degrees_per_pixel * gate.center().x;
        let command = if bearing.abs() < self.config.straight_tolerance {
            NavCommand::compound([NavCommand::forward(self.config.forward_speed), NavCommand::HoldYaw])
        } else {
            debug!(track_id = gate.id, bearing, "correcting yaw");
            NavCommand::compound([
                NavCommand::RelativeYaw { degrees: bearing },
                NavCommand::forward(self.config.slow_forward_speed),
            ])
        };
        self.navigator.issue(command.into());
    }

    fn pass_through(&mut self, control: &mut MissionControl<Self>) {
        info!(sightings = self.sightings, lost_cycles = self.lost_cycles, "gate passed, turning about");
        self.passing = true;
        control.delete_timer(MISSION_TIMEOUT_TIMER);
        control.set_timer(PASS_TIMEOUT_TIMER, self.config.pass_timeout, |mission: &mut Self, control| {
            warn!(sightings = mission.sightings, "turn-about never completed");
            control.fail_mission();
            Ok(())
        });

        let stop = NavCommand::forward_for(0.0, Duration::from_millis(100));
        let completion = control.completion();
        self.navigator.issue(stop.clone().into());
        self.navigator.issue(NavCommand::compound([stop.clone(), NavCommand::RelativeYaw { degrees: 180.0 }]).into());
        self.navigator
            .issue(NavCommand::forward_for(self.config.backup_speed, self.config.backup_time).into());
        self.navigator.issue(stop.into());
        self.navigator
            .issue(NavRoutine::new(NavCommand::RelativeYaw { degrees: 180.0 }).on_done(move || completion.finish()));
    }
}

/// Largest gate in view. Detections without an area lose to any that have one.
fn nearest_gate(objects: &[TrackedObject]) -> Option<&TrackedObject> {
    objects
        .iter()
        .max_by(|a, b| area(a).total_cmp(&area(b)))
}

fn area(object: &TrackedObject) -> f64 {
    object.geometry.area.unwrap_or(0.0)
}

impl<N: Navigator + 'static> Mission for GateMission<N> {
    fn name(&self) -> &str {
        "gate"
    }

    fn init(&mut self, control: &mut MissionControl<Self>) -> anyhow::Result<()> {
        self.navigator.issue(
            NavCommand::compound([
                NavCommand::forward(0.0),
                NavCommand::HoldYaw,
                NavCommand::SetDepth { depth: self.config.depth },
            ])
            .into(),
        );
        self.navigator.issue(NavCommand::forward(self.config.forward_speed).into());

        control.set_entity_timeout(self.config.entity_timeout);
        control.set_timer(MISSION_TIMEOUT_TIMER, self.config.mission_timeout, |mission: &mut Self, control| {
            warn!(sightings = mission.sightings, "gate mission timed out");
            control.fail_mission();
            Ok(())
        });
        Ok(())
    }

    fn step(&mut self, control: &mut MissionControl<Self>, observation: Option<&Observation>) {
        if self.passing {
            return;
        }

        let gate = observation
            .and_then(|o| o.channel(&self.config.channel))
            .and_then(nearest_gate);

        match gate {
            Some(gate) => {
                self.sightings += 1;
                self.lost_cycles = 0;
                self.steer(gate);
            }
            None if self.sightings >= self.config.sightings_before_lost => {
                self.lost_cycles += 1;
                if self.lost_cycles > self.config.lost_patience {
                    self.pass_through(control);
                }
            }
            None => {}
        }
    }
}
