// THEORY:
// The path mission finds a marker on the floor, parks over it and turns to
// follow it. Marker centres arrive in pixels relative to the image centre with
// +y ahead of the vehicle and +x to starboard, so `atan2(x, y)` is the bearing
// to the marker. A distant marker well off the bow is turned towards first.
// Closer in, the mission drives forward, backward or sideways until the marker
// sits under the camera.
//
// A marker is a bar, so its measured angle points along it in one of two
// directions. Once centred, the mission follows whichever end lies nearer the
// configured reference heading. It finishes after holding that end straight
// ahead for enough cycles in a row. A mission-wide timer fails the run if
// that never happens.
//
// Marker angles are radians from straight ahead, positive to starboard.

use crate::config::{self, MAX_MISSION_DURATION};
use crate::core_modules::control::MissionControl;
use crate::core_modules::mission::{Mission, Observation};
use crate::core_modules::navigation::{NavCommand, Navigator};
use crate::core_modules::tracker::TrackedObject;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const MISSION_TIMEOUT_TIMER: &str = "mission_timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathMissionConfig {
    /// Perception channel carrying path marker detections.
    pub channel: String,
    pub depth: f64,
    /// Surge while no marker is in view.
    pub search_speed: f64,
    /// Surge and strafe used to close on the marker.
    pub approach_speed: f64,
    /// Surge at the edge of the centred zone, scaled down towards the middle.
    pub creep_speed: f64,
    /// Pixels from the image centre inside which the marker is under the vehicle.
    pub centered_threshold: f64,
    /// Bearing (degrees) past which a distant marker is turned towards first.
    pub bearing_threshold: f64,
    /// Preferred direction of travel, degrees from the bow.
    pub reference_heading: f64,
    /// Remaining turn (degrees) under which the vehicle counts as aligned.
    pub aligned_tolerance: f64,
    /// Aligned cycles in a row needed to finish.
    pub aligned_cycles: u32,
    #[serde(with = "crate::config::secs")]
    pub mission_timeout: Duration,
    #[serde(with = "crate::config::option_secs")]
    pub entity_timeout: Option<Duration>,
}

impl Default for PathMissionConfig {
    fn default() -> Self {
        Self {
            channel: "path".to_owned(),
            depth: 2.0,
            search_speed: 0.4,
            approach_speed: 0.3,
            creep_speed: 0.1,
            centered_threshold: 60.0,
            bearing_threshold: 50.0,
            reference_heading: 0.0,
            aligned_tolerance: 5.7,
            aligned_cycles: 5,
            mission_timeout: Duration::from_secs(120),
            entity_timeout: None,
        }
    }
}

impl PathMissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::invalid("path.channel", "must not be empty"));
        }
        for (field, speed) in [
            ("path.search_speed", self.search_speed),
            ("path.approach_speed", self.approach_speed),
            ("path.creep_speed", self.creep_speed),
        ] {
            if !(-1.0..=1.0).contains(&speed) {
                return Err(ConfigError::invalid(field, "must be within [-1, 1]"));
            }
        }
        if !self.depth.is_finite() {
            return Err(ConfigError::invalid("path.depth", "must be finite"));
        }
        if !self.centered_threshold.is_finite() || self.centered_threshold <= 0.0 {
            return Err(ConfigError::invalid("path.centered_threshold", "must be positive"));
        }
        if !(self.bearing_threshold > 0.0 && self.bearing_threshold <= 180.0) {
            return Err(ConfigError::invalid("path.bearing_threshold", "must be within (0, 180]"));
        }
        if !self.reference_heading.is_finite() {
            return Err(ConfigError::invalid("path.reference_heading", "must be finite"));
        }
        if !self.aligned_tolerance.is_finite() || self.aligned_tolerance <= 0.0 {
            return Err(ConfigError::invalid("path.aligned_tolerance", "must be positive"));
        }
        if self.aligned_cycles == 0 {
            return Err(ConfigError::invalid("path.aligned_cycles", "must be at least 1"));
        }
        config::check_duration("path.mission_timeout", self.mission_timeout, MAX_MISSION_DURATION)?;
        if let Some(entity_timeout) = self.entity_timeout {
            config::check_duration("path.entity_timeout", entity_timeout, MAX_MISSION_DURATION)?;
        }
        Ok(())
    }
}

/// Wraps an angle into [-180, 180).
fn wrap_degrees(degrees: f64) -> f64 {
    (degrees + 180.0).rem_euclid(360.0) - 180.0
}

/// Centres over a path marker and turns to follow it.
#[derive(Debug)]
pub struct PathMission<N> {
    config: PathMissionConfig,
    navigator: N,
    centered_cycles: u32,
    aligned_cycles: u32,
    done: bool,
}

impl<N: Navigator> PathMission<N> {
    pub fn new(config: PathMissionConfig, navigator: N) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            navigator,
            centered_cycles: 0,
            aligned_cycles: 0,
            done: false,
        })
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    pub fn centered_cycles(&self) -> u32 {
        self.centered_cycles
    }

    pub fn aligned_cycles(&self) -> u32 {
        self.aligned_cycles
    }

    /// True once the vehicle has settled on the marker's heading.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The turn towards the marker end nearer the reference heading, and
    /// whether that is the far end of the measured angle.
    fn choose_end(&self, along: f64) -> (f64, bool) {
        let along = wrap_degrees(along);
        let opposite = wrap_degrees(along + 180.0);
        let off_reference = |degrees: f64| wrap_degrees(degrees - self.config.reference_heading).abs();
        if off_reference(opposite) < off_reference(along) {
            (opposite, true)
        } else {
            (along, false)
        }
    }

    /// Forward and lateral motion that brings the marker under the camera.
    fn approach(&mut self, x: f64, y: f64) -> NavCommand {
        let edge = self.config.centered_threshold;
        let speed = self.config.approach_speed;
        if y > edge {
            self.centered_cycles = 0;
            NavCommand::forward(speed)
        } else if y < -edge {
            self.centered_cycles = 0;
            NavCommand::forward(-speed)
        } else if x.abs() >= edge {
            self.centered_cycles = 0;
            NavCommand::compound([
                NavCommand::forward(self.config.creep_speed * y / edge),
                NavCommand::Strafe {
                    speed: speed.copysign(x),
                },
            ])
        } else {
            self.centered_cycles += 1;
            NavCommand::forward(self.config.creep_speed * y / edge)
        }
    }

    fn settle(&mut self, control: &MissionControl<Self>, marker: &TrackedObject) {
        info!(track_id = marker.id, cycles = self.aligned_cycles, "aligned with path");
        self.done = true;
        self.navigator
            .issue(NavCommand::compound([NavCommand::forward(0.0), NavCommand::HoldYaw]).into());
        control.finish_mission();
    }
}

/// Largest marker in view. Detections without an area lose to any that have one.
fn nearest_marker(objects: &[TrackedObject]) -> Option<&TrackedObject> {
    objects
        .iter()
        .max_by(|a, b| a.geometry.area.unwrap_or(0.0).total_cmp(&b.geometry.area.unwrap_or(0.0)))
}

impl<N: Navigator + 'static> Mission for PathMission<N> {
    fn name(&self) -> &str {
        "path"
    }

    fn init(&mut self, control: &mut MissionControl<Self>) -> anyhow::Result<()> {
        self.navigator.issue(
            NavCommand::compound([
                NavCommand::forward(self.config.search_speed),
                NavCommand::SetDepth { depth: self.config.depth },
            ])
            .into(),
        );

        control.set_entity_timeout(self.config.entity_timeout);
        control.set_timer(MISSION_TIMEOUT_TIMER, self.config.mission_timeout, |mission: &mut Self, control| {
            warn!(centered = mission.centered_cycles, "path mission timed out");
            control.fail_mission();
            Ok(())
        });
        Ok(())
    }

    fn step(&mut self, control: &mut MissionControl<Self>, observation: Option<&Observation>) {
        if self.done {
            return;
        }
        let Some(marker) = observation
            .and_then(|o| o.channel(&self.config.channel))
            .and_then(nearest_marker)
        else {
            return;
        };

        let center = marker.center();
        let bearing = center.x.atan2(center.y).to_degrees();
        let (mut turn, motion) =
            if center.y.abs() >= self.config.centered_threshold && bearing.abs() > self.config.bearing_threshold {
                debug!(track_id = marker.id, bearing, "turning towards path");
                (Some(bearing), NavCommand::forward(self.config.approach_speed))
            } else {
                (None, self.approach(center.x, center.y))
            };

        let mut aligned = false;
        if self.centered_cycles > 0 {
            if let Some(angle) = marker.geometry.angle {
                let (degrees, flipped) = self.choose_end(angle.to_degrees());
                aligned = !flipped && degrees.abs() < self.config.aligned_tolerance;
                turn = Some(degrees);
            }
        }
        self.aligned_cycles = if aligned { self.aligned_cycles + 1 } else { 0 };

        if self.aligned_cycles >= self.config.aligned_cycles {
            self.settle(control, marker);
            return;
        }
        if let Some(degrees) = turn {
            self.navigator.issue(NavCommand::RelativeYaw { degrees }.into());
        }
        self.navigator.issue(motion.into());
    }
}
