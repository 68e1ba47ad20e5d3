// THEORY:
// This file is the entry point for the `mission_control` library crate. It
// exposes the perceive, track, decide loop of an autonomous vehicle as a small
// public API: feed detection batches in through a `PerceptionSource`, write the
// behavior as a `Mission`, and let a `MissionScheduler` run it to a
// `MissionOutcome`.
//
// The building blocks (`core_modules`) stay public for missions and tests that
// need them directly: the temporal tracker, the timer registry and control
// surface, and the perception and navigation boundaries. `missions` holds the
// concrete behaviors, and `config` the file-backed settings for the runner.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod missions;
pub mod scheduler;

// Re-export the types a typical caller needs.
pub use crate::config::MissionConfig;
pub use crate::core_modules::control::{CompletionHandle, MissionControl, ResetSignal, TickReport};
pub use crate::core_modules::detection::{Detection, DetectionBatch, Geometry, Point};
pub use crate::core_modules::mission::{Mission, Observation};
pub use crate::core_modules::navigation::{CommandLog, NavCommand, NavRoutine, Navigator};
pub use crate::core_modules::perception::{ChannelPerception, PerceptionFeed, PerceptionSource, StreamPerception};
pub use crate::core_modules::tracker::{MatchMetric, TemporalTracker, TrackState, TrackedObject, TrackerConfig};
pub use crate::error::ConfigError;
pub use crate::scheduler::{MissionOutcome, MissionRunState, MissionScheduler, SchedulerConfig};
