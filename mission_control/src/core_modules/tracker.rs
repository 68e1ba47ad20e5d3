// THEORY:
// The `tracker` module adds "object permanence" to the mission loop. It takes
// the stateless list of `Detection`s from one sensing cycle and associates them
// with the objects it has been following across earlier cycles.
//
// Key architectural principles:
// 1.  **Hysteresis**: A new object is born as a `Candidate` and only becomes
//     `Confirmed` once it has been matched often enough. Missions only ever see
//     confirmed objects, so a single noisy frame cannot steer the vehicle.
// 2.  **Survival Score**: Every object carries a bounded health counter. A match
//     boosts it, a missed cycle decays it. Candidates decay faster than
//     confirmed objects so a confirmed track rides out brief occlusion.
// 3.  **Greedy Association**: Each detection takes the first object within the
//     gate, candidates first, then confirmed, both in insertion order. This is
//     deliberately not an optimal assignment. It is cheap, predictable, and
//     order-dependent: if two detections land on the same object in one cycle,
//     the later one is dropped.
// 4.  **Stable Identity**: Ids come from a monotonically increasing counter and
//     are never reused, so an expired object can never "come back" under its old
//     id on an unrelated detection.

use crate::core_modules::detection::{Detection, Geometry, Point};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How the spatial gate between a tracked object and a detection is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMetric {
    /// Euclidean distance between reference points.
    #[default]
    Euclidean,
    /// Both |dx| and |dy| must be under the threshold.
    PerAxis,
}

/// Tunable tracker behavior. The reference values are a starting point; each
/// entity type is expected to bring its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Max distance (in pixels) for a detection to match an object.
    pub distance_threshold: f64,
    pub metric: MatchMetric,
    /// Optional gate on area: larger / smaller must not exceed this.
    pub max_area_ratio: Option<f64>,
    /// Optional gate on shape: aspect ratios may differ by at most this much.
    pub max_aspect_delta: Option<f64>,
    /// `seen_count` at which a candidate is promoted.
    pub promotion_threshold: u32,
    /// Amount `seen_count` grows per match.
    pub seen_step: u32,
    pub initial_survival: f64,
    pub match_boost: f64,
    pub max_survival: f64,
    /// Survival lost per unmatched cycle while a candidate.
    pub candidate_decay: f64,
    /// Survival lost per unmatched cycle once confirmed.
    pub confirmed_decay: f64,
    /// Objects whose survival score falls below this are removed.
    pub expiry_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 25.0,
            metric: MatchMetric::Euclidean,
            max_area_ratio: None,
            max_aspect_delta: None,
            promotion_threshold: 2,
            seen_step: 1,
            initial_survival: 3.0,
            match_boost: 3.0,
            max_survival: 6.0,
            candidate_decay: 2.0,
            confirmed_decay: 1.0,
            expiry_threshold: 1.0,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scalars = [
            ("distance_threshold", self.distance_threshold),
            ("initial_survival", self.initial_survival),
            ("match_boost", self.match_boost),
            ("max_survival", self.max_survival),
            ("candidate_decay", self.candidate_decay),
            ("confirmed_decay", self.confirmed_decay),
            ("expiry_threshold", self.expiry_threshold),
        ];
        if let Some((field, _)) = scalars.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::invalid(*field, "must be finite"));
        }

        if self.distance_threshold <= 0.0 {
            return Err(ConfigError::invalid("distance_threshold", "must be greater than zero"));
        }
        if self.promotion_threshold == 0 {
            return Err(ConfigError::invalid("promotion_threshold", "must be at least 1"));
        }
        if self.seen_step == 0 {
            return Err(ConfigError::invalid("seen_step", "must be at least 1"));
        }
        if self.max_survival <= 0.0 {
            return Err(ConfigError::invalid("max_survival", "must be greater than zero"));
        }
        if self.expiry_threshold < 0.0 {
            return Err(ConfigError::invalid("expiry_threshold", "must not be negative"));
        }
        if self.initial_survival < self.expiry_threshold || self.initial_survival > self.max_survival {
            return Err(ConfigError::invalid(
                "initial_survival",
                "must lie between expiry_threshold and max_survival",
            ));
        }
        if self.match_boost < 0.0 {
            return Err(ConfigError::invalid("match_boost", "must not be negative"));
        }
        if self.confirmed_decay < 0.0 {
            return Err(ConfigError::invalid("confirmed_decay", "must not be negative"));
        }
        if self.candidate_decay <= self.confirmed_decay {
            return Err(ConfigError::invalid(
                "candidate_decay",
                "must be greater than confirmed_decay",
            ));
        }
        if let Some(ratio) = self.max_area_ratio {
            if !(ratio.is_finite() && ratio >= 1.0) {
                return Err(ConfigError::invalid("max_area_ratio", "must be a finite value >= 1"));
            }
        }
        if let Some(delta) = self.max_aspect_delta {
            if !(delta.is_finite() && delta >= 0.0) {
                return Err(ConfigError::invalid("max_aspect_delta", "must be a finite value >= 0"));
            }
        }
        Ok(())
    }

    /// The spatial gate plus the optional size and shape gates. Secondary
    /// gates only apply when both sides carry the attribute.
    fn matches(&self, tracked: &Geometry, incoming: &Geometry) -> bool {
        let close = match self.metric {
            MatchMetric::Euclidean => {
                tracked.center.distance(&incoming.center) < self.distance_threshold
            }
            MatchMetric::PerAxis => {
                (tracked.center.x - incoming.center.x).abs() < self.distance_threshold
                    && (tracked.center.y - incoming.center.y).abs() < self.distance_threshold
            }
        };
        if !close {
            return false;
        }

        if let (Some(limit), Some(a), Some(b)) = (self.max_area_ratio, tracked.area, incoming.area) {
            let (large, small) = if a >= b { (a, b) } else { (b, a) };
            if small <= f64::EPSILON {
                if large > f64::EPSILON {
                    return false;
                }
            } else if large / small > limit {
                return false;
            }
        }

        if let (Some(limit), Some(a), Some(b)) =
            (self.max_aspect_delta, tracked.aspect_ratio(), incoming.aspect_ratio())
        {
            if (a - b).abs() > limit {
                return false;
            }
        }

        true
    }
}

/// Lifecycle state of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Candidate,
    Confirmed,
}

/// An object followed across cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    /// Unique for the lifetime of the tracker; never reused.
    pub id: u64,
    /// Geometry of the most recent matching detection.
    pub geometry: Geometry,
    pub seen_count: u32,
    pub survival_score: f64,
    pub state: TrackState,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl TrackedObject {
    fn spawn(id: u64, geometry: Geometry, now: Instant, config: &TrackerConfig) -> Self {
        Self {
            id,
            geometry,
            seen_count: 1,
            survival_score: config.initial_survival,
            state: TrackState::Candidate,
            first_seen: now,
            last_seen: now,
        }
    }

    fn absorb(&mut self, geometry: Geometry, now: Instant, config: &TrackerConfig) {
        self.geometry = geometry;
        self.seen_count = self.seen_count.saturating_add(config.seen_step);
        self.survival_score = (self.survival_score + config.match_boost).min(config.max_survival);
        self.last_seen = now;
    }

    pub fn center(&self) -> Point {
        self.geometry.center
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }
}

/// What happened during the most recent `update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub matched: usize,
    pub spawned: usize,
    /// Detections that landed on an object already updated this cycle.
    pub dropped: usize,
    /// Detections without usable geometry.
    pub malformed: usize,
    pub promoted: usize,
    pub expired: usize,
}

/// Maintains the candidate and confirmed sets from one cycle to the next.
#[derive(Debug, Clone)]
pub struct TemporalTracker {
    config: TrackerConfig,
    candidates: Vec<TrackedObject>,
    confirmed: Vec<TrackedObject>,
    next_id: u64,
    last_cycle: CycleStats,
}

impl TemporalTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            candidates: Vec::new(),
            confirmed: Vec::new(),
            next_id: 1,
            last_cycle: CycleStats::default(),
        })
    }

    /// Feeds one cycle's detections through the tracker and returns the
    /// confirmed set.
    pub fn update(&mut self, detections: &[Detection], now: Instant) -> &[TrackedObject] {
        let config = &self.config;
        let mut stats = CycleStats::default();
        let mut touched: HashSet<u64> = HashSet::new();
        let mut births: Vec<Geometry> = Vec::new();

        // --- 1. Matching ---
        for detection in detections {
            let Some(geometry) = detection.geometry() else {
                stats.malformed += 1;
                continue;
            };

            let hit = self
                .candidates
                .iter_mut()
                .chain(self.confirmed.iter_mut())
                .find(|object| config.matches(&object.geometry, &geometry));

            match hit {
                Some(object) if touched.contains(&object.id) => {
                    trace!(track_id = object.id, "detection dropped, object already updated");
                    stats.dropped += 1;
                }
                // --- 2. State Updating ---
                Some(object) => {
                    object.absorb(geometry, now, config);
                    touched.insert(object.id);
                    stats.matched += 1;
                }
                None => births.push(geometry),
            }
        }

        // --- 3. Birth ---
        for geometry in births {
            let id = self.next_id;
            self.next_id += 1;
            debug!(track_id = id, x = geometry.center.x, y = geometry.center.y, "candidate spawned");
            self.candidates.push(TrackedObject::spawn(id, geometry, now, config));
            touched.insert(id);
            stats.spawned += 1;
        }

        // --- 4. Decay ---
        // Scores are not floored at zero here: an object whose score would go
        // negative is always below the (non-negative) expiry threshold.
        for object in self.candidates.iter_mut().filter(|o| !touched.contains(&o.id)) {
            object.survival_score -= config.candidate_decay;
        }
        for object in self.confirmed.iter_mut().filter(|o| !touched.contains(&o.id)) {
            object.survival_score -= config.confirmed_decay;
        }

        // --- 5. Promotion ---
        let (promoted, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.candidates)
            .into_iter()
            .partition(|o| o.seen_count >= config.promotion_threshold);
        self.candidates = waiting;
        for mut object in promoted {
            object.state = TrackState::Confirmed;
            debug!(track_id = object.id, seen_count = object.seen_count, "candidate confirmed");
            stats.promoted += 1;
            self.confirmed.push(object);
        }

        // --- 6. Expiry ---
        let floor = config.expiry_threshold;
        for set in [&mut self.candidates, &mut self.confirmed] {
            set.retain(|object| {
                let alive = object.survival_score >= floor;
                if !alive {
                    debug!(track_id = object.id, state = ?object.state, "object expired");
                    stats.expired += 1;
                }
                alive
            });
        }

        trace!(
            matched = stats.matched,
            spawned = stats.spawned,
            dropped = stats.dropped,
            malformed = stats.malformed,
            promoted = stats.promoted,
            expired = stats.expired,
            confirmed = self.confirmed.len(),
            candidates = self.candidates.len(),
            "tracker cycle"
        );
        self.last_cycle = stats;
        &self.confirmed
    }

    pub fn confirmed(&self) -> &[TrackedObject] {
        &self.confirmed
    }

    pub fn candidates(&self) -> &[TrackedObject] {
        &self.candidates
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.candidates.iter().chain(self.confirmed.iter()).find(|o| o.id == id)
    }

    pub fn last_cycle(&self) -> CycleStats {
        self.last_cycle
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Forgets every object. Ids keep counting up.
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.confirmed.clear();
    }
}
