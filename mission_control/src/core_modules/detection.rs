// THEORY:
// The `detection` module holds the stateless, per-cycle data that the vision
// subsystem hands to the mission loop. A `Detection` is a snapshot of a single
// object in a single sensing cycle. It has no identity across cycles; giving it
// one is the tracker's job.
//
// Key architectural principles:
// 1.  **Lenient Input**: The vision side is allowed to produce partial samples.
//     Every geometric attribute of a `Detection` is optional. A detection whose
//     reference point is missing or not finite is treated as absent downstream
//     instead of being rejected with an error.
// 2.  **Validated Geometry**: `Detection::geometry` is the single gate between
//     raw samples and tracked state. It yields a `Geometry` only when the
//     mandatory reference point is usable, so the tracker never has to re-check.
// 3.  **Channels**: A `DetectionBatch` groups everything one sensing cycle
//     produced, keyed by channel name ("gate", "path", ...). A channel that is
//     missing from the batch is different from a channel that reported nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// One raw perception sample for one cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Detection {
    /// The reference point of the object. Mandatory for tracking.
    pub center: Option<Point>,
    /// Orientation in radians, if the detector measured one.
    pub angle: Option<f64>,
    /// Polygon corners describing the object's outline, in order.
    pub corners: Option<Vec<Point>>,
    /// Scalar area in square pixels.
    pub area: Option<f64>,
}

impl Detection {
    /// A detection with only a reference point.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            center: Some(Point::new(x, y)),
            ..Self::default()
        }
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = Some(angle);
        self
    }

    pub fn with_area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }

    pub fn with_corners(mut self, corners: Vec<Point>) -> Self {
        self.corners = Some(corners);
        self
    }

    /// Returns the usable geometry of this detection, or `None` if the
    /// mandatory reference point is missing or not finite.
    pub fn geometry(&self) -> Option<Geometry> {
        let center = self.center.filter(Point::is_finite)?;
        Some(Geometry {
            center,
            angle: self.angle.filter(|a| a.is_finite()),
            corners: self.corners.clone().filter(|c| c.iter().all(Point::is_finite)),
            area: self.area.filter(|a| a.is_finite() && *a >= 0.0),
        })
    }
}

/// The validated geometry of a detection, mirrored by a tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub center: Point,
    pub angle: Option<f64>,
    pub corners: Option<Vec<Point>>,
    pub area: Option<f64>,
}

impl Geometry {
    /// Ratio of the longer to the shorter of the first two polygon edges.
    /// Needs at least three corners and non-degenerate edges.
    pub fn aspect_ratio(&self) -> Option<f64> {
        let corners = self.corners.as_ref()?;
        if corners.len() < 3 {
            return None;
        }
        let a = corners[0].distance(&corners[1]);
        let b = corners[1].distance(&corners[2]);
        let (long, short) = if a >= b { (a, b) } else { (b, a) };
        if short <= f64::EPSILON {
            return None;
        }
        Some(long / short)
    }
}

/// Everything the vision subsystem produced for one logical sensing cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    channels: BTreeMap<String, Vec<Detection>>,
}

impl DetectionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `insert`.
    pub fn with_channel(mut self, channel: impl Into<String>, detections: Vec<Detection>) -> Self {
        self.insert(channel, detections);
        self
    }

    /// Sets the detections reported on `channel`, replacing any earlier set.
    pub fn insert(&mut self, channel: impl Into<String>, detections: Vec<Detection>) {
        self.channels.insert(channel.into(), detections);
    }

    /// `None` means the channel did not report this cycle; `Some(&[])` means it
    /// reported zero detections.
    pub fn channel(&self, channel: &str) -> Option<&[Detection]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&str, &[Detection])> {
        self.channels.iter().map(|(name, d)| (name.as_str(), d.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_non_finite_center_has_no_geometry() {
        assert!(Detection::default().geometry().is_none());
        assert!(Detection::at(f64::NAN, 1.0).geometry().is_none());
        assert!(Detection::at(0.0, f64::INFINITY).geometry().is_none());
    }

    #[test]
    fn bad_optional_attributes_are_dropped_not_fatal() {
        let geometry = Detection::at(1.0, 2.0)
            .with_area(-4.0)
            .with_angle(f64::NAN)
            .geometry()
            .expect("center is valid");
        assert_eq!(geometry.center, Point::new(1.0, 2.0));
        assert_eq!(geometry.area, None);
        assert_eq!(geometry.angle, None);
    }

    #[test]
    fn aspect_ratio_from_rectangle_corners() {
        let geometry = Detection::at(0.0, 0.0)
            .with_corners(vec![
                Point::new(0.0, 0.0),
                Point::new(20.0, 0.0),
                Point::new(20.0, 10.0),
                Point::new(0.0, 10.0),
            ])
            .geometry()
            .unwrap();
        assert_eq!(geometry.aspect_ratio(), Some(2.0));
    }

    #[test]
    fn absent_channel_differs_from_empty_channel() {
        let batch = DetectionBatch::new().with_channel("gate", Vec::new());
        assert_eq!(batch.channel("gate"), Some(&[][..]));
        assert_eq!(batch.channel("path"), None);
    }
}
