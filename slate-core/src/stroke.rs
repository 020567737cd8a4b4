//! Strokes - the elements of the shared drawing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a stroke.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StrokeId(Uuid);

impl StrokeId {
    /// Create a new unique stroke ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for StrokeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StrokeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 2-D point on the drawing surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate (pixels from left).
    pub x: f32,
    /// Y coordinate (pixels from top).
    pub y: f32,
}

impl Point {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A freehand stroke: an ordered run of points plus rendering metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    /// Unique stroke identifier.
    pub id: StrokeId,
    /// The points making up the stroke, in drawing order.
    pub points: Vec<Point>,
    /// Stroke color as a hex string.
    pub color: String,
    /// Stroke width in pixels.
    pub width: f32,
    /// Id of the user who drew the stroke.
    pub user_id: String,
    /// Creation timestamp (ms since epoch).
    pub created_at: u64,
}

impl Stroke {
    /// Create a stroke with a fresh id, timestamped now.
    #[must_use]
    pub fn new(user_id: impl Into<String>, color: impl Into<String>, width: f32) -> Self {
        Self {
            id: StrokeId::new(),
            points: Vec::new(),
            color: color.into(),
            width,
            user_id: user_id.into(),
            created_at: crate::timestamp_now(),
        }
    }

    /// Append a point to the stroke.
    pub fn push_point(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Builder-style: set the points.
    #[must_use]
    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }
}
