// Core domain types shared between the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Public view of a room participant, as carried by presence events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// A chat message as accepted by a room. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned box used by shapes and text objects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    /// Distance from `point` to the nearest edge of the box, or 0 when inside.
    pub fn distance_to(&self, point: Point) -> f64 {
        let (min_x, max_x) = ordered(self.x, self.x + self.width);
        let (min_y, max_y) = ordered(self.y, self.y + self.height);
        let dx = (min_x - point.x).max(0.0).max(point.x - max_x);
        let dy = (min_y - point.y).max(0.0).max(point.y - max_y);
        (dx * dx + dy * dy).sqrt()
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Pen,
    Line,
    Rectangle,
    Ellipse,
    Text,
}

/// Geometric/visual payload of one whiteboard object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawData {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ShapeKind,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub width: f64,
}

fn default_color() -> String {
    "#000000".to_string()
}

fn default_stroke_width() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DrawDataError {
    #[error("drawData.id must not be empty")]
    MissingId,
    #[error("drawData.width must be a positive finite number")]
    InvalidWidth,
    #[error("drawData contains a non-finite coordinate")]
    NonFiniteCoordinate,
    #[error("drawData must carry points or bounds")]
    NoGeometry,
}

impl DrawData {
    pub fn validate(&self) -> Result<(), DrawDataError> {
        if self.id.trim().is_empty() {
            return Err(DrawDataError::MissingId);
        }
        if !self.width.is_finite() || self.width <= 0.0 {
            return Err(DrawDataError::InvalidWidth);
        }
        let points_finite = self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite());
        let bounds_finite = self.bounds.map_or(true, |b| {
            b.x.is_finite() && b.y.is_finite() && b.width.is_finite() && b.height.is_finite()
        });
        if !points_finite || !bounds_finite {
            return Err(DrawDataError::NonFiniteCoordinate);
        }
        if self.points.is_empty() && self.bounds.is_none() {
            return Err(DrawDataError::NoGeometry);
        }
        Ok(())
    }

    /// True when any part of the object lies within `radius` of `center`.
    ///
    /// Strokes are tested segment by segment so a fast pen stroke with
    /// sparse points is still hit between its samples.
    pub fn hit_test(&self, center: Point, radius: f64) -> bool {
        if let Some(bounds) = self.bounds {
            if bounds.distance_to(center) <= radius {
                return true;
            }
        }

        match self.points.as_slice() {
            [] => false,
            [only] => distance(*only, center) <= radius,
            points => points
                .windows(2)
                .any(|pair| segment_distance(pair[0], pair[1], center) <= radius),
        }
    }
}

fn distance(a: Point, b: Point) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

fn segment_distance(start: Point, end: Point, point: Point) -> f64 {
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let length_sq = dx * dx + dy * dy;
    if length_sq == 0.0 {
        return distance(start, point);
    }
    let t = (((point.x - start.x) * dx + (point.y - start.y) * dy) / length_sq).clamp(0.0, 1.0);
    distance(Point { x: start.x + t * dx, y: start.y + t * dy }, point)
}

/// Pointer position on the shared whiteboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}
