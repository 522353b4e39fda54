//! Data models for Sentinel.
//!
//! # Coordinate Conventions
//!
//! All spatial values handled by the pipeline are **normalized** to the frame:
//!
//! - `x` grows to the right, `y` grows downwards
//! - `(0, 0)` is the top-left corner, `(1, 1)` the bottom-right corner
//! - Bounding boxes satisfy `x1 <= x2` and `y1 <= y2`
//!
//! Keeping everything normalized lets zones be configured once and reused
//! regardless of the capture resolution.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A boxed, sendable future.
///
/// Used at the trait seams that need dynamic dispatch over async work
/// (alert protocols, detectors, memory sinks).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Axis-aligned bounding box in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f64,

    /// Top edge.
    pub y1: f64,

    /// Right edge.
    pub x2: f64,

    /// Bottom edge.
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Bottom-center of the box, the ground-contact approximation used for
    /// zone containment.
    pub fn contact_point(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    /// Whether all coordinates are finite, inside `[0, 1]` and ordered.
    pub fn is_normalized(&self) -> bool {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        coords
            .iter()
            .all(|c| c.is_finite() && (0.0..=1.0).contains(c))
            && self.x1 <= self.x2
            && self.y1 <= self.y2
    }

    /// Reorder the corners and clamp them into `[0, 1]`.
    ///
    /// Returns `None` when any coordinate is not finite.
    pub fn normalized(&self) -> Option<Self> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return None;
        }

        let clamp = |v: f64| v.clamp(0.0, 1.0);
        Some(Self {
            x1: clamp(self.x1.min(self.x2)),
            y1: clamp(self.y1.min(self.y2)),
            x2: clamp(self.x1.max(self.x2)),
            y2: clamp(self.y1.max(self.y2)),
        })
    }

    pub fn area(&self) -> f64 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// A single object detected in one frame.
///
/// Produced once per tick by the detector collaborator and owned by the
/// tick handler for the duration of that tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Numeric class identifier as reported by the model.
    pub class_id: u32,

    /// Human-readable class label, e.g. "person".
    pub class_name: String,

    /// Model confidence in `[0, 1]`.
    pub confidence: f32,

    /// Normalized bounding box.
    pub bbox: BoundingBox,

    /// Stable identity assigned by an upstream tracker, if any.
    #[serde(default)]
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(class_id: u32, class_name: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.to_string(),
            confidence,
            bbox,
            track_id: None,
        }
    }

    /// Attach an upstream track identity.
    pub fn with_track(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }
}

/// Alert severity levels, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    /// Marker shown in front of chat messages.
    pub fn icon(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "ℹ️",
            AlertSeverity::Low => "🟡",
            AlertSeverity::Medium => "🟠",
            AlertSeverity::High => "🔴",
            AlertSeverity::Critical => "🚨",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert raised by the tick handler and handed to the broadcaster.
///
/// The core never persists alerts itself; the memory sink receives a copy.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Short headline.
    pub title: String,

    /// Human-readable description.
    pub message: String,

    /// Urgency of the alert.
    pub severity: AlertSeverity,

    /// Free-form context (camera, zone, track, ...).
    pub metadata: Map<String, Value>,

    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(title: &str, message: &str, severity: AlertSeverity) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            severity,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp (alerts raised from a frame carry its capture time).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Unit identifier shown to operators, taken from the `camera_id` metadata.
    pub fn unit(&self) -> Option<String> {
        match self.metadata.get("camera_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}
