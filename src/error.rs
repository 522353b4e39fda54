//! Error taxonomy for Sentinel.
//!
//! Only acquisition failures end a session. Everything else is contained by
//! the component that raised it and reported upwards so the pipeline keeps
//! ingesting frames.

use std::path::PathBuf;
use std::time::Duration;

/// Invalid zone or pipeline configuration, rejected before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("zone {zone_id}: polygon needs at least 3 vertices, got {count}")]
    TooFewVertices { zone_id: u32, count: usize },

    #[error("zone {zone_id}: vertex {index} ({x}, {y}) is outside the normalized range [0, 1]")]
    VertexOutOfRange {
        zone_id: u32,
        index: usize,
        x: f64,
        y: f64,
    },

    #[error("zone {zone_id}: loiter threshold must be a positive number of seconds, got {value}")]
    InvalidLoiterThreshold { zone_id: u32, value: f64 },

    #[error("zone {zone_id}: at least one detection class is required")]
    EmptyClassSet { zone_id: u32 },

    #[error("zone {zone_id}: color {color:?} is not of the form #RRGGBB")]
    InvalidColor { zone_id: u32, color: String },

    #[error("zone {0} is already registered")]
    DuplicateZone(u32),

    #[error("zone {0} is not registered")]
    UnknownZone(u32),

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Capture source failures.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The source could not be opened. Terminal for the session.
    #[error("failed to acquire source {source_name}: {reason}")]
    Acquisition { source_name: String, reason: String },

    /// A single frame could not be read. Recoverable.
    #[error("frame read failed: {0}")]
    FrameRead(String),

    #[error("stream is not connected")]
    NotConnected,
}

/// Segment open/write failures. Recording degrades, ingestion continues.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("failed to open segment {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("recorder lock poisoned")]
    LockPoisoned,
}

/// Failure of a single alert protocol. Isolated to that protocol.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint rejected alert with status {status}")]
    Rejected { status: u16 },

    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}
