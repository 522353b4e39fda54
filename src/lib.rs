//! Sentinel - zone-aware video surveillance core.
//!
//! # Overview
//!
//! Sentinel ingests a video feed one frame at a time. Each frame runs
//! through a single tick: the detector produces boxes, the zone engine turns
//! them into occupancy transitions, the recorder decides whether to start
//! capturing evidence (with a few seconds of pre-event context), and alerts
//! fan out to every configured delivery channel.
//!
//! Frames are processed strictly in capture order and one tick completes
//! before the next frame is read. Only failing to open the capture source
//! ends a session; detector, recorder, alert and persistence failures are
//! contained and logged.
//!
//! # Modules
//!
//! - [`model`]: Detections, bounding boxes and alerts
//! - [`frame`]: Frames and Motion-JPEG helpers
//! - [`zone`]: Polygon zones and the occupancy / loitering state machine
//! - [`association`]: Track identities for detections without one
//! - [`recorder`]: Pre-event buffered segment recorder
//! - [`alerts`]: Alert broadcaster and delivery protocols
//! - [`detector`]: Detection collaborator
//! - [`storage`]: Detection and alert memory
//! - [`worker`]: Bounded background execution
//! - [`stream`]: Frame sources and the ingestion loop
//! - [`pipeline`]: The per-frame tick handler
//! - [`config`]: Runtime configuration

pub mod alerts;
pub mod association;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod model;
pub mod pipeline;
pub mod recorder;
pub mod storage;
pub mod stream;
pub mod worker;
pub mod zone;
