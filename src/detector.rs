//! Object detection collaborator.
//!
//! The pipeline treats detection as an opaque function from a frame to a
//! list of [`Detection`]s. [`RemoteDetector`] is the stock implementation:
//! it uploads the JPEG-encoded frame to an HTTP inference service and
//! parses the returned boxes.
//!
//! # Device Selection
//!
//! The accelerator the model should run on is an explicit
//! [`ComputeDevice`] in [`DetectorConfig`], forwarded with every request.
//! Nothing is probed from process-wide state.
//!
//! # Wire Format
//!
//! Request: `multipart/form-data` with an `image` part (`frame.jpg`) and the
//! text fields `device`, `confidence_threshold`, `camera_id`, `captured_at`.
//!
//! Response:
//!
//! ```json
//! {"detections": [{"class_id": 0, "class_name": "person", "confidence": 0.91,
//!                  "bbox": [0.40, 0.40, 0.50, 0.60], "track_id": 7}]}
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::{Frame, jpeg_bytes};
use crate::model::{BoundingBox, BoxFuture, Detection};

/// JPEG quality used for inference uploads.
const UPLOAD_JPEG_QUALITY: u8 = 85;

/// Hardware the detection model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda,
    Mps,
}

impl ComputeDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDevice::Cpu => "cpu",
            ComputeDevice::Cuda => "cuda",
            ComputeDevice::Mps => "mps",
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeDevice::Cpu),
            "cuda" | "gpu" => Ok(ComputeDevice::Cuda),
            "mps" => Ok(ComputeDevice::Mps),
            other => bail!("unknown compute device {:?}", other),
        }
    }
}

/// Detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Inference endpoint URL. Required to run the remote detector.
    pub endpoint: Option<String>,

    pub device: ComputeDevice,

    /// Detections below this confidence are discarded.
    pub confidence_threshold: f32,

    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            device: ComputeDevice::Cpu,
            confidence_threshold: 0.5,
            timeout_ms: 5_000,
        }
    }
}

/// Turns a frame into detections.
///
/// Implementations must return normalized boxes; [`sanitize_detections`]
/// is available to enforce that.
pub trait Detector: Send + Sync {
    fn detect<'a>(&'a self, frame: &'a Frame) -> BoxFuture<'a, anyhow::Result<Vec<Detection>>>;
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    class_id: u32,
    class_name: String,
    confidence: f32,
    bbox: [f64; 4],
    #[serde(default)]
    track_id: Option<u64>,
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        let [x1, y1, x2, y2] = wire.bbox;
        Detection {
            class_id: wire.class_id,
            class_name: wire.class_name,
            confidence: wire.confidence,
            bbox: BoundingBox::new(x1, y1, x2, y2),
            track_id: wire.track_id,
        }
    }
}

/// HTTP inference client.
#[derive(Clone)]
pub struct RemoteDetector {
    client: reqwest::Client,
    endpoint: String,
    device: ComputeDevice,
    confidence_threshold: f32,
    camera_id: String,
}

impl RemoteDetector {
    pub fn new(config: &DetectorConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .context("detector endpoint is not configured")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build detector HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            device: config.device,
            confidence_threshold: config.confidence_threshold,
            camera_id: String::new(),
        })
    }

    /// Tag requests with the camera they come from.
    pub fn with_camera_id(mut self, camera_id: &str) -> Self {
        self.camera_id = camera_id.to_string();
        self
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    async fn infer(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        let image = jpeg_bytes(&frame.image, UPLOAD_JPEG_QUALITY).context("failed to encode frame")?;

        let form = Form::new()
            .part(
                "image",
                Part::bytes(image)
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("device", self.device.as_str())
            .text("confidence_threshold", self.confidence_threshold.to_string())
            .text("camera_id", self.camera_id.clone())
            .text("captured_at", frame.captured_at.to_rfc3339());

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .context("inference request failed")?;

        if !response.status().is_success() {
            bail!("inference endpoint returned {}", response.status());
        }

        let body: InferenceResponse = response
            .json()
            .await
            .context("invalid inference response")?;

        let raw: Vec<Detection> = body.detections.into_iter().map(Detection::from).collect();
        let received = raw.len();
        let detections = sanitize_detections(raw, self.confidence_threshold);
        debug!(
            received,
            kept = detections.len(),
            device = %self.device,
            "Inference complete"
        );

        Ok(detections)
    }
}

impl Detector for RemoteDetector {
    fn detect<'a>(&'a self, frame: &'a Frame) -> BoxFuture<'a, anyhow::Result<Vec<Detection>>> {
        Box::pin(self.infer(frame))
    }
}

/// Enforce the detector contract on raw model output.
///
/// Drops detections with a non-finite confidence or box, or a confidence
/// below `threshold`. Remaining boxes are reordered and clamped into the
/// unit square, and confidences clamped to `[0, 1]`.
pub fn sanitize_detections(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter_map(|mut d| {
            if !d.confidence.is_finite() || d.confidence < threshold {
                return None;
            }
            let Some(bbox) = d.bbox.normalized() else {
                warn!(class_name = %d.class_name, "Dropping detection with non-finite box");
                return None;
            };
            d.bbox = bbox;
            d.confidence = d.confidence.clamp(0.0, 1.0);
            Some(d)
        })
        .collect()
}
