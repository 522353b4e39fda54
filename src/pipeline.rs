//! The per-frame tick.
//!
//! # Overview
//!
//! [`Sentinel`] is the [`FrameHandler`] driven by the ingestion loop. For
//! every frame it runs, in order:
//!
//! 1. detection (awaited, so zone state only ever sees this tick's boxes)
//! 2. zone evaluation
//! 3. recorder write, triggered by a watched class or an `entered` or
//!    `loitering` event
//! 4. alert derivation and broadcast
//! 5. memory persistence, offloaded to the background pool
//!
//! No failure past acquisition stops the loop. A detector error skips zone
//! evaluation for that frame but the frame is still buffered. A recorder
//! error raises one operator alert until recording works again.
//!
//! # Alerts
//!
//! - `entered` on a restricted zone: HIGH "RESTRICTED ZONE BREACH"
//! - `loitering`: MEDIUM "LOITERING DETECTED", once per occupancy interval
//! - recording failure: HIGH "RECORDING FAILURE"

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::alerts::Broadcaster;
use crate::association::TrackKey;
use crate::detector::Detector;
use crate::error::ConfigurationError;
use crate::frame::Frame;
use crate::model::{Alert, AlertSeverity, Detection};
use crate::recorder::{Recorder, SegmentSummary, WriteOutcome};
use crate::storage::MemorySink;
use crate::stream::FrameHandler;
use crate::worker::BackgroundPool;
use crate::zone::{ZoneEngine, ZoneEvent, ZoneEventKind, ZoneKind};

pub const BREACH_TITLE: &str = "RESTRICTED ZONE BREACH";
pub const LOITERING_TITLE: &str = "LOITERING DETECTED";
pub const RECORDING_FAILURE_TITLE: &str = "RECORDING FAILURE";

/// What a single tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickOutcome {
    pub frame_number: u64,

    /// `None` when the detector failed.
    pub detections: Option<usize>,

    pub events: Vec<ZoneEvent>,

    /// Whether this frame asked the recorder to record.
    pub triggered: bool,

    /// Recorder result, `None` on failure.
    #[serde(skip)]
    pub recorded: Option<WriteOutcome>,

    /// Alerts raised this tick.
    pub alerts_raised: usize,

    /// Protocol deliveries that succeeded, summed over the tick's alerts.
    pub deliveries_succeeded: usize,
}

/// Tick handler for one camera.
pub struct Sentinel {
    camera_id: String,
    detector: Arc<dyn Detector>,
    zones: ZoneEngine,
    recorder: Arc<Recorder>,
    broadcaster: Arc<Broadcaster>,
    memory: Option<Arc<dyn MemorySink>>,
    pool: BackgroundPool,
    trigger_classes: BTreeSet<String>,
    loiter_alerted: HashSet<(TrackKey, u32)>,
    recording_failed: bool,
}

impl Sentinel {
    pub fn new(
        camera_id: &str,
        detector: Arc<dyn Detector>,
        zones: ZoneEngine,
        recorder: Arc<Recorder>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            detector,
            zones,
            recorder,
            broadcaster,
            memory: None,
            pool: BackgroundPool::new(4),
            trigger_classes: BTreeSet::from(["person".to_string()]),
            loiter_alerted: HashSet::new(),
            recording_failed: false,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_pool(mut self, pool: BackgroundPool) -> Self {
        self.pool = pool;
        self
    }

    /// Classes whose mere presence starts a recording.
    pub fn with_trigger_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn zones(&self) -> &ZoneEngine {
        &self.zones
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    /// Toggle a zone. Deactivation also forgets pending loitering alerts
    /// for it.
    pub fn set_zone_active(&mut self, zone_id: u32, active: bool) -> Result<(), ConfigurationError> {
        self.zones.set_zone_active(zone_id, active)?;
        if !active {
            self.loiter_alerted.retain(|(_, z)| *z != zone_id);
        }
        Ok(())
    }

    /// Process one frame.
    pub async fn tick(&mut self, frame: Frame, frame_number: u64) -> TickOutcome {
        let mut outcome = TickOutcome {
            frame_number,
            ..Default::default()
        };

        let detections = match self.detector.detect(&frame).await {
            Ok(detections) => Some(detections),
            Err(e) => {
                warn!(camera_id = %self.camera_id, frame_number, error = %e, "Detection failed");
                None
            }
        };

        if let Some(detections) = &detections {
            outcome.detections = Some(detections.len());
            outcome.events = self.zones.process(detections, frame.captured_at);
        }

        outcome.triggered = detections
            .iter()
            .flatten()
            .any(|d| self.trigger_classes.contains(&d.class_name))
            || outcome
                .events
                .iter()
                .any(|e| matches!(e.kind, ZoneEventKind::Entered | ZoneEventKind::Loitering));

        let mut alerts = Vec::new();

        match self.recorder.write(&frame, outcome.triggered) {
            Ok(written) => {
                self.recording_failed = false;
                outcome.recorded = Some(written);
            }
            Err(e) => {
                error!(camera_id = %self.camera_id, frame_number, error = %e, "Recording failed");
                if !self.recording_failed {
                    self.recording_failed = true;
                    alerts.push(
                        Alert::new(
                            RECORDING_FAILURE_TITLE,
                            &format!("Evidence recording stopped: {}", e),
                            AlertSeverity::High,
                        )
                        .at(frame.captured_at)
                        .with_metadata("camera_id", self.camera_id.as_str())
                        .with_metadata("frame_number", frame_number),
                    );
                }
            }
        }

        for event in &outcome.events {
            if let Some(alert) = self.alert_for(event, frame_number) {
                alerts.push(alert);
            }
        }

        outcome.alerts_raised = alerts.len();
        for alert in alerts {
            self.persist_alert(&alert);
            let report = self.broadcaster.notify(alert).await;
            outcome.deliveries_succeeded += report.succeeded;
        }

        if let Some(detections) = detections {
            self.persist_detections(detections, &frame);
        }

        debug!(
            camera_id = %self.camera_id,
            frame_number,
            detections = ?outcome.detections,
            events = outcome.events.len(),
            triggered = outcome.triggered,
            alerts = outcome.alerts_raised,
            "Tick complete"
        );

        outcome
    }

    /// Close any open segment and wait for pending persistence.
    pub async fn shutdown(&self) -> Option<SegmentSummary> {
        let summary = match self.recorder.stop() {
            Ok(summary) => summary,
            Err(e) => {
                error!(camera_id = %self.camera_id, error = %e, "Failed to finalize recording");
                None
            }
        };
        self.pool.wait_idle().await;
        summary
    }

    fn alert_for(&mut self, event: &ZoneEvent, frame_number: u64) -> Option<Alert> {
        let key = (event.track, event.zone_id);

        let alert = match (event.kind, event.zone_kind) {
            (ZoneEventKind::Entered, ZoneKind::Restricted) => Alert::new(
                BREACH_TITLE,
                &format!(
                    "{} entered restricted zone '{}'",
                    event.detection.class_name, event.zone_name
                ),
                AlertSeverity::High,
            ),
            (ZoneEventKind::Loitering, _) => {
                if !self.loiter_alerted.insert(key) {
                    return None;
                }
                Alert::new(
                    LOITERING_TITLE,
                    &format!(
                        "{} has remained in '{}' for {:.1}s",
                        event.detection.class_name,
                        event.zone_name,
                        event.dwell_secs.unwrap_or_default()
                    ),
                    AlertSeverity::Medium,
                )
            }
            (ZoneEventKind::Exited, _) => {
                self.loiter_alerted.remove(&key);
                return None;
            }
            (ZoneEventKind::Entered, ZoneKind::Loitering) => return None,
        };

        let mut alert = alert
            .at(event.timestamp)
            .with_metadata("camera_id", self.camera_id.as_str())
            .with_metadata("zone_id", event.zone_id)
            .with_metadata("zone_name", event.zone_name.as_str())
            .with_metadata("track", event.track.to_string())
            .with_metadata("class_name", event.detection.class_name.as_str())
            .with_metadata("confidence", f64::from(event.detection.confidence))
            .with_metadata("frame_number", frame_number);
        if let Some(dwell) = event.dwell_secs {
            alert = alert.with_metadata("dwell_secs", dwell);
        }
        Some(alert)
    }

    fn persist_alert(&self, alert: &Alert) {
        let Some(memory) = &self.memory else {
            return;
        };
        let memory = Arc::clone(memory);
        let camera_id = self.camera_id.clone();
        let alert = alert.clone();

        self.pool.submit("save_alert", async move {
            if let Err(e) = memory.save_alert(&camera_id, &alert).await {
                warn!(camera_id = %camera_id, error = %e, "Failed to persist alert");
            }
        });
    }

    fn persist_detections(&self, detections: Vec<Detection>, frame: &Frame) {
        let Some(memory) = &self.memory else {
            return;
        };
        if detections.is_empty() {
            return;
        }
        let memory = Arc::clone(memory);
        let camera_id = self.camera_id.clone();
        let captured_at = frame.captured_at;

        self.pool.submit("save_detections", async move {
            for detection in &detections {
                if let Err(e) = memory.save_detection(&camera_id, detection, captured_at).await {
                    warn!(camera_id = %camera_id, error = %e, "Failed to persist detection");
                    break;
                }
            }
        });
    }
}

impl FrameHandler for Sentinel {
    async fn on_frame(&mut self, frame: Frame, frame_number: u64) {
        self.tick(frame, frame_number).await;
    }
}
