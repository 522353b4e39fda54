//! Evidence recorder with pre-event buffering and segment rotation.
//!
//! While idle the recorder keeps the most recent `pre_buffer_secs * fps`
//! frames in a ring buffer. A triggering frame opens a new segment, writes
//! the buffered frames in capture order, then the trigger frame itself.
//! From then on every frame is recorded until [`Recorder::stop`] is called,
//! rotating to a fresh segment whenever the active one reaches the
//! configured duration.
//!
//! Segments are Motion-JPEG files. All elapsed-time decisions use the frame
//! capture timestamps, not the wall clock.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::RecordingError;
use crate::frame::{Frame, encode_jpeg, resize_to};

/// Recorder configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Directory receiving segment files. Created if missing.
    pub output_dir: PathBuf,

    /// Nominal frame rate of the feed.
    pub fps: u32,

    /// Output resolution (width, height). Frames are resized to it.
    pub resolution: (u32, u32),

    /// Seconds of context kept before a trigger.
    pub pre_buffer_secs: u32,

    /// Maximum length of a segment before rotation.
    pub segment_duration_secs: u32,

    /// JPEG quality, 1-100.
    pub jpeg_quality: u8,

    /// Segment filename prefix.
    pub file_prefix: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./recordings"),
            fps: 15,
            resolution: (1280, 720),
            pre_buffer_secs: 5,
            segment_duration_secs: 60,
            jpeg_quality: 85,
            file_prefix: "sentinel_capture".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
}

/// What a single [`Recorder::write`] did with the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Kept in the pre-event buffer.
    Buffered,
    /// Opened a segment, flushed the buffer and wrote the frame.
    Started { path: PathBuf, buffered: usize },
    /// Appended to the active segment.
    Recorded,
    /// Closed the active segment, opened a new one and wrote the frame.
    Rotated { path: PathBuf },
}

/// A segment that has been closed.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub frames: u64,
}

struct Segment {
    writer: BufWriter<File>,
    path: PathBuf,
    started_at: DateTime<Utc>,
    frames: u64,
}

struct RecorderInner {
    buffer: VecDeque<Frame>,
    segment: Option<Segment>,
    sequence: u64,
}

/// Pre-event buffered segment recorder.
///
/// All mutation happens under one lock, so `write` from the tick path and
/// `stop` from a shutdown path may race safely.
pub struct Recorder {
    config: RecorderConfig,
    capacity: usize,
    inner: Mutex<RecorderInner>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Result<Self, RecordingError> {
        fs::create_dir_all(&config.output_dir)?;
        let capacity = (config.pre_buffer_secs as usize) * (config.fps as usize);

        info!(
            output_dir = %config.output_dir.display(),
            fps = config.fps,
            width = config.resolution.0,
            height = config.resolution.1,
            pre_buffer_frames = capacity,
            segment_secs = config.segment_duration_secs,
            "Recorder initialized"
        );

        Ok(Self {
            capacity,
            inner: Mutex::new(RecorderInner {
                buffer: VecDeque::with_capacity(capacity),
                segment: None,
                sequence: 0,
            }),
            config,
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Pre-event buffer capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> Result<RecorderState, RecordingError> {
        let inner = self.lock()?;
        Ok(if inner.segment.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        })
    }

    pub fn buffered_frames(&self) -> Result<usize, RecordingError> {
        Ok(self.lock()?.buffer.len())
    }

    /// Feed one frame.
    ///
    /// `trigger` only matters while idle; once recording, stopping is
    /// explicit. On failure the active segment is abandoned and the
    /// recorder falls back to idle buffering.
    pub fn write(&self, frame: &Frame, trigger: bool) -> Result<WriteOutcome, RecordingError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let Some(segment) = inner.segment.as_mut() else {
            if !trigger {
                self.buffer_frame(&mut inner.buffer, frame);
                return Ok(WriteOutcome::Buffered);
            }
            return self.start_recording(inner, frame);
        };

        let elapsed = frame.captured_at - segment.started_at;
        if elapsed >= Duration::seconds(i64::from(self.config.segment_duration_secs)) {
            if let Some(old) = inner.segment.take() {
                close_segment(old)?;
            }
            let mut segment = self.open_segment(inner, frame.captured_at)?;
            let path = segment.path.clone();
            if let Err(e) = self.write_frame(&mut segment, frame) {
                error!(path = %path.display(), error = %e, "Segment write failed");
                return Err(e);
            }
            inner.segment = Some(segment);
            return Ok(WriteOutcome::Rotated { path });
        }

        if let Err(e) = self.write_frame(segment, frame) {
            error!(path = %segment.path.display(), error = %e, "Segment write failed, recording abandoned");
            inner.segment = None;
            return Err(e);
        }
        Ok(WriteOutcome::Recorded)
    }

    /// Close the active segment, if any, and return to idle.
    pub fn stop(&self) -> Result<Option<SegmentSummary>, RecordingError> {
        let mut inner = self.lock()?;
        match inner.segment.take() {
            Some(segment) => close_segment(segment).map(Some),
            None => Ok(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderInner>, RecordingError> {
        self.inner.lock().map_err(|_| RecordingError::LockPoisoned)
    }

    fn buffer_frame(&self, buffer: &mut VecDeque<Frame>, frame: &Frame) {
        if self.capacity == 0 {
            return;
        }
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(frame.clone());
    }

    fn start_recording(
        &self,
        inner: &mut RecorderInner,
        frame: &Frame,
    ) -> Result<WriteOutcome, RecordingError> {
        // Buffer stays intact if the segment cannot be opened
        let mut segment = self.open_segment(inner, frame.captured_at)?;

        let buffered = inner.buffer.len();
        let written = inner
            .buffer
            .drain(..)
            .chain(std::iter::once(frame.clone()))
            .try_for_each(|f| self.write_frame(&mut segment, &f));

        if let Err(e) = written {
            error!(path = %segment.path.display(), error = %e, "Pre-event flush failed");
            return Err(e);
        }

        debug!(buffered, "Pre-event buffer flushed");
        let path = segment.path.clone();
        inner.segment = Some(segment);
        Ok(WriteOutcome::Started { path, buffered })
    }

    fn open_segment(
        &self,
        inner: &mut RecorderInner,
        started_at: DateTime<Utc>,
    ) -> Result<Segment, RecordingError> {
        inner.sequence += 1;
        let path = segment_path(
            &self.config.output_dir,
            &self.config.file_prefix,
            started_at,
            inner.sequence,
        );

        let file = File::create(&path).map_err(|source| {
            error!(path = %path.display(), error = %source, "Failed to open segment");
            RecordingError::Open {
                path: path.clone(),
                source,
            }
        })?;

        info!(path = %path.display(), "Recording segment opened");
        Ok(Segment {
            writer: BufWriter::new(file),
            path,
            started_at,
            frames: 0,
        })
    }

    fn write_frame(&self, segment: &mut Segment, frame: &Frame) -> Result<(), RecordingError> {
        let resized = resize_to(&frame.image, self.config.resolution);
        encode_jpeg(&resized, self.config.jpeg_quality, &mut segment.writer)?;
        segment.frames += 1;
        Ok(())
    }
}

fn close_segment(mut segment: Segment) -> Result<SegmentSummary, RecordingError> {
    segment.writer.flush()?;
    info!(
        path = %segment.path.display(),
        frames = segment.frames,
        "Recording segment finalized"
    );
    Ok(SegmentSummary {
        path: segment.path,
        started_at: segment.started_at,
        frames: segment.frames,
    })
}

fn segment_path(dir: &Path, prefix: &str, started_at: DateTime<Utc>, sequence: u64) -> PathBuf {
    dir.join(format!(
        "{}_{}_{:04}.mjpeg",
        prefix,
        started_at.format("%Y%m%d_%H%M%S_%3f"),
        sequence
    ))
}
