//! Frame ingestion.
//!
//! # Overview
//!
//! [`StreamProcessor`] pulls frames from a [`FrameSource`] one at a time,
//! stamps each with its capture time and hands it to a [`FrameHandler`].
//! The handler is awaited to completion before the next frame is read, so
//! ticks never overlap and frames are processed strictly in capture order.
//! After each tick the loop sleeps out the remainder of the frame budget
//! (`1 / fps`).
//!
//! # Failure Model
//!
//! - Opening the source fails: [`StreamError::Acquisition`] from
//!   [`StreamProcessor::connect`]. Terminal, never retried here.
//! - Reading one frame fails: logged, the loop waits the backoff interval
//!   and tries again.
//! - The source is exhausted: the loop ends normally.
//!
//! The source is released whenever `run` returns.
//!
//! # Sources
//!
//! - [`ImageDirectorySource`]: sorted still images from a directory
//! - [`MjpegFileSource`]: replay of a Motion-JPEG segment file

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::frame::{Frame, MjpegChunk, decode_jpeg, scan_jpeg_frames};

/// A capture source.
///
/// Calls are blocking; sources are expected to return quickly relative to
/// the frame budget.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), StreamError>;

    /// Read the next frame. `Ok(None)` marks the end of the stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, StreamError>;

    fn release(&mut self);

    /// Human-readable identification for logs.
    fn describe(&self) -> String;
}

/// Receives every ingested frame.
pub trait FrameHandler: Send {
    fn on_frame(&mut self, frame: Frame, frame_number: u64) -> impl Future<Output = ()> + Send;
}

/// Ingestion loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Directory of images or path to an `.mjpeg` file.
    pub source: String,

    /// Target frame rate.
    pub fps: u32,

    /// Wait after a failed read, in milliseconds.
    pub read_backoff_ms: u64,

    /// Restart finite sources from the beginning when exhausted.
    pub loop_source: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            fps: 15,
            read_backoff_ms: 1_000,
            loop_source: false,
        }
    }
}

impl StreamConfig {
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

/// Pick a source implementation for `path`.
pub fn source_from_path(path: &str, looping: bool) -> Result<Box<dyn FrameSource>, StreamError> {
    let p = Path::new(path);
    if p.is_dir() {
        return Ok(Box::new(ImageDirectorySource::new(p).looping(looping)));
    }

    match extension(p).as_deref() {
        Some("mjpeg" | "mjpg") => Ok(Box::new(MjpegFileSource::new(p).looping(looping))),
        _ => Err(StreamError::Acquisition {
            source_name: path.to_string(),
            reason: "expected an image directory or an .mjpeg file".to_string(),
        }),
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Still images (`.jpg`, `.jpeg`, `.png`) read in file-name order.
pub struct ImageDirectorySource {
    dir: PathBuf,
    looping: bool,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ImageDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            looping: false,
            files: Vec::new(),
            cursor: 0,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

impl FrameSource for ImageDirectorySource {
    fn open(&mut self) -> Result<(), StreamError> {
        let acquisition = |reason: String| StreamError::Acquisition {
            source_name: self.dir.display().to_string(),
            reason,
        };

        let entries = fs::read_dir(&self.dir).map_err(|e| acquisition(e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| matches!(extension(p).as_deref(), Some("jpg" | "jpeg" | "png")))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(acquisition("no images found".to_string()));
        }

        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, StreamError> {
        if self.files.is_empty() {
            return Err(StreamError::NotConnected);
        }
        if self.cursor >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let path = &self.files[self.cursor];
        self.cursor += 1;

        image::open(path)
            .map(|img| Some(img.to_rgb8()))
            .map_err(|e| StreamError::FrameRead(format!("{}: {}", path.display(), e)))
    }

    fn release(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}

/// Replays a Motion-JPEG file, such as a recorded segment.
pub struct MjpegFileSource {
    path: PathBuf,
    looping: bool,
    data: Vec<u8>,
    frames: Vec<MjpegChunk>,
    cursor: usize,
}

impl MjpegFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            looping: false,
            data: Vec::new(),
            frames: Vec::new(),
            cursor: 0,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

impl FrameSource for MjpegFileSource {
    fn open(&mut self) -> Result<(), StreamError> {
        let data = fs::read(&self.path).map_err(|e| StreamError::Acquisition {
            source_name: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let frames = scan_jpeg_frames(&data);
        if !frames.iter().any(|chunk| matches!(chunk, MjpegChunk::Image(_))) {
            return Err(StreamError::Acquisition {
                source_name: self.path.display().to_string(),
                reason: "no JPEG frames found".to_string(),
            });
        }

        self.data = data;
        self.frames = frames;
        self.cursor = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, StreamError> {
        if self.frames.is_empty() {
            return Err(StreamError::NotConnected);
        }
        if self.cursor >= self.frames.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let chunk = self.frames[self.cursor].clone();
        self.cursor += 1;

        let range = match chunk {
            MjpegChunk::Image(range) => range,
            MjpegChunk::Damaged(range) => {
                return Err(StreamError::FrameRead(format!(
                    "damaged JPEG at bytes {}..{}",
                    range.start, range.end
                )));
            }
        };

        decode_jpeg(&self.data[range])
            .map(Some)
            .map_err(|e| StreamError::FrameRead(e.to_string()))
    }

    fn release(&mut self) {
        self.data = Vec::new();
        self.frames.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        format!("mjpeg:{}", self.path.display())
    }
}

/// Capture timestamps anchored to the wall clock once, then advanced by a
/// monotonic clock, so stamps never go backwards when system time is
/// adjusted mid-session.
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    wall: DateTime<Utc>,
    base: Instant,
}

impl CaptureClock {
    pub fn start() -> Self {
        Self {
            wall: Utc::now(),
            base: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.base.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Requests cooperative cancellation of a running [`StreamProcessor`].
///
/// The flag is checked once per tick; an in-flight tick always completes.
#[derive(Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Counters for one [`StreamProcessor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Frames handed to the handler.
    pub frames: u64,

    /// Failed reads, each followed by a backoff.
    pub read_failures: u64,

    /// Ticks that took longer than the frame budget.
    pub deadline_misses: u64,
}

/// Releases the source on every exit path of `run`.
struct SourceGuard<'a> {
    source: &'a mut Box<dyn FrameSource>,
}

impl Drop for SourceGuard<'_> {
    fn drop(&mut self) {
        self.source.release();
        debug!(source = %self.source.describe(), "Capture source released");
    }
}

/// The ingestion loop.
pub struct StreamProcessor {
    source: Box<dyn FrameSource>,
    config: StreamConfig,
    stop: StopHandle,
    connected: bool,
    frame_count: u64,
}

impl StreamProcessor {
    pub fn new(source: Box<dyn FrameSource>, config: StreamConfig) -> Self {
        Self {
            source,
            config,
            stop: StopHandle::default(),
            connected: false,
            frame_count: 0,
        }
    }

    /// Open the capture source.
    pub fn connect(&mut self) -> Result<(), StreamError> {
        let name = self.source.describe();
        match self.source.open() {
            Ok(()) => {
                info!(source = %name, fps = self.config.fps, "Capture source opened");
                self.connected = true;
                Ok(())
            }
            Err(e) => {
                error!(source = %name, error = %e, "Failed to open capture source");
                self.connected = false;
                Err(e)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Frames delivered since construction.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run until stopped or the source is exhausted.
    pub async fn run<H: FrameHandler>(&mut self, handler: &mut H) -> Result<RunSummary, StreamError> {
        if !self.connected {
            return Err(StreamError::NotConnected);
        }

        let budget = self.config.frame_budget();
        let backoff = self.config.read_backoff();
        let mut summary = RunSummary::default();
        let clock = CaptureClock::start();
        let guard = SourceGuard {
            source: &mut self.source,
        };

        info!(source = %guard.source.describe(), "Ingestion loop started");

        while !self.stop.is_stopped() {
            let tick_start = Instant::now();

            match guard.source.read_frame() {
                Ok(Some(image)) => {
                    self.frame_count += 1;
                    summary.frames += 1;
                    let frame = Frame::new(image, clock.now());

                    handler.on_frame(frame, self.frame_count).await;

                    let elapsed = tick_start.elapsed();
                    if elapsed < budget {
                        tokio::time::sleep(budget - elapsed).await;
                    } else {
                        summary.deadline_misses += 1;
                        debug!(
                            frame_number = self.frame_count,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Tick exceeded frame budget"
                        );
                    }
                }
                Ok(None) => {
                    info!("Capture source exhausted");
                    break;
                }
                Err(e) => {
                    summary.read_failures += 1;
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Frame read failed");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        drop(guard);
        self.connected = false;

        info!(
            frames = summary.frames,
            read_failures = summary.read_failures,
            deadline_misses = summary.deadline_misses,
            "Ingestion loop stopped"
        );

        Ok(summary)
    }
}
