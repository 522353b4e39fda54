//! End-to-end tests for the Sentinel pipeline.
//!
//! These tests drive the real ingestion loop over file-backed sources and
//! observe the results through local mock endpoints, the memory database
//! and the recordings directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use axum::{Json, Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use chrono::Utc;
use image::{Rgb, RgbImage};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use sentinel::alerts::{Broadcaster, TelegramProtocol, WebhookProtocol};
use sentinel::detector::{ComputeDevice, Detector, DetectorConfig, RemoteDetector};
use sentinel::frame::{Frame, encode_jpeg, split_jpeg_frames};
use sentinel::model::{BoundingBox, BoxFuture, Detection};
use sentinel::pipeline::{BREACH_TITLE, LOITERING_TITLE, Sentinel};
use sentinel::recorder::{Recorder, RecorderConfig};
use sentinel::storage::SqliteMemory;
use sentinel::stream::{MjpegFileSource, StreamConfig, StreamProcessor, source_from_path};
use sentinel::worker::BackgroundPool;
use sentinel::zone::{ZoneConfig, ZoneEngine, ZoneKind};

static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sentinel-it-{}-{}-{}",
        name,
        std::process::id(),
        DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn solid(value: u8) -> RgbImage {
    RgbImage::from_pixel(32, 24, Rgb([value, value, value]))
}

fn square() -> Vec<[f64; 2]> {
    vec![[0.3, 0.3], [0.7, 0.3], [0.7, 0.7], [0.3, 0.7]]
}

fn recorder(dir: &Path, fps: u32) -> Arc<Recorder> {
    Arc::new(
        Recorder::new(RecorderConfig {
            output_dir: dir.to_path_buf(),
            fps,
            resolution: (32, 24),
            pre_buffer_secs: 1,
            segment_duration_secs: 60,
            jpeg_quality: 90,
            file_prefix: "it".to_string(),
        })
        .unwrap(),
    )
}

fn stream_config(source: &str, fps: u32) -> StreamConfig {
    StreamConfig {
        source: source.to_string(),
        fps,
        read_backoff_ms: 10,
        loop_source: false,
    }
}

/// Collects every JSON body POSTed to it.
async fn spawn_collector(route: &str) -> (String, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));

    async fn collect(
        State(received): State<Arc<Mutex<Vec<Value>>>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        received.lock().await.push(body);
        Json(json!({ "ok": true }))
    }

    let app = Router::new()
        .route(route, post(collect))
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), received)
}

/// Reports a tracked person inside the zone on calls `from..=to`.
struct IntruderDetector {
    calls: AtomicU64,
    from: u64,
    to: u64,
}

impl Detector for IntruderDetector {
    fn detect<'a>(&'a self, _frame: &'a Frame) -> BoxFuture<'a, anyhow::Result<Vec<Detection>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let visible = (self.from..=self.to).contains(&call);
        Box::pin(async move {
            if visible {
                Ok(vec![
                    Detection::new(0, "person", 0.88, BoundingBox::new(0.4, 0.4, 0.5, 0.6))
                        .with_track(11),
                ])
            } else {
                Ok(Vec::new())
            }
        })
    }
}

#[tokio::test]
async fn test_breach_records_alerts_and_remembers() {
    let work = scratch_dir("breach");
    let recordings = work.join("recordings");

    // Ten-frame source clip
    let clip = work.join("feed.mjpeg");
    let mut data = Vec::new();
    for i in 0..10u8 {
        encode_jpeg(&solid(20 + i * 20), 90, &mut data).unwrap();
    }
    fs::write(&clip, data).unwrap();

    let (base, hooks) = spawn_collector("/hook").await;
    let broadcaster = Arc::new(Broadcaster::default());
    broadcaster
        .register(Arc::new(WebhookProtocol::new(&format!("{}/hook", base))))
        .await;

    let memory = Arc::new(SqliteMemory::new("sqlite::memory:").await.unwrap());

    let mut zones = ZoneEngine::new();
    zones.add_zone(ZoneConfig::new(7, "Server Room", square())).unwrap();

    let detector = Arc::new(IntruderDetector {
        calls: AtomicU64::new(0),
        from: 4,
        to: 6,
    });

    let mut sentinel = Sentinel::new("cam-it", detector, zones, recorder(&recordings, 20), broadcaster)
        .with_pool(BackgroundPool::new(4))
        .with_memory(memory.clone());

    let mut processor = StreamProcessor::new(
        Box::new(MjpegFileSource::new(&clip)),
        stream_config(clip.to_str().unwrap(), 20),
    );
    processor.connect().unwrap();
    let summary = processor.run(&mut sentinel).await.unwrap();
    assert_eq!(summary.frames, 10);

    let segment = sentinel.shutdown().await.expect("a segment should be open");

    // Exactly one breach, delivered as the webhook document
    let hooks = hooks.lock().await;
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0]["title"], BREACH_TITLE);
    assert_eq!(hooks[0]["severity"], "high");
    assert_eq!(hooks[0]["metadata"]["camera_id"], "cam-it");
    assert_eq!(hooks[0]["metadata"]["zone_name"], "Server Room");
    assert_eq!(hooks[0]["metadata"]["frame_number"], 4);

    // Three pre-event frames, the trigger and everything after it
    assert_eq!(segment.frames, 10);
    let recorded = fs::read(&segment.path).unwrap();
    assert_eq!(split_jpeg_frames(&recorded).len(), 10);

    // Memory got the three detections and the alert
    let detections = memory
        .query_detections(Some("cam-it"), 1, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(detections.len(), 3);
    assert!(detections.iter().all(|d| d.label == "person"));

    let alerts = memory.recent_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, BREACH_TITLE);

    let _ = fs::remove_dir_all(&work);
}

#[tokio::test]
async fn test_remote_detector_drives_loitering_alert() {
    let work = scratch_dir("loiter");
    let frames_dir = work.join("frames");
    fs::create_dir_all(&frames_dir).unwrap();
    for i in 0..8u8 {
        solid(100 + i).save(frames_dir.join(format!("frame_{:03}.png", i))).unwrap();
    }

    // Inference endpoint that always sees the same tracked person
    let inference = Router::new().route(
        "/detect",
        post(|_upload: Bytes| async {
            (
                StatusCode::OK,
                Json(json!({
                    "detections": [{
                        "class_id": 0, "class_name": "person", "confidence": 0.93,
                        "bbox": [0.45, 0.35, 0.55, 0.65], "track_id": 21
                    }]
                })),
            )
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let inference_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, inference).await.unwrap();
    });

    let detector = RemoteDetector::new(&DetectorConfig {
        endpoint: Some(format!("http://{}/detect", inference_addr)),
        device: ComputeDevice::Cpu,
        ..Default::default()
    })
    .unwrap()
    .with_camera_id("lobby");

    let (bot_base, messages) = spawn_collector("/:bot/sendMessage").await;
    let broadcaster = Arc::new(Broadcaster::default());
    broadcaster
        .register(Arc::new(TelegramProtocol::with_base_url(&bot_base, "42:xyz", "-100")))
        .await;

    let mut zones = ZoneEngine::new();
    zones
        .add_zone(
            ZoneConfig::new(1, "Reception", square())
                .with_kind(ZoneKind::Loitering)
                .with_loiter_threshold(0.1),
        )
        .unwrap();

    let mut sentinel = Sentinel::new(
        "lobby",
        Arc::new(detector),
        zones,
        recorder(&work.join("recordings"), 20),
        broadcaster,
    );

    let source = source_from_path(frames_dir.to_str().unwrap(), false).unwrap();
    let mut processor = StreamProcessor::new(source, stream_config(frames_dir.to_str().unwrap(), 20));
    processor.connect().unwrap();
    let summary = processor.run(&mut sentinel).await.unwrap();
    sentinel.shutdown().await;

    assert_eq!(summary.frames, 8);

    let messages = messages.lock().await;
    assert_eq!(messages.len(), 1);
    let text = messages[0]["text"].as_str().unwrap();
    assert!(text.starts_with("🟠 *"));
    assert!(text.contains(LOITERING_TITLE));
    assert!(text.contains("Unit: lobby"));
    assert_eq!(messages[0]["chat_id"], "-100");

    let _ = fs::remove_dir_all(&work);
}
