//! Runtime configuration.
//!
//! Settings come from an optional JSON file named by `SENTINEL_CONFIG`,
//! then individual `SENTINEL_*` environment variables override single
//! fields:
//!
//! | Variable | Field |
//! |---|---|
//! | `SENTINEL_SOURCE` | `stream.source` |
//! | `SENTINEL_CAMERA_ID` | `camera_id` |
//! | `SENTINEL_FPS` | `stream.fps` and `recorder.fps` |
//! | `SENTINEL_RECORDINGS_DIR` | `recorder.output_dir` |
//! | `SENTINEL_DATABASE_URL` | `memory.database_url` |
//! | `SENTINEL_DETECTOR_URL` | `detector.endpoint` |
//! | `SENTINEL_DEVICE` | `detector.device` |
//! | `SENTINEL_WEBHOOK_URL` | appended to `alerts.webhooks` |
//! | `SENTINEL_TELEGRAM_TOKEN`, `SENTINEL_TELEGRAM_CHAT_ID` | `alerts.telegram` |
//!
//! Unparseable numeric values are ignored and the previous value kept.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detector::DetectorConfig;
use crate::error::ConfigurationError;
use crate::recorder::RecorderConfig;
use crate::stream::StreamConfig;
use crate::zone::{ZoneConfig, ZoneEngine};

/// Default memory database if not specified.
const DEFAULT_DB_URL: &str = "sqlite:sentinel_memory.db?mode=rwc";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Per-protocol dispatch timeout, in seconds.
    pub timeout_secs: u64,

    pub webhooks: Vec<String>,

    pub telegram: Option<TelegramConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            webhooks: Vec::new(),
            telegram: None,
        }
    }
}

impl AlertsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Persist detections and alerts at all.
    pub enabled: bool,

    pub database_url: String,

    /// Rows older than this are purged at startup.
    pub retention_days: u32,

    /// Concurrent background writes.
    pub workers: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: DEFAULT_DB_URL.to_string(),
            retention_days: 7,
            workers: 4,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Unit identifier attached to alerts and stored rows.
    pub camera_id: String,

    pub stream: StreamConfig,

    pub recorder: RecorderConfig,

    pub detector: DetectorConfig,

    pub alerts: AlertsConfig,

    pub memory: MemoryConfig,

    /// Classes whose presence alone starts a recording.
    pub trigger_classes: BTreeSet<String>,

    pub zones: Vec<ZoneConfig>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            camera_id: "cam-01".to_string(),
            stream: StreamConfig::default(),
            recorder: RecorderConfig::default(),
            detector: DetectorConfig::default(),
            alerts: AlertsConfig::default(),
            memory: MemoryConfig::default(),
            trigger_classes: BTreeSet::from(["person".to_string()]),
            zones: Vec::new(),
        }
    }
}

impl SentinelConfig {
    /// Load from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("SENTINEL_CONFIG") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn apply_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(source) = lookup("SENTINEL_SOURCE") {
            self.stream.source = source;
        }
        if let Some(camera_id) = lookup("SENTINEL_CAMERA_ID") {
            self.camera_id = camera_id;
        }
        if let Some(fps) = lookup("SENTINEL_FPS").and_then(|v| v.parse().ok()) {
            self.stream.fps = fps;
            self.recorder.fps = fps;
        }
        if let Some(dir) = lookup("SENTINEL_RECORDINGS_DIR") {
            self.recorder.output_dir = dir.into();
        }
        if let Some(url) = lookup("SENTINEL_DATABASE_URL") {
            self.memory.database_url = url;
        }
        if let Some(url) = lookup("SENTINEL_DETECTOR_URL") {
            self.detector.endpoint = Some(url);
        }
        if let Some(device) = lookup("SENTINEL_DEVICE") {
            match device.parse() {
                Ok(device) => self.detector.device = device,
                Err(e) => warn!(error = %e, "Ignoring SENTINEL_DEVICE"),
            }
        }
        if let Some(url) = lookup("SENTINEL_WEBHOOK_URL") {
            if !self.alerts.webhooks.contains(&url) {
                self.alerts.webhooks.push(url);
            }
        }
        if let (Some(token), Some(chat_id)) = (
            lookup("SENTINEL_TELEGRAM_TOKEN"),
            lookup("SENTINEL_TELEGRAM_CHAT_ID"),
        ) {
            self.alerts.telegram = Some(TelegramConfig { token, chat_id });
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigurationError::InvalidSetting {
                field,
                reason: reason.to_string(),
            })
        };

        if self.stream.fps == 0 {
            return invalid("stream.fps", "must be at least 1");
        }
        if self.recorder.fps == 0 {
            return invalid("recorder.fps", "must be at least 1");
        }
        if self.recorder.resolution.0 == 0 || self.recorder.resolution.1 == 0 {
            return invalid("recorder.resolution", "width and height must be non-zero");
        }
        if !(1..=100).contains(&self.recorder.jpeg_quality) {
            return invalid("recorder.jpeg_quality", "must be within 1..=100");
        }
        if self.recorder.segment_duration_secs == 0 {
            return invalid("recorder.segment_duration_secs", "must be at least 1");
        }
        if self.alerts.timeout_secs == 0 {
            return invalid("alerts.timeout_secs", "must be at least 1");
        }
        if self.memory.workers == 0 {
            return invalid("memory.workers", "must be at least 1");
        }
        let threshold = self.detector.confidence_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return invalid("detector.confidence_threshold", "must be within [0, 1]");
        }

        let mut ids = BTreeSet::new();
        for zone in &self.zones {
            zone.validate()?;
            if !ids.insert(zone.id) {
                return Err(ConfigurationError::DuplicateZone(zone.id));
            }
        }
        Ok(())
    }

    /// Build a zone engine holding every configured zone.
    pub fn zone_engine(&self) -> Result<ZoneEngine, ConfigurationError> {
        let mut engine = ZoneEngine::new();
        for zone in &self.zones {
            engine.add_zone(zone.clone())?;
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ComputeDevice;
    use crate::zone::ZoneKind;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::load_with(env_of(&[])).unwrap();
        assert_eq!(config.stream.fps, 15);
        assert_eq!(config.stream.read_backoff_ms, 1_000);
        assert_eq!(config.recorder.resolution, (1280, 720));
        assert_eq!(config.recorder.pre_buffer_secs, 5);
        assert_eq!(config.recorder.segment_duration_secs, 60);
        assert_eq!(config.recorder.jpeg_quality, 85);
        assert_eq!(config.alerts.timeout(), Duration::from_secs(10));
        assert_eq!(config.memory.workers, 4);
        assert_eq!(config.memory.retention_days, 7);
        assert_eq!(config.memory.database_url, DEFAULT_DB_URL);
        assert!(config.trigger_classes.contains("person"));
        assert!(config.zones.is_empty());
    }

    #[test]
    fn test_environment_overrides() {
        let config = SentinelConfig::load_with(env_of(&[
            ("SENTINEL_SOURCE", "/data/clip.mjpeg"),
            ("SENTINEL_CAMERA_ID", "gate-2"),
            ("SENTINEL_FPS", "10"),
            ("SENTINEL_RECORDINGS_DIR", "/var/sentinel"),
            ("SENTINEL_DETECTOR_URL", "http://127.0.0.1:9000/detect"),
            ("SENTINEL_DEVICE", "cuda"),
            ("SENTINEL_WEBHOOK_URL", "https://hooks.example/alert"),
            ("SENTINEL_TELEGRAM_TOKEN", "123:abc"),
            ("SENTINEL_TELEGRAM_CHAT_ID", "-42"),
        ]))
        .unwrap();

        assert_eq!(config.stream.source, "/data/clip.mjpeg");
        assert_eq!(config.camera_id, "gate-2");
        assert_eq!(config.stream.fps, 10);
        assert_eq!(config.recorder.fps, 10);
        assert_eq!(config.recorder.output_dir, PathBuf::from("/var/sentinel"));
        assert_eq!(config.detector.endpoint.as_deref(), Some("http://127.0.0.1:9000/detect"));
        assert_eq!(config.detector.device, ComputeDevice::Cuda);
        assert_eq!(config.alerts.webhooks, vec!["https://hooks.example/alert"]);
        assert_eq!(config.alerts.telegram.as_ref().unwrap().chat_id, "-42");
    }

    #[test]
    fn test_bad_numeric_override_is_ignored() {
        let config = SentinelConfig::load_with(env_of(&[("SENTINEL_FPS", "fast")])).unwrap();
        assert_eq!(config.stream.fps, 15);
    }

    #[test]
    fn test_telegram_needs_token_and_chat() {
        let config =
            SentinelConfig::load_with(env_of(&[("SENTINEL_TELEGRAM_TOKEN", "123:abc")])).unwrap();
        assert!(config.alerts.telegram.is_none());
    }

    #[test]
    fn test_zero_fps_rejected() {
        let err = SentinelConfig::load_with(env_of(&[("SENTINEL_FPS", "0")])).unwrap_err();
        let err = err.downcast::<ConfigurationError>().unwrap();
        assert!(matches!(
            err,
            ConfigurationError::InvalidSetting { field: "stream.fps", .. }
        ));
    }

    #[test]
    fn test_json_with_zones() {
        let config = SentinelConfig::from_json(
            r#"{
                "camera_id": "lobby",
                "recorder": {"pre_buffer_secs": 2},
                "zones": [
                    {"id": 1, "name": "Desk", "coordinates": [[0.3,0.3],[0.7,0.3],[0.7,0.7]],
                     "kind": "loitering", "loiter_threshold_secs": 12}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.camera_id, "lobby");
        assert_eq!(config.recorder.pre_buffer_secs, 2);
        assert_eq!(config.recorder.fps, 15);
        assert_eq!(config.zones[0].kind, ZoneKind::Loitering);
        config.validate().unwrap();
        assert_eq!(config.zone_engine().unwrap().zones().count(), 1);
    }

    #[test]
    fn test_invalid_zone_fails_validation() {
        let mut config = SentinelConfig::default();
        config.zones.push(ZoneConfig::new(1, "Line", vec![[0.0, 0.0], [1.0, 1.0]]));
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::TooFewVertices { zone_id: 1, count: 2 })
        ));

        config.zones[0] = ZoneConfig::new(1, "A", vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]);
        config.zones.push(config.zones[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::DuplicateZone(1))
        ));
    }

    #[test]
    fn test_config_file_loading() {
        let path = std::env::temp_dir().join(format!("sentinel-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"camera_id": "yard", "stream": {"fps": 5}}"#).unwrap();

        let config = SentinelConfig::load_with(env_of(&[(
            "SENTINEL_CONFIG",
            path.to_str().unwrap(),
        )]))
        .unwrap();

        assert_eq!(config.camera_id, "yard");
        assert_eq!(config.stream.fps, 5);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(
            SentinelConfig::load_with(env_of(&[("SENTINEL_CONFIG", "/no/such/sentinel.json")]))
                .is_err()
        );
    }
}
