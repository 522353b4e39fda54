//! Detection and alert memory.
//!
//! # Overview
//!
//! The pipeline forwards every detection and every raised alert to a
//! [`MemorySink`]. Writes are at-most-once and fire-and-forget: the caller
//! logs failures and moves on.
//!
//! [`SqliteMemory`] is the stock sink. Its schema is deliberately flat:
//!
//! - `detections`: camera, label, confidence, box as JSON, capture time
//! - `alerts`: camera, title, message, severity, raise time
//!
//! Timestamps are Unix seconds.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::model::{Alert, BoundingBox, BoxFuture, Detection};

/// Destination for detections and alerts produced by the pipeline.
pub trait MemorySink: Send + Sync {
    fn save_detection<'a>(
        &'a self,
        camera_id: &'a str,
        detection: &'a Detection,
        captured_at: DateTime<Utc>,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn save_alert<'a>(&'a self, camera_id: &'a str, alert: &'a Alert)
    -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A detection read back from memory.
#[derive(Debug, Clone, Serialize)]
pub struct StoredDetection {
    pub camera_id: String,
    pub label: String,
    pub confidence: f64,
    pub bbox: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
}

/// An alert read back from memory.
#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub camera_id: String,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub timestamp: DateTime<Utc>,
}

/// Rows removed by [`SqliteMemory::purge_older_than`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub detections: u64,
    pub alerts: u64,
}

/// SQLite-backed memory.
#[derive(Clone)]
pub struct SqliteMemory {
    pool: SqlitePool,
}

impl SqliteMemory {
    /// Connect and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:sentinel_memory.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database gets its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let memory = Self { pool };
        memory.initialize_schema().await?;

        Ok(memory)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence REAL NOT NULL,
                bbox_json TEXT NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_detections_camera_ts ON detections(camera_id, ts)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_detection(
        &self,
        camera_id: &str,
        detection: &Detection,
        captured_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let bbox_json = serde_json::to_string(&detection.bbox)?;

        sqlx::query(
            r#"
            INSERT INTO detections (camera_id, label, confidence, bbox_json, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(camera_id)
        .bind(&detection.class_name)
        .bind(f64::from(detection.confidence))
        .bind(bbox_json)
        .bind(captured_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_alert(&self, camera_id: &str, alert: &Alert) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (camera_id, title, message, severity, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(camera_id)
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.timestamp.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Detections from the last `hours` hours, newest first.
    ///
    /// # Arguments
    ///
    /// * `camera_id` - Restrict to one camera, or `None` for all
    /// * `hours` - Lookback window
    /// * `now` - The reference timestamp
    pub async fn query_detections(
        &self,
        camera_id: Option<&str>,
        hours: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<StoredDetection>> {
        let start_ts = (now - Duration::hours(i64::from(hours))).timestamp();

        let rows = sqlx::query(
            r#"
            SELECT camera_id, label, confidence, bbox_json, ts
            FROM detections
            WHERE ts >= ? AND ts <= ? AND (? IS NULL OR camera_id = ?)
            ORDER BY ts DESC, id DESC
            "#,
        )
        .bind(start_ts)
        .bind(now.timestamp())
        .bind(camera_id)
        .bind(camera_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| StoredDetection {
                camera_id: r.get("camera_id"),
                label: r.get("label"),
                confidence: r.get("confidence"),
                bbox: serde_json::from_str(r.get::<&str, _>("bbox_json")).ok(),
                timestamp: from_unix(r.get("ts")),
            })
            .collect())
    }

    /// Most recent alerts, newest first.
    pub async fn recent_alerts(&self, limit: u32) -> anyhow::Result<Vec<StoredAlert>> {
        let rows = sqlx::query(
            r#"
            SELECT camera_id, title, message, severity, ts
            FROM alerts
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| StoredAlert {
                camera_id: r.get("camera_id"),
                title: r.get("title"),
                message: r.get("message"),
                severity: r.get("severity"),
                timestamp: from_unix(r.get("ts")),
            })
            .collect())
    }

    /// Delete everything older than `retention_days` days.
    pub async fn purge_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PurgeReport> {
        let cutoff = (now - Duration::days(i64::from(retention_days))).timestamp();

        let detections = sqlx::query("DELETE FROM detections WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let alerts = sqlx::query("DELETE FROM alerts WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(detections, alerts, retention_days, "Memory purged");
        Ok(PurgeReport { detections, alerts })
    }
}

impl MemorySink for SqliteMemory {
    fn save_detection<'a>(
        &'a self,
        camera_id: &'a str,
        detection: &'a Detection,
        captured_at: DateTime<Utc>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.insert_detection(camera_id, detection, captured_at))
    }

    fn save_alert<'a>(
        &'a self,
        camera_id: &'a str,
        alert: &'a Alert,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.insert_alert(camera_id, alert))
    }
}

fn from_unix(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}
