//! Polygon zones and the occupancy / loitering state machine.
//!
//! # Containment
//!
//! A detection is inside a zone when its contact point (bounding box
//! bottom-center) lies strictly inside the zone polygon. Points exactly on
//! an edge or vertex are classified as **outside**, which keeps the result
//! independent of where the vertex list starts.
//!
//! # Transitions
//!
//! Each call to [`ZoneEngine::process`] compares the set of tracks inside a
//! zone on this tick with the set from the previous tick:
//!
//! - absent before, inside now: `entered` (entry time recorded)
//! - inside before and now, loitering zone, dwell >= threshold: `loitering`
//!   on every such tick
//! - inside before, absent now: `exited` (entry time discarded)

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::association::{IouAssociator, TrackKey};
use crate::error::ConfigurationError;
use crate::model::Detection;

/// Tolerance for the on-edge test, in normalized units.
const BOUNDARY_EPSILON: f64 = 1e-12;

/// Behavior policy of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    /// Any entry is a breach.
    Restricted,
    /// Staying longer than the loiter threshold is reported.
    Loitering,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Restricted => "restricted",
            ZoneKind::Loitering => "loitering",
        }
    }
}

/// Operator-defined zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Zone identifier, unique within an engine.
    pub id: u32,

    /// Display name.
    pub name: String,

    /// Polygon vertices as normalized `[x, y]` pairs.
    pub coordinates: Vec<[f64; 2]>,

    /// Behavior policy.
    #[serde(default = "default_kind")]
    pub kind: ZoneKind,

    /// Class names this zone reacts to.
    #[serde(default = "default_detection_classes")]
    pub detection_classes: BTreeSet<String>,

    /// Dwell time, in seconds, before a loitering event fires.
    #[serde(default = "default_loiter_threshold")]
    pub loiter_threshold_secs: f64,

    /// Inactive zones are skipped entirely.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Display color as `#RRGGBB`.
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_kind() -> ZoneKind {
    ZoneKind::Restricted
}

fn default_detection_classes() -> BTreeSet<String> {
    BTreeSet::from(["person".to_string()])
}

fn default_loiter_threshold() -> f64 {
    30.0
}

fn default_active() -> bool {
    true
}

fn default_color() -> String {
    "#1F4FD8".to_string()
}

impl ZoneConfig {
    /// A restricted, active zone watching for people.
    pub fn new(id: u32, name: &str, coordinates: Vec<[f64; 2]>) -> Self {
        Self {
            id,
            name: name.to_string(),
            coordinates,
            kind: default_kind(),
            detection_classes: default_detection_classes(),
            loiter_threshold_secs: default_loiter_threshold(),
            active: default_active(),
            color: default_color(),
        }
    }

    pub fn with_kind(mut self, kind: ZoneKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_classes(mut self, classes: &[&str]) -> Self {
        self.detection_classes = classes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_loiter_threshold(mut self, secs: f64) -> Self {
        self.loiter_threshold_secs = secs;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Check the configuration without registering it.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.coordinates.len() < 3 {
            return Err(ConfigurationError::TooFewVertices {
                zone_id: self.id,
                count: self.coordinates.len(),
            });
        }

        for (index, &[x, y]) in self.coordinates.iter().enumerate() {
            let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
            if !in_range(x) || !in_range(y) {
                return Err(ConfigurationError::VertexOutOfRange {
                    zone_id: self.id,
                    index,
                    x,
                    y,
                });
            }
        }

        if !(self.loiter_threshold_secs.is_finite() && self.loiter_threshold_secs > 0.0) {
            return Err(ConfigurationError::InvalidLoiterThreshold {
                zone_id: self.id,
                value: self.loiter_threshold_secs,
            });
        }

        if self.detection_classes.is_empty() {
            return Err(ConfigurationError::EmptyClassSet { zone_id: self.id });
        }

        let hex = self.color.strip_prefix('#').unwrap_or_default();
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigurationError::InvalidColor {
                zone_id: self.id,
                color: self.color.clone(),
            });
        }

        Ok(())
    }
}

/// What happened to a track in a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneEventKind {
    Entered,
    Exited,
    Loitering,
}

/// A zone transition emitted by [`ZoneEngine::process`].
#[derive(Debug, Clone, Serialize)]
pub struct ZoneEvent {
    pub zone_id: u32,
    pub zone_name: String,
    pub zone_kind: ZoneKind,
    pub kind: ZoneEventKind,
    pub track: TrackKey,

    /// The detection that triggered the event. For `exited` this is the
    /// last detection seen inside the zone.
    pub detection: Detection,

    pub timestamp: DateTime<Utc>,

    /// Seconds since entry, set for `loitering` and `exited`.
    pub dwell_secs: Option<f64>,
}

/// Ray-casting point-in-polygon test. Boundary points are outside.
pub fn point_in_polygon(point: (f64, f64), polygon: &[[f64; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 || on_boundary(point, polygon) {
        return false;
    }

    let (x, y) = point;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn on_boundary((x, y): (f64, f64), polygon: &[[f64; 2]]) -> bool {
    let n = polygon.len();
    (0..n).any(|i| {
        let [ax, ay] = polygon[i];
        let [bx, by] = polygon[(i + 1) % n];
        let cross = (bx - ax) * (y - ay) - (by - ay) * (x - ax);
        cross.abs() <= BOUNDARY_EPSILON
            && x >= ax.min(bx) - BOUNDARY_EPSILON
            && x <= ax.max(bx) + BOUNDARY_EPSILON
            && y >= ay.min(by) - BOUNDARY_EPSILON
            && y <= ay.max(by) + BOUNDARY_EPSILON
    })
}

struct ZoneSlot {
    config: ZoneConfig,
    /// Tracks inside as of the last tick, with their latest detection.
    inside: HashMap<TrackKey, Detection>,
}

/// Zone registry and occupancy state machine.
///
/// Not thread-safe by itself; it is owned by the tick handler and mutated
/// once per tick.
pub struct ZoneEngine {
    zones: BTreeMap<u32, ZoneSlot>,
    entries: HashMap<(TrackKey, u32), DateTime<Utc>>,
    associator: IouAssociator,
}

impl Default for ZoneEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneEngine {
    pub fn new() -> Self {
        Self::with_associator(IouAssociator::default())
    }

    pub fn with_associator(associator: IouAssociator) -> Self {
        Self {
            zones: BTreeMap::new(),
            entries: HashMap::new(),
            associator,
        }
    }

    /// Validate and register a zone.
    pub fn add_zone(&mut self, config: ZoneConfig) -> Result<(), ConfigurationError> {
        config.validate()?;
        if self.zones.contains_key(&config.id) {
            return Err(ConfigurationError::DuplicateZone(config.id));
        }

        info!(
            zone_id = config.id,
            name = %config.name,
            kind = config.kind.as_str(),
            vertices = config.coordinates.len(),
            "Zone registered"
        );

        self.zones.insert(
            config.id,
            ZoneSlot {
                config,
                inside: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Unregister a zone, dropping its occupancy state.
    pub fn remove_zone(&mut self, zone_id: u32) -> Result<ZoneConfig, ConfigurationError> {
        let slot = self
            .zones
            .remove(&zone_id)
            .ok_or(ConfigurationError::UnknownZone(zone_id))?;
        self.entries.retain(|(_, z), _| *z != zone_id);
        info!(zone_id, "Zone removed");
        Ok(slot.config)
    }

    /// Toggle a zone. Deactivating silently forgets who was inside.
    pub fn set_zone_active(&mut self, zone_id: u32, active: bool) -> Result<(), ConfigurationError> {
        let slot = self
            .zones
            .get_mut(&zone_id)
            .ok_or(ConfigurationError::UnknownZone(zone_id))?;

        if slot.config.active == active {
            return Ok(());
        }
        slot.config.active = active;
        if !active {
            slot.inside.clear();
            self.entries.retain(|(_, z), _| *z != zone_id);
        }
        info!(zone_id, active, "Zone activation changed");
        Ok(())
    }

    pub fn zone(&self, zone_id: u32) -> Option<&ZoneConfig> {
        self.zones.get(&zone_id).map(|slot| &slot.config)
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneConfig> {
        self.zones.values().map(|slot| &slot.config)
    }

    /// Evaluate one tick of detections against every active zone.
    pub fn process(&mut self, detections: &[Detection], now: DateTime<Utc>) -> Vec<ZoneEvent> {
        let keys = self.associator.resolve(detections);
        let mut events = Vec::new();

        for (&zone_id, slot) in self.zones.iter_mut() {
            if !slot.config.active {
                continue;
            }
            let zone = &slot.config;

            // First detection wins when several share a track
            let mut order = Vec::new();
            let mut current: HashMap<TrackKey, Detection> = HashMap::new();
            for (detection, &key) in detections.iter().zip(&keys) {
                if !zone.detection_classes.contains(&detection.class_name)
                    || current.contains_key(&key)
                    || !point_in_polygon(detection.bbox.contact_point(), &zone.coordinates)
                {
                    continue;
                }
                order.push(key);
                current.insert(key, detection.clone());
            }

            for key in order {
                let detection = &current[&key];
                if !slot.inside.contains_key(&key) {
                    self.entries.insert((key, zone_id), now);
                    events.push(event(zone, ZoneEventKind::Entered, key, detection, now, None));
                } else if zone.kind == ZoneKind::Loitering {
                    if let Some(&entered_at) = self.entries.get(&(key, zone_id)) {
                        let dwell = seconds_between(entered_at, now);
                        if dwell >= zone.loiter_threshold_secs {
                            events.push(event(
                                zone,
                                ZoneEventKind::Loitering,
                                key,
                                detection,
                                now,
                                Some(dwell),
                            ));
                        }
                    }
                }
            }

            let mut departed: Vec<(TrackKey, Detection)> = slot
                .inside
                .iter()
                .filter(|(key, _)| !current.contains_key(key))
                .map(|(key, detection)| (*key, detection.clone()))
                .collect();
            departed.sort_by_key(|(key, _)| *key);

            for (key, last_seen) in departed {
                let dwell = self
                    .entries
                    .remove(&(key, zone_id))
                    .map(|entered_at| seconds_between(entered_at, now));
                events.push(event(zone, ZoneEventKind::Exited, key, &last_seen, now, dwell));
            }

            slot.inside = current;
        }

        if !events.is_empty() {
            debug!(events = events.len(), "Zone transitions");
        }
        events
    }
}

fn event(
    zone: &ZoneConfig,
    kind: ZoneEventKind,
    track: TrackKey,
    detection: &Detection,
    timestamp: DateTime<Utc>,
    dwell_secs: Option<f64>,
) -> ZoneEvent {
    ZoneEvent {
        zone_id: zone.id,
        zone_name: zone.name.clone(),
        zone_kind: zone.kind,
        kind,
        track,
        detection: detection.clone(),
        timestamp,
        dwell_secs,
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}
