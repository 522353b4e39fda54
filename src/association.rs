//! Lightweight identity association for detections without an upstream track id.
//!
//! The zone engine needs a stable identity per object so that one occupancy
//! interval produces exactly one `entered` and one `exited` event. When the
//! detector already runs a tracker its ids are used as-is. Otherwise each
//! untracked detection is matched greedily, highest IoU first, against the
//! untracked boxes of the previous tick with the same class. Unmatched
//! detections start a new identity.
//!
//! Memory is one tick deep: an object missed for a single frame comes back
//! with a fresh identity.

use std::fmt;

use serde::Serialize;

use crate::model::{BoundingBox, Detection};

/// Minimum overlap for two boxes on consecutive ticks to be the same object.
pub const DEFAULT_MIN_IOU: f64 = 0.3;

/// Identity of a tracked object.
///
/// Upstream and locally associated ids live in separate spaces so they can
/// never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "source", content = "id", rename_all = "lowercase")]
pub enum TrackKey {
    Upstream(u64),
    Associated(u64),
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKey::Upstream(id) => write!(f, "{}", id),
            TrackKey::Associated(id) => write!(f, "a{}", id),
        }
    }
}

#[derive(Debug, Clone)]
struct Associated {
    id: u64,
    class_name: String,
    bbox: BoundingBox,
}

/// Greedy IoU associator.
#[derive(Debug)]
pub struct IouAssociator {
    min_iou: f64,
    next_id: u64,
    previous: Vec<Associated>,
}

impl Default for IouAssociator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_IOU)
    }
}

impl IouAssociator {
    pub fn new(min_iou: f64) -> Self {
        Self {
            min_iou,
            next_id: 1,
            previous: Vec::new(),
        }
    }

    /// Resolve one identity per detection, in input order.
    pub fn resolve(&mut self, detections: &[Detection]) -> Vec<TrackKey> {
        let mut keys: Vec<Option<TrackKey>> = detections
            .iter()
            .map(|d| d.track_id.map(TrackKey::Upstream))
            .collect();

        // All same-class candidate pairs above the threshold, best first
        let mut candidates = Vec::new();
        for (i, detection) in detections.iter().enumerate() {
            if keys[i].is_some() {
                continue;
            }
            for (j, prev) in self.previous.iter().enumerate() {
                if prev.class_name != detection.class_name {
                    continue;
                }
                let iou = detection.bbox.iou(&prev.bbox);
                if iou >= self.min_iou {
                    candidates.push((iou, i, j));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut taken = vec![false; self.previous.len()];
        for (_, i, j) in candidates {
            if keys[i].is_none() && !taken[j] {
                keys[i] = Some(TrackKey::Associated(self.previous[j].id));
                taken[j] = true;
            }
        }

        let mut current = Vec::new();
        let resolved = keys
            .into_iter()
            .zip(detections)
            .map(|(key, detection)| {
                let key = match key {
                    Some(key) => key,
                    None => {
                        let id = self.next_id;
                        self.next_id += 1;
                        TrackKey::Associated(id)
                    }
                };
                if let TrackKey::Associated(id) = key {
                    current.push(Associated {
                        id,
                        class_name: detection.class_name.clone(),
                        bbox: detection.bbox,
                    });
                }
                key
            })
            .collect();

        self.previous = current;
        resolved
    }
}
