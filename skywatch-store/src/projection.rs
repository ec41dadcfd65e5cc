//! Read-side snapshot of every encounter for list display.
//!
//! Readers take an `Arc` of the whole map and never block the engine for
//! longer than a pointer clone. Writers swap in a new map (rebuild) or
//! copy-on-write a single entry (ingest).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde::Serialize;

use skywatch_core::types::{Encounter, FlightPoint, Signature, TrustStatus};

use crate::db::Database;

/// Records seen within this window keep the larger history slice.
pub const RECENT_WINDOW_SEC: f64 = 3600.0;
pub const RECENT_POINT_LIMIT: usize = 200;
pub const RECENT_SIGNATURE_LIMIT: usize = 50;
pub const IDLE_POINT_LIMIT: usize = 10;
pub const IDLE_SIGNATURE_LIMIT: usize = 10;

/// Display copy of an encounter with truncated history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightweightEncounter {
    pub id: String,
    pub custom_name: String,
    pub trust_status: TrustStatus,
    pub first_seen: f64,
    pub last_seen: f64,
    pub metadata: BTreeMap<String, String>,
    pub mac_addresses: Vec<String>,
    pub flight_points: Vec<FlightPoint>,
    pub signatures: Vec<Signature>,
    pub max_altitude: f64,
    pub max_speed: f64,
    #[serde(rename = "averageRSSI")]
    pub average_rssi: f64,
    pub flight_point_count: i64,
    pub signature_count: i64,
}

/// `(points, signatures)` kept for a record last seen at `last_seen`.
pub fn history_limits(last_seen: f64, now: f64) -> (usize, usize) {
    if now - last_seen <= RECENT_WINDOW_SEC {
        (RECENT_POINT_LIMIT, RECENT_SIGNATURE_LIMIT)
    } else {
        (IDLE_POINT_LIMIT, IDLE_SIGNATURE_LIMIT)
    }
}

fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

impl LightweightEncounter {
    pub fn from_encounter(enc: &Encounter, now: f64) -> Self {
        let (points, sigs) = history_limits(enc.last_seen, now);
        Self::with_history(enc, tail(&enc.flight_points, points), tail(&enc.signatures, sigs))
    }

    fn with_history(enc: &Encounter, flight_points: Vec<FlightPoint>, signatures: Vec<Signature>) -> Self {
        LightweightEncounter {
            id: enc.id.clone(),
            custom_name: enc.custom_name.clone(),
            trust_status: enc.trust_status,
            first_seen: enc.first_seen,
            last_seen: enc.last_seen,
            metadata: enc.metadata.clone(),
            mac_addresses: enc.mac_addresses.clone(),
            flight_points,
            signatures,
            max_altitude: enc.max_altitude,
            max_speed: enc.max_speed,
            average_rssi: enc.average_rssi,
            flight_point_count: enc.flight_point_count,
            signature_count: enc.signature_count,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.custom_name.is_empty() {
            &self.id
        } else {
            &self.custom_name
        }
    }
}

pub type ProjectionMap = HashMap<String, LightweightEncounter>;

/// Shared, wholesale-replaced projection map.
#[derive(Debug, Default)]
pub struct ProjectionCache {
    inner: RwLock<Arc<ProjectionMap>>,
}

impl ProjectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Never changes under the caller.
    pub fn get(&self) -> Arc<ProjectionMap> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, map: ProjectionMap) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
    }

    fn update(&self, f: impl FnOnce(&mut ProjectionMap)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Clones the map only while a reader still holds the old snapshot
        f(Arc::make_mut(&mut guard));
    }

    pub fn upsert(&self, entry: LightweightEncounter) {
        self.update(|map| {
            map.insert(entry.id.clone(), entry);
        });
    }

    pub fn remove(&self, id: &str) {
        self.update(|map| {
            map.remove(id);
        });
    }

    pub fn clear(&self) {
        self.replace(ProjectionMap::new());
    }

    /// Rebuild from storage. Records whose children cannot be read are left
    /// out. Returns the number of entries.
    pub fn rebuild(&self, db: &Database, now: f64) -> rusqlite::Result<usize> {
        let mut map = ProjectionMap::new();
        for enc in db.list_encounters()? {
            let (point_limit, sig_limit) = history_limits(enc.last_seen, now);
            let children = db
                .flight_points(&enc.id, Some(point_limit))
                .and_then(|points| Ok((points, db.signatures(&enc.id, Some(sig_limit))?)));
            match children {
                Ok((points, sigs)) => {
                    map.insert(enc.id.clone(), LightweightEncounter::with_history(&enc, points, sigs));
                }
                Err(e) => warn!("projection: skipping {}: {e}", enc.id),
            }
        }
        let n = map.len();
        self.replace(map);
        debug!("projection rebuilt with {n} encounters");
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn encounter_with_history(id: &str, last_seen: f64, n: usize) -> Encounter {
        let mut enc = Encounter::new(id, 0.0);
        enc.last_seen = last_seen;
        for i in 0..n {
            enc.flight_points
                .push(FlightPoint::gps(35.0, -82.0 + i as f64 * 0.001, 10.0, i as f64, None).unwrap());
            enc.signatures
                .push(Signature::new(i as f64, -50.0 - (i % 20) as f64, 1.0, 1.0, None).unwrap());
        }
        skywatch_core::aggregate::recompute(&mut enc);
        enc
    }

    #[test]
    fn test_recent_record_keeps_long_history() {
        let enc = encounter_with_history("D1", 10_000.0, 300);
        let light = LightweightEncounter::from_encounter(&enc, 10_100.0);
        assert_eq!(light.flight_points.len(), RECENT_POINT_LIMIT);
        assert_eq!(light.signatures.len(), RECENT_SIGNATURE_LIMIT);
        // Most recent retained, counts untouched
        assert_eq!(light.flight_points.last().unwrap().timestamp, 299.0);
        assert_eq!(light.flight_point_count, 300);
    }

    #[test]
    fn test_idle_record_keeps_short_history() {
        let enc = encounter_with_history("D1", 1_000.0, 300);
        let light = LightweightEncounter::from_encounter(&enc, 1_000.0 + RECENT_WINDOW_SEC + 1.0);
        assert_eq!(light.flight_points.len(), IDLE_POINT_LIMIT);
        assert_eq!(light.signatures.len(), IDLE_SIGNATURE_LIMIT);
    }

    #[test]
    fn test_snapshot_survives_updates() {
        let cache = ProjectionCache::new();
        let enc = encounter_with_history("D1", 0.0, 3);
        cache.upsert(LightweightEncounter::from_encounter(&enc, 0.0));

        let before = cache.get();
        cache.remove("D1");
        cache.upsert(LightweightEncounter::from_encounter(&Encounter::new("D2", 0.0), 0.0));

        assert!(before.contains_key("D1"));
        assert!(!before.contains_key("D2"));
        let after = cache.get();
        assert!(after.contains_key("D2"));
        assert!(!after.contains_key("D1"));
    }

    #[test]
    fn test_rebuild_from_database() {
        let mut db = Database::open_memory().unwrap();
        db.save_encounter(&mut encounter_with_history("D1", 500.0, 30)).unwrap();
        db.save_encounter(&mut encounter_with_history("D2", 5_000.0, 30)).unwrap();

        let cache = ProjectionCache::new();
        cache.upsert(LightweightEncounter::from_encounter(&Encounter::new("stale", 0.0), 0.0));
        assert_eq!(cache.rebuild(&db, 5_100.0).unwrap(), 2);

        let map = cache.get();
        assert!(!map.contains_key("stale"));
        assert_eq!(map["D1"].flight_points.len(), IDLE_POINT_LIMIT);
        assert_eq!(map["D2"].flight_points.len(), 30);
        assert_eq!(map["D2"].signatures.len(), 30);
    }

    #[test]
    fn test_rebuild_skips_unreadable_record() {
        let mut db = Database::open_memory().unwrap();
        db.save_encounter(&mut encounter_with_history("good", 5_000.0, 5)).unwrap();
        db.save_encounter(&mut encounter_with_history("bad", 5_000.0, 5)).unwrap();
        db.conn_for_tests()
            .execute("UPDATE flight_points SET latitude = 'garbled' WHERE encounter_id = 'bad'", [])
            .unwrap();
        assert!(db.flight_points("bad", None).is_err());

        let cache = ProjectionCache::new();
        assert_eq!(cache.rebuild(&db, 5_100.0).unwrap(), 1);
        let map = cache.get();
        assert!(map.contains_key("good"));
        assert!(!map.contains_key("bad"));
    }
}
