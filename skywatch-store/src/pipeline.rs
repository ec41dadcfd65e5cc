//! Ingestion pipeline: one detection message in, one encounter updated.
//!
//! Order per message: resolve identity, fetch or create the record, session
//! bucket, activity window, flight point or proximity sample, MAC set,
//! signature, pilot/home history, then scalar metadata and cached aggregates.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::Result as SqlResult;

use skywatch_core::activity::{append_session_bucket, format_activity_log, parse_activity_log, record_activity};
use skywatch_core::aggregate;
use skywatch_core::decimate;
use skywatch_core::identity::{IdentityKeys, IdentityLookup, IdentityResolver, ResolvedBy};
use skywatch_core::message::{DetectionMessage, IdType, ObserverStatus};
use skywatch_core::proximity::{estimate_radius_m, insert_proximity, ProximityOutcome};
use skywatch_core::types::*;

use crate::projection::{LightweightEncounter, ProjectionCache};
use crate::repository::Repository;

/// Signature history bound and the batch dropped when it is exceeded.
pub const SIGNATURE_CAP: usize = 500;
pub const SIGNATURE_PRUNE: usize = 100;

/// A new signature needs an RSSI change above this, or the interval below.
pub const SIGNATURE_RSSI_DELTA: f64 = 3.0;
pub const SIGNATURE_INTERVAL_SEC: f64 = 5.0;

/// Result of ingesting one message.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub id: String,
    pub resolved_by: ResolvedBy,
    pub created: bool,
    /// A flight point or proximity sample changed the path.
    pub point_added: bool,
    /// Listeners should be told about this update.
    pub notify: bool,
}

/// Hour bucket `YYYY-MM-DD-HH` (UTC) for a unix timestamp.
pub fn session_bucket(ts: f64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(ts.floor() as i64, 0).map(|d| d.format("%Y-%m-%d-%H").to_string())
}

#[derive(Debug, Default)]
pub struct Pipeline {
    resolver: IdentityResolver,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut IdentityResolver {
        &mut self.resolver
    }

    /// Fold one message into its encounter.
    ///
    /// `wall_clock` stands in for the message time when it carries none.
    /// Returns `None` for messages without a uid.
    pub fn ingest(
        &mut self,
        repo: &mut Repository,
        projection: &ProjectionCache,
        msg: &DetectionMessage,
        observer: Option<&ObserverStatus>,
        wall_clock: f64,
    ) -> SqlResult<Option<IngestOutcome>> {
        let keys = IdentityKeys::from_message(msg);
        if keys.uid.is_empty() {
            debug!("dropping message without uid");
            return Ok(None);
        }
        let now = msg
            .timestamp
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(wall_clock);

        let resolution = self.resolver.resolve(&keys, &*repo);
        let id = resolution.id.clone();

        // MACs this record may take, decided before it is borrowed mutably
        let claimable: Vec<String> = msg
            .all_macs()
            .into_iter()
            .filter(|mac| self.may_claim(mac, &id, resolution.conflicting_mac.as_deref(), &*repo))
            .map(str::to_string)
            .collect();

        let carried = projection
            .get()
            .get(&id)
            .map(|prev| (prev.custom_name.clone(), prev.trust_status));
        let (enc, created) = repo.fetch_or_create(&id, || {
            let mut enc = Encounter::new(&id, now);
            if let Some((name, trust)) = carried {
                enc.custom_name = name;
                enc.trust_status = trust;
            }
            enc
        })?;

        let tracked = !enc.do_not_track();

        if tracked {
            if let Some(bucket) = session_bucket(now) {
                if let Some(history) = append_session_bucket(enc.meta(META_SESSION_HISTORY), &bucket) {
                    enc.set_meta(META_SESSION_HISTORY, history);
                }
            }
        }

        let mut windows = parse_activity_log(enc.meta(META_ACTIVITY_LOG).unwrap_or(""));
        record_activity(&mut windows, now);
        enc.set_meta(META_ACTIVITY_LOG, format_activity_log(&windows));
        enc.first_seen = enc.first_seen.min(now);
        enc.last_seen = enc.last_seen.max(now);

        let mut point_added = false;
        if tracked {
            let rssi = msg.rssi_value();

            if msg.has_position() && !msg.is_short_range_detection {
                let home = msg.has_home().then_some((msg.home_lat, msg.home_lon));
                if let Some(point) = FlightPoint::gps(msg.lat, msg.lon, msg.alt, now, home) {
                    if decimate::should_retain(enc.last_gps_point(), &point) {
                        enc.flight_points.push(point);
                        point_added = true;
                    }
                }
            } else if rssi != 0.0 {
                match observer.filter(|o| o.has_fix()) {
                    Some(obs) => {
                        let point = FlightPoint::proximity(
                            obs.latitude,
                            obs.longitude,
                            rssi,
                            estimate_radius_m(rssi),
                            now,
                        );
                        point_added =
                            insert_proximity(&mut enc.flight_points, point) != ProximityOutcome::Discarded;
                        let total = enc
                            .meta(META_TOTAL_DETECTIONS)
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0);
                        enc.set_meta(META_TOTAL_DETECTIONS, (total + 1).to_string());
                    }
                    None => debug!("{id}: no observer fix, skipping proximity sample"),
                }
            }

            for mac in &claimable {
                enc.add_mac(mac);
            }

            let sig = Signature::new(
                now,
                rssi,
                msg.speed,
                msg.height.unwrap_or(0.0),
                msg.mac_str().map(str::to_string),
            );
            if let Some(sig) = sig {
                push_signature(&mut enc.signatures, sig);
            }

            if msg.has_pilot() {
                record_location(
                    enc,
                    (META_PILOT_LAT, META_PILOT_LON, META_PILOT_HISTORY),
                    msg.pilot_lat,
                    msg.pilot_lon,
                    now,
                );
            }
            if msg.has_home() {
                record_location(
                    enc,
                    (META_HOME_LAT, META_HOME_LON, META_HOME_HISTORY),
                    msg.home_lat,
                    msg.home_lon,
                    now,
                );
            }

            if let Some(m) = msg.manufacturer.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
                enc.set_meta(META_MANUFACTURER, m);
            }
            if msg.id_type != IdType::Unknown {
                enc.set_meta(META_ID_TYPE, msg.id_type.as_str());
            }
            if let Some(code) = keys.registration {
                enc.set_meta(META_CAA_REGISTRATION, code);
            }
            if let Some(mac) = keys.mac.filter(|m| claimable.iter().any(|c| c.eq_ignore_ascii_case(m))) {
                enc.set_meta(META_MAC, mac);
            }
        }

        aggregate::recompute(enc);
        let light = LightweightEncounter::from_encounter(enc, now);

        repo.mark_dirty(&id);
        projection.upsert(light);
        if tracked {
            for mac in &claimable {
                self.resolver.remember_mac(mac, &id);
            }
            if let Some(code) = keys.registration {
                self.resolver.remember_registration(code, &id);
            }
        }

        Ok(Some(IngestOutcome {
            id,
            resolved_by: resolution.resolved_by,
            created,
            point_added,
            notify: point_added || !msg.is_short_range_detection,
        }))
    }

    /// A MAC may join `id` unless another live record already holds it.
    fn may_claim(&self, mac: &str, id: &str, conflicting: Option<&str>, store: &impl IdentityLookup) -> bool {
        if conflicting.is_some_and(|c| c.eq_ignore_ascii_case(mac)) {
            return false;
        }
        if let Some(owner) = self.resolver.cached_mac(mac) {
            if owner == id {
                return true;
            }
            if store.encounter_exists(owner) {
                warn!("MAC {mac} belongs to {owner}; not adding it to {id}");
                return false;
            }
        }
        match store.mac_owners(mac).into_iter().find(|o| o != id) {
            Some(other) => {
                warn!("MAC {mac} belongs to {other}; not adding it to {id}");
                false
            }
            None => true,
        }
    }
}

/// Append a signature when it says something new; prune when over the cap.
fn push_signature(signatures: &mut Vec<Signature>, sig: Signature) {
    let keep = match signatures.last() {
        None => true,
        Some(last) => {
            (sig.rssi - last.rssi).abs() > SIGNATURE_RSSI_DELTA
                || (sig.timestamp - last.timestamp) > SIGNATURE_INTERVAL_SEC
        }
    };
    if !keep {
        return;
    }
    signatures.push(sig);
    if signatures.len() > SIGNATURE_CAP {
        signatures.drain(..SIGNATURE_PRUNE);
    }
}

/// Overwrite the current location and append `<ts>:<lat>,<lon>` to its
/// history when the pair changed and is not already recorded.
fn record_location(enc: &mut Encounter, keys: (&str, &str, &str), lat: f64, lon: f64, now: f64) {
    let (lat_key, lon_key, history_key) = keys;
    if enc.meta_f64(lat_key) == Some(lat) && enc.meta_f64(lon_key) == Some(lon) {
        return;
    }
    enc.set_meta(lat_key, lat.to_string());
    enc.set_meta(lon_key, lon.to_string());

    let suffix = format!(":{lat},{lon}");
    let history = enc.meta(history_key).unwrap_or("");
    if history.split(';').any(|entry| entry.ends_with(&suffix)) {
        return;
    }
    let updated = if history.is_empty() {
        format!("{now}{suffix}")
    } else {
        format!("{history};{now}{suffix}")
    };
    enc.set_meta(history_key, updated);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    struct Harness {
        pipeline: Pipeline,
        repo: Repository,
        projection: ProjectionCache,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                pipeline: Pipeline::new(),
                repo: Repository::new(Database::open_memory().unwrap()),
                projection: ProjectionCache::new(),
            }
        }

        fn ingest(&mut self, msg: &DetectionMessage) -> IngestOutcome {
            self.ingest_with(msg, None)
        }

        fn ingest_with(&mut self, msg: &DetectionMessage, observer: Option<&ObserverStatus>) -> IngestOutcome {
            let wall = msg.timestamp.unwrap_or(1_700_000_000.0);
            self.pipeline
                .ingest(&mut self.repo, &self.projection, msg, observer, wall)
                .unwrap()
                .unwrap()
        }

        fn get(&self, id: &str) -> Encounter {
            self.repo.get(id).unwrap().unwrap()
        }
    }

    fn msg(uid: &str, lat: f64, lon: f64, ts: f64) -> DetectionMessage {
        DetectionMessage {
            uid: uid.into(),
            lat,
            lon,
            alt: 60.0,
            rssi: Some(-65.0),
            speed: 4.0,
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    const T0: f64 = 1_700_000_000.0;

    #[test]
    fn test_registration_joins_rotating_uids() {
        let mut h = Harness::new();
        let mut m1 = msg("D1", 35.0, -82.0, T0);
        m1.caa_registration = Some("FA123".into());
        m1.id_type = IdType::CaaRegistration;
        let mut m2 = msg("D2", 35.001, -82.0, T0 + 10.0);
        m2.caa_registration = Some("FA123".into());
        m2.id_type = IdType::CaaRegistration;

        assert!(h.ingest(&m1).created);
        let out = h.ingest(&m2);
        assert_eq!(out.id, "D1");
        assert!(!out.created);

        let enc = h.get("D1");
        assert_eq!(enc.flight_points.len(), 2);
        assert_eq!(enc.flight_point_count, 2);
        assert_eq!(enc.meta(META_CAA_REGISTRATION), Some("FA123"));
        assert!(h.repo.get("D2").unwrap().is_none());
    }

    #[test]
    fn test_decimation_drops_stationary_repeats() {
        let mut h = Harness::new();
        h.ingest(&msg("D1", 35.0, -82.0, T0));
        let out = h.ingest(&msg("D1", 35.0, -82.0, T0 + 1.0));
        assert!(!out.point_added);
        let out = h.ingest(&msg("D1", 35.0, -82.0, T0 + 3.5));
        assert!(out.point_added);
        assert_eq!(h.get("D1").flight_points.len(), 2);
    }

    #[test]
    fn test_mac_not_claimed_from_live_record() {
        let mut h = Harness::new();
        let mut a = msg("A", 35.0, -82.0, T0);
        a.mac = Some("AA:BB:CC:DD:EE:FF".into());
        h.ingest(&a);

        // B is already a live record of its own
        let mut b = msg("B", 35.1, -82.1, T0 + 1.0);
        h.ingest(&b);
        b.mac = Some("AA:BB:CC:DD:EE:FF".into());
        b.signal_sources = vec![skywatch_core::message::SignalSource {
            mac: Some("11:22:33:44:55:66".into()),
            rssi: Some(-70.0),
        }];
        h.ingest(&b);
        let out = h.ingest(&b);
        assert_eq!(out.id, "B");

        let a = h.get("A");
        let b = h.get("B");
        assert_eq!(a.mac_addresses, vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(b.mac_addresses, vec!["11:22:33:44:55:66"]);
        assert!(b.meta(META_MAC).is_none());
        assert_eq!(h.pipeline.resolver().cached_mac("AA:BB:CC:DD:EE:FF"), Some("A"));
    }

    #[test]
    fn test_mac_follows_rotated_uid() {
        let mut h = Harness::new();
        let mut a = msg("A", 35.0, -82.0, T0);
        a.mac = Some("AA:BB".into());
        h.ingest(&a);

        // Unknown uid carrying the known MAC resolves to the original record
        let mut rotated = msg("A-2", 35.01, -82.0, T0 + 5.0);
        rotated.mac = Some("aa:bb".into());
        let out = h.ingest(&rotated);
        assert_eq!(out.id, "A");
        assert_eq!(out.resolved_by, ResolvedBy::MacCache);
        assert_eq!(h.get("A").mac_addresses, vec!["AA:BB"]);
    }

    #[test]
    fn test_signature_history_is_bounded() {
        let mut h = Harness::new();
        for i in 0..=SIGNATURE_CAP {
            let mut m = msg("D1", 0.0, 0.0, T0 + i as f64);
            m.rssi = Some(if i % 2 == 0 { -50.0 } else { -60.0 });
            h.ingest(&m);
            assert!(h.get("D1").signatures.len() <= SIGNATURE_CAP);
        }
        let enc = h.get("D1");
        assert_eq!(enc.signatures.len(), SIGNATURE_CAP + 1 - SIGNATURE_PRUNE);
        assert_eq!(enc.signatures[0].timestamp, T0 + SIGNATURE_PRUNE as f64);
        assert_eq!(enc.signature_count, enc.signatures.len() as i64);
    }

    #[test]
    fn test_similar_signatures_collapse() {
        let mut h = Harness::new();
        let mut m = msg("D1", 35.0, -82.0, T0);
        h.ingest(&m);
        m.rssi = Some(-66.0);
        m.timestamp = Some(T0 + 1.0);
        h.ingest(&m);
        m.rssi = Some(-75.0);
        m.timestamp = Some(T0 + 2.0);
        h.ingest(&m);
        assert_eq!(h.get("D1").signatures.len(), 2);
    }

    #[test]
    fn test_proximity_needs_observer_fix() {
        let mut h = Harness::new();
        let mut m = msg("FPV1", 0.0, 0.0, T0);
        m.is_short_range_detection = true;
        m.rssi = Some(-70.0);

        let out = h.ingest(&m);
        assert!(!out.point_added);
        assert!(!out.notify);
        assert!(h.get("FPV1").meta(META_TOTAL_DETECTIONS).is_none());

        let observer = ObserverStatus {
            latitude: 35.5,
            longitude: -82.5,
        };
        let out = h.ingest_with(&m, Some(&observer));
        assert!(out.point_added);
        assert!(out.notify);

        let enc = h.get("FPV1");
        assert_eq!(enc.proximity_point_count(), 1);
        assert_eq!(enc.flight_points[0].latitude, 35.5);
        assert_eq!(enc.meta(META_TOTAL_DETECTIONS), Some("1"));
        assert_eq!(enc.max_altitude, 0.0);
    }

    #[test]
    fn test_proximity_ring_keeps_extremes() {
        let mut h = Harness::new();
        let observer = ObserverStatus {
            latitude: 35.5,
            longitude: -82.5,
        };
        for (i, rssi) in [-80.0, -60.0, -70.0, -90.0].iter().enumerate() {
            let mut m = msg("FPV1", 0.0, 0.0, T0 + i as f64);
            m.is_short_range_detection = true;
            m.rssi = Some(*rssi);
            h.ingest_with(&m, Some(&observer));
        }
        let enc = h.get("FPV1");
        let mut rssis: Vec<f64> = enc
            .flight_points
            .iter()
            .filter_map(|p| p.proximity_rssi)
            .collect();
        rssis.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rssis, vec![-90.0, -80.0, -60.0]);
        assert_eq!(enc.meta(META_TOTAL_DETECTIONS), Some("4"));
    }

    #[test]
    fn test_positionless_message_still_notifies() {
        let mut h = Harness::new();
        let out = h.ingest(&msg("D1", 0.0, 0.0, T0));
        assert!(!out.point_added);
        assert!(out.notify);
        assert!(h.get("D1").flight_points.is_empty());
    }

    #[test]
    fn test_pilot_history_records_changes_once() {
        let mut h = Harness::new();
        let mut m = msg("D1", 35.0, -82.0, T0);
        m.pilot_lat = 35.1;
        m.pilot_lon = -82.1;
        h.ingest(&m);
        m.timestamp = Some(T0 + 10.0);
        h.ingest(&m);
        m.pilot_lat = 35.2;
        m.timestamp = Some(T0 + 20.0);
        h.ingest(&m);
        // Back to the first spot: already in history
        m.pilot_lat = 35.1;
        m.timestamp = Some(T0 + 30.0);
        h.ingest(&m);

        let enc = h.get("D1");
        assert_eq!(enc.meta(META_PILOT_LAT), Some("35.1"));
        let history = enc.meta(META_PILOT_HISTORY).unwrap();
        assert_eq!(history.split(';').count(), 2);
        assert!(history.starts_with(&format!("{T0}:35.1,-82.1")));
    }

    #[test]
    fn test_home_point_recorded() {
        let mut h = Harness::new();
        let mut m = msg("D1", 35.0, -82.0, T0);
        m.home_lat = 34.9;
        m.home_lon = -81.9;
        h.ingest(&m);
        let enc = h.get("D1");
        assert_eq!(enc.meta_f64(META_HOME_LAT), Some(34.9));
        assert_eq!(enc.flight_points[0].home_latitude, Some(34.9));
        assert!(enc.meta(META_HOME_HISTORY).is_some());
    }

    #[test]
    fn test_session_and_activity_metadata() {
        let mut h = Harness::new();
        h.ingest(&msg("D1", 35.0, -82.0, T0));
        h.ingest(&msg("D1", 35.001, -82.0, T0 + 60.0));
        h.ingest(&msg("D1", 35.002, -82.0, T0 + 3_600.0));

        let enc = h.get("D1");
        let sessions = enc.meta(META_SESSION_HISTORY).unwrap();
        assert_eq!(sessions.split(';').count(), 2);
        assert_eq!(sessions.split(';').next(), session_bucket(T0).as_deref());

        let windows = parse_activity_log(enc.meta(META_ACTIVITY_LOG).unwrap());
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].end_time, T0 + 60.0);
        assert_eq!(enc.last_seen, T0 + 3_600.0);
    }

    #[test]
    fn test_do_not_track_only_touches_activity() {
        let mut h = Harness::new();
        h.ingest(&msg("D1", 35.0, -82.0, T0));
        h.repo.get_mut("D1").unwrap().unwrap().set_meta(META_DO_NOT_TRACK, "true");

        let mut m = msg("D1", 35.5, -82.5, T0 + 30.0);
        m.rssi = Some(-40.0);
        m.pilot_lat = 35.0;
        m.pilot_lon = -82.0;
        h.ingest(&m);

        let enc = h.get("D1");
        assert_eq!(enc.flight_points.len(), 1);
        assert_eq!(enc.signatures.len(), 1);
        assert!(enc.meta(META_PILOT_LAT).is_none());
        assert_eq!(enc.last_seen, T0 + 30.0);
        assert_eq!(parse_activity_log(enc.meta(META_ACTIVITY_LOG).unwrap())[0].end_time, T0 + 30.0);
    }

    #[test]
    fn test_user_fields_carried_from_projection() {
        let mut h = Harness::new();
        let mut prev = Encounter::new("D1", T0 - 100.0);
        prev.custom_name = "neighbor".into();
        prev.trust_status = TrustStatus::Trusted;
        h.projection.upsert(LightweightEncounter::from_encounter(&prev, T0));

        let out = h.ingest(&msg("D1", 35.0, -82.0, T0));
        assert!(out.created);
        let enc = h.get("D1");
        assert_eq!(enc.custom_name, "neighbor");
        assert_eq!(enc.trust_status, TrustStatus::Trusted);
    }

    #[test]
    fn test_message_without_uid_is_dropped() {
        let mut h = Harness::new();
        let m = msg("  ", 35.0, -82.0, T0);
        let out = h
            .pipeline
            .ingest(&mut h.repo, &h.projection, &m, None, T0)
            .unwrap();
        assert!(out.is_none());
        assert_eq!(h.repo.dirty_count(), 0);
    }

    #[test]
    fn test_ingest_marks_dirty_and_updates_projection() {
        let mut h = Harness::new();
        let mut m = msg("D1", 35.0, -82.0, T0);
        m.manufacturer = Some("DJI".into());
        m.id_type = IdType::SerialNumber;
        h.ingest(&m);
        assert!(h.repo.is_dirty("D1"));
        let snap = h.projection.get();
        assert_eq!(snap["D1"].flight_points.len(), 1);
        assert_eq!(snap["D1"].metadata.get(META_MANUFACTURER).map(String::as_str), Some("DJI"));
        assert_eq!(h.get("D1").meta(META_ID_TYPE), Some(IdType::SerialNumber.as_str()));
    }
}
