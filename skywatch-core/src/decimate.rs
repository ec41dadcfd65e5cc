//! Flight path decimation.
//!
//! A candidate position is kept when it moved far enough OR enough time
//! passed since the last kept one: slow emitters still accrue a point every
//! couple of seconds, fast ones accrue on every measurable move.

use crate::types::FlightPoint;

/// Minimum great-circle move (meters) that always earns a new point.
pub const MIN_DISTANCE_M: f64 = 0.1;

/// Maximum gap (seconds) before a stationary emitter earns a new point.
pub const MAX_INTERVAL_SEC: f64 = 2.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Decide whether `candidate` is worth retaining after `last`.
///
/// Proximity points and `(0,0)` placeholders are never candidates.
pub fn should_retain(last: Option<&FlightPoint>, candidate: &FlightPoint) -> bool {
    if candidate.is_proximity_point || !candidate.is_persistable() {
        return false;
    }
    let last = match last {
        Some(p) => p,
        None => return true,
    };

    let moved = haversine_m(
        last.latitude,
        last.longitude,
        candidate.latitude,
        candidate.longitude,
    );
    moved > MIN_DISTANCE_M || (candidate.timestamp - last.timestamp) > MAX_INTERVAL_SEC
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
