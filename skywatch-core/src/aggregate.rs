//! Cached per-encounter statistics.
//!
//! Recomputed from the child collections after every mutation so list views
//! read them in O(1). Never trusted on their own.

use crate::types::{Encounter, FlightPoint, Signature};

/// Derived statistics for one encounter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregates {
    pub max_altitude: f64,
    pub max_speed: f64,
    pub average_rssi: f64,
    pub flight_point_count: i64,
    pub signature_count: i64,
}

impl Aggregates {
    pub fn compute(points: &[FlightPoint], signatures: &[Signature]) -> Self {
        let max_altitude = points
            .iter()
            .filter(|p| !p.is_proximity_point)
            .map(|p| p.altitude)
            .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.max(a))))
            .unwrap_or(0.0);

        let max_speed = signatures
            .iter()
            .map(|s| s.speed)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |m| m.max(s))))
            .unwrap_or(0.0);

        let (sum, n) = signatures
            .iter()
            .filter(|s| s.rssi != 0.0)
            .fold((0.0, 0usize), |(sum, n), s| (sum + s.rssi, n + 1));
        let average_rssi = if n == 0 { 0.0 } else { sum / n as f64 };

        Aggregates {
            max_altitude,
            max_speed,
            average_rssi,
            flight_point_count: points.len() as i64,
            signature_count: signatures.len() as i64,
        }
    }
}

/// Recompute and store the cached fields of `enc`.
pub fn recompute(enc: &mut Encounter) {
    let agg = Aggregates::compute(&enc.flight_points, &enc.signatures);
    enc.max_altitude = agg.max_altitude;
    enc.max_speed = agg.max_speed;
    enc.average_rssi = agg.average_rssi;
    enc.flight_point_count = agg.flight_point_count;
    enc.signature_count = agg.signature_count;
}

/// True when the cached fields disagree with the child collections.
pub fn is_stale(enc: &Encounter) -> bool {
    let agg = Aggregates::compute(&enc.flight_points, &enc.signatures);
    enc.max_altitude != agg.max_altitude
        || enc.max_speed != agg.max_speed
        || enc.average_rssi != agg.average_rssi
        || enc.flight_point_count != agg.flight_point_count
        || enc.signature_count != agg.signature_count
}

/// Mean reported height over signatures (0 if none).
pub fn average_height(signatures: &[Signature]) -> f64 {
    if signatures.is_empty() {
        return 0.0;
    }
    signatures.iter().map(|s| s.height).sum::<f64>() / signatures.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
