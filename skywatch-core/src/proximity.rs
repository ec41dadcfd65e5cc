//! RSSI-only proximity samples.
//!
//! Each encounter keeps at most three proximity points. Once full, a new
//! sample replaces the one whose RSSI is neither the current minimum nor the
//! current maximum, so the weakest and strongest contacts survive.

use crate::types::FlightPoint;

/// Proximity points kept per encounter.
pub const PROXIMITY_CAPACITY: usize = 3;

/// Expected RSSI at 1 m from a typical remote-ID transmitter.
const REFERENCE_RSSI_1M: f64 = -40.0;

/// Log-distance path loss exponent (outdoor, some clutter).
const PATH_LOSS_EXPONENT: f64 = 2.5;

/// Estimated radius never drops below this.
pub const MIN_PROXIMITY_RADIUS_M: f64 = 10.0;

/// Rough distance to the emitter from signal strength.
pub fn estimate_radius_m(rssi: f64) -> f64 {
    let d = 10f64.powf((REFERENCE_RSSI_1M - rssi) / (10.0 * PATH_LOSS_EXPONENT));
    if d.is_finite() {
        d.max(MIN_PROXIMITY_RADIUS_M)
    } else {
        MIN_PROXIMITY_RADIUS_M
    }
}

/// What happened to a proximity sample.
#[derive(Debug, Clone, PartialEq)]
pub enum ProximityOutcome {
    /// Buffer had room.
    Appended,
    /// Replaced the middle sample, which is returned.
    Replaced(FlightPoint),
    /// Every slot holds an extreme; nothing changed.
    Discarded,
}

/// Insert `point` into the proximity slots of `points`.
///
/// `points` is an encounter's full flight path; GPS points are left untouched
/// and a replacement keeps the slot's position in the path.
pub fn insert_proximity(points: &mut Vec<FlightPoint>, point: FlightPoint) -> ProximityOutcome {
    let slots: Vec<usize> = points
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_proximity_point)
        .map(|(i, _)| i)
        .collect();

    if slots.len() < PROXIMITY_CAPACITY {
        points.push(point);
        return ProximityOutcome::Appended;
    }

    let rssi_of = |i: usize| points[i].proximity_rssi.unwrap_or(0.0);
    let min = slots.iter().map(|&i| rssi_of(i)).fold(f64::INFINITY, f64::min);
    let max = slots.iter().map(|&i| rssi_of(i)).fold(f64::NEG_INFINITY, f64::max);

    match slots.iter().copied().find(|&i| {
        let r = rssi_of(i);
        r != min && r != max
    }) {
        Some(i) => ProximityOutcome::Replaced(std::mem::replace(&mut points[i], point)),
        None => ProximityOutcome::Discarded,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
