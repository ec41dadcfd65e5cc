//! Shared types, error enum, and the encounter data model for skywatch-core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by skywatch-core.
#[derive(Debug, Error)]
pub enum SkywatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SkywatchError>;

// ---------------------------------------------------------------------------
// Metadata keys
// ---------------------------------------------------------------------------

pub const META_MAC: &str = "mac";
pub const META_CAA_REGISTRATION: &str = "caaRegistration";
pub const META_ID_TYPE: &str = "idType";
pub const META_MANUFACTURER: &str = "manufacturer";
pub const META_PILOT_LAT: &str = "pilotLat";
pub const META_PILOT_LON: &str = "pilotLon";
pub const META_PILOT_HISTORY: &str = "pilotHistory";
pub const META_HOME_LAT: &str = "homeLat";
pub const META_HOME_LON: &str = "homeLon";
pub const META_HOME_HISTORY: &str = "homeHistory";
pub const META_SESSION_HISTORY: &str = "sessionHistory";
pub const META_ACTIVITY_LOG: &str = "activityLog";
pub const META_DO_NOT_TRACK: &str = "doNotTrack";
pub const META_TOTAL_DETECTIONS: &str = "totalDetections";

/// True when a coordinate pair is the `(0,0)` "no fix" placeholder.
pub fn is_null_island(lat: f64, lon: f64) -> bool {
    lat == 0.0 && lon == 0.0
}

// ---------------------------------------------------------------------------
// Trust status
// ---------------------------------------------------------------------------

/// User-assigned trust classification for an encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Trusted,
    #[default]
    Unknown,
    Untrusted,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Trusted => "trusted",
            TrustStatus::Unknown => "unknown",
            TrustStatus::Untrusted => "untrusted",
        }
    }

    /// Parse a stored label. Unrecognized labels map to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "trusted" => TrustStatus::Trusted,
            "untrusted" => TrustStatus::Untrusted,
            _ => TrustStatus::Unknown,
        }
    }
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Child records
// ---------------------------------------------------------------------------

/// One retained position sample.
///
/// `row_id` is the storage row backing this point; `None` until the point has
/// been written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub timestamp: f64,
    #[serde(default)]
    pub home_latitude: Option<f64>,
    #[serde(default)]
    pub home_longitude: Option<f64>,
    #[serde(default)]
    pub is_proximity_point: bool,
    #[serde(default)]
    pub proximity_rssi: Option<f64>,
    #[serde(default)]
    pub proximity_radius: Option<f64>,
    #[serde(skip)]
    pub row_id: Option<i64>,
}

impl FlightPoint {
    /// Emitter-reported GPS sample. `None` for the `(0,0)` placeholder.
    pub fn gps(
        latitude: f64,
        longitude: f64,
        altitude: f64,
        timestamp: f64,
        home: Option<(f64, f64)>,
    ) -> Option<Self> {
        if is_null_island(latitude, longitude) {
            return None;
        }
        let home = home.filter(|(lat, lon)| !is_null_island(*lat, *lon));
        Some(FlightPoint {
            latitude,
            longitude,
            altitude,
            timestamp,
            home_latitude: home.map(|h| h.0),
            home_longitude: home.map(|h| h.1),
            is_proximity_point: false,
            proximity_rssi: None,
            proximity_radius: None,
            row_id: None,
        })
    }

    /// Signal-strength sample anchored at the observer's own position.
    pub fn proximity(latitude: f64, longitude: f64, rssi: f64, radius: f64, timestamp: f64) -> Self {
        FlightPoint {
            latitude,
            longitude,
            altitude: 0.0,
            timestamp,
            home_latitude: None,
            home_longitude: None,
            is_proximity_point: true,
            proximity_rssi: Some(rssi),
            proximity_radius: Some(radius),
            row_id: None,
        }
    }

    /// A point that may be written to storage.
    pub fn is_persistable(&self) -> bool {
        self.is_proximity_point || !is_null_island(self.latitude, self.longitude)
    }
}

/// One retained signal-quality sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub timestamp: f64,
    pub rssi: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(skip)]
    pub row_id: Option<i64>,
}

impl Signature {
    /// Build a sample. A zero RSSI is a placeholder and yields `None`.
    pub fn new(timestamp: f64, rssi: f64, speed: f64, height: f64, mac: Option<String>) -> Option<Self> {
        if rssi == 0.0 {
            return None;
        }
        Some(Signature {
            timestamp,
            rssi,
            speed,
            height,
            mac,
            row_id: None,
        })
    }
}

/// One contiguous window of observed transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub start_time: f64,
    pub end_time: f64,
}

// ---------------------------------------------------------------------------
// Encounter
// ---------------------------------------------------------------------------

/// One physically distinct emitter and everything retained about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    pub id: String,
    pub first_seen: f64,
    pub last_seen: f64,
    #[serde(default)]
    pub custom_name: String,
    #[serde(default)]
    pub trust_status: TrustStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    #[serde(default)]
    pub flight_points: Vec<FlightPoint>,
    #[serde(default)]
    pub signatures: Vec<Signature>,

    // Cached aggregates (see `aggregate::recompute`)
    #[serde(default)]
    pub max_altitude: f64,
    #[serde(default)]
    pub max_speed: f64,
    #[serde(default, rename = "averageRSSI")]
    pub average_rssi: f64,
    #[serde(default)]
    pub flight_point_count: i64,
    #[serde(default)]
    pub signature_count: i64,
}

impl Encounter {
    pub fn new(id: &str, timestamp: f64) -> Self {
        Encounter {
            id: id.to_string(),
            first_seen: timestamp,
            last_seen: timestamp,
            custom_name: String::new(),
            trust_status: TrustStatus::Unknown,
            metadata: BTreeMap::new(),
            mac_addresses: Vec::new(),
            flight_points: Vec::new(),
            signatures: Vec::new(),
            max_altitude: 0.0,
            max_speed: 0.0,
            average_rssi: 0.0,
            flight_point_count: 0,
            signature_count: 0,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.meta(key).and_then(|v| v.parse().ok())
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn do_not_track(&self) -> bool {
        self.meta(META_DO_NOT_TRACK) == Some("true")
    }

    /// Add a MAC to the ordered set. Returns true if it was new.
    pub fn add_mac(&mut self, mac: &str) -> bool {
        let mac = mac.trim();
        if mac.is_empty() || self.mac_addresses.iter().any(|m| m.eq_ignore_ascii_case(mac)) {
            return false;
        }
        self.mac_addresses.push(mac.to_string());
        true
    }

    pub fn has_mac(&self, mac: &str) -> bool {
        self.mac_addresses.iter().any(|m| m.eq_ignore_ascii_case(mac))
    }

    /// Last retained emitter GPS sample (proximity points excluded).
    pub fn last_gps_point(&self) -> Option<&FlightPoint> {
        self.flight_points.iter().rev().find(|p| !p.is_proximity_point)
    }

    pub fn first_gps_point(&self) -> Option<&FlightPoint> {
        self.flight_points.iter().find(|p| !p.is_proximity_point)
    }

    pub fn proximity_point_count(&self) -> usize {
        self.flight_points.iter().filter(|p| p.is_proximity_point).count()
    }

    pub fn duration(&self) -> f64 {
        (self.last_seen - self.first_seen).max(0.0)
    }

    /// Seconds the drone was actually transmitting, from the activity log.
    pub fn active_seconds(&self) -> f64 {
        let windows = crate::activity::parse_activity_log(self.meta(META_ACTIVITY_LOG).unwrap_or(""));
        crate::activity::total_active_seconds(&windows)
    }

    /// Name to show in lists: custom name, else the canonical id.
    pub fn display_name(&self) -> &str {
        if self.custom_name.is_empty() {
            &self.id
        } else {
            &self.custom_name
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
