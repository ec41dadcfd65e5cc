//! Inbound detection messages handed over by the transport layer.
//!
//! Partial telemetry is normal. Every scalar field tolerates absence, `null`
//! and values of the wrong JSON type: numbers may arrive as strings, flags as
//! `"true"` or `1`, and identifiers as bare numbers. Anything unparseable
//! reads as zero, false or missing.

use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::types::is_null_island;

// ---------------------------------------------------------------------------
// ID type
// ---------------------------------------------------------------------------

/// Remote-ID identifier type carried with the uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IdType {
    /// ANSI/CTA-2063-A serial number; stable across sessions.
    SerialNumber,
    /// Civil aviation authority registration.
    CaaRegistration,
    /// UTM-assigned UUID.
    UtmAssigned,
    /// Per-flight session id.
    SpecificSession,
    #[default]
    Unknown,
}

impl IdType {
    /// Map a transport label ("Serial Number (ANSI/CTA-2063-A)", "CAA", ...).
    pub fn from_label(label: &str) -> Self {
        let l = label.to_ascii_lowercase();
        if l.contains("serial") {
            IdType::SerialNumber
        } else if l.contains("caa") || l.contains("registration") {
            IdType::CaaRegistration
        } else if l.contains("utm") {
            IdType::UtmAssigned
        } else if l.contains("session") {
            IdType::SpecificSession
        } else {
            IdType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::SerialNumber => "Serial Number",
            IdType::CaaRegistration => "CAA Registration",
            IdType::UtmAssigned => "UTM Assigned",
            IdType::SpecificSession => "Specific Session",
            IdType::Unknown => "Unknown",
        }
    }

    pub fn is_stable_serial(&self) -> bool {
        matches!(self, IdType::SerialNumber)
    }
}

impl<'de> Deserialize<'de> for IdType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = lenient_opt_string(deserializer)?;
        Ok(label.map(|l| IdType::from_label(&l)).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A secondary emitter observed alongside the primary one (e.g. the BLE and
/// WiFi radios of the same drone).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSource {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub mac: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub rssi: Option<f64>,
}

/// One parsed detection message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uid: String,
    #[serde(default)]
    pub id_type: IdType,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub mac: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub caa_registration: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub alt: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub home_lat: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub home_lon: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub pilot_lat: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub pilot_lon: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub speed: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub height: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub signal_sources: Vec<SignalSource>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_short_range_detection: bool,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub timestamp: Option<f64>,
}

impl DetectionMessage {
    pub fn has_position(&self) -> bool {
        !is_null_island(self.lat, self.lon)
    }

    pub fn has_home(&self) -> bool {
        !is_null_island(self.home_lat, self.home_lon)
    }

    pub fn has_pilot(&self) -> bool {
        !is_null_island(self.pilot_lat, self.pilot_lon)
    }

    /// Signal strength with zero meaning "none reported".
    pub fn rssi_value(&self) -> f64 {
        self.rssi.unwrap_or(0.0)
    }

    /// Non-empty message MAC.
    pub fn mac_str(&self) -> Option<&str> {
        non_empty(self.mac.as_deref())
    }

    /// Non-empty registration code.
    pub fn registration(&self) -> Option<&str> {
        non_empty(self.caa_registration.as_deref())
    }

    /// Message MAC followed by every signal-source MAC, deduplicated.
    pub fn all_macs(&self) -> Vec<&str> {
        let mut macs: Vec<&str> = Vec::new();
        let sources = self.signal_sources.iter().map(|s| s.mac.as_deref());
        for mac in std::iter::once(self.mac.as_deref()).chain(sources) {
            if let Some(m) = non_empty(mac) {
                if !macs.iter().any(|x| x.eq_ignore_ascii_case(m)) {
                    macs.push(m);
                }
            }
        }
        macs
    }
}

/// Observer's own position, used to anchor RSSI-only proximity samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverStatus {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub longitude: f64,
}

impl ObserverStatus {
    pub fn has_fix(&self) -> bool {
        !is_null_island(self.latitude, self.longitude)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Lenient numeric deserialization
// ---------------------------------------------------------------------------

struct LenientF64;

impl<'de> Visitor<'de> for LenientF64 {
    type Value = Option<f64>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number, numeric string, or null")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(v).filter(|v| v.is_finite()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(v.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(LenientF64)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(None)
    }
}

/// Numeric field that reads as 0 when absent or malformed.
pub fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(d.deserialize_any(LenientF64)?.unwrap_or(0.0))
}

/// Optional numeric field; malformed values read as `None`.
pub fn lenient_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    d.deserialize_any(LenientF64)
}

// ---------------------------------------------------------------------------
// Lenient flag and text deserialization
// ---------------------------------------------------------------------------

struct LenientBool;

impl<'de> Visitor<'de> for LenientBool {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a boolean, 0/1, or \"true\"/\"false\"")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(v != 0)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(v != 0)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(v.is_finite() && v != 0.0)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        let v = v.trim();
        Ok(["true", "yes", "1"].iter().any(|t| v.eq_ignore_ascii_case(t)))
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(false)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(false)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(LenientBool)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(false)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(false)
    }
}

/// Flag that reads as false when absent or malformed.
pub fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    d.deserialize_any(LenientBool)
}

struct LenientString;

impl<'de> Visitor<'de> for LenientString {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string, number, or null")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()).filter(|_| v.is_finite()))
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(LenientString)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(None)
    }
}

/// Text field that reads as empty when absent or malformed. Numbers keep
/// their decimal form.
pub fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(d.deserialize_any(LenientString)?.unwrap_or_default())
}

/// Optional text field; numbers keep their decimal form, other types read as `None`.
pub fn lenient_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    d.deserialize_any(LenientString)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_labels() {
        assert_eq!(
            IdType::from_label("Serial Number (ANSI/CTA-2063-A)"),
            IdType::SerialNumber
        );
        assert_eq!(IdType::from_label("CAA"), IdType::CaaRegistration);
        assert_eq!(IdType::from_label("UTM Assigned UUID"), IdType::UtmAssigned);
        assert_eq!(IdType::from_label("Specific Session ID"), IdType::SpecificSession);
        assert_eq!(IdType::from_label("None"), IdType::Unknown);
        assert!(IdType::SerialNumber.is_stable_serial());
        assert!(!IdType::CaaRegistration.is_stable_serial());
    }

    #[test]
    fn test_all_macs_dedupes_sources() {
        let msg = DetectionMessage {
            mac: Some("AA:BB".into()),
            signal_sources: vec![
                SignalSource {
                    mac: Some("aa:bb".into()),
                    rssi: Some(-60.0),
                },
                SignalSource {
                    mac: Some("CC:DD".into()),
                    rssi: None,
                },
                SignalSource {
                    mac: Some("  ".into()),
                    rssi: None,
                },
            ],
            ..Default::default()
        };
        assert_eq!(msg.all_macs(), vec!["AA:BB", "CC:DD"]);
    }

    #[test]
    fn test_position_helpers() {
        let msg = DetectionMessage {
            lat: 10.0,
            lon: 0.0,
            ..Default::default()
        };
        assert!(msg.has_position());
        assert!(!msg.has_home());
        assert!(!msg.has_pilot());
        assert_eq!(msg.rssi_value(), 0.0);
    }

    #[test]
    fn test_malformed_numbers_default_to_zero() {
        let json = r#"{
            "uid": "D1",
            "idType": "Serial Number (ANSI/CTA-2063-A)",
            "lat": "35.25",
            "lon": "not-a-number",
            "alt": null,
            "speed": {"nested": 1},
            "rssi": "-71",
            "height": [1, 2],
            "isShortRangeDetection": true
        }"#;
        let msg: DetectionMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.uid, "D1");
        assert_eq!(msg.id_type, IdType::SerialNumber);
        assert_eq!(msg.lat, 35.25);
        assert_eq!(msg.lon, 0.0);
        assert_eq!(msg.alt, 0.0);
        assert_eq!(msg.speed, 0.0);
        assert_eq!(msg.rssi, Some(-71.0));
        assert_eq!(msg.height, None);
        assert!(msg.is_short_range_detection);
        assert!(msg.signal_sources.is_empty());
    }

    #[test]
    fn test_flags_and_identifiers_tolerate_wrong_types() {
        let json = r#"{
            "uid": 40213,
            "idType": 7,
            "mac": 112233,
            "caaRegistration": ["GB", "1"],
            "manufacturer": false,
            "signalSources": [{"mac": null, "rssi": -60}, {"mac": 445566}],
            "isShortRangeDetection": "true"
        }"#;
        let msg: DetectionMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.uid, "40213");
        assert_eq!(msg.id_type, IdType::Unknown);
        assert_eq!(msg.mac.as_deref(), Some("112233"));
        assert_eq!(msg.caa_registration, None);
        assert_eq!(msg.manufacturer, None);
        assert!(msg.is_short_range_detection);
        assert_eq!(msg.all_macs(), vec!["112233", "445566"]);
    }

    #[test]
    fn test_short_range_flag_forms() {
        let flag = |v: &str| -> bool {
            let msg: DetectionMessage =
                serde_json::from_str(&format!(r#"{{"uid": "D1", "isShortRangeDetection": {v}}}"#)).unwrap();
            msg.is_short_range_detection
        };
        assert!(flag("true"));
        assert!(flag(r#""TRUE""#));
        assert!(flag("1"));
        assert!(flag(r#""1""#));
        assert!(!flag(r#""false""#));
        assert!(!flag("0"));
        assert!(!flag("null"));
        assert!(!flag(r#""maybe""#));
        assert!(!flag(r#"{"x": true}"#));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let msg: DetectionMessage = serde_json::from_str(r#"{"uid": "X"}"#).unwrap();
        assert_eq!(msg.id_type, IdType::Unknown);
        assert_eq!(msg.rssi, None);
        assert!(msg.timestamp.is_none());
    }

    #[test]
    fn test_observer_fix() {
        assert!(!ObserverStatus::default().has_fix());
        let obs = ObserverStatus {
            latitude: 35.0,
            longitude: -82.0,
        };
        assert!(obs.has_fix());
    }
}
