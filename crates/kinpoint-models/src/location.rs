use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Inbound `location_update` payload as sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub family_id: String,
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub client_ts_ms: i64,
    #[serde(default = "default_battery")]
    pub battery_pct: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<String>,
}

fn default_battery() -> i64 {
    100
}

impl LocationUpdate {
    /// Range validation for an incoming sample. Returns the first problem
    /// found, phrased for the client-facing ack.
    pub fn validate(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(format!("latitude out of range: {}", self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(format!("longitude out of range: {}", self.lon));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(format!("invalid accuracy: {}", self.accuracy));
        }
        if !(0..=100).contains(&self.battery_pct) {
            return Err(format!("battery_pct out of range: {}", self.battery_pct));
        }
        Ok(())
    }
}

/// A decoded location record, either the latest-location cache value or an
/// entry read back from the per-family log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLocation {
    pub user_id: String,
    pub family_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Client-reported capture time, epoch milliseconds.
    pub timestamp: i64,
    pub battery_level: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<String>,
    /// Server receive time, epoch milliseconds.
    pub server_timestamp: i64,
}

impl StoredLocation {
    /// Log field layout for `locations:family:<fid>`. Every value is written
    /// as a string; numeric fields are re-parsed on read.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("user_id", self.user_id.clone()),
            ("family_id", self.family_id.clone()),
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("accuracy", self.accuracy.to_string()),
            ("timestamp", self.timestamp.to_string()),
            ("battery_level", self.battery_level.to_string()),
            ("server_timestamp", self.server_timestamp.to_string()),
        ];
        if let Some(altitude) = self.altitude {
            fields.push(("altitude", altitude.to_string()));
        }
        if let Some(bearing) = self.bearing {
            fields.push(("bearing", bearing.to_string()));
        }
        if let Some(speed) = self.speed {
            fields.push(("speed", speed.to_string()));
        }
        if let Some(state) = &self.battery_state {
            fields.push(("battery_state", state.clone()));
        }
        fields
    }

    /// Decode a log entry's field map. Returns `None` when a required field
    /// is absent or unparseable; `battery_level` defaults to 100.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            user_id: fields.get("user_id")?.clone(),
            family_id: fields.get("family_id")?.clone(),
            latitude: parse_f64(fields, "latitude")?,
            longitude: parse_f64(fields, "longitude")?,
            accuracy: parse_f64(fields, "accuracy")?,
            altitude: parse_f64(fields, "altitude"),
            bearing: parse_f64(fields, "bearing"),
            speed: parse_f64(fields, "speed"),
            timestamp: parse_i64(fields, "timestamp")?,
            battery_level: parse_i64(fields, "battery_level").unwrap_or(100),
            battery_state: fields.get("battery_state").cloned(),
            server_timestamp: parse_i64(fields, "server_timestamp")?,
        })
    }
}

/// A log entry paired with its server-assigned monotonic ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: String,
    #[serde(flatten)]
    pub location: StoredLocation,
}

fn parse_f64(fields: &HashMap<String, String>, key: &str) -> Option<f64> {
    fields.get(key).and_then(|raw| raw.parse::<f64>().ok())
}

fn parse_i64(fields: &HashMap<String, String>, key: &str) -> Option<i64> {
    fields.get(key).and_then(|raw| raw.parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> HashMap<String, String> {
        [
            ("user_id", "u1"),
            ("family_id", "fA"),
            ("latitude", "12.9716"),
            ("longitude", "77.5946"),
            ("accuracy", "5"),
            ("timestamp", "1700000000000"),
            ("battery_level", "78"),
            ("server_timestamp", "1700000000100"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn decode_round_trip() {
        let decoded = StoredLocation::from_fields(&sample_fields()).unwrap();
        assert_eq!(decoded.latitude, 12.9716);
        assert_eq!(decoded.longitude, 77.5946);
        assert_eq!(decoded.battery_level, 78);

        let re_encoded: HashMap<String, String> = decoded
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let again = StoredLocation::from_fields(&re_encoded).unwrap();
        assert_eq!(again.server_timestamp, 1_700_000_000_100);
    }

    #[test]
    fn battery_defaults_to_full() {
        let mut fields = sample_fields();
        fields.remove("battery_level");
        let decoded = StoredLocation::from_fields(&fields).unwrap();
        assert_eq!(decoded.battery_level, 100);
    }

    #[test]
    fn missing_coordinate_is_rejected() {
        let mut fields = sample_fields();
        fields.remove("latitude");
        assert!(StoredLocation::from_fields(&fields).is_none());
    }

    #[test]
    fn update_validation() {
        let update = LocationUpdate {
            family_id: "fA".into(),
            lat: 12.9716,
            lon: 77.5946,
            accuracy: 5.0,
            altitude: None,
            bearing: None,
            speed: None,
            client_ts_ms: 1_700_000_000_000,
            battery_pct: 78,
            battery_state: None,
        };
        assert!(update.validate().is_ok());

        let mut bad = update.clone();
        bad.lat = 91.0;
        assert!(bad.validate().is_err());

        let mut bad = update.clone();
        bad.battery_pct = 101;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn battery_pct_defaults_when_absent() {
        let update: LocationUpdate = serde_json::from_value(serde_json::json!({
            "family_id": "fA",
            "lat": 1.0,
            "lon": 2.0,
            "accuracy": 10.0,
            "client_ts_ms": 1_700_000_000_000i64,
        }))
        .unwrap();
        assert_eq!(update.battery_pct, 100);
    }
}
