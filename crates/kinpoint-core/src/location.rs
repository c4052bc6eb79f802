//! Location ingestion and retrieval (C5). An ingest is durable once the
//! append to the per-family log succeeds; the latest-location cache write,
//! the fan-out publish, and geofence evaluation are best-effort and only
//! log on failure.

use std::collections::HashMap;
use std::sync::Arc;

use kinpoint_kv::KvClient;
use kinpoint_models::channel;
use kinpoint_models::family::{FamilyRole, Geofence};
use kinpoint_models::location::{LocationRecord, LocationUpdate, StoredLocation};
use serde_json::json;

use crate::cache::FamilyCache;
use crate::error::CoreError;
use crate::ghost::{self, GhostService};
use crate::keys;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct IngestAck {
    pub message_id: String,
    pub server_ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct LocationHistory {
    pub locations: Vec<LocationRecord>,
    /// Last log ID seen (pre-filter), for cursor continuation.
    pub last_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemberLocation {
    pub user_id: String,
    pub role: FamilyRole,
    pub location: StoredLocation,
}

/// Whether a sample crossed a geofence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceTransition {
    Enter,
    Exit,
}

impl FenceTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }
}

#[derive(Clone)]
pub struct LocationService {
    kv: Arc<KvClient>,
    cache: Arc<FamilyCache>,
    ghost: Arc<GhostService>,
}

impl LocationService {
    pub fn new(kv: Arc<KvClient>, cache: Arc<FamilyCache>, ghost: Arc<GhostService>) -> Self {
        Self { kv, cache, ghost }
    }

    /// Persist one sample and fan it out. Fails only when the durable log
    /// append fails; the caller acks success on the returned ID.
    pub async fn ingest(
        &self,
        user_id: &str,
        update: &LocationUpdate,
    ) -> Result<IngestAck, CoreError> {
        update.validate().map_err(CoreError::BadRequest)?;

        let family_id = update.family_id.as_str();
        let server_ts_ms = chrono::Utc::now().timestamp_millis();
        let stored = StoredLocation {
            user_id: user_id.to_string(),
            family_id: family_id.to_string(),
            latitude: update.lat,
            longitude: update.lon,
            accuracy: update.accuracy,
            altitude: update.altitude,
            bearing: update.bearing,
            speed: update.speed,
            timestamp: update.client_ts_ms,
            battery_level: update.battery_pct,
            battery_state: update.battery_state.clone(),
            server_timestamp: server_ts_ms,
        };

        // Previous latest, fetched before it is overwritten; feeds geofence
        // transition detection.
        let previous = self.cache.last_location(user_id, family_id).await;

        let message_id = self
            .kv
            .append_capped(
                &keys::family_log(family_id),
                &stored.to_fields(),
                keys::LOG_SOFT_CAP,
            )
            .await?;

        if let Err(err) = self.cache.set_last_location(user_id, family_id, &stored).await {
            tracing::warn!(%err, user_id, family_id, "latest-location cache write failed");
        }

        // Masking is evaluated at the publisher (the subscriber never sees
        // raw coordinates for a ghosted user).
        let status = self.ghost.is_ghost(user_id, family_id).await;
        let (lat, lon, accuracy) = if status.enabled {
            let (lat, lon) = ghost::mask_coordinates(update.lat, update.lon);
            (lat, lon, ghost::MASKED_ACCURACY_M)
        } else {
            (update.lat, update.lon, update.accuracy)
        };

        let payload = json!({
            "type": "location_update",
            "user_id": user_id,
            "family_id": family_id,
            "lat": lat,
            "lon": lon,
            "accuracy": accuracy,
            "client_ts_ms": update.client_ts_ms,
            "battery_pct": update.battery_pct,
        });
        if let Err(err) = self
            .kv
            .publish(&channel::family_location(family_id), &payload.to_string())
            .await
        {
            tracing::warn!(%err, family_id, "location publish failed");
        }

        if !status.enabled {
            self.publish_fence_alerts(user_id, family_id, previous.as_ref(), &stored)
                .await;
        }

        Ok(IngestAck {
            message_id,
            server_ts_ms,
        })
    }

    /// Range-read of the family log with optional user filter. Coordinates
    /// of currently-ghosted members are masked at egress; the log itself
    /// stays raw.
    pub async fn history(
        &self,
        family_id: &str,
        user_filter: Option<&str>,
        limit: usize,
        after_id: &str,
    ) -> Result<LocationHistory, CoreError> {
        let entries = self
            .kv
            .read_log(&keys::family_log(family_id), after_id, limit)
            .await?;

        let last_id = entries.last().map(|entry| entry.id.clone());
        let mut ghost_memo: HashMap<String, bool> = HashMap::new();
        let mut locations = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(mut location) = StoredLocation::from_fields(&entry.fields) else {
                tracing::warn!(family_id, id = %entry.id, "skipping undecodable log entry");
                continue;
            };
            if let Some(user_id) = user_filter {
                if location.user_id != user_id {
                    continue;
                }
            }
            if self.is_hidden(&mut ghost_memo, &location.user_id, family_id).await {
                mask_stored(&mut location);
            }
            locations.push(LocationRecord {
                id: entry.id,
                location,
            });
        }

        Ok(LocationHistory { locations, last_id })
    }

    /// Current position of every family member. A member with no cache
    /// entry is recovered from the log tail; members with no sample at all
    /// are omitted.
    pub async fn all_current(&self, family_id: &str) -> Vec<MemberLocation> {
        let members = self.cache.members_of(family_id).await;
        let mut found: HashMap<String, StoredLocation> = HashMap::new();
        let mut missing: Vec<&str> = Vec::new();

        for member in &members {
            match self.cache.last_location(&member.user_id, family_id).await {
                Some(location) => {
                    found.insert(member.user_id.clone(), location);
                }
                None => missing.push(member.user_id.as_str()),
            }
        }

        if !missing.is_empty() {
            self.recover_from_log(family_id, &missing, &mut found).await;
        }

        let mut ghost_memo: HashMap<String, bool> = HashMap::new();
        let mut current = Vec::new();
        for member in &members {
            let Some(mut location) = found.remove(&member.user_id) else {
                continue;
            };
            if self.is_hidden(&mut ghost_memo, &member.user_id, family_id).await {
                mask_stored(&mut location);
            }
            current.push(MemberLocation {
                user_id: member.user_id.clone(),
                role: member.role,
                location,
            });
        }
        current
    }

    /// One newest-first scan of the log tail resolving several members at
    /// once; recovered entries are written back to the cache.
    async fn recover_from_log(
        &self,
        family_id: &str,
        wanted: &[&str],
        found: &mut HashMap<String, StoredLocation>,
    ) {
        let entries = match self
            .kv
            .read_log_rev(&keys::family_log(family_id), keys::LOG_SOFT_CAP)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(%err, family_id, "log recovery scan failed");
                return;
            }
        };
        let mut remaining: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|user| !found.contains_key(*user))
            .collect();
        for entry in entries {
            if remaining.is_empty() {
                break;
            }
            let Some(location) = StoredLocation::from_fields(&entry.fields) else {
                continue;
            };
            if let Some(position) = remaining.iter().position(|user| *user == location.user_id) {
                let user_id = remaining.swap_remove(position);
                if let Err(err) = self
                    .cache
                    .set_last_location(user_id, family_id, &location)
                    .await
                {
                    tracing::warn!(%err, user_id, family_id, "recovered-location cache write failed");
                }
                found.insert(user_id.to_string(), location);
            }
        }
    }

    async fn publish_fence_alerts(
        &self,
        user_id: &str,
        family_id: &str,
        previous: Option<&StoredLocation>,
        sample: &StoredLocation,
    ) {
        let fences = self.cache.geofences_of(family_id).await;
        if fences.is_empty() {
            return;
        }
        for (fence, transition) in fence_transitions(previous, sample, &fences) {
            let payload = json!({
                "type": "geofence_alert",
                "user_id": user_id,
                "family_id": family_id,
                "geofence_id": fence.id,
                "geofence_name": fence.name,
                "transition": transition.as_str(),
                "server_ts_ms": sample.server_timestamp,
            });
            if let Err(err) = self
                .kv
                .publish(&channel::family_alerts(family_id), &payload.to_string())
                .await
            {
                tracing::warn!(%err, family_id, "geofence alert publish failed");
            }
        }
    }

    async fn is_hidden(
        &self,
        memo: &mut HashMap<String, bool>,
        user_id: &str,
        family_id: &str,
    ) -> bool {
        if let Some(hidden) = memo.get(user_id) {
            return *hidden;
        }
        let hidden = self.ghost.is_ghost(user_id, family_id).await.enabled;
        memo.insert(user_id.to_string(), hidden);
        hidden
    }
}

fn mask_stored(location: &mut StoredLocation) {
    let (lat, lon) = ghost::mask_coordinates(location.latitude, location.longitude);
    location.latitude = lat;
    location.longitude = lon;
    location.accuracy = ghost::MASKED_ACCURACY_M;
}

/// Boundary crossings between the previous and current sample. A first
/// sample (no previous) never fires; only known transitions do.
pub fn fence_transitions<'f>(
    previous: Option<&StoredLocation>,
    sample: &StoredLocation,
    fences: &'f [Geofence],
) -> Vec<(&'f Geofence, FenceTransition)> {
    let mut transitions = Vec::new();
    let Some(previous) = previous else {
        return transitions;
    };
    for fence in fences.iter().filter(|fence| fence.enabled) {
        let was_inside = haversine_m(
            previous.latitude,
            previous.longitude,
            fence.center_lat,
            fence.center_lon,
        ) <= fence.radius_m;
        let now_inside = haversine_m(
            sample.latitude,
            sample.longitude,
            fence.center_lat,
            fence.center_lon,
        ) <= fence.radius_m;
        match (was_inside, now_inside) {
            (false, true) => transitions.push((fence, FenceTransition::Enter)),
            (true, false) => transitions.push((fence, FenceTransition::Exit)),
            _ => {}
        }
    }
    transitions
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(lat: f64, lon: f64) -> StoredLocation {
        StoredLocation {
            user_id: "u1".into(),
            family_id: "fA".into(),
            latitude: lat,
            longitude: lon,
            accuracy: 5.0,
            altitude: None,
            bearing: None,
            speed: None,
            timestamp: 1_700_000_000_000,
            battery_level: 80,
            battery_state: None,
            server_timestamp: 1_700_000_000_100,
        }
    }

    fn fence(radius_m: f64) -> Geofence {
        Geofence {
            id: "g1".into(),
            family_id: "fA".into(),
            name: "Home".into(),
            center_lat: 12.9716,
            center_lon: 77.5946,
            radius_m,
            enabled: true,
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Bangalore -> Chennai, roughly 290 km.
        let distance = haversine_m(12.9716, 77.5946, 13.0827, 80.2707);
        assert!((280_000.0..300_000.0).contains(&distance), "{distance}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert!(haversine_m(40.0, -74.0, 40.0, -74.0) < 1e-6);
    }

    #[test]
    fn fence_enter_and_exit() {
        let fences = vec![fence(500.0)];
        let far = sample_at(12.9916, 77.5946);
        let near = sample_at(12.9717, 77.5946);

        let transitions = fence_transitions(Some(&far), &near, &fences);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].1, FenceTransition::Enter);

        let transitions = fence_transitions(Some(&near), &far, &fences);
        assert_eq!(transitions[0].1, FenceTransition::Exit);
    }

    #[test]
    fn fence_quiet_without_crossing_or_previous() {
        let fences = vec![fence(500.0)];
        let near = sample_at(12.9717, 77.5946);
        let also_near = sample_at(12.9718, 77.5946);

        assert!(fence_transitions(None, &near, &fences).is_empty());
        assert!(fence_transitions(Some(&near), &also_near, &fences).is_empty());
    }

    #[test]
    fn disabled_fence_never_fires() {
        let mut disabled = fence(500.0);
        disabled.enabled = false;
        let fences = vec![disabled];
        let far = sample_at(12.9916, 77.5946);
        let near = sample_at(12.9717, 77.5946);
        assert!(fence_transitions(Some(&far), &near, &fences).is_empty());
    }
}
