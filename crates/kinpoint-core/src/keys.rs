//! Cache key schema and TTLs. Every derived value in the KV tier is built
//! from these helpers so invalidation and read-through always agree on the
//! key text.

use std::time::Duration;

pub const MEMBERS_TTL: Duration = Duration::from_secs(60 * 60);
pub const FAMILIES_TTL: Duration = Duration::from_secs(60 * 60);
pub const GEOFENCE_TTL: Duration = Duration::from_secs(60 * 60);
pub const ROLE_TTL: Duration = Duration::from_secs(60 * 60);
pub const LAST_LOCATION_TTL: Duration = Duration::from_secs(5 * 60);
pub const ONLINE_TTL: Duration = Duration::from_secs(2 * 60);
pub const GHOST_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Soft cap on per-family log length.
pub const LOG_SOFT_CAP: usize = 10_000;

pub fn family_members(family_id: &str) -> String {
    format!("family:{family_id}:members")
}

pub fn user_families(user_id: &str) -> String {
    format!("user:{user_id}:families")
}

pub fn geofences(family_id: &str) -> String {
    format!("geofence:{family_id}")
}

pub fn role(user_id: &str, family_id: &str) -> String {
    format!("user:{user_id}:family:{family_id}:role")
}

pub fn last_location(user_id: &str, family_id: &str) -> String {
    format!("user:{user_id}:family:{family_id}:last_location")
}

pub fn online(user_id: &str, family_id: &str) -> String {
    format!("user:{user_id}:family:{family_id}:online")
}

pub fn ghost_global(user_id: &str) -> String {
    format!("ghost:global:{user_id}")
}

pub fn ghost_family(family_id: &str, user_id: &str) -> String {
    format!("ghost:family:{family_id}:{user_id}")
}

/// Per-family append log. No TTL; length is soft-capped at append time.
pub fn family_log(family_id: &str) -> String {
    format!("locations:family:{family_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_texts() {
        assert_eq!(family_members("fA"), "family:fA:members");
        assert_eq!(user_families("u1"), "user:u1:families");
        assert_eq!(geofences("fA"), "geofence:fA");
        assert_eq!(role("u1", "fA"), "user:u1:family:fA:role");
        assert_eq!(
            last_location("u1", "fA"),
            "user:u1:family:fA:last_location"
        );
        assert_eq!(online("u1", "fA"), "user:u1:family:fA:online");
        assert_eq!(ghost_global("u1"), "ghost:global:u1");
        assert_eq!(ghost_family("fA", "u1"), "ghost:family:fA:u1");
        assert_eq!(family_log("fA"), "locations:family:fA");
    }
}
