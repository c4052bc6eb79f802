//! Ghost-mode privacy service (C4): effective-flag resolution with a
//! 30-day cache tier, durable writes through the tenant handle, and the
//! coordinate masking transform applied before any broadcast leaves the
//! publisher.

use std::sync::Arc;

use kinpoint_db::{ghost_modes, Repository};
use kinpoint_kv::KvClient;
use kinpoint_models::ghost::{GhostScope, GhostStatus};
use rand::Rng;

use crate::cache::FamilyCache;
use crate::error::CoreError;
use crate::keys;

/// Accuracy reported on every masked broadcast.
pub const MASKED_ACCURACY_M: f64 = 1000.0;
/// Displacement magnitude bounds, in degrees (≈500–1000 m).
pub const MASK_MIN_DEG: f64 = 0.005;
pub const MASK_MAX_DEG: f64 = 0.010;

/// Displace a point by a random vector with isotropic direction and
/// magnitude in `[MASK_MIN_DEG, MASK_MAX_DEG]`.
pub fn mask_coordinates(lat: f64, lon: f64) -> (f64, f64) {
    mask_with(&mut rand::thread_rng(), lat, lon)
}

fn mask_with<R: Rng>(rng: &mut R, lat: f64, lon: f64) -> (f64, f64) {
    let angle: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
    let magnitude: f64 = rng.gen_range(MASK_MIN_DEG..=MASK_MAX_DEG);
    (lat + magnitude * angle.sin(), lon + magnitude * angle.cos())
}

#[derive(Clone)]
pub struct GhostService {
    kv: Arc<KvClient>,
    repo: Arc<Repository>,
    cache: Arc<FamilyCache>,
}

impl GhostService {
    pub fn new(kv: Arc<KvClient>, repo: Arc<Repository>, cache: Arc<FamilyCache>) -> Self {
        Self { kv, repo, cache }
    }

    /// Effective ghost state for `(user, family)`: the global flag wins,
    /// then the per-family flag. Cache misses fall through to the
    /// repository and back-fill both keys; an unreachable repository reads
    /// as visible.
    pub async fn is_ghost(&self, user_id: &str, family_id: &str) -> GhostStatus {
        if self.cache.enabled() {
            let global = self.read_flag(&keys::ghost_global(user_id)).await;
            if global == Some(true) {
                return GhostStatus::global();
            }
            let family = self.read_flag(&keys::ghost_family(family_id, user_id)).await;
            if family == Some(true) {
                return GhostStatus::family();
            }
            if global.is_some() && family.is_some() {
                return GhostStatus::VISIBLE;
            }
        }

        let admin = match self.repo.admin() {
            Ok(admin) => admin,
            Err(err) => {
                tracing::warn!(%err, user_id, family_id, "ghost lookup degraded to visible");
                return GhostStatus::VISIBLE;
            }
        };
        let modes = match ghost_modes::ghost_modes_of(admin, user_id).await {
            Ok(modes) => modes,
            Err(err) => {
                tracing::warn!(%err, user_id, family_id, "ghost query failed, reading as visible");
                return GhostStatus::VISIBLE;
            }
        };

        let per_family = modes.per_family.get(family_id).copied().unwrap_or(false);
        self.write_flag(&keys::ghost_global(user_id), modes.global)
            .await;
        self.write_flag(&keys::ghost_family(family_id, user_id), per_family)
            .await;

        if modes.global {
            GhostStatus::global()
        } else if per_family {
            GhostStatus::family()
        } else {
            GhostStatus::VISIBLE
        }
    }

    /// Durable write of the global flag, then the 30-day cache entry. The
    /// repository write is the success contract; a cache write failure only
    /// logs, the entry self-heals via TTL.
    pub async fn set_global(
        &self,
        bearer: Option<&str>,
        user_id: &str,
        enabled: bool,
    ) -> Result<(), CoreError> {
        let tenant = self.repo.tenant()?;
        ghost_modes::set_global(tenant, bearer, user_id, enabled).await?;
        self.write_flag(&keys::ghost_global(user_id), enabled).await;
        Ok(())
    }

    pub async fn set_family(
        &self,
        bearer: Option<&str>,
        user_id: &str,
        family_id: &str,
        enabled: bool,
    ) -> Result<(), CoreError> {
        let tenant = self.repo.tenant()?;
        ghost_modes::set_family(tenant, bearer, user_id, family_id, enabled).await?;
        self.write_flag(&keys::ghost_family(family_id, user_id), enabled)
            .await;
        Ok(())
    }

    /// Drop a user's ghost entries across every family they belong to.
    pub async fn invalidate_user(&self, user_id: &str) -> Result<(), CoreError> {
        if !self.cache.enabled() {
            return Ok(());
        }
        let mut dropped = vec![keys::ghost_global(user_id)];
        for family_id in self.cache.families_of(user_id).await {
            dropped.push(keys::ghost_family(&family_id, user_id));
        }
        self.kv.del_all(&dropped).await?;
        Ok(())
    }

    /// Drop a family's ghost entries across its member list.
    pub async fn invalidate_family(&self, family_id: &str) -> Result<(), CoreError> {
        if !self.cache.enabled() {
            return Ok(());
        }
        let dropped: Vec<String> = self
            .cache
            .members_of(family_id)
            .await
            .iter()
            .map(|member| keys::ghost_family(family_id, &member.user_id))
            .collect();
        self.kv.del_all(&dropped).await?;
        Ok(())
    }

    async fn read_flag(&self, key: &str) -> Option<bool> {
        match self.kv.get_raw(key).await {
            Ok(Some(raw)) => Some(raw == "1"),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, key, "ghost cache read failed");
                None
            }
        }
    }

    async fn write_flag(&self, key: &str, enabled: bool) {
        if !self.cache.enabled() {
            return;
        }
        let value = if enabled { "1" } else { "0" };
        if let Err(err) = self.kv.set_raw(key, value, Some(keys::GHOST_TTL)).await {
            tracing::warn!(%err, key, "ghost cache write failed");
        }
    }
}

/// Scope a client asked to toggle, as carried by the `ghost_mode` verb.
pub fn parse_scope(raw: &str) -> Option<GhostScope> {
    match raw {
        "global" => Some(GhostScope::Global),
        "family" => Some(GhostScope::Family),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn displacement_magnitude_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let (lat, lon) = mask_with(&mut rng, 40.0, -74.0);
            let displacement = ((lat - 40.0).powi(2) + (lon + 74.0).powi(2)).sqrt();
            // Tiny tolerance for float roundoff in the recomputed norm.
            assert!(
                displacement >= MASK_MIN_DEG - 1e-12 && displacement <= MASK_MAX_DEG + 1e-12,
                "displacement {displacement} out of bounds"
            );
        }
    }

    #[test]
    fn displacement_direction_is_isotropic() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut octants = [0usize; 8];
        for _ in 0..10_000 {
            let (lat, lon) = mask_with(&mut rng, 0.0, 0.0);
            let angle = lat.atan2(lon).rem_euclid(std::f64::consts::TAU);
            let octant = (angle / (std::f64::consts::TAU / 8.0)) as usize % 8;
            octants[octant] += 1;
        }
        // Uniform direction puts ~1250 draws per octant; allow wide slack.
        for (octant, count) in octants.iter().enumerate() {
            assert!(
                (1000..=1500).contains(count),
                "octant {octant} saw {count} draws"
            );
        }
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(parse_scope("global"), Some(GhostScope::Global));
        assert_eq!(parse_scope("family"), Some(GhostScope::Family));
        assert_eq!(parse_scope("none"), None);
    }
}
