//! Read-through, write-invalidate cache over the record of truth (C3).
//!
//! Every getter checks the KV tier first and falls back to the repository's
//! admin handle on a miss, writing the result back under the schema in
//! [`crate::keys`]. Repository failures degrade to empty results; a miss is
//! never cached. The whole layer can be switched off, after which getters
//! query the repository directly and every cache write is a no-op.

use std::sync::Arc;

use kinpoint_db::{memberships, Repository};
use kinpoint_kv::KvClient;
use kinpoint_models::family::{FamilyMember, FamilyRole, Geofence};
use kinpoint_models::location::StoredLocation;

use crate::error::CoreError;
use crate::keys;

#[derive(Clone)]
pub struct FamilyCache {
    kv: Arc<KvClient>,
    repo: Arc<Repository>,
    enabled: bool,
}

impl FamilyCache {
    pub fn new(kv: Arc<KvClient>, repo: Arc<Repository>, enabled: bool) -> Self {
        if !enabled {
            tracing::info!("cache layer disabled; membership reads go straight to the repository");
        }
        Self { kv, repo, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    // ── Read-through getters ─────────────────────────────────────────────

    pub async fn members_of(&self, family_id: &str) -> Vec<FamilyMember> {
        let key = keys::family_members(family_id);
        if self.enabled {
            match self.kv.get_json::<Vec<FamilyMember>>(&key).await {
                Ok(Some(members)) => return members,
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, family_id, "members cache read failed"),
            }
        }

        let admin = match self.repo.admin() {
            Ok(admin) => admin,
            Err(err) => {
                tracing::warn!(%err, family_id, "members lookup degraded to empty");
                return Vec::new();
            }
        };
        let rows = match memberships::members_of(admin, family_id).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%err, family_id, "members query failed");
                return Vec::new();
            }
        };
        let members: Vec<FamilyMember> = rows.into_iter().filter_map(member_from_row).collect();
        if self.enabled {
            if let Err(err) = self
                .kv
                .set_json(&key, &members, Some(keys::MEMBERS_TTL))
                .await
            {
                tracing::warn!(%err, family_id, "members cache write failed");
            }
        }
        members
    }

    pub async fn families_of(&self, user_id: &str) -> Vec<String> {
        let key = keys::user_families(user_id);
        if self.enabled {
            match self.kv.get_json::<Vec<String>>(&key).await {
                Ok(Some(family_ids)) => return family_ids,
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, user_id, "families cache read failed"),
            }
        }

        let admin = match self.repo.admin() {
            Ok(admin) => admin,
            Err(err) => {
                tracing::warn!(%err, user_id, "families lookup degraded to empty");
                return Vec::new();
            }
        };
        let family_ids = match memberships::families_of(admin, user_id).await {
            Ok(family_ids) => family_ids,
            Err(err) => {
                tracing::warn!(%err, user_id, "families query failed");
                return Vec::new();
            }
        };
        if self.enabled {
            if let Err(err) = self
                .kv
                .set_json(&key, &family_ids, Some(keys::FAMILIES_TTL))
                .await
            {
                tracing::warn!(%err, user_id, "families cache write failed");
            }
        }
        family_ids
    }

    pub async fn role_of(&self, user_id: &str, family_id: &str) -> Option<FamilyRole> {
        let key = keys::role(user_id, family_id);
        if self.enabled {
            match self.kv.get_raw(&key).await {
                Ok(Some(raw)) => return FamilyRole::parse(&raw),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, user_id, family_id, "role cache read failed"),
            }
        }

        let admin = self.repo.admin().ok()?;
        let raw = match memberships::role_of(admin, user_id, family_id).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(%err, user_id, family_id, "role query failed");
                return None;
            }
        };
        let role = FamilyRole::parse(&raw);
        if self.enabled {
            if let Some(role) = role {
                if let Err(err) = self
                    .kv
                    .set_raw(&key, role.as_str(), Some(keys::ROLE_TTL))
                    .await
                {
                    tracing::warn!(%err, user_id, family_id, "role cache write failed");
                }
            }
        }
        role
    }

    pub async fn geofences_of(&self, family_id: &str) -> Vec<Geofence> {
        let key = keys::geofences(family_id);
        if self.enabled {
            match self.kv.get_json::<Vec<Geofence>>(&key).await {
                Ok(Some(fences)) => return fences,
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, family_id, "geofence cache read failed"),
            }
        }

        let admin = match self.repo.admin() {
            Ok(admin) => admin,
            Err(err) => {
                tracing::warn!(%err, family_id, "geofence lookup degraded to empty");
                return Vec::new();
            }
        };
        let fences = match kinpoint_db::geofences::geofences_of(admin, family_id).await {
            Ok(fences) => fences,
            Err(err) => {
                tracing::warn!(%err, family_id, "geofence query failed");
                return Vec::new();
            }
        };
        if self.enabled {
            if let Err(err) = self
                .kv
                .set_json(&key, &fences, Some(keys::GEOFENCE_TTL))
                .await
            {
                tracing::warn!(%err, family_id, "geofence cache write failed");
            }
        }
        fences
    }

    // ── Latest location & presence ───────────────────────────────────────

    pub async fn last_location(&self, user_id: &str, family_id: &str) -> Option<StoredLocation> {
        if !self.enabled {
            return None;
        }
        match self
            .kv
            .get_json::<StoredLocation>(&keys::last_location(user_id, family_id))
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(%err, user_id, family_id, "last-location read failed");
                None
            }
        }
    }

    pub async fn set_last_location(
        &self,
        user_id: &str,
        family_id: &str,
        location: &StoredLocation,
    ) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        self.kv
            .set_json(
                &keys::last_location(user_id, family_id),
                location,
                Some(keys::LAST_LOCATION_TTL),
            )
            .await?;
        Ok(())
    }

    /// Re-arm the presence entry for this `(user, family)` pair.
    pub async fn set_online(&self, user_id: &str, family_id: &str) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        self.kv
            .set_raw(&keys::online(user_id, family_id), "1", Some(keys::ONLINE_TTL))
            .await?;
        Ok(())
    }

    pub async fn clear_online(&self, user_id: &str, family_id: &str) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        self.kv.del(&keys::online(user_id, family_id)).await?;
        Ok(())
    }

    pub async fn is_online(&self, user_id: &str, family_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.kv
            .exists(&keys::online(user_id, family_id))
            .await
            .unwrap_or(false)
    }

    // ── Granular invalidation ────────────────────────────────────────────

    pub async fn invalidate_members(&self, family_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![keys::family_members(family_id)]).await
    }

    pub async fn invalidate_families(&self, user_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![keys::user_families(user_id)]).await
    }

    pub async fn invalidate_geofences(&self, family_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![keys::geofences(family_id)]).await
    }

    pub async fn invalidate_role(&self, user_id: &str, family_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![keys::role(user_id, family_id)]).await
    }

    // ── Composite invalidation ───────────────────────────────────────────

    pub async fn on_user_joined(&self, user_id: &str, family_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![
            keys::user_families(user_id),
            keys::family_members(family_id),
        ])
        .await
    }

    pub async fn on_user_left(&self, user_id: &str, family_id: &str) -> Result<(), CoreError> {
        self.drop_keys(vec![
            keys::user_families(user_id),
            keys::family_members(family_id),
            keys::role(user_id, family_id),
            keys::last_location(user_id, family_id),
            keys::online(user_id, family_id),
        ])
        .await
    }

    /// Full family teardown. `members` is the membership snapshot taken
    /// before the family disappeared from the repository.
    pub async fn on_family_deleted(
        &self,
        family_id: &str,
        members: &[FamilyMember],
    ) -> Result<(), CoreError> {
        let mut dropped = vec![keys::family_members(family_id), keys::geofences(family_id)];
        for member in members {
            dropped.push(keys::role(&member.user_id, family_id));
            dropped.push(keys::last_location(&member.user_id, family_id));
            dropped.push(keys::online(&member.user_id, family_id));
            dropped.push(keys::user_families(&member.user_id));
            dropped.push(keys::ghost_family(family_id, &member.user_id));
        }
        self.drop_keys(dropped).await
    }

    /// Account deletion. `family_ids` is the snapshot of the user's
    /// memberships at deletion time.
    pub async fn on_user_deleted(
        &self,
        user_id: &str,
        family_ids: &[String],
    ) -> Result<(), CoreError> {
        let mut dropped = vec![keys::user_families(user_id), keys::ghost_global(user_id)];
        for family_id in family_ids {
            dropped.push(keys::role(user_id, family_id));
            dropped.push(keys::last_location(user_id, family_id));
            dropped.push(keys::online(user_id, family_id));
            dropped.push(keys::ghost_family(family_id, user_id));
            dropped.push(keys::family_members(family_id));
        }
        self.drop_keys(dropped).await
    }

    // ── Refresh (invalidate, then re-populate) ───────────────────────────

    pub async fn refresh_members(&self, family_id: &str) -> Result<Vec<FamilyMember>, CoreError> {
        self.invalidate_members(family_id).await?;
        Ok(self.members_of(family_id).await)
    }

    /// Bulk refresh for one family: membership and geofences reloaded from
    /// the repository.
    pub async fn refresh_family(&self, family_id: &str) -> Result<Vec<FamilyMember>, CoreError> {
        self.invalidate_geofences(family_id).await?;
        let members = self.refresh_members(family_id).await?;
        self.geofences_of(family_id).await;
        Ok(members)
    }

    async fn drop_keys(&self, dropped: Vec<String>) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        self.kv.del_all(&dropped).await?;
        Ok(())
    }
}

fn member_from_row(row: memberships::MembershipRow) -> Option<FamilyMember> {
    let Some(role) = FamilyRole::parse(&row.role) else {
        tracing::warn!(user_id = %row.user_id, role = %row.role, "skipping member with unknown role");
        return None;
    };
    Some(FamilyMember {
        user_id: row.user_id,
        role,
        display_name: row.display_name,
        avatar_url: row.avatar_url,
        joined_at: row.joined_at,
    })
}
