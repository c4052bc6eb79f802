use kinpoint_models::ghost::{GhostModes, GhostStatus};
use serde::Deserialize;
use serde_json::json;

use crate::{RepoError, RepoHandle};

#[derive(Deserialize)]
struct GlobalRow {
    #[serde(default)]
    global_enabled: bool,
}

#[derive(Deserialize)]
struct FamilyRow {
    family_id: String,
    #[serde(default)]
    enabled: bool,
}

/// Full ghost-mode state for a user: the global flag plus every per-family
/// override row.
pub async fn ghost_modes_of(repo: &RepoHandle, user_id: &str) -> Result<GhostModes, RepoError> {
    let global_query = format!("select=global_enabled&user_id=eq.{user_id}&limit=1");
    let global_rows: Vec<GlobalRow> = repo.select("ghost_modes", &global_query, None).await?;

    let family_query = format!("select=family_id,enabled&user_id=eq.{user_id}");
    let family_rows: Vec<FamilyRow> = repo
        .select("family_ghost_modes", &family_query, None)
        .await?;

    Ok(GhostModes {
        global: global_rows.first().map(|row| row.global_enabled).unwrap_or(false),
        per_family: family_rows
            .into_iter()
            .map(|row| (row.family_id, row.enabled))
            .collect(),
    })
}

pub async fn is_ghost(
    repo: &RepoHandle,
    user_id: &str,
    family_id: &str,
) -> Result<GhostStatus, RepoError> {
    let modes = ghost_modes_of(repo, user_id).await?;
    if modes.global {
        Ok(GhostStatus::global())
    } else if modes.effective(family_id) {
        Ok(GhostStatus::family())
    } else {
        Ok(GhostStatus::VISIBLE)
    }
}

/// Durable write of the global flag. Initiated by the user, so this goes
/// through a tenant bearer when one is supplied.
pub async fn set_global(
    repo: &RepoHandle,
    bearer: Option<&str>,
    user_id: &str,
    enabled: bool,
) -> Result<(), RepoError> {
    let body = json!([{ "user_id": user_id, "global_enabled": enabled }]);
    repo.upsert("ghost_modes", "user_id", &body, bearer).await
}

pub async fn set_family(
    repo: &RepoHandle,
    bearer: Option<&str>,
    user_id: &str,
    family_id: &str,
    enabled: bool,
) -> Result<(), RepoError> {
    let body = json!([{ "user_id": user_id, "family_id": family_id, "enabled": enabled }]);
    repo.upsert("family_ghost_modes", "user_id,family_id", &body, bearer)
        .await
}
