use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{RepoError, RepoHandle};

/// One `family_members` row as returned by the record of truth.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipRow {
    pub user_id: String,
    pub family_id: String,
    pub role: String,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

pub async fn members_of(
    repo: &RepoHandle,
    family_id: &str,
) -> Result<Vec<MembershipRow>, RepoError> {
    let query = format!(
        "select=user_id,family_id,role,joined_at,display_name,avatar_url&family_id=eq.{family_id}"
    );
    repo.select("family_members", &query, None).await
}

pub async fn families_of(repo: &RepoHandle, user_id: &str) -> Result<Vec<String>, RepoError> {
    #[derive(Deserialize)]
    struct Row {
        family_id: String,
    }
    let query = format!("select=family_id&user_id=eq.{user_id}");
    let rows: Vec<Row> = repo.select("family_members", &query, None).await?;
    Ok(rows.into_iter().map(|row| row.family_id).collect())
}

pub async fn role_of(
    repo: &RepoHandle,
    user_id: &str,
    family_id: &str,
) -> Result<Option<String>, RepoError> {
    #[derive(Deserialize)]
    struct Row {
        role: String,
    }
    let query = format!("select=role&user_id=eq.{user_id}&family_id=eq.{family_id}&limit=1");
    let rows: Vec<Row> = repo.select("family_members", &query, None).await?;
    Ok(rows.into_iter().next().map(|row| row.role))
}
