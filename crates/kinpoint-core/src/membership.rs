//! Membership-shaped mutation handlers (C8): each is authorization against
//! the requester's membership set, the matching composite invalidation,
//! then the outbound broadcast. Invalidation and broadcast failures are
//! logged without failing the originating request — the repository stays
//! the source of truth and caches self-heal via TTL.

use kinpoint_models::channel;
use kinpoint_models::family::FamilyRole;
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::AppState;

fn authorize(requester_families: &[String], family_id: &str) -> Result<(), CoreError> {
    if requester_families.iter().any(|member| member == family_id) {
        Ok(())
    } else {
        Err(CoreError::Unauthorized)
    }
}

/// Publish a room-scoped event on the family's alerts channel. The `type`
/// field of the payload becomes the event name on delivery.
pub async fn publish_family_event(state: &AppState, family_id: &str, payload: Value) {
    if let Err(err) = state
        .kv
        .publish(&channel::family_alerts(family_id), &payload.to_string())
        .await
    {
        tracing::warn!(%err, family_id, "family event publish failed");
    }
}

/// Publish a direct notification to every socket of one user.
pub async fn publish_user_notification(state: &AppState, user_id: &str, payload: Value) {
    if let Err(err) = state
        .kv
        .publish(&channel::user_notifications(user_id), &payload.to_string())
        .await
    {
        tracing::warn!(%err, user_id, "user notification publish failed");
    }
}

pub async fn member_added(
    state: &AppState,
    requester_families: &[String],
    family_id: &str,
    added_user_id: &str,
    role: FamilyRole,
) -> Result<(), CoreError> {
    authorize(requester_families, family_id)?;

    if let Err(err) = state.cache.on_user_joined(added_user_id, family_id).await {
        tracing::warn!(%err, family_id, added_user_id, "join invalidation failed");
    }

    publish_family_event(
        state,
        family_id,
        json!({
            "type": "family_member_added",
            "family_id": family_id,
            "user_id": added_user_id,
            "role": role,
        }),
    )
    .await;
    publish_user_notification(
        state,
        added_user_id,
        json!({
            "type": "notification",
            "event": "added_to_family",
            "family_id": family_id,
            "role": role,
        }),
    )
    .await;
    Ok(())
}

pub async fn member_removed(
    state: &AppState,
    requester_families: &[String],
    family_id: &str,
    removed_user_id: &str,
) -> Result<(), CoreError> {
    authorize(requester_families, family_id)?;

    if let Err(err) = state.cache.on_user_left(removed_user_id, family_id).await {
        tracing::warn!(%err, family_id, removed_user_id, "leave invalidation failed");
    }

    publish_family_event(
        state,
        family_id,
        json!({
            "type": "family_member_removed",
            "family_id": family_id,
            "user_id": removed_user_id,
        }),
    )
    .await;
    publish_user_notification(
        state,
        removed_user_id,
        json!({
            "type": "notification",
            "event": "removed_from_family",
            "family_id": family_id,
        }),
    )
    .await;

    // Local sockets drop out immediately; other instances converge when the
    // broadcast reaches their dispatcher.
    state.registry.force_leave_user(family_id, removed_user_id);
    Ok(())
}

pub async fn family_deleted(
    state: &AppState,
    requester_families: &[String],
    family_id: &str,
) -> Result<(), CoreError> {
    authorize(requester_families, family_id)?;

    // Snapshot before invalidation; afterwards the member list is gone.
    let members = state.cache.members_of(family_id).await;
    if let Err(err) = state.cache.on_family_deleted(family_id, &members).await {
        tracing::warn!(%err, family_id, "family deletion invalidation failed");
    }

    publish_family_event(
        state,
        family_id,
        json!({
            "type": "family_deleted",
            "family_id": family_id,
        }),
    )
    .await;

    for member in &members {
        state.registry.force_leave_user(family_id, &member.user_id);
    }
    Ok(())
}

pub async fn role_updated(
    state: &AppState,
    requester_families: &[String],
    family_id: &str,
    user_id: &str,
    new_role: FamilyRole,
) -> Result<(), CoreError> {
    authorize(requester_families, family_id)?;

    if let Err(err) = state.cache.invalidate_role(user_id, family_id).await {
        tracing::warn!(%err, family_id, user_id, "role invalidation failed");
    }
    if let Err(err) = state.cache.invalidate_members(family_id).await {
        tracing::warn!(%err, family_id, "members invalidation failed");
    }

    publish_family_event(
        state,
        family_id,
        json!({
            "type": "member_role_updated",
            "family_id": family_id,
            "user_id": user_id,
            "new_role": new_role,
        }),
    )
    .await;
    publish_user_notification(
        state,
        user_id,
        json!({
            "type": "notification",
            "event": "role_updated",
            "family_id": family_id,
            "new_role": new_role,
        }),
    )
    .await;
    Ok(())
}

pub async fn refresh_cache(
    state: &AppState,
    requester_families: &[String],
    family_id: &str,
) -> Result<(), CoreError> {
    authorize(requester_families, family_id)?;

    // The refresh itself is the point of the request, so backend failures
    // propagate to the ack.
    state.cache.refresh_family(family_id).await?;

    publish_family_event(
        state,
        family_id,
        json!({
            "type": "cache_refreshed",
            "family_id": family_id,
        }),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_is_set_membership() {
        let families = vec!["fA".to_string(), "fB".to_string()];
        assert!(authorize(&families, "fA").is_ok());
        assert!(matches!(
            authorize(&families, "fC"),
            Err(CoreError::Unauthorized)
        ));
        assert!(matches!(authorize(&[], "fA"), Err(CoreError::Unauthorized)));
    }
}
