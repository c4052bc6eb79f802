use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use kinpoint_core::rooms::OutboundEvent;
use kinpoint_core::{membership, AppState};
use kinpoint_models::family::FamilyRole;
use kinpoint_models::gateway::*;
use kinpoint_models::ghost::GhostScope;
use kinpoint_models::location::LocationUpdate;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::session::Session;

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_PING_INTERVAL: Duration = Duration::from_secs(20);

const CLOSE_UNAUTHENTICATED: u16 = 4001;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &str,
    data: Value,
) -> Result<(), ()> {
    let frame = json!({ "event": event, "data": data });
    sender
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|_| ())
}

async fn send_ack(
    sender: &mut (impl SinkExt<Message> + Unpin),
    verb: &str,
    mut data: Value,
) -> Result<(), ()> {
    if let Some(object) = data.as_object_mut() {
        object.insert("event".to_string(), json!(verb));
    }
    send_frame(sender, EVENT_ACK, data).await
}

async fn ack_error(
    sender: &mut (impl SinkExt<Message> + Unpin),
    verb: &str,
    error: &str,
) -> Result<(), ()> {
    send_ack(sender, verb, json!({ "success": false, "error": error })).await
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

pub async fn handle_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // AUTHENTICATING: a socket without a header/query bearer may supply one
    // in a single auth frame; otherwise it is disconnected.
    let token = match token {
        Some(token) => Some(token),
        None => wait_for_auth_token(&mut receiver).await,
    };
    let Some(token) = token else {
        let _ = send_close(&mut sender, CLOSE_UNAUTHENTICATED, "missing bearer token").await;
        return;
    };
    let claims = match state.verifier.verify(&token) {
        Ok(claims) => claims,
        Err(_) => {
            let _ = send_close(&mut sender, CLOSE_UNAUTHENTICATED, "invalid bearer token").await;
            return;
        }
    };

    let user_id = claims.sub.clone();
    let family_ids = state.cache.families_of(&user_id).await;
    let mut session = Session::new(user_id.clone(), family_ids, token);
    let mut outbound = state.registry.register(&session.socket_id, &user_id);

    for family_id in session.family_ids.clone() {
        attach_to_family(&state, &mut session, &family_id).await;
    }

    if send_frame(
        &mut sender,
        EVENT_CONNECTED,
        json!({
            "user_id": session.user_id,
            "family_ids": session.family_ids,
        }),
    )
    .await
    .is_err()
    {
        disconnect_cleanup(&state, &session).await;
        return;
    }

    tracing::info!(
        user_id = %session.user_id,
        socket_id = %session.socket_id,
        families = session.family_ids.len(),
        "gateway session open"
    );

    let reason = run_session(&mut sender, &mut receiver, &mut session, &state, &mut outbound).await;
    tracing::info!(user_id = %session.user_id, socket_id = %session.socket_id, %reason, "gateway session closed");

    disconnect_cleanup(&state, &session).await;
}

/// Wait for a first frame carrying the bearer, either
/// `{"event":"auth","data":{"token":…}}` or `{"auth":{"token":…}}`.
async fn wait_for_auth_token(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    let deadline = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                return None;
            };
            let token = value
                .pointer("/auth/token")
                .or_else(|| value.pointer("/data/token"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return token;
        }
        None
    });
    deadline.await.ok().flatten()
}

/// Room join plus the presence side of it: online marker and broadcast.
async fn attach_to_family(state: &AppState, session: &mut Session, family_id: &str) {
    state.registry.join_room(family_id, &session.socket_id);
    session.joined_rooms.insert(family_id.to_string());
    if let Err(err) = state.cache.set_online(&session.user_id, family_id).await {
        tracing::warn!(%err, family_id, "online marker write failed");
    }
    membership::publish_family_event(
        state,
        family_id,
        json!({
            "type": "presence_update",
            "user_id": session.user_id,
            "family_id": family_id,
            "status": "online",
        }),
    )
    .await;
}

/// Room leave; presence goes offline only when this was the user's last
/// socket in that room.
async fn detach_from_family(state: &AppState, session: &mut Session, family_id: &str) {
    state.registry.leave_room(family_id, &session.socket_id);
    session.joined_rooms.remove(family_id);
    publish_offline_if_last(state, &session.user_id, family_id).await;
}

async fn publish_offline_if_last(state: &AppState, user_id: &str, family_id: &str) {
    if state.registry.user_sockets_in_room(user_id, family_id) > 0 {
        return;
    }
    if let Err(err) = state.cache.clear_online(user_id, family_id).await {
        tracing::warn!(%err, family_id, "online marker clear failed");
    }
    membership::publish_family_event(
        state,
        family_id,
        json!({
            "type": "presence_update",
            "user_id": user_id,
            "family_id": family_id,
            "status": "offline",
            "last_seen": now_ms(),
        }),
    )
    .await;
}

async fn disconnect_cleanup(state: &AppState, session: &Session) {
    state.registry.unregister(&session.socket_id);
    for family_id in &session.joined_rooms {
        publish_offline_if_last(state, &session.user_id, family_id).await;
    }
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    session: &mut Session,
    state: &AppState,
    outbound: &mut mpsc::UnboundedReceiver<OutboundEvent>,
) -> String {
    let mut ping_interval = tokio::time::interval(SOCKET_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<GatewayFrame>(&text) {
                            Ok(frame) => {
                                handle_client_message(frame, sender, session, state).await;
                            }
                            Err(err) => {
                                let _ = ack_error(sender, "unknown", &format!("malformed frame: {err}")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("client close (code={})", frame.code),
                            None => "client close".to_string(),
                        };
                    }
                    Some(Err(err)) => break format!("socket receive error: {err}"),
                    None => break "socket stream ended".to_string(),
                    _ => {}
                }
            }
            event = outbound.recv() => {
                match event {
                    Some(event) => {
                        apply_membership_side_effects(state, session, &event).await;
                        if send_frame(sender, &event.event, (*event.payload).clone()).await.is_err() {
                            break "socket send error".to_string();
                        }
                    }
                    None => break "outbound queue closed".to_string(),
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "ping send error".to_string();
                }
            }
            _ = shutdown.notified() => {
                let _ = send_close(sender, 1001, "server shutting down").await;
                break "server shutdown".to_string();
            }
        }
    }
}

/// Keep a long-lived session's family set honest: membership broadcasts
/// that target this session's own user update the socket's scope before the
/// frame is forwarded to the client.
async fn apply_membership_side_effects(
    state: &AppState,
    session: &mut Session,
    event: &OutboundEvent,
) {
    let data = event.payload.as_ref();
    let family_id = data.get("family_id").and_then(Value::as_str);
    let target_user = data.get("user_id").and_then(Value::as_str);

    match event.event.as_str() {
        EVENT_FAMILY_MEMBER_REMOVED => {
            if target_user == Some(session.user_id.as_str()) {
                if let Some(family_id) = family_id {
                    let family_id = family_id.to_string();
                    state.registry.leave_room(&family_id, &session.socket_id);
                    session.remove_family(&family_id);
                }
            }
        }
        EVENT_FAMILY_DELETED => {
            if let Some(family_id) = family_id {
                let family_id = family_id.to_string();
                state.registry.leave_room(&family_id, &session.socket_id);
                session.remove_family(&family_id);
            }
        }
        EVENT_NOTIFICATION => {
            let Some(family_id) = family_id.map(str::to_string) else {
                return;
            };
            match data.get("event").and_then(Value::as_str) {
                Some("added_to_family") => {
                    session.add_family(&family_id);
                    attach_to_family(state, session, &family_id).await;
                }
                Some("removed_from_family") => {
                    state.registry.leave_room(&family_id, &session.socket_id);
                    session.remove_family(&family_id);
                }
                _ => {}
            }
        }
        _ => {}
    }
}

async fn handle_client_message(
    frame: GatewayFrame,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &AppState,
) {
    let verb = frame.event.as_str();
    tracing::debug!(user_id = %session.user_id, verb, "gateway verb");

    match verb {
        VERB_PING => {
            let _ = send_frame(sender, EVENT_PONG, json!({ "server_ts_ms": now_ms() })).await;
        }
        VERB_LOCATION_UPDATE => {
            let update: LocationUpdate = match serde_json::from_value(frame.data) {
                Ok(update) => update,
                Err(err) => {
                    let _ = ack_error(sender, verb, &format!("malformed payload: {err}")).await;
                    return;
                }
            };
            if !session.authorized(&update.family_id) {
                let _ = ack_error(sender, verb, "Unauthorized family access").await;
                return;
            }
            match state.locations.ingest(&session.user_id, &update).await {
                Ok(ack) => {
                    // Any accepted sample re-arms the presence heartbeat.
                    if let Err(err) = state
                        .cache
                        .set_online(&session.user_id, &update.family_id)
                        .await
                    {
                        tracing::warn!(%err, "online refresh failed");
                    }
                    let _ = send_ack(
                        sender,
                        verb,
                        json!({
                            "success": true,
                            "message_id": ack.message_id,
                            "server_ts_ms": ack.server_ts_ms,
                        }),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::warn!(%err, user_id = %session.user_id, "location ingest failed");
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        VERB_JOIN_FAMILY => {
            let Some(family_id) = frame.data.get("family_id").and_then(Value::as_str) else {
                let _ = ack_error(sender, verb, "family_id required").await;
                return;
            };
            if !session.authorized(family_id) {
                let _ = ack_error(sender, verb, "Unauthorized family access").await;
                return;
            }
            let family_id = family_id.to_string();
            attach_to_family(state, session, &family_id).await;
            let _ = send_ack(sender, verb, json!({ "success": true, "family_id": family_id })).await;
        }
        VERB_LEAVE_FAMILY => {
            let Some(family_id) = frame.data.get("family_id").and_then(Value::as_str) else {
                let _ = ack_error(sender, verb, "family_id required").await;
                return;
            };
            let family_id = family_id.to_string();
            detach_from_family(state, session, &family_id).await;
            let _ = send_ack(sender, verb, json!({ "success": true, "family_id": family_id })).await;
        }
        VERB_GHOST_MODE => {
            handle_ghost_mode(frame.data, sender, session, state).await;
        }
        VERB_USER_ADDED_TO_FAMILY => {
            let (Some(family_id), Some(added_user_id)) = (
                frame.data.get("family_id").and_then(Value::as_str),
                frame.data.get("added_user_id").and_then(Value::as_str),
            ) else {
                let _ = ack_error(sender, verb, "family_id and added_user_id required").await;
                return;
            };
            let Some(role) = frame
                .data
                .get("role")
                .and_then(Value::as_str)
                .and_then(FamilyRole::parse)
            else {
                let _ = ack_error(sender, verb, "valid role required").await;
                return;
            };
            match membership::member_added(state, &session.family_ids, family_id, added_user_id, role)
                .await
            {
                Ok(()) => {
                    let _ = send_ack(
                        sender,
                        verb,
                        json!({ "success": true, "message": "member added" }),
                    )
                    .await;
                }
                Err(err) => {
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        VERB_USER_REMOVED_FROM_FAMILY => {
            let (Some(family_id), Some(removed_user_id)) = (
                frame.data.get("family_id").and_then(Value::as_str),
                frame.data.get("removed_user_id").and_then(Value::as_str),
            ) else {
                let _ = ack_error(sender, verb, "family_id and removed_user_id required").await;
                return;
            };
            match membership::member_removed(state, &session.family_ids, family_id, removed_user_id)
                .await
            {
                Ok(()) => {
                    let _ = send_ack(sender, verb, json!({ "success": true })).await;
                }
                Err(err) => {
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        VERB_FAMILY_DELETED => {
            let Some(family_id) = frame.data.get("family_id").and_then(Value::as_str) else {
                let _ = ack_error(sender, verb, "family_id required").await;
                return;
            };
            match membership::family_deleted(state, &session.family_ids, family_id).await {
                Ok(()) => {
                    let _ = send_ack(sender, verb, json!({ "success": true })).await;
                }
                Err(err) => {
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        VERB_MEMBER_ROLE_UPDATED => {
            let (Some(family_id), Some(user_id)) = (
                frame.data.get("family_id").and_then(Value::as_str),
                frame.data.get("user_id").and_then(Value::as_str),
            ) else {
                let _ = ack_error(sender, verb, "family_id and user_id required").await;
                return;
            };
            let Some(new_role) = frame
                .data
                .get("new_role")
                .and_then(Value::as_str)
                .and_then(FamilyRole::parse)
            else {
                let _ = ack_error(sender, verb, "valid new_role required").await;
                return;
            };
            match membership::role_updated(state, &session.family_ids, family_id, user_id, new_role)
                .await
            {
                Ok(()) => {
                    let _ = send_ack(sender, verb, json!({ "success": true })).await;
                }
                Err(err) => {
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        VERB_REFRESH_FAMILY_CACHE => {
            let Some(family_id) = frame.data.get("family_id").and_then(Value::as_str) else {
                let _ = ack_error(sender, verb, "family_id required").await;
                return;
            };
            match membership::refresh_cache(state, &session.family_ids, family_id).await {
                Ok(()) => {
                    let _ = send_ack(sender, verb, json!({ "success": true })).await;
                }
                Err(err) => {
                    let _ = ack_error(sender, verb, &err.ack_message()).await;
                }
            }
        }
        other => {
            tracing::debug!(user_id = %session.user_id, verb = other, "unknown gateway verb");
            let _ = ack_error(sender, other, "unknown event").await;
        }
    }
}

async fn handle_ghost_mode(
    data: Value,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &AppState,
) {
    let verb = VERB_GHOST_MODE;
    let Some(enabled) = data.get("enabled").and_then(Value::as_bool) else {
        let _ = ack_error(sender, verb, "enabled required").await;
        return;
    };
    let scope = data
        .get("scope")
        .and_then(Value::as_str)
        .and_then(kinpoint_core::ghost::parse_scope);

    match scope {
        Some(GhostScope::Global) => {
            if let Err(err) = state
                .ghost
                .set_global(Some(&session.bearer), &session.user_id, enabled)
                .await
            {
                tracing::warn!(%err, user_id = %session.user_id, "global ghost write failed");
                let _ = ack_error(sender, verb, &err.ack_message()).await;
                return;
            }
            // The toggle is visible in every family the user belongs to.
            for family_id in session.family_ids.clone() {
                membership::publish_family_event(
                    state,
                    &family_id,
                    json!({
                        "type": "ghost_mode",
                        "user_id": session.user_id,
                        "family_id": family_id,
                        "enabled": enabled,
                        "scope": "global",
                    }),
                )
                .await;
            }
            let _ = send_ack(sender, verb, json!({ "success": true })).await;
        }
        Some(GhostScope::Family) => {
            let Some(family_id) = data.get("family_id").and_then(Value::as_str) else {
                let _ = ack_error(sender, verb, "family_id required for family scope").await;
                return;
            };
            if !session.authorized(family_id) {
                let _ = ack_error(sender, verb, "Unauthorized family access").await;
                return;
            }
            if let Err(err) = state
                .ghost
                .set_family(Some(&session.bearer), &session.user_id, family_id, enabled)
                .await
            {
                tracing::warn!(%err, user_id = %session.user_id, family_id, "family ghost write failed");
                let _ = ack_error(sender, verb, &err.ack_message()).await;
                return;
            }
            membership::publish_family_event(
                state,
                family_id,
                json!({
                    "type": "ghost_mode",
                    "user_id": session.user_id,
                    "family_id": family_id,
                    "enabled": enabled,
                    "scope": "family",
                }),
            )
            .await;
            let _ = send_ack(sender, verb, json!({ "success": true })).await;
        }
        _ => {
            let _ = ack_error(sender, verb, "scope must be global or family").await;
        }
    }
}
