//! Socket/room registry backing the gateway fan-out. Rooms are the
//! `family:<fid>` addressing unit; membership is per-socket. All indexes
//! are process-local — cross-instance delivery rides the bus and lands
//! here through the dispatcher.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// One event queued for a socket. The payload is shared across recipients.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: Arc<Value>,
}

struct SessionHandle {
    user_id: String,
    rooms: HashSet<String>,
    sender: mpsc::UnboundedSender<OutboundEvent>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
    rooms: Arc<DashMap<String, HashSet<String>>>,
    user_sockets: Arc<DashMap<String, HashSet<String>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a socket, returning its outbound event queue.
    pub fn register(
        &self,
        socket_id: &str,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sessions.insert(
            socket_id.to_string(),
            SessionHandle {
                user_id: user_id.to_string(),
                rooms: HashSet::new(),
                sender,
            },
        );
        self.user_sockets
            .entry(user_id.to_string())
            .or_default()
            .insert(socket_id.to_string());
        receiver
    }

    /// Detach a socket and sweep it out of every index.
    pub fn unregister(&self, socket_id: &str) {
        let Some((_, handle)) = self.sessions.remove(socket_id) else {
            return;
        };
        for family_id in &handle.rooms {
            self.remove_socket_from_room(family_id, socket_id);
        }
        if let Some(mut sockets) = self.user_sockets.get_mut(&handle.user_id) {
            sockets.remove(socket_id);
            if sockets.is_empty() {
                drop(sockets);
                self.user_sockets.remove(&handle.user_id);
            }
        }
    }

    pub fn join_room(&self, family_id: &str, socket_id: &str) {
        let Some(mut handle) = self.sessions.get_mut(socket_id) else {
            return;
        };
        handle.rooms.insert(family_id.to_string());
        drop(handle);
        self.rooms
            .entry(family_id.to_string())
            .or_default()
            .insert(socket_id.to_string());
    }

    pub fn leave_room(&self, family_id: &str, socket_id: &str) {
        if let Some(mut handle) = self.sessions.get_mut(socket_id) {
            handle.rooms.remove(family_id);
        }
        self.remove_socket_from_room(family_id, socket_id);
    }

    /// Detach every socket of a user from a room (used when the user is
    /// removed from the family).
    pub fn force_leave_user(&self, family_id: &str, user_id: &str) {
        let socket_ids: Vec<String> = self
            .user_sockets
            .get(user_id)
            .map(|sockets| sockets.iter().cloned().collect())
            .unwrap_or_default();
        for socket_id in socket_ids {
            self.leave_room(family_id, &socket_id);
        }
    }

    /// Deliver an event to every socket joined to the room. Recipients are
    /// snapshotted before any send so a handler-driven join/leave can't
    /// deadlock delivery.
    pub fn send_to_room(&self, family_id: &str, event: &str, payload: Value) -> usize {
        let socket_ids: Vec<String> = self
            .rooms
            .get(family_id)
            .map(|sockets| sockets.iter().cloned().collect())
            .unwrap_or_default();
        self.deliver(&socket_ids, event, payload)
    }

    /// Deliver an event to every socket belonging to a user.
    pub fn send_to_user(&self, user_id: &str, event: &str, payload: Value) -> usize {
        let socket_ids: Vec<String> = self
            .user_sockets
            .get(user_id)
            .map(|sockets| sockets.iter().cloned().collect())
            .unwrap_or_default();
        self.deliver(&socket_ids, event, payload)
    }

    fn deliver(&self, socket_ids: &[String], event: &str, payload: Value) -> usize {
        let payload = Arc::new(payload);
        let mut delivered = 0;
        for socket_id in socket_ids {
            if let Some(handle) = self.sessions.get(socket_id) {
                let sent = handle.sender.send(OutboundEvent {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// How many sockets of this user are joined to the room. Presence is
    /// `online` for `(user, family)` iff this is non-zero.
    pub fn user_sockets_in_room(&self, user_id: &str, family_id: &str) -> usize {
        let Some(room) = self.rooms.get(family_id) else {
            return 0;
        };
        let Some(sockets) = self.user_sockets.get(user_id) else {
            return 0;
        };
        sockets.iter().filter(|id| room.contains(*id)).count()
    }

    pub fn user_socket_count(&self, user_id: &str) -> usize {
        self.user_sockets
            .get(user_id)
            .map(|sockets| sockets.len())
            .unwrap_or(0)
    }

    pub fn room_size(&self, family_id: &str) -> usize {
        self.rooms
            .get(family_id)
            .map(|sockets| sockets.len())
            .unwrap_or(0)
    }

    fn remove_socket_from_room(&self, family_id: &str, socket_id: &str) {
        if let Some(mut sockets) = self.rooms.get_mut(family_id) {
            sockets.remove(socket_id);
            if sockets.is_empty() {
                drop(sockets);
                self.rooms.remove(family_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn room_fanout_reaches_joined_sockets_only() {
        let registry = RoomRegistry::new();
        let mut rx1 = registry.register("s1", "u1");
        let mut rx2 = registry.register("s2", "u2");
        registry.join_room("fA", "s1");
        registry.join_room("fA", "s2");

        let delivered = registry.send_to_room("fA", "location_update", json!({"lat": 1.0}));
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap().event, "location_update");
        assert_eq!(rx2.recv().await.unwrap().event, "location_update");

        registry.leave_room("fA", "s2");
        let delivered = registry.send_to_room("fA", "location_update", json!({"lat": 2.0}));
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn user_targeting_spans_all_sockets() {
        let registry = RoomRegistry::new();
        let mut rx1 = registry.register("s1", "u1");
        let mut rx2 = registry.register("s2", "u1");

        let delivered = registry.send_to_user("u1", "notification", json!({"n": 1}));
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn presence_counting_per_room() {
        let registry = RoomRegistry::new();
        let _rx1 = registry.register("s1", "u1");
        let _rx2 = registry.register("s2", "u1");
        registry.join_room("fA", "s1");
        registry.join_room("fA", "s2");
        registry.join_room("fB", "s1");

        assert_eq!(registry.user_sockets_in_room("u1", "fA"), 2);
        assert_eq!(registry.user_sockets_in_room("u1", "fB"), 1);

        registry.unregister("s1");
        assert_eq!(registry.user_sockets_in_room("u1", "fA"), 1);
        assert_eq!(registry.user_sockets_in_room("u1", "fB"), 0);
        assert_eq!(registry.user_socket_count("u1"), 1);
    }

    #[tokio::test]
    async fn force_leave_detaches_every_socket_of_user() {
        let registry = RoomRegistry::new();
        let _rx1 = registry.register("s1", "u1");
        let _rx2 = registry.register("s2", "u1");
        let _rx3 = registry.register("s3", "u2");
        for socket in ["s1", "s2", "s3"] {
            registry.join_room("fA", socket);
        }

        registry.force_leave_user("fA", "u1");
        assert_eq!(registry.room_size("fA"), 1);
        assert_eq!(registry.user_sockets_in_room("u1", "fA"), 0);
        assert_eq!(registry.user_sockets_in_room("u2", "fA"), 1);
    }
}
