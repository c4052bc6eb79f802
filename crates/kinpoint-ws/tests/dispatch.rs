//! Dispatcher routing against a live room registry: the same path a bus
//! delivery takes from channel name to socket queues, minus the backend.

use kinpoint_core::rooms::RoomRegistry;
use kinpoint_ws::route_message;
use serde_json::json;

#[tokio::test]
async fn location_channel_reaches_room_members_only() {
    let registry = RoomRegistry::new();
    let mut rx1 = registry.register("s1", "u1");
    let mut rx2 = registry.register("s2", "u2");
    let mut rx3 = registry.register("s3", "u3");
    registry.join_room("fA", "s1");
    registry.join_room("fA", "s2");
    registry.join_room("fB", "s3");

    let payload = json!({
        "type": "location_update",
        "user_id": "u2",
        "family_id": "fA",
        "lat": 40.0,
        "lon": -74.0,
        "accuracy": 8.0,
    })
    .to_string();
    let delivered = route_message(&registry, "family:fA:location", &payload);
    assert_eq!(delivered, 2);

    let event = rx1.recv().await.unwrap();
    assert_eq!(event.event, "location_update");
    assert_eq!(event.payload["lat"], 40.0);
    assert!(rx2.recv().await.is_some());
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn alert_channel_forwards_under_type_discriminator() {
    let registry = RoomRegistry::new();
    let mut rx = registry.register("s1", "u1");
    registry.join_room("fA", "s1");

    let payload = json!({
        "type": "presence_update",
        "user_id": "u2",
        "family_id": "fA",
        "status": "online",
    })
    .to_string();
    assert_eq!(route_message(&registry, "family:fA:alerts", &payload), 1);
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event, "presence_update");
    assert_eq!(event.payload["status"], "online");

    // A payload without a discriminator is dropped, not misrouted.
    assert_eq!(route_message(&registry, "family:fA:alerts", "{}"), 0);
}

#[tokio::test]
async fn notification_channel_targets_every_socket_of_user() {
    let registry = RoomRegistry::new();
    let mut rx1 = registry.register("s1", "u1");
    let mut rx2 = registry.register("s2", "u1");
    let mut rx3 = registry.register("s3", "u2");

    let payload = json!({
        "type": "notification",
        "event": "added_to_family",
        "family_id": "fB",
    })
    .to_string();
    let delivered = route_message(&registry, "user:u1:notifications", &payload);
    assert_eq!(delivered, 2);

    assert_eq!(rx1.recv().await.unwrap().event, "notification");
    assert_eq!(rx2.recv().await.unwrap().event, "notification");
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn foreign_channels_and_junk_payloads_are_dropped() {
    let registry = RoomRegistry::new();
    let mut rx = registry.register("s1", "u1");
    registry.join_room("fA", "s1");

    assert_eq!(route_message(&registry, "family:fA:typing", "{}"), 0);
    assert_eq!(route_message(&registry, "family:fA:location", "not json"), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn removed_socket_stops_receiving_room_traffic() {
    let registry = RoomRegistry::new();
    let mut rx1 = registry.register("s1", "u1");
    let _rx2 = registry.register("s2", "u2");
    registry.join_room("fA", "s1");
    registry.join_room("fA", "s2");

    registry.force_leave_user("fA", "u2");
    let payload = json!({"type": "location_update", "lat": 1.0}).to_string();
    assert_eq!(route_message(&registry, "family:fA:location", &payload), 1);
    assert!(rx1.recv().await.is_some());
}
