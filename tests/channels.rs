use std::sync::{Arc, Mutex};

use toporia_realtime::channel::{ChannelManager, ChannelTransport};
use toporia_realtime::clock::{Clock, ManualClock};
use toporia_realtime::connection::{Connection, ConnectionId, ConnectionRegistry, UserIdentity};
use toporia_realtime::message::Message;
use toporia_realtime::Result;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(ConnectionId, String)>>,
    fail_for: Mutex<Option<ConnectionId>>,
}

impl ChannelTransport for RecordingTransport {
    fn send(&self, conn: &ConnectionId, msg: &Message) -> Result<()> {
        if self.fail_for.lock().expect("fail lock").as_ref() == Some(conn) {
            return Err(toporia_realtime::Error::BrokerUnavailable(
                "socket gone".to_string(),
            ));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((conn.clone(), msg.event.clone().unwrap_or_default()));
        Ok(())
    }
}

fn setup() -> (
    ManualClock,
    ConnectionRegistry,
    ChannelManager,
    Arc<RecordingTransport>,
) {
    let clock = ManualClock::new(1_000_000_000);
    let registry = ConnectionRegistry::new(Arc::new(clock.clone()));
    let transport = Arc::new(RecordingTransport::default());
    let manager = ChannelManager::new(transport.clone(), Arc::new(clock.clone()));
    (clock, registry, manager, transport)
}

fn authed(registry: &ConnectionRegistry, clock: &ManualClock, id: &str, user: &str) -> Arc<Mutex<Connection>> {
    let mut conn = Connection::new(id, clock);
    conn.authenticate(
        UserIdentity {
            id: user.to_string(),
            name: Some(user.to_string()),
            email: None,
            roles: vec!["member".to_string()],
            permissions: Vec::new(),
        },
        Some("web".to_string()),
    );
    registry.register(conn)
}

#[test]
fn membership_is_symmetric() {
    let (clock, registry, manager, _) = setup();
    let conn = authed(&registry, &clock, "c1", "u1");

    manager.subscribe("orders", &conn).expect("subscribe");
    manager.subscribe("presence-room", &conn).expect("subscribe");

    // Connection's channel set mirrors the channel subscriber sets.
    {
        let conn = conn.lock().expect("conn lock");
        let mut channels: Vec<&str> = conn.channels().collect();
        channels.sort();
        assert_eq!(channels, vec!["orders", "presence-room"]);
    }
    assert!(manager.subscribers("orders").contains(&"c1".to_string()));
    assert!(manager.subscribers("presence-room").contains(&"c1".to_string()));

    manager.unsubscribe("orders", &conn);
    assert!(manager.subscribers("orders").is_empty());
    assert!(!conn
        .lock()
        .expect("conn lock")
        .channels()
        .any(|ch| ch == "orders"));
}

#[test]
fn subscribe_is_idempotent() {
    let (clock, registry, manager, _) = setup();
    let conn = authed(&registry, &clock, "c1", "u1");

    manager.subscribe("orders", &conn).expect("subscribe");
    manager.subscribe("orders", &conn).expect("subscribe again");
    assert_eq!(manager.subscribers("orders").len(), 1);
}

#[test]
fn unregister_clears_membership_and_state() {
    let (clock, registry, manager, _) = setup();
    let conn = authed(&registry, &clock, "c1", "u1");
    manager.subscribe("orders", &conn).expect("subscribe");
    conn.lock()
        .expect("conn lock")
        .set_metadata("seat", serde_json::json!("14A"));

    registry.unregister("c1", &manager);

    assert!(registry.lookup("c1").is_none());
    assert!(manager.subscribers("orders").is_empty());
    let conn = conn.lock().expect("conn lock");
    assert_eq!(conn.channels().count(), 0);
    assert!(conn.metadata.is_empty());
}

#[test]
fn broadcast_skips_excluded_and_survives_send_failures() {
    let (clock, registry, manager, transport) = setup();
    for i in 0..5 {
        let conn = authed(&registry, &clock, &format!("c{i}"), &format!("u{i}"));
        manager.subscribe("orders", &conn).expect("subscribe");
    }
    *transport.fail_for.lock().expect("fail lock") = Some("c3".to_string());

    let msg = Message::event("orders", "created", serde_json::json!(1));
    let except = "c0".to_string();
    let sent = manager.broadcast("orders", &msg, Some(&except));

    // c0 excluded, c3 failed but did not abort the rest.
    assert_eq!(sent, 3);
    let sent_to: Vec<ConnectionId> = transport
        .sent
        .lock()
        .expect("sent lock")
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    assert!(!sent_to.contains(&"c0".to_string()));
    assert!(!sent_to.contains(&"c3".to_string()));
}

#[test]
fn broadcast_with_no_subscribers_is_a_noop() {
    let (_, _, manager, transport) = setup();
    let msg = Message::event("orders", "created", serde_json::Value::Null);
    assert_eq!(manager.broadcast("orders", &msg, None), 0);
    assert!(transport.sent.lock().expect("sent lock").is_empty());
}

#[test]
fn presence_lists_only_authenticated_subscribers() {
    let (clock, registry, manager, _) = setup();

    let member = authed(&registry, &clock, "c1", "alice");
    let anon = registry.register(Connection::new("c2", &clock));
    manager.subscribe("presence-room", &member).expect("subscribe");
    manager.subscribe("presence-room", &anon).expect("subscribe");

    let presence = manager.presence_of("presence-room").expect("presence");
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0].user_id, "alice");
    assert_eq!(presence[0].connected_at_ns, 1_000_000_000);

    // Presence data is defined only on presence channels.
    assert!(manager.presence_of("orders").is_err());
}

#[test]
fn presence_channels_emit_join_and_leave_events() {
    let (clock, registry, manager, transport) = setup();
    let first = authed(&registry, &clock, "c1", "u1");
    let second = authed(&registry, &clock, "c2", "u2");

    manager.subscribe("presence-room", &first).expect("subscribe");
    manager.subscribe("presence-room", &second).expect("subscribe");
    manager.unsubscribe("presence-room", &second);

    let events: Vec<(ConnectionId, String)> =
        transport.sent.lock().expect("sent lock").clone();
    // c1 saw c2 join and leave; joins broadcast to current members.
    assert!(events.contains(&("c1".to_string(), "presence:join".to_string())));
    assert!(events.contains(&("c1".to_string(), "presence:leave".to_string())));
}

#[test]
fn idle_sweep_unregisters_stale_connections() {
    let (clock, registry, manager, _) = setup();
    let stale = authed(&registry, &clock, "c1", "u1");
    let fresh = authed(&registry, &clock, "c2", "u2");
    manager.subscribe("orders", &stale).expect("subscribe");
    manager.subscribe("orders", &fresh).expect("subscribe");

    clock.advance_secs(120);
    registry.touch("c2");
    let swept = registry.sweep_idle(60 * 1_000_000_000, &manager);

    assert_eq!(swept, vec!["c1".to_string()]);
    assert!(registry.lookup("c1").is_none());
    assert_eq!(manager.subscribers("orders"), vec!["c2".to_string()]);
}

#[test]
fn touch_never_moves_activity_before_connect() {
    let clock = ManualClock::new(5_000_000_000);
    let mut conn = Connection::new("c1", &clock);
    conn.touch(1);
    assert!(conn.last_activity_at_ns >= conn.connected_at_ns);
    assert_eq!(conn.connected_at_ns, clock.now_ns());
}
