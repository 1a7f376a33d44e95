//! Channel membership, presence, and scoped broadcast.
//!
//! Classification is purely lexical: `private-`, `private.` and `user.`
//! prefixes mark private channels; `presence-` and `presence.` mark
//! presence channels; everything else is public.

pub mod router;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};

pub use router::{ChannelMiddleware, ChannelRoute, ChannelRouter, RouteMatch, RouteParams};

/// Recipients per broadcast slice; the broadcaster yields between slices so
/// a large fan-out cannot starve other work.
const BROADCAST_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Infer the kind from the channel name prefix.
    pub fn classify(name: &str) -> Self {
        if name.starts_with("presence-") || name.starts_with("presence.") {
            ChannelKind::Presence
        } else if name.starts_with("private-")
            || name.starts_with("private.")
            || name.starts_with("user.")
        {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Presence => "presence",
        }
    }
}

/// Presence snapshot entry for one authenticated subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub user_info: serde_json::Value,
    pub connected_at_ns: u64,
}

/// Delivery sink for channel fan-out.
pub trait ChannelTransport: Send + Sync {
    fn send(&self, conn: &ConnectionId, msg: &Message) -> Result<()>;
}

/// Transport that drops everything; useful before a socket layer is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl ChannelTransport for NullTransport {
    fn send(&self, _conn: &ConnectionId, _msg: &Message) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    /// Connection id -> presence entry when the subscriber is authenticated.
    subscribers: HashMap<ConnectionId, Option<PresenceEntry>>,
}

/// Per-channel subscriber sets with snapshot-semantics broadcast.
pub struct ChannelManager {
    channels: Mutex<HashMap<String, Arc<Mutex<ChannelState>>>>,
    transport: Arc<dyn ChannelTransport>,
    clock: Arc<dyn Clock>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn ChannelTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            transport,
            clock,
        }
    }

    fn state(&self, name: &str) -> Arc<Mutex<ChannelState>> {
        let mut map = self.channels.lock().expect("channel map lock");
        map.entry(name.to_string()).or_default().clone()
    }

    /// Subscribe a connection. Idempotent; the per-channel critical section
    /// makes duplicate subscriptions impossible.
    pub fn subscribe(&self, name: &str, conn: &Arc<Mutex<Connection>>) -> Result<()> {
        router::validate_channel_name(name)?;
        let state = self.state(name);

        // Snapshot the connection first; locks are never nested.
        let (conn_id, entry) = {
            let conn = conn.lock().expect("connection lock");
            let entry = conn.user.as_ref().map(|user| PresenceEntry {
                user_id: user.id.clone(),
                user_info: serde_json::json!({
                    "name": user.name,
                    "roles": user.roles,
                }),
                connected_at_ns: conn.connected_at_ns,
            });
            (conn.id.clone(), entry)
        };
        let newly_joined = {
            let mut state = state.lock().expect("channel lock");
            if state.subscribers.contains_key(&conn_id) {
                false
            } else {
                state.subscribers.insert(conn_id.clone(), entry);
                true
            }
        };
        conn.lock()
            .expect("connection lock")
            .channels
            .insert(name.to_string());

        if newly_joined && ChannelKind::classify(name) == ChannelKind::Presence {
            self.emit_presence(name, "presence:join", &conn_id);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str, conn: &Arc<Mutex<Connection>>) {
        let state = self.state(name);
        let (conn_id, was_member) = {
            let conn_id = conn.lock().expect("connection lock").id.clone();
            let mut state = state.lock().expect("channel lock");
            let was = state.subscribers.remove(&conn_id).is_some();
            (conn_id, was)
        };
        conn.lock().expect("connection lock").channels.remove(name);

        if was_member && ChannelKind::classify(name) == ChannelKind::Presence {
            self.emit_presence(name, "presence:leave", &conn_id);
        }
        self.drop_if_empty(name);
    }

    /// Remove a connection from every channel it joined.
    pub fn remove_connection(&self, conn: &Arc<Mutex<Connection>>) {
        let names: Vec<String> = {
            let conn = conn.lock().expect("connection lock");
            conn.channels.iter().cloned().collect()
        };
        for name in names {
            self.unsubscribe(&name, conn);
        }
    }

    fn existing_state(&self, name: &str) -> Option<Arc<Mutex<ChannelState>>> {
        let map = self.channels.lock().expect("channel map lock");
        map.get(name).cloned()
    }

    /// Current subscriber ids, unordered.
    pub fn subscribers(&self, name: &str) -> Vec<ConnectionId> {
        match self.existing_state(name) {
            Some(state) => state
                .lock()
                .expect("channel lock")
                .subscribers
                .keys()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Broadcast to a snapshot of the subscriber set in slices of 100,
    /// yielding between slices. Send failures are logged and skipped.
    pub fn broadcast(&self, name: &str, msg: &Message, except: Option<&ConnectionId>) -> usize {
        let recipients: Vec<ConnectionId> = self
            .subscribers(name)
            .into_iter()
            .filter(|id| except != Some(id))
            .collect();

        let mut sent = 0;
        for slice in recipients.chunks(BROADCAST_BATCH) {
            for conn_id in slice {
                match self.transport.send(conn_id, msg) {
                    Ok(()) => sent += 1,
                    Err(err) => {
                        log::warn!("broadcast to {conn_id} on '{name}' failed: {err}");
                    }
                }
            }
            std::thread::yield_now();
        }
        sent
    }

    /// Presence data: defined only on presence channels.
    pub fn presence_of(&self, name: &str) -> Result<Vec<PresenceEntry>> {
        if ChannelKind::classify(name) != ChannelKind::Presence {
            return Err(Error::ChannelValidation(format!(
                "'{name}' is not a presence channel"
            )));
        }
        let Some(state) = self.existing_state(name) else {
            return Ok(Vec::new());
        };
        let state = state.lock().expect("channel lock");
        Ok(state.subscribers.values().flatten().cloned().collect())
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .lock()
            .expect("channel map lock")
            .keys()
            .cloned()
            .collect()
    }

    fn emit_presence(&self, name: &str, event: &str, conn_id: &ConnectionId) {
        let mut msg = Message::with_clock(MessageKind::Event, self.clock.as_ref());
        msg.channel = Some(name.to_string());
        msg.event = Some(event.to_string());
        msg.data = serde_json::json!({ "connection": conn_id });
        self.broadcast(name, &msg, None);
    }

    fn drop_if_empty(&self, name: &str) {
        let empty = self
            .existing_state(name)
            .map(|state| state.lock().expect("channel lock").subscribers.is_empty())
            .unwrap_or(false);
        if empty {
            let mut map = self.channels.lock().expect("channel map lock");
            // A racing subscribe still holds a clone of the state handle;
            // leave the channel in place for it.
            let unshared = map
                .get(name)
                .map(|state| Arc::strong_count(state) == 1)
                .unwrap_or(false);
            if unshared {
                map.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn null_transport_broadcast_counts_recipients() {
        let manager = ChannelManager::new(Arc::new(NullTransport), Arc::new(SystemClock));
        let conn = Arc::new(Mutex::new(Connection::new("c1", &SystemClock)));
        manager.subscribe("orders", &conn).expect("subscribe");

        let msg = Message::event("orders", "created", serde_json::Value::Null);
        assert_eq!(manager.broadcast("orders", &msg, None), 1);
    }

    #[test]
    fn classify_by_prefix() {
        assert_eq!(ChannelKind::classify("orders"), ChannelKind::Public);
        assert_eq!(ChannelKind::classify("private-admin"), ChannelKind::Private);
        assert_eq!(ChannelKind::classify("private.admin"), ChannelKind::Private);
        assert_eq!(ChannelKind::classify("user.42"), ChannelKind::Private);
        assert_eq!(ChannelKind::classify("presence-room"), ChannelKind::Presence);
        assert_eq!(ChannelKind::classify("presence.room"), ChannelKind::Presence);
    }
}
