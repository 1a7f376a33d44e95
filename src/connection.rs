//! Live connection state and the owning registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelManager;
use crate::clock::Clock;

pub type ConnectionId = String;

/// Resolved user identity attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// One live client connection.
///
/// The registry owns these; the channel manager refers to them by id only.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user: Option<UserIdentity>,
    /// Authentication source that resolved the user.
    pub guard: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub connected_at_ns: u64,
    pub last_activity_at_ns: u64,
    pub metadata: HashMap<String, serde_json::Value>,
    pub(crate) channels: HashSet<String>,
}

impl Connection {
    pub fn new(id: impl Into<ConnectionId>, clock: &dyn Clock) -> Self {
        let now = clock.now_ns();
        Self {
            id: id.into(),
            user: None,
            guard: None,
            ip: None,
            user_agent: None,
            origin: None,
            connected_at_ns: now,
            last_activity_at_ns: now,
            metadata: HashMap::new(),
            channels: HashSet::new(),
        }
    }

    pub fn authenticate(&mut self, user: UserIdentity, guard: Option<String>) {
        self.user = Some(user);
        self.guard = guard;
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Channels this connection is subscribed to.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn touch(&mut self, now_ns: u64) {
        // last_activity never precedes connected_at.
        self.last_activity_at_ns = now_ns.max(self.connected_at_ns);
    }

    pub fn is_idle(&self, now_ns: u64, threshold_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_activity_at_ns) >= threshold_ns
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Release channel membership and metadata.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.channels.shrink_to_fit();
        self.metadata.clear();
        self.metadata.shrink_to_fit();
    }
}

/// Owns every live connection. Mutators are serialized per connection; reads
/// iterate a snapshot.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Mutex<Connection>>>>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Register a connection. Idempotent on id: an existing entry wins.
    pub fn register(&self, conn: Connection) -> Arc<Mutex<Connection>> {
        let mut map = self.connections.lock().expect("registry lock");
        map.entry(conn.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(conn)))
            .clone()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().expect("registry lock").get(id).cloned()
    }

    /// Snapshot of all live connections.
    pub fn iterate(&self) -> Vec<Arc<Mutex<Connection>>> {
        self.connections
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn touch(&self, id: &str) {
        if let Some(conn) = self.lookup(id) {
            conn.lock().expect("connection lock").touch(self.clock.now_ns());
        }
    }

    /// Remove a connection: channel membership first, then state.
    pub fn unregister(&self, id: &str, channels: &ChannelManager) {
        let entry = {
            let mut map = self.connections.lock().expect("registry lock");
            map.remove(id)
        };
        if let Some(conn) = entry {
            channels.remove_connection(&conn);
            conn.lock().expect("connection lock").clear();
        }
    }

    /// Unregister and return every connection idle past the threshold.
    pub fn sweep_idle(&self, threshold_ns: u64, channels: &ChannelManager) -> Vec<ConnectionId> {
        let now = self.clock.now_ns();
        let idle: Vec<ConnectionId> = self
            .iterate()
            .into_iter()
            .filter_map(|conn| {
                let conn = conn.lock().expect("connection lock");
                conn.is_idle(now, threshold_ns).then(|| conn.id.clone())
            })
            .collect();
        for id in &idle {
            log::debug!("sweeping idle connection {id}");
            self.unregister(id, channels);
        }
        idle
    }
}
