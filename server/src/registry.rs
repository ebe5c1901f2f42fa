//! Connection registry: live sockets and their per-connection metadata.
//!
//! The registry is owned exclusively by the reactor loop. Each entry holds
//! the outbound message channel to the connection's writer task plus the
//! ephemeral state that dies with the socket: session id, resolved user,
//! protocol state, last liveness response.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::info;
use shared::ServerMessage;
use tokio::sync::mpsc;

/// Protocol state machine per connection. `update_user_pos` and
/// `chat_message` only carry meaning once a user is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket open, no session or user resolved yet.
    Unresolved,
    /// `hello` succeeded and a user is bound.
    Authenticated,
    /// Normal operation after the first post-hello message.
    Active,
}

/// One live connection's server-side state.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    /// Channel into the connection's writer task.
    pub outbox: mpsc::Sender<ServerMessage>,
    /// Session identifier from the handshake cookie or a message body.
    pub session_id: Option<String>,
    /// User bound by a successful `hello`.
    pub user_id: Option<i64>,
    pub state: ConnState,
    pub last_pong: Instant,
    /// Session id sent to the store worker for resolution; the reply
    /// completes this connection's pending `hello`.
    pub awaiting_session: Option<String>,
    /// User id whose state is being loaded to finish a pending `hello`.
    pub awaiting_user: Option<i64>,
}

impl Connection {
    fn new(id: u64, outbox: mpsc::Sender<ServerMessage>, session_id: Option<String>) -> Self {
        Self {
            id,
            outbox,
            session_id,
            user_id: None,
            state: ConnState::Unresolved,
            last_pong: Instant::now(),
            awaiting_session: None,
            awaiting_user: None,
        }
    }

    /// True when no `pong` arrived within the timeout window.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_pong.elapsed() > timeout
    }
}

/// Registry of all live connections, keyed by connection id. Ids are
/// allocated monotonically by the accept path so a connection task can tag
/// its events before the reactor has seen the socket.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<u64, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Registers a freshly upgraded connection under its assigned id.
    pub fn insert(
        &mut self,
        id: u64,
        outbox: mpsc::Sender<ServerMessage>,
        session_id: Option<String>,
    ) {
        info!("Connection {} registered", id);
        self.connections
            .insert(id, Connection::new(id, outbox, session_id));
    }

    /// Drops a connection. Dropping the outbox ends the writer task, which
    /// closes the socket. Returns the entry for final bookkeeping.
    pub fn remove(&mut self, id: u64) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            info!("Connection {} removed", id);
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Records a liveness response.
    pub fn mark_pong(&mut self, id: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_pong = Instant::now();
        }
    }

    /// Connections whose last `pong` is older than the timeout.
    pub fn timed_out(&self, timeout: Duration) -> Vec<u64> {
        self.connections
            .values()
            .filter(|conn| conn.is_timed_out(timeout))
            .map(|conn| conn.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Users with at least one live connection bound to them.
    pub fn connected_user_ids(&self) -> HashSet<i64> {
        self.connections
            .values()
            .filter_map(|conn| conn.user_id)
            .collect()
    }

    /// True if any other live connection still resolves to this user.
    pub fn user_still_connected(&self, user_id: i64) -> bool {
        self.connections
            .values()
            .any(|conn| conn.user_id == Some(user_id))
    }

    /// Connections waiting on a store resolution for this session id.
    pub fn awaiting_session(&self, session_id: &str) -> Vec<u64> {
        self.connections
            .values()
            .filter(|conn| conn.awaiting_session.as_deref() == Some(session_id))
            .map(|conn| conn.id)
            .collect()
    }

    /// Connections waiting on this user's state load.
    pub fn awaiting_user(&self, user_id: i64) -> Vec<u64> {
        self.connections
            .values()
            .filter(|conn| conn.awaiting_user == Some(user_id))
            .map(|conn| conn.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> mpsc::Sender<ServerMessage> {
        mpsc::channel(8).0
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), None);
        registry.insert(2, outbox(), Some("s1".to_string()));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(1).is_some());
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn test_new_connection_is_unresolved() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), Some("s1".to_string()));
        let conn = registry.get(1).unwrap();
        assert_eq!(conn.state, ConnState::Unresolved);
        assert_eq!(conn.session_id.as_deref(), Some("s1"));
        assert!(conn.user_id.is_none());
    }

    #[test]
    fn test_remove() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), None);
        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_timeout_detection() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), None);
        assert!(registry.timed_out(Duration::from_secs(1)).is_empty());

        registry.get_mut(1).unwrap().last_pong = Instant::now() - Duration::from_secs(2);
        assert_eq!(registry.timed_out(Duration::from_secs(1)), vec![1]);

        // A pong rescues the connection.
        registry.mark_pong(1);
        assert!(registry.timed_out(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_connected_user_ids() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), None);
        registry.insert(2, outbox(), None);
        registry.get_mut(1).unwrap().user_id = Some(42);

        let connected = registry.connected_user_ids();
        assert!(connected.contains(&42));
        assert_eq!(connected.len(), 1);
        assert!(registry.user_still_connected(42));
        assert!(!registry.user_still_connected(7));
    }

    #[test]
    fn test_awaiting_session_lookup() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, outbox(), Some("s1".to_string()));
        registry.insert(2, outbox(), Some("s2".to_string()));
        registry.get_mut(1).unwrap().awaiting_session = Some("s1".to_string());

        assert_eq!(registry.awaiting_session("s1"), vec![1]);
        assert!(registry.awaiting_session("s2").is_empty());
    }
}
