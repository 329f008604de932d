use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use skiff_proto::{PeerInfo, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DuplicatePolicy;
use crate::error::RelayError;

/// Identifies one WebSocket connection, independent of the id it joined with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Work items for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close,
}

#[derive(Debug)]
struct SessionEntry {
    info: PeerInfo,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    alive: bool,
}

impl SessionEntry {
    fn deliver(&self, message: ServerMessage) {
        if self.tx.send(Outbound::Message(message)).is_err() {
            debug!(peer_id = %self.info.id, "writer gone; dropping outbound message");
        }
    }
}

/// Registry of joined sessions. Owned by the relay process and only reachable
/// through join/relay/leave/sweep; every mutation holds the write lock so the
/// roster a joiner sees and the broadcast it triggers are consistent.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    policy: DuplicatePolicy,
    next_connection: AtomicU64,
}

impl SessionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `info.id` for `connection`. The joiner receives one
    /// `peer-joined` per existing session; every existing session receives one
    /// `peer-joined` for the joiner. Returns the number of pre-existing sessions.
    pub fn join(
        &self,
        connection: ConnectionId,
        info: PeerInfo,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<usize, RelayError> {
        let mut sessions = self.sessions.write();

        if let Some(existing) = sessions.get(&info.id) {
            if existing.connection == connection {
                return Err(RelayError::AlreadyJoined(info.id));
            }
            match self.policy {
                DuplicatePolicy::Reject => {
                    warn!(peer_id = %info.id, "rejecting join: id already connected");
                    return Err(RelayError::DuplicateIdentity(info.id));
                }
                DuplicatePolicy::Replace => {
                    if let Some(evicted) = sessions.remove(&info.id) {
                        info!(peer_id = %info.id, "replacing existing session with new connection");
                        let _ = evicted.tx.send(Outbound::Close);
                        for other in sessions.values() {
                            other.deliver(ServerMessage::PeerLeft {
                                peer_id: info.id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let existing = sessions.len();
        for other in sessions.values() {
            let _ = tx.send(Outbound::Message(ServerMessage::PeerJoined {
                peer: other.info.clone(),
            }));
            other.deliver(ServerMessage::PeerJoined { peer: info.clone() });
        }

        info!(peer_id = %info.id, model = %info.model, roster = existing, "session joined");
        sessions.insert(
            info.id.clone(),
            SessionEntry {
                info,
                connection,
                tx,
                alive: true,
            },
        );
        Ok(existing)
    }

    /// Forward an opaque signal to `target`. Returns whether it was delivered;
    /// an unknown target is not an error because the peer may have left
    /// mid-handshake.
    pub fn relay(&self, sender: &str, target: &str, data: Value) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(target) {
            Some(entry) => {
                entry.deliver(ServerMessage::Signal {
                    sender: sender.to_string(),
                    data,
                });
                true
            }
            None => {
                debug!(sender, target, "dropping signal for unknown target");
                false
            }
        }
    }

    /// Remove `id` if it is still owned by `connection` and broadcast
    /// `peer-left` once. Repeated calls are no-ops.
    pub fn leave(&self, id: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions.write();
        let owned = sessions
            .get(id)
            .is_some_and(|entry| entry.connection == connection);
        if !owned {
            return false;
        }
        sessions.remove(id);
        for other in sessions.values() {
            other.deliver(ServerMessage::PeerLeft {
                peer_id: id.to_string(),
            });
        }
        info!(peer_id = %id, roster = sessions.len(), "session left");
        true
    }

    /// Record a pong (or any ping/pong message) from `id`.
    pub fn mark_alive(&self, id: &str, connection: ConnectionId) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(id) {
            if entry.connection == connection {
                entry.alive = true;
            }
        }
    }

    /// One heartbeat tick: terminate every session that did not answer the
    /// previous ping, then ping the survivors. Returns the terminated ids.
    pub fn sweep(&self) -> Vec<String> {
        let mut sessions = self.sessions.write();

        let dead: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| !entry.alive)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &dead {
            if let Some(entry) = sessions.remove(id) {
                warn!(peer_id = %id, "heartbeat missed; terminating session");
                let _ = entry.tx.send(Outbound::Close);
            }
        }

        for entry in sessions.values_mut() {
            for id in &dead {
                entry.deliver(ServerMessage::PeerLeft {
                    peer_id: id.clone(),
                });
            }
            entry.alive = false;
            let _ = entry.tx.send(Outbound::Ping);
        }

        dead
    }

    pub fn roster(&self) -> Vec<PeerInfo> {
        let mut roster: Vec<PeerInfo> = self
            .sessions
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_proto::DeviceClass;

    struct Client {
        connection: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            model: format!("Skiff Node {id}"),
            class: DeviceClass::Desktop,
        }
    }

    fn join(registry: &SessionRegistry, id: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = registry.next_connection_id();
        registry.join(connection, peer(id), tx).expect("join");
        Client { connection, rx }
    }

    fn drain(client: &mut Client) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = client.rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn joined_ids(items: &[Outbound]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Message(ServerMessage::PeerJoined { peer }) => Some(peer.id.clone()),
                _ => None,
            })
            .collect()
    }

    fn left_ids(items: &[Outbound]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Message(ServerMessage::PeerLeft { peer_id }) => Some(peer_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn join_fans_out_exactly_once_in_both_directions() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let mut a = join(&registry, "a");
        let mut b = join(&registry, "b");
        let mut c = join(&registry, "c");

        assert_eq!(joined_ids(&drain(&mut a)), vec!["b", "c"]);
        assert_eq!(joined_ids(&drain(&mut b)), vec!["a", "c"]);
        let mut roster_for_c = joined_ids(&drain(&mut c));
        roster_for_c.sort();
        assert_eq!(roster_for_c, vec!["a", "b"]);
    }

    #[test_timeout::timeout]
    fn duplicate_identity_is_rejected_by_default() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let mut first = join(&registry, "dup");
        let mut other = join(&registry, "other");
        drain(&mut first);
        drain(&mut other);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry
            .join(registry.next_connection_id(), peer("dup"), tx)
            .expect_err("duplicate must fail");
        assert_eq!(err, RelayError::DuplicateIdentity("dup".into()));
        assert!(drain(&mut first).is_empty());
        assert!(drain(&mut other).is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test_timeout::timeout]
    fn duplicate_identity_replaces_under_replace_policy() {
        let registry = SessionRegistry::new(DuplicatePolicy::Replace);
        let mut old = join(&registry, "dup");
        let mut watcher = join(&registry, "watcher");
        drain(&mut old);
        drain(&mut watcher);

        let mut new = join(&registry, "dup");
        assert_eq!(drain(&mut old), vec![Outbound::Close]);
        let seen = drain(&mut watcher);
        assert_eq!(left_ids(&seen), vec!["dup"]);
        assert_eq!(joined_ids(&seen), vec!["dup"]);
        assert_eq!(joined_ids(&drain(&mut new)), vec!["watcher"]);

        // the evicted connection's late disconnect must not remove the new owner
        assert!(!registry.leave("dup", old.connection));
        assert_eq!(registry.len(), 2);
    }

    #[test_timeout::timeout]
    fn signal_reaches_only_the_target() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let mut a = join(&registry, "a");
        let mut b = join(&registry, "b");
        let mut c = join(&registry, "c");
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        let data = json!({"type": "offer", "sdp": "v=0"});
        assert!(registry.relay("a", "b", data.clone()));
        assert_eq!(
            drain(&mut b),
            vec![Outbound::Message(ServerMessage::Signal {
                sender: "a".into(),
                data,
            })]
        );
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut c).is_empty());

        assert!(!registry.relay("a", "ghost", json!({})));
        assert!(drain(&mut b).is_empty());
        assert!(drain(&mut c).is_empty());
    }

    #[test_timeout::timeout]
    fn leave_broadcasts_once() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let a = join(&registry, "a");
        let mut b = join(&registry, "b");
        drain(&mut b);

        assert!(registry.leave("a", a.connection));
        assert!(!registry.leave("a", a.connection));
        assert_eq!(left_ids(&drain(&mut b)), vec!["a"]);
    }

    #[test_timeout::timeout]
    fn silent_session_is_reaped_exactly_once() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let mut quiet = join(&registry, "quiet");
        let mut chatty = join(&registry, "chatty");
        drain(&mut quiet);
        drain(&mut chatty);

        // first tick pings everyone
        assert!(registry.sweep().is_empty());
        assert_eq!(drain(&mut quiet), vec![Outbound::Ping]);
        assert_eq!(drain(&mut chatty), vec![Outbound::Ping]);

        registry.mark_alive("chatty", chatty.connection);

        // second tick terminates the one that stayed silent
        assert_eq!(registry.sweep(), vec!["quiet".to_string()]);
        assert_eq!(drain(&mut quiet), vec![Outbound::Close]);
        let seen = drain(&mut chatty);
        assert_eq!(left_ids(&seen), vec!["quiet"]);
        assert_eq!(seen.last(), Some(&Outbound::Ping));

        // socket teardown after termination is a no-op
        assert!(!registry.leave("quiet", quiet.connection));
        registry.mark_alive("chatty", chatty.connection);
        assert!(registry.sweep().is_empty());
        assert!(left_ids(&drain(&mut chatty)).is_empty());
        assert_eq!(registry.roster(), vec![peer("chatty")]);
    }

    #[test_timeout::timeout]
    fn rejoin_on_same_connection_is_refused() {
        let registry = SessionRegistry::new(DuplicatePolicy::Replace);
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = registry.next_connection_id();
        registry.join(connection, peer("a"), tx.clone()).unwrap();
        assert_eq!(
            registry.join(connection, peer("a"), tx),
            Err(RelayError::AlreadyJoined("a".into()))
        );
    }
}
