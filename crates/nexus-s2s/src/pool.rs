//! Per-CID pool of outgoing connections plus the stanzas waiting for one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cid::Cid;
use crate::error::S2sError;
use crate::router::SessionCommand;
use crate::selector::Priority;
use crate::session::SessionId;
use crate::xml::Element;

/// Senders remembered per pool while it is below full size.
pub const MAX_PINNED_SENDERS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connecting or negotiating; cannot carry stanzas yet.
    Handshaking,
    /// Authenticated and usable.
    Ready,
}

/// Handle to one outgoing session owned by the pool.
#[derive(Debug)]
pub struct PooledConnection {
    pub id: SessionId,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub status: ConnectionStatus,
    pub is_system: bool,
}

/// Answer of [`ConnectionPool::acquire_outgoing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Use the existing connections.
    Reuse,
    /// Open one more physical connection.
    Open,
}

#[derive(Debug)]
pub struct QueuedStanza {
    pub stanza: Element,
    pub priority: Priority,
    pub queued_at: Instant,
}

#[derive(Debug)]
pub struct ConnectionPool {
    cid: Cid,
    max_size: usize,
    max_waiting: usize,
    connections: Vec<PooledConnection>,
    /// Distinct senders seen, bounded just above `max_size`.
    demand: HashSet<u64>,
    /// Sender hash to the connection that carried its stanzas while the pool was changing shape.
    pins: HashMap<u64, SessionId>,
    waiting: VecDeque<QueuedStanza>,
    incoming: HashSet<SessionId>,
}

impl ConnectionPool {
    pub fn new(cid: Cid, max_size: usize, max_waiting: usize) -> Self {
        Self {
            cid,
            max_size: max_size.max(1),
            max_waiting,
            connections: Vec::new(),
            demand: HashSet::new(),
            pins: HashMap::new(),
            waiting: VecDeque::new(),
            incoming: HashSet::new(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> &[PooledConnection] {
        &self.connections
    }

    pub fn ready(&self) -> impl Iterator<Item = &PooledConnection> {
        self.connections.iter().filter(|c| c.status == ConnectionStatus::Ready)
    }

    pub fn get(&self, id: SessionId) -> Option<&PooledConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn system_id(&self) -> Option<SessionId> {
        self.connections.iter().find(|c| c.is_system).map(|c| c.id)
    }

    // ── Growth ───────────────────────────────────────────────────────────────

    /// Record demand from `sender` and decide whether the pool should grow.
    ///
    /// Grows when empty, or when more distinct senders have been seen than
    /// there are connections, and never past `max_size`.
    pub fn acquire_outgoing(&mut self, sender: u64) -> Acquire {
        if self.demand.len() <= self.max_size {
            self.demand.insert(sender);
        }
        if self.connections.len() >= self.max_size {
            return Acquire::Reuse;
        }
        if self.connections.is_empty() || self.demand.len() > self.connections.len() {
            Acquire::Open
        } else {
            Acquire::Reuse
        }
    }

    /// Register a connection that is being set up.
    pub fn insert_handshaking(
        &mut self,
        id: SessionId,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Result<(), S2sError> {
        if self.connections.len() >= self.max_size {
            return Err(S2sError::NoConnection(self.cid.clone()));
        }
        self.connections.push(PooledConnection { id, commands, status: ConnectionStatus::Handshaking, is_system: false });
        Ok(())
    }

    /// A connection authenticated. The first ready one becomes the system connection.
    pub fn mark_ready(&mut self, id: SessionId) -> bool {
        let has_system = self.connections.iter().any(|c| c.is_system);
        let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        conn.status = ConnectionStatus::Ready;
        if !has_system {
            conn.is_system = true;
        }
        true
    }

    /// Drop a closed connection. Returns false if it was already gone.
    pub fn remove(&mut self, id: SessionId) -> bool {
        let Some(idx) = self.connections.iter().position(|c| c.id == id) else {
            return false;
        };
        let removed = self.connections.remove(idx);
        if removed.is_system {
            if let Some(next) = self.connections.iter_mut().find(|c| c.status == ConnectionStatus::Ready) {
                next.is_system = true;
            }
        }
        self.pins.retain(|_, pinned| *pinned != id);
        // Demand is measured against live connections; start over once none are left.
        if self.connections.is_empty() {
            self.demand.clear();
        }
        true
    }

    // ── Sender pinning ───────────────────────────────────────────────────────

    /// Ready connection `sender` is pinned to, if any.
    pub fn pinned(&self, sender: u64) -> Option<&PooledConnection> {
        let id = self.pins.get(&sender)?;
        self.ready().find(|c| c.id == *id)
    }

    /// Keep `sender` on connection `id` until it closes. Only recorded while
    /// the set of ready connections can still grow; a full pool maps senders
    /// stably on its own.
    pub fn pin(&mut self, sender: u64, id: SessionId) {
        if self.ready().count() >= self.max_size || self.pins.len() >= MAX_PINNED_SENDERS {
            return;
        }
        self.pins.entry(sender).or_insert(id);
    }

    // ── Incoming sessions ────────────────────────────────────────────────────

    /// Track an incoming session authenticated for this CID. False when at `cap`.
    pub fn register_incoming(&mut self, id: SessionId, cap: usize) -> bool {
        if self.incoming.contains(&id) {
            return true;
        }
        if self.incoming.len() >= cap {
            return false;
        }
        self.incoming.insert(id)
    }

    pub fn remove_incoming(&mut self, id: SessionId) -> bool {
        self.incoming.remove(&id)
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    // ── Waiting queue ────────────────────────────────────────────────────────

    pub fn enqueue(&mut self, stanza: Element, priority: Priority) -> Result<(), S2sError> {
        if self.waiting.len() >= self.max_waiting {
            return Err(S2sError::PoolExhausted { cid: self.cid.clone(), waiting: self.waiting.len() });
        }
        self.waiting.push_back(QueuedStanza { stanza, priority, queued_at: Instant::now() });
        Ok(())
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn drain_waiting(&mut self) -> Vec<QueuedStanza> {
        self.waiting.drain(..).collect()
    }

    /// Remove and return stanzas queued for longer than `max_age`.
    pub fn expire_waiting(&mut self, max_age: Duration) -> Vec<QueuedStanza> {
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.waiting.drain(..).partition(|q| now.duration_since(q.queued_at) >= max_age);
        self.waiting = kept.into();
        expired
    }

    /// Nothing left worth keeping the entry for.
    pub fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.incoming.is_empty() && self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NS_SERVER;
    use crate::selector::sender_hash;

    fn pool(max: usize) -> ConnectionPool {
        ConnectionPool::new(Cid::new("a.example", "b.example"), max, 3)
    }

    fn open(pool: &mut ConnectionPool) -> SessionId {
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = SessionId::next();
        pool.insert_handshaking(id, tx).unwrap();
        id
    }

    #[test]
    fn growth_never_exceeds_cap() {
        let mut pool = pool(2);
        for i in 0..50 {
            if pool.acquire_outgoing(sender_hash(&format!("user{i}@a.example"))) == Acquire::Open {
                open(&mut pool);
            }
            assert!(pool.len() <= 2);
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.acquire_outgoing(sender_hash("late@a.example")), Acquire::Reuse);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(pool.insert_handshaking(SessionId::next(), tx).is_err());
    }

    #[test]
    fn one_sender_keeps_one_connection() {
        let mut pool = pool(4);
        let h = sender_hash("solo@a.example");
        assert_eq!(pool.acquire_outgoing(h), Acquire::Open);
        open(&mut pool);
        for _ in 0..10 {
            assert_eq!(pool.acquire_outgoing(h), Acquire::Reuse);
        }
    }

    #[test]
    fn demand_resets_when_the_last_connection_closes() {
        let mut pool = pool(3);
        for name in ["x@a.example", "y@a.example", "z@a.example"] {
            if pool.acquire_outgoing(sender_hash(name)) == Acquire::Open {
                open(&mut pool);
            }
        }
        assert_eq!(pool.len(), 3);
        let ids: Vec<SessionId> = pool.connections().iter().map(|c| c.id).collect();
        for id in ids {
            pool.remove(id);
        }

        let h = sender_hash("x@a.example");
        assert_eq!(pool.acquire_outgoing(h), Acquire::Open);
        open(&mut pool);
        // A single sender does not regrow the pool on stale demand.
        assert_eq!(pool.acquire_outgoing(h), Acquire::Reuse);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pins_hold_while_growing_and_go_with_their_connection() {
        let mut pool = pool(2);
        let h = sender_hash("x@a.example");
        let first = open(&mut pool);
        pool.mark_ready(first);
        pool.pin(h, first);
        assert_eq!(pool.pinned(h).map(|c| c.id), Some(first));

        let second = open(&mut pool);
        pool.mark_ready(second);
        // Full pool: nothing new is pinned, existing pins stay.
        pool.pin(sender_hash("y@a.example"), second);
        assert!(pool.pinned(sender_hash("y@a.example")).is_none());
        assert_eq!(pool.pinned(h).map(|c| c.id), Some(first));

        pool.remove(first);
        assert!(pool.pinned(h).is_none());
    }

    #[test]
    fn system_designation_is_unique_and_survives_removal() {
        let mut pool = pool(3);
        let a = open(&mut pool);
        let b = open(&mut pool);
        let c = open(&mut pool);
        pool.mark_ready(b);
        pool.mark_ready(a);
        pool.mark_ready(c);
        assert_eq!(pool.system_id(), Some(b));
        assert_eq!(pool.connections().iter().filter(|c| c.is_system).count(), 1);

        assert!(pool.remove(b));
        assert!(!pool.remove(b));
        assert_eq!(pool.connections().iter().filter(|c| c.is_system).count(), 1);
        assert_eq!(pool.system_id(), Some(a));
    }

    #[test]
    fn waiting_queue_is_bounded_and_ages() {
        let mut pool = pool(1);
        let msg = Element::new("message", NS_SERVER);
        for _ in 0..3 {
            pool.enqueue(msg.clone(), Priority::Normal).unwrap();
        }
        let err = pool.enqueue(msg.clone(), Priority::Normal).unwrap_err();
        assert!(err.is_retryable());

        assert!(pool.expire_waiting(Duration::from_secs(60)).is_empty());
        assert_eq!(pool.expire_waiting(Duration::ZERO).len(), 3);
        assert_eq!(pool.waiting_len(), 0);
    }

    #[test]
    fn incoming_cap() {
        let mut pool = pool(1);
        assert!(pool.register_incoming(SessionId::next(), 1));
        assert!(!pool.register_incoming(SessionId::next(), 1));
    }
}
