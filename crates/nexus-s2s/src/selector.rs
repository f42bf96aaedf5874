//! Which pooled connection carries an outbound stanza.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::pool::{ConnectionPool, PooledConnection};

/// Routing class of an outbound stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Control traffic: always goes to the pool's system connection.
    System,
}

/// Stable hash of a sender identity. `DefaultHasher::new()` uses fixed keys,
/// so the value is the same for the life of the process.
pub fn sender_hash(sender: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sender.hash(&mut hasher);
    hasher.finish()
}

pub trait ConnectionSelector: Send + Sync {
    /// Pick a ready connection, or `None` when nothing can carry the stanza yet.
    fn select<'p>(&self, pool: &'p ConnectionPool, sender: &str, priority: Priority) -> Option<&'p PooledConnection>;
}

/// `hash(sender) mod data-plane size`, with system traffic pinned to the
/// reserved connection.
///
/// The same sender always lands on the same connection while the pool is
/// unchanged, which keeps its stanzas in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl ConnectionSelector for HashSelector {
    fn select<'p>(&self, pool: &'p ConnectionPool, sender: &str, priority: Priority) -> Option<&'p PooledConnection> {
        let ready: Vec<&PooledConnection> = pool.ready().collect();
        if ready.is_empty() {
            return None;
        }
        if priority == Priority::System {
            return ready.iter().copied().find(|c| c.is_system).or(ready.first().copied());
        }
        // The system connection is only withheld from data traffic when
        // another ready connection can take it.
        let data: Vec<&PooledConnection> = if ready.len() > 1 {
            ready.iter().copied().filter(|c| !c.is_system).collect()
        } else {
            ready
        };
        let idx = (sender_hash(sender) % data.len() as u64) as usize;
        data.get(idx).copied()
    }
}

/// Convenience wrapper around [`HashSelector`].
pub fn select_connection<'p>(pool: &'p ConnectionPool, sender: &str, priority: Priority) -> Option<&'p PooledConnection> {
    HashSelector.select(pool, sender, priority)
}
