//! The sticky routing table.

use std::sync::{Arc, Weak};

use hive_proto::ActorId;
use parking_lot::Mutex;

use crate::connection::GatewayConnection;

/// Fixed-size table of weak connection references, indexed by the stable
/// hash of the target actor.
///
/// A slot holds the connection most recently assigned to its bucket. The
/// reference is weak: a connection dropped by the pool is not kept alive
/// by the table, and a slot pointing at a closed connection reads as
/// empty and is repaired in place. Slots are independent; there is no
/// table-wide lock.
pub struct BucketTable {
    slots: Vec<Mutex<Weak<GatewayConnection>>>,
}

impl BucketTable {
    /// Create a table with `size` buckets.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let slots = (0..size).map(|_| Mutex::new(Weak::new())).collect();
        Self { slots }
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no buckets. Never true: the table always has
    /// at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The bucket an actor routes through.
    #[must_use]
    pub fn index_of(&self, actor: &ActorId) -> usize {
        actor.stable_hash() as usize % self.slots.len()
    }

    /// Resolve the connection assigned to a bucket, if it is still live.
    ///
    /// A slot holding a dead or closed connection is cleared on the way
    /// out.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Arc<GatewayConnection>> {
        let mut slot = self.slots[index].lock();
        match slot.upgrade() {
            Some(conn) if conn.is_valid() => Some(conn),
            Some(_) | None => {
                *slot = Weak::new();
                None
            }
        }
    }

    /// Assign `fresh` to the bucket unless a competing assignment won.
    ///
    /// If another task installed a live connection since the caller last
    /// observed the slot, that winner is adopted and returned; otherwise
    /// `fresh` is written and returned. Either way the caller gets the
    /// connection the bucket now points at.
    #[must_use]
    pub fn install(&self, index: usize, fresh: &Arc<GatewayConnection>) -> Arc<GatewayConnection> {
        let mut slot = self.slots[index].lock();
        match slot.upgrade() {
            Some(current) if current.is_valid() && !Arc::ptr_eq(&current, fresh) => current,
            _ => {
                *slot = Arc::downgrade(fresh);
                Arc::clone(fresh)
            }
        }
    }
}

impl std::fmt::Debug for BucketTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketTable")
            .field("buckets", &self.slots.len())
            .finish()
    }
}
