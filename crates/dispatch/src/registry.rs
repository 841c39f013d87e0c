use std::{hash::BuildHasher, time::Instant};

use ahash::{HashMap, HashMapExt, RandomState};
use parking_lot::RwLock;

use crate::{Error, address::Address};

const SHARD_COUNT: usize = 16;

/// A registered connection: the owning task's handle and when it was created.
#[derive(Debug, Clone)]
pub struct ConnectionEntry<T> {
    pub handle: T,
    pub created_at: Instant,
}

/// Sharded map from a local connection id to the task that owns it.
///
/// `insert_unique` is the concurrency primitive: two racing creations of the
/// same id resolve to exactly one winner, the loser observes
/// [`Error::AlreadyRegistered`] and adopts the winner's handle. Lookups take a
/// shard read lock only.
pub struct Registry<T> {
    shards: Vec<RwLock<HashMap<Vec<u8>, ConnectionEntry<T>>>>,
    state: RandomState,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::with_capacity(1024)))
                .collect(),
            state: RandomState::new(),
        }
    }

    fn shard(&self, cid: &[u8]) -> &RwLock<HashMap<Vec<u8>, ConnectionEntry<T>>> {
        &self.shards[(self.state.hash_one(cid) % SHARD_COUNT as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }
}

impl<T> Registry<T>
where
    T: Clone,
{
    /// Insert an entry, failing if the id is already owned.
    pub fn insert_unique(&self, cid: &[u8], handle: T) -> Result<(), Error> {
        let mut shard = self.shard(cid).write();
        if shard.contains_key(cid) {
            return Err(Error::AlreadyRegistered);
        }

        shard.insert(
            cid.to_vec(),
            ConnectionEntry {
                handle,
                created_at: Instant::now(),
            },
        );

        Ok(())
    }

    pub fn lookup(&self, cid: &[u8]) -> Option<T> {
        self.shard(cid).read().get(cid).map(|entry| entry.handle.clone())
    }

    pub fn remove(&self, cid: &[u8]) -> Option<T> {
        self.shard(cid).write().remove(cid).map(|entry| entry.handle)
    }
}

/// Optional address to connection-id side table, kept when address routing is
/// enabled so migrated peers can be traced back to their connection.
#[derive(Default)]
pub struct AddressRoutes {
    routes: RwLock<HashMap<Address, Vec<u8>>>,
}

impl AddressRoutes {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::with_capacity(1024)),
        }
    }

    pub fn insert(&self, address: Address, cid: &[u8]) {
        self.routes.write().insert(address, cid.to_vec());
    }

    pub fn lookup(&self, address: &Address) -> Option<Vec<u8>> {
        self.routes.read().get(address).cloned()
    }

    pub fn remove(&self, address: &Address) -> Option<Vec<u8>> {
        self.routes.write().remove(address)
    }

    /// Drop every route pointing at a connection id.
    pub fn remove_cid(&self, cid: &[u8]) {
        self.routes.write().retain(|_, route| route != cid);
    }
}

/// Stable placement of a connection id onto one of `buckets` workers.
///
/// The same id always lands on the same bucket for the lifetime of `state`,
/// so every packet of a connection is routed to one worker.
pub fn shard_for(state: &RandomState, cid: &[u8], buckets: usize) -> usize {
    (state.hash_one(cid) % buckets as u64) as usize
}
