use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Virtual nodes per physical node. More replicas smooth the key
/// distribution at the cost of a larger ring.
pub const DEFAULT_REPLICAS: usize = 3;

/// Error returned by [`ConsistentHash::get_node`] when no node has been
/// added to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEmpty;

impl fmt::Display for RingEmpty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no nodes in consistent hash ring")
    }
}

impl error::Error for RingEmpty {}

#[derive(Debug, Default)]
struct RingInner {
    /// Sorted virtual-node positions.
    hashes: Vec<u64>,
    /// Virtual-node position -> physical slot.
    slots: HashMap<u64, usize>,
    /// Node name -> physical slot.
    names: HashMap<String, usize>,
    /// Next slot to hand out. Never decremented: a removed node's slot is
    /// retired, so a slot number identifies one node for the ring's whole
    /// life.
    next_slot: usize,
}

/// A consistent-hash ring mapping opaque keys to physical slots.
///
/// Each node is projected onto the ring as `replicas` virtual nodes; a key
/// is owned by the first virtual node strictly after its hash, wrapping
/// around at the end. With unchanged membership the mapping is stable, and
/// adding or removing one node moves at most `replicas` virtual positions,
/// so only a small fraction of keys change owner.
///
/// Virtual-node keys use the single canonical form `"{name}#{index}"` for
/// both insertion and removal. Lookups return the physical slot recorded at
/// insertion; slots are allocated in insertion order and never reused after
/// a removal, so two distinct nodes can never answer with the same slot.
/// A ring that only ever grows (the loop pool's case) hands out exactly
/// `0..nodes`.
#[derive(Debug)]
pub struct ConsistentHash {
    replicas: usize,
    inner: Mutex<RingInner>,
}

fn hash_str(s: &str) -> u64 {
    // DefaultHasher with the default keys is deterministic across runs,
    // which keeps connection-to-loop dispatch reproducible.
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn virtual_key(name: &str, index: usize) -> String {
    format!("{}#{}", name, index)
}

impl ConsistentHash {
    /// Creates an empty ring with `replicas` virtual nodes per physical
    /// node.
    pub fn new(replicas: usize) -> ConsistentHash {
        assert!(replicas > 0, "ring needs at least one replica per node");
        ConsistentHash {
            replicas,
            inner: Mutex::new(RingInner::default()),
        }
    }

    /// Adds `name` to the ring, returning the physical slot assigned to it.
    /// Re-adding a node that is already on the ring keeps its slot.
    pub fn add_node(&self, name: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.names.get(name) {
            return slot;
        }
        let slot = inner.next_slot;
        inner.next_slot += 1;
        inner.names.insert(name.to_owned(), slot);
        for i in 0..self.replicas {
            let h = hash_str(&virtual_key(name, i));
            inner.slots.insert(h, slot);
            inner.hashes.push(h);
        }
        inner.hashes.sort_unstable();
        slot
    }

    /// Removes `name` and all of its virtual nodes from the ring.
    pub fn remove_node(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.names.remove(name).is_none() {
            return;
        }
        for i in 0..self.replicas {
            let h = hash_str(&virtual_key(name, i));
            inner.slots.remove(&h);
            if let Ok(pos) = inner.hashes.binary_search(&h) {
                inner.hashes.remove(pos);
            }
        }
    }

    /// Returns the physical slot owning `key`.
    pub fn get_node(&self, key: &str) -> Result<usize, RingEmpty> {
        let inner = self.inner.lock().unwrap();
        if inner.hashes.is_empty() {
            return Err(RingEmpty);
        }
        let h = hash_str(key);
        // First virtual node strictly greater than the key hash; wrap to
        // the start of the ring past the last entry.
        let pos = inner.hashes.partition_point(|&v| v <= h);
        let owner = if pos == inner.hashes.len() {
            inner.hashes[0]
        } else {
            inner.hashes[pos]
        };
        Ok(inner.slots[&owner])
    }

    /// Number of physical nodes on the ring.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().names.len()
    }

    /// Returns `true` if no nodes have been added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
