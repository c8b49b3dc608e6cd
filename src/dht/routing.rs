//! The Kademlia routing table: 160-bit node ids under the XOR metric,
//! k-buckets of 8 ordered by the distance prefix to our own id.

use std::{
    net::{SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use crate::Sha1Hash;

/// The bucket size of the routing table.
pub(crate) const K: usize = 8;

/// A node that hasn't responded for this long is questionable and may be
/// replaced by a fresh one.
const NODE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// After this many unanswered queries in a row a node is considered bad.
const MAX_FAILED_QUERIES: u32 = 3;

/// A 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0; 20];
        for byte in id.iter_mut() {
            *byte = rand::random();
        }
        Self(id)
    }

    pub fn from_info_hash(info_hash: &Sha1Hash) -> Self {
        Self(*info_hash)
    }

    /// The XOR distance to the other id. Comparing distances as byte arrays
    /// is exactly the 160-bit big endian numeric order.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut distance = [0; 20];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(distance)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self([0; 20])
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// An XOR distance between two node ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Distance(pub [u8; 20]);

impl Distance {
    /// The number of leading zero bits, i.e. the length of the shared
    /// prefix. 160 for the distance to oneself.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        160
    }
}

/// A remote DHT node.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub last_response: Option<Instant>,
    pub failed_queries: u32,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            addr,
            last_response: None,
            failed_queries: 0,
        }
    }

    pub fn is_good(&self) -> bool {
        self.failed_queries < MAX_FAILED_QUERIES
            && self
                .last_response
                .map(|at| at.elapsed() < NODE_TIMEOUT)
                .unwrap_or(false)
    }

    /// A node that is bad or was never heard from may be evicted in favor of
    /// a fresh node.
    fn is_replaceable(&self) -> bool {
        self.failed_queries >= MAX_FAILED_QUERIES
            || self
                .last_response
                .map(|at| at.elapsed() >= NODE_TIMEOUT)
                .unwrap_or(true)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }
}

/// The routing table. Bucket `i` holds nodes whose distance to our id has
/// `i` leading zero bits, so buckets get closer (and sparser) as the index
/// grows.
pub(crate) struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<Node>>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: vec![Vec::new(); 160],
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_of(&mut self, id: &NodeId) -> Option<&mut Vec<Node>> {
        let distance = self.own_id.distance(id);
        let prefix = distance.leading_zeros();
        if prefix >= 160 {
            // that's us, we don't store ourselves
            return None;
        }
        Some(&mut self.buckets[prefix])
    }

    /// Tries to add the node. A full bucket evicts a replaceable (bad or
    /// long-silent) node, otherwise the new node is dropped, which keeps
    /// long-lived nodes in the table as Kademlia wants.
    pub fn insert(&mut self, node: Node) -> bool {
        let bucket = match self.bucket_of(&node.id) {
            Some(bucket) => bucket,
            None => return false,
        };
        if let Some(existing) =
            bucket.iter_mut().find(|existing| existing.id == node.id)
        {
            existing.addr = node.addr;
            return true;
        }
        if bucket.len() < K {
            bucket.push(node);
            return true;
        }
        if let Some(pos) =
            bucket.iter().position(|existing| existing.is_replaceable())
        {
            bucket[pos] = node;
            return true;
        }
        false
    }

    /// Records a response from the node, inserting it if it is new.
    pub fn node_responded(&mut self, id: NodeId, addr: SocketAddrV4) {
        let now = Instant::now();
        if let Some(bucket) = self.bucket_of(&id) {
            if let Some(node) =
                bucket.iter_mut().find(|node| node.id == id)
            {
                node.last_response = Some(now);
                node.failed_queries = 0;
                node.addr = addr;
                return;
            }
        }
        let mut node = Node::new(id, addr);
        node.last_response = Some(now);
        self.insert(node);
    }

    /// Records that a query to the node went unanswered.
    pub fn node_failed(&mut self, id: &NodeId) {
        if let Some(bucket) = self.bucket_of(id) {
            if let Some(node) = bucket.iter_mut().find(|node| node.id == *id)
            {
                node.failed_queries += 1;
            }
        }
    }

    /// The `count` nodes closest to the target by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<&Node> =
            self.buckets.iter().flatten().collect();
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    /// All nodes in the table, for persistence.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut id = [0; 20];
        id[0] = byte;
        NodeId(id)
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn test_distance_is_xor() {
        let a = id_with_first_byte(0b1100);
        let b = id_with_first_byte(0b1010);
        let distance = a.distance(&b);
        assert_eq!(distance.0[0], 0b0110);
        assert_eq!(a.distance(&a), Distance([0; 20]));
    }

    #[test]
    fn test_distance_ordering_matches_prefix() {
        let own = NodeId([0; 20]);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert!(own.distance(&near) < own.distance(&far));
        assert_eq!(own.distance(&near).leading_zeros(), 7);
        assert_eq!(own.distance(&far).leading_zeros(), 0);
        assert_eq!(own.distance(&own).leading_zeros(), 160);
    }

    #[test]
    fn test_insert_and_closest() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        // never store our own id
        assert!(!table.insert(Node::new(own, addr(1))));

        for byte in 1..=16u8 {
            table.insert(Node::new(id_with_first_byte(byte), addr(byte as u16)));
        }
        assert!(!table.is_empty());

        let target = id_with_first_byte(3);
        let closest = table.closest(&target, 3);
        assert_eq!(closest.len(), 3);
        // the target itself is in the table and sorts first
        assert_eq!(closest[0].id, target);
    }

    #[test]
    fn test_full_bucket_keeps_good_nodes() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        // ids with the same first byte land in the same bucket; fill it
        // with responsive nodes
        for i in 0..K as u8 {
            let mut id = [0x80; 20];
            id[19] = i;
            table.node_responded(NodeId(id), addr(i as u16 + 1));
        }
        let mut id = [0x80; 20];
        id[19] = 0xff;
        // all existing nodes are good, so the newcomer is dropped
        assert!(!table.insert(Node::new(NodeId(id), addr(100))));
        assert_eq!(table.len(), K);

        // but after one of them keeps failing, the newcomer gets its slot
        let mut failing = [0x80; 20];
        failing[19] = 0;
        for _ in 0..MAX_FAILED_QUERIES {
            table.node_failed(&NodeId(failing));
        }
        assert!(table.insert(Node::new(NodeId(id), addr(100))));
        assert_eq!(table.len(), K);
    }
}
