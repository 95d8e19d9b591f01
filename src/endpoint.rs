//! Peer addressing and queue-pair identity.

use std::net::SocketAddr;

/// A remote peer the broker connects to.
///
/// A thread i at server j connects to thread i of all other servers; the
/// peer list handed to the broker therefore names one endpoint per remote
/// server, all with the same thread id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Remote server id.
    pub server_id: u32,
    /// Remote worker thread id.
    pub thread_id: u32,
    /// Remote host address.
    pub addr: SocketAddr,
}

impl PeerEndpoint {
    /// Create a new peer endpoint.
    pub fn new(server_id: u32, thread_id: u32, addr: SocketAddr) -> Self {
        Self {
            server_id,
            thread_id,
            addr,
        }
    }
}

/// Identity of one end of a reliable queue pair.
///
/// The triple (node, worker, index) uniquely names a QP within the
/// cluster: `index` is the server id of the QP's remote counterpart, so
/// the pair (A→B, B→A) can find each other during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpIdentity {
    /// Server id of the QP's owner.
    pub node_id: u32,
    /// Worker thread id of the QP's owner.
    pub worker_id: u32,
    /// Server id of the remote counterpart.
    pub index: u32,
}

impl QpIdentity {
    /// Create a queue-pair identity.
    pub fn new(node_id: u32, worker_id: u32, index: u32) -> Self {
        Self {
            node_id,
            worker_id,
            index,
        }
    }
}

/// Maps server ids to the broker's dense queue-pair array index.
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: Vec<(u32, usize)>,
}

impl PeerTable {
    /// Build the table from the peer list, in list order.
    pub fn new(peers: &[PeerEndpoint]) -> Self {
        let entries = peers
            .iter()
            .enumerate()
            .map(|(idx, peer)| (peer.server_id, idx))
            .collect();
        Self { entries }
    }

    /// Look up the queue-pair index for a server id.
    #[inline]
    pub fn qp_index(&self, server_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .find(|(id, _)| *id == server_id)
            .map(|(_, idx)| *idx)
    }

    /// Number of peers.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(server_id: u32) -> PeerEndpoint {
        PeerEndpoint::new(server_id, 0, "127.0.0.1:11211".parse().unwrap())
    }

    #[test]
    fn test_peer_table_maps_in_list_order() {
        let peers = vec![endpoint(5), endpoint(2), endpoint(9)];
        let table = PeerTable::new(&peers);

        assert_eq!(table.len(), 3);
        assert_eq!(table.qp_index(5), Some(0));
        assert_eq!(table.qp_index(2), Some(1));
        assert_eq!(table.qp_index(9), Some(2));
        assert_eq!(table.qp_index(7), None);
    }

    #[test]
    fn test_qp_identity_pairing() {
        // A's QP toward B and B's QP toward A must be derivable from the
        // same (server, thread) facts on both sides.
        let a_to_b = QpIdentity::new(0, 3, 1);
        let b_to_a = QpIdentity::new(1, 3, 0);
        assert_eq!(a_to_b.index, b_to_a.node_id);
        assert_eq!(b_to_a.index, a_to_b.node_id);
    }
}
