/// Configuration for a single Raft peer.
///
/// Election timeouts are a tuning parameter, not a correctness parameter:
/// any range works as long as the heartbeat interval stays well under the
/// lower bound (1/10th to 1/5th is a good ratio).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this peer.
    pub node_id: u64,
    /// Identifiers of every other peer in the cluster (static membership).
    pub peers: Vec<u64>,
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout, in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat / replication round interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long to wait on a single outbound RPC before giving up on the
    /// round. An expired wait means "unknown outcome", not failure.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64) -> Self {
        self.peers.push(node_id);
        self
    }

    /// Total number of peers in the cluster, this one included.
    pub fn cluster_size(&self) -> u64 {
        self.peers.len() as u64 + 1
    }

    /// Votes (or replicas) required for a strict majority quorum.
    pub fn majority(&self) -> u64 {
        self.cluster_size() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::new(1).with_peer(2).with_peer(3);
        assert_eq!(cfg.peers, vec![2, 3]);
        assert_eq!(cfg.cluster_size(), 3);
    }

    #[test]
    fn majority_of_odd_clusters() {
        assert_eq!(NodeConfig::new(1).majority(), 1);
        assert_eq!(NodeConfig::new(1).with_peer(2).with_peer(3).majority(), 2);
        let five = NodeConfig::new(1)
            .with_peer(2)
            .with_peer(3)
            .with_peer(4)
            .with_peer(5);
        assert_eq!(five.majority(), 3);
    }
}
