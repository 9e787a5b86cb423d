pub mod config;
pub mod error;
pub mod raft;
pub mod shutdown;
pub mod storage;
pub mod transport;

pub use config::NodeConfig;
pub use error::{QuorumError, Result};
pub use raft::{ApplyMsg, RaftNode, Status, Submitted};
pub use storage::{FileStorage, MemStorage, Storage};
pub use transport::{InMemoryNetwork, RpcError, Transport};
