use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Peer is stopped")]
    Stopped,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QuorumError>;
