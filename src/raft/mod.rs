pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{ApplyMsg, RaftMessage, RaftNode, Status, Submitted};
pub use state::{LogEntry, RaftRole, RaftState};
