use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::PersistedState;

/// Raft peer role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the replicated log.
///
/// Entries are immutable once created: the log only ever grows at the tail,
/// or drops an uncommitted conflicting suffix during follower replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    /// Opaque client payload; the upstream service owns its meaning.
    pub command: Vec<u8>,
}

/// State a single Raft peer maintains.
///
/// # Safety invariants
///
/// ## Election Safety
/// At most one leader per term. Enforced by:
/// - Each peer votes for at most one candidate per term (`voted_for`, which
///   is only cleared when `current_term` advances)
/// - A candidate needs a strict majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its own log; truncation
/// only happens on followers resolving replication conflicts.
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, the logs are
/// identical up through that index. Enforced by the AppendEntries
/// consistency check (`prev_log_index`/`prev_log_term`) plus conflict-only
/// truncation before appending.
///
/// ## Leader Completeness
/// A committed entry is present in the log of every later leader. Enforced
/// by the vote restriction (`is_log_up_to_date`) and by leaders only
/// counting current-term entries toward commitment.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state, written to storage before any observable effect
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Volatile state on all peers, rebuilt on restart
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: RaftRole,
    pub leader_id: Option<u64>,
    pub votes_received: u64,

    // Volatile state on leaders, reinitialized after every election win
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Index of the last log entry, or 0 for the empty log (the logical
    /// index-0 sentinel).
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last log entry, or 0 for the empty log.
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get the log entry at `index` (1-indexed). Index 0 is the sentinel and
    /// has no stored entry.
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, with the sentinel answering term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Clone all entries from `start_index` (inclusive) to the end.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        if start_index == 0 {
            return self.log.clone();
        }
        let start = (start_index - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a new entry carrying `command` at the tail, stamped with the
    /// current term.
    pub fn append_entry(&mut self, command: Vec<u8>) -> &LogEntry {
        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        self.log.push(entry);
        self.log.last().unwrap()
    }

    /// Discard the log suffix starting at `from_index` (inclusive). Only
    /// called from the follower replication path; the discarded suffix can
    /// only hold uncommitted entries.
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index == 0 {
            self.log.clear();
        } else {
            self.log.truncate((from_index - 1) as usize);
        }
    }

    /// Canonical "at least as up-to-date" comparison for vote granting:
    /// higher last term wins; equal last terms compare last index, with
    /// equal counting as up-to-date.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower. `voted_for` is cleared only when the term
    /// actually advances: a same-term transition (candidate deposed by an
    /// equal-term leader) must keep the vote record, or the peer could vote
    /// twice in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    /// Transition to candidate: advance the term, vote for self.
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // own vote
        self.leader_id = None;
    }

    /// Transition to leader, reinitializing the replication cursors.
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Snapshot of the durable fields, persisted as one atomic unit so a
    /// crash can never leave `voted_for` recorded against a stale term.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Restore the durable fields from a previously saved snapshot.
    pub fn restore(&mut self, saved: PersistedState) {
        self.current_term = saved.current_term;
        self.voted_for = saved.voted_for;
        self.log = saved.log;
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
