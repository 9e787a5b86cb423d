use serde::{Deserialize, Serialize};

use crate::raft::state::{LogEntry, RaftRole, RaftState};

/// Arguments of the RequestVote RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Arguments of the AppendEntries RPC. An empty `entries` is the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On a consistency-check rejection: the first index of the conflicting
    /// term (or one past the end of a too-short log), letting the leader
    /// skip backward a whole term per round trip. Zero when `success`.
    pub conflict_index: u64,
}

/// Handle a RequestVote RPC.
///
/// Grants iff the candidate's term is current, this peer has not already
/// voted for somebody else in that term, and the candidate's log is at least
/// as up-to-date as ours (last term first, then last index). The caller is
/// responsible for persisting state before the reply leaves the peer.
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        // Stale candidate; it will adopt our term from the reply.
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle an AppendEntries RPC, in any role.
///
/// Any request with a current term is the heartbeat signal: the caller must
/// reset its election timer whenever the returned response is not a
/// stale-term rejection, and must persist state before replying.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> AppendEntriesResponse {
    // 1. A deposed leader's RPC: reject and report the newer term.
    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            conflict_index: 0,
        };
    }

    // 2. Adopt the term if newer; either way this peer follows the sender.
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // 3. Consistency check against the entry preceding the new ones.
    //    prev_log_index 0 is the sentinel and always matches.
    match state.term_at(req.prev_log_index) {
        None => {
            // Log too short: point the leader at our first missing index.
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_index: state.last_log_index() + 1,
            };
        }
        Some(term) if term != req.prev_log_term => {
            // Mismatched term: report the first index carrying it so the
            // leader can skip the whole term in one round trip.
            let mut conflict_index = req.prev_log_index;
            while conflict_index > 1 && state.term_at(conflict_index - 1) == Some(term) {
                conflict_index -= 1;
            }
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_index,
            };
        }
        Some(_) => {}
    }

    // 4. Append the supplied entries. Entries already present with the same
    //    term are left untouched so duplicated delivery is a no-op; a term
    //    conflict truncates the (necessarily uncommitted) suffix first.
    let mut appended = 0usize;
    for entry in &req.entries {
        match state.get_entry(entry.index) {
            Some(existing) if existing.term == entry.term => continue,
            Some(_) => {
                state.truncate_from(entry.index);
                state.log.push(entry.clone());
                appended += 1;
            }
            None => {
                state.log.push(entry.clone());
                appended += 1;
            }
        }
    }
    if appended > 0 {
        tracing::debug!(
            node_id = my_id,
            entries_appended = appended,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // 5. Advance the commit index, bounded by the last entry this request
    //    actually vouched for; never backward.
    if req.leader_commit > state.commit_index {
        let last_new_index = req.prev_log_index + req.entries.len() as u64;
        let bounded = req.leader_commit.min(last_new_index);
        if bounded > state.commit_index {
            state.commit_index = bounded;
        }
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        conflict_index: 0,
    }
}
