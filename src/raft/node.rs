use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{QuorumError, Result};
use crate::raft::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::raft::state::{LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::storage::{self, Storage};
use crate::transport::Transport;

/// Messages processed by the Raft node event loop.
#[derive(Debug)]
pub enum RaftMessage {
    /// Ask the peer to append a command to the replicated log.
    Submit {
        command: Vec<u8>,
        response_tx: oneshot::Sender<Result<Submitted>>,
    },
    /// Start an election immediately, bypassing the timer. Ignored by a
    /// leader. Useful for tests and manual failover.
    TriggerElection,
    /// Internal nudge: an election was just won, assert leadership now
    /// instead of waiting out a heartbeat tick.
    LeadershipWon,
}

/// A committed entry delivered to the upstream service, in log order,
/// exactly once per peer lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

/// The position a submitted command was appended at. A promise, not a
/// commitment: the entry may never commit if this leader is deposed before
/// it replicates to a majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub index: u64,
    pub term: u64,
}

/// Snapshot of the peer's externally visible position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub term: u64,
    pub is_leader: bool,
}

/// A single Raft peer: drives elections, replicates the log while leader,
/// answers peer RPCs in any role, and feeds committed entries upstream.
///
/// All shared state lives behind one lock; network calls never happen while
/// it is held. Every durable mutation is persisted before its effect can be
/// observed outside the peer.
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    message_tx: mpsc::Sender<RaftMessage>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    commit_tx: watch::Sender<u64>,
    last_heartbeat: Arc<RwLock<Instant>>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a peer, restoring persistent state from `storage` if any was
    /// saved by a previous incarnation.
    ///
    /// Returns the node, the mailbox receiver to hand to [`run`], and the
    /// stream of committed entries for the upstream service.
    ///
    /// [`run`]: RaftNode::run
    pub async fn new(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>, mpsc::Receiver<ApplyMsg>)> {
        let (message_tx, message_rx) = mpsc::channel(100);
        let (apply_tx, apply_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0u64);

        let mut state = RaftState::new();
        if let Some(saved) = storage::load_state(storage.as_ref()).await? {
            tracing::info!(
                node_id = config.node_id,
                term = saved.current_term,
                log_len = saved.log.len(),
                "Restored persistent state"
            );
            state.restore(saved);
        }

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            config,
            storage,
            transport,
            message_tx,
            apply_tx,
            commit_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            shutdown: CancellationToken::new(),
        };

        Ok((node, message_rx, apply_rx))
    }

    /// Sender half of the node's mailbox.
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Submit an opaque command for replication.
    ///
    /// Fails fast with [`QuorumError::NotLeader`] on a non-leader. On a
    /// leader, returns as soon as the entry is appended and persisted
    /// locally; commitment is observed later through the apply stream.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Submitted> {
        let (tx, rx) = oneshot::channel();
        self.message_tx
            .send(RaftMessage::Submit {
                command,
                response_tx: tx,
            })
            .await
            .map_err(|_| QuorumError::Stopped)?;
        rx.await.map_err(|_| QuorumError::Stopped)?
    }

    /// Current term and whether this peer believes it is the leader.
    pub async fn status(&self) -> Status {
        let state = self.state.read().await;
        Status {
            term: state.current_term,
            is_leader: state.role == RaftRole::Leader,
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// The leader this peer currently knows of, itself included.
    pub async fn leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Watch the commit index. The receiver sees every advancement.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Stop the peer: all loops, in-flight RPC waiters, and the apply
    /// pipeline terminate, and no further state is persisted. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run the event loop until [`stop`] is called.
    ///
    /// One role is active at a time: the election timer is armed while not
    /// leader, the heartbeat interval while leader, and the mailbox and
    /// shutdown token always.
    ///
    /// [`stop`]: RaftNode::stop
    pub async fn run(&self, mut message_rx: mpsc::Receiver<RaftMessage>) {
        let apply_task = self.spawn_apply_task();
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(msg) = message_rx.recv() => match msg {
                    RaftMessage::Submit { command, response_tx } => {
                        let result = self.append_command(command).await;
                        let accepted = result.is_ok();
                        let _ = response_tx.send(result);
                        if accepted {
                            // Ship the new entry right away rather than
                            // waiting out the heartbeat tick.
                            self.broadcast_append_entries().await;
                        }
                    }
                    RaftMessage::TriggerElection => {
                        self.start_election().await;
                    }
                    RaftMessage::LeadershipWon => {
                        self.broadcast_append_entries().await;
                    }
                },

                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)),
                    if role == RaftRole::Leader =>
                {
                    self.broadcast_append_entries().await;
                }
            }
        }

        // The loop only exits on cancellation, which the apply task also
        // observes; wait for it so no delivery races the caller's teardown.
        let _ = apply_task.await;
    }

    /// Handle an inbound RequestVote RPC. State is persisted before the
    /// reply is returned; granting a vote also resets the election timer.
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        if self.shutdown.is_cancelled() {
            return Err(QuorumError::Stopped);
        }

        let response = {
            let mut state = self.state.write().await;
            let response = rpc::handle_request_vote(&mut state, &req, self.id);
            persist_or_stop(self.storage.as_ref(), &state, &self.shutdown).await?;
            response
        };

        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        Ok(response)
    }

    /// Handle an inbound AppendEntries RPC. State is persisted before the
    /// reply is returned; any current-term request resets the election
    /// timer, and a commit advancement wakes the apply pipeline.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.shutdown.is_cancelled() {
            return Err(QuorumError::Stopped);
        }

        let (response, advanced_commit) = {
            let mut state = self.state.write().await;
            let before = state.commit_index;
            let response = rpc::handle_append_entries(&mut state, &req, self.id);
            persist_or_stop(self.storage.as_ref(), &state, &self.shutdown).await?;
            let advanced = (state.commit_index > before).then_some(state.commit_index);
            (response, advanced)
        };

        // A rejection for log mismatch is still a heartbeat from the
        // current leader; only a stale-term rejection is not.
        if response.term == req.term {
            *self.last_heartbeat.write().await = Instant::now();
        }
        if let Some(commit_index) = advanced_commit {
            self.commit_tx.send_replace(commit_index);
        }

        Ok(response)
    }

    /// Leader-side append for a submitted command (mailbox path).
    async fn append_command(&self, command: Vec<u8>) -> Result<Submitted> {
        let mut state = self.state.write().await;

        if state.role != RaftRole::Leader {
            return Err(QuorumError::NotLeader(state.leader_id));
        }

        let entry = state.append_entry(command);
        let submitted = Submitted {
            index: entry.index,
            term: entry.term,
        };
        persist_or_stop(self.storage.as_ref(), &state, &self.shutdown).await?;
        tracing::debug!(
            node_id = self.id,
            index = submitted.index,
            term = submitted.term,
            "Appended command to log"
        );

        // A single-peer cluster commits on its own appends.
        advance_commit_index(&mut state, &self.commit_tx);

        Ok(submitted)
    }

    /// Become candidate and solicit votes from every peer in parallel.
    ///
    /// The candidacy (term bump + self-vote) is persisted before the first
    /// request leaves; replies are processed under the lock with a stale
    /// guard so a deposed or re-elected candidate never counts old votes.
    async fn start_election(&self) {
        let request = {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            if persist_or_stop(self.storage.as_ref(), &state, &self.shutdown)
                .await
                .is_err()
            {
                return;
            }
            // A single-peer cluster is its own majority.
            if state.votes_received >= self.config.majority() {
                let term = state.current_term;
                state.become_leader(self.id, &self.config.peers);
                tracing::info!(node_id = self.id, term, "Became leader");
                let _ = self.message_tx.try_send(RaftMessage::LeadershipWon);
                return;
            }
            VoteRequest {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };

        tracing::info!(node_id = self.id, term = request.term, "Starting election");

        let election_term = request.term;
        let majority = self.config.majority();
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);

        for &peer in &self.config.peers {
            let req = request.clone();
            let state = Arc::clone(&self.state);
            let storage = Arc::clone(&self.storage);
            let transport = Arc::clone(&self.transport);
            let shutdown = self.shutdown.clone();
            let message_tx = self.message_tx.clone();
            let peer_ids = self.config.peers.clone();
            let my_id = self.id;

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = timeout(rpc_timeout, transport.request_vote(peer, req)) => r,
                };
                let response = match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        tracing::trace!(node_id = my_id, peer, error = %e, "Vote request failed");
                        return;
                    }
                    Err(_) => {
                        tracing::trace!(node_id = my_id, peer, "Vote request timed out");
                        return;
                    }
                };

                let mut state = state.write().await;
                if response.term > state.current_term {
                    state.become_follower(response.term);
                    let _ = persist_or_stop(storage.as_ref(), &state, &shutdown).await;
                    return;
                }
                // Stale reply: the election this vote belongs to is over.
                if state.role != RaftRole::Candidate || state.current_term != election_term {
                    return;
                }
                if response.vote_granted {
                    state.votes_received += 1;
                    tracing::debug!(
                        node_id = my_id,
                        peer,
                        votes = state.votes_received,
                        "Received vote"
                    );
                    if state.votes_received >= majority {
                        state.become_leader(my_id, &peer_ids);
                        tracing::info!(
                            node_id = my_id,
                            term = election_term,
                            votes = state.votes_received,
                            "Became leader"
                        );
                        // Wake the event loop to assert leadership now.
                        let _ = message_tx.try_send(RaftMessage::LeadershipWon);
                    }
                }
            });
        }
    }

    /// One replication round: ship every follower its pending suffix (or an
    /// empty heartbeat), each as its own task, and fold the replies back in
    /// under the lock.
    async fn broadcast_append_entries(&self) {
        let rounds = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }

            let mut rounds = Vec::with_capacity(self.config.peers.len());
            for &peer in &self.config.peers {
                let next_index = state.next_index.get(&peer).copied().unwrap_or(1);
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);

                rounds.push((
                    peer,
                    AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.id,
                        prev_log_index,
                        prev_log_term,
                        entries: state.entries_from(next_index),
                        leader_commit: state.commit_index,
                    },
                ));
            }
            rounds
        };

        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);

        for (peer, req) in rounds {
            let round_term = req.term;
            let prev_log_index = req.prev_log_index;
            let sent = req.entries.len() as u64;
            let state = Arc::clone(&self.state);
            let storage = Arc::clone(&self.storage);
            let transport = Arc::clone(&self.transport);
            let commit_tx = self.commit_tx.clone();
            let shutdown = self.shutdown.clone();
            let my_id = self.id;

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = timeout(rpc_timeout, transport.append_entries(peer, req)) => r,
                };
                let response = match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        tracing::trace!(node_id = my_id, peer, error = %e, "AppendEntries failed");
                        return;
                    }
                    Err(_) => {
                        tracing::trace!(node_id = my_id, peer, "AppendEntries timed out");
                        return;
                    }
                };

                let mut state = state.write().await;
                if response.term > state.current_term {
                    state.become_follower(response.term);
                    let _ = persist_or_stop(storage.as_ref(), &state, &shutdown).await;
                    return;
                }
                // Stale reply from a round this peer no longer leads.
                if state.role != RaftRole::Leader || state.current_term != round_term {
                    return;
                }

                if response.success {
                    let acked = prev_log_index + sent;
                    // Replies can arrive out of order; never move backward.
                    let known = state.match_index.get(&peer).copied().unwrap_or(0);
                    if acked > known {
                        state.match_index.insert(peer, acked);
                    }
                    state.next_index.insert(peer, acked.max(known) + 1);
                    advance_commit_index(&mut state, &commit_tx);
                } else {
                    // Log mismatch: jump next_index back to the follower's
                    // conflict hint and retry on the next round.
                    let current = state.next_index.get(&peer).copied().unwrap_or(1);
                    let backed_off = response.conflict_index.max(1).min(current);
                    state.next_index.insert(peer, backed_off);
                    tracing::debug!(
                        node_id = my_id,
                        peer,
                        next_index = backed_off,
                        "Follower rejected entries, backing off"
                    );
                }
            });
        }
    }

    /// Forward committed entries upstream, in order, exactly once.
    fn spawn_apply_task(&self) -> JoinHandle<()> {
        let node_id = self.id;
        let state = Arc::clone(&self.state);
        let apply_tx = self.apply_tx.clone();
        let mut commit_rx = self.commit_tx.subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                // Drain before waiting so commits that landed before this
                // wakeup (or before startup) are never skipped.
                let entries = drain_committed(&state).await;
                for entry in entries {
                    tracing::debug!(node_id, index = entry.index, "Applying committed entry");
                    let msg = ApplyMsg {
                        index: entry.index,
                        command: entry.command,
                    };
                    if apply_tx.send(msg).await.is_err() {
                        // Upstream consumer is gone; nothing left to feed.
                        return;
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = commit_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Collect every committed-but-unapplied entry and advance `last_applied`
/// past them, under one lock acquisition.
async fn drain_committed(state: &RwLock<RaftState>) -> Vec<LogEntry> {
    let mut state = state.write().await;
    let mut entries = Vec::new();
    while state.last_applied < state.commit_index {
        let next = state.last_applied + 1;
        state.last_applied = next;
        if let Some(entry) = state.get_entry(next) {
            entries.push(entry.clone());
        }
    }
    entries
}

/// Recompute the leader's commit index: the highest log index a strict
/// majority has matched, provided the entry there belongs to the current
/// term. Counting replicas of a prior-term entry must never commit it
/// directly; it commits transitively once a current-term entry clears the
/// same bar.
fn advance_commit_index(state: &mut RaftState, commit_tx: &watch::Sender<u64>) {
    let mut match_indices: Vec<u64> = state.match_index.values().copied().collect();
    match_indices.push(state.last_log_index()); // the leader's own log
    match_indices.sort_unstable();

    // Largest index that a strict majority of the cluster has reached.
    let candidate = match_indices[(match_indices.len() - 1) / 2];
    if candidate > state.commit_index {
        if let Some(entry) = state.get_entry(candidate) {
            if entry.term == state.current_term {
                state.commit_index = candidate;
                tracing::debug!(commit_index = candidate, "Commit index advanced");
                commit_tx.send_replace(candidate);
            }
        }
    }
}

/// Persist the durable fields, refusing if a stop has been observed and
/// stopping the peer if the write fails: acting on an unpersisted mutation
/// could violate election safety or log matching after a crash.
async fn persist_or_stop(
    storage: &dyn Storage,
    state: &RaftState,
    shutdown: &CancellationToken,
) -> Result<()> {
    if shutdown.is_cancelled() {
        return Err(QuorumError::Stopped);
    }
    match storage::save_state(storage, state).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist state, stopping peer");
            shutdown.cancel();
            Err(e)
        }
    }
}
