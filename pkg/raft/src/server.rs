//! The role engine: the single-lock-per-server state machine that owns
//! term/role transitions and every RPC handler.
//!
//! One server-wide lock serializes every request and timer callback;
//! handlers act directly (append to the log, send messages) rather than
//! accumulating a batch of side effects for some external caller to replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{RaftConfig, CAMPAIGN_BACKOFF};
use crate::errors::*;
use crate::log::Log;
use crate::membership::MembershipView;
use crate::protos::{Command, CommandOutcome, LogIndex, Message, MessageKind, RequestId, ServerId, Term};
use crate::state::DurableState;
use crate::state_machine::StateMachineRouter;

/// A one-shot callback fired when a submitted command's fate is known.
/// `command_applied` fires exactly once per successful submission;
/// `command_failed` fires at most once and never after `command_applied`.
/// Delivery is best-effort: a server that shuts down with listeners still
/// pending simply never calls them.
pub trait CommandListener: Send {
	fn command_applied(self: Box<Self>, index: LogIndex);
	fn command_failed(self: Box<Self>);
}

fn notify(listener: Box<dyn CommandListener>, outcome: CommandOutcome) {
	match outcome {
		CommandOutcome::Applied { index } => listener.command_applied(index),
		CommandOutcome::Failed => listener.command_failed(),
	}
}

struct FollowerState {
	last_leader_id: Option<ServerId>,
	last_heartbeat: Instant,
}

struct CandidateState {
	started_at: Instant,
	/// Drawn once when the candidacy begins, not re-rolled on every poll, so
	/// the campaign timeout is a single fixed deadline rather than a moving
	/// target.
	backoff: Duration,
}

struct LeaderState {
	last_heartbeat_sent: Instant,
}

enum RoleState {
	Follower(FollowerState),
	Candidate(CandidateState),
	Leader(LeaderState),
}

enum Leadership {
	SelfLeader,
	Other(ServerId),
	Unknown,
}

struct Inner {
	role: RoleState,
	tracker: crate::tracker::ConsensusTracker,
	local_listeners: HashMap<LogIndex, Box<dyn CommandListener>>,
	remote_waiters: HashMap<RequestId, Box<dyn CommandListener>>,
	next_request_id: RequestId,
	active: bool,
}

impl Inner {
	fn leadership(&self, own_id: ServerId) -> Leadership {
		match &self.role {
			RoleState::Leader(_) => Leadership::SelfLeader,
			RoleState::Follower(f) => match f.last_leader_id {
				Some(id) if id != own_id => Leadership::Other(id),
				_ => Leadership::Unknown,
			},
			RoleState::Candidate(_) => Leadership::Unknown,
		}
	}
}

/// One server's full participation in the cluster: durable state, log,
/// membership, state machines, and the role engine tying them together.
pub struct RaftServer {
	id: ServerId,
	config: RaftConfig,
	inner: Mutex<Inner>,
	log: Mutex<Box<dyn Log>>,
	durable: Mutex<Box<dyn DurableState>>,
	membership: Arc<dyn MembershipView>,
	state_machines: Arc<StateMachineRouter>,
}

impl RaftServer {
	pub fn new(
		config: RaftConfig,
		durable: Box<dyn DurableState>,
		log: Box<dyn Log>,
		membership: Arc<dyn MembershipView>,
		state_machines: Arc<StateMachineRouter>,
	) -> Result<Arc<Self>> {
		config.validate()?;
		let id = durable.server_id();
		let current_term = durable.current_term();

		// `membership` holds every *other* server -- this one never sends RPCs
		// to itself -- so the cluster's total size for quorum purposes is one
		// more than `count()` reports.
		let total_members = membership.count() + 1;
		let mut tracker = crate::tracker::ConsensusTracker::new(total_members);
		tracker.update_term(current_term);

		let role = if total_members <= 1 {
			RoleState::Candidate(CandidateState { started_at: Instant::now(), backoff: Self::random_campaign_backoff() })
		} else {
			RoleState::Follower(FollowerState { last_leader_id: None, last_heartbeat: Instant::now() })
		};

		let inner = Inner {
			role,
			tracker,
			local_listeners: HashMap::new(),
			remote_waiters: HashMap::new(),
			next_request_id: 1,
			active: true,
		};

		let server = Arc::new(RaftServer {
			id,
			config,
			inner: Mutex::new(inner),
			log: Mutex::new(log),
			durable: Mutex::new(durable),
			membership,
			state_machines,
		});

		if total_members <= 1 {
			server.start_election();
		}

		Ok(server)
	}

	pub fn id(&self) -> ServerId { self.id }

	pub fn is_active(&self) -> bool {
		self.inner.lock().unwrap().active
	}

	pub fn current_term(&self) -> Term {
		self.durable.lock().unwrap().current_term()
	}

	pub fn commit_index(&self) -> LogIndex {
		self.log.lock().unwrap().commit_index()
	}

	pub fn role(&self) -> crate::protos::Role {
		match self.inner.lock().unwrap().role {
			RoleState::Follower(_) => crate::protos::Role::Follower,
			RoleState::Candidate(_) => crate::protos::Role::Candidate,
			RoleState::Leader(_) => crate::protos::Role::Leader,
		}
	}

	/// Flips the server inactive: in-flight handler calls complete, but the
	/// scheduler stops rearming timers and every entry point becomes a
	/// no-op. Used both for graceful shutdown and for halting after a
	/// durability failure.
	pub fn shutdown(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.active = false;
		self.fail_all_remote_waiters(&mut inner);
	}

	fn fatal_shutdown(&self, reason: &str) {
		log::error!("server {} halting after a durability failure: {}", self.id, reason);
		self.shutdown();
	}

	fn fail_all_remote_waiters(&self, inner: &mut Inner) {
		for (_, listener) in inner.remote_waiters.drain() {
			notify(listener, CommandOutcome::Failed);
		}
	}

	fn become_follower_locked(&self, inner: &mut Inner, leader_hint: Option<ServerId>) {
		self.fail_all_remote_waiters(inner);
		inner.role = RoleState::Follower(FollowerState { last_leader_id: leader_hint, last_heartbeat: Instant::now() });
	}

	/// Bumps the durable term if `term` is newer, and demotes to a follower
	/// tentatively of `sender_id` -- whoever sent the newer-term message,
	/// be it the actual leader or merely a candidate. A wrong guess here is
	/// harmless: it's overwritten the moment a real `AppendRequest` arrives,
	/// and until then it only affects where this server forwards client
	/// commands. Called at the top of every inbound message.
	fn observe_term(&self, term: Term, sender_id: ServerId) {
		let current = self.current_term();
		if term <= current {
			return;
		}
		if let Err(e) = self.durable.lock().unwrap().update_current_term(term) {
			self.fatal_shutdown(&format!("failed to persist observed term {}: {}", term, e));
			return;
		}
		let mut inner = self.inner.lock().unwrap();
		self.become_follower_locked(&mut inner, Some(sender_id));
	}

	// ---- dispatch -------------------------------------------------------

	pub fn handle_message(&self, msg: Message) {
		if !self.is_active() {
			return;
		}
		self.observe_term(msg.term, msg.sender_id);

		match msg.kind {
			MessageKind::VoteRequest { last_log_index, last_log_term } => {
				let granted = self.handle_vote_request(msg.sender_id, msg.term, last_log_index, last_log_term);
				self.reply(msg.sender_id, MessageKind::VoteResponse { granted });
			}
			MessageKind::VoteResponse { granted } => {
				self.handle_vote_response(msg.sender_id, msg.term, granted);
			}
			MessageKind::AppendRequest { prev_log_index, prev_log_term, entries, leader_commit } => {
				let resp = self.handle_append_request(
					msg.sender_id,
					msg.term,
					prev_log_index,
					prev_log_term,
					entries,
					leader_commit,
				);
				self.reply(msg.sender_id, resp);
			}
			MessageKind::AppendResponse { ok, index } => {
				self.handle_append_response(msg.sender_id, msg.term, ok, index);
			}
			MessageKind::CommandRequest { command, request_id } => {
				if let Some(resp) = self.handle_command_request(command, request_id) {
					self.reply(msg.sender_id, resp);
				}
			}
			MessageKind::CommandResponse { request_id, accepted, index } => {
				self.handle_command_response(request_id, accepted, index);
			}
		}
	}

	fn reply(&self, to: ServerId, kind: MessageKind) {
		let msg = Message { sender_id: self.id, term: self.current_term(), kind };
		match self.membership.find(to) {
			Some(peer) => peer.invoke(msg),
			None => log::warn!("server {}: no route back to {}", self.id, to),
		}
	}

	// ---- vote handling ----------------------------------------------------

	fn handle_vote_request(&self, candidate_id: ServerId, term: Term, last_log_index: LogIndex, last_log_term: Term) -> bool {
		let current_term = self.current_term();
		if term < current_term {
			return false;
		}

		{
			let durable = self.durable.lock().unwrap();
			if let Some(voted_for) = durable.voted_for() {
				if voted_for != candidate_id {
					return false;
				}
			}
		}

		let (last_term, last_index) = {
			let log = self.log.lock().unwrap();
			(log.last_term(), log.last_index())
		};
		if (last_log_term, last_log_index) < (last_term, last_index) {
			return false;
		}

		{
			let mut inner = self.inner.lock().unwrap();
			self.become_follower_locked(&mut inner, None);
		}

		if let Err(e) = self.durable.lock().unwrap().update_voted_for(candidate_id) {
			self.fatal_shutdown(&format!("failed to persist vote for {}: {}", candidate_id, e));
			return false;
		}
		true
	}

	fn handle_vote_response(&self, _sender_id: ServerId, term: Term, granted: bool) {
		if !granted || term != self.current_term() {
			return;
		}
		let won = {
			let mut inner = self.inner.lock().unwrap();
			if !matches!(inner.role, RoleState::Candidate(_)) {
				return;
			}
			inner.tracker.received_vote(term)
		};
		if won {
			self.become_leader();
		}
	}

	// ---- append handling ----------------------------------------------------

	fn handle_append_request(
		&self,
		leader_id: ServerId,
		term: Term,
		prev_log_index: LogIndex,
		prev_log_term: Term,
		entries: Vec<Command>,
		leader_commit: LogIndex,
	) -> MessageKind {
		let current_term = self.current_term();
		if term < current_term {
			return MessageKind::AppendResponse { ok: false, index: None };
		}

		{
			let mut inner = self.inner.lock().unwrap();
			if matches!(inner.role, RoleState::Leader(_)) {
				log::error!(
					"server {} (leader in term {}) received an AppendRequest from {} in the same term",
					self.id,
					term,
					leader_id
				);
				return MessageKind::AppendResponse { ok: false, index: None };
			}
			self.become_follower_locked(&mut inner, Some(leader_id));
		}

		let mut log = self.log.lock().unwrap();
		if !log.has_entry(prev_log_index, prev_log_term) {
			let hint = if log.last_index() < prev_log_index {
				Some(log.last_index())
			} else if log.commit_index() < prev_log_index {
				Some(log.commit_index())
			} else {
				log::error!(
					"server {}: commit-index divergence detected resyncing at index {}",
					self.id,
					prev_log_index
				);
				None
			};
			return MessageKind::AppendResponse { ok: false, index: hint };
		}

		if let Err(e) = log.validate_entry(prev_log_index + 1, term) {
			drop(log);
			self.fatal_shutdown(&format!("{}", e));
			return MessageKind::AppendResponse { ok: false, index: None };
		}

		for command in entries {
			let next_index = log.last_index() + 1;
			if log.has_entry(next_index, term) {
				continue;
			}
			if let Err(e) = log.append(command, term) {
				drop(log);
				self.fatal_shutdown(&format!("append failed: {}", e));
				return MessageKind::AppendResponse { ok: false, index: None };
			}
		}

		let new_last_index = log.last_index();
		let target = leader_commit.min(new_last_index);
		drop(log);

		if target > 0 {
			self.advance_commit_and_notify(target);
		}

		let last_index = self.log.lock().unwrap().last_index();
		MessageKind::AppendResponse { ok: true, index: Some(last_index) }
	}

	fn handle_append_response(&self, sender_id: ServerId, term: Term, ok: bool, index: Option<LogIndex>) {
		if term != self.current_term() || !matches!(self.inner.lock().unwrap().role, RoleState::Leader(_)) {
			return;
		}

		if ok {
			let match_index = index.unwrap_or(0);
			self.record_match_and_maybe_commit(sender_id, match_index);
			return;
		}

		let hint = match index {
			Some(hint) => hint,
			None => return,
		};

		let (entries, prev_term, commit_index) = {
			let log = self.log.lock().unwrap();
			(log.entries_from(hint + 1), log.term_at(hint).unwrap_or(0), log.commit_index())
		};
		let msg = Message {
			sender_id: self.id,
			term: self.current_term(),
			kind: MessageKind::AppendRequest {
				prev_log_index: hint,
				prev_log_term: prev_term,
				entries,
				leader_commit: commit_index,
			},
		};
		if let Some(peer) = self.membership.find(sender_id) {
			peer.invoke(msg);
		}
	}

	fn record_match_and_maybe_commit(&self, sender_id: ServerId, match_index: LogIndex) {
		let current_commit = self.log.lock().unwrap().commit_index();
		let new_commit = {
			let mut inner = self.inner.lock().unwrap();
			if !matches!(inner.role, RoleState::Leader(_)) {
				return;
			}
			inner.tracker.appended(sender_id, match_index, current_commit)
		};
		if new_commit > 0 {
			self.advance_commit_and_notify(new_commit);
			self.send_heartbeats();
		}
	}

	fn advance_commit_and_notify(&self, target: LogIndex) {
		let before = self.log.lock().unwrap().commit_index();
		if target <= before {
			return;
		}

		let state_machines = self.state_machines.clone();
		let result = {
			let mut log = self.log.lock().unwrap();
			log.applied(target, &mut |_idx, cmd| state_machines.apply(cmd))
		};
		if let Err(e) = result {
			self.fatal_shutdown(&format!("failed to advance commit index: {}", e));
			return;
		}

		let after = self.log.lock().unwrap().commit_index();
		if after <= before {
			return;
		}

		if let Err(e) = self.durable.lock().unwrap().update_commit_index(after) {
			log::warn!("server {}: failed to persist commit index {}: {}", self.id, after, e);
		}

		self.notify_local_listeners(before + 1, after);
	}

	fn notify_local_listeners(&self, from: LogIndex, to: LogIndex) {
		let mut inner = self.inner.lock().unwrap();
		for index in from..=to {
			if let Some(listener) = inner.local_listeners.remove(&index) {
				notify(listener, CommandOutcome::Applied { index });
			}
		}
	}

	// ---- command submission ----------------------------------------------------

	fn append_as_leader(&self, command: Command) -> Result<LogIndex> {
		let current_term = self.current_term();
		let (prev_index, prev_term, current_commit) = {
			let log = self.log.lock().unwrap();
			(log.last_index(), log.last_term(), log.commit_index())
		};
		let new_index = {
			let mut log = self.log.lock().unwrap();
			log.append(command.clone(), current_term)?
		};

		let msg = Message {
			sender_id: self.id,
			term: current_term,
			kind: MessageKind::AppendRequest {
				prev_log_index: prev_index,
				prev_log_term: prev_term,
				entries: vec![command],
				leader_commit: current_commit,
			},
		};
		self.membership.broadcast_except_sender(self.id, &msg);
		self.record_match_and_maybe_commit(self.id, new_index);
		Ok(new_index)
	}

	fn handle_command_request(&self, command: Command, request_id: Option<RequestId>) -> Option<MessageKind> {
		if !self.is_active() || !matches!(self.inner.lock().unwrap().role, RoleState::Leader(_)) {
			return request_id.map(|rid| MessageKind::CommandResponse { request_id: Some(rid), accepted: false, index: None });
		}

		match self.append_as_leader(command) {
			Ok(index) => request_id
				.map(|rid| MessageKind::CommandResponse { request_id: Some(rid), accepted: true, index: Some(index) }),
			Err(e) => {
				self.fatal_shutdown(&format!("append failed while serving a forwarded command: {}", e));
				request_id.map(|rid| MessageKind::CommandResponse { request_id: Some(rid), accepted: false, index: None })
			}
		}
	}

	fn handle_command_response(&self, request_id: Option<RequestId>, accepted: bool, index: Option<LogIndex>) {
		let rid = match request_id {
			Some(rid) => rid,
			None => return,
		};
		let listener = {
			let mut inner = self.inner.lock().unwrap();
			match inner.remote_waiters.remove(&rid) {
				Some(l) => l,
				None => return,
			}
		};

		if !accepted {
			notify(listener, CommandOutcome::Failed);
			return;
		}
		let entry_index = match index {
			Some(i) => i,
			None => {
				notify(listener, CommandOutcome::Failed);
				return;
			}
		};

		{
			let mut inner = self.inner.lock().unwrap();
			inner.local_listeners.insert(entry_index, listener);
		}
		if self.log.lock().unwrap().commit_index() >= entry_index {
			let mut inner = self.inner.lock().unwrap();
			if let Some(listener) = inner.local_listeners.remove(&entry_index) {
				drop(inner);
				notify(listener, CommandOutcome::Applied { index: entry_index });
			}
		}
	}

	/// The local, non-wire API: submit a command from within this process.
	pub fn submit_command(&self, command: Command, listener: Option<Box<dyn CommandListener>>) {
		if !self.is_active() {
			if let Some(l) = listener {
				notify(l, CommandOutcome::Failed);
			}
			return;
		}

		let leadership = self.inner.lock().unwrap().leadership(self.id);
		match leadership {
			Leadership::SelfLeader => match self.append_as_leader(command) {
				Ok(index) => {
					if let Some(listener) = listener {
						{
							let mut inner = self.inner.lock().unwrap();
							inner.local_listeners.insert(index, listener);
						}
						if self.log.lock().unwrap().commit_index() >= index {
							let mut inner = self.inner.lock().unwrap();
							if let Some(listener) = inner.local_listeners.remove(&index) {
								drop(inner);
								notify(listener, CommandOutcome::Applied { index });
							}
						}
					}
				}
				Err(e) => {
					self.fatal_shutdown(&format!("append failed while serving a local submission: {}", e));
					if let Some(listener) = listener {
						notify(listener, CommandOutcome::Failed);
					}
				}
			},
			Leadership::Other(leader_id) => {
				let request_id = match listener {
					Some(listener) => {
						let mut inner = self.inner.lock().unwrap();
						let rid = inner.next_request_id;
						inner.next_request_id += 1;
						inner.remote_waiters.insert(rid, listener);
						Some(rid)
					}
					None => None,
				};
				let msg = Message {
					sender_id: self.id,
					term: self.current_term(),
					kind: MessageKind::CommandRequest { command, request_id },
				};
				match self.membership.find(leader_id) {
					Some(peer) => peer.invoke(msg),
					None => {
						if let Some(rid) = request_id {
							let mut inner = self.inner.lock().unwrap();
							if let Some(listener) = inner.remote_waiters.remove(&rid) {
								drop(inner);
								notify(listener, CommandOutcome::Failed);
							}
						}
					}
				}
			}
			Leadership::Unknown => {
				if let Some(listener) = listener {
					notify(listener, CommandOutcome::Failed);
				}
			}
		}
	}

	// ---- elections and heartbeats ----------------------------------------------------

	fn random_campaign_backoff() -> Duration {
		let (lo, hi) = CAMPAIGN_BACKOFF;
		rand::thread_rng().gen_range(lo..hi)
	}

	fn start_election(&self) {
		let new_term = self.current_term() + 1;
		{
			let mut durable = self.durable.lock().unwrap();
			if let Err(e) = durable.update_current_term(new_term) {
				drop(durable);
				self.fatal_shutdown(&format!("failed to persist new term {}: {}", new_term, e));
				return;
			}
			if let Err(e) = durable.update_voted_for(self.id) {
				drop(durable);
				self.fatal_shutdown(&format!("failed to persist self-vote for term {}: {}", new_term, e));
				return;
			}
		}

		let (last_index, last_term) = {
			let log = self.log.lock().unwrap();
			(log.last_index(), log.last_term())
		};

		let won = {
			let mut inner = self.inner.lock().unwrap();
			self.fail_all_remote_waiters(&mut inner);
			inner.role = RoleState::Candidate(CandidateState {
				started_at: Instant::now(),
				backoff: Self::random_campaign_backoff(),
			});
			inner.tracker.set_membership_count(self.membership.count() + 1);
			inner.tracker.update_term(new_term);
			inner.tracker.received_vote(new_term)
		};

		if won {
			self.become_leader();
			return;
		}

		let msg = Message {
			sender_id: self.id,
			term: new_term,
			kind: MessageKind::VoteRequest { last_log_index: last_index, last_log_term: last_term },
		};
		self.membership.broadcast_except_sender(self.id, &msg);
	}

	fn become_leader(&self) {
		{
			let mut inner = self.inner.lock().unwrap();
			// back-dated so the very next tick fires a heartbeat immediately
			inner.role = RoleState::Leader(LeaderState {
				last_heartbeat_sent: Instant::now() - self.config.heartbeat_period,
			});
		}
		log::info!("server {} became leader for term {}", self.id, self.current_term());
	}

	fn send_heartbeats(&self) {
		let (last_index, last_term, commit_index) = {
			let log = self.log.lock().unwrap();
			(log.last_index(), log.last_term(), log.commit_index())
		};
		let msg = Message {
			sender_id: self.id,
			term: self.current_term(),
			kind: MessageKind::AppendRequest {
				prev_log_index: last_index,
				prev_log_term: last_term,
				entries: Vec::new(),
				leader_commit: commit_index,
			},
		};
		self.membership.broadcast_except_sender(self.id, &msg);
	}

	/// Called periodically by the scheduler. Returns how long to wait
	/// before calling it again. Cancellation of a stale wait is best-effort
	/// (see module docs on `crate::node`): whichever role is current at
	/// wake-up time is the one that's acted on.
	pub fn tick(&self) -> Duration {
		if !self.is_active() {
			return self.config.heartbeat_period;
		}

		enum Action {
			Wait(Duration),
			StartElection,
			SendHeartbeats,
		}

		let now = Instant::now();
		let action = {
			let inner = self.inner.lock().unwrap();
			match &inner.role {
				RoleState::Follower(f) => {
					let elapsed = now.saturating_duration_since(f.last_heartbeat);
					if elapsed >= self.config.term_timeout {
						Action::StartElection
					} else {
						Action::Wait(self.config.term_timeout - elapsed)
					}
				}
				RoleState::Candidate(c) => {
					let elapsed = now.saturating_duration_since(c.started_at);
					let backoff = c.backoff;
					if elapsed >= backoff {
						Action::StartElection
					} else {
						Action::Wait(backoff - elapsed)
					}
				}
				RoleState::Leader(l) => {
					let elapsed = now.saturating_duration_since(l.last_heartbeat_sent);
					if elapsed >= self.config.heartbeat_period {
						Action::SendHeartbeats
					} else {
						Action::Wait(self.config.heartbeat_period - elapsed)
					}
				}
			}
		};

		match action {
			Action::Wait(d) => d,
			Action::StartElection => {
				self.start_election();
				Duration::from_millis(1)
			}
			Action::SendHeartbeats => {
				{
					let mut inner = self.inner.lock().unwrap();
					if let RoleState::Leader(l) = &mut inner.role {
						l.last_heartbeat_sent = now;
					}
				}
				self.send_heartbeats();
				self.config.heartbeat_period
			}
		}
	}
}
