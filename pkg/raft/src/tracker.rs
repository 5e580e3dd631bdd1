//! Tracks just enough volatile, in-memory bookkeeping to answer two
//! questions: "have we won the election for this term?" and "how far can
//! the commit index safely advance given what followers have acknowledged?"
//!
//! Lives entirely inside the role engine's lock; nothing here does its own
//! synchronization.

use std::collections::HashMap;

use crate::protos::{LogIndex, ServerId, Term};

pub struct ConsensusTracker {
	membership_count: usize,
	election_term: Term,
	vote_tally: usize,
	match_index: HashMap<ServerId, LogIndex>,
}

impl ConsensusTracker {
	pub fn new(membership_count: usize) -> Self {
		ConsensusTracker {
			membership_count,
			election_term: 0,
			vote_tally: 0,
			match_index: HashMap::new(),
		}
	}

	pub fn set_membership_count(&mut self, count: usize) {
		self.membership_count = count;
	}

	fn majority(&self) -> usize {
		self.membership_count / 2 + 1
	}

	/// Strict majority: more than half of the membership.
	pub fn is_majority(&self, count: usize) -> bool {
		count >= self.majority()
	}

	/// Call once whenever a new election begins. Clears the match index
	/// (it belongs to the leader tenure that just ended) and, if `term` is
	/// genuinely new, resets the vote tally.
	pub fn update_term(&mut self, term: Term) {
		self.match_index.clear();
		if term != self.election_term {
			self.election_term = term;
			self.vote_tally = 0;
		}
	}

	/// Records a granted vote (including the candidate's own self-vote) for
	/// `term`. Returns true the moment the tally first reaches a majority.
	pub fn received_vote(&mut self, term: Term) -> bool {
		if term < self.election_term {
			return false;
		}
		if term > self.election_term {
			self.election_term = term;
			self.vote_tally = 0;
		}
		self.vote_tally += 1;
		self.is_majority(self.vote_tally)
	}

	/// Records that `sender_id` has replicated through `match_index`, and
	/// returns the new commit index if doing so lets it advance past
	/// `current_commit` (0 if nothing changed).
	pub fn appended(&mut self, sender_id: ServerId, match_index: LogIndex, current_commit: LogIndex) -> LogIndex {
		if match_index <= current_commit {
			return 0;
		}
		self.match_index.insert(sender_id, match_index);

		let mut advanced = current_commit;
		let mut candidate = current_commit + 1;
		while candidate <= match_index {
			let acked = self.match_index.values().filter(|&&v| v >= candidate).count();
			if self.is_majority(acked) {
				advanced = candidate;
				candidate += 1;
			} else {
				break;
			}
		}
		if advanced > current_commit { advanced } else { 0 }
	}
}
