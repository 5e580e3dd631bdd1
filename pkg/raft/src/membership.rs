//! Who is in the cluster, and how to reach them.
//!
//! A committed set of members plus an `apply` step driven by log entries,
//! behind a trait so a static, test-friendly membership and a log-driven
//! dynamic one can share the rest of the server's code.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::protos::{Command, Message, MembershipChange, ServerId, MEMBERSHIP_COMMAND_TAG};
use crate::state_machine::StateMachine;

/// The destination end of a connection to one other server. `invoke` is
/// fire-and-forget: responses come back as their own `invoke` call in the
/// other direction, addressed by the message's own sender id.
pub trait Peer: Send + Sync {
	fn id(&self) -> ServerId;
	fn invoke(&self, msg: Message);

	/// Called exactly once, the moment a peer is promoted from pending to
	/// committed membership (see `DynamicMembership::apply`). Most transports
	/// have nothing to do here; the default is a no-op.
	fn start(&self) {}
}

pub trait MembershipView: Send + Sync {
	/// Number of *other* servers in the cluster -- this server is never its
	/// own `Peer`, so callers computing quorum size must add one for self.
	fn count(&self) -> usize;
	fn find(&self, id: ServerId) -> Option<Arc<dyn Peer>>;
	fn servers(&self) -> Vec<Arc<dyn Peer>>;

	fn broadcast_except_sender(&self, sender_id: ServerId, msg: &Message) {
		for peer in self.servers() {
			if peer.id() != sender_id {
				peer.invoke(msg.clone());
			}
		}
	}
}

/// A membership view fixed for the process lifetime. The common case for a
/// cluster whose membership is configured out of band.
pub struct StaticMembership {
	peers: HashMap<ServerId, Arc<dyn Peer>>,
}

impl StaticMembership {
	pub fn new(peers: Vec<Arc<dyn Peer>>) -> Self {
		StaticMembership {
			peers: peers.into_iter().map(|p| (p.id(), p)).collect(),
		}
	}
}

impl MembershipView for StaticMembership {
	fn count(&self) -> usize { self.peers.len() }

	fn find(&self, id: ServerId) -> Option<Arc<dyn Peer>> {
		self.peers.get(&id).cloned()
	}

	fn servers(&self) -> Vec<Arc<dyn Peer>> {
		self.peers.values().cloned().collect()
	}
}

/// A peer standing in for a server that has been removed from the cluster.
/// Keeps `find` total (so callers don't need to special-case "used to be a
/// member") while guaranteeing nothing is ever actually sent to it.
struct UnavailablePeer {
	id: ServerId,
}

impl Peer for UnavailablePeer {
	fn id(&self) -> ServerId { self.id }

	fn invoke(&self, _msg: Message) {
		log::debug!("dropping message to removed server {}", self.id);
	}
}

struct DynamicMembershipState {
	committed: HashMap<ServerId, Arc<dyn Peer>>,
	pending: HashMap<ServerId, Arc<dyn Peer>>,
	removed: HashSet<ServerId>,
}

/// A membership view driven by commands replicated through the log itself,
/// so that membership changes inherit the same safety guarantees as any
/// other state transition.
///
/// New peers are registered with `register_pending` out of band (e.g. once
/// a new server's connection is established) before the corresponding
/// `AddMember` command is proposed; once that command commits, `apply`
/// promotes the peer from pending to committed.
pub struct DynamicMembership {
	state: RwLock<DynamicMembershipState>,
}

impl DynamicMembership {
	pub fn new(initial: Vec<Arc<dyn Peer>>) -> Self {
		let committed = initial.into_iter().map(|p| (p.id(), p)).collect();
		DynamicMembership {
			state: RwLock::new(DynamicMembershipState {
				committed,
				pending: HashMap::new(),
				removed: HashSet::new(),
			}),
		}
	}

	pub fn register_pending(&self, peer: Arc<dyn Peer>) {
		let mut state = self.state.write().unwrap();
		if !state.committed.contains_key(&peer.id()) {
			state.pending.insert(peer.id(), peer);
		}
	}
}

impl MembershipView for DynamicMembership {
	fn count(&self) -> usize {
		self.state.read().unwrap().committed.len()
	}

	fn find(&self, id: ServerId) -> Option<Arc<dyn Peer>> {
		let state = self.state.read().unwrap();
		if let Some(p) = state.committed.get(&id) {
			return Some(p.clone());
		}
		if let Some(p) = state.pending.get(&id) {
			return Some(p.clone());
		}
		if state.removed.contains(&id) {
			return Some(Arc::new(UnavailablePeer { id }));
		}
		None
	}

	fn servers(&self) -> Vec<Arc<dyn Peer>> {
		self.state.read().unwrap().committed.values().cloned().collect()
	}
}

impl StateMachine for DynamicMembership {
	fn apply(&self, command: &Command) {
		let change: MembershipChange = match rmps::from_slice(&command.payload) {
			Ok(c) => c,
			Err(e) => {
				log::error!("failed to decode membership change: {}", e);
				return;
			}
		};

		let mut state = self.state.write().unwrap();
		match change {
			MembershipChange::AddMember(id) => {
				if let Some(peer) = state.pending.remove(&id) {
					peer.start();
					state.committed.insert(id, peer);
				} else if !state.committed.contains_key(&id) {
					log::warn!("AddMember({}) committed with no pending registration on hand", id);
				}
				state.removed.remove(&id);
			}
			MembershipChange::RemoveMember(id) => {
				state.committed.remove(&id);
				state.pending.remove(&id);
				state.removed.insert(id);
			}
		}
	}
}

/// Command identifier used for membership-change commands, so the server's
/// state-machine router can recognize and route them to a `DynamicMembership`
/// registered under this tag.
pub fn membership_command(change: MembershipChange) -> Command {
	Command::new(MEMBERSHIP_COMMAND_TAG, rmps::to_vec(&change).expect("membership change always encodes"))
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NoopPeer(ServerId);
	impl Peer for NoopPeer {
		fn id(&self) -> ServerId { self.0 }
		fn invoke(&self, _msg: Message) {}
	}

	struct CountingStartPeer {
		id: ServerId,
		starts: std::sync::atomic::AtomicUsize,
	}
	impl Peer for CountingStartPeer {
		fn id(&self) -> ServerId { self.id }
		fn invoke(&self, _msg: Message) {}
		fn start(&self) {
			self.starts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		}
	}

	#[test]
	fn static_membership_counts_and_finds_peers() {
		let view = StaticMembership::new(vec![Arc::new(NoopPeer(1)), Arc::new(NoopPeer(2))]);
		assert_eq!(view.count(), 2);
		assert!(view.find(1).is_some());
		assert!(view.find(3).is_none());
	}

	#[test]
	fn dynamic_membership_promotes_pending_on_apply() {
		let view = DynamicMembership::new(vec![Arc::new(NoopPeer(1))]);
		view.register_pending(Arc::new(NoopPeer(2)));
		assert_eq!(view.count(), 1);

		let cmd = membership_command(MembershipChange::AddMember(2));
		view.apply(&cmd);
		assert_eq!(view.count(), 2);
	}

	#[test]
	fn promotion_from_pending_to_committed_starts_the_peer_exactly_once() {
		let view = DynamicMembership::new(vec![]);
		let peer = Arc::new(CountingStartPeer { id: 2, starts: std::sync::atomic::AtomicUsize::new(0) });
		view.register_pending(peer.clone());

		let cmd = membership_command(MembershipChange::AddMember(2));
		view.apply(&cmd);
		assert_eq!(peer.starts.load(std::sync::atomic::Ordering::SeqCst), 1);

		// a redundant commit of the same change must not start the peer again
		view.apply(&cmd);
		assert_eq!(peer.starts.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[test]
	fn removed_member_resolves_to_unavailable_peer() {
		let view = DynamicMembership::new(vec![Arc::new(NoopPeer(1)), Arc::new(NoopPeer(2))]);
		{
			let mut state = view.state.write().unwrap();
			state.committed.remove(&2);
			state.removed.insert(2);
		}
		let peer = view.find(2).unwrap();
		peer.invoke(Message { sender_id: 1, term: 0, kind: crate::protos::MessageKind::VoteResponse { granted: true } });
	}
}
