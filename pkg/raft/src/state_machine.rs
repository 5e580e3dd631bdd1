//! The boundary between the replicated log and whatever the embedding
//! application actually wants to happen once a command commits.

use std::collections::HashMap;
use std::sync::Arc;

use crate::protos::Command;

/// A user-supplied (or, for `MembershipChange` commands, built-in) state
/// machine. `apply` takes `&self` rather than `&mut self` so a state machine
/// can be shared behind an `Arc` and consulted concurrently (e.g. for reads)
/// while also being driven by committed log entries; implementations use
/// their own interior mutability (a `Mutex`/`RwLock`) for whatever state
/// they keep.
pub trait StateMachine: Send + Sync {
	fn apply(&self, command: &Command);
}

/// Dispatches each committed command to the state machine registered for
/// its `identifier`, by exact string match. A command whose identifier has
/// no registered state machine means the cluster committed an operation the
/// embedding application never wired up a handler for -- a programmer error,
/// not a condition a correctly configured deployment can hit, so it's a hard
/// failure rather than a silently dropped entry.
pub struct StateMachineRouter {
	machines: HashMap<String, Arc<dyn StateMachine>>,
}

impl StateMachineRouter {
	pub fn new() -> Self {
		StateMachineRouter { machines: HashMap::new() }
	}

	pub fn register<S: Into<String>>(&mut self, identifier: S, machine: Arc<dyn StateMachine>) {
		self.machines.insert(identifier.into(), machine);
	}

	pub fn apply(&self, command: &Command) {
		match self.machines.get(&command.identifier) {
			Some(machine) => machine.apply(command),
			None => panic!(
				"committed command with identifier '{}' has no registered state machine",
				command.identifier
			),
		}
	}
}

impl Default for StateMachineRouter {
	fn default() -> Self { Self::new() }
}
