//! The wire and on-disk data model shared by every other component.

/// Type used to uniquely identify each server. Assigned out of band
/// (typically by the embedding application) and never reused.
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Index 0 is the implicit sentinel entry that precedes every real log
/// entry; it always has term 0 and is never stored on disk.
pub const NO_INDEX: LogIndex = 0;

pub type RequestId = u64;

/// An opaque, application-defined operation. `identifier` is used by the
/// state-machine router (see `state_machine.rs`) to dispatch a committed
/// command to the state machine registered for it; `payload` is whatever
/// bytes that state machine knows how to interpret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
	pub identifier: String,
	pub payload: Vec<u8>,
}

impl Command {
	pub fn new<S: Into<String>>(identifier: S, payload: Vec<u8>) -> Self {
		Command { identifier: identifier.into(), payload }
	}
}

/// A single entry in the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
	pub index: LogIndex,
	pub term: Term,
	pub command: Command,
}

/// The role a server occupies at a given moment. Purely descriptive; the
/// role-specific volatile state lives alongside it in `server.rs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Follower,
	Candidate,
	Leader,
}

/// The outcome reported to a `CommandListener` once a submitted command is
/// known to have either committed or definitely failed. This is purely an
/// internal callback payload, never itself put on the wire (see
/// `MessageKind::CommandResponse` for the wire-level accept/reject shape).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
	Applied { index: LogIndex },
	Failed,
}

impl CommandOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, CommandOutcome::Applied { .. })
	}
}

/// Every kind of traffic that flows between servers. All variants are tagged
/// with the common header carried by `Message` rather than duplicating
/// `sender_id`/`term` in each payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageKind {
	VoteRequest {
		last_log_index: LogIndex,
		last_log_term: Term,
	},
	VoteResponse {
		granted: bool,
	},
	AppendRequest {
		prev_log_index: LogIndex,
		prev_log_term: Term,
		entries: Vec<Command>,
		leader_commit: LogIndex,
	},
	AppendResponse {
		ok: bool,
		/// Hint for what index to try next on rejection; absent when the
		/// follower has nothing more useful to offer than "no".
		index: Option<LogIndex>,
	},
	CommandRequest {
		command: Command,
		request_id: Option<RequestId>,
	},
	CommandResponse {
		request_id: Option<RequestId>,
		/// True if the leader accepted and appended the command (which does
		/// not yet mean it committed); `index` is then the entry's index.
		accepted: bool,
		index: Option<LogIndex>,
	},
}

/// A message between two servers, always addressed by the common header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
	pub sender_id: ServerId,
	pub term: Term,
	pub kind: MessageKind,
}

/// A membership change, replicated through the log exactly like any other
/// command so that it benefits from the same safety properties.
///
/// Kept to a binary member/non-member split rather than a separate learner
/// role, since nothing here needs a non-voting intermediate state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MembershipChange {
	AddMember(ServerId),
	RemoveMember(ServerId),
}

pub const MEMBERSHIP_COMMAND_TAG: &str = "__membership__";
