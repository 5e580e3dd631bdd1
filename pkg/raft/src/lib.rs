#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;

extern crate rmp_serde as rmps;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
			Encode(::rmps::encode::Error);
			Decode(::rmps::decode::Error);
		}

		errors {
			InitError {
				description("no durable state exists on disk and no server id was supplied to create one")
			}
			StateMismatch(expected: crate::protos::ServerId, found: crate::protos::ServerId) {
				description("durable state on disk belongs to a different server id than expected")
				display("durable state belongs to server {} but {} was expected", found, expected)
			}
			OutOfRange(index: crate::protos::LogIndex) {
				description("log index out of range")
				display("log index {} is out of range", index)
			}
			StaleTerm(attempted: crate::protos::Term, last: crate::protos::Term) {
				description("attempted to append an entry with a term older than the log's last term")
				display("attempted term {} is older than the log's last term {}", attempted, last)
			}
			LogDivergedPastCommit(index: crate::protos::LogIndex) {
				description("refusing to truncate a committed log entry")
				display("attempted to truncate at index {} which is at or below the commit index", index)
			}
			DurabilityFailure(detail: String) {
				description("a durable write failed")
				display("durable write failed: {}", detail)
			}
			UnknownCommandTag(tag: String) {
				description("no state machine registered for this command identifier")
				display("no state machine registered for identifier '{}'", tag)
			}
			InvalidConfig(detail: String) {
				description("invalid raft configuration")
				display("invalid configuration: {}", detail)
			}
		}
	}
}

pub mod config;
pub mod protos;
pub mod state;
pub mod log;
pub mod tracker;
pub mod membership;
pub mod transport;
pub mod state_machine;
pub mod server;
pub mod node;
