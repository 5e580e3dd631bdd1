//! Durable server state: the handful of fields that must survive a restart
//! for Raft's safety properties to hold (`current_term`, `voted_for`,
//! `commit_index`).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use raft_support::FlipSign;

use crate::errors::*;
use crate::protos::{LogIndex, ServerId, Term};

const VERSION: u64 = 1;
const NO_VOTE: i64 = -1;
const RECORD_LEN: u64 = 8 * 5;

pub trait DurableState: Send {
	fn server_id(&self) -> ServerId;
	fn current_term(&self) -> Term;
	fn voted_for(&self) -> Option<ServerId>;
	fn commit_index(&self) -> LogIndex;

	/// Persists a new term, clearing `voted_for` in the same write (a vote
	/// is only ever valid within the term it was cast in). A no-op, and
	/// therefore no fsync, if `term` matches what's already stored.
	fn update_current_term(&mut self, term: Term) -> Result<()>;

	/// Persists a vote for `id` in the current term. A no-op if we already
	/// recorded a vote for exactly this id.
	fn update_voted_for(&mut self, id: ServerId) -> Result<()>;

	/// Persists the commit index. Best-effort: failures are reported to the
	/// caller but are not treated as fatal, since the commit index can
	/// always be recomputed by replaying the log up to what a majority of
	/// the cluster has actually stored.
	fn update_commit_index(&mut self, index: LogIndex) -> Result<()>;
}

/// An in-memory stand-in used by tests that don't want real file I/O.
pub struct MemoryState {
	server_id: ServerId,
	current_term: Term,
	voted_for: Option<ServerId>,
	commit_index: LogIndex,
}

impl MemoryState {
	pub fn new(server_id: ServerId) -> Self {
		MemoryState { server_id, current_term: 0, voted_for: None, commit_index: 0 }
	}
}

impl DurableState for MemoryState {
	fn server_id(&self) -> ServerId { self.server_id }
	fn current_term(&self) -> Term { self.current_term }
	fn voted_for(&self) -> Option<ServerId> { self.voted_for }
	fn commit_index(&self) -> LogIndex { self.commit_index }

	fn update_current_term(&mut self, term: Term) -> Result<()> {
		if term != self.current_term {
			self.current_term = term;
			self.voted_for = None;
		}
		Ok(())
	}

	fn update_voted_for(&mut self, id: ServerId) -> Result<()> {
		self.voted_for = Some(id);
		Ok(())
	}

	fn update_commit_index(&mut self, index: LogIndex) -> Result<()> {
		self.commit_index = index;
		Ok(())
	}
}

/// Durable state backed by a single fixed-size record file, rewritten and
/// fsynced in place on every change. Five big-endian u64 fields: version,
/// server_id, current_term, commit_index, and the voted-for id with `-1`
/// (bit-flipped into its unsigned representation) standing in for "no
/// vote cast".
pub struct FileDurableState {
	file: File,
	server_id: ServerId,
	current_term: Term,
	voted_for: Option<ServerId>,
	commit_index: LogIndex,
}

impl FileDurableState {
	/// Opens the durable state file at `path`, creating it if absent. When
	/// creating a fresh file, `supplied_id` becomes this server's permanent
	/// id. When opening an existing file, `supplied_id` (if given) must
	/// match what's recorded there.
	pub fn open<P: AsRef<Path>>(path: P, supplied_id: Option<ServerId>) -> Result<Self> {
		let path = path.as_ref();
		if path.exists() {
			let mut file = OpenOptions::new().read(true).write(true).open(path)?;
			let version = file.read_u64::<BigEndian>()?;
			if version != VERSION {
				bail!(ErrorKind::InvalidConfig(format!(
					"unsupported durable state file version {}",
					version
				)));
			}
			let server_id = file.read_u64::<BigEndian>()?;
			let current_term = file.read_u64::<BigEndian>()?;
			let commit_index = file.read_u64::<BigEndian>()?;
			let raw_voted_for = file.read_u64::<BigEndian>()?;
			let signed: i64 = raw_voted_for.flip();
			let voted_for = if signed == NO_VOTE { None } else { Some(signed as u64) };

			if let Some(expected) = supplied_id {
				if expected != server_id {
					bail!(ErrorKind::StateMismatch(expected, server_id));
				}
			}

			Ok(FileDurableState { file, server_id, current_term, voted_for, commit_index })
		} else {
			let server_id = supplied_id.ok_or_else(|| Error::from(ErrorKind::InitError))?;
			let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
			let mut state = FileDurableState {
				file,
				server_id,
				current_term: 0,
				voted_for: None,
				commit_index: 0,
			};
			state.write_record()?;
			Ok(state)
		}
	}

	fn write_record(&mut self) -> Result<()> {
		let voted_for_raw: u64 = match self.voted_for {
			Some(id) => id,
			None => NO_VOTE.flip(),
		};

		self.file.seek(SeekFrom::Start(0))?;
		let mut buf = Vec::with_capacity(RECORD_LEN as usize);
		buf.write_u64::<BigEndian>(VERSION)?;
		buf.write_u64::<BigEndian>(self.server_id)?;
		buf.write_u64::<BigEndian>(self.current_term)?;
		buf.write_u64::<BigEndian>(self.commit_index)?;
		buf.write_u64::<BigEndian>(voted_for_raw)?;
		self.file.write_all(&buf)?;
		self.file.sync_all().map_err(|e| {
			Error::from(ErrorKind::DurabilityFailure(format!("fsync of durable state failed: {}", e)))
		})?;
		Ok(())
	}
}

impl DurableState for FileDurableState {
	fn server_id(&self) -> ServerId { self.server_id }
	fn current_term(&self) -> Term { self.current_term }
	fn voted_for(&self) -> Option<ServerId> { self.voted_for }
	fn commit_index(&self) -> LogIndex { self.commit_index }

	fn update_current_term(&mut self, term: Term) -> Result<()> {
		if term == self.current_term {
			return Ok(());
		}
		let prev_term = self.current_term;
		let prev_voted_for = self.voted_for;
		self.current_term = term;
		self.voted_for = None;
		if let Err(e) = self.write_record() {
			self.current_term = prev_term;
			self.voted_for = prev_voted_for;
			return Err(e);
		}
		Ok(())
	}

	fn update_voted_for(&mut self, id: ServerId) -> Result<()> {
		if self.voted_for == Some(id) {
			return Ok(());
		}
		let prev = self.voted_for;
		self.voted_for = Some(id);
		if let Err(e) = self.write_record() {
			self.voted_for = prev;
			return Err(e);
		}
		Ok(())
	}

	fn update_commit_index(&mut self, index: LogIndex) -> Result<()> {
		if index == self.commit_index {
			return Ok(());
		}
		let prev = self.commit_index;
		self.commit_index = index;
		if let Err(e) = self.write_record() {
			self.commit_index = prev;
			return Err(e);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_file_starts_at_zero() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");
		let state = FileDurableState::open(&path, Some(7)).unwrap();
		assert_eq!(state.server_id(), 7);
		assert_eq!(state.current_term(), 0);
		assert_eq!(state.voted_for(), None);
		assert_eq!(state.commit_index(), 0);
	}

	#[test]
	fn reopen_preserves_values() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");
		{
			let mut state = FileDurableState::open(&path, Some(1)).unwrap();
			state.update_current_term(5).unwrap();
			state.update_voted_for(3).unwrap();
			state.update_commit_index(9).unwrap();
		}
		let reopened = FileDurableState::open(&path, None).unwrap();
		assert_eq!(reopened.server_id(), 1);
		assert_eq!(reopened.current_term(), 5);
		assert_eq!(reopened.voted_for(), Some(3));
		assert_eq!(reopened.commit_index(), 9);
	}

	#[test]
	fn new_term_clears_vote() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");
		let mut state = FileDurableState::open(&path, Some(1)).unwrap();
		state.update_voted_for(2).unwrap();
		state.update_current_term(state.current_term() + 1).unwrap();
		assert_eq!(state.voted_for(), None);
	}

	#[test]
	fn mismatched_server_id_on_reopen_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");
		FileDurableState::open(&path, Some(1)).unwrap();
		let reopened = FileDurableState::open(&path, Some(2));
		assert!(reopened.is_err());
	}

	#[test]
	fn missing_file_without_id_fails() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");
		assert!(FileDurableState::open(&path, None).is_err());
	}
}
