//! The replicated log. Entries are appended strictly in order, validated
//! against what a leader claims precedes them, and applied to the state
//! machine in order once committed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::*;
use crate::protos::{Command, Entry, LogIndex, Term};

const VERSION: u64 = 1;

pub trait Log: Send {
	fn last_index(&self) -> LogIndex;
	fn last_term(&self) -> Term;
	fn commit_index(&self) -> LogIndex;

	/// True if an entry exists at `index` with exactly `term` (index 0 is
	/// the sentinel and always matches term 0).
	fn has_entry(&self, index: LogIndex, term: Term) -> bool;

	fn term_at(&self, index: LogIndex) -> Result<Term>;

	/// Appends `command` as a new entry at `last_index() + 1` with `term`.
	/// Rejects a term older than the log's current last term: the log
	/// never goes backwards.
	fn append(&mut self, command: Command, term: Term) -> Result<LogIndex>;

	/// Leaves the log untouched if `index` is past the end or if the entry
	/// already there has `term`. Otherwise truncates everything at and
	/// after `index`. Refuses (and leaves the log untouched) if that would
	/// discard an already-committed entry.
	fn validate_entry(&mut self, index: LogIndex, term: Term) -> Result<()>;

	/// Advances the commit index to `min(up_to, last_index())`, applying
	/// every newly committed entry's command to `apply`, in ascending
	/// order, exactly once.
	fn applied(&mut self, up_to: LogIndex, apply: &mut dyn FnMut(LogIndex, &Command)) -> Result<()>;

	/// Commands for every entry from `start` through `last_index()`,
	/// inclusive, in order. Used to catch a lagging follower up.
	fn entries_from(&self, start: LogIndex) -> Vec<Command>;
}

struct MemoryEntry {
	term: Term,
	command: Command,
}

/// An in-memory log for tests and for embedding in environments that don't
/// need durability (or that layer their own durability on top).
pub struct MemoryLog {
	entries: Vec<MemoryEntry>,
	commit_index: LogIndex,
}

impl MemoryLog {
	pub fn new() -> Self {
		MemoryLog { entries: Vec::new(), commit_index: 0 }
	}
}

impl Default for MemoryLog {
	fn default() -> Self { Self::new() }
}

impl Log for MemoryLog {
	fn last_index(&self) -> LogIndex { self.entries.len() as LogIndex }

	fn last_term(&self) -> Term {
		self.entries.last().map(|e| e.term).unwrap_or(0)
	}

	fn commit_index(&self) -> LogIndex { self.commit_index }

	fn has_entry(&self, index: LogIndex, term: Term) -> bool {
		if index == 0 {
			return term == 0;
		}
		match self.entries.get((index - 1) as usize) {
			Some(e) => e.term == term,
			None => false,
		}
	}

	fn term_at(&self, index: LogIndex) -> Result<Term> {
		if index == 0 {
			return Ok(0);
		}
		self.entries
			.get((index - 1) as usize)
			.map(|e| e.term)
			.ok_or_else(|| Error::from(ErrorKind::OutOfRange(index)))
	}

	fn append(&mut self, command: Command, term: Term) -> Result<LogIndex> {
		if term < self.last_term() {
			bail!(ErrorKind::StaleTerm(term, self.last_term()));
		}
		self.entries.push(MemoryEntry { term, command });
		Ok(self.entries.len() as LogIndex)
	}

	fn validate_entry(&mut self, index: LogIndex, term: Term) -> Result<()> {
		if index > self.last_index() || self.has_entry(index, term) {
			return Ok(());
		}
		if index <= self.commit_index {
			bail!(ErrorKind::LogDivergedPastCommit(index));
		}
		self.entries.truncate((index - 1) as usize);
		Ok(())
	}

	fn applied(&mut self, up_to: LogIndex, apply: &mut dyn FnMut(LogIndex, &Command)) -> Result<()> {
		let target = up_to.min(self.last_index());
		if target <= self.commit_index {
			return Ok(());
		}
		for index in (self.commit_index + 1)..=target {
			let entry = &self.entries[(index - 1) as usize];
			apply(index, &entry.command);
		}
		self.commit_index = target;
		Ok(())
	}

	fn entries_from(&self, start: LogIndex) -> Vec<Command> {
		if start > self.last_index() {
			return Vec::new();
		}
		let start = start.max(1);
		self.entries[(start - 1) as usize..]
			.iter()
			.map(|e| e.command.clone())
			.collect()
	}
}

struct StoredEntry {
	entry: Entry,
	/// Byte offset in the file where this record begins, used to truncate
	/// the file back to exactly this point.
	offset: u64,
}

/// A log backed by a single append-only file of length-prefixed,
/// checksummed records: `u64 index, u64 term, i16 body_len, body,
/// u32 crc32c(body)`. The body is the entry's command, MessagePack-encoded.
///
/// A torn trailing write (the process died mid-`write`) is treated as the
/// end of the log rather than a corruption error: everything before the
/// torn record is still valid, and the torn record itself was never
/// acknowledged to anyone, so discarding it is always safe.
pub struct FileLog {
	file: File,
	entries: Vec<StoredEntry>,
	commit_index: LogIndex,
	end_offset: u64,
}

impl FileLog {
	pub fn open<P: AsRef<Path>>(path: P, initial_commit_index: LogIndex) -> Result<Self> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let existed = path.exists();
		let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;

		if !existed {
			file.write_u64::<BigEndian>(VERSION)?;
			file.sync_all()?;
		}

		let mut log = FileLog {
			file,
			entries: Vec::new(),
			commit_index: initial_commit_index,
			end_offset: 8,
		};
		log.replay()?;
		log.commit_index = log.commit_index.min(log.last_index());
		Ok(log)
	}

	fn replay(&mut self) -> Result<()> {
		self.file.seek(SeekFrom::Start(0))?;
		let version = self.file.read_u64::<BigEndian>()?;
		if version != VERSION {
			bail!(ErrorKind::InvalidConfig(format!("unsupported log file version {}", version)));
		}

		let mut offset = 8u64;
		loop {
			match self.try_read_record(offset) {
				Ok(Some((entry, next_offset))) => {
					self.entries.push(StoredEntry { entry, offset });
					offset = next_offset;
				}
				Ok(None) => break,
				Err(e) => {
					log::warn!(
						"truncating torn write at offset {} while replaying log: {}",
						offset,
						e
					);
					break;
				}
			}
		}

		self.file.set_len(offset)?;
		self.end_offset = offset;
		Ok(())
	}

	/// Reads one record starting at `offset`. `Ok(None)` means we're
	/// cleanly at the end of the file; `Err` means the bytes present don't
	/// form a complete, checksum-valid record (a torn tail write).
	fn try_read_record(&mut self, offset: u64) -> Result<Option<(Entry, u64)>> {
		self.file.seek(SeekFrom::Start(offset))?;

		let index = match self.file.read_u64::<BigEndian>() {
			Ok(v) => v,
			Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let term = self.file.read_u64::<BigEndian>()?;
		let body_len = self.file.read_i16::<BigEndian>()?;
		if body_len < 0 {
			bail!(ErrorKind::DurabilityFailure("negative record length".into()));
		}
		let mut body = vec![0u8; body_len as usize];
		self.file.read_exact(&mut body)?;
		let stored_crc = self.file.read_u32::<BigEndian>()?;
		let actual_crc = crc32c::crc32c(&body);
		if stored_crc != actual_crc {
			bail!(ErrorKind::DurabilityFailure("checksum mismatch".into()));
		}

		let command: Command = rmps::from_slice(&body)?;
		let next_offset = offset + 8 + 8 + 2 + body_len as u64 + 4;
		Ok(Some((Entry { index, term, command }, next_offset)))
	}

	fn encode_record(entry: &Entry) -> Result<Vec<u8>> {
		let body = rmps::to_vec(&entry.command)?;
		if body.len() > i16::MAX as usize {
			bail!(ErrorKind::DurabilityFailure("command too large to encode".into()));
		}

		let mut buf = Vec::with_capacity(8 + 8 + 2 + body.len() + 4);
		buf.write_u64::<BigEndian>(entry.index)?;
		buf.write_u64::<BigEndian>(entry.term)?;
		buf.write_i16::<BigEndian>(body.len() as i16)?;
		buf.extend_from_slice(&body);
		buf.write_u32::<BigEndian>(crc32c::crc32c(&body))?;
		Ok(buf)
	}
}

impl Log for FileLog {
	fn last_index(&self) -> LogIndex { self.entries.len() as LogIndex }

	fn last_term(&self) -> Term {
		self.entries.last().map(|e| e.entry.term).unwrap_or(0)
	}

	fn commit_index(&self) -> LogIndex { self.commit_index }

	fn has_entry(&self, index: LogIndex, term: Term) -> bool {
		if index == 0 {
			return term == 0;
		}
		match self.entries.get((index - 1) as usize) {
			Some(e) => e.entry.term == term,
			None => false,
		}
	}

	fn term_at(&self, index: LogIndex) -> Result<Term> {
		if index == 0 {
			return Ok(0);
		}
		self.entries
			.get((index - 1) as usize)
			.map(|e| e.entry.term)
			.ok_or_else(|| Error::from(ErrorKind::OutOfRange(index)))
	}

	fn append(&mut self, command: Command, term: Term) -> Result<LogIndex> {
		if term < self.last_term() {
			bail!(ErrorKind::StaleTerm(term, self.last_term()));
		}
		let index = self.last_index() + 1;
		let entry = Entry { index, term, command };
		let record = Self::encode_record(&entry)?;

		let offset = self.end_offset;
		self.file.seek(SeekFrom::Start(offset))?;
		self.file.write_all(&record)?;
		self.file.sync_all().map_err(|e| {
			Error::from(ErrorKind::DurabilityFailure(format!("fsync of log append failed: {}", e)))
		})?;

		self.end_offset = offset + record.len() as u64;
		self.entries.push(StoredEntry { entry, offset });
		Ok(index)
	}

	fn validate_entry(&mut self, index: LogIndex, term: Term) -> Result<()> {
		if index > self.last_index() || self.has_entry(index, term) {
			return Ok(());
		}
		if index <= self.commit_index {
			bail!(ErrorKind::LogDivergedPastCommit(index));
		}

		let offset = self.entries[(index - 1) as usize].offset;
		self.file.set_len(offset).map_err(|e| {
			Error::from(ErrorKind::DurabilityFailure(format!("truncation failed: {}", e)))
		})?;
		self.file.sync_all().map_err(|e| {
			Error::from(ErrorKind::DurabilityFailure(format!("fsync after truncation failed: {}", e)))
		})?;
		self.end_offset = offset;
		self.entries.truncate((index - 1) as usize);
		Ok(())
	}

	fn applied(&mut self, up_to: LogIndex, apply: &mut dyn FnMut(LogIndex, &Command)) -> Result<()> {
		let target = up_to.min(self.last_index());
		if target <= self.commit_index {
			return Ok(());
		}
		for index in (self.commit_index + 1)..=target {
			let stored = &self.entries[(index - 1) as usize];
			apply(index, &stored.entry.command);
		}
		self.commit_index = target;
		Ok(())
	}

	fn entries_from(&self, start: LogIndex) -> Vec<Command> {
		if start > self.last_index() {
			return Vec::new();
		}
		let start = start.max(1);
		self.entries[(start - 1) as usize..]
			.iter()
			.map(|e| e.entry.command.clone())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cmd(tag: &str) -> Command {
		Command::new(tag, vec![])
	}

	#[test]
	fn memory_log_append_and_commit() {
		let mut log = MemoryLog::new();
		log.append(cmd("a"), 1).unwrap();
		log.append(cmd("b"), 1).unwrap();
		assert_eq!(log.last_index(), 2);

		let mut applied = Vec::new();
		log.applied(2, &mut |idx, c| applied.push((idx, c.identifier.clone()))).unwrap();
		assert_eq!(applied, vec![(1, "a".to_string()), (2, "b".to_string())]);
		assert_eq!(log.commit_index(), 2);
	}

	#[test]
	fn validate_entry_truncates_divergent_suffix() {
		let mut log = MemoryLog::new();
		log.append(cmd("a"), 1).unwrap();
		log.append(cmd("b"), 1).unwrap();
		log.append(cmd("c"), 1).unwrap();

		log.validate_entry(2, 2).unwrap();
		assert_eq!(log.last_index(), 1);
	}

	#[test]
	fn validate_entry_refuses_to_cross_commit_index() {
		let mut log = MemoryLog::new();
		log.append(cmd("a"), 1).unwrap();
		log.append(cmd("b"), 1).unwrap();
		log.applied(2, &mut |_, _| {}).unwrap();

		assert!(log.validate_entry(1, 2).is_err());
		assert_eq!(log.last_index(), 2);
	}

	#[test]
	fn file_log_round_trips_through_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("log");
		{
			let mut log = FileLog::open(&path, 0).unwrap();
			log.append(cmd("a"), 1).unwrap();
			log.append(cmd("b"), 1).unwrap();
			log.applied(1, &mut |_, _| {}).unwrap();
		}

		let mut reopened = FileLog::open(&path, 1).unwrap();
		assert_eq!(reopened.last_index(), 2);
		assert_eq!(reopened.commit_index(), 1);

		let mut seen = Vec::new();
		reopened.applied(2, &mut |idx, c| seen.push((idx, c.identifier.clone()))).unwrap();
		assert_eq!(seen, vec![(2, "b".to_string())]);
	}

	#[test]
	fn file_log_survives_torn_tail_write() {
		use std::io::Write as _;

		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("log");
		{
			let mut log = FileLog::open(&path, 0).unwrap();
			log.append(cmd("a"), 1).unwrap();
		}

		// simulate a crash mid-write by appending a few garbage bytes that
		// look like the start of a second record but aren't complete
		{
			let mut file = OpenOptions::new().append(true).open(&path).unwrap();
			file.write_all(&[0u8; 5]).unwrap();
		}

		let log = FileLog::open(&path, 0).unwrap();
		assert_eq!(log.last_index(), 1);
	}
}
