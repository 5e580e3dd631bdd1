use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Holds an exclusive advisory lock on a directory for as long as it is alive.
///
/// Two processes pointed at the same state directory is almost always a
/// misconfiguration (two nodes fighting over one set of durable files), so we
/// fail fast instead of silently corrupting state.
pub struct DirLock {
	path: PathBuf,
	file: File,
}

impl DirLock {
	/// Acquires the lock, creating the directory (and the lockfile inside it)
	/// if necessary. Returns an error immediately if another process already
	/// holds the lock rather than blocking.
	pub fn acquire<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
		let path = dir.as_ref().to_path_buf();
		std::fs::create_dir_all(&path)?;

		let lock_path = path.join("LOCK");
		let file = OpenOptions::new()
			.create(true)
			.write(true)
			.open(&lock_path)?;

		file.try_lock_exclusive().map_err(|_| {
			io::Error::new(
				io::ErrorKind::WouldBlock,
				format!(
					"state directory {} is already locked by another process",
					path.display()
				),
			)
		})?;

		Ok(DirLock { path, file })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for DirLock {
	fn drop(&mut self) {
		let _ = fs2::FileExt::unlock(&self.file);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_acquire_in_same_dir_fails() {
		let dir = tempfile::tempdir().unwrap();
		let first = DirLock::acquire(dir.path()).unwrap();
		let second = DirLock::acquire(dir.path());
		assert!(second.is_err());
		drop(first);
		// once released, a fresh acquire succeeds again
		let third = DirLock::acquire(dir.path());
		assert!(third.is_ok());
	}
}
