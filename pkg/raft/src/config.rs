//! Ambient configuration surface: everything a node needs to know that isn't
//! learned from the cluster itself. Mirrors the `state.dir` / `raft.heartbeat`
//! / `raft.termtimeout` / `logDir` keys an embedder would otherwise wire up
//! from a config file; this crate only owns the validated struct, not a
//! file-format or env-var parser.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::*;

/// The candidate campaign back-off is deliberately not configurable: it's
/// an implementation detail of how quickly a stuck election retries, not a
/// deployment-visible knob.
pub const CAMPAIGN_BACKOFF: (Duration, Duration) =
	(Duration::from_millis(100), Duration::from_millis(300));

#[derive(Clone, Debug)]
pub struct RaftConfig {
	/// Directory holding this server's durable state file (`state.dir`).
	/// Exclusively locked for the process lifetime.
	pub state_dir: PathBuf,

	/// Directory holding the durable log file (`logDir`). Defaults to
	/// `state_dir` when not set explicitly -- most deployments are happy to
	/// keep both files side by side, but the key is kept distinct since the
	/// two can legitimately live on different volumes (e.g. a faster disk
	/// for the append-heavy log).
	pub log_dir: Option<PathBuf>,

	/// How often a leader sends heartbeats to followers (`raft.heartbeat`).
	pub heartbeat_period: Duration,

	/// How long a follower waits without hearing from a leader before it
	/// starts its own election (`raft.termtimeout`). Must be strictly
	/// greater than `heartbeat_period`.
	pub term_timeout: Duration,
}

impl RaftConfig {
	pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
		let heartbeat_period = Duration::from_millis(5000);
		RaftConfig {
			state_dir: state_dir.into(),
			log_dir: None,
			heartbeat_period,
			term_timeout: heartbeat_period * 2,
		}
	}

	pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
		self.log_dir = Some(dir.into());
		self
	}

	pub fn with_heartbeat_period(mut self, d: Duration) -> Self {
		self.heartbeat_period = d;
		self
	}

	pub fn with_term_timeout(mut self, d: Duration) -> Self {
		self.term_timeout = d;
		self
	}

	/// Checked at node construction time, not at field-assignment time, so
	/// that builder calls can happen in any order.
	pub fn validate(&self) -> Result<()> {
		if self.term_timeout <= self.heartbeat_period {
			bail!(ErrorKind::InvalidConfig(
				"term_timeout must be strictly greater than heartbeat_period".into()
			));
		}
		Ok(())
	}

	pub fn durable_state_path(&self) -> PathBuf {
		self.state_dir.join("server.state")
	}

	pub fn log_path(&self) -> PathBuf {
		self.log_dir.as_deref().unwrap_or(&self.state_dir).join("commands")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_term_timeout_not_larger_than_heartbeat() {
		let config = RaftConfig::new("/tmp/doesnotmatter").with_term_timeout(Duration::from_millis(100));
		assert!(config.validate().is_err());
	}

	#[test]
	fn default_config_validates() {
		assert!(RaftConfig::new("/tmp/doesnotmatter").validate().is_ok());
	}

	#[test]
	fn log_path_defaults_to_state_dir_but_can_be_overridden() {
		let default_dir = RaftConfig::new("/tmp/state-only");
		assert_eq!(default_dir.log_path(), PathBuf::from("/tmp/state-only/commands"));

		let split_dir = RaftConfig::new("/tmp/state-only").with_log_dir("/tmp/log-only");
		assert_eq!(split_dir.log_path(), PathBuf::from("/tmp/log-only/commands"));
	}
}
