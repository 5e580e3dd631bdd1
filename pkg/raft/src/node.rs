//! Top-level wiring: turns a `RaftServer` into a long-running process-local
//! participant, owning the state directory lock, the background scheduler
//! thread, and the durable-log replay a restart needs before it can serve
//! anything. The embedding application supplies its own membership view and
//! state machines; this module only owns the open-lock/build-state/run-loop
//! sequence.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use raft_support::dir_lock::DirLock;

use crate::config::RaftConfig;
use crate::errors::*;
use crate::log::{FileLog, Log};
use crate::membership::MembershipView;
use crate::protos::{Command, CommandOutcome, LogIndex, ServerId};
use crate::server::{CommandListener, RaftServer};
use crate::state::{DurableState, FileDurableState};
use crate::state_machine::StateMachineRouter;

/// The longest the scheduler thread ever sleeps in one call to
/// `thread::sleep`, so a `Node::shutdown()` is noticed promptly regardless
/// of how far out the next tick is.
const SCHEDULER_POLL_CAP: Duration = Duration::from_millis(50);

struct ChannelListener {
	sender: mpsc::Sender<CommandOutcome>,
}

impl CommandListener for ChannelListener {
	fn command_applied(self: Box<Self>, index: LogIndex) {
		let _ = self.sender.send(CommandOutcome::Applied { index });
	}

	fn command_failed(self: Box<Self>) {
		let _ = self.sender.send(CommandOutcome::Failed);
	}
}

/// A running Raft participant: the role engine plus everything needed to
/// keep it alive as a background process-local service.
pub struct Node {
	server: Arc<RaftServer>,
	running: Arc<AtomicBool>,
	scheduler: Option<JoinHandle<()>>,
	// held for the node's lifetime; dropping it releases the exclusive lock
	// on `config.state_dir`
	_lock: DirLock,
}

impl Node {
	/// Opens (or creates) this server's durable state and log under
	/// `config.state_dir`, replays every already-committed entry into
	/// `state_machines` (a fresh, empty router restarts with no memory of
	/// its own; only the log remembers what has committed), and starts the
	/// background scheduler.
	///
	/// `supplied_id` is required the first time a state directory is used
	/// and must match on every subsequent open.
	pub fn start(
		config: RaftConfig,
		supplied_id: Option<ServerId>,
		membership: Arc<dyn MembershipView>,
		mut state_machines: StateMachineRouter,
    ) -> Result<Arc<Node>> {
		config.validate()?;
		let lock = DirLock::acquire(&config.state_dir)
			.map_err(|e| Error::from(ErrorKind::DurabilityFailure(format!("state directory is already locked: {}", e))))?;

		let durable = FileDurableState::open(config.durable_state_path(), supplied_id)?;
		let commit_index = durable.commit_index();
		let log = FileLog::open(config.log_path(), commit_index)?;

		Self::replay(&log, commit_index, &mut state_machines);

		let server = RaftServer::new(
			config.clone(),
			Box::new(durable),
			Box::new(log),
			membership,
			Arc::new(state_machines),
		)?;

		let running = Arc::new(AtomicBool::new(true));
		let scheduler = Self::spawn_scheduler(server.clone(), running.clone());

		Ok(Arc::new(Node { server, running, scheduler: Some(scheduler), _lock: lock }))
	}

	/// Builds everything purely in memory, for tests that don't want a
	/// state directory at all. The state machines are assumed to start
	/// empty; there is nothing to replay.
	pub fn start_in_memory(
		config: RaftConfig,
		server_id: ServerId,
		membership: Arc<dyn MembershipView>,
		state_machines: StateMachineRouter,
	) -> Result<Arc<Node>> {
		let _ = Path::new(&config.state_dir); // state_dir is unused in this mode
		let durable = crate::state::MemoryState::new(server_id);
		let log = crate::log::MemoryLog::new();

		let server = RaftServer::new(
			config,
			Box::new(durable),
			Box::new(log),
			membership,
			Arc::new(state_machines),
		)?;

		let running = Arc::new(AtomicBool::new(true));
		let scheduler = Self::spawn_scheduler(server.clone(), running.clone());

		Ok(Arc::new(Node {
			server,
			running,
			scheduler: Some(scheduler),
			_lock: DirLock::acquire(std::env::temp_dir().join(format!("raft-inmemory-{}", server_id)))
				.expect("temp lock directory should always be acquirable"),
		}))
	}

	fn replay(log: &FileLog, commit_index: LogIndex, state_machines: &mut StateMachineRouter) {
		if commit_index == 0 {
			return;
		}
		for (offset, command) in log.entries_from(1).into_iter().enumerate() {
			let index = offset as LogIndex + 1;
			if index > commit_index {
				break;
			}
			state_machines.apply(&command);
		}
	}

	fn spawn_scheduler(server: Arc<RaftServer>, running: Arc<AtomicBool>) -> JoinHandle<()> {
		std::thread::spawn(move || {
			while running.load(Ordering::SeqCst) && server.is_active() {
				let wait = server.tick();
				let mut remaining = wait;
				while remaining > Duration::from_millis(0) {
					if !running.load(Ordering::SeqCst) {
						return;
					}
					let nap = remaining.min(SCHEDULER_POLL_CAP);
					std::thread::sleep(nap);
					remaining = remaining.saturating_sub(nap);
				}
			}
		})
	}

	pub fn server(&self) -> &Arc<RaftServer> { &self.server }

	pub fn id(&self) -> ServerId { self.server.id() }

	/// Submits a command and blocks the calling thread until it is either
	/// known to have committed or definitely failed (the leader stepped
	/// down, the forwarding leader was unreachable, or the server shut
	/// down while waiting).
	pub fn submit_blocking(&self, command: Command) -> CommandOutcome {
		let (sender, receiver) = mpsc::channel();
		self.server.submit_command(command, Some(Box::new(ChannelListener { sender })));
		receiver.recv().unwrap_or(CommandOutcome::Failed)
	}

	/// Submits a command without waiting for its outcome.
	pub fn submit_async(&self, command: Command) {
		self.server.submit_command(command, None);
	}

	pub fn shutdown(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.server.shutdown();
	}
}

impl Drop for Node {
	fn drop(&mut self) {
		self.running.store(false, Ordering::SeqCst);
		if let Some(handle) = self.scheduler.take() {
			let _ = handle.join();
		}
	}
}
