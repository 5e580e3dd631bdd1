//! The proxy/transport seam: wraps a `Peer` so that `invoke` never blocks
//! the caller, and so tests can simulate a network partition by toggling
//! `disconnect`/`reconnect` without touching the servers on either end.
//!
//! A small fixed-size worker pool shared by every peer a given transport
//! knows about, so dispatching a message never blocks its caller on I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::membership::Peer;
use crate::protos::{Message, ServerId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A small fixed-size thread pool. Jobs are handed off over an mpsc channel
/// shared by all workers (guarded by a mutex, since `mpsc::Receiver` isn't
/// itself shareable) -- the standard shape for this, not anything bespoke.
pub struct WorkerPool {
	sender: Option<mpsc::Sender<Job>>,
	workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
	pub fn new(size: usize) -> Self {
		assert!(size > 0, "worker pool needs at least one thread");
		let (sender, receiver) = mpsc::channel::<Job>();
		let receiver = Arc::new(Mutex::new(receiver));

		let mut workers = Vec::with_capacity(size);
		for _ in 0..size {
			let receiver = receiver.clone();
			workers.push(std::thread::spawn(move || loop {
				let job = {
					let receiver = receiver.lock().unwrap();
					receiver.recv()
				};
				match job {
					Ok(job) => job(),
					Err(_) => break, // sender dropped, pool is shutting down
				}
			}));
		}

		WorkerPool { sender: Some(sender), workers }
	}

	pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
		if let Some(sender) = &self.sender {
			let _ = sender.send(Box::new(job));
		}
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		// dropping the sender unblocks every worker's `recv`
		self.sender.take();
		for worker in self.workers.drain(..) {
			let _ = worker.join();
		}
	}
}

/// Wraps another `Peer` so `invoke` is dispatched on a worker pool instead
/// of running on the caller's thread, and so it can be cut off from (and
/// restored to) the rest of the cluster at will.
pub struct Proxy {
	id: ServerId,
	inner: Arc<dyn Peer>,
	connected: Arc<AtomicBool>,
	pool: Arc<WorkerPool>,
}

impl Proxy {
	pub fn new(inner: Arc<dyn Peer>, pool: Arc<WorkerPool>) -> Self {
		Proxy { id: inner.id(), inner, connected: Arc::new(AtomicBool::new(true)), pool }
	}

	pub fn disconnect(&self) {
		self.connected.store(false, Ordering::SeqCst);
	}

	pub fn reconnect(&self) {
		self.connected.store(true, Ordering::SeqCst);
	}

	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}
}

impl Peer for Proxy {
	fn id(&self) -> ServerId { self.id }

	fn invoke(&self, msg: Message) {
		if !self.connected.load(Ordering::SeqCst) {
			return;
		}
		let inner = self.inner.clone();
		let connected = self.connected.clone();
		self.pool.submit(move || {
			// re-check at delivery time: a disconnect issued while this job
			// was queued should still drop it
			if connected.load(Ordering::SeqCst) {
				inner.invoke(msg);
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	struct CountingPeer {
		id: ServerId,
		count: Arc<AtomicUsize>,
	}
	impl Peer for CountingPeer {
		fn id(&self) -> ServerId { self.id }
		fn invoke(&self, _msg: Message) {
			self.count.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn vote_request() -> Message {
		Message {
			sender_id: 1,
			term: 1,
			kind: crate::protos::MessageKind::VoteRequest { last_log_index: 0, last_log_term: 0 },
		}
	}

	#[test]
	fn disconnected_proxy_drops_messages() {
		let count = Arc::new(AtomicUsize::new(0));
		let inner = Arc::new(CountingPeer { id: 2, count: count.clone() });
		let pool = Arc::new(WorkerPool::new(2));
		let proxy = Proxy::new(inner, pool);

		proxy.disconnect();
		proxy.invoke(vote_request());
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(count.load(Ordering::SeqCst), 0);

		proxy.reconnect();
		proxy.invoke(vote_request());
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}
