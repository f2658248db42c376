//! Worker intake: adopting freshly forked workers and pairing them with
//! brokers.
//!
//! Forked workers connect to the gateway's unix listener before they lock
//! themselves down, and announce themselves with one framed
//! `child <jail-id> <pid> chroot=<0|1>` message. The gate then either hands
//! the worker to a broker already waiting for one, or parks it warm until a
//! document arrives. Parked sockets stay on the intake poll; adoption is the
//! standard ownership move onto the broker's poll.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quill_net::socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};
use quill_net::ws::{self, OutboundQueue};
use quill_net::{SocketPoll, WebSocketFramer};
use quill_proto::tokens::Tokens;

use crate::broker::DocumentBroker;
use crate::broker::worker::{WorkerChannel, WorkerLink};
use crate::spawner::WorkerLauncher;

/// Pairing state between announced workers and brokers that need one.
pub struct WorkerGate {
	launcher: Box<dyn WorkerLauncher>,
	intake_poll: Arc<SocketPoll>,
	inner: Mutex<GateInner>,
}

#[derive(Default)]
struct GateInner {
	/// Announced workers parked warm, by jail id.
	idle: VecDeque<WorkerLink>,
	/// Brokers waiting for a worker.
	waiting: VecDeque<Arc<DocumentBroker>>,
	/// Claims: jail id → broker; the parked intake handler completes these.
	claims: HashMap<String, Arc<DocumentBroker>>,
}

impl WorkerGate {
	#[must_use]
	pub fn new(launcher: Box<dyn WorkerLauncher>, intake_poll: Arc<SocketPoll>) -> Arc<Self> {
		Arc::new(Self {
			launcher,
			intake_poll,
			inner: Mutex::new(GateInner::default()),
		})
	}

	#[must_use]
	pub fn intake_poll(&self) -> &Arc<SocketPoll> {
		&self.intake_poll
	}

	/// A broker needs a worker. Uses a warm one when available, otherwise
	/// queues the broker and asks the launcher for a fresh fork. Always
	/// requests a replacement so the warm pool stays stocked.
	pub fn assign_worker(&self, broker: Arc<DocumentBroker>) {
		let mut inner = self.inner.lock();
		match inner.idle.pop_front() {
			Some(link) => {
				inner.claims.insert(link.jail_id.clone(), broker);
				drop(inner);
				// The parked handler notices the claim on its next tick.
				self.intake_poll.wakeup();
				self.launcher.request_workers(1);
			}
			None => {
				inner.waiting.push_back(broker);
				drop(inner);
				self.launcher.request_workers(1);
			}
		}
	}

	/// A worker announced itself. Returns the broker that takes it
	/// immediately, or `None` to park it warm.
	fn worker_ready(&self, link: WorkerLink) -> Option<Arc<DocumentBroker>> {
		let mut inner = self.inner.lock();
		match inner.waiting.pop_front() {
			Some(broker) => Some(broker),
			None => {
				tracing::debug!(jail = %link.jail_id, pid = link.pid, "worker parked warm");
				inner.idle.push_back(link);
				None
			}
		}
	}

	/// The parked worker with this jail id checks whether it was claimed.
	fn take_claim(&self, jail_id: &str) -> Option<Arc<DocumentBroker>> {
		self.inner.lock().claims.remove(jail_id)
	}

	/// A parked worker's socket died before adoption.
	fn worker_lost(&self, jail_id: &str) {
		let mut inner = self.inner.lock();
		inner.idle.retain(|link| link.jail_id != jail_id);
		inner.claims.remove(jail_id);
	}

	/// Number of warm workers currently parked.
	#[must_use]
	pub fn idle_count(&self) -> usize {
		self.inner.lock().idle.len()
	}
}

/// Listener handler accepting worker connections on the unix socket.
pub struct WorkerListener {
	gate: Arc<WorkerGate>,
}

impl WorkerListener {
	#[must_use]
	pub fn new(gate: Arc<WorkerGate>) -> Self {
		Self { gate }
	}
}

impl SocketHandler for WorkerListener {
	fn poll_events(&mut self, _now: Instant, _timeout: &mut Duration) -> Interest {
		Interest::READ
	}

	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
		loop {
			match accept_nonblocking(socket.raw_fd()) {
				Accepted::Socket(owned) => match StreamSocket::from_fd(owned) {
					Ok(stream) => {
						let gate = Arc::clone(&self.gate);
						self.gate
							.intake_poll
							.insert_socket(stream, Box::new(WorkerIntake::new(gate)));
					}
					Err(e) => tracing::warn!(error = %e, "worker socket setup failed"),
				},
				Accepted::WouldBlock => break,
				Accepted::Failed(e) => {
					tracing::error!(error = %e, "worker listener accept failed");
					break;
				}
			}
		}
		SocketDisposition::Continue
	}
}

/// One non-blocking accept on a listening descriptor.
pub(crate) enum Accepted {
	Socket(OwnedFd),
	WouldBlock,
	Failed(std::io::Error),
}

pub(crate) fn accept_nonblocking(listener: std::os::fd::RawFd) -> Accepted {
	loop {
		let fd = unsafe {
			libc::accept4(
				listener,
				std::ptr::null_mut(),
				std::ptr::null_mut(),
				libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
			)
		};
		if fd >= 0 {
			return Accepted::Socket(unsafe { OwnedFd::from_raw_fd(fd) });
		}
		let error = std::io::Error::last_os_error();
		return match error.kind() {
			std::io::ErrorKind::WouldBlock => Accepted::WouldBlock,
			std::io::ErrorKind::Interrupted => continue,
			_ => Accepted::Failed(error),
		};
	}
}

/// Handler for a worker socket between connect and broker adoption.
struct WorkerIntake {
	gate: Arc<WorkerGate>,
	announced: Option<WorkerLink>,
}

impl WorkerIntake {
	fn new(gate: Arc<WorkerGate>) -> Self {
		Self {
			gate,
			announced: None,
		}
	}

	fn adopt(link: WorkerLink, broker: Arc<DocumentBroker>) -> SocketDisposition {
		let queue = Arc::clone(&link.queue);
		let attached = broker.attach_worker(WorkerLink {
			jail_id: link.jail_id.clone(),
			pid: link.pid,
			chrooted: link.chrooted,
			queue: Arc::clone(&link.queue),
		});
		if !attached {
			return SocketDisposition::Closed;
		}
		let target = Arc::clone(broker.poll());
		SocketDisposition::Move(Box::new(move |stream| {
			let framer = WebSocketFramer::server(WorkerChannel::new(broker), queue);
			target.insert_socket(stream, Box::new(framer));
		}))
	}
}

impl SocketHandler for WorkerIntake {
	fn poll_events(&mut self, _now: Instant, timeout: &mut Duration) -> Interest {
		if self.announced.is_some() {
			// Poll the claim table at a modest cadence.
			*timeout = (*timeout).min(Duration::from_millis(250));
		}
		Interest::READ
	}

	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
		if self.announced.is_some() {
			// Nothing further is expected before adoption; wait.
			return SocketDisposition::Continue;
		}
		let (frame, consumed) =
			match ws::decode_frame(socket.in_buffer(), ws::DEFAULT_MAX_PAYLOAD) {
				Ok(Some(hit)) => hit,
				Ok(None) => return SocketDisposition::Continue,
				Err(e) => {
					tracing::warn!(error = %e, "bad hello frame from worker");
					return SocketDisposition::Closed;
				}
			};
		socket.discard_input(consumed);

		let hello = String::from_utf8_lossy(&frame.payload).into_owned();
		let tokens = Tokens::new(&hello);
		let (Some("child"), Some(jail_id), Some(pid)) =
			(tokens.command(), tokens.get(1), tokens.get(2))
		else {
			tracing::warn!(message = %hello, "unexpected worker hello");
			return SocketDisposition::Closed;
		};
		let Ok(pid) = pid.parse::<i32>() else {
			return SocketDisposition::Closed;
		};
		let link = WorkerLink {
			jail_id: jail_id.to_string(),
			pid,
			chrooted: tokens.string_pair("chroot") != Some("0"),
			queue: OutboundQueue::new(),
		};
		tracing::info!(jail = %link.jail_id, pid, "worker announced");

		match self.gate.worker_ready(WorkerLink {
			jail_id: link.jail_id.clone(),
			pid: link.pid,
			chrooted: link.chrooted,
			queue: Arc::clone(&link.queue),
		}) {
			Some(broker) => Self::adopt(link, broker),
			None => {
				self.announced = Some(link);
				SocketDisposition::Continue
			}
		}
	}

	fn on_timeout(&mut self, _socket: &mut StreamSocket, _now: Instant) -> SocketDisposition {
		let Some(link) = &self.announced else {
			return SocketDisposition::Continue;
		};
		match self.gate.take_claim(&link.jail_id) {
			Some(broker) => {
				let link = self.announced.take().unwrap();
				Self::adopt(link, broker)
			}
			None => SocketDisposition::Continue,
		}
	}

	fn on_disconnect(&mut self, _socket: &mut StreamSocket) {
		if let Some(link) = &self.announced {
			tracing::warn!(jail = %link.jail_id, "parked worker died");
			self.gate.worker_lost(&link.jail_id);
		}
	}
}
