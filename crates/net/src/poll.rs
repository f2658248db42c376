//! Single-threaded cooperative socket runtimes.
//!
//! # Mental model
//!
//! - A [`SocketPoll`] is one event loop: it owns a set of sockets and drives
//!   every read, write, and timeout for them on one dedicated thread.
//!   A process runs several polls (client-facing, per-document, worker pipe).
//! - Handlers never block and never sleep; the only suspension point is
//!   `poll(2)` itself. Each handler may shrink the shared timeout to express
//!   its own deadline.
//! - [`SocketPoll::insert_socket`] and [`SocketPoll::post_callback`] are the
//!   only cross-thread entry points. Both enqueue work under the poll's own
//!   mutex and wake the loop through its pipe; the loop adopts the work at
//!   the top of its next iteration.
//! - Ownership transfer between polls is the explicit
//!   [`SocketDisposition::Move`] two-step: the source loop releases the
//!   socket after the current iteration, the target loop adopts it on its
//!   next wakeup and updates the owner-thread marker.
//!
//! # Invariants
//!
//! 1. A socket's handler is only invoked on its owning poll's thread.
//!    Enforced in: `SocketPoll::run_once` (sole call site), owner asserts in
//!    `StreamSocket`.
//! 2. A `poll(2)` failure other than `EINTR` is logged and treated as Closed
//!    for that iteration; the loop itself survives until [`SocketPoll::stop`].
//! 3. Wakeup is async-signal-safe: write-ends live in a fixed atomic table
//!    and [`wakeup_all`] touches nothing else.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use crate::socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};

/// Upper bound on one poll sleep; handlers only ever shrink this.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide table of wakeup pipe write-ends, indexed by registration
/// slot. Written with plain stores so a signal handler can walk it.
const WAKEUP_SLOTS: usize = 64;
static WAKEUP_FDS: [AtomicI32; WAKEUP_SLOTS] = [const { AtomicI32::new(-1) }; WAKEUP_SLOTS];

/// Wake every poll in the process. Safe to call from a signal handler.
pub fn wakeup_all() {
	for slot in &WAKEUP_FDS {
		let fd = slot.load(Ordering::Relaxed);
		if fd >= 0 {
			// Best effort; a full pipe already guarantees a wakeup.
			unsafe { libc::write(fd, [1u8].as_ptr().cast(), 1) };
		}
	}
}

type Callback = Box<dyn FnOnce() + Send>;

struct PollEntry {
	stream: StreamSocket,
	handler: Box<dyn SocketHandler>,
}

#[derive(Default)]
struct Shared {
	pending: Vec<PollEntry>,
	callbacks: Vec<Callback>,
}

/// One cooperative event loop. Create with [`SocketPoll::new`], populate via
/// [`SocketPoll::insert_socket`], and either call [`SocketPoll::start_thread`]
/// or drive [`SocketPoll::run`] on a thread you own.
pub struct SocketPoll {
	name: String,
	shared: Mutex<Shared>,
	wake_read: OwnedFd,
	wake_write: OwnedFd,
	wake_slot: usize,
	running: AtomicBool,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketPoll {
	/// Create a poll runtime. It is not running yet.
	pub fn new(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
		let (wake_read, wake_write) =
			nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC)?;

		let raw = wake_write.as_raw_fd();
		let mut wake_slot = usize::MAX;
		for (i, slot) in WAKEUP_FDS.iter().enumerate() {
			if slot
				.compare_exchange(-1, raw, Ordering::Relaxed, Ordering::Relaxed)
				.is_ok()
			{
				wake_slot = i;
				break;
			}
		}

		Ok(Arc::new(Self {
			name: name.into(),
			shared: Mutex::new(Shared::default()),
			wake_read,
			wake_write,
			wake_slot,
			running: AtomicBool::new(false),
			thread: Mutex::new(None),
		}))
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Spawn the dedicated loop thread. Idempotent.
	pub fn start_thread(self: &Arc<Self>) {
		let mut guard = self.thread.lock();
		if guard.is_some() {
			return;
		}
		let this = Arc::clone(self);
		let name = format!("poll-{}", self.name);
		let handle = std::thread::Builder::new()
			.name(name)
			.spawn(move || this.run())
			.expect("spawning poll thread");
		*guard = Some(handle);
	}

	/// Request loop exit after the current iteration and join the thread if
	/// one was started. Safe to call from the loop thread itself, which
	/// cannot join and simply lets the loop unwind.
	pub fn stop(&self) {
		self.running.store(false, Ordering::Release);
		self.wakeup();
		if let Some(handle) = self.thread.lock().take() {
			if handle.thread().id() == std::thread::current().id() {
				return;
			}
			let _ = handle.join();
		}
	}

	/// Whether the loop has been asked to keep running.
	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// Hand a socket and its handler to this poll. Callable from any thread;
	/// the loop adopts the socket at its next wakeup.
	pub fn insert_socket(&self, stream: StreamSocket, handler: Box<dyn SocketHandler>) {
		self.shared.lock().pending.push(PollEntry { stream, handler });
		self.wakeup();
	}

	/// Run `callback` inside the loop thread at the next wakeup.
	pub fn post_callback(&self, callback: impl FnOnce() + Send + 'static) {
		self.shared.lock().callbacks.push(Box::new(callback));
		self.wakeup();
	}

	/// Prompt the loop to return from `poll(2)`.
	pub fn wakeup(&self) {
		unsafe { libc::write(self.wake_write.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
	}

	/// The loop body. Runs until [`SocketPoll::stop`].
	pub fn run(self: &Arc<Self>) {
		self.running.store(true, Ordering::Release);
		tracing::debug!(poll = %self.name, "poll loop starting");
		let mut sockets: Vec<PollEntry> = Vec::new();
		while self.is_running() {
			self.run_once(&mut sockets);
		}
		for mut entry in sockets.drain(..) {
			entry.handler.on_disconnect(&mut entry.stream);
		}
		tracing::debug!(poll = %self.name, "poll loop finished");
	}

	fn run_once(self: &Arc<Self>, sockets: &mut Vec<PollEntry>) {
		let now = Instant::now();
		let mut timeout = MAX_POLL_TIMEOUT;

		// Ask every handler what it wants and let it shrink the timeout.
		let mut interests = Vec::with_capacity(sockets.len());
		for entry in sockets.iter_mut() {
			interests.push(entry.handler.poll_events(now, &mut timeout));
		}

		let revents = {
			let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(sockets.len() + 1);
			for (entry, interest) in sockets.iter().zip(&interests) {
				let mut flags = PollFlags::empty();
				if interest.contains(Interest::READ) {
					flags |= PollFlags::POLLIN;
				}
				if interest.contains(Interest::WRITE) || entry.stream.wants_write() {
					flags |= PollFlags::POLLOUT;
				}
				fds.push(PollFd::new(
					unsafe {
						std::os::fd::BorrowedFd::borrow_raw(entry.stream.raw_fd())
					},
					flags,
				));
			}
			fds.push(PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN));

			let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
			loop {
				match nix::poll::poll(
					&mut fds,
					PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX),
				) {
					Ok(_) => break,
					Err(nix::errno::Errno::EINTR) => {
						if !self.is_running() {
							return;
						}
					}
					Err(e) => {
						tracing::warn!(poll = %self.name, error = %e, "poll failed");
						break;
					}
				}
			}

			fds.iter()
				.map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
				.collect::<Vec<_>>()
		};

		// Drain the wakeup pipe.
		if revents[sockets.len()].intersects(PollFlags::POLLIN) {
			let mut sink = [0u8; 128];
			while matches!(nix::unistd::read(self.wake_read.as_fd(), &mut sink), Ok(n) if n > 0) {}
		}

		let now = Instant::now();
		let mut moves: Vec<(usize, Box<dyn FnOnce(StreamSocket) + Send>)> = Vec::new();
		let mut closed: Vec<usize> = Vec::new();

		for (i, entry) in sockets.iter_mut().enumerate() {
			let events = revents[i];
			let mut disposition = SocketDisposition::Continue;

			if events.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
				entry.handler.on_disconnect(&mut entry.stream);
				closed.push(i);
				continue;
			}

			if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
				&& entry.stream.is_listener()
			{
				disposition = entry.handler.on_readable(&mut entry.stream);
			} else if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
				match entry.stream.read_ready() {
					Ok(_) => {
						if !entry.stream.in_buffer().is_empty() {
							disposition = entry.handler.on_readable(&mut entry.stream);
						}
						if entry.stream.is_closed()
							&& matches!(disposition, SocketDisposition::Continue)
						{
							entry.handler.on_disconnect(&mut entry.stream);
							disposition = SocketDisposition::Closed;
						}
					}
					Err(e) => {
						tracing::debug!(poll = %self.name, fd = entry.stream.raw_fd(), error = %e, "read failed");
						entry.handler.on_disconnect(&mut entry.stream);
						disposition = SocketDisposition::Closed;
					}
				}
			}

			if matches!(disposition, SocketDisposition::Continue)
				&& events.intersects(PollFlags::POLLOUT)
			{
				if let Err(e) = entry.stream.flush() {
					tracing::debug!(poll = %self.name, fd = entry.stream.raw_fd(), error = %e, "write failed");
					entry.handler.on_disconnect(&mut entry.stream);
					disposition = SocketDisposition::Closed;
				} else {
					disposition = entry.handler.on_writable(&mut entry.stream);
				}
			}

			if matches!(disposition, SocketDisposition::Continue) {
				disposition = entry.handler.on_timeout(&mut entry.stream, now);
			}

			// Opportunistic flush so handler output does not wait a cycle.
			if matches!(disposition, SocketDisposition::Continue) && entry.stream.wants_write() {
				if let Err(e) = entry.stream.flush() {
					tracing::debug!(poll = %self.name, fd = entry.stream.raw_fd(), error = %e, "write failed");
					entry.handler.on_disconnect(&mut entry.stream);
					disposition = SocketDisposition::Closed;
				}
			}

			match disposition {
				SocketDisposition::Continue => {}
				SocketDisposition::Closed => closed.push(i),
				SocketDisposition::Move(transfer) => moves.push((i, transfer)),
			}
		}

		// Remove closed and moved sockets, highest index first so the
		// remaining indices stay valid.
		let mut removals: Vec<(usize, Option<Box<dyn FnOnce(StreamSocket) + Send>>)> = closed
			.into_iter()
			.map(|i| (i, None))
			.chain(moves.into_iter().map(|(i, t)| (i, Some(t))))
			.collect();
		removals.sort_by(|a, b| b.0.cmp(&a.0));
		for (i, transfer) in removals {
			let mut entry = sockets.remove(i);
			if let Some(transfer) = transfer {
				entry.stream.clear_owner();
				transfer(entry.stream);
			}
		}

		// Splice in sockets and callbacks queued since the last iteration.
		let (pending, callbacks) = {
			let mut shared = self.shared.lock();
			(
				std::mem::take(&mut shared.pending),
				std::mem::take(&mut shared.callbacks),
			)
		};
		for mut entry in pending {
			entry.stream.set_owner(std::thread::current().id());
			tracing::trace!(poll = %self.name, fd = entry.stream.raw_fd(), "socket adopted");
			// Input carried over from a previous owner must not wait for
			// fresh traffic to be seen.
			if !entry.stream.in_buffer().is_empty() {
				match entry.handler.on_readable(&mut entry.stream) {
					SocketDisposition::Continue => sockets.push(entry),
					SocketDisposition::Closed => {}
					SocketDisposition::Move(transfer) => {
						entry.stream.clear_owner();
						transfer(entry.stream);
					}
				}
			} else {
				sockets.push(entry);
			}
		}
		for callback in callbacks {
			callback();
		}
	}
}

impl Drop for SocketPoll {
	fn drop(&mut self) {
		if self.wake_slot < WAKEUP_SLOTS {
			WAKEUP_FDS[self.wake_slot].store(-1, Ordering::Relaxed);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct Echo;

	impl SocketHandler for Echo {
		fn poll_events(&mut self, _now: Instant, _timeout: &mut Duration) -> Interest {
			Interest::READ
		}

		fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
			let data = socket.take_input();
			socket.send(&data);
			SocketDisposition::Continue
		}
	}

	fn unix_pair() -> (StreamSocket, std::os::unix::net::UnixStream) {
		let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
		(StreamSocket::from_fd(a.into()).unwrap(), b)
	}

	#[test]
	fn echoes_across_the_loop() {
		use std::io::{Read, Write};

		let poll = SocketPoll::new("test").unwrap();
		let (server, mut client) = unix_pair();
		poll.insert_socket(server, Box::new(Echo));
		poll.start_thread();

		client.write_all(b"hello").unwrap();
		let mut buf = [0u8; 5];
		client.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"hello");

		poll.stop();
	}

	#[test]
	fn callbacks_run_on_the_loop_thread() {
		let poll = SocketPoll::new("cb").unwrap();
		poll.start_thread();

		static HITS: AtomicUsize = AtomicUsize::new(0);
		poll.post_callback(|| {
			HITS.fetch_add(1, Ordering::SeqCst);
		});

		let deadline = Instant::now() + Duration::from_secs(2);
		while HITS.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(5));
		}
		assert_eq!(HITS.load(Ordering::SeqCst), 1);
		poll.stop();
	}

	#[test]
	fn move_transfers_ownership() {
		use std::io::{Read, Write};

		struct MoveOnce {
			target: Arc<SocketPoll>,
		}

		impl SocketHandler for MoveOnce {
			fn poll_events(&mut self, _now: Instant, _timeout: &mut Duration) -> Interest {
				Interest::READ
			}

			fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
				// Leave the input for the adopting handler.
				let _ = socket;
				let target = Arc::clone(&self.target);
				SocketDisposition::Move(Box::new(move |stream| {
					target.insert_socket(stream, Box::new(Echo));
				}))
			}
		}

		let source = SocketPoll::new("source").unwrap();
		let target = SocketPoll::new("target").unwrap();
		source.start_thread();
		target.start_thread();

		let (server, mut client) = unix_pair();
		source.insert_socket(
			server,
			Box::new(MoveOnce {
				target: Arc::clone(&target),
			}),
		);

		client.write_all(b"ping!").unwrap();
		let mut buf = [0u8; 5];
		client.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"ping!");

		source.stop();
		target.stop();
	}
}
