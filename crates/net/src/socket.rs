//! Buffered non-blocking stream sockets and the handler seam.
//!
//! A [`StreamSocket`] is a file descriptor plus its read and write buffers
//! and an owner-thread marker. All protocol logic lives behind the
//! [`SocketHandler`] trait; the poll loop performs the raw reads and writes
//! and hands buffered bytes to the handler. Handlers never block.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::tls::TlsSession;

bitflags! {
	/// Events a handler wants the next poll iteration to watch.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Interest: u8 {
		const READ = 0b01;
		const WRITE = 0b10;
	}
}

/// What the loop should do with a socket after a handler callback.
pub enum SocketDisposition {
	/// Keep the socket in this poll.
	Continue,
	/// Remove the socket and close the descriptor.
	Closed,
	/// Remove the socket from this poll without closing it and hand it to
	/// the callback, which typically re-inserts it into another poll with a
	/// fresh handler. The callback runs on this poll's thread after the
	/// current iteration.
	Move(Box<dyn FnOnce(StreamSocket) + Send>),
}

/// Protocol logic attached to one socket.
///
/// Callbacks are only ever invoked on the owning poll's thread.
pub trait SocketHandler: Send {
	/// Report poll interest and reduce `timeout` to express a deadline.
	fn poll_events(&mut self, now: Instant, timeout: &mut Duration) -> Interest;

	/// Buffered input is available in `socket.in_buffer()`.
	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition;

	/// The socket became writable and buffered output was flushed.
	fn on_writable(&mut self, _socket: &mut StreamSocket) -> SocketDisposition {
		SocketDisposition::Continue
	}

	/// Called every iteration after event handling with the current time.
	fn on_timeout(&mut self, _socket: &mut StreamSocket, _now: Instant) -> SocketDisposition {
		SocketDisposition::Continue
	}

	/// The peer closed or the descriptor errored; the socket is about to go.
	fn on_disconnect(&mut self, _socket: &mut StreamSocket) {}
}

/// A non-blocking stream socket with read/write buffering.
pub struct StreamSocket {
	fd: OwnedFd,
	in_buffer: Vec<u8>,
	out_buffer: Vec<u8>,
	tls: Option<TlsSession>,
	owner: Option<ThreadId>,
	closed: bool,
	listener: bool,
}

impl StreamSocket {
	/// Wrap an already-connected descriptor. The descriptor is switched to
	/// non-blocking mode.
	pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
		set_nonblocking(&fd)?;
		Ok(Self {
			fd,
			in_buffer: Vec::new(),
			out_buffer: Vec::new(),
			tls: None,
			owner: None,
			closed: false,
			listener: false,
		})
	}

	/// Wrap a listening descriptor. The poll delivers readability straight
	/// to the handler (which accepts) instead of reading from the fd.
	pub fn listener(fd: OwnedFd) -> io::Result<Self> {
		let mut socket = Self::from_fd(fd)?;
		socket.listener = true;
		Ok(socket)
	}

	/// Whether this is a listening socket.
	#[must_use]
	pub fn is_listener(&self) -> bool {
		self.listener
	}

	/// Layer a TLS session over the descriptor. Existing buffered plaintext
	/// is preserved; subsequent reads and writes pass through the session.
	pub fn start_tls(&mut self, session: TlsSession) {
		self.tls = Some(session);
	}

	#[must_use]
	pub fn raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}

	/// Record the thread that owns this socket from now on.
	pub(crate) fn set_owner(&mut self, owner: ThreadId) {
		self.owner = Some(owner);
	}

	pub(crate) fn assert_owner(&self) {
		debug_assert!(
			self.owner.is_none() || self.owner == Some(std::thread::current().id()),
			"socket #{} used off its owning thread",
			self.fd.as_raw_fd()
		);
	}

	/// Clear the owner marker ahead of a move to another poll.
	pub(crate) fn clear_owner(&mut self) {
		self.owner = None;
	}

	/// Bytes received and not yet consumed by the handler.
	#[must_use]
	pub fn in_buffer(&self) -> &[u8] {
		&self.in_buffer
	}

	/// Drop `n` consumed bytes from the front of the input buffer.
	pub fn discard_input(&mut self, n: usize) {
		self.in_buffer.drain(..n);
	}

	/// Take the entire input buffer.
	pub fn take_input(&mut self) -> Vec<u8> {
		std::mem::take(&mut self.in_buffer)
	}

	/// Queue bytes for sending. Actual writes happen when the descriptor is
	/// writable.
	pub fn send(&mut self, data: &[u8]) {
		self.assert_owner();
		self.out_buffer.extend_from_slice(data);
	}

	/// Whether buffered or TLS-internal output is pending.
	#[must_use]
	pub fn wants_write(&self) -> bool {
		!self.out_buffer.is_empty() || self.tls.as_ref().is_some_and(TlsSession::wants_write)
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed
	}

	/// Pull available bytes from the descriptor into the input buffer.
	///
	/// Returns the number of plaintext bytes added; `Ok(0)` after the call
	/// means no progress (not EOF — EOF marks the socket closed).
	pub(crate) fn read_ready(&mut self) -> io::Result<usize> {
		self.assert_owner();
		if let Some(tls) = self.tls.as_mut() {
			let n = tls.read_ready(&self.fd, &mut self.in_buffer)?;
			if tls.is_eof() {
				self.closed = true;
			}
			return Ok(n);
		}

		let mut total = 0;
		let mut chunk = [0u8; 16 * 1024];
		loop {
			match nix::unistd::read(self.fd.as_fd(), &mut chunk) {
				Ok(0) => {
					self.closed = true;
					break;
				}
				Ok(n) => {
					self.in_buffer.extend_from_slice(&chunk[..n]);
					total += n;
				}
				Err(nix::errno::Errno::EAGAIN) => break,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Ok(total)
	}

	/// Flush as much buffered output as the descriptor accepts.
	pub(crate) fn flush(&mut self) -> io::Result<()> {
		self.assert_owner();
		if let Some(tls) = self.tls.as_mut() {
			return tls.flush(&self.fd, &mut self.out_buffer);
		}

		while !self.out_buffer.is_empty() {
			match nix::unistd::write(self.fd.as_fd(), &self.out_buffer) {
				Ok(0) => break,
				Ok(n) => {
					self.out_buffer.drain(..n);
				}
				Err(nix::errno::Errno::EAGAIN) => break,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}

impl std::fmt::Debug for StreamSocket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamSocket")
			.field("fd", &self.fd.as_raw_fd())
			.field("in", &self.in_buffer.len())
			.field("out", &self.out_buffer.len())
			.field("tls", &self.tls.is_some())
			.field("closed", &self.closed)
			.finish()
	}
}

pub(crate) fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
	use nix::fcntl::{FcntlArg, OFlag, fcntl};
	let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
	let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
	fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
	Ok(())
}
