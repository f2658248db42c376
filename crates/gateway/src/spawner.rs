//! Spawner process control.
//!
//! The gateway talks to the long-lived spawner over a unix socketpair with a
//! newline-terminated text protocol: `spawn <n>`, `setconfig <rlimit>
//! <value>`, and `exit` go down; `segfaultcount <n>` comes back up. The
//! launcher trait lets tests substitute in-process fake workers for the real
//! fork machinery.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quill_net::socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};
use quill_net::SocketPoll;

/// Descriptor number the spawner child finds its control channel on.
pub const SPAWNER_CONTROL_FD: i32 = 3;

/// Source of fresh workers. Production asks the spawner to fork; tests wire
/// up in-process fakes.
pub trait WorkerLauncher: Send + Sync + 'static {
	/// Ask for `count` more workers to be produced and connect back.
	fn request_workers(&self, count: u32);
}

/// Counters surfaced for admin visibility.
#[derive(Debug, Default)]
pub struct AdminCounters {
	/// SIGSEGV/SIGBUS worker exits reported by the spawner.
	pub segfaults: AtomicU64,
	/// Workers spawned over the process lifetime.
	pub workers_spawned: AtomicU64,
}

/// Handle to the running spawner process and its control channel.
pub struct SpawnerControl {
	child: Mutex<Option<Child>>,
	outbound: Arc<Mutex<String>>,
	poll: Arc<SocketPoll>,
	pub counters: Arc<AdminCounters>,
}

impl SpawnerControl {
	/// Launch the spawner binary and put its control socket on `poll`.
	///
	/// `master_socket` is where forked workers connect back; `no_sandbox`
	/// propagates the debug no-capabilities mode.
	pub fn launch(
		poll: &Arc<SocketPoll>,
		binary: &Path,
		config_path: Option<&Path>,
		master_socket: &Path,
		no_sandbox: bool,
	) -> io::Result<Arc<Self>> {
		let (ours, theirs) = UnixStream::pair()?;

		let mut command = Command::new(binary);
		command
			.arg("--master")
			.arg(master_socket)
			.arg("--control-fd")
			.arg(SPAWNER_CONTROL_FD.to_string());
		if let Some(config) = config_path {
			command.arg("--config").arg(config);
		}
		if no_sandbox {
			command.arg("--no-sandbox");
		}

		let theirs_fd = theirs.as_raw_fd();
		unsafe {
			command.pre_exec(move || {
				// The pair is CLOEXEC; give the child a stable descriptor.
				if libc::dup2(theirs_fd, SPAWNER_CONTROL_FD) < 0 {
					return Err(io::Error::last_os_error());
				}
				Ok(())
			});
		}
		let child = command.spawn()?;
		drop(theirs);
		tracing::info!(pid = child.id(), "spawner launched");

		let counters = Arc::new(AdminCounters::default());
		let outbound = Arc::new(Mutex::new(String::new()));
		let control = Arc::new(Self {
			child: Mutex::new(Some(child)),
			outbound: Arc::clone(&outbound),
			poll: Arc::clone(poll),
			counters: Arc::clone(&counters),
		});

		let socket = StreamSocket::from_fd(ours.into())?;
		poll.insert_socket(
			socket,
			Box::new(SpawnerChannel {
				outbound,
				counters,
				line: String::new(),
			}),
		);
		Ok(control)
	}

	/// Queue a control line for the spawner.
	pub fn send_line(&self, line: &str) {
		let mut outbound = self.outbound.lock();
		outbound.push_str(line);
		outbound.push('\n');
		drop(outbound);
		self.poll.wakeup();
	}

	/// Forward an rlimit to apply to future workers.
	pub fn set_rlimit(&self, name: &str, value: u64) {
		self.send_line(&format!("setconfig {name} {value}"));
	}

	/// Ask the spawner to exit, then reap it (bounded wait).
	pub fn shutdown(&self) {
		self.send_line("exit");
		let Some(mut child) = self.child.lock().take() else {
			self.poll.stop();
			return;
		};
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			match child.try_wait() {
				Ok(Some(status)) => {
					tracing::info!(%status, "spawner exited");
					break;
				}
				Ok(None) if Instant::now() < deadline => {
					std::thread::sleep(Duration::from_millis(50));
				}
				_ => {
					tracing::warn!("spawner did not exit, killing");
					let _ = child.kill();
					let _ = child.wait();
					break;
				}
			}
		}
		self.poll.stop();
	}
}

impl WorkerLauncher for SpawnerControl {
	fn request_workers(&self, count: u32) {
		self.counters
			.workers_spawned
			.fetch_add(u64::from(count), Ordering::Relaxed);
		self.send_line(&format!("spawn {count}"));
	}
}

/// Socket handler for the gateway side of the control channel.
struct SpawnerChannel {
	outbound: Arc<Mutex<String>>,
	counters: Arc<AdminCounters>,
	line: String,
}

impl SpawnerChannel {
	fn handle_line(&self, line: &str) {
		let mut tokens = line.split_whitespace();
		match (tokens.next(), tokens.next()) {
			(Some("segfaultcount"), Some(n)) => {
				if let Ok(n) = n.parse::<u64>() {
					tracing::warn!(count = n, "worker segfaults reported");
					self.counters.segfaults.fetch_add(n, Ordering::Relaxed);
				}
			}
			(Some(other), _) => {
				tracing::warn!(command = other, "unknown spawner event");
			}
			(None, _) => {}
		}
	}
}

impl SocketHandler for SpawnerChannel {
	fn poll_events(&mut self, _now: Instant, _timeout: &mut Duration) -> Interest {
		let mut interest = Interest::READ;
		if !self.outbound.lock().is_empty() {
			interest |= Interest::WRITE;
		}
		interest
	}

	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
		let input = socket.take_input();
		self.line.push_str(&String::from_utf8_lossy(&input));
		while let Some(pos) = self.line.find('\n') {
			let line: String = self.line.drain(..=pos).collect();
			self.handle_line(line.trim_end());
		}
		SocketDisposition::Continue
	}

	fn on_timeout(&mut self, socket: &mut StreamSocket, _now: Instant) -> SocketDisposition {
		let pending = std::mem::take(&mut *self.outbound.lock());
		if !pending.is_empty() {
			socket.send(pending.as_bytes());
		}
		SocketDisposition::Continue
	}

	fn on_disconnect(&mut self, _socket: &mut StreamSocket) {
		tracing::error!("spawner control channel lost");
		crate::request_termination();
	}
}
