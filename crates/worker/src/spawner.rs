//! The spawner: a single-threaded, pre-initialised worker factory.
//!
//! The spawner holds the privileged rights needed to build sandboxes and
//! owns the expensive render-library initialisation, done once before any
//! fork so every worker shares those pages copy-on-write. It speaks a line
//! protocol with the gateway on an inherited descriptor (`spawn <n>`,
//! `setconfig <rlimit> <value>`, `exit`; `segfaultcount <n>` upstream),
//! forks workers on demand, and reaps them, deleting each jail as its
//! worker dies.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::ForkResult;

use crate::render::Preloaded;
use crate::sandbox::{self, RlimitSettings};
use crate::{main_loop, seccomp};

/// Clean-exit code reported by workers told to exit.
const CHILD_EXIT_OK: i32 = 0;
/// Worker exit code for failures before the message loop started.
const CHILD_EXIT_SOFTWARE: i32 = 70;

pub struct Spawner {
	control: OwnedFd,
	master_socket: PathBuf,
	child_root: PathBuf,
	preloaded: Preloaded,
	no_sandbox: bool,
	rlimits: RlimitSettings,
	/// Live children: pid → jail path.
	jails: HashMap<i32, PathBuf>,
	pending_forks: u32,
	line_buf: String,
	terminate: bool,
}

impl Spawner {
	pub fn new(
		control: OwnedFd,
		master_socket: PathBuf,
		child_root: PathBuf,
		render_library: &Path,
		no_sandbox: bool,
	) -> std::io::Result<Self> {
		std::fs::create_dir_all(&child_root)?;
		let preloaded = Preloaded::init(render_library)
			.map_err(|e| std::io::Error::other(e.to_string()))?;
		Ok(Self {
			control,
			master_socket,
			child_root,
			preloaded,
			no_sandbox,
			rlimits: RlimitSettings::default(),
			jails: HashMap::new(),
			pending_forks: 0,
			line_buf: String::new(),
			terminate: false,
		})
	}

	/// The spawner main loop. Returns the process exit code.
	pub fn run(&mut self) -> i32 {
		tracing::info!(
			master = %self.master_socket.display(),
			sandbox = !self.no_sandbox,
			"spawner ready"
		);
		while !self.terminate {
			self.wait_for_commands();
			self.reap_children();
			self.fork_pending();
		}

		// Orderly exit: the gateway tears workers down through their pipes;
		// anything still alive gets a signal and a final reap.
		for pid in self.jails.keys().copied().collect::<Vec<_>>() {
			let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), Signal::SIGTERM);
		}
		self.reap_children();
		tracing::info!("spawner exiting");
		CHILD_EXIT_OK
	}

	fn wait_for_commands(&mut self) {
		let mut fds = [PollFd::new(self.control.as_fd(), PollFlags::POLLIN)];
		match nix::poll::poll(&mut fds, PollTimeout::from(500u16)) {
			Ok(0) => return,
			Ok(_) => {}
			Err(nix::errno::Errno::EINTR) => return,
			Err(e) => {
				tracing::error!(error = %e, "control poll failed");
				self.terminate = true;
				return;
			}
		}

		let mut chunk = [0u8; 4096];
		match nix::unistd::read(self.control.as_fd(), &mut chunk) {
			Ok(0) => {
				tracing::warn!("gateway closed the control pipe without exit");
				self.terminate = true;
			}
			Ok(n) => {
				self.line_buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
				while let Some(pos) = self.line_buf.find('\n') {
					let line: String = self.line_buf.drain(..=pos).collect();
					self.handle_command(line.trim_end());
				}
			}
			Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
			Err(e) => {
				tracing::error!(error = %e, "control read failed");
				self.terminate = true;
			}
		}
	}

	fn handle_command(&mut self, line: &str) {
		let mut tokens = line.split_whitespace();
		match (tokens.next(), tokens.next(), tokens.next()) {
			(Some("spawn"), Some(count), None) => match count.parse::<u32>() {
				Ok(count) if count > 0 => {
					tracing::info!(count, "spawn requested");
					self.pending_forks += count;
				}
				_ => tracing::warn!(count, "unusable spawn count"),
			},
			(Some("setconfig"), Some(name), Some(value)) => {
				match value.parse::<u64>() {
					Ok(value) if self.rlimits.set(name, value) => {
						tracing::info!(name, value, "rlimit recorded for future workers");
					}
					_ => tracing::warn!(name, value, "unknown setconfig"),
				}
			}
			(Some("exit"), ..) => {
				tracing::info!("exit requested by the gateway");
				self.terminate = true;
			}
			(Some(other), ..) => tracing::error!(command = other, "bad control command"),
			(None, ..) => {}
		}
	}

	fn fork_pending(&mut self) {
		// Bounded retries, so a persistently failing fork cannot spin.
		let mut budget = self.pending_forks * 2;
		while self.pending_forks > 0 && budget > 0 {
			budget -= 1;
			if self.spawn_one() {
				self.pending_forks -= 1;
			} else {
				tracing::error!("failed to fork a worker");
			}
		}
		self.pending_forks = 0;
	}

	fn spawn_one(&mut self) -> bool {
		let jail_id = uuid::Uuid::new_v4().simple().to_string();
		match unsafe { nix::unistd::fork() } {
			Ok(ForkResult::Parent { child }) => {
				let jail = self.child_root.join(&jail_id);
				tracing::info!(pid = child.as_raw(), jail = %jail_id, "worker forked");
				self.jails.insert(child.as_raw(), jail);
				true
			}
			Ok(ForkResult::Child) => {
				let code = child_main(
					&self.control,
					&self.master_socket,
					&self.child_root,
					&jail_id,
					&self.preloaded,
					&self.rlimits,
					self.no_sandbox,
				);
				std::process::exit(code);
			}
			Err(e) => {
				tracing::error!(error = %e, "fork failed");
				false
			}
		}
	}

	fn reap_children(&mut self) {
		let mut segfaults = 0u32;
		loop {
			match nix::sys::wait::waitpid(None, Some(WaitPidFlag::WNOHANG)) {
				Ok(WaitStatus::Exited(pid, code)) => {
					tracing::info!(pid = pid.as_raw(), code, "worker exited");
					self.remove_jail(pid.as_raw());
				}
				Ok(WaitStatus::Signaled(pid, signal, _)) => {
					tracing::warn!(pid = pid.as_raw(), %signal, "worker killed by signal");
					if matches!(signal, Signal::SIGSEGV | Signal::SIGBUS) {
						segfaults += 1;
					}
					self.remove_jail(pid.as_raw());
				}
				Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
				Ok(_) => {}
				Err(e) => {
					tracing::warn!(error = %e, "waitpid failed");
					break;
				}
			}
		}

		if segfaults > 0 {
			self.report(&format!("segfaultcount {segfaults}\n"));
		}
	}

	fn remove_jail(&mut self, pid: i32) {
		let Some(jail) = self.jails.remove(&pid) else {
			tracing::warn!(pid, "unknown child reaped");
			return;
		};
		tracing::info!(jail = %jail.display(), "removing jail");
		if let Err(e) = std::fs::remove_dir_all(&jail) {
			// The jail may never have been built if the child died early.
			tracing::debug!(jail = %jail.display(), error = %e, "jail removal failed");
		}
	}

	fn report(&self, line: &str) {
		let mut rest = line.as_bytes();
		while !rest.is_empty() {
			match nix::unistd::write(self.control.as_fd(), rest) {
				Ok(n) => rest = &rest[n..],
				Err(nix::errno::Errno::EINTR) => {}
				Err(e) => {
					tracing::warn!(error = %e, "could not report to the gateway");
					break;
				}
			}
		}
	}
}

/// Everything the forked child does. Never returns control to the spawner's
/// state; the caller exits with the returned code.
fn child_main(
	control: &OwnedFd,
	master_socket: &Path,
	child_root: &Path,
	jail_id: &str,
	preloaded: &Preloaded,
	rlimits: &RlimitSettings,
	no_sandbox: bool,
) -> i32 {
	// The spawner's control channel is not ours to hold.
	unsafe { libc::close(std::os::fd::AsRawFd::as_raw_fd(control)) };

	// Connect home before lockdown; the descriptor survives the chroot.
	let stream = match std::os::unix::net::UnixStream::connect(master_socket) {
		Ok(stream) => stream,
		Err(e) => {
			tracing::error!(error = %e, "worker cannot reach the gateway");
			return CHILD_EXIT_SOFTWARE;
		}
	};

	let jail = match sandbox::build_jail(child_root, jail_id) {
		Ok(jail) => jail,
		Err(e) => {
			tracing::error!(error = %e, "jail construction failed");
			return CHILD_EXIT_SOFTWARE;
		}
	};

	if let Err(e) = rlimits.apply() {
		tracing::error!(error = %e, "rlimit application failed");
		return CHILD_EXIT_SOFTWARE;
	}

	let backend = preloaded.backend();

	if !no_sandbox {
		if let Err(e) = sandbox::enter_jail(&jail) {
			tracing::error!(error = %e, "jail entry failed");
			return CHILD_EXIT_SOFTWARE;
		}
		if let Err(e) = sandbox::drop_capabilities() {
			tracing::error!(error = %e, "capability drop failed");
			return CHILD_EXIT_SOFTWARE;
		}
		if let Err(e) = seccomp::lockdown() {
			tracing::error!(error = %e, "seccomp lockdown failed");
			return CHILD_EXIT_SOFTWARE;
		}
	}

	let stream = match quill_net::StreamSocket::from_fd(stream.into()) {
		Ok(stream) => stream,
		Err(e) => {
			tracing::error!(error = %e, "pipe socket setup failed");
			return CHILD_EXIT_SOFTWARE;
		}
	};
	match main_loop::run(stream, jail_id, !no_sandbox, backend) {
		Ok(()) => CHILD_EXIT_OK,
		Err(e) => {
			tracing::error!(error = %e, "worker loop failed");
			CHILD_EXIT_SOFTWARE
		}
	}
}
