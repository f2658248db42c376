//! Kernel syscall filtering for workers.
//!
//! After the fork and the capability drop, and before any document-derived
//! code runs, the worker installs a classic BPF seccomp program: verify the
//! audit architecture, fast-path the hot syscalls, trap a deny list of
//! calls no renderer has any business making, and allow the rest. A trapped
//! call raises `SIGSYS`; the handler logs the syscall number with
//! async-signal-safe writes only and exits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeccompError {
	#[error("seccomp filtering unsupported on this architecture")]
	Unsupported,
	#[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
	NoNewPrivs(std::io::Error),
	#[error("installing the seccomp filter failed: {0}")]
	Install(std::io::Error),
}

// Offsets into `struct seccomp_data`.
#[cfg(target_arch = "x86_64")]
const SECCOMP_DATA_NR: u32 = 0;
#[cfg(target_arch = "x86_64")]
const SECCOMP_DATA_ARCH: u32 = 4;

// `libc` does not expose the `AUDIT_ARCH_*` constants from <linux/audit.h>.
// This is the fixed kernel ABI value for x86_64 (EM_X86_64 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE).
#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xC000_003E;

/// Syscalls allowed by the fast path before the deny list is consulted.
#[cfg(target_arch = "x86_64")]
const ALLOW: &[libc::c_long] = &[
	libc::SYS_recvfrom,
	libc::SYS_write,
	libc::SYS_futex,
	// poll(2) in glibc answers for this lot.
	libc::SYS_epoll_wait,
	libc::SYS_epoll_ctl,
	libc::SYS_epoll_create,
	libc::SYS_close,
	libc::SYS_nanosleep,
];

/// Syscalls that trap. Everything a contained renderer must never do:
/// process control and tracing, server sockets, mounts and root changes,
/// kernel facilities, and installing further filters.
#[cfg(target_arch = "x86_64")]
const DENY: &[libc::c_long] = &[
	libc::SYS_getitimer,
	libc::SYS_setitimer,
	libc::SYS_sendfile,
	libc::SYS_shutdown,
	libc::SYS_listen,
	libc::SYS_accept,
	libc::SYS_kill,
	libc::SYS_shmctl,
	libc::SYS_ptrace,
	libc::SYS_capset,
	libc::SYS_uselib,
	libc::SYS_personality,
	libc::SYS_vhangup,
	libc::SYS_modify_ldt,
	libc::SYS_pivot_root,
	libc::SYS_chroot,
	libc::SYS_acct,
	libc::SYS_sync,
	libc::SYS_mount,
	libc::SYS_umount2,
	libc::SYS_swapon,
	libc::SYS_swapoff,
	libc::SYS_reboot,
	libc::SYS_sethostname,
	libc::SYS_setdomainname,
	libc::SYS_tkill,
	libc::SYS_mbind,
	libc::SYS_set_mempolicy,
	libc::SYS_get_mempolicy,
	libc::SYS_kexec_load,
	libc::SYS_add_key,
	libc::SYS_request_key,
	libc::SYS_keyctl,
	libc::SYS_inotify_init,
	libc::SYS_inotify_add_watch,
	libc::SYS_inotify_rm_watch,
	libc::SYS_unshare,
	libc::SYS_splice,
	libc::SYS_tee,
	libc::SYS_vmsplice,
	libc::SYS_move_pages,
	libc::SYS_accept4,
	libc::SYS_inotify_init1,
	libc::SYS_perf_event_open,
	libc::SYS_fanotify_init,
	libc::SYS_fanotify_mark,
	// No further fiddling with filters.
	libc::SYS_seccomp,
	libc::SYS_bpf,
];

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
	libc::sock_filter {
		code,
		jt: 0,
		jf: 0,
		k,
	}
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
	libc::sock_filter { code, jt, jf, k }
}

#[cfg(target_arch = "x86_64")]
const LD_ABS: u16 = (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16;
#[cfg(target_arch = "x86_64")]
const JEQ: u16 = (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16;
#[cfg(target_arch = "x86_64")]
const RET: u16 = (libc::BPF_RET | libc::BPF_K) as u16;

/// Build the filter program.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub fn build_filter() -> Vec<libc::sock_filter> {
	let mut program = Vec::with_capacity(4 + 2 * (ALLOW.len() + DENY.len()) + 1);

	// Wrong architecture means wrong syscall numbering: kill outright.
	program.push(stmt(LD_ABS, SECCOMP_DATA_ARCH));
	program.push(jump(JEQ, AUDIT_ARCH, 1, 0));
	program.push(stmt(RET, libc::SECCOMP_RET_KILL_PROCESS));

	program.push(stmt(LD_ABS, SECCOMP_DATA_NR));
	for nr in ALLOW {
		program.push(jump(JEQ, *nr as u32, 0, 1));
		program.push(stmt(RET, libc::SECCOMP_RET_ALLOW));
	}
	for nr in DENY {
		program.push(jump(JEQ, *nr as u32, 0, 1));
		program.push(stmt(RET, libc::SECCOMP_RET_TRAP));
	}

	// Anything in neither list is allowed.
	program.push(stmt(RET, libc::SECCOMP_RET_ALLOW));
	program
}

/// Install the filter and the SIGSYS trap handler.
///
/// No-new-privs is set first so setuid binaries reached through execve stay
/// inside the filter. Once installed, the filter cannot be replaced: the
/// `seccomp` and `bpf` syscalls themselves are on the deny list.
#[cfg(target_arch = "x86_64")]
pub fn lockdown() -> Result<(), SeccompError> {
	let mut program = build_filter();
	let prog = libc::sock_fprog {
		len: program.len() as u16,
		filter: program.as_mut_ptr(),
	};

	unsafe {
		if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
			return Err(SeccompError::NoNewPrivs(std::io::Error::last_os_error()));
		}
		if libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog) != 0 {
			return Err(SeccompError::Install(std::io::Error::last_os_error()));
		}

		let mut action: libc::sigaction = std::mem::zeroed();
		action.sa_flags = libc::SA_SIGINFO;
		action.sa_sigaction = trap_handler as usize;
		libc::sigemptyset(&raw mut action.sa_mask);
		libc::sigaction(libc::SIGSYS, &action, std::ptr::null_mut());
	}
	Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
pub fn lockdown() -> Result<(), SeccompError> {
	Err(SeccompError::Unsupported)
}

/// `si_code` value for a seccomp-raised SIGSYS.
#[cfg(target_arch = "x86_64")]
const SYS_SECCOMP: libc::c_int = 1;

/// The SIGSYS slice of the siginfo union on 64-bit Linux; libc does not
/// expose `si_syscall` directly.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
struct SigsysInfo {
	si_signo: libc::c_int,
	si_errno: libc::c_int,
	si_code: libc::c_int,
	_pad: libc::c_int,
	call_addr: *mut libc::c_void,
	syscall: libc::c_int,
	arch: libc::c_uint,
}

/// SIGSYS handler. Async-signal-safe only: raw writes to stderr, then
/// `_exit`; no allocation, no locks, no tracing.
#[cfg(target_arch = "x86_64")]
extern "C" fn trap_handler(
	_signal: libc::c_int,
	info: *mut libc::siginfo_t,
	_context: *mut libc::c_void,
) {
	unsafe {
		if !info.is_null() && (*info).si_code == SYS_SECCOMP {
			const PREFIX: &[u8] = b"seccomp: un-authorized syscall ";
			let _ = libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());

			let nr = (*info.cast::<SigsysInfo>()).syscall;
			let mut digits = [0u8; 12];
			let mut n = nr.unsigned_abs();
			let mut at = digits.len();
			loop {
				at -= 1;
				digits[at] = b'0' + (n % 10) as u8;
				n /= 10;
				if n == 0 {
					break;
				}
			}
			let _ = libc::write(2, digits[at..].as_ptr().cast(), digits.len() - at);
			let _ = libc::write(2, b"\n".as_ptr().cast(), 1);
		}
		libc::_exit(1);
	}
}
