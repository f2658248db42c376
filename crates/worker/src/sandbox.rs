//! Post-fork lockdown: jail construction, chroot, capability drop, rlimits.
//!
//! The spawner binary itself must start with `CAP_SYS_CHROOT`, `CAP_MKNOD`,
//! and `CAP_FOWNER` effective (checked at startup); forked workers use them
//! to enter their jail and then drop everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
	#[error("building jail {path}: {error}")]
	Jail { path: PathBuf, error: std::io::Error },
	#[error("chroot into {path}: {error}")]
	Chroot { path: PathBuf, error: nix::Error },
	#[error("dropping capabilities: {0}")]
	CapDrop(std::io::Error),
	#[error("setting rlimit {name}: {error}")]
	Rlimit { name: String, error: nix::Error },
}

/// Capabilities the spawner binary needs in its effective set.
pub const REQUIRED_CAPS: &[(u32, &str)] = &[
	(18, "CAP_SYS_CHROOT"),
	(27, "CAP_MKNOD"),
	(3, "CAP_FOWNER"),
];

const CAP_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
	version: u32,
	pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
	effective: u32,
	permitted: u32,
	inheritable: u32,
}

/// Whether `cap` is in this process's effective set.
#[must_use]
pub fn have_capability(cap: u32) -> bool {
	let mut header = CapHeader {
		version: CAP_VERSION_3,
		pid: 0,
	};
	let mut data = [CapData::default(); 2];
	let rc = unsafe {
		libc::syscall(
			libc::SYS_capget,
			&raw mut header,
			data.as_mut_ptr(),
		)
	};
	if rc != 0 {
		return false;
	}
	let word = (cap / 32) as usize;
	word < data.len() && data[word].effective & (1 << (cap % 32)) != 0
}

/// Check the spawner's required capabilities, reporting every missing one.
#[must_use]
pub fn have_required_capabilities() -> bool {
	let mut ok = true;
	for (cap, name) in REQUIRED_CAPS {
		if have_capability(*cap) {
			tracing::debug!(capability = name, "capability present");
		} else {
			tracing::error!(capability = name, "capability missing on the spawner binary");
			ok = false;
		}
	}
	ok
}

/// Build the jail directory skeleton for one worker.
pub fn build_jail(child_root: &Path, jail_id: &str) -> Result<PathBuf, SandboxError> {
	let jail = child_root.join(jail_id);
	for dir in ["user/doc", "tmp"] {
		std::fs::create_dir_all(jail.join(dir)).map_err(|error| SandboxError::Jail {
			path: jail.clone(),
			error,
		})?;
	}
	Ok(jail)
}

/// Enter the jail: chroot and move to its root.
pub fn enter_jail(jail: &Path) -> Result<(), SandboxError> {
	nix::unistd::chroot(jail).map_err(|error| SandboxError::Chroot {
		path: jail.to_path_buf(),
		error,
	})?;
	nix::unistd::chdir("/").map_err(|error| SandboxError::Chroot {
		path: PathBuf::from("/"),
		error,
	})?;
	Ok(())
}

/// Drop every capability: clear the bounding set, then zero the effective,
/// permitted, and inheritable sets.
pub fn drop_capabilities() -> Result<(), SandboxError> {
	unsafe {
		for cap in 0..=63 {
			// EINVAL marks the end of the kernel's capability range.
			if libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) != 0
				&& std::io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL)
			{
				return Err(SandboxError::CapDrop(std::io::Error::last_os_error()));
			}
		}

		let mut header = CapHeader {
			version: CAP_VERSION_3,
			pid: 0,
		};
		let data = [CapData::default(); 2];
		if libc::syscall(libc::SYS_capset, &raw mut header, data.as_ptr()) != 0 {
			return Err(SandboxError::CapDrop(std::io::Error::last_os_error()));
		}
	}
	Ok(())
}

/// Rlimit settings accumulated from `setconfig` commands, applied to each
/// forked worker. A value of zero means unlimited.
#[derive(Debug, Default, Clone)]
pub struct RlimitSettings {
	limits: HashMap<String, u64>,
}

impl RlimitSettings {
	/// Record a limit by its `setconfig` name. Unknown names are rejected.
	pub fn set(&mut self, name: &str, value: u64) -> bool {
		if resource_for(name).is_none() {
			return false;
		}
		self.limits.insert(name.to_string(), value);
		true
	}

	/// Apply everything recorded to the calling process.
	pub fn apply(&self) -> Result<(), SandboxError> {
		for (name, value) in &self.limits {
			let Some(resource) = resource_for(name) else {
				continue;
			};
			let limit = if *value == 0 {
				nix::sys::resource::RLIM_INFINITY
			} else {
				*value
			};
			nix::sys::resource::setrlimit(resource, limit, limit).map_err(|error| {
				SandboxError::Rlimit {
					name: name.clone(),
					error,
				}
			})?;
		}
		Ok(())
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.limits.is_empty()
	}
}

fn resource_for(name: &str) -> Option<nix::sys::resource::Resource> {
	use nix::sys::resource::Resource;
	match name {
		"limit_virt_mem_mb" | "RLIMIT_AS" => Some(Resource::RLIMIT_AS),
		"limit_stack_mem_kb" | "RLIMIT_STACK" => Some(Resource::RLIMIT_STACK),
		"limit_file_size_mb" | "RLIMIT_FSIZE" => Some(Resource::RLIMIT_FSIZE),
		"limit_num_open_files" | "RLIMIT_NOFILE" => Some(Resource::RLIMIT_NOFILE),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn jail_skeleton_is_created() {
		let tmp = tempfile::tempdir().unwrap();
		let jail = build_jail(tmp.path(), "abc123").unwrap();
		assert!(jail.join("user/doc").is_dir());
		assert!(jail.join("tmp").is_dir());
	}

	#[test]
	fn unknown_rlimit_names_are_rejected() {
		let mut settings = RlimitSettings::default();
		assert!(!settings.set("limit_flux_capacitors", 1));
		assert!(settings.set("limit_num_open_files", 1024));
		assert!(!settings.is_empty());
	}

	#[test]
	fn capability_probe_does_not_error() {
		// Whatever the test environment grants, the probe itself must work.
		let _ = have_capability(18);
	}
}
