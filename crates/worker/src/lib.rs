//! Worker-side runtime: the spawner that pre-initialises and forks, the
//! sandbox lockdown each fork applies, and the per-document message loop
//! that drives the render library.
//!
//! One binary plays both roles. It starts as the Spawner — a single-threaded
//! privileged factory controlled by the gateway over an inherited pipe —
//! and each forked child becomes a Worker: it connects back to the gateway,
//! announces its jail, locks itself down (chroot, capability drop, seccomp),
//! and then serves exactly one document until told to exit.

pub mod main_loop;
pub mod render;
pub mod sandbox;
pub mod seccomp;
pub mod spawner;

pub use render::{Preloaded, RenderBackend, StubBackend};
pub use sandbox::{RlimitSettings, have_required_capabilities};
pub use spawner::Spawner;
