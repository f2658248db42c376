//! Quill spawner binary. Forked children become workers.
//!
//! Not meant to be run by hand: the gateway launches it with a control
//! descriptor and drives it over the line protocol.

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;

use clap::Parser;
use quill_config::Config;
use tracing::{error, info};

/// Fatal initialisation failure.
const EX_SOFTWARE: i32 = 70;
/// Required capabilities missing; the service can retry after fixing them.
const EX_TEMPFAIL: i32 = 75;

/// Spawner command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quill-workerd")]
#[command(about = "Pre-initialised worker factory; spawned by quill-gatewayd")]
struct Args {
	/// Unix socket where forked workers connect back to the gateway
	#[arg(long, value_name = "PATH")]
	master: PathBuf,

	/// Inherited control descriptor number
	#[arg(long, value_name = "FD", default_value_t = 3)]
	control_fd: i32,

	/// Configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Skip chroot/capability/seccomp lockdown (debug only)
	#[arg(long)]
	no_sandbox: bool,
}

fn main() {
	std::process::exit(run());
}

fn run() -> i32 {
	let args = Args::parse();

	let config = match &args.config {
		Some(path) => match Config::load(path) {
			Ok(config) => config,
			Err(e) => {
				eprintln!("cannot load configuration {}: {e}", path.display());
				return EX_SOFTWARE;
			}
		},
		None => Config::defaults(),
	};

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_new(&config.logging.level)
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
	info!("starting quill-workerd");

	if !args.no_sandbox && !quill_worker::have_required_capabilities() {
		error!("required capabilities missing; run with --no-sandbox only for debugging");
		return EX_TEMPFAIL;
	}

	let control = unsafe { OwnedFd::from_raw_fd(args.control_fd) };
	let mut spawner = match quill_worker::Spawner::new(
		control,
		args.master,
		config.child_root_path.clone(),
		&config.render_library_path,
		args.no_sandbox,
	) {
		Ok(spawner) => spawner,
		Err(e) => {
			error!(error = %e, "spawner initialisation failed");
			return EX_SOFTWARE;
		}
	};

	spawner.run()
}
