//! Quill gateway daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use quill_config::Config;
use tracing::{error, info};

/// Fatal initialisation failure.
const EX_SOFTWARE: i32 = 70;

/// Gateway command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quill-gatewayd")]
#[command(about = "Collaborative document-editing gateway")]
struct Args {
	/// Configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Override the listen address from the config
	#[arg(long, value_name = "ADDR")]
	listen: Option<String>,

	/// Path of the spawner/worker binary
	#[arg(long, value_name = "PATH")]
	workerd: Option<PathBuf>,

	/// Run workers without chroot/capability/seccomp lockdown (debug only)
	#[arg(long)]
	no_sandbox: bool,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

extern "C" fn handle_signal(_signal: libc::c_int) {
	quill_gateway::request_termination();
}

fn main() {
	std::process::exit(run());
}

fn run() -> i32 {
	let args = Args::parse();

	let mut config = match &args.config {
		Some(path) => match Config::load(path) {
			Ok(config) => config,
			Err(e) => {
				eprintln!("cannot load configuration {}: {e}", path.display());
				return EX_SOFTWARE;
			}
		},
		None => Config::defaults(),
	};
	if let Some(listen) = args.listen {
		config.net.listen = listen;
	}

	let filter = if args.verbose {
		"debug".to_string()
	} else {
		config.logging.level.clone()
	};
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_new(&filter)
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();
	info!("starting quill-gatewayd");

	unsafe {
		libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
		libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
		libc::signal(libc::SIGPIPE, libc::SIG_IGN);
	}

	let workerd = args.workerd.unwrap_or_else(|| {
		std::env::current_exe()
			.ok()
			.and_then(|exe| exe.parent().map(|dir| dir.join("quill-workerd")))
			.unwrap_or_else(|| PathBuf::from("quill-workerd"))
	});

	let gateway = match quill_gateway::Gateway::bootstrap(
		Arc::new(config),
		args.config,
		workerd,
		args.no_sandbox,
	) {
		Ok(gateway) => gateway,
		Err(e) => {
			error!(error = %e, "gateway initialisation failed");
			return EX_SOFTWARE;
		}
	};

	gateway.run();
	info!("quill-gatewayd exiting");
	0
}
