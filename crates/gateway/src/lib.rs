//! The quill gateway: terminates client connections, routes each document to
//! its broker, brokers worker processes from the spawner, and mediates all
//! storage traffic.
//!
//! Process layout: the accept poll owns the TCP listener and every
//! connection still in HTTP; the intake poll owns the worker unix listener
//! and workers parked warm; each broker owns a poll of its own with its
//! sessions, its worker pipe, and its storage exchanges. The only
//! process-wide mutable state is the broker registry, the worker gate, and
//! the termination flag that signal handlers set.

pub mod broker;
pub mod intake;
pub mod registry;
pub mod request;
pub mod server;
pub mod spawner;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use quill_config::Config;
use quill_net::socket::StreamSocket;
use quill_net::{ClientTlsConfig, ServerTlsConfig, SocketPoll};
use quill_proto::DocKey;
use quill_storage::ProofKey;

use broker::DocumentBroker;
use intake::{WorkerGate, WorkerListener};
use registry::{BrokerRegistry, Lookup};
use request::RequestDetails;
use server::ClientListener;
use spawner::{SpawnerControl, WorkerLauncher};

/// Process-wide termination flag. Only signal handlers and fatal paths set
/// it; every loop polls it.
static TERMINATION: AtomicBool = AtomicBool::new(false);

/// Request an orderly shutdown. Async-signal-safe.
pub fn request_termination() {
	TERMINATION.store(true, Ordering::Release);
	quill_net::wakeup_all();
}

#[must_use]
pub fn termination_requested() -> bool {
	TERMINATION.load(Ordering::Acquire)
}

/// Everything the gateway process shares between its polls.
pub struct Gateway {
	config: Arc<Config>,
	registry: Arc<BrokerRegistry>,
	gate: Arc<WorkerGate>,
	accept_poll: Arc<SocketPoll>,
	proof: Option<Arc<ProofKey>>,
	client_tls: Option<ClientTlsConfig>,
	server_tls: Option<ServerTlsConfig>,
	spawner: Option<Arc<SpawnerControl>>,
}

impl Gateway {
	/// Assemble a gateway around an already-running launcher. Used directly
	/// by tests; production goes through [`Gateway::bootstrap`].
	pub fn new(
		config: Arc<Config>,
		launcher: Box<dyn WorkerLauncher>,
		proof: Option<Arc<ProofKey>>,
	) -> std::io::Result<Arc<Self>> {
		Self::assemble(config, launcher, proof, None)
	}

	fn assemble(
		config: Arc<Config>,
		launcher: Box<dyn WorkerLauncher>,
		proof: Option<Arc<ProofKey>>,
		spawner: Option<Arc<SpawnerControl>>,
	) -> std::io::Result<Arc<Self>> {
		let accept_poll = SocketPoll::new("accept")?;
		let intake_poll = SocketPoll::new("worker-intake")?;
		accept_poll.start_thread();
		intake_poll.start_thread();

		let client_tls = match config.ssl.ca_file_path.as_deref() {
			Some(path) => Some(
				quill_net::tls::client_config(Some(path))
					.map_err(|e| std::io::Error::other(e.to_string()))?,
			),
			None => quill_net::tls::client_config(None).ok(),
		};
		let server_tls = if config.ssl.enable {
			Some(
				quill_net::tls::server_config(&config.ssl.cert_file_path, &config.ssl.key_file_path)
					.map_err(|e| std::io::Error::other(e.to_string()))?,
			)
		} else {
			None
		};

		Ok(Arc::new(Self {
			config,
			registry: BrokerRegistry::new(),
			gate: WorkerGate::new(launcher, intake_poll),
			accept_poll,
			proof,
			client_tls,
			server_tls,
			spawner,
		}))
	}

	/// Full production bring-up: spawner process, worker listener, client
	/// listener, prespawned workers.
	pub fn bootstrap(
		config: Arc<Config>,
		config_path: Option<PathBuf>,
		workerd_binary: PathBuf,
		no_sandbox: bool,
	) -> std::io::Result<Arc<Self>> {
		let proof = load_proof(&config);

		// The spawner's control channel lives on its own small poll so a
		// stalled broker can never delay fork requests.
		let control_poll = SocketPoll::new("spawner-control")?;
		control_poll.start_thread();
		let master_socket = config.child_root_path.join("worker.sock");
		std::fs::create_dir_all(&config.child_root_path)?;
		let spawner = SpawnerControl::launch(
			&control_poll,
			&workerd_binary,
			config_path.as_deref(),
			&master_socket,
			no_sandbox,
		)?;

		let launcher: Box<dyn WorkerLauncher> = Box::new(SpawnerHandle(Arc::clone(&spawner)));
		let gateway = Self::assemble(config, launcher, proof, Some(spawner))?;

		let _ = std::fs::remove_file(&master_socket);
		let workers = std::os::unix::net::UnixListener::bind(&master_socket)?;
		let clients = std::net::TcpListener::bind(&gateway.config.net.listen)?;
		tracing::info!(listen = %gateway.config.net.listen, "client listener up");
		gateway.serve_on(clients, workers)?;

		// Keep a few workers warm for instant opens.
		let prespawn = gateway.config.num_prespawn_children.max(1);
		if let Some(spawner) = &gateway.spawner {
			spawner.request_workers(prespawn);
		}

		Ok(gateway)
	}

	/// Put the client and worker listeners under their polls. Split from
	/// [`Gateway::bootstrap`] so tests can serve on ephemeral ports.
	pub fn serve_on(
		self: &Arc<Self>,
		clients: std::net::TcpListener,
		workers: std::os::unix::net::UnixListener,
	) -> std::io::Result<()> {
		let stream = StreamSocket::listener(workers.into())?;
		self.gate
			.intake_poll()
			.insert_socket(stream, Box::new(WorkerListener::new(Arc::clone(&self.gate))));

		let stream = StreamSocket::listener(clients.into())?;
		self.accept_poll
			.insert_socket(stream, Box::new(ClientListener::new(Arc::clone(self))));
		Ok(())
	}

	/// Block until termination is requested, then drain.
	pub fn run(&self) {
		while !termination_requested() {
			std::thread::park_timeout(Duration::from_millis(250));
		}
		tracing::info!("termination requested, draining");
		self.drain();
	}

	/// Shutdown drainage: every broker finishes or reports its in-flight
	/// save within the save timeout; none are silently dropped.
	pub fn drain(&self) {
		let brokers = self.registry.all();
		for broker in &brokers {
			broker.initiate_shutdown();
		}
		let deadline = Instant::now() + self.config.save_timeout() + Duration::from_secs(5);
		while Instant::now() < deadline {
			if brokers.iter().all(|b| b.is_drained()) {
				break;
			}
			std::thread::sleep(Duration::from_millis(100));
		}
		for broker in &brokers {
			if !broker.is_drained() {
				tracing::error!(dockey = %broker.key(), "broker failed to drain in time");
			}
		}
		if let Some(spawner) = &self.spawner {
			spawner.shutdown();
		}
		self.accept_poll.stop();
		self.gate.intake_poll().stop();
	}

	/// Find or create the broker for a document request. `None` means the
	/// server cannot take the session (shutdown, or teardown stuck).
	pub fn broker_for(
		self: &Arc<Self>,
		key: &DocKey,
		details: &RequestDetails,
	) -> Option<Arc<DocumentBroker>> {
		if termination_requested() {
			return None;
		}
		let lookup = self
			.registry
			.find_or_create(key, || {
				DocumentBroker::new(
					key.clone(),
					details.doc_uri.clone(),
					Arc::clone(&self.config),
					self.proof.clone(),
					self.client_tls.clone(),
					Arc::clone(&self.registry),
				)
			})
			.ok()?;
		match lookup {
			Lookup::Existing(broker) => Some(broker),
			Lookup::Created(broker) => {
				self.gate.assign_worker(Arc::clone(&broker));
				Some(broker)
			}
			Lookup::Unavailable => None,
		}
	}

	#[must_use]
	pub fn config(&self) -> &Arc<Config> {
		&self.config
	}

	#[must_use]
	pub fn registry(&self) -> &Arc<BrokerRegistry> {
		&self.registry
	}

	#[must_use]
	pub fn gate(&self) -> &Arc<WorkerGate> {
		&self.gate
	}

	#[must_use]
	pub fn accept_poll(&self) -> &Arc<SocketPoll> {
		&self.accept_poll
	}

	#[must_use]
	pub fn proof(&self) -> Option<Arc<ProofKey>> {
		self.proof.clone()
	}

	#[must_use]
	pub fn server_tls(&self) -> Option<ServerTlsConfig> {
		self.server_tls.clone()
	}

	/// Segfault count reported by the spawner, for admin visibility.
	#[must_use]
	pub fn segfault_count(&self) -> u64 {
		self.spawner
			.as_ref()
			.map_or(0, |s| s.counters.segfaults.load(Ordering::Relaxed))
	}
}

/// Launcher indirection so the gateway does not hold the control struct
/// twice.
struct SpawnerHandle(Arc<SpawnerControl>);

impl WorkerLauncher for SpawnerHandle {
	fn request_workers(&self, count: u32) {
		self.0.request_workers(count);
	}
}

fn load_proof(config: &Config) -> Option<Arc<ProofKey>> {
	let path = config.child_root_path.parent().map_or_else(
		|| PathBuf::from("proof_key"),
		|dir| dir.join("proof_key"),
	);
	match ProofKey::load(&path) {
		Ok(proof) => Some(Arc::new(proof)),
		Err(e) => {
			tracing::warn!(path = %path.display(), error = %e, "no proof key; discovery will omit it");
			None
		}
	}
}
