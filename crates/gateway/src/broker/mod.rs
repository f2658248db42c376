//! Document brokers: per-document traffic hubs between sessions, the worker,
//! and storage.
//!
//! # Purpose
//!
//! - Define the broker that owns one open document: its client sessions, its
//!   sandboxed worker process, its tile cache, and its storage lifecycle.
//! - Describe the Loading → Live → Saving → Dead state machine and the
//!   teardown rules that keep exactly one worker per document key.
//! - Exclude transport concerns (framing, polling) — those live in
//!   `quill-net` — and storage wire details, which live in `quill-storage`.
//!
//! # Mental model
//!
//! - The registry maps document keys to brokers and is the only strong owner
//!   of a broker. A broker is the only strong owner of its sessions and its
//!   worker handle. Sockets are owned by polls; broker code reaches peers
//!   only through per-peer outbound queues.
//! - Every broker has its own poll thread. Session sockets and the worker
//!   pipe are moved onto it after setup, so all broker logic — message
//!   dispatch, storage callbacks, ticks — runs on that one thread. The
//!   state mutex exists for the few cross-thread entry points (session
//!   attach from the accept thread, shutdown drain).
//! - Client messages the broker consumes (load, tiles, save, ping) are
//!   handled in place; everything else is forwarded to the worker wrapped
//!   in a `fromsession` envelope, in per-session FIFO order.
//! - Tile requests never reach the worker twice for the same geometry: the
//!   cache answers repeats, and concurrent misses share one in-flight
//!   render (see [`tiles::TileCache`]).
//!
//! # Key types
//!
//! | Type | Meaning | Constraints |
//! |---|---|---|
//! | [`DocumentBroker`] | One document's state machine | MUST be reachable only via the registry |
//! | [`Phase`] | Lifecycle state | transitions only as the table below allows |
//! | [`ClientSession`](session::ClientSession) | One connected tab | MUST be detached before broker removal |
//! | [`WorkerHandle`](worker::WorkerHandle) | The paired worker process | at most one per broker, ever |
//! | [`tiles::TileCache`] | Bitmap cache + coalescing | one in-flight render per key |
//!
//! # Lifecycle
//!
//! | Phase   | Entered when                          | Exits to                          |
//! |---------|---------------------------------------|-----------------------------------|
//! | Loading | first client connects                 | Live (worker status) / Dead       |
//! | Live    | worker finished loading the document  | Saving, Dead                      |
//! | Saving  | autosave tick / explicit save / exit  | Live (upload settled), Dead       |
//! | Dead    | worker died, or last session gone and | — (registry removal)              |
//! |         | the pending save settled              |                                   |
//!
//! # Invariants
//!
//! 1. At most one live worker exists per document key.
//!    - Enforced in: `BrokerRegistry::find_or_create` (condvar wait on
//!      teardown), `DocumentBroker::attach_worker` (rejects a second worker).
//!    - Failure symptom: two workers render the same document and saves race.
//! 2. At most one save is in flight per broker.
//!    - Enforced in: `DocumentBroker::start_save`.
//!    - Failure symptom: interleaved uploads clobber each other at the host.
//! 3. Messages from one session reach the worker in the order sent.
//!    - Enforced in: single worker queue appended to during in-order
//!      dispatch on the broker thread; the Loading-time early queue replays
//!      in arrival order.
//! 4. A tile request issued after an invalidation is never served from the
//!    pre-invalidation cache.
//!    - Enforced in: `TileCache::invalidate` removes matching entries before
//!      the invalidation notice reaches any client.
//! 5. The save acknowledgement from the worker precedes the storage upload.
//!    - Enforced in: the upload starts only from `on_worker_saved`.
//!
//! # Failure modes
//!
//! - Worker death: broker enters Dead, sessions receive an `error:` plus a
//!   reason-coded close telling the user to retry, the registry slot clears
//!   after teardown.
//! - Storage failures are classified (transient / conflict / auth /
//!   disk-full); only transient uploads retry, with backoff, a bounded
//!   number of times. Conflict keeps the broker Live and does not retry.
//! - Lock refresh failures count against the same classes; repeated failure
//!   kills the broker.

pub mod session;
pub mod storage_io;
pub mod tiles;
pub mod worker;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quill_config::Config;
use quill_net::SocketPoll;
use quill_net::ws::close_code;
use quill_proto::{DocKey, ErrorKind, ProtocolError, SessionId};
use quill_storage::ProofKey;

use crate::registry::BrokerRegistry;
use session::ClientSession;
use tiles::TileCache;
use worker::WorkerHandle;

/// How long an empty broker lingers before teardown, so a reloading tab can
/// reattach without a full document reload.
const LINGER: Duration = Duration::from_secs(10);

/// Transient upload attempts before the failure is surfaced.
const MAX_SAVE_RETRIES: u32 = 3;

/// Lock refresh cadence while Live.
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Consecutive lock refresh failures tolerated before the broker dies.
const MAX_LOCK_FAILURES: u32 = 3;

/// Syntax errors tolerated per session before it is disconnected.
const MAX_SYNTAX_ERRORS: u32 = 8;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session id.
#[must_use]
pub fn next_session_id() -> SessionId {
	SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Loading,
	Live,
	Saving,
	Dead,
}

/// An in-flight save.
#[derive(Debug)]
pub(crate) struct SaveJob {
	pub autosave: bool,
	pub exit_save: bool,
	pub started: Instant,
	/// Set while waiting out a transient-failure backoff.
	pub retry_at: Option<Instant>,
	pub attempts: u32,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerStats {
	pub tiles_rendered: u64,
	pub tiles_from_cache: u64,
	pub saves_completed: u64,
}

pub(crate) struct BrokerState {
	pub phase: Phase,
	pub sessions: HashMap<SessionId, ClientSession>,
	pub worker: Option<WorkerHandle>,
	pub tile_cache: TileCache,
	/// WOPI source of the document, set by the first `load`.
	pub source: Option<quill_storage::WopiSource>,
	pub file_info: Option<quill_storage::FileInfo>,
	/// Filesystem path of the document copy inside the jail, as the gateway
	/// sees it.
	pub doc_path: Option<std::path::PathBuf>,
	/// Downloaded document bytes staged until a worker exists to take them.
	pub doc_bytes: Option<(String, Vec<u8>)>,
	/// Origin path for `file://` sources, written back on save.
	pub fs_origin: Option<std::path::PathBuf>,
	pub lock_token: Option<String>,
	pub last_lock_refresh: Instant,
	pub lock_failures: u32,
	pub modified: bool,
	/// Disk-full from the host: refuse further modification traffic.
	pub frozen: bool,
	pub save: Option<SaveJob>,
	pub last_save: Option<Instant>,
	pub last_activity: Instant,
	/// Messages that arrived while Loading, replayed on Live.
	pub early_queue: Vec<(SessionId, String)>,
	/// Last `status:` line from the worker; replayed to late joiners.
	pub doc_status: Option<String>,
	/// Monotonic version stamped onto forwarded tile requests.
	pub next_tile_version: i32,
	/// Session currently holding the edit lock.
	pub edit_holder: Option<SessionId>,
	pub stats: BrokerStats,
}

/// Owns one document: its sessions, its worker, and its storage lifecycle.
pub struct DocumentBroker {
	key: DocKey,
	/// Public URI the clients used to reach this document.
	public_uri: String,
	poll: Arc<SocketPoll>,
	state: Mutex<BrokerState>,
	/// Mirrors `phase == Dead` so the registry can test liveness without
	/// touching the state lock (lock order there is registry before state).
	dead: AtomicBool,
	config: Arc<Config>,
	proof: Option<Arc<ProofKey>>,
	tls: Option<quill_net::ClientTlsConfig>,
	registry: Arc<BrokerRegistry>,
	load_time: Instant,
}

impl DocumentBroker {
	/// Create a broker for `key` with its own poll thread.
	pub fn new(
		key: DocKey,
		public_uri: String,
		config: Arc<Config>,
		proof: Option<Arc<ProofKey>>,
		tls: Option<quill_net::ClientTlsConfig>,
		registry: Arc<BrokerRegistry>,
	) -> std::io::Result<Arc<Self>> {
		let poll = SocketPoll::new(format!("doc-{}", short_key(&key)))?;
		poll.start_thread();
		let now = Instant::now();
		Ok(Arc::new(Self {
			key,
			public_uri,
			poll,
			state: Mutex::new(BrokerState {
				phase: Phase::Loading,
				sessions: HashMap::new(),
				worker: None,
				tile_cache: TileCache::new(),
				source: None,
				file_info: None,
				doc_path: None,
				doc_bytes: None,
				fs_origin: None,
				lock_token: None,
				last_lock_refresh: now,
				lock_failures: 0,
				modified: false,
				frozen: false,
				save: None,
				last_save: None,
				last_activity: now,
				early_queue: Vec::new(),
				doc_status: None,
				next_tile_version: 0,
				edit_holder: None,
				stats: BrokerStats::default(),
			}),
			dead: AtomicBool::new(false),
			config,
			proof,
			tls,
			registry,
			load_time: now,
		}))
	}

	#[must_use]
	pub fn key(&self) -> &DocKey {
		&self.key
	}

	#[must_use]
	pub fn public_uri(&self) -> &str {
		&self.public_uri
	}

	#[must_use]
	pub fn poll(&self) -> &Arc<SocketPoll> {
		&self.poll
	}

	#[must_use]
	pub fn phase(&self) -> Phase {
		self.state.lock().phase
	}

	#[must_use]
	pub fn is_dead(&self) -> bool {
		self.dead.load(Ordering::Acquire)
	}

	#[must_use]
	pub fn session_count(&self) -> usize {
		self.state.lock().sessions.len()
	}

	#[must_use]
	pub fn load_time(&self) -> Instant {
		self.load_time
	}

	/// The worker pid, once one is attached.
	#[must_use]
	pub fn worker_pid(&self) -> Option<i32> {
		self.state.lock().worker.as_ref().map(|w| w.pid)
	}

	pub(crate) fn config(&self) -> &Arc<Config> {
		&self.config
	}

	pub(crate) fn proof(&self) -> Option<Arc<ProofKey>> {
		self.proof.clone()
	}

	pub(crate) fn tls(&self) -> Option<quill_net::ClientTlsConfig> {
		self.tls.clone()
	}

	/// Send a text message to one session's client.
	pub(crate) fn send_to_session(&self, state: &BrokerState, id: SessionId, text: &str) {
		if let Some(session) = state.sessions.get(&id) {
			session.queue.push_text(text);
		}
	}

	/// Broadcast a text message to every session.
	pub(crate) fn broadcast(&self, state: &BrokerState, text: &str) {
		for session in state.sessions.values() {
			session.queue.push_text(text);
		}
	}

	/// Report a protocol error on one session, disconnecting repeat
	/// offenders.
	pub(crate) fn protocol_error(
		&self,
		state: &mut BrokerState,
		id: SessionId,
		error: &ProtocolError,
	) {
		let Some(session) = state.sessions.get_mut(&id) else {
			return;
		};
		session.syntax_errors += 1;
		session.queue.push_text(error.to_message());
		if session.syntax_errors >= MAX_SYNTAX_ERRORS {
			tracing::warn!(dockey = %self.key, session = %id, "too many protocol errors, disconnecting");
			session
				.queue
				.push_shutdown(close_code::POLICY_VIOLATION, "too many errors");
		}
	}

	/// Move the broker to Dead: notify and close every session, tell the
	/// worker to exit, and schedule registry removal.
	pub(crate) fn enter_dead(&self, state: &mut BrokerState, reason: &str) {
		if state.phase == Phase::Dead {
			return;
		}
		tracing::warn!(dockey = %self.key, reason, "broker entering dead state");
		state.phase = Phase::Dead;
		self.dead.store(true, Ordering::Release);

		let retry_hint = matches!(reason, "crashed");
		for session in state.sessions.values() {
			session
				.queue
				.push_text(ProtocolError::new("internal", ErrorKind::Unavailable).to_message());
			let close_reason = if retry_hint {
				format!("{reason}: retry")
			} else {
				reason.to_string()
			};
			session
				.queue
				.push_shutdown(close_code::UNEXPECTED_CONDITION, close_reason);
		}

		if let Some(worker) = &state.worker {
			worker.queue.push_text("exit");
			worker.queue.push_shutdown(close_code::GOING_AWAY, reason);
		}
		self.poll.wakeup();

		// Free the key immediately so a reconnecting client can build a
		// fresh broker; the poll unwinds itself after flushing the closes.
		self.registry.remove(&self.key);
		let poll = Arc::clone(&self.poll);
		self.poll.post_callback(move || poll.stop());
	}

	/// Periodic broker work, driven from the worker channel's tick.
	pub(crate) fn on_tick(self: &Arc<Self>, now: Instant) {
		let mut state = self.state.lock();
		match state.phase {
			Phase::Dead => return,
			Phase::Live => {
				self.auto_save_check(&mut state, now);
				self.refresh_lock_check(&mut state, now);
				self.idle_check(&mut state, now);
			}
			Phase::Saving => self.save_progress_check(&mut state, now),
			Phase::Loading => {}
		}
		self.maybe_teardown(&mut state, now);
	}

	/// Autosave after idle-with-modifications.
	pub(crate) fn auto_save_check(&self, state: &mut BrokerState, now: Instant) {
		if state.modified
			&& !state.frozen
			&& now.duration_since(state.last_activity) >= self.config.autosave_duration()
		{
			tracing::info!(dockey = %self.key, "autosave triggered");
			self.start_save(state, false, true, false);
		}
	}

	fn idle_check(&self, state: &mut BrokerState, now: Instant) {
		if !state.sessions.is_empty()
			&& now.duration_since(state.last_activity) >= self.config.idle_timeout()
		{
			tracing::info!(dockey = %self.key, "document idle too long, unloading");
			if state.modified && !state.frozen {
				self.start_save(state, true, false, true);
			} else {
				self.enter_dead(state, "idle");
			}
		}
	}

	fn maybe_teardown(&self, state: &mut BrokerState, now: Instant) {
		if state.phase != Phase::Dead
			&& state.sessions.is_empty()
			&& state.save.is_none()
			&& now.duration_since(state.last_activity) >= LINGER
		{
			if state.modified && !state.frozen {
				self.start_save(state, true, false, true);
			} else {
				self.release_lock(state);
				self.enter_dead(state, "unused");
			}
		}
	}

	/// Begin an orderly shutdown: save if needed, die otherwise. Used by the
	/// gateway-wide drain.
	pub fn initiate_shutdown(&self) {
		let mut state = self.state.lock();
		if state.phase == Phase::Dead {
			return;
		}
		if state.modified && !state.frozen && state.save.is_none() {
			self.start_save(&mut state, true, false, true);
		} else if state.save.is_none() {
			self.release_lock(&mut state);
			self.enter_dead(&mut state, "shutdown");
		}
		// A save already in flight completes (or times out) through the
		// normal path; its exit flag is forced so settling kills the broker.
		if let Some(save) = state.save.as_mut() {
			save.exit_save = true;
		}
	}

	/// Whether the broker has fully settled after [`Self::initiate_shutdown`].
	#[must_use]
	pub fn is_drained(&self) -> bool {
		let state = self.state.lock();
		state.phase == Phase::Dead && state.save.is_none()
	}

	#[cfg(test)]
	pub(crate) fn lock_state_for_test(&self) -> parking_lot::MutexGuard<'_, BrokerState> {
		self.state.lock()
	}

	pub(crate) fn state(&self) -> &Mutex<BrokerState> {
		&self.state
	}
}

fn short_key(key: &DocKey) -> String {
	let s = key.as_str();
	let tail: String = s
		.chars()
		.rev()
		.take(24)
		.collect::<String>()
		.chars()
		.rev()
		.collect();
	tail.replace('/', "_")
}
