//! Worker pairing and worker-side message dispatch.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_net::ws::OutboundQueue;
use quill_net::{WsMessageHandler, WsSender};
use quill_proto::tokens::Tokens;
use quill_proto::{SessionId, TileDesc, ViewId};

use super::session::tile_message;
use super::tiles::{InvalidationSpec, RenderFailure};
use super::{DocumentBroker, Phase};

/// RSS sampling cadence for admin visibility.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// A worker freshly connected to the gateway, not yet owned by a broker.
#[derive(Debug)]
pub struct WorkerLink {
	pub jail_id: String,
	pub pid: i32,
	pub chrooted: bool,
	pub queue: Arc<OutboundQueue>,
}

/// The broker's reference to its worker process.
#[derive(Debug)]
pub struct WorkerHandle {
	pub jail_id: String,
	pub pid: i32,
	pub chrooted: bool,
	pub queue: Arc<OutboundQueue>,
	pub last_seen: Instant,
	/// Resident set sampled from /proc, kilobytes.
	pub rss_kib: Option<u64>,
	last_sampled: Instant,
}

impl WorkerHandle {
	fn from_link(link: WorkerLink) -> Self {
		let now = Instant::now();
		Self {
			jail_id: link.jail_id,
			pid: link.pid,
			chrooted: link.chrooted,
			queue: link.queue,
			last_seen: now,
			rss_kib: None,
			last_sampled: now - MEMORY_SAMPLE_INTERVAL,
		}
	}
}

impl DocumentBroker {
	/// Adopt a worker produced by the spawner. Rejects a second worker: the
	/// one-worker-per-key invariant is enforced here and in the registry.
	pub fn attach_worker(self: &Arc<Self>, link: WorkerLink) -> bool {
		let mut state = self.state().lock();
		if state.worker.is_some() || state.phase == Phase::Dead {
			tracing::warn!(dockey = %self.key(), pid = link.pid, "refusing extra worker");
			return false;
		}
		tracing::info!(dockey = %self.key(), pid = link.pid, jail = %link.jail_id, "worker attached");
		state.worker = Some(WorkerHandle::from_link(link));

		// The document may already be waiting on disk for a worker.
		if state.doc_path.is_some() {
			self.instruct_worker_load(&mut state);
		}
		drop(state);
		self.poll().wakeup();
		true
	}

	/// Route one message arriving from the worker pipe.
	pub fn dispatch_worker_message(self: &Arc<Self>, data: Vec<u8>, binary: bool) {
		if binary {
			self.handle_worker_tile(data);
			return;
		}
		let Ok(line) = String::from_utf8(data) else {
			tracing::warn!(dockey = %self.key(), "non-utf8 text message from worker");
			return;
		};

		let tokens = Tokens::new(&line);
		match tokens.command() {
			Some("status:") => self.on_worker_status(&line),
			Some("viewid:") => self.on_worker_viewid(&tokens),
			Some("invalidatetiles:") => self.on_worker_invalidate(&line, &tokens),
			Some("modified:") => {
				let modified = tokens.get(1) == Some("true");
				let mut state = self.state().lock();
				state.modified = modified;
			}
			Some("saved:") => self.on_worker_saved(&tokens),
			Some("tilefailed:") => self.on_worker_tile_failed(&tokens),
			Some("tosession") => {
				let Ok(Some(id)) = tokens.int_pair("id") else {
					tracing::warn!(dockey = %self.key(), "tosession without id");
					return;
				};
				let payload = tokens.tail(2);
				let state = self.state().lock();
				self.send_to_session(&state, SessionId(id as u64), payload);
			}
			Some(_) => {
				// Anything else from the render side goes to every client.
				let state = self.state().lock();
				self.broadcast(&state, &line);
			}
			None => {}
		}
	}

	fn on_worker_status(self: &Arc<Self>, line: &str) {
		let mut state = self.state().lock();
		state.doc_status = Some(line.to_string());
		let loading_finished = state.phase == Phase::Loading;
		if loading_finished {
			state.phase = Phase::Live;
			tracing::info!(dockey = %self.key(), "document live");
			self.broadcast(&state, "statusindicator: ready");

			// Every session that has sent its load gets a view now.
			let ids: Vec<SessionId> = state
				.sessions
				.values()
				.filter(|s| s.loaded)
				.map(|s| s.id)
				.collect();
			for id in ids {
				self.request_view(&state, id);
			}

			// Replay traffic that arrived while loading, in arrival order.
			let early = std::mem::take(&mut state.early_queue);
			drop(state);
			for (id, message) in early {
				self.dispatch_client_message(id, &message);
			}
			let state = self.state().lock();
			self.broadcast(&state, line);
		} else {
			self.broadcast(&state, line);
		}
	}

	fn on_worker_viewid(&self, tokens: &Tokens<'_>) {
		let (Ok(Some(id)), Ok(Some(view))) = (tokens.int_pair("id"), tokens.int_pair("viewid"))
		else {
			tracing::warn!(dockey = %self.key(), "malformed viewid message");
			return;
		};
		let mut state = self.state().lock();
		let session_id = SessionId(id as u64);
		if let Some(session) = state.sessions.get_mut(&session_id) {
			session.view_id = Some(ViewId(view as i32));
		}
		self.broadcast_view_info(&state);
		self.grant_edit_lock(&mut state);
	}

	fn on_worker_invalidate(&self, line: &str, tokens: &Tokens<'_>) {
		let payload = tokens.tail(1);
		let Some(spec) = InvalidationSpec::parse(payload) else {
			tracing::warn!(dockey = %self.key(), payload, "unparseable invalidation");
			return;
		};
		let mut state = self.state().lock();
		state.modified = true;
		let _woken = state.tile_cache.invalidate(spec);
		// Every client re-evaluates its visible tiles against the notice.
		self.broadcast(&state, line);
	}

	fn on_worker_tile_failed(self: &Arc<Self>, tokens: &Tokens<'_>) {
		let Ok(desc) = TileDesc::parse(tokens) else {
			return;
		};
		let mut state = self.state().lock();
		match state.tile_cache.render_failed(desc.key()) {
			RenderFailure::Retry(mut retry) => {
				tracing::debug!(dockey = %self.key(), "retrying failed tile render");
				state.next_tile_version += 1;
				retry.ver = state.next_tile_version;
				if let Some(worker) = &state.worker {
					worker.queue.push_text(retry.serialize("tile"));
				}
			}
			RenderFailure::GiveUp(sessions) => {
				tracing::warn!(dockey = %self.key(), "tile render failed twice, surfacing");
				for id in sessions {
					self.send_to_session(
						&state,
						id,
						&quill_proto::ProtocolError::new("tile", quill_proto::ErrorKind::RenderFailed)
							.to_message(),
					);
				}
			}
		}
	}

	/// Binary worker payload: `tile: <desc>\n<bitmap>`.
	fn handle_worker_tile(self: &Arc<Self>, data: Vec<u8>) {
		let Some(newline) = data.iter().position(|b| *b == b'\n') else {
			tracing::warn!(dockey = %self.key(), "binary worker message without header");
			return;
		};
		let Ok(header) = std::str::from_utf8(&data[..newline]) else {
			return;
		};
		let tokens = Tokens::new(header);
		if tokens.command() != Some("tile:") {
			tracing::warn!(dockey = %self.key(), header, "unexpected binary worker message");
			return;
		}
		let Ok(desc) = TileDesc::parse(&tokens) else {
			tracing::warn!(dockey = %self.key(), header, "malformed tile header");
			return;
		};
		let bitmap = data[newline + 1..].to_vec();

		let mut state = self.state().lock();
		state.stats.tiles_rendered += 1;
		let (bytes, subscribers) = state.tile_cache.save(&desc, bitmap);
		if desc.broadcast {
			let message = tile_message(&desc, &bytes);
			for session in state.sessions.values() {
				session.queue.push_binary(message.clone());
			}
		} else {
			let message = tile_message(&desc, &bytes);
			for id in subscribers {
				if let Some(session) = state.sessions.get(&id) {
					session.queue.push_binary(message.clone());
				}
			}
		}
	}

	/// Sample worker memory on a slow cadence; runs from the tick.
	pub(crate) fn sample_worker_memory(&self, now: Instant) {
		let mut state = self.state().lock();
		let Some(worker) = state.worker.as_mut() else {
			return;
		};
		if now.duration_since(worker.last_sampled) < MEMORY_SAMPLE_INTERVAL {
			return;
		}
		worker.last_sampled = now;
		worker.rss_kib = procfs::process::Process::new(worker.pid)
			.ok()
			.and_then(|p| p.status().ok())
			.and_then(|s| s.vmrss);
	}
}

/// Message-level handler for the gateway side of the worker pipe.
pub struct WorkerChannel {
	broker: Arc<DocumentBroker>,
}

impl WorkerChannel {
	#[must_use]
	pub fn new(broker: Arc<DocumentBroker>) -> Self {
		Self { broker }
	}
}

impl WsMessageHandler for WorkerChannel {
	fn on_message(
		&mut self,
		data: Vec<u8>,
		binary: bool,
		_sender: &mut WsSender<'_>,
	) -> ControlFlow<()> {
		{
			let mut state = self.broker.state().lock();
			if let Some(worker) = state.worker.as_mut() {
				worker.last_seen = Instant::now();
			}
		}
		self.broker.dispatch_worker_message(data, binary);
		ControlFlow::Continue(())
	}

	fn on_tick(&mut self, now: Instant, _sender: &mut WsSender<'_>) {
		self.broker.on_tick(now);
		self.broker.sample_worker_memory(now);
	}

	fn on_disconnect(&mut self) {
		// Worker gone. If we are already Dead this is the orderly exit;
		// otherwise it is a crash.
		let mut state = self.broker.state().lock();
		if state.phase != Phase::Dead {
			state.worker = None;
			self.broker.enter_dead(&mut state, "crashed");
		}
	}
}
