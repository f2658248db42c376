//! Client session lifecycle and inbound message dispatch.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use quill_net::ws::{OutboundQueue, close_code};
use quill_net::{WsMessageHandler, WsSender};
use quill_proto::{ClientCommand, ErrorKind, ProtocolError, SessionId, ViewId};

use super::tiles::TileAction;
use super::{DocumentBroker, Phase};

/// One browser tab attached to a broker.
pub struct ClientSession {
	pub id: SessionId,
	/// Outbound frames for this session's socket.
	pub queue: Arc<OutboundQueue>,
	/// View id assigned by the render library once the worker knows us.
	pub view_id: Option<ViewId>,
	pub read_only: bool,
	pub user_id: String,
	pub user_name: String,
	pub watermark: String,
	pub syntax_errors: u32,
	/// Whether this session ever modified the document.
	pub wrote: bool,
	/// Whether this session has sent its `load` yet.
	pub loaded: bool,
}

impl ClientSession {
	#[must_use]
	pub fn new(id: SessionId, queue: Arc<OutboundQueue>) -> Self {
		Self {
			id,
			queue,
			view_id: None,
			read_only: false,
			user_id: String::new(),
			user_name: String::new(),
			watermark: String::new(),
			syntax_errors: 0,
			wrote: false,
			loaded: false,
		}
	}
}

impl DocumentBroker {
	/// Attach a new session. Joined participants are announced once the
	/// worker has assigned the view.
	pub fn add_session(self: &Arc<Self>, id: SessionId, queue: Arc<OutboundQueue>) {
		let mut state = self.state().lock();
		if state.phase == Phase::Dead {
			queue.push_text(ProtocolError::new("internal", ErrorKind::Unavailable).to_message());
			queue.push_shutdown(close_code::UNEXPECTED_CONDITION, "document unloading");
			return;
		}
		state.last_activity = Instant::now();
		state.sessions.insert(id, ClientSession::new(id, queue));
		tracing::info!(dockey = %self.key(), session = %id, total = state.sessions.len(), "session attached");
		// The session announces itself with its `load`; views and status
		// follow from there.
		drop(state);
		self.poll().wakeup();
	}

	/// Detach a session, announce the departure, and save if the last
	/// writer left changes behind.
	pub fn remove_session(self: &Arc<Self>, id: SessionId) {
		let mut state = self.state().lock();
		let Some(session) = state.sessions.remove(&id) else {
			return;
		};
		tracing::info!(dockey = %self.key(), session = %id, remaining = state.sessions.len(), "session detached");
		state.last_activity = Instant::now();
		state.tile_cache.unsubscribe_session(id);

		if let (Some(worker), Some(view_id)) = (&state.worker, session.view_id) {
			worker.queue.push_text(format!("removeview id={id} viewid={view_id}"));
		}

		if state.edit_holder == Some(id) {
			state.edit_holder = None;
			self.grant_edit_lock(&mut state);
		}

		self.broadcast_view_info(&state);

		let last_writer_left = session.wrote && state.sessions.values().all(|s| !s.wrote);
		if state.sessions.is_empty() && state.modified && !state.frozen && state.save.is_none() {
			// Nobody is left to press save; write the changes out before the
			// broker may die.
			self.start_save(&mut state, true, false, true);
		} else if last_writer_left && state.modified && !state.frozen && state.save.is_none() {
			self.start_save(&mut state, false, false, false);
		}
		drop(state);
		self.poll().wakeup();
	}

	/// Route one inbound client message.
	pub fn dispatch_client_message(self: &Arc<Self>, id: SessionId, line: &str) {
		let mut state = self.state().lock();
		if state.phase == Phase::Dead {
			return;
		}
		state.last_activity = Instant::now();

		let command = match ClientCommand::parse(line) {
			Ok(command) => command,
			Err(error) => {
				self.protocol_error(&mut state, id, &error);
				return;
			}
		};

		match command {
			ClientCommand::Ping => {
				self.send_to_session(&state, id, "pong");
			}
			ClientCommand::Load { url, readonly, .. } => {
				if let Some(session) = state.sessions.get_mut(&id) {
					session.read_only = readonly;
				}
				self.handle_load(&mut state, id, &url);
			}
			ClientCommand::Tile(desc) => {
				if state.phase == Phase::Loading {
					state.early_queue.push((id, line.to_string()));
				} else {
					self.handle_tile_request(&mut state, id, desc);
				}
			}
			ClientCommand::TileCombine(bundle) => {
				if state.phase == Phase::Loading {
					state.early_queue.push((id, line.to_string()));
				} else {
					for desc in bundle.into_tiles() {
						self.handle_tile_request(&mut state, id, desc);
					}
				}
			}
			ClientCommand::CancelTiles => {
				state.tile_cache.unsubscribe_session(id);
			}
			ClientCommand::Save => {
				if state.frozen {
					self.send_to_session(
						&state,
						id,
						&ProtocolError::new("storage", ErrorKind::DiskFull).to_message(),
					);
				} else {
					self.start_save(&mut state, true, false, false);
				}
			}
			ClientCommand::SaveAs { url } => {
				self.forward_to_worker(&mut state, id, &format!("saveas id={id} url={url}"));
			}
			ClientCommand::Disconnect => {
				if let Some(session) = state.sessions.get(&id) {
					session.queue.push_shutdown(close_code::NORMAL, "");
				}
			}
			ClientCommand::Forward => {
				if state.frozen && modifies_document(line) {
					self.send_to_session(
						&state,
						id,
						&ProtocolError::new("storage", ErrorKind::DiskFull).to_message(),
					);
					return;
				}
				if modifies_document(line) {
					state.modified = true;
					if let Some(session) = state.sessions.get_mut(&id) {
						session.wrote = true;
					}
				}
				self.forward_to_worker(&mut state, id, line);
			}
		}
	}

	/// Forward a message to the worker in the session envelope, or queue it
	/// while the document is still loading.
	pub(crate) fn forward_to_worker(
		&self,
		state: &mut super::BrokerState,
		id: SessionId,
		line: &str,
	) {
		if state.phase == Phase::Loading {
			state.early_queue.push((id, line.to_string()));
			return;
		}
		if let Some(worker) = &state.worker {
			worker.queue.push_text(format!("fromsession id={id} {line}"));
		}
	}

	pub(crate) fn handle_tile_request(
		&self,
		state: &mut super::BrokerState,
		id: SessionId,
		mut desc: quill_proto::TileDesc,
	) {
		match state.tile_cache.request(desc, id) {
			TileAction::Cached(data, ver) => {
				state.stats.tiles_from_cache += 1;
				let mut served = desc;
				served.ver = ver;
				if let Some(session) = state.sessions.get(&id) {
					session.queue.push_binary(tile_message(&served, &data));
				}
			}
			TileAction::Render(_) => {
				state.next_tile_version += 1;
				desc.ver = state.next_tile_version;
				if let Some(worker) = &state.worker {
					worker.queue.push_text(desc.serialize("tile"));
				}
			}
			TileAction::Joined => {}
		}
	}

	/// Ask the worker to create a view for `id`.
	pub(crate) fn request_view(&self, state: &super::BrokerState, id: SessionId) {
		let Some(worker) = &state.worker else {
			return;
		};
		let Some(session) = state.sessions.get(&id) else {
			return;
		};
		worker.queue.push_text(format!(
			"addview id={id} username={} readonly={}",
			if session.user_name.is_empty() {
				"unknown"
			} else {
				&session.user_name
			},
			u8::from(session.read_only),
		));
	}

	/// Broadcast the participant list.
	pub(crate) fn broadcast_view_info(&self, state: &super::BrokerState) {
		let views: Vec<serde_json::Value> = state
			.sessions
			.values()
			.filter_map(|s| {
				s.view_id.map(|view_id| {
					serde_json::json!({
						"id": view_id.0,
						"userid": s.user_id,
						"username": s.user_name,
						"readonly": s.read_only,
					})
				})
			})
			.collect();
		let message = format!("viewinfo: {}", serde_json::Value::Array(views));
		self.broadcast(state, &message);
	}

	/// Hand the edit lock to the first writable session lacking it.
	pub(crate) fn grant_edit_lock(&self, state: &mut super::BrokerState) {
		if state.edit_holder.is_some() {
			return;
		}
		let candidate = state
			.sessions
			.values()
			.filter(|s| !s.read_only)
			.map(|s| s.id)
			.min();
		if let Some(id) = candidate {
			state.edit_holder = Some(id);
			if let Some(worker) = &state.worker {
				worker.queue.push_text(format!("editlock id={id}"));
			}
			self.broadcast(state, &format!("editlock: id={id}"));
		}
	}
}

/// Whether a forwarded command mutates the document.
fn modifies_document(line: &str) -> bool {
	let command = line.split(' ').next().unwrap_or_default();
	matches!(command, "key" | "mouse" | "uno")
}

/// Message-level handler bridging one session's framed socket to its broker.
pub struct SessionChannel {
	broker: Arc<DocumentBroker>,
	id: SessionId,
}

impl SessionChannel {
	#[must_use]
	pub fn new(broker: Arc<DocumentBroker>, id: SessionId) -> Self {
		Self { broker, id }
	}
}

impl WsMessageHandler for SessionChannel {
	fn on_message(
		&mut self,
		data: Vec<u8>,
		binary: bool,
		_sender: &mut WsSender<'_>,
	) -> ControlFlow<()> {
		if binary {
			// Clients never send binary payloads.
			let error = ProtocolError::new("binary", ErrorKind::Syntax);
			let mut state = self.broker.state().lock();
			self.broker.protocol_error(&mut state, self.id, &error);
			return ControlFlow::Continue(());
		}
		match String::from_utf8(data) {
			Ok(line) => self.broker.dispatch_client_message(self.id, &line),
			Err(_) => {
				let error = ProtocolError::new("utf8", ErrorKind::Syntax);
				let mut state = self.broker.state().lock();
				self.broker.protocol_error(&mut state, self.id, &error);
			}
		}
		ControlFlow::Continue(())
	}

	fn on_disconnect(&mut self) {
		self.broker.remove_session(self.id);
	}
}

/// Serialize a tile response: text header, newline, then the bitmap bytes.
#[must_use]
pub fn tile_message(desc: &quill_proto::TileDesc, data: &[u8]) -> Vec<u8> {
	let header = desc.serialize("tile:");
	let mut out = Vec::with_capacity(header.len() + 1 + data.len());
	out.extend_from_slice(header.as_bytes());
	out.push(b'\n');
	out.extend_from_slice(data);
	out
}
