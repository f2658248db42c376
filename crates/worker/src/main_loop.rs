//! The worker's message loop.
//!
//! One poll, one socket: the gateway pipe, WebSocket-framed over the unix
//! connection made before lockdown. Rendering runs on this same thread but
//! yields between tiles against a per-iteration budget so inbound traffic
//! keeps flowing.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_net::ws::OutboundQueue;
use quill_net::{SocketPoll, StreamSocket, WebSocketFramer, WsMessageHandler, WsSender};
use quill_proto::tokens::Tokens;
use quill_proto::{SessionId, TileDesc};

use crate::render::{DocumentInfo, RenderBackend};

/// Rendering budget per poll iteration.
const RENDER_BUDGET: Duration = Duration::from_millis(20);

/// Run the worker loop over a connected gateway pipe. Returns when the
/// gateway says `exit` or the pipe dies.
pub fn run(
	stream: StreamSocket,
	jail_id: &str,
	chrooted: bool,
	backend: Box<dyn RenderBackend>,
) -> std::io::Result<()> {
	let poll = SocketPoll::new(format!("worker-{jail_id}"))?;
	let queue = OutboundQueue::new();

	// The hello must be the first frame on the pipe.
	queue.push_text(format!(
		"child {jail_id} {} chroot={}",
		std::process::id(),
		u8::from(chrooted),
	));

	let channel = PipeChannel {
		poll: Arc::clone(&poll),
		backend,
		info: None,
		doc_path: None,
		views: HashMap::new(),
		pending_tiles: VecDeque::new(),
		edit_view: None,
	};
	poll.insert_socket(stream, Box::new(WebSocketFramer::server(channel, queue)));
	poll.run();
	Ok(())
}

/// Message handler for the worker side of the gateway pipe.
pub struct PipeChannel {
	poll: Arc<SocketPoll>,
	backend: Box<dyn RenderBackend>,
	info: Option<DocumentInfo>,
	doc_path: Option<PathBuf>,
	/// session id → render library view id.
	views: HashMap<SessionId, i32>,
	pending_tiles: VecDeque<TileDesc>,
	edit_view: Option<SessionId>,
}

impl PipeChannel {
	/// Visible for in-process worker tests.
	#[must_use]
	pub fn for_tests(poll: Arc<SocketPoll>, backend: Box<dyn RenderBackend>) -> Self {
		Self {
			poll,
			backend,
			info: None,
			doc_path: None,
			views: HashMap::new(),
			pending_tiles: VecDeque::new(),
			edit_view: None,
		}
	}

	fn handle_line(&mut self, line: &str, sender: &mut WsSender<'_>) -> ControlFlow<()> {
		let tokens = Tokens::new(line);
		match tokens.command() {
			Some("load") => self.handle_doc_load(&tokens, sender),
			Some("addview") => self.handle_add_view(&tokens, sender),
			Some("removeview") => {
				if let Ok(Some(id)) = tokens.int_pair("id")
					&& let Some(view) = self.views.remove(&SessionId(id as u64))
				{
					self.backend.destroy_view(view);
				}
			}
			Some("tile") => match TileDesc::parse(&tokens) {
				Ok(desc) => self.pending_tiles.push_back(desc),
				Err(_) => tracing::warn!(line, "malformed tile request"),
			},
			Some("savetofile") => {
				let result = match &self.doc_path {
					Some(path) => self.backend.save(path),
					None => Err(crate::render::RenderError::NoDocument),
				};
				match result {
					Ok(()) => sender.send_text("saved: result=ok"),
					Err(e) => {
						tracing::error!(error = %e, "save failed");
						sender.send_text("saved: result=fail");
					}
				}
			}
			Some("fromsession") => {
				if let Ok(Some(id)) = tokens.int_pair("id") {
					self.handle_session_message(SessionId(id as u64), tokens.tail(2), sender);
				}
			}
			Some("saveas") => self.handle_save_as(&tokens, sender),
			Some("editlock") => {
				if let Ok(Some(id)) = tokens.int_pair("id") {
					self.edit_view = Some(SessionId(id as u64));
				}
			}
			Some("exit") => {
				tracing::info!("gateway requested exit");
				self.poll.stop();
				return ControlFlow::Break(());
			}
			Some(other) => tracing::warn!(command = other, "unknown pipe command"),
			None => {}
		}
		ControlFlow::Continue(())
	}

	fn handle_doc_load(&mut self, tokens: &Tokens<'_>, sender: &mut WsSender<'_>) {
		let Some(path) = tokens.string_pair("doc") else {
			tracing::error!("load without doc path");
			return;
		};
		let path = PathBuf::from(path);
		match self.backend.load(&path) {
			Ok(info) => {
				tracing::info!(doc = %path.display(), "document loaded");
				sender.send_text(&info.status_line());
				self.info = Some(info);
				self.doc_path = Some(path);
			}
			Err(e) => {
				tracing::error!(doc = %path.display(), error = %e, "document load failed");
				sender.send_text("error: cmd=load kind=unavailable");
			}
		}
	}

	fn handle_add_view(&mut self, tokens: &Tokens<'_>, sender: &mut WsSender<'_>) {
		let Ok(Some(id)) = tokens.int_pair("id") else {
			return;
		};
		let session = SessionId(id as u64);
		match self.backend.create_view() {
			Ok(view) => {
				self.views.insert(session, view);
				sender.send_text(&format!("viewid: id={session} viewid={view}"));
			}
			Err(e) => {
				tracing::error!(error = %e, "view creation failed");
				sender.send_text("error: cmd=addview kind=unavailable");
			}
		}
	}

	fn handle_session_message(
		&mut self,
		session: SessionId,
		message: &str,
		sender: &mut WsSender<'_>,
	) {
		let tokens = Tokens::new(message);
		match tokens.command() {
			Some("status") => {
				if let Some(info) = &self.info {
					sender.send_text(&format!("tosession id={session} {}", info.status_line()));
				}
			}
			Some("renderfont") => {
				sender.send_text(&format!(
					"tosession id={session} renderfont: {}",
					tokens.tail(1)
				));
			}
			Some("commandvalues") => {
				sender.send_text(&format!("tosession id={session} commandvalues: {{}}"));
			}
			Some("testsyscall") => self.handle_test_syscall(&tokens),
			Some(_) => {
				let Some(view) = self.views.get(&session).copied() else {
					tracing::debug!(session = %session, "input for a session without a view");
					return;
				};
				if self.edit_view.is_some_and(|holder| holder != session) {
					tracing::trace!(session = %session, "input from a session without the edit lock");
				}
				match self.backend.post_input(view, message) {
					Ok(true) => {
						sender.send_text("modified: true");
						// The engine reports damaged regions; the stub
						// damages the whole current part.
						let part = self.info.as_ref().map_or(0, |i| i.current_part);
						sender.send_text(&format!("invalidatetiles: part={part}"));
					}
					Ok(false) => {}
					Err(e) => {
						tracing::warn!(error = %e, "input rejected by the render library");
					}
				}
			}
			None => {}
		}
	}

	fn handle_save_as(&mut self, tokens: &Tokens<'_>, sender: &mut WsSender<'_>) {
		let (Ok(Some(id)), Some(url)) = (tokens.int_pair("id"), tokens.string_pair("url")) else {
			return;
		};
		let session = SessionId(id as u64);
		// Serialise next to the document; the gateway moves it to storage.
		let result = match self.doc_path.clone() {
			Some(path) => self.backend.save(&path.with_extension("saveas")),
			None => Err(crate::render::RenderError::NoDocument),
		};
		let verdict = if result.is_ok() { "ok" } else { "err" };
		sender.send_text(&format!("tosession id={session} saveas: url={url} result={verdict}"));
	}

	/// Deliberately hit a denied syscall, for sandbox tests. Gated behind an
	/// environment opt-in so production workers never carry the path live.
	fn handle_test_syscall(&self, tokens: &Tokens<'_>) {
		if std::env::var_os("QUILL_ALLOW_TEST_SYSCALLS").is_none() {
			tracing::warn!("test syscall requested without the opt-in");
			return;
		}
		if tokens.get(1) == Some("mount") {
			tracing::warn!("invoking denied mount syscall for sandbox test");
			unsafe {
				libc::mount(
					c"none".as_ptr(),
					c"/".as_ptr(),
					c"tmpfs".as_ptr(),
					0,
					std::ptr::null(),
				);
			}
		}
	}

	fn render_pending(&mut self, sender: &mut WsSender<'_>) {
		let started = Instant::now();
		while let Some(desc) = self.pending_tiles.pop_front() {
			match self.backend.render_tile(&desc) {
				Ok(bytes) => {
					let mut message = desc.serialize("tile:").into_bytes();
					message.push(b'\n');
					message.extend_from_slice(&bytes);
					sender.send_binary(&message);
				}
				Err(e) => {
					tracing::warn!(error = %e, "tile render failed");
					sender.send_text(&desc.serialize("tilefailed:"));
				}
			}
			// Yield between tiles so input stays responsive.
			if started.elapsed() >= RENDER_BUDGET {
				break;
			}
		}
	}
}

impl WsMessageHandler for PipeChannel {
	fn on_message(
		&mut self,
		data: Vec<u8>,
		binary: bool,
		sender: &mut WsSender<'_>,
	) -> ControlFlow<()> {
		if binary {
			tracing::warn!("unexpected binary message from the gateway");
			return ControlFlow::Continue(());
		}
		match String::from_utf8(data) {
			Ok(line) => self.handle_line(&line, sender),
			Err(_) => {
				tracing::warn!("non-utf8 pipe message");
				ControlFlow::Continue(())
			}
		}
	}

	fn on_tick(&mut self, _now: Instant, sender: &mut WsSender<'_>) {
		if !self.pending_tiles.is_empty() {
			self.render_pending(sender);
			if !self.pending_tiles.is_empty() {
				// More work queued: come straight back.
				self.poll.wakeup();
			}
		}
	}

	fn on_disconnect(&mut self) {
		tracing::warn!("gateway pipe lost, exiting");
		self.poll.stop();
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use quill_net::ws::{DEFAULT_MAX_PAYLOAD, OpCode, decode_frame, encode_frame};

	use super::*;
	use crate::render::StubBackend;

	/// Drive a PipeChannel over a real framer and poll, like production.
	struct Harness {
		peer: std::os::unix::net::UnixStream,
		poll: Arc<SocketPoll>,
	}

	impl Harness {
		fn new() -> Self {
			let (ours, peer) = std::os::unix::net::UnixStream::pair().unwrap();
			let poll = SocketPoll::new("worker-test").unwrap();
			let channel = PipeChannel::for_tests(Arc::clone(&poll), Box::<StubBackend>::default());
			let stream = StreamSocket::from_fd(ours.into()).unwrap();
			poll.insert_socket(
				stream,
				Box::new(WebSocketFramer::server(channel, OutboundQueue::new())),
			);
			poll.start_thread();
			Self { peer, poll }
		}

		fn send(&mut self, line: &str) {
			use std::io::Write;
			let mut frame = Vec::new();
			encode_frame(OpCode::Text, line.as_bytes(), None, true, &mut frame);
			self.peer.write_all(&frame).unwrap();
		}

		/// Data frames the worker wrote back: `(binary, payload)` pairs.
		fn responses(&mut self) -> Vec<(bool, Vec<u8>)> {
			use std::io::Read;
			// Generous wait for the first bytes, then a short quiet gap.
			self.peer
				.set_read_timeout(Some(Duration::from_secs(2)))
				.unwrap();
			let mut raw = Vec::new();
			let mut chunk = [0u8; 65536];
			loop {
				match self.peer.read(&mut chunk) {
					Ok(0) | Err(_) => break,
					Ok(n) => {
						raw.extend_from_slice(&chunk[..n]);
						self.peer
							.set_read_timeout(Some(Duration::from_millis(150)))
							.unwrap();
					}
				}
			}
			let mut out = Vec::new();
			let mut rest = &raw[..];
			while let Ok(Some((frame, used))) = decode_frame(rest, DEFAULT_MAX_PAYLOAD) {
				if matches!(frame.op, OpCode::Text | OpCode::Binary) {
					out.push((frame.op == OpCode::Binary, frame.payload));
				}
				rest = &rest[used..];
			}
			out
		}
	}

	impl Drop for Harness {
		fn drop(&mut self) {
			self.poll.stop();
		}
	}

	fn doc_file() -> (tempfile::TempDir, String) {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("doc.odt");
		std::fs::write(&path, b"stub document").unwrap();
		let display = path.display().to_string();
		(tmp, display)
	}

	#[test]
	fn load_answers_with_status() {
		let (_tmp, path) = doc_file();
		let mut harness = Harness::new();
		harness.send(&format!("load doc={path} name=doc.odt"));

		let responses = harness.responses();
		let status = String::from_utf8(responses[0].1.clone()).unwrap();
		assert!(status.starts_with("status: type=text parts=1"), "{status}");
	}

	#[test]
	fn views_get_ids_and_inputs_modify() {
		let (_tmp, path) = doc_file();
		let mut harness = Harness::new();
		harness.send(&format!("load doc={path} name=doc.odt"));
		harness.send("addview id=7 username=ada readonly=0");
		harness.send("fromsession id=7 key type=input char=65 key=0");

		let texts: Vec<String> = harness
			.responses()
			.into_iter()
			.filter(|(binary, _)| !binary)
			.map(|(_, p)| String::from_utf8(p).unwrap())
			.collect();
		assert!(texts.iter().any(|t| t == "viewid: id=7 viewid=0"), "{texts:?}");
		assert!(texts.iter().any(|t| t == "modified: true"));
		assert!(texts.iter().any(|t| t.starts_with("invalidatetiles: part=")));
	}

	#[test]
	fn tiles_render_and_come_back_binary() {
		let (_tmp, path) = doc_file();
		let mut harness = Harness::new();
		harness.send(&format!("load doc={path} name=doc.odt"));
		harness.send(
			"tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840 ver=3",
		);

		let binaries: Vec<Vec<u8>> = harness
			.responses()
			.into_iter()
			.filter(|(binary, _)| *binary)
			.map(|(_, p)| p)
			.collect();
		assert_eq!(binaries.len(), 1);
		let payload = &binaries[0];
		let newline = payload.iter().position(|b| *b == b'\n').unwrap();
		let header = std::str::from_utf8(&payload[..newline]).unwrap();
		assert!(header.starts_with("tile: part=0"), "{header}");
		assert!(header.contains("ver=3"));
	}

	#[test]
	fn save_round_trips_to_disk() {
		let (tmp, path) = doc_file();
		let mut harness = Harness::new();
		harness.send(&format!("load doc={path} name=doc.odt"));
		harness.send("addview id=1 username=ada readonly=0");
		harness.send("fromsession id=1 key type=input char=65 key=0");
		harness.send("savetofile");

		let texts: Vec<String> = harness
			.responses()
			.into_iter()
			.filter(|(binary, _)| !binary)
			.map(|(_, p)| String::from_utf8(p).unwrap())
			.collect();
		assert!(texts.iter().any(|t| t == "saved: result=ok"), "{texts:?}");
		assert_eq!(
			std::fs::read(tmp.path().join("doc.odt")).unwrap(),
			b"stub document!"
		);
	}
}
