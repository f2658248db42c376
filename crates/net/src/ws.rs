//! WebSocket framing over a buffered stream socket.
//!
//! Implements the RFC 6455 wire format: FIN/opcode byte, 7/16/64-bit payload
//! lengths, optional 4-byte masking, continuation aggregation, and the
//! control frames. Messages always leave this layer whole; fragmentation is
//! reassembled before dispatch. The same framer runs over browser TCP
//! sockets (peer masks, we do not) and over the gateway↔worker unix pipe
//! (nobody masks, no HTTP handshake).

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};

/// Liveness ping cadence.
pub const PING_FREQUENCY: Duration = Duration::from_millis(18_000);
/// Delay before the first ping, so it does not collide with the handshake
/// response on the wire.
pub const INITIAL_PING_DELAY: Duration = Duration::from_millis(25);

/// Largest accepted frame payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Close status codes used by this server.
pub mod close_code {
	pub const NORMAL: u16 = 1000;
	pub const GOING_AWAY: u16 = 1001;
	pub const PROTOCOL_ERROR: u16 = 1002;
	pub const POLICY_VIOLATION: u16 = 1008;
	pub const UNEXPECTED_CONDITION: u16 = 1011;
}

const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

impl OpCode {
	fn from_bits(bits: u8) -> Option<Self> {
		match bits {
			0x0 => Some(Self::Continuation),
			0x1 => Some(Self::Text),
			0x2 => Some(Self::Binary),
			0x8 => Some(Self::Close),
			0x9 => Some(Self::Ping),
			0xA => Some(Self::Pong),
			_ => None,
		}
	}

	fn bits(self) -> u8 {
		match self {
			Self::Continuation => 0x0,
			Self::Text => 0x1,
			Self::Binary => 0x2,
			Self::Close => 0x8,
			Self::Ping => 0x9,
			Self::Pong => 0xA,
		}
	}
}

/// Frame-level protocol violations. All of them end the connection with a
/// `PROTOCOL_ERROR` close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
	#[error("reserved bits set in frame header")]
	ReservedBits,
	#[error("unknown opcode {0:#x}")]
	BadOpcode(u8),
	#[error("frame payload of {0} bytes exceeds the cap")]
	Oversized(u64),
	#[error("continuation frame without a message in progress")]
	StrayContinuation,
	#[error("missing or unsupported websocket upgrade fields")]
	BadUpgrade,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub fin: bool,
	pub op: OpCode,
	pub payload: Vec<u8>,
}

/// Encode a single frame into `out`.
pub fn encode_frame(op: OpCode, payload: &[u8], mask: Option<[u8; 4]>, fin: bool, out: &mut Vec<u8>) {
	let mut first = op.bits();
	if fin {
		first |= 0x80;
	}
	out.push(first);

	let mask_bit = if mask.is_some() { 0x80 } else { 0 };
	let len = payload.len();
	if len < 126 {
		out.push(mask_bit | len as u8);
	} else if len <= u16::MAX as usize {
		out.push(mask_bit | 126);
		out.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		out.push(mask_bit | 127);
		out.extend_from_slice(&(len as u64).to_be_bytes());
	}

	match mask {
		Some(key) => {
			out.extend_from_slice(&key);
			out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
		}
		None => out.extend_from_slice(payload),
	}
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, WsError> {
	if buf.len() < 2 {
		return Ok(None);
	}
	if buf[0] & 0x70 != 0 {
		return Err(WsError::ReservedBits);
	}
	let fin = buf[0] & 0x80 != 0;
	let op = OpCode::from_bits(buf[0] & 0x0F).ok_or(WsError::BadOpcode(buf[0] & 0x0F))?;
	let masked = buf[1] & 0x80 != 0;

	let mut offset = 2;
	let len: u64 = match buf[1] & 0x7F {
		126 => {
			if buf.len() < offset + 2 {
				return Ok(None);
			}
			let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
			offset += 2;
			len
		}
		127 => {
			if buf.len() < offset + 8 {
				return Ok(None);
			}
			let len = u64::from_be_bytes(buf[2..10].try_into().unwrap());
			offset += 8;
			len
		}
		n => n as u64,
	};

	if len > max_payload as u64 {
		return Err(WsError::Oversized(len));
	}

	let key = if masked {
		if buf.len() < offset + 4 {
			return Ok(None);
		}
		let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
		offset += 4;
		Some(key)
	} else {
		None
	};

	let len = len as usize;
	if buf.len() < offset + len {
		return Ok(None);
	}

	let mut payload = buf[offset..offset + len].to_vec();
	if let Some(key) = key {
		for (i, b) in payload.iter_mut().enumerate() {
			*b ^= key[i % 4];
		}
	}

	Ok(Some((Frame { fin, op, payload }, offset + len)))
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(client_key.as_bytes());
	hasher.update(HANDSHAKE_GUID.as_bytes());
	base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// An outbound message or control request queued for a framed socket.
#[derive(Debug, Clone)]
pub enum Outbound {
	Text(String),
	Binary(Vec<u8>),
	Shutdown { code: u16, reason: String },
}

/// Thread-safe outbound queue shared between a framer and the code that
/// produces messages for its peer. Pushing does not wake the poll; the
/// producer owns that responsibility.
#[derive(Debug, Default)]
pub struct OutboundQueue {
	items: Mutex<VecDeque<Outbound>>,
}

impl OutboundQueue {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn push(&self, item: Outbound) {
		self.items.lock().push_back(item);
	}

	pub fn push_text(&self, text: impl Into<String>) {
		self.push(Outbound::Text(text.into()));
	}

	pub fn push_binary(&self, data: Vec<u8>) {
		self.push(Outbound::Binary(data));
	}

	pub fn push_shutdown(&self, code: u16, reason: impl Into<String>) {
		self.push(Outbound::Shutdown {
			code,
			reason: reason.into(),
		});
	}

	fn pop(&self) -> Option<Outbound> {
		self.items.lock().pop_front()
	}

	/// Take everything queued. Test harnesses inspect traffic this way.
	#[must_use]
	pub fn drain(&self) -> Vec<Outbound> {
		self.items.lock().drain(..).collect()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.lock().is_empty()
	}
}

/// Send-side access handed to message handlers during dispatch.
pub struct WsSender<'a> {
	socket: &'a mut StreamSocket,
	mask_outbound: bool,
	shutting_down: &'a mut bool,
}

impl WsSender<'_> {
	fn mask(&self) -> Option<[u8; 4]> {
		// A constant key keeps the path deterministic; masking exists to
		// defeat proxy caches, not for secrecy.
		self.mask_outbound.then_some([0x37, 0x91, 0x5c, 0xe2])
	}

	pub fn send_text(&mut self, text: &str) {
		let mut out = Vec::with_capacity(text.len() + 8);
		encode_frame(OpCode::Text, text.as_bytes(), self.mask(), true, &mut out);
		self.socket.send(&out);
	}

	pub fn send_binary(&mut self, data: &[u8]) {
		let mut out = Vec::with_capacity(data.len() + 12);
		encode_frame(OpCode::Binary, data, self.mask(), true, &mut out);
		self.socket.send(&out);
	}

	/// Send a Close frame and stop accepting further peer messages.
	pub fn shutdown(&mut self, code: u16, reason: &str) {
		let mut payload = Vec::with_capacity(2 + reason.len());
		payload.extend_from_slice(&code.to_be_bytes());
		payload.extend_from_slice(reason.as_bytes());
		let mut out = Vec::new();
		encode_frame(OpCode::Close, &payload, self.mask(), true, &mut out);
		self.socket.send(&out);
		*self.shutting_down = true;
	}
}

/// Protocol logic above the framing layer.
pub trait WsMessageHandler: Send {
	/// A complete (reassembled) Text or Binary message arrived.
	///
	/// Return `Break` to close the connection after this message.
	fn on_message(
		&mut self,
		data: Vec<u8>,
		binary: bool,
		sender: &mut WsSender<'_>,
	) -> ControlFlow<()>;

	/// Called once per poll iteration; a natural place for periodic work.
	fn on_tick(&mut self, _now: Instant, _sender: &mut WsSender<'_>) {}

	/// The underlying socket is gone.
	fn on_disconnect(&mut self) {}
}

/// Socket handler implementing the framing protocol around a
/// [`WsMessageHandler`].
pub struct WebSocketFramer<H: WsMessageHandler> {
	handler: H,
	queue: Arc<OutboundQueue>,
	mask_outbound: bool,
	max_payload: usize,
	shutting_down: bool,
	created: Instant,
	last_ping: Option<Instant>,
	ping_outstanding: Option<Instant>,
	last_rtt: Option<Duration>,
	fragment_op: Option<OpCode>,
	fragment: Vec<u8>,
}

impl<H: WsMessageHandler> WebSocketFramer<H> {
	/// Server-role framer: peers mask, we do not.
	#[must_use]
	pub fn server(handler: H, queue: Arc<OutboundQueue>) -> Self {
		Self::new(handler, queue, false)
	}

	/// Client-role framer: we mask our frames.
	#[must_use]
	pub fn client(handler: H, queue: Arc<OutboundQueue>) -> Self {
		Self::new(handler, queue, true)
	}

	fn new(handler: H, queue: Arc<OutboundQueue>, mask_outbound: bool) -> Self {
		Self {
			handler,
			queue,
			mask_outbound,
			max_payload: DEFAULT_MAX_PAYLOAD,
			shutting_down: false,
			created: Instant::now(),
			last_ping: None,
			ping_outstanding: None,
			last_rtt: None,
			fragment_op: None,
			fragment: Vec::new(),
		}
	}

	/// Latest measured ping round-trip, if any pong arrived yet.
	#[must_use]
	pub fn last_rtt(&self) -> Option<Duration> {
		self.last_rtt
	}

	fn next_ping_due(&self, now: Instant) -> Duration {
		let due = match self.last_ping {
			None => self.created + INITIAL_PING_DELAY,
			Some(last) => last + PING_FREQUENCY,
		};
		due.saturating_duration_since(now)
	}

	fn mask(&self) -> Option<[u8; 4]> {
		self.mask_outbound.then_some([0x37, 0x91, 0x5c, 0xe2])
	}

	fn drain_queue(&mut self, socket: &mut StreamSocket) {
		while let Some(item) = self.queue.pop() {
			match item {
				Outbound::Text(text) => {
					let mut out = Vec::with_capacity(text.len() + 8);
					encode_frame(OpCode::Text, text.as_bytes(), self.mask(), true, &mut out);
					socket.send(&out);
				}
				Outbound::Binary(data) => {
					let mut out = Vec::with_capacity(data.len() + 12);
					encode_frame(OpCode::Binary, &data, self.mask(), true, &mut out);
					socket.send(&out);
				}
				Outbound::Shutdown { code, reason } => {
					// The disconnect completes when the peer echoes Close or
					// the socket drops; stop emitting queued traffic now.
					self.send_close(socket, code, &reason);
					return;
				}
			}
		}
	}

	fn send_close(&mut self, socket: &mut StreamSocket, code: u16, reason: &str) {
		if self.shutting_down {
			return;
		}
		let mut payload = Vec::with_capacity(2 + reason.len());
		payload.extend_from_slice(&code.to_be_bytes());
		payload.extend_from_slice(reason.as_bytes());
		let mut out = Vec::new();
		encode_frame(OpCode::Close, &payload, self.mask(), true, &mut out);
		socket.send(&out);
		self.shutting_down = true;
	}

	fn dispatch(
		&mut self,
		op: OpCode,
		payload: Vec<u8>,
		socket: &mut StreamSocket,
	) -> ControlFlow<()> {
		if self.shutting_down {
			// Only the close echo matters now.
			return ControlFlow::Continue(());
		}
		let mut sender = WsSender {
			socket,
			mask_outbound: self.mask_outbound,
			shutting_down: &mut self.shutting_down,
		};
		self.handler.on_message(payload, op == OpCode::Binary, &mut sender)
	}
}

impl<H: WsMessageHandler> SocketHandler for WebSocketFramer<H> {
	fn poll_events(&mut self, now: Instant, timeout: &mut Duration) -> Interest {
		*timeout = (*timeout).min(self.next_ping_due(now));
		let mut interest = Interest::READ;
		if !self.queue.is_empty() {
			interest |= Interest::WRITE;
		}
		interest
	}

	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
		loop {
			let (frame, consumed) = match decode_frame(socket.in_buffer(), self.max_payload) {
				Ok(Some(hit)) => hit,
				Ok(None) => return SocketDisposition::Continue,
				Err(e) => {
					tracing::debug!(fd = socket.raw_fd(), error = %e, "websocket protocol error");
					self.send_close(socket, close_code::PROTOCOL_ERROR, "protocol error");
					self.handler.on_disconnect();
					return SocketDisposition::Closed;
				}
			};
			socket.discard_input(consumed);

			match frame.op {
				OpCode::Ping => {
					let mut out = Vec::new();
					encode_frame(OpCode::Pong, &frame.payload, self.mask(), true, &mut out);
					socket.send(&out);
				}
				OpCode::Pong => {
					if let Some(sent) = self.ping_outstanding.take() {
						self.last_rtt = Some(sent.elapsed());
					}
				}
				OpCode::Close => {
					let already_shutting_down = self.shutting_down;
					if !already_shutting_down {
						let code = if frame.payload.len() >= 2 {
							u16::from_be_bytes([frame.payload[0], frame.payload[1]])
						} else {
							close_code::NORMAL
						};
						self.send_close(socket, code, "");
					}
					self.handler.on_disconnect();
					return SocketDisposition::Closed;
				}
				OpCode::Text | OpCode::Binary if !frame.fin => {
					self.fragment_op = Some(frame.op);
					self.fragment = frame.payload;
				}
				OpCode::Continuation => {
					let Some(op) = self.fragment_op else {
						tracing::debug!(fd = socket.raw_fd(), "stray continuation frame");
						self.send_close(socket, close_code::PROTOCOL_ERROR, "protocol error");
						self.handler.on_disconnect();
						return SocketDisposition::Closed;
					};
					self.fragment.extend_from_slice(&frame.payload);
					if frame.fin {
						self.fragment_op = None;
						let message = std::mem::take(&mut self.fragment);
						if self.dispatch(op, message, socket).is_break() {
							return SocketDisposition::Closed;
						}
					}
				}
				op => {
					if self.dispatch(op, frame.payload, socket).is_break() {
						return SocketDisposition::Closed;
					}
				}
			}
		}
	}

	fn on_timeout(&mut self, socket: &mut StreamSocket, now: Instant) -> SocketDisposition {
		self.drain_queue(socket);

		if !self.shutting_down && self.next_ping_due(now).is_zero() {
			let mut out = Vec::new();
			encode_frame(OpCode::Ping, &[], self.mask(), true, &mut out);
			socket.send(&out);
			self.last_ping = Some(now);
			self.ping_outstanding = Some(now);
		}

		let mut sender = WsSender {
			socket,
			mask_outbound: self.mask_outbound,
			shutting_down: &mut self.shutting_down,
		};
		self.handler.on_tick(now, &mut sender);
		SocketDisposition::Continue
	}

	fn on_disconnect(&mut self, _socket: &mut StreamSocket) {
		self.handler.on_disconnect();
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn accept_key_matches_rfc_vector() {
		// The worked example from RFC 6455 §1.3.
		assert_eq!(
			accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);
	}

	#[test]
	fn short_frame_round_trip() {
		let mut buf = Vec::new();
		encode_frame(OpCode::Text, b"hello", None, true, &mut buf);
		let (frame, used) = decode_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
		assert_eq!(used, buf.len());
		assert_eq!(frame.op, OpCode::Text);
		assert!(frame.fin);
		assert_eq!(frame.payload, b"hello");
	}

	#[test]
	fn masked_frame_unmasks() {
		let mut buf = Vec::new();
		encode_frame(OpCode::Binary, b"payload", Some([1, 2, 3, 4]), true, &mut buf);
		assert_ne!(&buf[6..], b"payload");
		let (frame, _) = decode_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
		assert_eq!(frame.payload, b"payload");
	}

	#[test]
	fn sixteen_bit_length_boundary() {
		let payload = vec![0xABu8; 126];
		let mut buf = Vec::new();
		encode_frame(OpCode::Binary, &payload, None, true, &mut buf);
		assert_eq!(buf[1] & 0x7F, 126);
		let (frame, _) = decode_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
		assert_eq!(frame.payload, payload);
	}

	#[test]
	fn reserved_bits_rejected() {
		let mut buf = Vec::new();
		encode_frame(OpCode::Text, b"x", None, true, &mut buf);
		buf[0] |= 0x40;
		assert_eq!(
			decode_frame(&buf, DEFAULT_MAX_PAYLOAD),
			Err(WsError::ReservedBits)
		);
	}

	#[test]
	fn oversized_frame_rejected() {
		let payload = vec![0u8; 70_000];
		let mut buf = Vec::new();
		encode_frame(OpCode::Binary, &payload, None, true, &mut buf);
		assert!(matches!(
			decode_frame(&buf, 65_536),
			Err(WsError::Oversized(70_000))
		));
	}

	#[test]
	fn partial_frames_wait_for_more() {
		let mut buf = Vec::new();
		encode_frame(OpCode::Text, b"split me", None, true, &mut buf);
		for cut in 0..buf.len() {
			assert_eq!(decode_frame(&buf[..cut], DEFAULT_MAX_PAYLOAD), Ok(None));
		}
	}

	proptest! {
		#[test]
		fn frame_round_trip_is_identity(
			payload in proptest::collection::vec(any::<u8>(), 0..200_000),
			masked in any::<bool>(),
			binary in any::<bool>(),
		) {
			let op = if binary { OpCode::Binary } else { OpCode::Text };
			let mask = masked.then_some([0x11, 0x22, 0x33, 0x44]);
			let mut buf = Vec::new();
			encode_frame(op, &payload, mask, true, &mut buf);
			let (frame, used) = decode_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
			prop_assert_eq!(used, buf.len());
			prop_assert_eq!(frame.payload, payload);
			prop_assert_eq!(frame.op, op);
			prop_assert!(frame.fin);
		}
	}
}
