//! End-to-end: real sockets, real framing, in-process workers.
//!
//! The gateway serves on ephemeral ports; the launcher runs workers as
//! threads over the same unix intake socket the spawner's forks would use,
//! with the deterministic stub render backend. Clients are plain TCP
//! WebSocket connections doing the actual upgrade handshake.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use quill_config::Config;
use quill_gateway::Gateway;
use quill_gateway::spawner::WorkerLauncher;
use quill_net::ws::{DEFAULT_MAX_PAYLOAD, OpCode, decode_frame, encode_frame};

/// Launcher that runs each worker as a thread in this process.
struct ThreadLauncher {
	master: PathBuf,
	spawned: AtomicU64,
}

impl WorkerLauncher for ThreadLauncher {
	fn request_workers(&self, count: u32) {
		for _ in 0..count {
			let master = self.master.clone();
			let id = self.spawned.fetch_add(1, Ordering::SeqCst);
			std::thread::spawn(move || {
				let stream = std::os::unix::net::UnixStream::connect(&master)
					.expect("worker cannot reach gateway");
				let socket = quill_net::StreamSocket::from_fd(stream.into()).unwrap();
				let backend = Box::new(quill_worker::StubBackend::default());
				let _ = quill_worker::main_loop::run(socket, &format!("tjail{id}"), false, backend);
			});
		}
	}
}

/// A straightforward blocking WebSocket client for tests.
struct TabClient {
	stream: TcpStream,
	buffer: Vec<u8>,
}

impl TabClient {
	fn connect(addr: &std::net::SocketAddr, wopi_src: &str) -> Self {
		let mut stream = TcpStream::connect(addr).unwrap();
		let encoded = percent_encode(wopi_src);
		let request = format!(
			"GET /cool/{encoded}/ws?WOPISrc={encoded} HTTP/1.1\r\n\
			 Host: test\r\n\
			 Upgrade: websocket\r\n\
			 Connection: Upgrade\r\n\
			 Sec-WebSocket-Version: 13\r\n\
			 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
		);
		stream.write_all(request.as_bytes()).unwrap();

		// Read through the 101 response.
		let mut head = Vec::new();
		let mut byte = [0u8; 1];
		while !head.ends_with(b"\r\n\r\n") {
			stream.read_exact(&mut byte).unwrap();
			head.push(byte[0]);
		}
		let head = String::from_utf8_lossy(&head);
		assert!(head.starts_with("HTTP/1.1 101"), "no upgrade: {head}");
		assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

		stream
			.set_read_timeout(Some(Duration::from_millis(50)))
			.unwrap();
		Self {
			stream,
			buffer: Vec::new(),
		}
	}

	fn send(&mut self, line: &str) {
		let mut frame = Vec::new();
		// Browsers mask client frames.
		encode_frame(
			OpCode::Text,
			line.as_bytes(),
			Some([1, 2, 3, 4]),
			true,
			&mut frame,
		);
		self.stream.write_all(&frame).unwrap();
	}

	/// Pull whatever has arrived into the local frame buffer.
	fn pump(&mut self) {
		let mut chunk = [0u8; 65536];
		loop {
			match self.stream.read(&mut chunk) {
				Ok(0) | Err(_) => break,
				Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
			}
		}
	}

	/// Wait until a data frame matching `want` arrives; returns it.
	fn expect(&mut self, want: impl Fn(bool, &[u8]) -> bool, what: &str) -> (bool, Vec<u8>) {
		let deadline = Instant::now() + Duration::from_secs(10);
		while Instant::now() < deadline {
			self.pump();
			let mut rest = 0;
			while let Ok(Some((frame, used))) =
				decode_frame(&self.buffer[rest..], DEFAULT_MAX_PAYLOAD)
			{
				rest += used;
				if matches!(frame.op, OpCode::Text | OpCode::Binary)
					&& want(frame.op == OpCode::Binary, &frame.payload)
				{
					self.buffer.drain(..rest);
					return (frame.op == OpCode::Binary, frame.payload);
				}
			}
			self.buffer.drain(..rest);
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("timed out waiting for {what}");
	}

	fn expect_text_starting(&mut self, prefix: &str) -> String {
		let (_, payload) = self.expect(
			|binary, payload| !binary && payload.starts_with(prefix.as_bytes()),
			prefix,
		);
		String::from_utf8(payload).unwrap()
	}
}

fn percent_encode(input: &str) -> String {
	let mut out = String::with_capacity(input.len() * 3);
	for b in input.bytes() {
		if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
			out.push(b as char);
		} else {
			out.push_str(&format!("%{b:02X}"));
		}
	}
	out
}

struct Server {
	gateway: Arc<Gateway>,
	addr: std::net::SocketAddr,
	doc: PathBuf,
	_tmp: tempfile::TempDir,
}

fn start_server() -> Server {
	let tmp = tempfile::tempdir().unwrap();
	let doc = tmp.path().join("hello.odt");
	std::fs::write(&doc, b"two tab document").unwrap();

	let mut config = Config::defaults();
	config.storage.filesystem.allow = true;
	config.child_root_path = tmp.path().join("jails");
	config.cache_path = tmp.path().join("cache");
	std::fs::create_dir_all(&config.child_root_path).unwrap();

	let master = tmp.path().join("worker.sock");
	let launcher = Box::new(ThreadLauncher {
		master: master.clone(),
		spawned: AtomicU64::new(0),
	});
	let gateway = Gateway::new(Arc::new(config), launcher, None).unwrap();

	let clients = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = clients.local_addr().unwrap();
	let workers = std::os::unix::net::UnixListener::bind(&master).unwrap();
	gateway.serve_on(clients, workers).unwrap();

	Server {
		gateway,
		addr,
		doc,
		_tmp: tmp,
	}
}

const TILE: &str =
	"tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";

#[test]
fn two_tabs_share_one_worker_and_see_each_other() {
	let server = start_server();
	let url = format!("file://{}", server.doc.display());

	let mut tab_a = TabClient::connect(&server.addr, &url);
	tab_a.send(&format!("load url={url}"));
	let status_a = tab_a.expect_text_starting("status: ");

	let mut tab_b = TabClient::connect(&server.addr, &url);
	tab_b.send(&format!("load url={url}"));
	let status_b = tab_b.expect_text_starting("status: ");

	// Same document, same broker, same status.
	assert_eq!(status_a, status_b);
	assert_eq!(server.gateway.registry().len(), 1);

	// One worker serves both tabs.
	let brokers = server.gateway.registry().all();
	assert_eq!(brokers.len(), 1);
	assert!(brokers[0].worker_pid().is_some());

	// Tab A acts; tab B observes the document change.
	tab_a.send("mouse type=buttondown x=10 y=20 count=1");
	tab_b.expect_text_starting("invalidatetiles: ");
}

#[test]
fn identical_tiles_are_rendered_once_and_shared() {
	let server = start_server();
	let url = format!("file://{}", server.doc.display());

	let mut tab_a = TabClient::connect(&server.addr, &url);
	tab_a.send(&format!("load url={url}"));
	tab_a.expect_text_starting("status: ");
	let mut tab_b = TabClient::connect(&server.addr, &url);
	tab_b.send(&format!("load url={url}"));
	tab_b.expect_text_starting("status: ");

	tab_a.send(TILE);
	tab_b.send(TILE);

	let (_, bytes_a) = tab_a.expect(|binary, _| binary, "tile for tab A");
	let (_, bytes_b) = tab_b.expect(|binary, _| binary, "tile for tab B");
	assert_eq!(bytes_a, bytes_b, "tabs saw different bitmaps for one tile");
}

#[test]
fn ping_round_trips_through_the_stack() {
	let server = start_server();
	let url = format!("file://{}", server.doc.display());

	let mut tab = TabClient::connect(&server.addr, &url);
	tab.send(&format!("load url={url}"));
	tab.send("ping");
	tab.expect(|binary, payload| !binary && payload == b"pong", "pong");
}
