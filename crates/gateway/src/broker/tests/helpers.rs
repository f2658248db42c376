//! Common test utilities and fakes.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quill_config::Config;
use quill_net::ws::{Outbound, OutboundQueue};
use quill_proto::{DocKey, SessionId};

use crate::broker::worker::WorkerLink;
use crate::broker::DocumentBroker;
use crate::registry::{BrokerRegistry, Lookup};

/// A broker wired up for tests, plus the scratch directory backing it.
pub struct TestRig {
	pub registry: Arc<BrokerRegistry>,
	pub broker: Arc<DocumentBroker>,
	pub config: Arc<Config>,
	pub origin: PathBuf,
	pub tmp: tempfile::TempDir,
}

/// Build a rig around a local `file://` document containing `doc-bytes`.
pub fn rig() -> TestRig {
	rig_for_url(None)
}

/// Build a rig whose document lives at `url` (a stub WOPI host), or at a
/// scratch file when `None`.
pub fn rig_for_url(url: Option<String>) -> TestRig {
	let tmp = tempfile::tempdir().expect("tempdir");
	let origin = tmp.path().join("hello.odt");
	std::fs::write(&origin, b"doc-bytes").expect("write origin");

	let mut config = Config::defaults();
	config.storage.filesystem.allow = true;
	config.child_root_path = tmp.path().join("jails");
	config.cache_path = tmp.path().join("cache");

	let config = Arc::new(config);
	let registry = BrokerRegistry::new();
	let url = url.unwrap_or_else(|| format!("file://{}", origin.display()));
	let key = DocKey::from_wopi_src(&url).expect("doc key");

	let lookup = registry
		.find_or_create(&key, || {
			DocumentBroker::new(
				key.clone(),
				url.clone(),
				Arc::clone(&config),
				None,
				None,
				Arc::clone(&registry),
			)
		})
		.expect("broker");
	let broker = match lookup {
		Lookup::Created(broker) => broker,
		_ => panic!("expected fresh broker"),
	};

	TestRig {
		registry,
		broker,
		config,
		origin,
		tmp,
	}
}

impl TestRig {
	pub fn file_url(&self) -> String {
		format!("file://{}", self.origin.display())
	}
}

/// A captured client session.
pub struct TestSession {
	pub id: SessionId,
	pub queue: Arc<OutboundQueue>,
	received: Vec<Outbound>,
}

impl TestSession {
	/// Attach a fresh session to the broker.
	pub fn attach(broker: &Arc<DocumentBroker>, id: u64) -> Self {
		let id = SessionId(id);
		let queue = OutboundQueue::new();
		broker.add_session(id, Arc::clone(&queue));
		Self {
			id,
			queue,
			received: Vec::new(),
		}
	}

	pub fn load(&self, broker: &Arc<DocumentBroker>, url: &str) {
		broker.dispatch_client_message(self.id, &format!("load url={url}"));
	}

	fn pump(&mut self) {
		self.received.extend(self.queue.drain());
	}

	/// All text messages received so far.
	pub fn texts(&mut self) -> Vec<String> {
		self.pump();
		self.received
			.iter()
			.filter_map(|m| match m {
				Outbound::Text(t) => Some(t.clone()),
				_ => None,
			})
			.collect()
	}

	/// All binary messages received so far.
	pub fn binaries(&mut self) -> Vec<Vec<u8>> {
		self.pump();
		self.received
			.iter()
			.filter_map(|m| match m {
				Outbound::Binary(b) => Some(b.clone()),
				_ => None,
			})
			.collect()
	}

	/// Whether a close was queued for this session.
	pub fn was_shut_down(&mut self) -> bool {
		self.pump();
		self.received
			.iter()
			.any(|m| matches!(m, Outbound::Shutdown { .. }))
	}
}

/// An in-process stand-in for the worker side of the pipe.
pub struct FakeWorker {
	pub queue: Arc<OutboundQueue>,
	broker: Arc<DocumentBroker>,
	seen: Vec<String>,
}

impl FakeWorker {
	/// Attach to the broker as its worker.
	pub fn attach(broker: &Arc<DocumentBroker>) -> Self {
		let queue = OutboundQueue::new();
		let link = WorkerLink {
			jail_id: "testjail".to_string(),
			pid: std::process::id() as i32,
			chrooted: false,
			queue: Arc::clone(&queue),
		};
		assert!(broker.attach_worker(link), "worker attach refused");
		Self {
			queue,
			broker: Arc::clone(broker),
			seen: Vec::new(),
		}
	}

	/// Try to attach a second worker; returns whether the broker took it.
	pub fn try_attach_another(broker: &Arc<DocumentBroker>) -> bool {
		broker.attach_worker(WorkerLink {
			jail_id: "extrajail".to_string(),
			pid: 4242,
			chrooted: false,
			queue: OutboundQueue::new(),
		})
	}

	/// Text messages the gateway sent to this worker so far.
	pub fn sent(&mut self) -> Vec<String> {
		self.seen.extend(self.queue.drain().into_iter().filter_map(|m| match m {
			Outbound::Text(t) => Some(t),
			_ => None,
		}));
		self.seen.clone()
	}

	/// Reply with the post-load status line, taking the broker Live.
	pub fn complete_load(&self) {
		self.reply("status: type=text parts=1 current=0 width=12000 height=8000");
	}

	/// Send a text message up the pipe.
	pub fn reply(&self, line: &str) {
		self.broker
			.dispatch_worker_message(line.as_bytes().to_vec(), false);
	}

	/// Send a rendered tile up the pipe.
	pub fn reply_tile(&self, desc: &quill_proto::TileDesc, bytes: &[u8]) {
		let mut message = desc.serialize("tile:").into_bytes();
		message.push(b'\n');
		message.extend_from_slice(bytes);
		self.broker.dispatch_worker_message(message, true);
	}

	/// Acknowledge a save request.
	pub fn ack_save(&self) {
		self.reply("saved: result=ok");
	}
}

/// Drive a broker from attach through Live with one session.
pub fn go_live(rig: &TestRig, session: &TestSession) -> FakeWorker {
	session.load(&rig.broker, &rig.file_url());
	let worker = FakeWorker::attach(&rig.broker);
	worker.complete_load();
	worker
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if cond() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(10));
	}
	cond()
}

/// A minimal WOPI host on a loopback port.
pub struct StubWopiHost {
	pub addr: std::net::SocketAddr,
	pub put_status: Arc<AtomicU16>,
	pub put_bodies: Arc<Mutex<Vec<Vec<u8>>>>,
	pub requests: Arc<AtomicUsize>,
}

impl StubWopiHost {
	pub fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub host");
		let addr = listener.local_addr().unwrap();
		let put_status = Arc::new(AtomicU16::new(200));
		let put_bodies = Arc::new(Mutex::new(Vec::new()));
		let requests = Arc::new(AtomicUsize::new(0));

		let status = Arc::clone(&put_status);
		let bodies = Arc::clone(&put_bodies);
		let count = Arc::clone(&requests);
		std::thread::spawn(move || {
			for stream in listener.incoming() {
				let Ok(mut stream) = stream else { break };
				count.fetch_add(1, Ordering::SeqCst);
				let mut buf = Vec::new();
				let mut chunk = [0u8; 4096];
				let request = loop {
					match quill_net::http::parse_request(&buf) {
						Ok(Some((request, _))) => break Some(request),
						Ok(None) => {}
						Err(_) => break None,
					}
					match stream.read(&mut chunk) {
						Ok(0) | Err(_) => break None,
						Ok(n) => buf.extend_from_slice(&chunk[..n]),
					}
				};
				let Some(request) = request else { continue };

				let path = request.target.split('?').next().unwrap_or("");
				let response = if request.method == "GET" && path.ends_with("/contents") {
					ok_response(b"doc-bytes", "application/octet-stream")
				} else if request.method == "GET" {
					let info = br#"{
						"BaseFileName": "hello.odt",
						"OwnerId": "owner",
						"UserId": "u1",
						"UserFriendlyName": "Ada",
						"Size": 9,
						"UserCanWrite": true,
						"SupportsLocks": false
					}"#;
					ok_response(info, "application/json")
				} else if request.method == "POST" && path.ends_with("/contents") {
					bodies.lock().push(request.body.clone());
					let code = status.load(Ordering::SeqCst);
					let body: &[u8] = if code == 409 {
						br#"{"LOOLStatusCode":1010}"#
					} else {
						b"{}"
					};
					error_response(code, body)
				} else {
					// Lock traffic.
					ok_response(b"{}", "application/json")
				};
				let _ = stream.write_all(&response);
			}
		});

		Self {
			addr,
			put_status,
			put_bodies,
			requests,
		}
	}

	pub fn wopi_src(&self) -> String {
		format!("http://{}/wopi/files/1?access_token=test", self.addr)
	}

	pub fn put_count(&self) -> usize {
		self.put_bodies.lock().len()
	}
}

fn ok_response(body: &[u8], content_type: &str) -> Vec<u8> {
	let mut out = format!(
		"HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
		body.len()
	)
	.into_bytes();
	out.extend_from_slice(body);
	out
}

fn error_response(code: u16, body: &[u8]) -> Vec<u8> {
	let mut out = format!(
		"HTTP/1.1 {code} Status\r\nContent-Length: {}\r\n\r\n",
		body.len()
	)
	.into_bytes();
	out.extend_from_slice(body);
	out
}
