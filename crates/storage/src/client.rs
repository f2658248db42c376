//! Outbound HTTP driven by a socket poll.
//!
//! A storage request becomes one [`HttpClientSession`] socket inserted into
//! the calling broker's poll: the request bytes are queued up front, the
//! response is parsed incrementally as the loop feeds the buffer, and the
//! completion callback fires on the poll thread. There is no dedicated
//! client thread and no blocking wait; cancellation is the session's
//! deadline closing the socket.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_net::http::{HttpResponse, parse_response, serialize_request};
use quill_net::socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};
use quill_net::{SocketPoll, TlsSession};
use url::Url;

use crate::error::StorageError;
use crate::wopi::StorageRequest;

/// Bound on how long the synchronous TCP connect may take; everything after
/// the connect is non-blocking on the poll.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type FetchResult = Result<HttpResponse, StorageError>;
type FetchCallback = Box<dyn FnOnce(FetchResult) + Send>;

/// Issue `request` on `poll`, invoking `callback` on the poll thread when
/// the response arrives, the deadline passes, or the connection fails.
pub fn fetch(
	poll: &Arc<SocketPoll>,
	request: &StorageRequest,
	tls: Option<Arc<rustls::ClientConfig>>,
	timeout: Duration,
	callback: impl FnOnce(FetchResult) + Send + 'static,
) -> Result<(), StorageError> {
	let url = &request.url;
	let (host, port, use_tls) = endpoint(url)?;

	let stream = TcpStream::connect_timeout(
		&resolve(&host, port)?,
		CONNECT_TIMEOUT.min(timeout),
	)
	.map_err(|e| StorageError::Transient(format!("connect {host}:{port}: {e}")))?;
	let mut socket = StreamSocket::from_fd(stream.into())
		.map_err(|e| StorageError::Transient(format!("socket setup: {e}")))?;

	if use_tls {
		let Some(config) = tls else {
			return Err(StorageError::Malformed(format!(
				"https storage '{host}' without tls configuration"
			)));
		};
		let session = TlsSession::client(config, &host)
			.map_err(|e| StorageError::Transient(format!("tls setup: {e}")))?;
		socket.start_tls(session);
	}

	let target = match url.query() {
		Some(query) => format!("{}?{query}", url.path()),
		None => url.path().to_string(),
	};
	let host_header = if port == default_port(use_tls) {
		host.clone()
	} else {
		format!("{host}:{port}")
	};
	socket.send(&serialize_request(
		request.method,
		&target,
		&host_header,
		&request.headers,
		&request.body,
	));

	poll.insert_socket(
		socket,
		Box::new(HttpClientSession {
			deadline: Instant::now() + timeout,
			callback: Some(Box::new(callback)),
		}),
	);
	Ok(())
}

fn endpoint(url: &Url) -> Result<(String, u16, bool), StorageError> {
	let use_tls = match url.scheme() {
		"http" => false,
		"https" => true,
		other => {
			return Err(StorageError::Malformed(format!(
				"unsupported storage scheme '{other}'"
			)));
		}
	};
	let host = url
		.host_str()
		.ok_or_else(|| StorageError::Malformed("storage url without host".to_string()))?
		.to_string();
	let port = url.port().unwrap_or(default_port(use_tls));
	Ok((host, port, use_tls))
}

fn default_port(tls: bool) -> u16 {
	if tls { 443 } else { 80 }
}

fn resolve(host: &str, port: u16) -> Result<std::net::SocketAddr, StorageError> {
	use std::net::ToSocketAddrs;
	(host, port)
		.to_socket_addrs()
		.map_err(|e| StorageError::Transient(format!("resolve {host}: {e}")))?
		.next()
		.ok_or_else(|| StorageError::Transient(format!("no address for {host}")))
}

struct HttpClientSession {
	deadline: Instant,
	callback: Option<FetchCallback>,
}

impl HttpClientSession {
	fn finish(&mut self, result: FetchResult) {
		if let Some(callback) = self.callback.take() {
			callback(result);
		}
	}

	fn try_parse(&mut self, socket: &mut StreamSocket) -> Option<SocketDisposition> {
		match parse_response(socket.in_buffer(), socket.is_closed()) {
			Ok(Some((response, _consumed))) => {
				self.finish(Ok(response));
				Some(SocketDisposition::Closed)
			}
			Ok(None) => None,
			Err(e) => {
				self.finish(Err(StorageError::Malformed(e.to_string())));
				Some(SocketDisposition::Closed)
			}
		}
	}
}

impl SocketHandler for HttpClientSession {
	fn poll_events(&mut self, now: Instant, timeout: &mut Duration) -> Interest {
		*timeout = (*timeout).min(self.deadline.saturating_duration_since(now));
		Interest::READ
	}

	fn on_readable(&mut self, socket: &mut StreamSocket) -> SocketDisposition {
		self.try_parse(socket).unwrap_or(SocketDisposition::Continue)
	}

	fn on_timeout(&mut self, _socket: &mut StreamSocket, now: Instant) -> SocketDisposition {
		if now >= self.deadline && self.callback.is_some() {
			tracing::warn!("storage request timed out");
			self.finish(Err(StorageError::Transient(
				"storage request timed out".to_string(),
			)));
			return SocketDisposition::Closed;
		}
		SocketDisposition::Continue
	}

	fn on_disconnect(&mut self, socket: &mut StreamSocket) {
		if self.callback.is_some() && self.try_parse(socket).is_none() {
			self.finish(Err(StorageError::Transient(
				"storage connection closed early".to_string(),
			)));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::{Read, Write};
	use std::net::TcpListener;
	use std::sync::mpsc;

	use super::*;
	use crate::wopi::WopiSource;

	fn one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		std::thread::spawn(move || {
			let (mut stream, _) = listener.accept().unwrap();
			let mut buf = [0u8; 4096];
			let _ = stream.read(&mut buf);
			stream.write_all(response).unwrap();
		});
		addr
	}

	#[test]
	fn fetches_a_response() {
		let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
		let poll = SocketPoll::new("storage-test").unwrap();
		poll.start_thread();

		let src =
			WopiSource::new(&format!("http://{addr}/wopi/files/1?access_token=t"), None).unwrap();
		let (tx, rx) = mpsc::channel();
		fetch(
			&poll,
			&src.file_info_request(),
			None,
			Duration::from_secs(5),
			move |result| {
				tx.send(result).unwrap();
			},
		)
		.unwrap();

		let response = rx
			.recv_timeout(Duration::from_secs(5))
			.unwrap()
			.unwrap();
		assert_eq!(response.status, 200);
		assert_eq!(response.body, b"ok");
		poll.stop();
	}

	#[test]
	fn times_out_when_host_stalls() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		// Accept but never answer.
		std::thread::spawn(move || {
			let (_stream, _) = listener.accept().unwrap();
			std::thread::sleep(Duration::from_secs(10));
		});

		let poll = SocketPoll::new("storage-timeout").unwrap();
		poll.start_thread();

		let src =
			WopiSource::new(&format!("http://{addr}/wopi/files/1?access_token=t"), None).unwrap();
		let (tx, rx) = mpsc::channel();
		fetch(
			&poll,
			&src.file_info_request(),
			None,
			Duration::from_millis(200),
			move |result| {
				tx.send(result).unwrap();
			},
		)
		.unwrap();

		let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert!(matches!(result, Err(StorageError::Transient(_))));
		poll.stop();
	}
}
