//! Minimal HTTP/1.1 parsing and serialisation.
//!
//! Enough HTTP for this server's needs: inbound GET/upgrade requests on the
//! client port, and outbound requests with framed responses for the WOPI
//! storage host. Parsing is incremental over the socket's input buffer;
//! callers retry as more bytes arrive. No chunked transfer encoding — the
//! hosts we speak to frame with Content-Length or connection close.

use memchr::memmem;
use thiserror::Error;

use crate::ws::{WsError, accept_key};

const MAX_HEADERS: usize = 64;
/// Guard against unbounded header growth from a misbehaving peer.
const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
	#[error("malformed http message: {0}")]
	Malformed(&'static str),
	#[error("header section exceeds {MAX_HEADER_BYTES} bytes")]
	HeadersTooLarge,
}

/// A fully received inbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
	pub method: String,
	/// Raw path including the query string.
	pub target: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl HttpRequest {
	/// Case-insensitive single-header lookup.
	#[must_use]
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

/// A fully received response from an upstream host.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl HttpResponse {
	#[must_use]
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

fn header_section_end(buf: &[u8]) -> Result<Option<usize>, HttpError> {
	match memmem::find(buf, b"\r\n\r\n") {
		Some(pos) => Ok(Some(pos + 4)),
		None if buf.len() > MAX_HEADER_BYTES => Err(HttpError::HeadersTooLarge),
		None => Ok(None),
	}
}

fn content_length(headers: &[(String, String)]) -> Result<usize, HttpError> {
	for (name, value) in headers {
		if name.eq_ignore_ascii_case("content-length") {
			return value
				.trim()
				.parse()
				.map_err(|_| HttpError::Malformed("bad content-length"));
		}
	}
	Ok(0)
}

/// Try to parse one request from the front of `buf`.
///
/// Returns the request and bytes consumed, or `None` when incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, HttpError> {
	let Some(header_end) = header_section_end(buf)? else {
		return Ok(None);
	};

	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut req = httparse::Request::new(&mut headers);
	match req.parse(buf) {
		Ok(httparse::Status::Complete(_)) => {}
		Ok(httparse::Status::Partial) => return Ok(None),
		Err(_) => return Err(HttpError::Malformed("request head")),
	}

	let parsed_headers: Vec<(String, String)> = req
		.headers
		.iter()
		.map(|h| {
			(
				h.name.to_string(),
				String::from_utf8_lossy(h.value).into_owned(),
			)
		})
		.collect();

	let body_len = content_length(&parsed_headers)?;
	let total = header_end + body_len;
	if buf.len() < total {
		return Ok(None);
	}

	Ok(Some((
		HttpRequest {
			method: req.method.unwrap_or("").to_string(),
			target: req.path.unwrap_or("").to_string(),
			headers: parsed_headers,
			body: buf[header_end..total].to_vec(),
		},
		total,
	)))
}

/// Try to parse one response from the front of `buf`.
///
/// `eof` marks that the peer closed the connection, which terminates a
/// response with neither Content-Length nor chunking.
pub fn parse_response(buf: &[u8], eof: bool) -> Result<Option<(HttpResponse, usize)>, HttpError> {
	let Some(header_end) = header_section_end(buf)? else {
		return Ok(None);
	};

	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut resp = httparse::Response::new(&mut headers);
	match resp.parse(buf) {
		Ok(httparse::Status::Complete(_)) => {}
		Ok(httparse::Status::Partial) => return Ok(None),
		Err(_) => return Err(HttpError::Malformed("response head")),
	}

	let parsed_headers: Vec<(String, String)> = resp
		.headers
		.iter()
		.map(|h| {
			(
				h.name.to_string(),
				String::from_utf8_lossy(h.value).into_owned(),
			)
		})
		.collect();

	let has_length = parsed_headers
		.iter()
		.any(|(n, _)| n.eq_ignore_ascii_case("content-length"));

	let (body, total) = if has_length {
		let body_len = content_length(&parsed_headers)?;
		let total = header_end + body_len;
		if buf.len() < total {
			return Ok(None);
		}
		(buf[header_end..total].to_vec(), total)
	} else if eof {
		(buf[header_end..].to_vec(), buf.len())
	} else {
		return Ok(None);
	};

	Ok(Some((
		HttpResponse {
			status: resp.code.ok_or(HttpError::Malformed("missing status"))?,
			headers: parsed_headers,
			body,
		},
		total,
	)))
}

/// Serialise an outbound request.
#[must_use]
pub fn serialize_request(
	method: &str,
	target: &str,
	host: &str,
	headers: &[(String, String)],
	body: &[u8],
) -> Vec<u8> {
	let mut out = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\n");
	for (name, value) in headers {
		out.push_str(name);
		out.push_str(": ");
		out.push_str(value);
		out.push_str("\r\n");
	}
	out.push_str(&format!("Content-Length: {}\r\n", body.len()));
	out.push_str("Connection: close\r\n\r\n");
	let mut bytes = out.into_bytes();
	bytes.extend_from_slice(body);
	bytes
}

/// Serialise a simple response.
#[must_use]
pub fn serialize_response(
	status: u16,
	reason: &str,
	headers: &[(&str, &str)],
	body: &[u8],
) -> Vec<u8> {
	let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
	for (name, value) in headers {
		out.push_str(&format!("{name}: {value}\r\n"));
	}
	out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
	let mut bytes = out.into_bytes();
	bytes.extend_from_slice(body);
	bytes
}

/// Validate a WebSocket upgrade request and return the computed
/// `Sec-WebSocket-Accept` value.
pub fn validate_ws_upgrade(req: &HttpRequest) -> Result<String, WsError> {
	let upgrade_ok = req
		.header("Upgrade")
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let version_ok = req.header("Sec-WebSocket-Version") == Some("13");
	let Some(key) = req.header("Sec-WebSocket-Key") else {
		return Err(WsError::BadUpgrade);
	};
	if !upgrade_ok || !version_ok || key.is_empty() {
		return Err(WsError::BadUpgrade);
	}
	Ok(accept_key(key))
}

/// The 101 switching-protocols response for an accepted upgrade.
#[must_use]
pub fn ws_upgrade_response(accept: &str) -> Vec<u8> {
	format!(
		"HTTP/1.1 101 Switching Protocols\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Accept: {accept}\r\n\r\n"
	)
	.into_bytes()
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn parses_request_with_body() {
		let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello extra";
		let (req, used) = parse_request(raw).unwrap().unwrap();
		assert_eq!(req.method, "POST");
		assert_eq!(req.target, "/x");
		assert_eq!(req.body, b"hello");
		assert_eq!(&raw[used..], b" extra");
	}

	#[test]
	fn incomplete_request_returns_none() {
		let raw = b"GET / HTTP/1.1\r\nHost: h\r\n";
		assert!(parse_request(raw).unwrap().is_none());
	}

	#[test]
	fn upgrade_validation() {
		let req = HttpRequest {
			method: "GET".into(),
			target: "/ws".into(),
			headers: vec![
				("Upgrade".into(), "websocket".into()),
				("Sec-WebSocket-Version".into(), "13".into()),
				("Sec-WebSocket-Key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into()),
			],
			body: Vec::new(),
		};
		assert_eq!(
			validate_ws_upgrade(&req).unwrap(),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);

		let mut bad = req.clone();
		bad.headers[1].1 = "8".into();
		assert!(validate_ws_upgrade(&bad).is_err());
	}

	#[test]
	fn response_without_length_needs_eof() {
		let raw = b"HTTP/1.1 200 OK\r\n\r\nbody bytes";
		assert!(parse_response(raw, false).unwrap().is_none());
		let (resp, _) = parse_response(raw, true).unwrap().unwrap();
		assert_eq!(resp.status, 200);
		assert_eq!(resp.body, b"body bytes");
	}
}
