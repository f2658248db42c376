//! Client URL parsing.
//!
//! The document socket URL looks like
//! `/<service-root>[/<proxy-prefix>]/cool/<encoded-document-URI>/ws?WOPISrc=<url>&...`.
//! Fronting proxies may splice an opaque prefix between the service root and
//! the `cool` segment; it is preserved for public-URI reconstruction and
//! ignored for routing.

/// Parsed details of a document request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDetails {
	/// Decoded document URI from the path.
	pub doc_uri: String,
	/// The WOPISrc query value (falls back to the path's document URI).
	pub wopi_src: String,
	/// Whether the target names the websocket endpoint.
	pub is_websocket: bool,
	/// Opaque proxy segment(s) between the service root and `cool`.
	pub proxy_prefix: String,
}

impl RequestDetails {
	/// Parse a request target. Returns `None` when the path does not name a
	/// document endpoint under `service_root`.
	#[must_use]
	pub fn parse(target: &str, service_root: &str) -> Option<Self> {
		let (path, query) = match target.split_once('?') {
			Some((p, q)) => (p, q),
			None => (target, ""),
		};

		let path = path.strip_prefix(service_root).unwrap_or(path);
		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let cool = segments.iter().position(|s| *s == "cool")?;
		let encoded_doc = segments.get(cool + 1)?;
		let doc_uri = percent_decode(encoded_doc);

		let wopi_src = query_param(query, "WOPISrc")
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| doc_uri.clone());

		Some(Self {
			doc_uri,
			wopi_src,
			is_websocket: segments.last() == Some(&"ws"),
			proxy_prefix: segments[..cool].join("/"),
		})
	}
}

/// Extract and decode one query parameter.
#[must_use]
pub fn query_param(query: &str, name: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=')?;
		(k == name).then(|| percent_decode(&v.replace('+', " ")))
	})
}

fn percent_decode(input: &str) -> String {
	let bytes = input.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%'
			&& i + 2 < bytes.len()
			&& let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2]))
		{
			out.push(hi << 4 | lo);
			i += 3;
		} else {
			out.push(bytes[i]);
			i += 1;
		}
	}
	String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
	match b {
		b'0'..=b'9' => Some(b - b'0'),
		b'a'..=b'f' => Some(b - b'a' + 10),
		b'A'..=b'F' => Some(b - b'A' + 10),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn parses_plain_document_socket_url() {
		let details = RequestDetails::parse(
			"/cool/file%3A%2F%2F%2Ft%2Fhello.odt/ws?WOPISrc=file%3A%2F%2F%2Ft%2Fhello.odt",
			"",
		)
		.unwrap();
		assert_eq!(details.doc_uri, "file:///t/hello.odt");
		assert_eq!(details.wopi_src, "file:///t/hello.odt");
		assert!(details.is_websocket);
		assert_eq!(details.proxy_prefix, "");
	}

	#[test]
	fn strips_service_root_and_keeps_proxy_prefix() {
		let details = RequestDetails::parse(
			"/quill/proxyhash123/cool/https%3A%2F%2Fh%2Fwopi%2Ffiles%2F9/ws?WOPISrc=https%3A%2F%2Fh%2Fwopi%2Ffiles%2F9",
			"/quill",
		)
		.unwrap();
		assert_eq!(details.proxy_prefix, "proxyhash123");
		assert_eq!(details.wopi_src, "https://h/wopi/files/9");
	}

	#[test]
	fn wopi_src_falls_back_to_path() {
		let details =
			RequestDetails::parse("/cool/file%3A%2F%2F%2Ft%2Fa.odt/ws", "").unwrap();
		assert_eq!(details.wopi_src, "file:///t/a.odt");
	}

	#[test]
	fn non_document_paths_are_rejected() {
		assert_eq!(RequestDetails::parse("/hosting/discovery", ""), None);
		assert_eq!(RequestDetails::parse("/", ""), None);
	}
}
