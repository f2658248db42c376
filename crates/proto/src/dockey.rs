//! Document keys.
//!
//! The key canonically identifies one document across every client that
//! references it: two WOPI URLs naming the same file must yield byte-equal
//! keys, independent of their access tokens or other query noise.

use std::fmt;

use url::Url;

use crate::error::{ErrorKind, ProtocolError};

/// Canonical identity of a document, derived from its normalised WOPI URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(String);

impl DocKey {
	/// Derive the key for a WOPI source URL.
	///
	/// The URL is parsed (which lower-cases scheme and host, resolves default
	/// ports, and normalises percent-encoding), then stripped of its query
	/// and fragment. The remaining serialisation is the key.
	pub fn from_wopi_src(wopi_src: &str) -> Result<Self, ProtocolError> {
		let mut parsed = Url::parse(wopi_src)
			.map_err(|_| ProtocolError::new("load", ErrorKind::Syntax))?;
		parsed.set_query(None);
		parsed.set_fragment(None);
		Ok(Self(parsed.to_string()))
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DocKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn token_does_not_change_key() {
		let a = DocKey::from_wopi_src("https://host/wopi/files/7?access_token=abc").unwrap();
		let b = DocKey::from_wopi_src("https://host/wopi/files/7?access_token=xyz").unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn host_case_and_default_port_normalise() {
		let a = DocKey::from_wopi_src("https://HOST:443/wopi/files/7").unwrap();
		let b = DocKey::from_wopi_src("https://host/wopi/files/7").unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn different_files_differ() {
		let a = DocKey::from_wopi_src("file:///t/hello.odt").unwrap();
		let b = DocKey::from_wopi_src("file:///t/other.odt").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn garbage_is_a_syntax_error() {
		assert!(DocKey::from_wopi_src("not a url").is_err());
	}
}
