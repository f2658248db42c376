//! Storage failure classification.
//!
//! Upload and lock failures fall into four client-visible classes; the
//! broker retries only the transient ones.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
	/// Network failure, timeout, or 5xx from the host. Retryable.
	#[error("transient storage failure: {0}")]
	Transient(String),

	/// The document changed remotely (409/412, or the host's own
	/// doc-changed status code). Not retryable; the user decides.
	#[error("document conflict reported by storage")]
	Conflict,

	/// 401/403 from the host. Not retryable.
	#[error("storage host rejected the credentials")]
	Auth,

	/// The host reported it is out of space. Not retryable; further
	/// modifications are refused.
	#[error("storage host is out of space")]
	DiskFull,

	/// The host name is not on the configured allow list.
	#[error("storage host '{0}' is not allowed")]
	HostNotAllowed(String),

	/// The WOPI URL or a response body could not be understood.
	#[error("malformed storage exchange: {0}")]
	Malformed(String),
}

impl StorageError {
	/// Whether the broker may retry the operation with backoff.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_))
	}

	/// The `kind=` token used when surfacing this to a client.
	#[must_use]
	pub fn client_kind(&self) -> &'static str {
		match self {
			Self::Transient(_) | Self::Malformed(_) => "savefailed",
			Self::Conflict => "documentconflict",
			Self::Auth | Self::HostNotAllowed(_) => "unauthorized",
			Self::DiskFull => "diskfull",
		}
	}
}
