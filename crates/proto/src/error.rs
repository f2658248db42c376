//! Protocol error kinds and their client-visible rendering.

use std::fmt;

use thiserror::Error;

/// Client-visible error kinds, sent as `error: cmd=<c> kind=<k>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Malformed message or unparseable arguments.
	Syntax,
	/// Storage host rejected the save because the document changed remotely.
	DocumentConflict,
	/// Storage host refused the credentials.
	Unauthorized,
	/// Storage host reported it is out of space.
	DiskFull,
	/// The render library failed persistently.
	RenderFailed,
	/// Resources to bring up the session could not be obtained.
	Unavailable,
}

impl ErrorKind {
	/// Wire name of the kind.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Syntax => "syntax",
			Self::DocumentConflict => "documentconflict",
			Self::Unauthorized => "unauthorized",
			Self::DiskFull => "diskfull",
			Self::RenderFailed => "renderfailed",
			Self::Unavailable => "unavailable",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A protocol-level failure attributable to one inbound message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("protocol error in '{command}': {kind}")]
pub struct ProtocolError {
	/// Command token of the offending message.
	pub command: String,
	/// Classification for the client.
	pub kind: ErrorKind,
}

impl ProtocolError {
	#[must_use]
	pub fn new(command: impl Into<String>, kind: ErrorKind) -> Self {
		Self {
			command: command.into(),
			kind,
		}
	}

	/// Render the `error:` message sent to the client.
	#[must_use]
	pub fn to_message(&self) -> String {
		format!("error: cmd={} kind={}", self.command, self.kind)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_wire_form() {
		let err = ProtocolError::new("tile", ErrorKind::Syntax);
		assert_eq!(err.to_message(), "error: cmd=tile kind=syntax");
	}
}
