//! TLS layered over the poll-driven sockets.
//!
//! rustls runs sans-io: the poll loop shuttles ciphertext between the
//! descriptor and the session, and plaintext between the session and the
//! socket buffers. The handshake completes implicitly as traffic flows.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
	#[error("tls setup failed: {0}")]
	Setup(#[from] rustls::Error),
	#[error("reading pem material: {0}")]
	Pem(#[from] io::Error),
	#[error("no private key found in {0}")]
	NoKey(String),
	#[error("invalid server name '{0}'")]
	BadServerName(String),
}

/// Shared client-side TLS configuration.
pub type ClientTlsConfig = Arc<ClientConfig>;
/// Shared server-side TLS configuration.
pub type ServerTlsConfig = Arc<ServerConfig>;

/// A client or server TLS session bound to one socket.
pub struct TlsSession {
	conn: rustls::Connection,
	eof: bool,
}

impl TlsSession {
	/// Start a client session for `server_name`.
	pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
		let name = ServerName::try_from(server_name.to_string())
			.map_err(|_| TlsError::BadServerName(server_name.to_string()))?;
		let conn = ClientConnection::new(config, name)?;
		Ok(Self {
			conn: rustls::Connection::Client(conn),
			eof: false,
		})
	}

	/// Start a server session.
	pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
		let conn = ServerConnection::new(config)?;
		Ok(Self {
			conn: rustls::Connection::Server(conn),
			eof: false,
		})
	}

	#[must_use]
	pub fn wants_write(&self) -> bool {
		self.conn.wants_write()
	}

	#[must_use]
	pub fn is_eof(&self) -> bool {
		self.eof
	}

	/// Pump ciphertext from the descriptor and append any plaintext to
	/// `plaintext`. Returns plaintext bytes produced.
	pub fn read_ready(&mut self, fd: &OwnedFd, plaintext: &mut Vec<u8>) -> io::Result<usize> {
		let mut produced = 0;
		loop {
			let mut io = FdIo(fd);
			match self.conn.read_tls(&mut io) {
				Ok(0) => {
					self.eof = true;
					break;
				}
				Ok(_) => {}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}

			let state = self
				.conn
				.process_new_packets()
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

			let pending = state.plaintext_bytes_to_read();
			if pending > 0 {
				let start = plaintext.len();
				plaintext.resize(start + pending, 0);
				self.conn.reader().read_exact(&mut plaintext[start..])?;
				produced += pending;
			}
			if state.peer_has_closed() {
				self.eof = true;
				break;
			}
		}
		Ok(produced)
	}

	/// Move plaintext from `out_buffer` into the session and flush ciphertext
	/// to the descriptor as far as it will go.
	pub fn flush(&mut self, fd: &OwnedFd, out_buffer: &mut Vec<u8>) -> io::Result<()> {
		if !out_buffer.is_empty() {
			let written = self.conn.writer().write(out_buffer)?;
			out_buffer.drain(..written);
		}
		while self.conn.wants_write() {
			let mut io = FdIo(fd);
			match self.conn.write_tls(&mut io) {
				Ok(_) => {}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}
}

struct FdIo<'a>(&'a OwnedFd);

impl Read for FdIo<'_> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		nix::unistd::read(self.0.as_fd(), buf).map_err(io::Error::from)
	}
}

impl Write for FdIo<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		nix::unistd::write(self.0.as_fd(), buf).map_err(io::Error::from)
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl std::fmt::Debug for TlsSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsSession").field("eof", &self.eof).finish()
	}
}

/// Build a server config from PEM certificate chain and key files.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
	let certs = rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(cert_path)?))
		.collect::<Result<Vec<_>, _>>()?;
	let key = rustls_pemfile::private_key(&mut io::BufReader::new(std::fs::File::open(key_path)?))?
		.ok_or_else(|| TlsError::NoKey(key_path.display().to_string()))?;
	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	Ok(Arc::new(config))
}

/// Build a client config trusting the given CA bundle (PEM). With no bundle
/// the trust store is empty and every upstream certificate is rejected, so
/// deployments talking to HTTPS WOPI hosts must configure one.
pub fn client_config(ca_path: Option<&Path>) -> Result<Arc<ClientConfig>, TlsError> {
	let mut roots = RootCertStore::empty();
	if let Some(path) = ca_path {
		for cert in rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(path)?)) {
			let _ = roots.add(cert?);
		}
	}
	let config = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(Arc::new(config))
}
