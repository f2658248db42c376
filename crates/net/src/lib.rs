//! Poll-driven socket runtime, WebSocket framing, and HTTP plumbing.
//!
//! All network I/O in the server runs through [`SocketPoll`] instances:
//! single-threaded cooperative loops that own their sockets outright and
//! drive protocol handlers without ever blocking inside one. On top of the
//! raw sockets sit two protocol layers, each just another
//! [`SocketHandler`]: the HTTP parser for plain requests and upgrade
//! handshakes, and the WebSocket framer for everything after the upgrade.
//! TLS slots underneath either layer via the sans-io rustls adapter.

pub mod delay;
pub mod http;
pub mod poll;
pub mod socket;
pub mod tls;
pub mod ws;

pub use poll::{SocketPoll, wakeup_all};
pub use socket::{Interest, SocketDisposition, SocketHandler, StreamSocket};
pub use tls::{ClientTlsConfig, ServerTlsConfig, TlsError, TlsSession};
pub use ws::{OutboundQueue, WebSocketFramer, WsMessageHandler, WsSender};
