//! Wire grammar and shared protocol types.
//!
//! Every message between browsers, the gateway, and workers is a
//! space-separated token stream: the first token names the command, the rest
//! are `key=value` pairs (variable-length commands carry their payload as the
//! final token). This crate owns the tokenizer, the typed commands the
//! gateway must understand structurally, tile descriptors, document keys, and
//! the error kinds surfaced to clients as `error: cmd=<c> kind=<k>`.
//!
//! Transport framing (WebSocket frames, HTTP) lives in `quill-net`; this
//! crate is payload-only and has no I/O.

pub mod command;
pub mod dockey;
pub mod error;
pub mod ids;
pub mod tile;
pub mod tokens;

pub use command::ClientCommand;
pub use dockey::DocKey;
pub use error::{ErrorKind, ProtocolError};
pub use ids::{SessionId, ViewId};
pub use tile::{TileBundle, TileDesc};
pub use tokens::Tokens;
