//! WOPI storage access for the quill server.
//!
//! Documents live on a remote WOPI host; this crate builds the requests
//! (file info, contents, locks), signs them with the server's proof key,
//! classifies the failures, and runs the HTTP exchanges as sockets on the
//! caller's poll loop.

pub mod client;
pub mod error;
pub mod proof;
pub mod wopi;

pub use client::{FetchResult, fetch};
pub use error::StorageError;
pub use proof::ProofKey;
pub use wopi::{FileInfo, LockOp, StorageRequest, WopiSource, classify_response, parse_last_modified};
