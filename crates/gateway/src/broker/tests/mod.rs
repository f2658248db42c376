//! Broker behaviour tests.
//!
//! The harness runs brokers for real — own poll thread, real registry —
//! but replaces the worker with an in-process fake driving the pipe
//! grammar, and the storage host with a local stub speaking just enough
//! WOPI.

mod helpers;
mod lifecycle;
mod storage_errors;
