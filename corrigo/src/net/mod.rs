//! Newline-delimited request/response channels over TCP.
//!
//! Each frame is UTF-8 bytes terminated by a single `\n`; request and
//! response are each exactly one frame and responses never contain embedded
//! newlines. A module server hosts exactly one module and answers two
//! request kinds: the literal load probe and JSON-encoded module calls.
mod client;
mod server;

pub use client::{probe_load, ModuleClient};
pub use server::serve;
