//! Lookup service and its socket front end

pub mod client;
pub mod lookup;
pub mod protocol;
pub mod server;

pub use client::{Client, Response};
pub use lookup::{FrameRef, IndexDescription, Lookup, LookupService, TableDescription, TableStats};
pub use protocol::{Action, ProtocolError, MAX_KEY_LEN, PROTOCOL_VERSION};
pub use server::{serve_connection, Server, ServerConfig, DEFAULT_MAX_RESPONSE_BYTES};
