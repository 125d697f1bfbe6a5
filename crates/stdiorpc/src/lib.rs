//! JSON-RPC over the stdio of a child process.
//!
//! stdiorpc talks to a long-running helper process (a language server, a
//! formatter daemon) through its stdin and stdout: Content-Length framed
//! JSON-RPC messages in both directions, with concurrent calls correlated by
//! id.
//!
//! # Crate Structure
//!
//! - [`frame`]: Content-Length framing, blocking reader/writer and tokio codec
//! - [`conn`]: message model, pending-call registry, and the connection
//!   (behind `conn` feature)

/// Re-export frame types.
pub mod frame {
    pub use stdiorpc_frame::*;
}

/// Re-export connection types (requires `conn` feature).
#[cfg(feature = "conn")]
pub mod conn {
    pub use stdiorpc_conn::*;
}
