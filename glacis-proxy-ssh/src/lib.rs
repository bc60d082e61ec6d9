//! SSH front-end for the Glacis gateway.
//!
//! One listener per proxy IP. The listener's bind address identifies the
//! backend; the client authenticates with whatever it would have offered
//! the real host (identity is already established by source IP), and the
//! gateway replays those credentials against the backend: forwarded agent
//! first, then the client's password. Every admitted connection becomes a
//! stay with a JSON-lines recording.

pub mod backend;
pub mod banner;
pub mod error;
pub mod recorder;
pub mod server;

pub use error::{SshProxyError, SshResult};
pub use server::SshFrontend;
