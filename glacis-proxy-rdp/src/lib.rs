//! RDP front-end for the Glacis gateway.
//!
//! RDP's protocol-level target is opaque at accept time, so routing is
//! deferred: the relay reads the X.224 connection request, then the local
//! socket address resolves the backend and the outbound leg starts only if
//! admission succeeded. Both legs run TLS; the relay records the session
//! into an opaque `.replay` file for later transcoding.
//!
//! The MITM lives behind one small driver surface (`TlsRelay`,
//! `PendingMitm`) so the underlying implementation can be swapped without
//! touching admission or session tracking.

pub mod error;
pub mod frontend;
pub mod nego;
pub mod relay;
pub mod tls;

pub use error::{MitmError, RdpResult};
pub use frontend::RdpFrontend;
pub use relay::{ConnectedMitm, PendingMitm, RelayOutcome, TlsRelay};
pub use tls::TlsContext;
