//! Core runtime of the Glacis gateway.
//!
//! Everything that sits between the protocol front-ends and the store lives
//! here: the destination-routing table, the policy engine with its cached
//! snapshot, the session registry that owns every live stay, the expiry
//! ticker, the transcode queue and the audit sink. The engine and registry
//! are plain values constructed at startup and injected into the
//! front-ends; none of this crate holds global state.

pub mod audit;
pub mod engine;
pub mod error;
pub mod groups;
pub mod pool;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod ticker;
pub mod transcode;

pub use audit::{AuditSink, StoreAuditSink};
pub use engine::{Admission, BackendTarget, Decision, DenyReason, PolicyEngine, Snapshot};
pub use error::{CoreError, CoreResult};
pub use pool::RoutingTable;
pub use registry::{SessionRegistry, StayHandle, StaySignal};
pub use store::Store;
pub use ticker::ExpiryTicker;
pub use transcode::{TranscodeConfig, TranscodeQueue};
