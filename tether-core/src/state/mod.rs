//! Server/client lifecycle phases and request correlation.

pub mod pending;
pub mod phase;

pub use pending::{PendingRequests, ResponseWaiter};
pub use phase::{ClientPhase, ServerPhase};
