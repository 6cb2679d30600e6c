//! Debug Adapter Protocol endpoint.
//!
//! [`DapConnection`] couples the `Content-Length` framer with a typed command
//! router: handlers are registered per command, run concurrently, and every
//! inbound request receives exactly one response carrying its `request_seq`.
//! Unknown commands answer with error id 1014; failing handlers with 1104.

mod connection;
mod error;
pub mod types;

pub use connection::{DapConnection, HandlerResult};
pub use error::{DapError, HANDLER_FAILED, UNRECOGNIZED_REQUEST};
