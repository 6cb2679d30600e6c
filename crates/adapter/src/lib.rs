//! The debug adapter core: DAP requests on one side, CDP runtimes on the
//! other.
//!
//! [`DebugSession`] owns the handler surface and lifecycle. Underneath it,
//! [`targets::TargetManager`] maintains the target tree per CDP connection,
//! [`sources::SourceContainer`] holds the compiled/authored source model with
//! source-map resolution, and [`variables::VariableStore`] materialises
//! remote objects on demand.

pub mod breakpoints;
pub mod config;
pub mod error;
pub mod ids;
pub mod launcher;
pub mod overrides;
pub mod protocol;
pub mod session;
pub mod sourcemap;
pub mod sources;
pub mod targets;
pub mod thread;
pub mod variables;

pub use config::LaunchConfig;
pub use error::AdapterError;
pub use session::DebugSession;
