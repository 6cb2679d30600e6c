//! Chrome DevTools Protocol client plumbing.
//!
//! One physical transport (a `\0`-delimited pipe pair or a WebSocket) carries
//! traffic for many logical sessions, demultiplexed by the optional
//! `sessionId` field. [`CdpConnection`] owns the transport and the session
//! registry; [`CdpSession`] pairs requests with responses and fans events out
//! to subscribers.

mod connection;
mod error;
mod session;
mod transport;

pub use connection::CdpConnection;
pub use error::CdpError;
pub use session::{CdpEvent, CdpSession, EventStream, Subscription};
pub use transport::{
    connect_websocket, probe_websocket_url, CdpTransport, StreamTransport, WebSocketTransport,
};
