//! Frame codecs shared by both protocol endpoints.
//!
//! The adapter speaks two framings over raw byte streams: `Content-Length`
//! header framing (DAP over stdio/TCP, and CDP endpoints that use it) and
//! `\0`-delimited framing (Chromium's `--remote-debugging-pipe`). Both codecs
//! are incremental: bytes go in at arbitrary chunk boundaries, whole JSON
//! messages come out in byte order.

mod codec;
mod stream;

pub use codec::{ContentLengthCodec, FrameCodec, NullDelimitedCodec};
pub use stream::{FramedReader, FramedWriter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("stream closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}
