use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{FrameCodec, WireError};

/// Pulls framed messages off an async byte stream.
pub struct FramedReader<R, C> {
    reader: R,
    codec: C,
}

impl<R, C> FramedReader<R, C>
where
    R: AsyncRead + Unpin,
    C: FrameCodec,
{
    pub fn new(reader: R, codec: C) -> Self {
        Self { reader, codec }
    }

    /// Next decoded message, or `None` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<Value>, WireError> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(message) = self.codec.next() {
                return Ok(Some(message));
            }
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(self.codec.next());
            }
            self.codec.push(&chunk[..n]);
        }
    }
}

/// Writes framed messages to an async byte stream. Each message is encoded
/// into one contiguous buffer before writing, so frames never interleave.
pub struct FramedWriter<W, C> {
    writer: W,
    codec: C,
}

impl<W, C> FramedWriter<W, C>
where
    W: AsyncWrite + Unpin,
    C: FrameCodec,
{
    pub fn new(writer: W, codec: C) -> Self {
        Self { writer, codec }
    }

    pub async fn send(&mut self, message: &Value) -> Result<(), WireError> {
        let bytes = self.codec.encode(message)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentLengthCodec;
    use serde_json::json;

    #[tokio::test]
    async fn reader_and_writer_agree_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(256);
        let (server_rx, _server_tx) = tokio::io::split(server);
        let (_client_rx, client_tx) = tokio::io::split(client);

        let mut writer = FramedWriter::new(client_tx, ContentLengthCodec::new());
        let mut reader = FramedReader::new(server_rx, ContentLengthCodec::new());

        let sent = json!({"seq": 1, "type": "request", "command": "initialize"});
        writer.send(&sent).await.unwrap();
        let received = reader.recv().await.unwrap();
        assert_eq!(received, Some(sent));
    }

    #[tokio::test]
    async fn reader_returns_none_at_end_of_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FramedReader::new(server, ContentLengthCodec::new());
        assert!(reader.recv().await.unwrap().is_none());
    }
}
