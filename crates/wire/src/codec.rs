use serde_json::Value;
use tracing::warn;

use crate::WireError;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Incremental frame codec over a growing byte buffer.
///
/// `push` appends raw bytes; `next` yields complete messages in the order the
/// bytes arrived. Payloads that are not valid JSON are logged and dropped
/// without closing the stream.
pub trait FrameCodec: Send {
    fn push(&mut self, bytes: &[u8]);
    fn next(&mut self) -> Option<Value>;
    fn encode(&self, message: &Value) -> Result<Vec<u8>, WireError>;
}

/// `Content-Length: N\r\n\r\n` + N bytes of UTF-8 JSON.
///
/// Header keys are matched case-insensitively; unknown headers are ignored. A
/// header block without `Content-Length` drops the prefix up to the separator
/// and scanning continues.
#[derive(Default)]
pub struct ContentLengthCodec {
    buf: Vec<u8>,
    /// Body length parsed from the current header block, if any.
    expected: Option<usize>,
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_header_block(block: &[u8]) -> Option<usize> {
        let text = std::str::from_utf8(block).ok()?;
        for line in text.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().ok();
            }
        }
        None
    }
}

impl FrameCodec for ContentLengthCodec {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self) -> Option<Value> {
        loop {
            if self.expected.is_none() {
                let sep = find(&self.buf, HEADER_SEPARATOR)?;
                let length = Self::parse_header_block(&self.buf[..sep]);
                self.buf.drain(..sep + HEADER_SEPARATOR.len());
                match length {
                    Some(n) => self.expected = Some(n),
                    None => {
                        warn!(target: "wire", "header block without Content-Length; dropped");
                        continue;
                    }
                }
            }

            let n = self.expected?;
            if self.buf.len() < n {
                return None;
            }
            let body: Vec<u8> = self.buf.drain(..n).collect();
            self.expected = None;
            match serde_json::from_slice(&body) {
                Ok(value) => return Some(value),
                Err(err) => {
                    warn!(target: "wire", %err, "malformed JSON frame dropped");
                    continue;
                }
            }
        }
    }

    fn encode(&self, message: &Value) -> Result<Vec<u8>, WireError> {
        let body = serde_json::to_vec(message)?;
        let mut out = Vec::with_capacity(body.len() + 32);
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// JSON messages separated by a single `\0` byte, as spoken by Chromium's
/// `--remote-debugging-pipe` file descriptors.
#[derive(Default)]
pub struct NullDelimitedCodec {
    buf: Vec<u8>,
}

impl NullDelimitedCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for NullDelimitedCodec {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self) -> Option<Value> {
        loop {
            let end = self.buf.iter().position(|&b| b == 0)?;
            let body: Vec<u8> = self.buf.drain(..end).collect();
            self.buf.remove(0);
            if body.is_empty() {
                continue;
            }
            match serde_json::from_slice(&body) {
                Ok(value) => return Some(value),
                Err(err) => {
                    warn!(target: "wire", %err, "malformed JSON frame dropped");
                    continue;
                }
            }
        }
    }

    fn encode(&self, message: &Value) -> Result<Vec<u8>, WireError> {
        let mut out = serde_json::to_vec(message)?;
        out.push(0);
        Ok(out)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
