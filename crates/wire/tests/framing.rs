//! Framing guarantees exercised over whole byte sequences: any concatenation
//! of encoded frames decodes back to the same messages in order, no matter
//! where the chunk boundaries fall.

use jsdbg_wire::{ContentLengthCodec, FrameCodec, NullDelimitedCodec};
use serde_json::{json, Value};

fn roundtrip_with_chunks<C: FrameCodec + Default>(messages: &[Value], chunk_size: usize) -> Vec<Value> {
    let encoder = C::default();
    let mut bytes = Vec::new();
    for message in messages {
        bytes.extend_from_slice(&encoder.encode(message).unwrap());
    }

    let mut decoder = C::default();
    let mut decoded = Vec::new();
    for chunk in bytes.chunks(chunk_size.max(1)) {
        decoder.push(chunk);
        while let Some(message) = decoder.next() {
            decoded.push(message);
        }
    }
    decoded
}

fn sample_messages() -> Vec<Value> {
    vec![
        json!({"seq": 1, "type": "request", "command": "initialize", "arguments": {"adapterID": "jsdbg"}}),
        json!({"seq": 1, "type": "response", "request_seq": 1, "command": "initialize", "success": true}),
        json!({"seq": 2, "type": "event", "event": "initialized"}),
        json!({"id": 4, "method": "Runtime.evaluate", "params": {"expression": "1+2"}}),
        json!({"seq": 3, "type": "event", "event": "output", "body": {"output": "héllo \u{1F980}\n"}}),
    ]
}

#[test]
fn content_length_framing_is_chunk_invariant() {
    let messages = sample_messages();
    for chunk_size in 1..40 {
        assert_eq!(
            roundtrip_with_chunks::<ContentLengthCodec>(&messages, chunk_size),
            messages,
            "chunk_size {chunk_size}"
        );
    }
}

#[test]
fn null_delimited_framing_is_chunk_invariant() {
    let messages = sample_messages();
    for chunk_size in 1..40 {
        assert_eq!(
            roundtrip_with_chunks::<NullDelimitedCodec>(&messages, chunk_size),
            messages,
            "chunk_size {chunk_size}"
        );
    }
}

#[test]
fn split_header_and_body_yield_exactly_one_event() {
    let mut codec = ContentLengthCodec::new();
    codec.push(b"Content-Length: 36\r\n\r\n{\"seq\":1,\"type\":");
    assert!(codec.next().is_none());
    codec.push(b"\"event\",\"event\":\"x\"}");
    assert_eq!(
        codec.next(),
        Some(json!({"seq": 1, "type": "event", "event": "x"}))
    );
    assert!(codec.next().is_none());
}
