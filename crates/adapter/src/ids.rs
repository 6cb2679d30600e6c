//! Process-wide id allocation. Every identifier that crosses the protocol
//! boundary (thread ids, source references, stack-frame ids, variable
//! references) is a monotonic counter, never reused within a session.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_SOURCE_REF: AtomicU64 = AtomicU64::new(0);
static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_VARIABLE_REF: AtomicU32 = AtomicU32::new(0);

pub fn next_thread_id() -> u32 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn next_source_ref() -> u64 {
    NEXT_SOURCE_REF.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn next_frame_id() -> u64 {
    NEXT_FRAME_ID.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn next_variable_ref() -> u32 {
    NEXT_VARIABLE_REF.fetch_add(1, Ordering::SeqCst) + 1
}
