#![no_main]
//! Fuzz target for IPC request parsing
//!
//! Feeds random bytes through the line reader and the request parser to
//! find panics in framing, deserialization and validation.

use libfuzzer_sys::fuzz_target;

use compositor::ipc::{parse_request, LineReader};

fuzz_target!(|data: &[u8]| {
    // Arbitrary chunking must never panic
    let mut reader = LineReader::new();
    for chunk in data.chunks(7) {
        reader.push(chunk);
        while let Some(line) = reader.next_line() {
            if let Ok(line) = line {
                let _ = parse_request(&line);
            }
        }
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_request(s);
    }
});
