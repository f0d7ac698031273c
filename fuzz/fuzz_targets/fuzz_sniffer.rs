//! Fuzz target for content sniffing.
//!
//! Arbitrary bytes under each recognized extension must yield a report,
//! never a panic.

#![no_main]

use std::path::Path;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use model_factory::{ContentSniffer, MemorySource};

const NAMES: &[&str] = &["/f/model.bin", "/f/model.onnx", "/f/model.mlmodel", "/f/model.gguf", "/f/model.dat"];

fuzz_target!(|data: &[u8]| {
    for name in NAMES {
        let source = Arc::new(MemorySource::new().with_file(*name, data.to_vec()));
        let sniffer = ContentSniffer::new(source, 64 * 1024, 1 << 20);
        let _ = sniffer.sniff(Path::new(name));
    }
});
