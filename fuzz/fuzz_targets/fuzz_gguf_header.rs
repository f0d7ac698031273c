//! Fuzz target for GGUF header parsing.
//!
//! Declared counts and string lengths come straight from the input; the
//! parser must reject them within its limits instead of allocating.

#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use model_factory::loaders::GgufHeader;
use model_factory::{HeaderLimits, MemorySource};

fuzz_target!(|data: &[u8]| {
    let source = MemorySource::new().with_file("/f/model.gguf", data.to_vec());
    let limits = HeaderLimits { max_header_bytes: 1 << 20, max_metadata_entries: 4096 };
    let _ = GgufHeader::read(&source, Path::new("/f/model.gguf"), &limits);
});
