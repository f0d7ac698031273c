//! Fuzz target for ONNX validation.
//!
//! The protobuf walk must stay within the buffer whatever lengths the
//! input declares.

#![no_main]

use std::path::Path;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use model_factory::{create_loader, HeaderLimits, LoaderContext, MemorySource, MmapBackend, ModelFormat};

fuzz_target!(|data: &[u8]| {
    let ctx = LoaderContext {
        source: Arc::new(MemorySource::new().with_file("/f/model.onnx", data.to_vec())),
        backend: Arc::new(MmapBackend::new()),
        limits: HeaderLimits::default(),
    };
    if let Some(loader) = create_loader(ModelFormat::Onnx, ctx) {
        let _ = loader.validate(Path::new("/f/model.onnx"));
    }
});
