// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! ONNX loader.
//!
//! Validation streams the `ModelProto` through the wire walker, counting
//! nodes and operator types while skipping initializer payloads. Loading
//! tries execution providers in priority order and falls through on
//! initialisation failure; CPU is always the last candidate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{file_size, is_file, FormatLoader, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{ExecutionProvider, MaterializeRequest, RuntimeHandle};
use crate::error::{BackendError, LoadFailure};
use crate::formats::protobuf::{probe_model_proto, scan_onnx, OnnxSummary, ProtoVerdict};
use crate::formats::{ModelArchitecture, ModelFormat};
use crate::source::WindowedReader;

const CONV_OPS: &[&str] = &["Conv", "ConvTranspose", "ConvInteger", "QLinearConv", "DeformConv"];
const RECURRENT_OPS: &[&str] = &["LSTM", "GRU", "RNN"];
const ATTENTION_OPS: &[&str] = &[
    "Attention",
    "MultiHeadAttention",
    "GroupQueryAttention",
    "PackedAttention",
    "PackedMultiHeadAttention",
    "DecoderMaskedMultiHeadAttention",
];

/// Best-effort architecture tag from a graph's operator types.
///
/// Convolutions mean CNN, recurrent cells RNN, attention TRANSFORMER; more
/// than one of those is HYBRID. A graph with none of them is FEEDFORWARD and
/// an empty operator list is UNKNOWN. Pooling and activations are neutral.
pub fn classify_ops<'a, I>(ops: I) -> ModelArchitecture
where
    I: IntoIterator<Item = &'a str>,
{
    let (mut conv, mut recurrent, mut attention, mut any) = (false, false, false, false);
    for op in ops {
        any = true;
        conv |= CONV_OPS.contains(&op);
        recurrent |= RECURRENT_OPS.contains(&op);
        attention |= ATTENTION_OPS.contains(&op);
    }
    match (conv, recurrent, attention) {
        _ if !any => ModelArchitecture::Unknown,
        (false, false, false) => ModelArchitecture::Feedforward,
        (true, false, false) => ModelArchitecture::Cnn,
        (false, true, false) => ModelArchitecture::Rnn,
        (false, false, true) => ModelArchitecture::Transformer,
        _ => ModelArchitecture::Hybrid,
    }
}

/// Loader for `.onnx` / `.ort` graphs.
pub struct OnnxLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl OnnxLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }

    fn summarize(&self, path: &Path) -> Result<OnnxSummary, String> {
        let size = file_size(&self.ctx, path).map_err(|e| e.to_string())?;
        if size == 0 {
            return Err("truncated header: file is empty (0 bytes)".into());
        }
        let mut reader = WindowedReader::with_len(self.ctx.source.as_ref(), path, size);
        let max_nodes = usize::try_from(self.ctx.limits.max_metadata_entries).unwrap_or(usize::MAX);
        scan_onnx(&mut reader, size, max_nodes).map_err(|e| format!("malformed ONNX model: {}", e))
    }

    fn try_provider(
        &self,
        path: &Path,
        files: &[PathBuf],
        metadata: &BTreeMap<String, String>,
        provider: ExecutionProvider,
        config: &LoadConfig,
    ) -> Result<Box<dyn std::any::Any + Send + Sync>, BackendError> {
        self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::Onnx,
            path,
            files,
            metadata,
            provider: Some(provider),
            config,
        })
    }
}

impl FormatLoader for OnnxLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn can_load(&self, path: &Path) -> bool {
        if !is_file(&self.ctx, path) {
            return false;
        }
        let size = file_size(&self.ctx, path).unwrap_or(0);
        match self.ctx.source.read_at(path, 0, 256) {
            Ok(prefix) => matches!(
                probe_model_proto(&prefix, size),
                ProtoVerdict::Onnx | ProtoVerdict::Ambiguous
            ),
            Err(_) => false,
        }
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::Onnx);
        let summary = match self.summarize(path) {
            Ok(summary) => summary,
            Err(e) => {
                result.error(e);
                return result.finish();
            }
        };

        if !summary.has_graph {
            result.error("model has no graph");
        }
        match summary.ir_version {
            Some(v) => result.meta("ir_version", v),
            None => result.warn("model declares no ir_version"),
        }
        if let Some(name) = &summary.producer_name {
            result.meta("producer_name", name);
        }
        if let Some(version) = &summary.producer_version {
            result.meta("producer_version", version);
        }
        if let Some(name) = &summary.graph_name {
            result.meta("graph_name", name);
        }
        for (domain, version) in &summary.opsets {
            let key = if domain.is_empty() || domain == "ai.onnx" {
                "opset".to_string()
            } else {
                format!("opset.{}", domain)
            };
            result.meta(&key, version);
        }
        for domain in &summary.custom_domains {
            result.warn(format!("graph uses operators from custom domain {}", domain));
        }
        result.meta("node_count", summary.node_count);
        result.meta("initializer_count", summary.initializer_count);
        result.meta("input_count", summary.input_count);
        result.meta("output_count", summary.output_count);
        if !summary.op_types.is_empty() {
            result.meta("op_types", summary.op_types.keys().cloned().collect::<Vec<_>>().join(","));
        }

        result.architecture = classify_ops(summary.op_types.keys().map(String::as_str));
        result.estimated_memory_bytes = file_size(&self.ctx, path).unwrap_or(0);
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let summary = self.summarize(path).map_err(LoadFailure::CorruptHeader)?;
        let files: Vec<PathBuf> = vec![path.to_path_buf()];
        let mut metadata = BTreeMap::new();
        metadata.insert("node_count".to_string(), summary.node_count.to_string());

        let mut attempted = Vec::new();
        let mut last_error = String::from("no execution provider candidates");
        for provider in config.provider_candidates() {
            attempted.push(provider);
            match self.try_provider(path, &files, &metadata, provider, config) {
                Ok(inner) => {
                    tracing::info!(
                        path = %path.display(),
                        provider = %provider,
                        attempts = attempted.len(),
                        "onnx execution provider selected"
                    );
                    return Ok(RuntimeHandle::new(ModelFormat::Onnx, Some(provider), inner));
                }
                Err(BackendError::ProviderInit { provider, reason }) => {
                    tracing::warn!(provider = %provider, reason = %reason, "execution provider unavailable, falling through");
                    last_error = reason;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(LoadFailure::ProviderInitFailed { attempted, last_error })
    }

    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        file_size(&self.ctx, path)
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}
