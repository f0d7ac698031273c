//! Per-format loaders.
//!
//! Every format implements the same capability set (`can_load`, `validate`,
//! `load`, `estimate_memory`, `unload`). The factory picks an implementation
//! by [`ModelFormat`] through [`create_loader`]; there is no open-ended
//! subtype dispatch.

mod coreml;
mod gguf;
mod mlx;
mod onnx;
mod pytorch;
mod safetensors;

pub use coreml::CoreMlLoader;
pub use gguf::{GgufHeader, GgufLoader, GgufValue};
pub use mlx::MlxLoader;
pub use onnx::{classify_ops, OnnxLoader};
pub use pytorch::PyTorchLoader;
pub use safetensors::{SafeTensorsHeader, SafeTensorsLoader, TensorEntry};

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{ExecutionBackend, ExecutionProvider, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::{ModelArchitecture, ModelFormat};
use crate::source::ByteSource;

/// Where the runtime should place the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlacement {
    /// Best available provider by priority.
    #[default]
    Auto,
    /// CPU only.
    Cpu,
    /// GPU providers only, then CPU. The index is passed through to the backend.
    Gpu(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    Bf16,
    Int8,
}

/// Format-specific load configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub device: DevicePlacement,
    /// Requested weight precision. Not interpreted by the loaders; handed to
    /// the [`ExecutionBackend`] untouched.
    pub precision: Option<Precision>,
    /// Memory-map weight files instead of reading them.
    pub use_mmap: bool,
    /// Explicit provider candidates (still ranked by priority).
    pub providers: Option<Vec<ExecutionProvider>>,
    /// Overrides the factory-wide memory limit for this load.
    pub memory_limit_bytes: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            device: DevicePlacement::Auto,
            precision: None,
            use_mmap: true,
            providers: None,
            memory_limit_bytes: None,
        }
    }
}

impl LoadConfig {
    /// Candidate providers for a graph runtime, ranked.
    pub fn provider_candidates(&self) -> Vec<ExecutionProvider> {
        let ranked = match &self.providers {
            Some(list) => ExecutionProvider::ranked(list),
            None => ExecutionProvider::PRIORITY.to_vec(),
        };
        match self.device {
            DevicePlacement::Auto => ranked,
            DevicePlacement::Cpu => vec![ExecutionProvider::Cpu],
            DevicePlacement::Gpu(_) => ranked
                .into_iter()
                .filter(|p| p.is_gpu() || *p == ExecutionProvider::Cpu)
                .collect(),
        }
    }
}

/// Outcome of a structural validation. Never carries tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub format: ModelFormat,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub architecture: ModelArchitecture,
    pub estimated_memory_bytes: u64,
}

impl ValidationResult {
    pub fn new(format: ModelFormat) -> Self {
        Self {
            valid: false,
            format,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
            architecture: ModelArchitecture::Unknown,
            estimated_memory_bytes: 0,
        }
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn meta(&mut self, key: &str, value: impl ToString) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Mark valid iff no errors were recorded.
    pub fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

/// Bounds applied while parsing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLimits {
    pub max_header_bytes: u64,
    pub max_metadata_entries: u64,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self { max_header_bytes: 100_000_000, max_metadata_entries: 1_000_000 }
    }
}

/// Collaborators shared by every loader.
#[derive(Clone)]
pub struct LoaderContext {
    pub source: Arc<dyn ByteSource>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub limits: HeaderLimits,
}

/// Ids of the models a loader currently owns. The only state a loader keeps.
#[derive(Debug, Default)]
pub struct Ownership {
    ids: Mutex<HashSet<String>>,
}

impl Ownership {
    pub fn claim(&self, id: &str) {
        self.ids.lock().insert(id.to_string());
    }

    /// Returns false if the id was not owned.
    pub fn release(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }

    pub fn owns(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn count(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}

/// Uniform capability contract implemented once per format.
pub trait FormatLoader: Send + Sync {
    fn format(&self) -> ModelFormat;

    /// Cheap existence and compatibility check; no metadata parsing.
    fn can_load(&self, path: &Path) -> bool;

    /// Structural check bounded by header size.
    fn validate(&self, path: &Path) -> ValidationResult;

    /// Full materialisation through the execution backend.
    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure>;

    /// Heuristic resident size in bytes.
    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure>;

    fn ownership(&self) -> &Ownership;

    /// Drop bookkeeping for `id`. Idempotent; returns false if not owned.
    fn unload(&self, id: &str) -> bool {
        self.ownership().release(id)
    }
}

/// Shared, lazily created loader for one format.
pub type LoaderInstance = Arc<dyn FormatLoader>;

/// Build the loader for `format`. `Unknown` has no loader.
pub fn create_loader(format: ModelFormat, ctx: LoaderContext) -> Option<LoaderInstance> {
    let loader: LoaderInstance = match format {
        ModelFormat::Gguf => Arc::new(GgufLoader::new(ctx)),
        ModelFormat::SafeTensors => Arc::new(SafeTensorsLoader::new(ctx)),
        ModelFormat::Mlx => Arc::new(MlxLoader::new(ctx)),
        ModelFormat::CoreMl => Arc::new(CoreMlLoader::new(ctx)),
        ModelFormat::PyTorch => Arc::new(PyTorchLoader::new(ctx)),
        ModelFormat::Onnx => Arc::new(OnnxLoader::new(ctx)),
        ModelFormat::Unknown => return None,
    };
    Some(loader)
}

/// File size via the source, mapped to a load failure.
pub(crate) fn file_size(ctx: &LoaderContext, path: &Path) -> Result<u64, LoadFailure> {
    ctx.source
        .stat(path)
        .map(|s| s.size_bytes)
        .map_err(|e| LoadFailure::from_io(path, e))
}

/// Whether `path` exists as a regular file.
pub(crate) fn is_file(ctx: &LoaderContext, path: &Path) -> bool {
    matches!(ctx.source.stat(path), Ok(s) if !s.is_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_placement_restricts_candidates() {
        let config = LoadConfig { device: DevicePlacement::Cpu, ..LoadConfig::default() };
        assert_eq!(config.provider_candidates(), vec![ExecutionProvider::Cpu]);
    }

    #[test]
    fn gpu_placement_skips_the_platform_accelerator() {
        let config = LoadConfig { device: DevicePlacement::Gpu(0), ..LoadConfig::default() };
        assert_eq!(
            config.provider_candidates(),
            vec![
                ExecutionProvider::Cuda,
                ExecutionProvider::Rocm,
                ExecutionProvider::DirectMl,
                ExecutionProvider::Cpu,
            ]
        );

        let config = LoadConfig {
            device: DevicePlacement::Gpu(1),
            providers: Some(vec![ExecutionProvider::CoreMl]),
            ..LoadConfig::default()
        };
        assert_eq!(config.provider_candidates(), vec![ExecutionProvider::Cpu]);
    }

    #[test]
    fn explicit_providers_are_ranked() {
        let config = LoadConfig {
            providers: Some(vec![ExecutionProvider::Cpu, ExecutionProvider::Cuda]),
            ..LoadConfig::default()
        };
        assert_eq!(
            config.provider_candidates(),
            vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu]
        );
    }

    #[test]
    fn ownership_release_is_idempotent() {
        let owned = Ownership::default();
        owned.claim("a");
        assert!(owned.owns("a"));
        assert!(owned.release("a"));
        assert!(!owned.release("a"));
        assert_eq!(owned.count(), 0);
    }

    #[test]
    fn finish_sets_validity_from_errors() {
        let ok = ValidationResult::new(ModelFormat::Gguf).finish();
        assert!(ok.valid);
        let mut bad = ValidationResult::new(ModelFormat::Gguf);
        bad.error("truncated header");
        assert!(!bad.finish().valid);
    }
}
