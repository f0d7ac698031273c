// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Execution backends and runtime handles.
//!
//! A backend turns a validated artifact into an opaque runtime resource. It is
//! only ever invoked from a loader's `load`, never from detection or
//! validation. The built-in [`MmapBackend`] memory-maps the artifact files;
//! real inference runtimes plug in through [`ExecutionBackend`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::formats::ModelFormat;
use crate::loaders::LoadConfig;

/// Hardware target an ONNX-style runtime can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// On-device neural accelerator (Apple Neural Engine via CoreML).
    CoreMl,
    /// NVIDIA GPU.
    Cuda,
    /// AMD GPU.
    Rocm,
    /// Vendor-neutral GPU (DirectML).
    DirectMl,
    /// Always available, terminal fallback.
    Cpu,
}

/// Affinity tier of a provider. Lower ranks are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderTier {
    PlatformAccelerator = 0,
    VendorGpu = 1,
    GenericGpu = 2,
    Cpu = 3,
}

impl ExecutionProvider {
    /// Fixed priority order: accelerator, vendor GPU, generic GPU, CPU.
    pub const PRIORITY: [ExecutionProvider; 5] = [
        ExecutionProvider::CoreMl,
        ExecutionProvider::Cuda,
        ExecutionProvider::Rocm,
        ExecutionProvider::DirectMl,
        ExecutionProvider::Cpu,
    ];

    pub fn is_gpu(&self) -> bool {
        matches!(self.tier(), ProviderTier::VendorGpu | ProviderTier::GenericGpu)
    }

    pub fn tier(&self) -> ProviderTier {
        match self {
            ExecutionProvider::CoreMl => ProviderTier::PlatformAccelerator,
            ExecutionProvider::Cuda | ExecutionProvider::Rocm => ProviderTier::VendorGpu,
            ExecutionProvider::DirectMl => ProviderTier::GenericGpu,
            ExecutionProvider::Cpu => ProviderTier::Cpu,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionProvider::CoreMl => "CoreML",
            ExecutionProvider::Cuda => "CUDA",
            ExecutionProvider::Rocm => "ROCm",
            ExecutionProvider::DirectMl => "DirectML",
            ExecutionProvider::Cpu => "CPU",
        }
    }

    /// Rank candidates by priority, dropping duplicates and always ending with CPU.
    pub fn ranked(candidates: &[ExecutionProvider]) -> Vec<ExecutionProvider> {
        let mut ranked: Vec<ExecutionProvider> = Self::PRIORITY
            .into_iter()
            .filter(|p| candidates.contains(p))
            .collect();
        if !ranked.contains(&ExecutionProvider::Cpu) {
            ranked.push(ExecutionProvider::Cpu);
        }
        ranked
    }

    /// Providers compiled into this build for the current platform.
    pub fn compiled_in() -> Vec<ExecutionProvider> {
        let mut providers = Vec::new();
        if cfg!(all(feature = "coreml", target_os = "macos")) {
            providers.push(ExecutionProvider::CoreMl);
        }
        if cfg!(feature = "cuda") {
            providers.push(ExecutionProvider::Cuda);
        }
        if cfg!(feature = "rocm") {
            providers.push(ExecutionProvider::Rocm);
        }
        if cfg!(all(feature = "directml", target_os = "windows")) {
            providers.push(ExecutionProvider::DirectMl);
        }
        providers.push(ExecutionProvider::Cpu);
        providers
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a backend needs to materialise one artifact.
#[derive(Debug)]
pub struct MaterializeRequest<'a> {
    pub format: ModelFormat,
    /// Artifact root (file or bundle directory).
    pub path: &'a Path,
    /// Files holding weights; a single entry for single-file formats.
    pub files: &'a [PathBuf],
    /// Facts gathered during validation.
    pub metadata: &'a BTreeMap<String, String>,
    /// Requested provider for graph runtimes; `None` for formats without one.
    pub provider: Option<ExecutionProvider>,
    pub config: &'a LoadConfig,
}

/// Per-format execution backend.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Build the runtime resource. Provider initialisation failures must be
    /// reported as [`BackendError::ProviderInit`] so the caller can fall through.
    fn materialize(&self, request: &MaterializeRequest<'_>) -> Result<Box<dyn Any + Send + Sync>, BackendError>;
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, exclusively owned runtime resource. Dropping it releases the resource.
pub struct RuntimeHandle {
    id: u64,
    format: ModelFormat,
    provider: Option<ExecutionProvider>,
    inner: Box<dyn Any + Send + Sync>,
}

impl RuntimeHandle {
    pub fn new(
        format: ModelFormat,
        provider: Option<ExecutionProvider>,
        inner: Box<dyn Any + Send + Sync>,
    ) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst);
        Self { id, format, provider, inner }
    }

    /// Process-unique id; never reused after release.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    pub fn provider(&self) -> Option<ExecutionProvider> {
        self.provider
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Artifact contents, either mapped or read into memory.
pub enum ModelBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// One weight file held by the memory-map backend.
pub struct MappedModel {
    path: PathBuf,
    bytes: ModelBytes,
}

impl MappedModel {
    /// Memory-map (or read, when `use_mmap` is false) a model file.
    pub fn open(path: &Path, use_mmap: bool) -> Result<Self, BackendError> {
        let bytes = if use_mmap {
            let file = File::open(path)?;
            if file.metadata()?.len() == 0 {
                ModelBytes::Owned(Vec::new())
            } else {
                // SAFETY: File is opened read-only, model files are not modified while loaded
                ModelBytes::Mapped(unsafe { Mmap::map(&file)? })
            }
        } else {
            ModelBytes::Owned(std::fs::read(path)?)
        };
        Ok(Self { path: path.to_path_buf(), bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get model data as a byte slice (zero-copy when mapped).
    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            ModelBytes::Mapped(m) => m,
            ModelBytes::Owned(v) => v,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, ModelBytes::Mapped(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Runtime resource produced by [`MmapBackend`].
pub struct MappedArtifact {
    pub format: ModelFormat,
    pub provider: Option<ExecutionProvider>,
    pub files: Vec<MappedModel>,
    /// Tensor names, for formats with a tensor index.
    pub tensor_names: Vec<String>,
}

impl MappedArtifact {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.len() as u64).sum()
    }
}

/// Backend that memory-maps artifacts and reports provider availability.
#[derive(Debug, Clone)]
pub struct MmapBackend {
    available: Vec<ExecutionProvider>,
}

impl MmapBackend {
    pub fn new() -> Self {
        Self { available: ExecutionProvider::compiled_in() }
    }

    /// Backend that claims only the given providers are usable.
    pub fn with_providers(available: Vec<ExecutionProvider>) -> Self {
        Self { available }
    }

    pub fn available_providers(&self) -> &[ExecutionProvider] {
        &self.available
    }
}

impl Default for MmapBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for MmapBackend {
    fn name(&self) -> &str {
        "mmap"
    }

    fn materialize(&self, request: &MaterializeRequest<'_>) -> Result<Box<dyn Any + Send + Sync>, BackendError> {
        if let Some(provider) = request.provider {
            if !self.available.contains(&provider) {
                return Err(BackendError::ProviderInit {
                    provider,
                    reason: "provider not available in this build".into(),
                });
            }
        }

        let files = request
            .files
            .iter()
            .map(|f| MappedModel::open(f, request.config.use_mmap))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tensor_names = Vec::new();
        if request.format == ModelFormat::SafeTensors
            || (request.format == ModelFormat::Mlx && request.metadata.get("shard_kind").map(String::as_str) == Some("safetensors"))
        {
            for file in &files {
                let tensors = safetensors::SafeTensors::deserialize(file.as_bytes()).map_err(|e| {
                    BackendError::Corrupt(format!("{}: {:?}", file.path().display(), e))
                })?;
                tensor_names.extend(tensors.names().into_iter().cloned());
            }
            tensor_names.sort();
        }

        Ok(Box::new(MappedArtifact {
            format: request.format,
            provider: request.provider,
            files,
            tensor_names,
        }))
    }
}
