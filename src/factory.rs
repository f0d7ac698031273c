// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Factory: the single entry point for detection, validation and lifecycle.
//!
//! `load_model` runs sniff (unless hinted) -> validate -> memory guard ->
//! materialise -> register. The model id is reserved before validation so a
//! concurrent load of the same `(format, path)` waits for the first one and
//! then fails with `DuplicateId`. A failed load releases the reservation and
//! leaves the registry untouched.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::backend::{ExecutionBackend, MmapBackend};
use crate::config::FactoryConfig;
use crate::error::{FactoryError, LoadFailure};
use crate::formats::{ContentSniffer, ModelFormat, SniffReport};
use crate::loaders::{LoadConfig, LoaderContext, ValidationResult};
use crate::models::{LoadedModel, ModelDescriptor, ModelRegistry};
use crate::source::{ByteSource, FsSource};
use crate::telemetry::{LoadEventSink, LoaderEvent, TracingSink};

/// Metadata key recording the execution provider a model runs on.
pub const EXECUTION_PROVIDER_KEY: &str = "execution_provider";

/// Hex digits of the path digest kept in generated ids.
const MODEL_ID_HASH_LEN: usize = 16;

/// Per-call options for [`ModelFactory::load_model`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip detection and treat the artifact as this format.
    pub format_hint: Option<ModelFormat>,
    /// Explicit id; derived from `(format, canonical path)` when unset.
    pub model_id: Option<String>,
    /// Format-specific settings; the factory defaults when unset.
    pub config: Option<LoadConfig>,
}

impl LoadOptions {
    pub fn with_format(format: ModelFormat) -> Self {
        Self { format_hint: Some(format), ..Self::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    pub fn with_config(mut self, config: LoadConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Deterministic id for an artifact: `{format}-{sha256(format|path)[..16]}`.
pub fn derive_model_id(format: ModelFormat, canonical_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_path.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", format, &digest[..MODEL_ID_HASH_LEN])
}

/// Multi-format model loader factory.
///
/// Construct once and share (`Arc<ModelFactory>`); all methods take `&self`.
/// Call [`ModelFactory::clear_loaders`] at shutdown.
pub struct ModelFactory {
    config: FactoryConfig,
    source: Arc<dyn ByteSource>,
    sniffer: ContentSniffer,
    registry: ModelRegistry,
    events: Arc<dyn LoadEventSink>,
}

impl ModelFactory {
    /// Factory over the local filesystem with the memory-map backend.
    pub fn new(config: FactoryConfig) -> Self {
        Self::with_components(config, FsSource::shared(), Arc::new(MmapBackend::new()), Arc::new(TracingSink))
    }

    pub fn with_components(
        config: FactoryConfig,
        source: Arc<dyn ByteSource>,
        backend: Arc<dyn ExecutionBackend>,
        events: Arc<dyn LoadEventSink>,
    ) -> Self {
        let sniffer = ContentSniffer::new(source.clone(), config.sniff_prefix_bytes, config.max_header_bytes);
        let registry = ModelRegistry::new(LoaderContext {
            source: source.clone(),
            backend,
            limits: config.header_limits(),
        });
        Self { config, source, sniffer, registry, events }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Format of `path`. Pure; `Unknown` when unresolvable.
    pub fn detect_format(&self, path: &Path) -> ModelFormat {
        self.sniff(path).format
    }

    /// Detection with its basis, warnings and errors.
    pub fn sniff(&self, path: &Path) -> SniffReport {
        let report = self.sniffer.sniff(path);
        self.events.record(&LoaderEvent::Detected { path: path.to_path_buf(), format: report.format });
        report
    }

    /// Structural check without loading. Never touches the registry.
    ///
    /// Unresolvable input yields an `Unknown`, invalid result carrying the
    /// detection errors rather than an error value.
    pub fn validate_model(&self, path: &Path, format_hint: Option<ModelFormat>) -> ValidationResult {
        let (format, sniff_warnings) = match format_hint {
            Some(format) => (format, Vec::new()),
            None => {
                let report = self.sniff(path);
                if !report.format.is_known() {
                    let mut result = ValidationResult::new(ModelFormat::Unknown);
                    report.errors.into_iter().for_each(|e| result.error(e));
                    report.warnings.into_iter().for_each(|w| result.warn(w));
                    if result.errors.is_empty() {
                        result.error("could not determine model format");
                    }
                    return self.validated(path, result.finish());
                }
                (report.format, report.warnings)
            }
        };

        let Some(loader) = self.registry.get_or_create_loader(format) else {
            let mut result = ValidationResult::new(ModelFormat::Unknown);
            result.error("format hint is unknown");
            return self.validated(path, result.finish());
        };
        let mut result = loader.validate(path);
        if !sniff_warnings.is_empty() {
            result.warnings.splice(0..0, sniff_warnings);
        }
        self.validated(path, result)
    }

    fn validated(&self, path: &Path, result: ValidationResult) -> ValidationResult {
        self.events.record(&LoaderEvent::Validated {
            path: path.to_path_buf(),
            format: result.format,
            valid: result.valid,
            error_count: result.errors.len(),
            warning_count: result.warnings.len(),
        });
        result
    }

    /// Descriptor for `path` built from validation, without loading.
    pub fn inspect_model(&self, path: &Path, format_hint: Option<ModelFormat>) -> ModelDescriptor {
        let result = self.validate_model(path, format_hint);
        match self.source.stat(path) {
            Ok(stat) => ModelDescriptor::from_validation(path.to_path_buf(), &stat, &result),
            Err(_) => {
                let mut descriptor = ModelDescriptor::missing(path.to_path_buf());
                descriptor.errors = result.errors;
                descriptor
            }
        }
    }

    /// Validate, materialise and register a model.
    pub fn load_model(&self, path: &Path, options: LoadOptions) -> Result<ModelDescriptor, FactoryError> {
        let start = Instant::now();
        let stat = self.source.stat(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FactoryError::NotFound(path.to_path_buf()),
            _ => FactoryError::Load { path: path.to_path_buf(), reason: LoadFailure::from_io(path, e) },
        })?;

        let (format, sniff_warnings) = match options.format_hint {
            Some(format) => (format, Vec::new()),
            None => {
                let report = self.sniff(path);
                if !report.format.is_known() {
                    return Err(FactoryError::FormatDetection { path: path.to_path_buf(), errors: report.errors });
                }
                (report.format, report.warnings)
            }
        };
        let loader = self.registry.get_or_create_loader(format).ok_or_else(|| FactoryError::FormatDetection {
            path: path.to_path_buf(),
            errors: vec!["format hint is unknown".to_string()],
        })?;

        let canonical = self.source.canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let id = options.model_id.clone().unwrap_or_else(|| derive_model_id(format, &canonical));
        let reservation = self.registry.reserve(&id)?;

        let validation = self.validated(path, loader.validate(path));
        if !validation.valid {
            if options.format_hint.is_some() {
                let detected = self.detect_format(path);
                if detected.is_known() && detected != format {
                    return Err(self.load_failed(path, format, LoadFailure::FormatMismatch { hinted: format, detected }));
                }
            }
            return Err(FactoryError::Validation {
                path: path.to_path_buf(),
                format,
                reason: validation.errors.first().cloned().unwrap_or_default(),
                errors: validation.errors,
            });
        }

        let config = options.config.unwrap_or_else(|| self.config.load_config());
        let limit = config.memory_limit_bytes.or(self.config.memory_limit_bytes);
        if let Some(limit) = limit {
            if validation.estimated_memory_bytes > limit {
                return Err(self.load_failed(
                    path,
                    format,
                    LoadFailure::OutOfMemory { required: validation.estimated_memory_bytes, limit },
                ));
            }
        }

        let handle = loader
            .load(path, &config)
            .map_err(|reason| self.load_failed(path, format, reason))?;

        let mut descriptor = ModelDescriptor::from_validation(path.to_path_buf(), &stat, &validation);
        if !sniff_warnings.is_empty() {
            descriptor.warnings.splice(0..0, sniff_warnings);
        }
        if let Some(provider) = handle.provider() {
            descriptor.metadata.insert(EXECUTION_PROVIDER_KEY.to_string(), provider.name().to_string());
        }
        let provider = handle.provider();

        loader.ownership().claim(&id);
        reservation.commit(LoadedModel {
            id: id.clone(),
            descriptor: descriptor.clone(),
            handle,
            loader,
        });
        self.events.record(&LoaderEvent::Loaded {
            id,
            format,
            provider,
            elapsed: start.elapsed(),
            estimated_memory_bytes: descriptor.estimated_memory_bytes,
        });
        Ok(descriptor)
    }

    fn load_failed(&self, path: &Path, format: ModelFormat, reason: LoadFailure) -> FactoryError {
        self.events.record(&LoaderEvent::LoadFailed {
            path: path.to_path_buf(),
            format,
            reason: reason.to_string(),
        });
        FactoryError::Load { path: path.to_path_buf(), reason }
    }

    /// Release a loaded model. Unknown ids yield `FactoryError::Unload`,
    /// which callers may treat as a warning.
    pub fn unload_model(&self, id: &str) -> Result<(), FactoryError> {
        match self.registry.unregister(id) {
            Ok(descriptor) => {
                self.events.record(&LoaderEvent::Unloaded { id: id.to_string(), format: descriptor.format });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = %id, "unload of a model that is not loaded");
                Err(e)
            }
        }
    }

    /// Read-only snapshot of loaded models, keyed by id.
    pub fn get_loaded_models(&self) -> BTreeMap<String, ModelDescriptor> {
        self.registry.list()
    }

    /// Unload every model and drop cached loaders. Returns how many models
    /// were released.
    pub fn clear_loaders(&self) -> usize {
        let models = self.registry.clear();
        self.registry.clear_loaders();
        self.events.record(&LoaderEvent::Cleared { models });
        models
    }

    /// Estimated resident bytes for a loaded model id or an artifact path.
    pub fn estimate_memory(&self, path_or_id: &str) -> Result<u64, FactoryError> {
        if let Some(descriptor) = self.registry.get(path_or_id) {
            return Ok(descriptor.estimated_memory_bytes);
        }
        let path = Path::new(path_or_id);
        if self.source.stat(path).is_err() {
            return Err(FactoryError::NotFound(path.to_path_buf()));
        }
        let report = self.sniff(path);
        let loader = self
            .registry
            .get_or_create_loader(report.format)
            .ok_or_else(|| FactoryError::FormatDetection { path: path.to_path_buf(), errors: report.errors })?;
        loader
            .estimate_memory(path)
            .map_err(|reason| FactoryError::Load { path: path.to_path_buf(), reason })
    }

    /// [`ModelFactory::load_model`] on tokio's blocking pool.
    pub async fn load_model_async(
        self: &Arc<Self>,
        path: PathBuf,
        options: LoadOptions,
    ) -> Result<ModelDescriptor, FactoryError> {
        let factory = Arc::clone(self);
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || factory.load_model(&task_path, options))
            .await
            .unwrap_or_else(|e| {
                Err(FactoryError::Load { path, reason: LoadFailure::Backend(format!("load task failed: {}", e)) })
            })
    }

    /// [`ModelFactory::validate_model`] on tokio's blocking pool.
    pub async fn validate_model_async(
        self: &Arc<Self>,
        path: PathBuf,
        format_hint: Option<ModelFormat>,
    ) -> ValidationResult {
        let factory = Arc::clone(self);
        tokio::task::spawn_blocking(move || factory.validate_model(&path, format_hint))
            .await
            .unwrap_or_else(|e| {
                let mut result = ValidationResult::new(format_hint.unwrap_or(ModelFormat::Unknown));
                result.error(format!("validation task failed: {}", e));
                result.finish()
            })
    }
}
