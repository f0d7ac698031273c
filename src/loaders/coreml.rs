//! CoreML loader for `.mlmodel` files and `.mlpackage` bundles.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use super::{file_size, FormatLoader, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{MaterializeRequest, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::protobuf::{scan_coreml, CoreMlSummary};
use crate::formats::signature::MLPACKAGE_MANIFEST;
use crate::formats::ModelFormat;
use crate::source::WindowedReader;

const DATA_DIR: &str = "Data";
const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;
const MAX_BUNDLE_DEPTH: usize = 8;

/// Loader for CoreML artifacts.
pub struct CoreMlLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl CoreMlLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }

    fn is_package(&self, path: &Path) -> bool {
        matches!(self.ctx.source.stat(path), Ok(s) if s.is_dir)
    }

    fn scan_spec(&self, path: &Path) -> Result<CoreMlSummary, String> {
        let size = file_size(&self.ctx, path).map_err(|e| e.to_string())?;
        if size == 0 {
            return Err("truncated header: file is empty (0 bytes)".into());
        }
        let mut reader = WindowedReader::with_len(self.ctx.source.as_ref(), path, size);
        scan_coreml(&mut reader, size).map_err(|e| format!("malformed CoreML model: {}", e))
    }

    /// Path of the root model spec named by the package manifest.
    fn root_model(&self, package: &Path) -> Result<PathBuf, String> {
        let manifest = package.join(MLPACKAGE_MANIFEST);
        let size = file_size(&self.ctx, &manifest).map_err(|_| format!("package has no {}", MLPACKAGE_MANIFEST))?;
        if size > MAX_MANIFEST_BYTES {
            return Err(format!("{} is larger than {} bytes", MLPACKAGE_MANIFEST, MAX_MANIFEST_BYTES));
        }
        let bytes = self
            .ctx
            .source
            .read_exact_at(&manifest, 0, size as usize)
            .map_err(|e| format!("cannot read {}: {}", MLPACKAGE_MANIFEST, e))?;
        let json: Value =
            serde_json::from_slice(&bytes).map_err(|e| format!("{} is not valid JSON: {}", MLPACKAGE_MANIFEST, e))?;

        let root_id = json
            .get("rootModelIdentifier")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{} has no rootModelIdentifier", MLPACKAGE_MANIFEST))?;
        let entry_path = json
            .get("itemInfoEntries")
            .and_then(|entries| entries.get(root_id))
            .and_then(|entry| entry.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("root model {} is not listed in itemInfoEntries", root_id))?;
        let relative = Path::new(entry_path);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.as_os_str().is_empty() || !contained {
            return Err(format!("root model path {:?} escapes the package Data directory", entry_path));
        }
        Ok(package.join(DATA_DIR).join(relative))
    }

    fn package_files(&self, dir: &Path, depth: usize, out: &mut Vec<(PathBuf, u64)>) -> Result<(), LoadFailure> {
        if depth > MAX_BUNDLE_DEPTH {
            return Ok(());
        }
        for entry in self.ctx.source.list_dir(dir).map_err(|e| LoadFailure::from_io(dir, e))? {
            if entry.is_dir {
                self.package_files(&entry.path, depth + 1, out)?;
            } else {
                out.push((entry.path, entry.size_bytes));
            }
        }
        Ok(())
    }

    fn data_files(&self, package: &Path) -> Result<Vec<(PathBuf, u64)>, LoadFailure> {
        let mut files = Vec::new();
        self.package_files(&package.join(DATA_DIR), 0, &mut files)?;
        Ok(files)
    }
}

impl FormatLoader for CoreMlLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::CoreMl
    }

    fn can_load(&self, path: &Path) -> bool {
        match self.ctx.source.stat(path) {
            Ok(stat) if stat.is_dir => self.ctx.source.stat(&path.join(MLPACKAGE_MANIFEST)).is_ok(),
            Ok(stat) => stat.size_bytes > 0,
            Err(_) => false,
        }
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::CoreMl);
        let spec_path = if self.is_package(path) {
            result.meta("container", "mlpackage");
            match self.root_model(path) {
                Ok(root) => root,
                Err(e) => {
                    result.error(e);
                    return result.finish();
                }
            }
        } else {
            result.meta("container", "mlmodel");
            path.to_path_buf()
        };

        match self.scan_spec(&spec_path) {
            Ok(summary) => {
                match summary.specification_version {
                    Some(v) => result.meta("specification_version", v),
                    None => result.warn("model declares no specification version"),
                }
                match summary.model_type() {
                    Some(kind) => result.meta("model_type", kind),
                    None => result.error("model has no model-type field"),
                }
                if !summary.has_description {
                    result.warn("model has no interface description");
                }
                result.meta("is_updatable", summary.is_updatable);
            }
            Err(e) => result.error(e),
        }

        match self.estimate_memory(path) {
            Ok(bytes) => result.estimated_memory_bytes = bytes,
            Err(e) => result.warn(format!("cannot size bundle: {}", e)),
        }
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let files: Vec<PathBuf> = if self.is_package(path) {
            let root = self.root_model(path).map_err(LoadFailure::CorruptHeader)?;
            if self.ctx.source.stat(&root).is_err() {
                return Err(LoadFailure::MissingShard(root));
            }
            self.data_files(path)?.into_iter().map(|(p, _)| p).collect()
        } else {
            vec![path.to_path_buf()]
        };

        let metadata = BTreeMap::new();
        let inner = self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::CoreMl,
            path,
            files: &files,
            metadata: &metadata,
            provider: None,
            config,
        })?;
        Ok(RuntimeHandle::new(ModelFormat::CoreMl, None, inner))
    }

    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        if self.is_package(path) {
            Ok(self.data_files(path)?.iter().map(|(_, size)| size).sum())
        } else {
            file_size(&self.ctx, path)
        }
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}
