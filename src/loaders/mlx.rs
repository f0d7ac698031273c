//! MLX bundle loader.
//!
//! An MLX model is a directory: `config.json` plus one or more weight shards
//! (`*.safetensors` or `*.npz`). A `model.safetensors.index.json` weight map,
//! when present, must only reference shards that exist.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::safetensors::SafeTensorsHeader;
use super::{FormatLoader, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{MaterializeRequest, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::signature::{has_zip_magic, is_mlx_shard, MLX_CONFIG_FILES};
use crate::formats::{ModelArchitecture, ModelFormat};
use crate::source::DirEntry;

const INDEX_SUFFIX: &str = ".index.json";
/// Largest config or index file read into memory.
const MAX_JSON_BYTES: u64 = 16 * 1024 * 1024;

/// What a directory listing says about the bundle.
struct Bundle {
    config: Option<DirEntry>,
    index: Option<DirEntry>,
    shards: Vec<DirEntry>,
}

impl Bundle {
    fn shard_kind(&self) -> &'static str {
        let safetensors = self.shards.iter().filter(|s| s.name.ends_with(".safetensors")).count();
        match safetensors {
            0 => "npz",
            n if n == self.shards.len() => "safetensors",
            _ => "mixed",
        }
    }

    fn shard_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes).sum()
    }
}

/// Loader for MLX directory bundles.
pub struct MlxLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl MlxLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }

    fn scan(&self, path: &Path) -> Result<Bundle, LoadFailure> {
        let entries = self.ctx.source.list_dir(path).map_err(|e| LoadFailure::from_io(path, e))?;
        let mut bundle = Bundle { config: None, index: None, shards: Vec::new() };
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            if MLX_CONFIG_FILES.contains(&entry.name.as_str()) {
                bundle.config = Some(entry);
            } else if entry.name.ends_with(INDEX_SUFFIX) {
                bundle.index = Some(entry);
            } else if is_mlx_shard(&entry.name) {
                bundle.shards.push(entry);
            }
        }
        Ok(bundle)
    }

    fn read_json(&self, entry: &DirEntry) -> Result<Value, String> {
        if entry.size_bytes > MAX_JSON_BYTES {
            return Err(format!("{} is larger than {} bytes", entry.name, MAX_JSON_BYTES));
        }
        let bytes = self
            .ctx
            .source
            .read_exact_at(&entry.path, 0, entry.size_bytes as usize)
            .map_err(|e| format!("cannot read {}: {}", entry.name, e))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("{} is not valid JSON: {}", entry.name, e))
    }

    /// Shard files named by the index weight map that are not in the bundle.
    fn missing_shards(&self, bundle: &Bundle) -> Result<Vec<String>, String> {
        let Some(index) = &bundle.index else {
            return Ok(Vec::new());
        };
        let json = self.read_json(index)?;
        let weight_map = json
            .get("weight_map")
            .and_then(Value::as_object)
            .ok_or_else(|| format!("{} has no weight_map object", index.name))?;
        let present: BTreeSet<&str> = bundle.shards.iter().map(|s| s.name.as_str()).collect();
        let referenced: BTreeSet<&str> = weight_map.values().filter_map(Value::as_str).collect();
        Ok(referenced
            .into_iter()
            .filter(|name| !present.contains(name))
            .map(str::to_string)
            .collect())
    }
}

impl FormatLoader for MlxLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Mlx
    }

    fn can_load(&self, path: &Path) -> bool {
        match self.scan(path) {
            Ok(bundle) => bundle.config.is_some() && !bundle.shards.is_empty(),
            Err(_) => false,
        }
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::Mlx);
        let bundle = match self.scan(path) {
            Ok(bundle) => bundle,
            Err(e) => {
                result.error(format!("cannot list bundle directory: {}", e));
                return result.finish();
            }
        };

        match &bundle.config {
            None => result.error("bundle has no config.json"),
            Some(entry) => match self.read_json(entry) {
                Ok(Value::Object(config)) => {
                    if let Some(model_type) = config.get("model_type").and_then(Value::as_str) {
                        result.meta("model_type", model_type);
                        result.architecture = ModelArchitecture::from_family(model_type);
                    }
                    if let Some(bits) = config.get("quantization").and_then(|q| q.get("bits")) {
                        result.meta("quantization_bits", bits);
                    }
                }
                Ok(_) => result.error("config.json must be a JSON object"),
                Err(e) => result.error(e),
            },
        }

        if bundle.shards.is_empty() {
            result.error("bundle has no weight shards (*.safetensors or *.npz)");
        }
        match self.missing_shards(&bundle) {
            Ok(missing) => {
                for name in missing {
                    result.error(format!("missing shard: {} is referenced by the index but absent", name));
                }
            }
            Err(e) => result.error(e),
        }

        for shard in &bundle.shards {
            if shard.name.ends_with(".safetensors") {
                match SafeTensorsHeader::read(self.ctx.source.as_ref(), &shard.path, &self.ctx.limits) {
                    Ok(header) => {
                        let (errors, _) = header.check();
                        errors.into_iter().for_each(|e| result.error(format!("{}: {}", shard.name, e)));
                    }
                    Err(e) => result.error(format!("{}: {}", shard.name, e)),
                }
            } else {
                let magic = self.ctx.source.read_at(&shard.path, 0, 4).unwrap_or_default();
                if !has_zip_magic(&magic) {
                    result.error(format!("{}: npz shard is not a zip archive", shard.name));
                }
            }
        }

        result.meta("shard_count", bundle.shards.len());
        if !bundle.shards.is_empty() {
            result.meta("shard_kind", bundle.shard_kind());
        }
        result.estimated_memory_bytes = bundle.shard_bytes();
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let bundle = self.scan(path)?;
        if bundle.shards.is_empty() {
            return Err(LoadFailure::MissingShard(path.to_path_buf()));
        }
        if let Some(name) = self
            .missing_shards(&bundle)
            .map_err(LoadFailure::CorruptHeader)?
            .into_iter()
            .next()
        {
            return Err(LoadFailure::MissingShard(path.join(name)));
        }

        let files: Vec<PathBuf> = bundle.shards.iter().map(|s| s.path.clone()).collect();
        let mut metadata = BTreeMap::new();
        metadata.insert("shard_kind".to_string(), bundle.shard_kind().to_string());
        let inner = self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::Mlx,
            path,
            files: &files,
            metadata: &metadata,
            provider: None,
            config,
        })?;
        Ok(RuntimeHandle::new(ModelFormat::Mlx, None, inner))
    }

    /// Sum of shard sizes; config and index files are not resident.
    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        Ok(self.scan(path)?.shard_bytes())
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}
