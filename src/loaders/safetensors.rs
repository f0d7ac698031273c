//! SafeTensors loader.
//!
//! The JSON header is read and checked tensor by tensor (dtype, shape,
//! offsets) without touching the data section. Loading maps the file and
//! deserializes the offset table with the `safetensors` crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::{file_size, is_file, FormatLoader, HeaderLimits, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{MaterializeRequest, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::signature::SAFETENSORS_LEN_PREFIX;
use crate::formats::ModelFormat;
use crate::source::ByteSource;

const METADATA_KEY: &str = "__metadata__";

/// Element width in bytes, or `None` for dtypes this parser does not know.
fn dtype_size(dtype: &str) -> Option<u64> {
    Some(match dtype {
        "BOOL" | "U8" | "I8" | "F8_E5M2" | "F8_E4M3" => 1,
        "I16" | "U16" | "F16" | "BF16" => 2,
        "I32" | "U32" | "F32" => 4,
        "I64" | "U64" | "F64" => 8,
        _ => return None,
    })
}

/// One tensor descriptor from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u64>,
    /// `[begin, end)` relative to the start of the data section.
    pub data_offsets: (u64, u64),
}

impl TensorEntry {
    pub fn element_count(&self) -> u64 {
        self.shape.iter().fold(1u64, |acc, d| acc.saturating_mul(*d))
    }

    pub fn byte_len(&self) -> u64 {
        self.data_offsets.1.saturating_sub(self.data_offsets.0)
    }
}

/// Parsed SafeTensors header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafeTensorsHeader {
    pub header_len: u64,
    /// Size of the data section following the header.
    pub data_len: u64,
    pub tensors: Vec<TensorEntry>,
    pub metadata: BTreeMap<String, String>,
}

impl SafeTensorsHeader {
    /// Read and parse the header of `path`. Fails on framing or JSON errors;
    /// per-tensor consistency is reported by [`SafeTensorsHeader::check`].
    pub fn read(source: &dyn ByteSource, path: &Path, limits: &HeaderLimits) -> Result<Self, String> {
        let size = source.stat(path).map_err(|e| e.to_string())?.size_bytes;
        let prefix_len = SAFETENSORS_LEN_PREFIX as u64;
        if size < prefix_len {
            return Err(format!("truncated header: {} bytes, need at least {}", size, prefix_len));
        }
        let len_bytes = source.read_exact_at(path, 0, SAFETENSORS_LEN_PREFIX).map_err(|e| e.to_string())?;
        let mut raw = [0u8; SAFETENSORS_LEN_PREFIX];
        raw.copy_from_slice(&len_bytes);
        let header_len = u64::from_le_bytes(raw);

        if header_len > limits.max_header_bytes {
            return Err(format!(
                "header length {} exceeds limit of {} bytes",
                header_len, limits.max_header_bytes
            ));
        }
        if prefix_len + header_len > size {
            return Err(format!(
                "truncated header: declared header length {} exceeds file size {}",
                header_len, size
            ));
        }
        let bytes = source
            .read_exact_at(path, prefix_len, header_len as usize)
            .map_err(|e| e.to_string())?;
        let data_len = size - prefix_len - header_len;
        Self::parse(&bytes, data_len, limits)
    }

    /// Parse the JSON header bytes.
    pub fn parse(bytes: &[u8], data_len: u64, limits: &HeaderLimits) -> Result<Self, String> {
        let map: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| format!("header is not a JSON object: {}", e))?;
        if map.len() as u64 > limits.max_metadata_entries {
            return Err(format!("header declares {} entries", map.len()));
        }

        let mut header = SafeTensorsHeader { header_len: bytes.len() as u64, data_len, ..Default::default() };
        for (name, value) in map {
            if name == METADATA_KEY {
                let Value::Object(meta) = value else {
                    return Err(format!("{} must be an object", METADATA_KEY));
                };
                for (k, v) in meta {
                    match v {
                        Value::String(s) => header.metadata.insert(k, s),
                        other => return Err(format!("{} value for {} is not a string: {}", METADATA_KEY, k, other)),
                    };
                }
                continue;
            }
            header.tensors.push(parse_entry(name, &value)?);
        }
        header.tensors.sort_by_key(|t| t.data_offsets);
        Ok(header)
    }

    /// Structural complaints and warnings: `(errors, warnings)`.
    pub fn check(&self) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut cursor = 0u64;
        for t in &self.tensors {
            let (begin, end) = t.data_offsets;
            let Some(width) = dtype_size(&t.dtype) else {
                errors.push(format!("tensor {} has unknown dtype {}", t.name, t.dtype));
                continue;
            };
            if begin > end {
                errors.push(format!("tensor {} has inverted offsets [{}, {})", t.name, begin, end));
                continue;
            }
            if end > self.data_len {
                errors.push(format!(
                    "tensor {} ends at {} but the data section is {} bytes",
                    t.name, end, self.data_len
                ));
            }
            let expected = t.shape.iter().try_fold(width, |acc, d| acc.checked_mul(*d));
            if expected != Some(end - begin) {
                errors.push(format!(
                    "tensor {} spans {} bytes but {} {:?} needs {}",
                    t.name,
                    end - begin,
                    t.dtype,
                    t.shape,
                    expected.map(|n| n.to_string()).unwrap_or_else(|| "overflow".into())
                ));
            }
            if begin < cursor {
                errors.push(format!("tensor {} overlaps the previous tensor", t.name));
            } else if begin > cursor {
                warnings.push(format!("{} unused bytes before tensor {}", begin - cursor, t.name));
            }
            cursor = cursor.max(end);
        }
        if errors.is_empty() && cursor < self.data_len {
            warnings.push(format!("{} trailing bytes after the last tensor", self.data_len - cursor));
        }
        (errors, warnings)
    }

    pub fn parameter_count(&self) -> u64 {
        self.tensors
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.element_count()))
    }
}

fn parse_entry(name: String, value: &Value) -> Result<TensorEntry, String> {
    let dtype = value
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("tensor {} has no dtype", name))?
        .to_string();
    let shape = value
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| format!("tensor {} has no shape", name))?
        .iter()
        .map(|d| d.as_u64().ok_or_else(|| format!("tensor {} has a non-integer dimension", name)))
        .collect::<Result<Vec<_>, _>>()?;
    let offsets = value
        .get("data_offsets")
        .and_then(Value::as_array)
        .filter(|a| a.len() == 2)
        .ok_or_else(|| format!("tensor {} needs data_offsets [begin, end]", name))?;
    let begin = offsets[0].as_u64().ok_or_else(|| format!("tensor {} has a bad begin offset", name))?;
    let end = offsets[1].as_u64().ok_or_else(|| format!("tensor {} has a bad end offset", name))?;
    Ok(TensorEntry { name, dtype, shape, data_offsets: (begin, end) })
}

/// Loader for single-file `.safetensors` artifacts.
pub struct SafeTensorsLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl SafeTensorsLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }
}

impl FormatLoader for SafeTensorsLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn can_load(&self, path: &Path) -> bool {
        if !is_file(&self.ctx, path) {
            return false;
        }
        matches!(
            self.ctx.source.read_at(path, 0, SAFETENSORS_LEN_PREFIX + 1),
            Ok(bytes) if bytes.len() == SAFETENSORS_LEN_PREFIX + 1 && bytes[SAFETENSORS_LEN_PREFIX] == b'{'
        )
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::SafeTensors);
        let header = match SafeTensorsHeader::read(self.ctx.source.as_ref(), path, &self.ctx.limits) {
            Ok(header) => header,
            Err(e) => {
                result.error(e);
                return result.finish();
            }
        };
        let (errors, warnings) = header.check();
        errors.into_iter().for_each(|e| result.error(e));
        warnings.into_iter().for_each(|w| result.warn(w));
        if header.tensors.is_empty() {
            result.warn("file contains no tensors");
        }

        result.meta("tensor_count", header.tensors.len());
        result.meta("parameter_count", header.parameter_count());
        result.meta("header_bytes", header.header_len);
        for (k, v) in &header.metadata {
            result.meta(&format!("{}.{}", METADATA_KEY, k), v);
        }
        result.estimated_memory_bytes = SAFETENSORS_LEN_PREFIX as u64 + header.header_len + header.data_len;
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let files: Vec<PathBuf> = vec![path.to_path_buf()];
        let metadata = BTreeMap::new();
        let inner = self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::SafeTensors,
            path,
            files: &files,
            metadata: &metadata,
            provider: None,
            config,
        })?;
        Ok(RuntimeHandle::new(ModelFormat::SafeTensors, None, inner))
    }

    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        file_size(&self.ctx, path)
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MappedArtifact, MmapBackend};
    use crate::source::FsSource;
    use std::sync::Arc;

    fn loader() -> SafeTensorsLoader {
        SafeTensorsLoader::new(LoaderContext {
            source: FsSource::shared(),
            backend: Arc::new(MmapBackend::new()),
            limits: HeaderLimits::default(),
        })
    }

    fn write(dir: &Path, header: &str, data_len: usize) -> PathBuf {
        let path = dir.join("model.safetensors");
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend(std::iter::repeat(0u8).take(data_len));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn valid_header_reports_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},"b":{"dtype":"F16","shape":[2],"data_offsets":[16,20]}}"#,
            20,
        );

        let result = loader().validate(&path);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.metadata["parameter_count"], "6");
        assert_eq!(result.metadata["__metadata__.format"], "pt");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"w":{"dtype":"F32","shape":[4],"data_offsets":[0,8]}}"#, 8);

        let result = loader().validate(&path);
        assert!(!result.valid);
        assert!(result.errors[0].contains("needs 16"));
    }

    #[test]
    fn offsets_past_data_section_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"w":{"dtype":"U8","shape":[64],"data_offsets":[0,64]}}"#, 10);

        let result = loader().validate(&path);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("data section is 10 bytes")));
    }

    #[test]
    fn load_exposes_tensor_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"w":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#, 4);

        let handle = loader().load(&path, &LoadConfig::default()).unwrap();
        let artifact = handle.downcast_ref::<MappedArtifact>().unwrap();
        assert_eq!(artifact.tensor_names, vec!["w".to_string()]);
    }
}
