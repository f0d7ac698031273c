//! GGUF loader.
//!
//! Validation walks the header (magic, version, counts, the full key-value
//! table and the tensor-info table) through a windowed reader; tensor data is
//! never touched. Loading memory-maps the file through the backend.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use super::{file_size, is_file, FormatLoader, HeaderLimits, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{MaterializeRequest, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::signature::{has_gguf_magic, GGUF_MAGIC};
use crate::formats::{ModelArchitecture, ModelFormat};
use crate::source::{ByteSource, WindowedReader};

const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;
const MAX_KEY_BYTES: u64 = 65_535;
const MAX_TENSOR_DIMS: u32 = 4;
const DEFAULT_ALIGNMENT: u64 = 32;
/// Highest ggml tensor type id known to this parser.
const MAX_KNOWN_GGML_TYPE: u32 = 39;

#[derive(Debug, Error)]
enum GgufError {
    #[error("truncated header at offset {0}")]
    Truncated(u64),

    #[error("bad magic: expected GGUF, found {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported GGUF version {0} (supported: {MIN_VERSION}-{MAX_VERSION})")]
    UnsupportedVersion(u32),

    #[error("malformed header at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("header limit exceeded: {0}")]
    Limit(String),

    #[error("IO error: {0}")]
    Io(io::Error),
}

/// A metadata value. Arrays are summarised, not materialised.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array { element_type: u32, len: u64 },
}

impl fmt::Display for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::UInt(v) => write!(f, "{}", v),
            GgufValue::Int(v) => write!(f, "{}", v),
            GgufValue::Float(v) => write!(f, "{}", v),
            GgufValue::Bool(v) => write!(f, "{}", v),
            GgufValue::String(s) => f.write_str(s),
            GgufValue::Array { element_type, len } => write!(f, "[type {}; {}]", element_type, len),
        }
    }
}

impl GgufValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::UInt(v) => Some(*v),
            GgufValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Parsed GGUF header.
#[derive(Debug, Clone, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    pub metadata: BTreeMap<String, GgufValue>,
    pub alignment: u64,
    /// Offset where the tensor data section begins.
    pub data_offset: u64,
    /// Highest tensor offset relative to the data section.
    pub max_tensor_offset: u64,
    pub unknown_tensor_types: Vec<u32>,
}

impl GgufHeader {
    pub fn architecture(&self) -> Option<&str> {
        self.metadata.get("general.architecture").and_then(GgufValue::as_str)
    }

    /// Parse the header of `path` without reading tensor data.
    pub fn read(source: &dyn ByteSource, path: &Path, limits: &HeaderLimits) -> Result<Self, String> {
        let mut reader = WindowedReader::open(source, path).map_err(|e| e.to_string())?;
        parse_header(&mut reader, limits).map_err(|e| e.to_string())
    }
}

fn wrap(reader: &WindowedReader<'_>, err: io::Error) -> GgufError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        GgufError::Truncated(reader.position())
    } else {
        GgufError::Io(err)
    }
}

fn read_u32(r: &mut WindowedReader<'_>) -> Result<u32, GgufError> {
    r.read_array::<4>().map(u32::from_le_bytes).map_err(|e| wrap(r, e))
}

fn read_u64(r: &mut WindowedReader<'_>) -> Result<u64, GgufError> {
    r.read_array::<8>().map(u64::from_le_bytes).map_err(|e| wrap(r, e))
}

fn read_string(r: &mut WindowedReader<'_>, max_len: u64) -> Result<String, GgufError> {
    let offset = r.position();
    let len = read_u64(r)?;
    if len > max_len {
        return Err(GgufError::Malformed {
            offset,
            reason: format!("string length {} exceeds limit {}", len, max_len),
        });
    }
    let bytes = r.read_vec(len as usize).map_err(|e| wrap(r, e))?;
    String::from_utf8(bytes).map_err(|_| GgufError::Malformed { offset, reason: "string is not UTF-8".into() })
}

fn skip_string(r: &mut WindowedReader<'_>) -> Result<(), GgufError> {
    let len = read_u64(r)?;
    r.skip(len).map_err(|e| wrap(r, e))
}

/// Byte width of fixed-size scalar types.
fn scalar_width(value_type: u32) -> Option<u64> {
    match value_type {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4 | 5 | 6 => Some(4),
        10 | 11 | 12 => Some(8),
        _ => None,
    }
}

fn read_value(r: &mut WindowedReader<'_>, value_type: u32, limits: &HeaderLimits) -> Result<GgufValue, GgufError> {
    let offset = r.position();
    let arr = |r: &mut WindowedReader<'_>, n: usize| -> Result<Vec<u8>, GgufError> {
        r.read_vec(n).map_err(|e| wrap(r, e))
    };
    Ok(match value_type {
        0 => GgufValue::UInt(u64::from(arr(r, 1)?[0])),
        1 => GgufValue::Int(i64::from(arr(r, 1)?[0] as i8)),
        2 => GgufValue::UInt(u64::from(u16::from_le_bytes(r.read_array::<2>().map_err(|e| wrap(r, e))?))),
        3 => GgufValue::Int(i64::from(i16::from_le_bytes(r.read_array::<2>().map_err(|e| wrap(r, e))?))),
        4 => GgufValue::UInt(u64::from(read_u32(r)?)),
        5 => GgufValue::Int(i64::from(read_u32(r)? as i32)),
        6 => GgufValue::Float(f64::from(f32::from_bits(read_u32(r)?))),
        7 => match arr(r, 1)?[0] {
            0 => GgufValue::Bool(false),
            1 => GgufValue::Bool(true),
            b => return Err(GgufError::Malformed { offset, reason: format!("invalid bool byte {}", b) }),
        },
        8 => GgufValue::String(read_string(r, limits.max_header_bytes)?),
        9 => {
            let element_type = read_u32(r)?;
            let len = read_u64(r)?;
            if len > limits.max_metadata_entries {
                return Err(GgufError::Limit(format!("array of {} elements", len)));
            }
            if let Some(width) = scalar_width(element_type) {
                r.skip(len * width).map_err(|e| wrap(r, e))?;
            } else if element_type == 8 {
                for _ in 0..len {
                    skip_string(r)?;
                }
            } else {
                return Err(GgufError::Malformed {
                    offset,
                    reason: format!("unsupported array element type {}", element_type),
                });
            }
            GgufValue::Array { element_type, len }
        }
        10 => GgufValue::UInt(read_u64(r)?),
        11 => GgufValue::Int(read_u64(r)? as i64),
        12 => GgufValue::Float(f64::from_bits(read_u64(r)?)),
        other => {
            return Err(GgufError::Malformed { offset, reason: format!("unknown value type {}", other) })
        }
    })
}

fn parse_header(r: &mut WindowedReader<'_>, limits: &HeaderLimits) -> Result<GgufHeader, GgufError> {
    let magic = r.read_array::<4>().map_err(|e| wrap(r, e))?;
    if &magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }
    let version = read_u32(r)?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }
    let tensor_count = read_u64(r)?;
    let kv_count = read_u64(r)?;
    if kv_count > limits.max_metadata_entries || tensor_count > limits.max_metadata_entries {
        return Err(GgufError::Limit(format!(
            "{} metadata entries and {} tensors declared",
            kv_count, tensor_count
        )));
    }

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        let key = read_string(r, MAX_KEY_BYTES)?;
        let value_type = read_u32(r)?;
        let value = read_value(r, value_type, limits)?;
        metadata.insert(key, value);
        if r.position() > limits.max_header_bytes {
            return Err(GgufError::Limit(format!("header larger than {} bytes", limits.max_header_bytes)));
        }
    }

    let alignment = metadata
        .get("general.alignment")
        .and_then(GgufValue::as_u64)
        .unwrap_or(DEFAULT_ALIGNMENT);
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(GgufError::Malformed {
            offset: r.position(),
            reason: format!("general.alignment {} is not a power of two", alignment),
        });
    }

    let mut max_tensor_offset = 0;
    let mut unknown_tensor_types = Vec::new();
    for _ in 0..tensor_count {
        let offset = r.position();
        let name = read_string(r, MAX_KEY_BYTES)?;
        let n_dims = read_u32(r)?;
        if n_dims == 0 || n_dims > MAX_TENSOR_DIMS {
            return Err(GgufError::Malformed {
                offset,
                reason: format!("tensor {} has {} dimensions", name, n_dims),
            });
        }
        r.skip(u64::from(n_dims) * 8).map_err(|e| wrap(r, e))?;
        let ggml_type = read_u32(r)?;
        if ggml_type > MAX_KNOWN_GGML_TYPE {
            unknown_tensor_types.push(ggml_type);
        }
        let tensor_offset = read_u64(r)?;
        if tensor_offset % alignment != 0 {
            return Err(GgufError::Malformed {
                offset,
                reason: format!("tensor {} offset {} is not {}-byte aligned", name, tensor_offset, alignment),
            });
        }
        max_tensor_offset = max_tensor_offset.max(tensor_offset);
        if r.position() > limits.max_header_bytes {
            return Err(GgufError::Limit(format!("header larger than {} bytes", limits.max_header_bytes)));
        }
    }

    let data_offset = r.position().div_ceil(alignment) * alignment;
    Ok(GgufHeader {
        version,
        tensor_count,
        kv_count,
        metadata,
        alignment,
        data_offset,
        max_tensor_offset,
        unknown_tensor_types,
    })
}

/// Loader for `.gguf` artifacts.
pub struct GgufLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl GgufLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }
}

impl FormatLoader for GgufLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn can_load(&self, path: &Path) -> bool {
        is_file(&self.ctx, path)
            && self
                .ctx
                .source
                .read_at(path, 0, GGUF_MAGIC.len())
                .map(|b| has_gguf_magic(&b))
                .unwrap_or(false)
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::Gguf);
        let size = match file_size(&self.ctx, path) {
            Ok(size) => size,
            Err(e) => {
                result.error(e.to_string());
                return result.finish();
            }
        };
        let mut reader = WindowedReader::with_len(self.ctx.source.as_ref(), path, size);
        let header = match parse_header(&mut reader, &self.ctx.limits) {
            Ok(header) => header,
            Err(e) => {
                result.error(e.to_string());
                return result.finish();
            }
        };

        if header.tensor_count == 0 {
            result.warn("GGUF file declares no tensors");
        } else if header.data_offset.saturating_add(header.max_tensor_offset) > size {
            result.error(format!(
                "truncated file: tensor data at offset {} lies beyond end of file ({} bytes)",
                header.data_offset.saturating_add(header.max_tensor_offset),
                size
            ));
        }
        for t in &header.unknown_tensor_types {
            result.warn(format!("unknown ggml tensor type {}", t));
        }

        result.meta("gguf.version", header.version);
        result.meta("tensor_count", header.tensor_count);
        result.meta("kv_count", header.kv_count);
        result.meta("alignment", header.alignment);
        result.meta("header_bytes", header.data_offset);
        for key in ["general.architecture", "general.name", "general.file_type", "general.quantization_version"] {
            if let Some(value) = header.metadata.get(key) {
                result.meta(key, value);
            }
        }
        if let Some(arch) = header.architecture() {
            if let Some(ctx_len) = header.metadata.get(&format!("{}.context_length", arch)) {
                result.meta("context_length", ctx_len);
            }
            result.architecture = ModelArchitecture::from_family(arch);
        }
        result.estimated_memory_bytes = size;
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let start = Instant::now();
        let header = GgufHeader::read(self.ctx.source.as_ref(), path, &self.ctx.limits)
            .map_err(LoadFailure::CorruptHeader)?;

        let mut metadata = BTreeMap::new();
        if let Some(arch) = header.architecture() {
            metadata.insert("general.architecture".to_string(), arch.to_string());
        }
        let files: Vec<PathBuf> = vec![path.to_path_buf()];
        let inner = self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::Gguf,
            path,
            files: &files,
            metadata: &metadata,
            provider: None,
            config,
        })?;
        tracing::debug!(
            path = %path.display(),
            tensors = header.tensor_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "gguf materialized"
        );
        Ok(RuntimeHandle::new(ModelFormat::Gguf, None, inner))
    }

    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        // Quantized weights are used in place: resident size tracks file size.
        file_size(&self.ctx, path)
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MmapBackend;
    use crate::source::FsSource;
    use std::sync::Arc;

    fn loader() -> GgufLoader {
        GgufLoader::new(LoaderContext {
            source: FsSource::shared(),
            backend: Arc::new(MmapBackend::new()),
            limits: HeaderLimits::default(),
        })
    }

    fn gguf_string(s: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(&(s.len() as u64).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    fn minimal(version: u32) -> Vec<u8> {
        let mut buf = b"GGUF".to_vec();
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        gguf_string("general.architecture", &mut buf);
        buf.extend_from_slice(&8u32.to_le_bytes());
        gguf_string("llama", &mut buf);
        gguf_string("tokenizer.ggml.tokens", &mut buf);
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        gguf_string("a", &mut buf);
        gguf_string("b", &mut buf);
        buf
    }

    #[test]
    fn parses_minimal_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, minimal(3)).unwrap();

        let result = loader().validate(&path);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.metadata.get("general.architecture").map(String::as_str), Some("llama"));
        assert_eq!(result.architecture, ModelArchitecture::Transformer);
        assert_eq!(result.metadata.get("kv_count").map(String::as_str), Some("2"));
    }

    #[test]
    fn rejects_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, minimal(1)).unwrap();

        let result = loader().validate(&path);
        assert!(!result.valid);
        assert!(result.errors[0].contains("unsupported GGUF version 1"));
    }

    #[test]
    fn magic_only_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"GGUF").unwrap();

        let result = loader().validate(&path);
        assert!(!result.valid);
        assert!(result.errors[0].contains("truncated header"));
        assert!(loader().can_load(&path));
    }

    #[test]
    fn empty_tensor_at_end_of_file_is_valid() {
        let mut buf = b"GGUF".to_vec();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        gguf_string("empty.bias", &mut buf);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        // Pad to the data section; the tensor starts exactly at EOF.
        buf.resize(buf.len().div_ceil(32) * 32, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, &buf).unwrap();

        let result = loader().validate(&path);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.metadata["header_bytes"], buf.len().to_string());
    }

    #[test]
    fn tensor_past_eof_is_reported() {
        let mut buf = b"GGUF".to_vec();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        gguf_string("token_embd.weight", &mut buf);
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&16u64.to_le_bytes());
        buf.extend_from_slice(&16u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&4096u64.to_le_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, buf).unwrap();

        let result = loader().validate(&path);
        assert!(!result.valid);
        assert!(result.errors[0].contains("beyond end of file"), "{:?}", result.errors);
    }
}
