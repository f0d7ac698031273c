//! Content sniffer.
//!
//! Reads a bounded prefix of a file (or lists a directory) and identifies the
//! artifact format. Content signatures always win over the extension; the
//! extension only decides when content is unreadable or inconclusive.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::protobuf::{probe_model_proto, ProtoVerdict};
use super::signature::{self, SAFETENSORS_LEN_PREFIX};
use super::{DetectionBasis, ModelFormat};
use crate::source::ByteSource;

/// Shortest prefix any content signature needs.
const MIN_SIGNATURE_BYTES: u64 = 4;

/// Detection result with the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffReport {
    pub format: ModelFormat,
    pub basis: DetectionBasis,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SniffReport {
    fn found(format: ModelFormat, basis: DetectionBasis) -> Self {
        Self { format, basis, warnings: Vec::new(), errors: Vec::new() }
    }

    fn unknown(error: impl Into<String>) -> Self {
        Self {
            format: ModelFormat::Unknown,
            basis: DetectionBasis::None,
            warnings: Vec::new(),
            errors: vec![error.into()],
        }
    }

    fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Identifies formats from content, directory layout and, last, extension.
#[derive(Clone)]
pub struct ContentSniffer {
    source: Arc<dyn ByteSource>,
    prefix_bytes: usize,
    max_header_bytes: u64,
}

impl ContentSniffer {
    pub fn new(source: Arc<dyn ByteSource>, prefix_bytes: usize, max_header_bytes: u64) -> Self {
        Self { source, prefix_bytes: prefix_bytes.max(16), max_header_bytes }
    }

    /// Format only. Never fails; unresolvable input is `Unknown`.
    pub fn detect(&self, path: &Path) -> ModelFormat {
        self.sniff(path).format
    }

    pub fn sniff(&self, path: &Path) -> SniffReport {
        let report = match self.source.stat(path) {
            Ok(stat) if stat.is_dir => self.sniff_dir(path),
            Ok(stat) => self.sniff_file(path, stat.size_bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                SniffReport::unknown(format!("path does not exist: {}", path.display()))
            }
            Err(e) => unreadable(path, &e),
        };
        tracing::debug!(
            path = %path.display(),
            format = %report.format,
            basis = ?report.basis,
            "sniffed model artifact"
        );
        report
    }

    fn sniff_file(&self, path: &Path, size: u64) -> SniffReport {
        if size == 0 {
            return SniffReport::unknown("truncated header: file is empty (0 bytes)");
        }
        let prefix = match self.source.read_at(path, 0, self.prefix_bytes) {
            Ok(bytes) => bytes,
            Err(e) => return unreadable(path, &e),
        };
        let by_ext = signature::format_for_extension(path);

        if let Some(format) = self.identify_content(path, &prefix, size) {
            let report = SniffReport::found(format, DetectionBasis::Content);
            return match by_ext {
                Some(ext_format) if ext_format != format => report.with_warning(format!(
                    "extension mismatch: content identifies {} but the file name implies {}; using {}",
                    format, ext_format, format
                )),
                _ => report,
            };
        }

        if size < MIN_SIGNATURE_BYTES {
            return SniffReport::unknown(format!(
                "truncated header: {} bytes is shorter than any format signature",
                size
            ));
        }

        match by_ext {
            Some(format) if signature::extension_fallback_allowed(format) => {
                SniffReport::found(format, DetectionBasis::Extension).with_warning(format!(
                    "content inconclusive; format {} inferred from extension",
                    format
                ))
            }
            Some(format) => SniffReport::unknown(format!(
                "file name implies {} but content carries no {} signature",
                format, format
            )),
            None => SniffReport::unknown("no format signature matched and extension is not recognized"),
        }
    }

    fn identify_content(&self, path: &Path, prefix: &[u8], size: u64) -> Option<ModelFormat> {
        if signature::has_gguf_magic(prefix) {
            return Some(ModelFormat::Gguf);
        }
        // A SafeTensors length prefix can collide with the zip and pickle magic bytes.
        if self.looks_like_safetensors(path, prefix, size) {
            return Some(ModelFormat::SafeTensors);
        }
        if signature::has_zip_magic(prefix) || signature::has_pickle_header(prefix) {
            return Some(ModelFormat::PyTorch);
        }
        match probe_model_proto(prefix, size) {
            ProtoVerdict::Onnx => Some(ModelFormat::Onnx),
            ProtoVerdict::CoreMl => Some(ModelFormat::CoreMl),
            ProtoVerdict::Ambiguous => match signature::format_for_extension(path) {
                // Protobuf-consistent content: the extension picks between the two.
                Some(f @ (ModelFormat::Onnx | ModelFormat::CoreMl)) => Some(f),
                _ => None,
            },
            ProtoVerdict::NotProtobuf => None,
        }
    }

    fn looks_like_safetensors(&self, path: &Path, prefix: &[u8], size: u64) -> bool {
        let Some(header_len) = signature::safetensors_header_len(prefix) else {
            return false;
        };
        let prefix_len = SAFETENSORS_LEN_PREFIX as u64;
        if header_len < 2 || header_len > self.max_header_bytes || prefix_len + header_len > size {
            return false;
        }
        if prefix.get(SAFETENSORS_LEN_PREFIX) != Some(&b'{') {
            return false;
        }
        let header_end = SAFETENSORS_LEN_PREFIX + header_len as usize;
        let header = if header_end <= prefix.len() {
            prefix[SAFETENSORS_LEN_PREFIX..header_end].to_vec()
        } else {
            match self.source.read_exact_at(path, prefix_len, header_len as usize) {
                Ok(bytes) => bytes,
                Err(_) => return false,
            }
        };
        let Ok(map) = serde_json::from_slice::<serde_json::Map<String, Value>>(&header) else {
            return false;
        };
        map.iter()
            .filter(|(k, _)| k.as_str() != "__metadata__")
            .all(|(_, v)| v.get("dtype").is_some() && v.get("data_offsets").is_some())
    }

    fn sniff_dir(&self, path: &Path) -> SniffReport {
        let entries = match self.source.list_dir(path) {
            Ok(entries) => entries,
            Err(e) => return SniffReport::unknown(format!("cannot list directory: {}", e)),
        };
        let has = |name: &str| entries.iter().any(|e| !e.is_dir && e.name == name);
        let is_mlpackage = signature::format_for_extension(path) == Some(ModelFormat::CoreMl);

        if has(signature::MLPACKAGE_MANIFEST) && (is_mlpackage || entries.iter().any(|e| e.is_dir && e.name == "Data")) {
            return SniffReport::found(ModelFormat::CoreMl, DetectionBasis::Structure);
        }
        if is_mlpackage {
            return SniffReport::found(ModelFormat::CoreMl, DetectionBasis::Extension)
                .with_warning("mlpackage bundle has no Manifest.json");
        }

        let has_config = signature::MLX_CONFIG_FILES.iter().any(|f| has(f));
        let shard_count = entries
            .iter()
            .filter(|e| !e.is_dir && signature::is_mlx_shard(&e.name))
            .count();
        if has_config && shard_count > 0 {
            return SniffReport::found(ModelFormat::Mlx, DetectionBasis::Structure);
        }

        SniffReport::unknown(if has_config {
            "directory has a config file but no weight shards".to_string()
        } else {
            "directory has no recognizable bundle layout (expected config.json with weight shards)".to_string()
        })
    }
}

/// Content could not be read at all: the extension is the only evidence left.
fn unreadable(path: &Path, err: &io::Error) -> SniffReport {
    match signature::format_for_extension(path) {
        Some(format) => SniffReport::found(format, DetectionBasis::Extension).with_warning(format!(
            "content unreadable ({}); format {} inferred from extension",
            err, format
        )),
        None => SniffReport::unknown(format!("content unreadable: {}", err)),
    }
}
