//! Format signature table.
//!
//! Static extension mapping and the fixed byte markers that identify a
//! format independently of its filename.

use std::path::Path;

use super::ModelFormat;

/// `GGUF` as it appears on disk.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// ZIP local-file-header magic, used by `torch.save` since 1.6.
pub const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Pickle `PROTO` opcode.
pub const PICKLE_PROTO: u8 = 0x80;

/// Pickle protocols `torch.save` has ever emitted.
pub const PICKLE_PROTOCOLS: std::ops::RangeInclusive<u8> = 2..=5;

/// Length of the SafeTensors header-size prefix.
pub const SAFETENSORS_LEN_PREFIX: usize = 8;

/// Config file names that mark an MLX bundle.
pub const MLX_CONFIG_FILES: &[&str] = &["config.json"];

/// Weight-shard extensions accepted inside an MLX bundle.
pub const MLX_SHARD_EXTENSIONS: &[&str] = &["safetensors", "npz"];

/// Manifest of an `.mlpackage` bundle.
pub const MLPACKAGE_MANIFEST: &str = "Manifest.json";

/// Extensions that name each format.
pub fn extensions(format: ModelFormat) -> &'static [&'static str] {
    match format {
        ModelFormat::Gguf => &["gguf"],
        ModelFormat::SafeTensors => &["safetensors"],
        ModelFormat::Mlx => &[],
        ModelFormat::CoreMl => &["mlmodel", "mlpackage"],
        ModelFormat::PyTorch => &["pt", "pth", "bin"],
        ModelFormat::Onnx => &["onnx", "ort"],
        ModelFormat::Unknown => &[],
    }
}

/// Format implied by the path's extension, if any.
pub fn format_for_extension(path: &Path) -> Option<ModelFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    ModelFormat::CONCRETE
        .into_iter()
        .find(|f| extensions(*f).contains(&ext.as_str()))
}

/// Whether an extension alone is allowed to decide this format when content
/// was readable but inconclusive.
pub fn extension_fallback_allowed(format: ModelFormat) -> bool {
    matches!(format, ModelFormat::PyTorch | ModelFormat::Onnx | ModelFormat::CoreMl)
}

/// Every extension in the table.
pub fn supported_extensions() -> Vec<&'static str> {
    ModelFormat::CONCRETE
        .into_iter()
        .flat_map(|f| extensions(f).iter().copied())
        .collect()
}

pub fn has_gguf_magic(prefix: &[u8]) -> bool {
    prefix.len() >= GGUF_MAGIC.len() && &prefix[..4] == GGUF_MAGIC
}

pub fn has_zip_magic(prefix: &[u8]) -> bool {
    prefix.len() >= ZIP_MAGIC.len() && &prefix[..4] == ZIP_MAGIC
}

/// Pickle stream opened with `PROTO n`, n in the torch range.
pub fn has_pickle_header(prefix: &[u8]) -> bool {
    prefix.len() >= 2 && prefix[0] == PICKLE_PROTO && PICKLE_PROTOCOLS.contains(&prefix[1])
}

/// Decode the SafeTensors header length, if the prefix is long enough.
pub fn safetensors_header_len(prefix: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = prefix.get(..SAFETENSORS_LEN_PREFIX)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

pub fn is_mlx_shard(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| MLX_SHARD_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
