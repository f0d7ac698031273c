//! PyTorch checkpoint loader.
//!
//! Zip checkpoints (`torch.save` since 1.6) are inspected through the zip
//! central directory only. Legacy checkpoints are raw pickle streams and are
//! only checked for a supported protocol opcode. Pickle payloads are never
//! unpickled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use super::{file_size, is_file, FormatLoader, LoadConfig, LoaderContext, Ownership, ValidationResult};
use crate::backend::{MaterializeRequest, RuntimeHandle};
use crate::error::LoadFailure;
use crate::formats::signature::{has_pickle_header, has_zip_magic, PICKLE_PROTOCOLS};
use crate::formats::ModelFormat;
use crate::source::SourceReader;

const DATA_PICKLE: &str = "data.pkl";

/// Container layout of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Zip,
    Pickle(u8),
}

impl Container {
    fn as_str(&self) -> &'static str {
        match self {
            Container::Zip => "zip",
            Container::Pickle(_) => "pickle",
        }
    }
}

/// Central-directory facts of a zip checkpoint.
#[derive(Debug, Default)]
struct ArchiveSummary {
    entries: usize,
    root: Option<String>,
    has_data_pickle: bool,
    storage_records: usize,
    has_version: bool,
}

/// Loader for `.pt`, `.pth` and `.bin` checkpoints.
pub struct PyTorchLoader {
    ctx: LoaderContext,
    owned: Ownership,
}

impl PyTorchLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx, owned: Ownership::default() }
    }

    fn container(&self, path: &Path) -> Result<Option<Container>, LoadFailure> {
        let prefix = self.ctx.source.read_at(path, 0, 4).map_err(|e| LoadFailure::from_io(path, e))?;
        if has_zip_magic(&prefix) {
            Ok(Some(Container::Zip))
        } else if has_pickle_header(&prefix) {
            Ok(Some(Container::Pickle(prefix[1])))
        } else {
            Ok(None)
        }
    }

    fn read_archive(&self, path: &Path) -> Result<ArchiveSummary, String> {
        let reader = SourceReader::open(self.ctx.source.as_ref(), path).map_err(|e| e.to_string())?;
        let archive = ZipArchive::new(reader).map_err(|e| format!("corrupt zip archive: {}", e))?;
        if archive.len() as u64 > self.ctx.limits.max_metadata_entries {
            return Err(format!("archive has {} entries", archive.len()));
        }

        let mut summary = ArchiveSummary { entries: archive.len(), ..Default::default() };
        for name in archive.file_names() {
            let (root, rest) = name.split_once('/').unwrap_or(("", name));
            if summary.root.is_none() && !root.is_empty() {
                summary.root = Some(root.to_string());
            }
            if rest == DATA_PICKLE {
                summary.has_data_pickle = true;
            } else if rest == "version" || rest == ".data/version" {
                summary.has_version = true;
            } else if rest.starts_with("data/") {
                summary.storage_records += 1;
            }
        }
        Ok(summary)
    }
}

impl FormatLoader for PyTorchLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::PyTorch
    }

    fn can_load(&self, path: &Path) -> bool {
        is_file(&self.ctx, path) && matches!(self.container(path), Ok(Some(_)))
    }

    fn validate(&self, path: &Path) -> ValidationResult {
        let mut result = ValidationResult::new(ModelFormat::PyTorch);
        let size = match file_size(&self.ctx, path) {
            Ok(size) => size,
            Err(e) => {
                result.error(e.to_string());
                return result.finish();
            }
        };
        let container = match self.container(path) {
            Ok(Some(container)) => container,
            Ok(None) => {
                result.error(format!(
                    "checkpoint is neither a zip archive nor a pickle stream (protocol {}-{})",
                    PICKLE_PROTOCOLS.start(),
                    PICKLE_PROTOCOLS.end()
                ));
                return result.finish();
            }
            Err(e) => {
                result.error(e.to_string());
                return result.finish();
            }
        };

        result.meta("container", container.as_str());
        match container {
            Container::Zip => match self.read_archive(path) {
                Ok(summary) => {
                    if !summary.has_data_pickle {
                        result.error("zip checkpoint has no data.pkl record");
                    }
                    if !summary.has_version {
                        result.warn("zip checkpoint has no version record");
                    }
                    result.meta("archive_entries", summary.entries);
                    result.meta("storage_records", summary.storage_records);
                    if let Some(root) = summary.root {
                        result.meta("archive_root", root);
                    }
                }
                Err(e) => result.error(e),
            },
            Container::Pickle(protocol) => {
                result.meta("pickle_protocol", protocol);
                result.warn("legacy pickle checkpoint; contents are not inspected");
            }
        }
        result.estimated_memory_bytes = estimate(size);
        result.finish()
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<RuntimeHandle, LoadFailure> {
        let container = self
            .container(path)?
            .ok_or_else(|| LoadFailure::CorruptHeader("no zip or pickle signature".into()))?;
        if container == Container::Zip {
            let summary = self.read_archive(path).map_err(LoadFailure::CorruptHeader)?;
            if !summary.has_data_pickle {
                return Err(LoadFailure::CorruptHeader("zip checkpoint has no data.pkl record".into()));
            }
        }

        let files: Vec<PathBuf> = vec![path.to_path_buf()];
        let mut metadata = BTreeMap::new();
        metadata.insert("container".to_string(), container.as_str().to_string());
        let inner = self.ctx.backend.materialize(&MaterializeRequest {
            format: ModelFormat::PyTorch,
            path,
            files: &files,
            metadata: &metadata,
            provider: None,
            config,
        })?;
        Ok(RuntimeHandle::new(ModelFormat::PyTorch, None, inner))
    }

    fn estimate_memory(&self, path: &Path) -> Result<u64, LoadFailure> {
        Ok(estimate(file_size(&self.ctx, path)?))
    }

    fn ownership(&self) -> &Ownership {
        &self.owned
    }
}

/// Deserialized checkpoints carry object overhead on top of raw storage: ~1.2x.
fn estimate(size: u64) -> u64 {
    size.saturating_add(size / 5)
}
