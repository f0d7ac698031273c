//! Model descriptors and live model entries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::RuntimeHandle;
use crate::formats::{ModelArchitecture, ModelFormat};
use crate::loaders::{LoaderInstance, ValidationResult};
use crate::source::SourceStat;

/// One on-disk artifact after validation or load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub format: ModelFormat,
    /// File or bundle directory root.
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub architecture: ModelArchitecture,
    pub estimated_memory_bytes: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Per-format facts, plus `execution_provider` once loaded.
    pub metadata: BTreeMap<String, String>,
}

impl ModelDescriptor {
    /// Descriptor for a path that could not be inspected.
    pub fn missing(path: PathBuf) -> Self {
        Self {
            format: ModelFormat::Unknown,
            path,
            exists: false,
            size_bytes: 0,
            modified_at: None,
            architecture: ModelArchitecture::Unknown,
            estimated_memory_bytes: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn from_validation(path: PathBuf, stat: &SourceStat, result: &ValidationResult) -> Self {
        Self {
            format: result.format,
            path,
            exists: true,
            size_bytes: if stat.is_dir { result.estimated_memory_bytes } else { stat.size_bytes },
            modified_at: stat.modified.map(DateTime::<Utc>::from),
            architecture: result.architecture,
            estimated_memory_bytes: result.estimated_memory_bytes,
            errors: result.errors.clone(),
            warnings: result.warnings.clone(),
            metadata: result.metadata.clone(),
        }
    }

    /// Known format and no structural errors.
    pub fn is_valid(&self) -> bool {
        self.format.is_known() && self.errors.is_empty()
    }
}

/// A registered, live model. Exclusively owns its runtime handle; dropping
/// the entry releases the resource.
pub struct LoadedModel {
    pub id: String,
    pub descriptor: ModelDescriptor,
    pub handle: RuntimeHandle,
    /// Loader that owns this id's bookkeeping.
    pub loader: LoaderInstance,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.id)
            .field("format", &self.descriptor.format)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
