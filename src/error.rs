//! Error types for the loader factory.
//!
//! Detection and validation failures are caller-visible conditions and are
//! never retried. Only provider initialisation failures fall through to the
//! next execution provider before surfacing as [`LoadFailure`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::ExecutionProvider;
use crate::formats::ModelFormat;

/// Errors returned by [`crate::ModelFactory`] operations.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Model path not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not determine model format of {path}: {}", .errors.join("; "))]
    FormatDetection { path: PathBuf, errors: Vec<String> },

    #[error("Validation failed for {format} model {path}: {reason}")]
    Validation {
        path: PathBuf,
        format: ModelFormat,
        reason: String,
        errors: Vec<String>,
    },

    #[error("Model id already loaded: {0}")]
    DuplicateId(String),

    #[error("Failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: LoadFailure },

    #[error("Model id not loaded: {0}")]
    Unload(String),
}

impl FactoryError {
    /// Returns true if this error should be logged as a warning rather than a failure.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Unload(_))
    }

    /// Structural complaints carried by detection/validation errors.
    pub fn errors(&self) -> Vec<String> {
        match self {
            Self::FormatDetection { errors, .. } | Self::Validation { errors, .. } => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Specific reason a runtime materialisation failed.
#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("missing shard: {0}")]
    MissingShard(PathBuf),

    #[error("no execution provider could be initialised (tried {}): {last_error}", format_providers(.attempted))]
    ProviderInitFailed {
        attempted: Vec<ExecutionProvider>,
        last_error: String,
    },

    #[error("out of memory: model needs {required} bytes, limit is {limit} bytes")]
    OutOfMemory { required: u64, limit: u64 },

    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("format hint {hinted} does not match content, which is {detected}")]
    FormatMismatch { hinted: ModelFormat, detected: ModelFormat },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LoadFailure {
    /// Map an IO error on `path` to the most specific sub-reason.
    pub fn from_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::NotFound => Self::MissingShard(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}

/// Errors raised by an [`crate::backend::ExecutionBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{provider} provider failed to initialise: {reason}")]
    ProviderInit { provider: ExecutionProvider, reason: String },

    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),

    #[error("out of memory: {required} bytes requested")]
    OutOfMemory { required: u64 },

    #[error("corrupt model data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<BackendError> for LoadFailure {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ProviderInit { provider, reason } => LoadFailure::ProviderInitFailed {
                attempted: vec![provider],
                last_error: reason,
            },
            BackendError::UnsupportedOp(op) => LoadFailure::UnsupportedOp(op),
            BackendError::OutOfMemory { required } => LoadFailure::OutOfMemory { required, limit: 0 },
            BackendError::Corrupt(msg) => LoadFailure::CorruptHeader(msg),
            BackendError::Io(e) => LoadFailure::Io(e),
        }
    }
}

fn format_providers(providers: &[ExecutionProvider]) -> String {
    providers.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unload_is_only_a_warning() {
        assert!(FactoryError::Unload("x".into()).is_warning());
        assert!(!FactoryError::DuplicateId("x".into()).is_warning());
    }

    #[test]
    fn provider_failure_lists_attempts() {
        let err = LoadFailure::ProviderInitFailed {
            attempted: vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu],
            last_error: "no device".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("CUDA -> CPU"), "{}", msg);
    }

    #[test]
    fn permission_denied_io_maps_to_sub_reason() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let failure = LoadFailure::from_io(std::path::Path::new("/m.gguf"), err);
        assert!(matches!(failure, LoadFailure::PermissionDenied(_)));
    }
}
