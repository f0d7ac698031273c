//! Model Factory
//!
//! Detects, validates and loads machine-learning model artifacts stored in
//! GGUF, SafeTensors, MLX, CoreML, PyTorch and ONNX formats.
//!
//! # Pipeline
//!
//! - **Detect**: bounded content sniffing; magic bytes beat the extension
//! - **Validate**: header-only structural checks, never reads tensor payloads
//! - **Load**: memory guard, execution-provider fallthrough, registration
//!
//! # Boundaries
//!
//! - Filesystem: read-only access to artifacts through [`source::ByteSource`]
//! - Memory: headers are parsed within [`loaders::HeaderLimits`]
//! - Concurrency: one in-flight load per model id, enforced by the registry

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod factory;
pub mod formats;
pub mod loaders;
pub mod models;
pub mod source;
pub mod telemetry;

pub use backend::{ExecutionBackend, ExecutionProvider, MmapBackend, RuntimeHandle};
pub use config::{ConfigError, FactoryConfig};
pub use error::{BackendError, FactoryError, LoadFailure};
pub use factory::{derive_model_id, LoadOptions, ModelFactory, EXECUTION_PROVIDER_KEY};
pub use formats::{ContentSniffer, DetectionBasis, ModelArchitecture, ModelFormat, SniffReport};
pub use loaders::{
    create_loader, DevicePlacement, FormatLoader, HeaderLimits, LoadConfig, LoaderContext, LoaderInstance,
    Precision, ValidationResult,
};
pub use models::{LoadedModel, ModelDescriptor, ModelRegistry};
pub use source::{ByteSource, FsSource, MemorySource, SourceStat};
