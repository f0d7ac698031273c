//! Load and validation events.
//!
//! The factory reports every detection, validation, load and unload to a
//! [`LoadEventSink`]. The default [`TracingSink`] turns them into structured
//! log lines and `metrics` facade counters.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::ExecutionProvider;
use crate::formats::ModelFormat;

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    Detected {
        path: PathBuf,
        format: ModelFormat,
    },
    Validated {
        path: PathBuf,
        format: ModelFormat,
        valid: bool,
        error_count: usize,
        warning_count: usize,
    },
    Loaded {
        id: String,
        format: ModelFormat,
        provider: Option<ExecutionProvider>,
        elapsed: Duration,
        estimated_memory_bytes: u64,
    },
    LoadFailed {
        path: PathBuf,
        format: ModelFormat,
        reason: String,
    },
    Unloaded {
        id: String,
        format: ModelFormat,
    },
    Cleared {
        models: usize,
    },
}

/// Receiver for lifecycle events. Must not block.
pub trait LoadEventSink: Send + Sync {
    fn record(&self, event: &LoaderEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LoadEventSink for NullSink {
    fn record(&self, _event: &LoaderEvent) {}
}

/// Logs events through `tracing` and records `metrics` counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LoadEventSink for TracingSink {
    fn record(&self, event: &LoaderEvent) {
        match event {
            LoaderEvent::Detected { path, format } => {
                tracing::debug!(path = %path.display(), format = %format, "format detected");
                metrics::counter!("model_factory_detections_total", "format" => format.as_str()).increment(1);
            }
            LoaderEvent::Validated { path, format, valid, error_count, warning_count } => {
                if *valid {
                    tracing::info!(path = %path.display(), format = %format, warnings = warning_count, "model validated");
                } else {
                    tracing::warn!(path = %path.display(), format = %format, errors = error_count, "model failed validation");
                }
                metrics::counter!(
                    "model_factory_validations_total",
                    "format" => format.as_str(),
                    "valid" => if *valid { "true" } else { "false" }
                )
                .increment(1);
            }
            LoaderEvent::Loaded { id, format, provider, elapsed, estimated_memory_bytes } => {
                tracing::info!(
                    id = %id,
                    format = %format,
                    provider = provider.map(|p| p.name()).unwrap_or("none"),
                    elapsed_ms = elapsed.as_millis() as u64,
                    estimated_memory_bytes,
                    "model loaded"
                );
                metrics::counter!("model_factory_loads_total", "format" => format.as_str()).increment(1);
                metrics::histogram!("model_factory_load_seconds", "format" => format.as_str())
                    .record(elapsed.as_secs_f64());
                metrics::gauge!("model_factory_loaded_models").increment(1.0);
            }
            LoaderEvent::LoadFailed { path, format, reason } => {
                tracing::error!(path = %path.display(), format = %format, reason = %reason, "model load failed");
                metrics::counter!("model_factory_load_failures_total", "format" => format.as_str()).increment(1);
            }
            LoaderEvent::Unloaded { id, format } => {
                tracing::info!(id = %id, format = %format, "model unloaded");
                metrics::gauge!("model_factory_loaded_models").decrement(1.0);
            }
            LoaderEvent::Cleared { models } => {
                tracing::info!(models, "registry cleared");
                metrics::gauge!("model_factory_loaded_models").set(0.0);
            }
        }
    }
}
