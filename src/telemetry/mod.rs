//! Telemetry: structured logging setup and lifecycle events.

mod events;
mod logging;

pub use events::{LoadEventSink, LoaderEvent, NullSink, TracingSink};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
