//! Model descriptors and the registry of loaded models.

mod descriptor;
mod registry;

pub use descriptor::{LoadedModel, ModelDescriptor};
pub use registry::{ModelRegistry, Reservation};
