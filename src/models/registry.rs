//! Loader cache and registry of loaded models.
//!
//! Loader instances are created lazily, one per format, and shared. Loaded
//! models are tracked by id under a single lock; a load in progress holds a
//! reservation on its id so that a concurrent load of the same id blocks
//! until the first settles and then sees `DuplicateId`.

use std::collections::{BTreeMap, HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::descriptor::{LoadedModel, ModelDescriptor};
use crate::error::FactoryError;
use crate::formats::ModelFormat;
use crate::loaders::{create_loader, LoaderContext, LoaderInstance};

#[derive(Default)]
struct RegistryState {
    models: HashMap<String, LoadedModel>,
    in_flight: HashSet<String>,
}

/// Thread-safe registry of loader instances and loaded models.
pub struct ModelRegistry {
    ctx: LoaderContext,
    loaders: DashMap<ModelFormat, LoaderInstance>,
    state: Mutex<RegistryState>,
    settled: Condvar,
}

impl ModelRegistry {
    pub fn new(ctx: LoaderContext) -> Self {
        Self {
            ctx,
            loaders: DashMap::new(),
            state: Mutex::new(RegistryState::default()),
            settled: Condvar::new(),
        }
    }

    /// Shared loader for `format`, created on first use. `None` for `Unknown`.
    pub fn get_or_create_loader(&self, format: ModelFormat) -> Option<LoaderInstance> {
        if let Some(loader) = self.loaders.get(&format) {
            return Some(loader.value().clone());
        }
        let loader = create_loader(format, self.ctx.clone())?;
        let entry = self.loaders.entry(format).or_insert(loader);
        Some(entry.value().clone())
    }

    /// Number of loader instances created so far.
    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    /// Claim `id` for a load in progress.
    ///
    /// Blocks while another caller holds a reservation on the same id, then
    /// fails with `DuplicateId` if that caller registered it.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_>, FactoryError> {
        let mut state = self.state.lock();
        loop {
            if state.models.contains_key(id) {
                return Err(FactoryError::DuplicateId(id.to_string()));
            }
            if !state.in_flight.contains(id) {
                break;
            }
            self.settled.wait(&mut state);
        }
        state.in_flight.insert(id.to_string());
        Ok(Reservation { registry: self, id: id.to_string(), settled: false })
    }

    /// Register a fully loaded model.
    pub fn register(&self, id: &str, model: LoadedModel) -> Result<(), FactoryError> {
        self.reserve(id)?.commit(model);
        Ok(())
    }

    /// Remove `id`, release its runtime handle and the owning loader's bookkeeping.
    pub fn unregister(&self, id: &str) -> Result<ModelDescriptor, FactoryError> {
        let model = self
            .state
            .lock()
            .models
            .remove(id)
            .ok_or_else(|| FactoryError::Unload(id.to_string()))?;
        Ok(release(model))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().models.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.state.lock().models.get(id).map(|m| m.descriptor.clone())
    }

    /// Backend handle id of a loaded model.
    pub fn handle_id(&self, id: &str) -> Option<u64> {
        self.state.lock().models.get(id).map(|m| m.handle.id())
    }

    /// Snapshot of every loaded model, keyed by id.
    pub fn list(&self) -> BTreeMap<String, ModelDescriptor> {
        self.state
            .lock()
            .models
            .iter()
            .map(|(id, m)| (id.clone(), m.descriptor.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unload every registered model. Returns how many were released.
    pub fn clear(&self) -> usize {
        let drained: Vec<LoadedModel> = {
            let mut state = self.state.lock();
            state.models.drain().map(|(_, m)| m).collect()
        };
        let count = drained.len();
        drained.into_iter().for_each(|m| {
            release(m);
        });
        count
    }

    /// Drop cached loader instances. Loaded models keep their own loader reference.
    pub fn clear_loaders(&self) {
        self.loaders.clear();
    }
}

fn release(model: LoadedModel) -> ModelDescriptor {
    model.loader.unload(&model.id);
    tracing::debug!(id = %model.id, handle = model.handle.id(), "runtime handle released");
    model.descriptor
}

/// In-flight claim on a model id. Dropping it without committing releases
/// the id and wakes waiters.
pub struct Reservation<'a> {
    registry: &'a ModelRegistry,
    id: String,
    settled: bool,
}

impl Reservation<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the model under the reserved id.
    pub fn commit(mut self, model: LoadedModel) {
        let mut state = self.registry.state.lock();
        state.in_flight.remove(&self.id);
        state.models.insert(self.id.clone(), model);
        self.settled = true;
        drop(state);
        self.registry.settled.notify_all();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.registry.state.lock().in_flight.remove(&self.id);
        self.registry.settled.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MmapBackend, RuntimeHandle};
    use crate::loaders::HeaderLimits;
    use crate::source::FsSource;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(LoaderContext {
            source: FsSource::shared(),
            backend: Arc::new(MmapBackend::new()),
            limits: HeaderLimits::default(),
        })
    }

    fn model(registry: &ModelRegistry, id: &str) -> LoadedModel {
        let loader = registry.get_or_create_loader(ModelFormat::Gguf).unwrap();
        loader.ownership().claim(id);
        LoadedModel {
            id: id.to_string(),
            descriptor: ModelDescriptor::missing(PathBuf::from("m.gguf")),
            handle: RuntimeHandle::new(ModelFormat::Gguf, None, Box::new(())),
            loader,
        }
    }

    #[test]
    fn loaders_are_created_once() {
        let registry = registry();
        let a = registry.get_or_create_loader(ModelFormat::Onnx).unwrap();
        let b = registry.get_or_create_loader(ModelFormat::Onnx).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get_or_create_loader(ModelFormat::Unknown).is_none());
        assert_eq!(registry.loader_count(), 1);
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let registry = registry();
        registry.register("m", model(&registry, "m")).unwrap();
        let err = registry.register("m", model(&registry, "m")).unwrap_err();
        assert!(matches!(err, FactoryError::DuplicateId(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_releases_loader_ownership() {
        let registry = registry();
        registry.register("m", model(&registry, "m")).unwrap();
        let loader = registry.get_or_create_loader(ModelFormat::Gguf).unwrap();
        assert!(loader.ownership().owns("m"));

        registry.unregister("m").unwrap();
        assert!(!loader.ownership().owns("m"));
        assert!(matches!(registry.unregister("m"), Err(FactoryError::Unload(_))));
    }

    #[test]
    fn dropped_reservation_frees_the_id() {
        let registry = registry();
        drop(registry.reserve("m").unwrap());
        assert!(registry.reserve("m").is_ok());
    }

    #[test]
    fn waiter_sees_duplicate_after_commit() {
        let registry = Arc::new(registry());
        let reservation = registry.reserve("m").unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.reserve("m").map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        reservation.commit(model(&registry, "m"));

        assert!(matches!(waiter.join().unwrap(), Err(FactoryError::DuplicateId(_))));
    }

    #[test]
    fn clear_unloads_everything() {
        let registry = registry();
        registry.register("a", model(&registry, "a")).unwrap();
        registry.register("b", model(&registry, "b")).unwrap();
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        let loader = registry.get_or_create_loader(ModelFormat::Gguf).unwrap();
        assert_eq!(loader.ownership().count(), 0);
    }
}
