//! Load, duplicate detection, unload and reload through the factory.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use model_factory::telemetry::{LoadEventSink, LoaderEvent};
use model_factory::{
    derive_model_id, ExecutionProvider, FactoryConfig, FactoryError, LoadConfig, LoadFailure, LoadOptions,
    MmapBackend, ModelArchitecture, ModelFactory, ModelFormat, FsSource, EXECUTION_PROVIDER_KEY,
};
use parking_lot::Mutex;

fn factory() -> Arc<ModelFactory> {
    Arc::new(ModelFactory::new(FactoryConfig::default()))
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<LoaderEvent>>,
}

impl LoadEventSink for Recorder {
    fn record(&self, event: &LoaderEvent) {
        self.events.lock().push(event.clone());
    }
}

#[test]
fn second_load_of_same_path_is_a_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.gguf");
    common::write_gguf(&path, "llama", 2);
    let f = factory();

    let descriptor = f.load_model(&path, LoadOptions::default()).unwrap();
    assert_eq!(descriptor.format, ModelFormat::Gguf);
    assert!(!descriptor.metadata.contains_key(EXECUTION_PROVIDER_KEY));

    let err = f.load_model(&path, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, FactoryError::DuplicateId(_)));
    assert_eq!(f.get_loaded_models().len(), 1);

    let canonical = path.canonicalize().unwrap();
    let id = derive_model_id(ModelFormat::Gguf, &canonical);
    assert!(f.get_loaded_models().contains_key(&id));
}

#[test]
fn reload_after_unload_gets_a_fresh_handle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    common::write_safetensors(&path, 128);
    let f = factory();

    f.load_model(&path, LoadOptions::default().with_id("st")).unwrap();
    let first = f.registry().handle_id("st").unwrap();
    f.unload_model("st").unwrap();
    assert!(f.get_loaded_models().is_empty());

    f.load_model(&path, LoadOptions::default().with_id("st")).unwrap();
    let second = f.registry().handle_id("st").unwrap();
    assert_ne!(first, second);

    let err = f.unload_model("never-loaded").unwrap_err();
    assert!(err.is_warning());
}

#[test]
fn concurrent_loads_of_one_path_register_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.gguf");
    common::write_gguf(&path, "qwen2", 1);
    let f = factory();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let f = Arc::clone(&f);
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f.load_model(&path, LoadOptions::default())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, FactoryError::DuplicateId(_))));
    assert_eq!(f.get_loaded_models().len(), 1);
}

#[test]
fn mlx_hint_load_sums_shard_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("mistral-4bit");
    let total = common::write_mlx_bundle(&bundle, &[256, 512]);
    let f = factory();

    let descriptor = f.load_model(&bundle, LoadOptions::with_format(ModelFormat::Mlx)).unwrap();
    assert_eq!(descriptor.format, ModelFormat::Mlx);
    assert_eq!(descriptor.estimated_memory_bytes, total);
    assert_eq!(descriptor.architecture, ModelArchitecture::Transformer);
}

#[test]
fn onnx_load_records_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detector.onnx");
    std::fs::write(&path, common::onnx_bytes(&["Conv", "MaxPool"])).unwrap();
    let f = factory();

    let descriptor = f.load_model(&path, LoadOptions::default()).unwrap();
    assert_eq!(descriptor.architecture, ModelArchitecture::Cnn);
    assert_eq!(descriptor.metadata[EXECUTION_PROVIDER_KEY], "CPU");
}

#[test]
fn provider_exhaustion_is_terminal_and_leaves_registry_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detector.onnx");
    std::fs::write(&path, common::onnx_bytes(&["Gemm"])).unwrap();
    let f = ModelFactory::with_components(
        FactoryConfig::default(),
        FsSource::shared(),
        Arc::new(MmapBackend::with_providers(Vec::new())),
        Arc::new(Recorder::default()),
    );
    let config = LoadConfig { providers: Some(vec![ExecutionProvider::Cuda]), ..LoadConfig::default() };

    let err = f.load_model(&path, LoadOptions::default().with_config(config)).unwrap_err();
    match err {
        FactoryError::Load { reason: LoadFailure::ProviderInitFailed { attempted, .. }, .. } => {
            assert_eq!(attempted, vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(f.get_loaded_models().is_empty());
}

#[test]
fn wrong_hint_is_a_format_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    common::write_gguf(&path, "llama", 0);
    let recorder = Arc::new(Recorder::default());
    let f = ModelFactory::with_components(
        FactoryConfig::default(),
        FsSource::shared(),
        Arc::new(MmapBackend::new()),
        recorder.clone(),
    );

    let err = f.load_model(&path, LoadOptions::with_format(ModelFormat::SafeTensors)).unwrap_err();
    assert!(matches!(
        err,
        FactoryError::Load {
            reason: LoadFailure::FormatMismatch { hinted: ModelFormat::SafeTensors, detected: ModelFormat::Gguf },
            ..
        }
    ));
    assert!(f.get_loaded_models().is_empty());
    assert!(recorder
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, LoaderEvent::LoadFailed { format: ModelFormat::SafeTensors, .. })));
}

#[test]
fn unresolvable_and_missing_paths_fail_early() {
    let dir = tempfile::tempdir().unwrap();
    let f = factory();

    let err = f.load_model(&dir.path().join("absent.gguf"), LoadOptions::default()).unwrap_err();
    assert!(matches!(err, FactoryError::NotFound(_)));

    let empty = dir.path().join("model.gguf");
    std::fs::write(&empty, b"").unwrap();
    let err = f.load_model(&empty, LoadOptions::default()).unwrap_err();
    match err {
        FactoryError::FormatDetection { errors, .. } => assert!(errors[0].contains("truncated header")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn invalid_artifact_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let header = r#"{"w":{"dtype":"F32","shape":[8],"data_offsets":[0,16]}}"#;
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&[0u8; 16]);
    std::fs::write(&path, bytes).unwrap();

    let err = factory().load_model(&path, LoadOptions::default()).unwrap_err();
    match err {
        FactoryError::Validation { format, reason, .. } => {
            assert_eq!(format, ModelFormat::SafeTensors);
            assert!(reason.contains("needs 32"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn clear_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let gguf = dir.path().join("a.gguf");
    common::write_gguf(&gguf, "llama", 0);
    let pt = dir.path().join("b.pt");
    common::write_torch_zip(&pt);
    let f = factory();

    f.load_model(&gguf, LoadOptions::default()).unwrap();
    f.load_model(&pt, LoadOptions::default()).unwrap();
    assert_eq!(f.get_loaded_models().len(), 2);
    assert_eq!(f.clear_loaders(), 2);
    assert!(f.get_loaded_models().is_empty());
    assert_eq!(f.registry().loader_count(), 0);
}

#[tokio::test]
async fn async_load_registers_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.pth");
    common::write_torch_pickle(&path);
    let f = factory();

    let descriptor = f.load_model_async(path.clone(), LoadOptions::default()).await.unwrap();
    assert_eq!(descriptor.format, ModelFormat::PyTorch);
    assert_eq!(f.estimate_memory(path.to_str().unwrap()).unwrap(), descriptor.estimated_memory_bytes);
    assert_eq!(f.get_loaded_models().len(), 1);
}
