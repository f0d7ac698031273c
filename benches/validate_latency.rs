//! Validation latency benchmarks.
//!
//! Validation cost should track header size, not artifact size: each group
//! validates the same header over increasingly large (sparse) payloads.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use model_factory::{FactoryConfig, ModelFactory, ModelFormat};

const PAYLOAD_SIZES: [(&str, u64); 3] = [("1_MiB", 1 << 20), ("64_MiB", 64 << 20), ("1_GiB", 1 << 30)];

fn gguf_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_gguf(path: &Path, total: u64) {
    let mut buf = b"GGUF".to_vec();
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&1u64.to_le_bytes());
    buf.extend_from_slice(&1u64.to_le_bytes());
    gguf_string("general.architecture", &mut buf);
    buf.extend_from_slice(&8u32.to_le_bytes());
    gguf_string("llama", &mut buf);
    gguf_string("token_embd.weight", &mut buf);
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&16u64.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    std::fs::write(path, &buf).unwrap();
    OpenOptions::new().write(true).open(path).unwrap().set_len(total).unwrap();
}

fn write_safetensors(path: &Path, data_len: u64) {
    let header = format!(r#"{{"w":{{"dtype":"U8","shape":[{}],"data_offsets":[0,{}]}}}}"#, data_len, data_len);
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    std::fs::write(path, &bytes).unwrap();
    OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_len(bytes.len() as u64 + data_len)
        .unwrap();
}

fn fixtures(dir: &Path, ext: &str, write: fn(&Path, u64)) -> Vec<(&'static str, PathBuf)> {
    PAYLOAD_SIZES
        .iter()
        .map(|(name, size)| {
            let path = dir.join(format!("{}.{}", name, ext));
            write(&path, *size);
            (*name, path)
        })
        .collect()
}

fn bench_validate(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = ModelFactory::new(FactoryConfig::default());

    for (group_name, ext, write, format) in [
        ("gguf_validate", "gguf", write_gguf as fn(&Path, u64), ModelFormat::Gguf),
        ("safetensors_validate", "safetensors", write_safetensors, ModelFormat::SafeTensors),
    ] {
        let mut group = c.benchmark_group(group_name);
        for (name, path) in fixtures(dir.path(), ext, write) {
            group.bench_with_input(BenchmarkId::new("sniffed", name), &path, |b, p| {
                b.iter(|| black_box(factory.validate_model(p, None)))
            });
            group.bench_with_input(BenchmarkId::new("hinted", name), &path, |b, p| {
                b.iter(|| black_box(factory.validate_model(p, Some(format))))
            });
        }
        group.finish();
    }
}

fn bench_detect(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = ModelFactory::new(FactoryConfig::default());
    let path = dir.path().join("model.dat");
    write_gguf(&path, 1 << 20);

    c.bench_function("detect_format", |b| b.iter(|| black_box(factory.detect_format(&path))));
}

criterion_group!(benches, bench_validate, bench_detect);
criterion_main!(benches);
