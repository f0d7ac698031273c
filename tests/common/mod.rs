//! Fixture builders shared by the integration tests.
//!
//! Every builder writes the smallest artifact its loader accepts as valid.

#![allow(dead_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use model_factory::source::{ByteSource, DirEntry, FsSource, SourceStat};

fn gguf_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// GGUF v3 header with `general.architecture` and optional F32 tensors of
/// 16 elements each, packed at aligned offsets.
pub fn gguf_bytes(architecture: &str, tensors: usize) -> Vec<u8> {
    let mut buf = b"GGUF".to_vec();
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&(tensors as u64).to_le_bytes());
    buf.extend_from_slice(&2u64.to_le_bytes());
    gguf_string("general.architecture", &mut buf);
    buf.extend_from_slice(&8u32.to_le_bytes());
    gguf_string(architecture, &mut buf);
    gguf_string(&format!("{}.context_length", architecture), &mut buf);
    buf.extend_from_slice(&4u32.to_le_bytes());
    buf.extend_from_slice(&4096u32.to_le_bytes());
    for i in 0..tensors {
        gguf_string(&format!("blk.{}.weight", i), &mut buf);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&16u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(i as u64 * 64).to_le_bytes());
    }
    buf
}

/// Header plus padding up to the data section and one payload per tensor.
pub fn write_gguf(path: &Path, architecture: &str, tensors: usize) {
    let mut buf = gguf_bytes(architecture, tensors);
    if tensors > 0 {
        let aligned = (buf.len() + 31) / 32 * 32;
        buf.resize(aligned + tensors * 64, 0);
    }
    std::fs::write(path, buf).unwrap();
}

/// SafeTensors file holding one U8 tensor of `data_len` bytes.
pub fn write_safetensors(path: &Path, data_len: usize) {
    let header = format!(
        r#"{{"__metadata__":{{"format":"pt"}},"w":{{"dtype":"U8","shape":[{}],"data_offsets":[0,{}]}}}}"#,
        data_len, data_len
    );
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend(std::iter::repeat(7u8).take(data_len));
    std::fs::write(path, bytes).unwrap();
}

/// MLX bundle: `config.json` plus the given SafeTensors shards.
pub fn write_mlx_bundle(dir: &Path, shard_sizes: &[usize]) -> u64 {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("config.json"), br#"{"model_type":"mistral","quantization":{"bits":4}}"#).unwrap();
    let mut total = 0;
    for (i, size) in shard_sizes.iter().enumerate() {
        let shard = dir.join(format!("model-{:05}-of-{:05}.safetensors", i + 1, shard_sizes.len()));
        write_safetensors(&shard, *size);
        total += std::fs::metadata(&shard).unwrap().len();
    }
    total
}

fn varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn len_field(number: u64, payload: &[u8], out: &mut Vec<u8>) {
    varint(number << 3 | 2, out);
    varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// ONNX ModelProto with ir_version 8, opset 17 and one node per op type.
pub fn onnx_bytes(ops: &[&str]) -> Vec<u8> {
    let mut graph = Vec::new();
    for op in ops {
        let mut node = Vec::new();
        len_field(4, op.as_bytes(), &mut node);
        len_field(1, &node, &mut graph);
    }
    len_field(2, b"main", &mut graph);
    let mut buf = vec![0x08, 0x08];
    len_field(2, b"fixture", &mut buf);
    len_field(7, &graph, &mut buf);
    len_field(8, &[0x0a, 0x00, 0x10, 17], &mut buf);
    buf
}

/// CoreML specification: version 4, empty description, neuralNetwork.
pub const COREML_SPEC: &[u8] = &[0x08, 0x04, 0x12, 0x00, 0xa2, 0x1f, 0x00];

pub fn write_mlpackage(dir: &Path) {
    let model_dir = dir.join("Data/com.apple.CoreML");
    std::fs::create_dir_all(model_dir.join("weights")).unwrap();
    std::fs::write(model_dir.join("model.mlmodel"), COREML_SPEC).unwrap();
    std::fs::write(model_dir.join("weights/weight.bin"), [0u8; 128]).unwrap();
    std::fs::write(
        dir.join("Manifest.json"),
        br#"{"fileFormatVersion":"1.0.0","rootModelIdentifier":"M","itemInfoEntries":{"M":{"path":"com.apple.CoreML/model.mlmodel"}}}"#,
    )
    .unwrap();
}

/// Zip checkpoint in the layout `torch.save` produces.
pub fn write_torch_zip(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for name in ["model/data.pkl", "model/version", "model/data/0", "model/data/1"] {
        zip.start_file(name, options).unwrap();
        zip.write_all(b"\x80\x02}q\x00.").unwrap();
    }
    zip.finish().unwrap();
}

/// Legacy (pre-zip) pickle checkpoint.
pub fn write_torch_pickle(path: &Path) {
    std::fs::write(path, [0x80, 0x02, b'}', b'q', 0x00, b'.', 0, 0, 0, 0]).unwrap();
}

/// Filesystem source that counts the bytes it hands out.
#[derive(Debug, Default)]
pub struct CountingSource {
    inner: FsSource,
    bytes_read: AtomicU64,
}

impl CountingSource {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }
}

impl ByteSource for CountingSource {
    fn read_at(&self, path: &Path, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let bytes = self.inner.read_at(path, offset, length)?;
        self.bytes_read.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Ok(bytes)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.inner.list_dir(path)
    }

    fn stat(&self, path: &Path) -> io::Result<SourceStat> {
        self.inner.stat(path)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.canonicalize(path)
    }
}
