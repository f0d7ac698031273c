//! Byte-range access to model artifacts.
//!
//! Every format probe and validator reads through [`ByteSource`] so that
//! detection and validation only ever touch bounded prefixes and headers.
//! The default [`FsSource`] reads straight from the local filesystem.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Result of a `stat` call on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStat {
    pub is_dir: bool,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size_bytes: u64,
}

/// Read capability consumed by the sniffer and the per-format loaders.
pub trait ByteSource: Send + Sync {
    /// Read up to `length` bytes starting at `offset`. Returns fewer bytes at EOF.
    fn read_at(&self, path: &Path, offset: u64, length: usize) -> io::Result<Vec<u8>>;

    /// List the immediate children of a directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn stat(&self, path: &Path) -> io::Result<SourceStat>;

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Read exactly `length` bytes or fail with `UnexpectedEof`.
    fn read_exact_at(&self, path: &Path, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let bytes = self.read_at(path, offset, length)?;
        if bytes.len() < length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("wanted {} bytes at offset {}, got {}", length, offset, bytes.len()),
            ));
        }
        Ok(bytes)
    }
}

/// Local filesystem implementation of [`ByteSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

impl FsSource {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> Arc<dyn ByteSource> {
        Arc::new(Self)
    }
}

impl ByteSource for FsSource {
    fn read_at(&self, path: &Path, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(length.min(1 << 20));
        file.take(length as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                is_dir: meta.is_dir(),
                size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> io::Result<SourceStat> {
        let meta = std::fs::metadata(path)?;
        Ok(SourceStat {
            is_dir: meta.is_dir(),
            size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok(),
        })
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        path.canonicalize()
    }
}

/// In-memory [`ByteSource`]: files keyed by path, directories implied by
/// their contents. Used to probe buffers without touching disk.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), bytes.into());
        self
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files.keys().any(|f| f != path && f.starts_with(path))
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{} not in memory source", path.display()))
    }
}

impl ByteSource for MemorySource {
    fn read_at(&self, path: &Path, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let bytes = self.files.get(path).ok_or_else(|| Self::not_found(path))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(length).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        if !self.is_dir(path) {
            return Err(Self::not_found(path));
        }
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (file, bytes) in self.files.range(path.to_path_buf()..) {
            let Ok(rest) = file.strip_prefix(path) else {
                break;
            };
            let mut parts = rest.components();
            let Some(first) = parts.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = parts.next().is_some();
            entries.entry(name.clone()).or_insert_with(|| DirEntry {
                path: path.join(&name),
                name,
                is_dir,
                size_bytes: if is_dir { 0 } else { bytes.len() as u64 },
            });
        }
        Ok(entries.into_values().collect())
    }

    fn stat(&self, path: &Path) -> io::Result<SourceStat> {
        if let Some(bytes) = self.files.get(path) {
            return Ok(SourceStat { is_dir: false, size_bytes: bytes.len() as u64, modified: None });
        }
        if self.is_dir(path) {
            return Ok(SourceStat { is_dir: true, size_bytes: 0, modified: None });
        }
        Err(Self::not_found(path))
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.stat(path).map(|_| path.to_path_buf())
    }
}

/// `Read + Seek` adapter over a [`ByteSource`] path.
///
/// Lets container readers (zip central directory) work through the same
/// bounded collaborator instead of opening files themselves.
pub struct SourceReader<'a> {
    source: &'a dyn ByteSource,
    path: PathBuf,
    len: u64,
    pos: u64,
}

impl<'a> SourceReader<'a> {
    pub fn open(source: &'a dyn ByteSource, path: &Path) -> io::Result<Self> {
        let len = source.stat(path)?.size_bytes;
        Ok(Self { source, path: path.to_path_buf(), len, pos: 0 })
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let bytes = self.source.read_at(&self.path, self.pos, buf.len())?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        self.pos += bytes.len() as u64;
        Ok(bytes.len())
    }
}

impl Seek for SourceReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.len.checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        };
        match target {
            Some(t) => {
                self.pos = t;
                Ok(t)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start")),
        }
    }
}

/// Window size for [`WindowedReader`] refills.
const READ_WINDOW: usize = 64 * 1024;

/// Forward cursor over a [`ByteSource`] path holding one window in memory.
///
/// Skips move the cursor without reading, so walking a header never pulls
/// the payload it describes.
pub struct WindowedReader<'a> {
    source: &'a dyn ByteSource,
    path: PathBuf,
    len: u64,
    pos: u64,
    window: Vec<u8>,
    window_start: u64,
    bytes_fetched: u64,
}

impl<'a> WindowedReader<'a> {
    pub fn open(source: &'a dyn ByteSource, path: &Path) -> io::Result<Self> {
        let len = source.stat(path)?.size_bytes;
        Ok(Self::with_len(source, path, len))
    }

    pub fn with_len(source: &'a dyn ByteSource, path: &Path, len: u64) -> Self {
        Self {
            source,
            path: path.to_path_buf(),
            len,
            pos: 0,
            window: Vec::new(),
            window_start: 0,
            bytes_fetched: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    /// Total bytes pulled from the source so far.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        if self.pos >= self.len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of artifact"));
        }
        let in_window = self.pos >= self.window_start
            && self.pos < self.window_start + self.window.len() as u64;
        if !in_window {
            self.window = self.source.read_at(&self.path, self.pos, READ_WINDOW)?;
            self.window_start = self.pos;
            self.bytes_fetched += self.window.len() as u64;
            if self.window.is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "artifact shrank while reading"));
            }
        }
        let b = self.window[(self.pos - self.window_start) as usize];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        for slot in out.iter_mut() {
            *slot = self.read_byte()?;
        }
        Ok(out)
    }

    /// Read `n` bytes; callers bound `n` before asking.
    pub fn read_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if n as u64 > self.remaining() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of artifact"));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_byte()?);
        }
        Ok(out)
    }

    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        match self.pos.checked_add(n) {
            Some(target) if target <= self.len => {
                self.pos = target;
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "skip past end of artifact")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_at_returns_short_read_at_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let bytes = FsSource.read_at(file.path(), 6, 100).unwrap();
        assert_eq!(bytes, b"6789");
    }

    #[test]
    fn read_exact_at_fails_on_short_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GG").unwrap();

        let err = FsSource.read_exact_at(file.path(), 0, 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn source_reader_seeks_and_reads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abcdefgh").unwrap();

        let source = FsSource;
        let mut reader = SourceReader::open(&source, file.path()).unwrap();
        reader.seek(SeekFrom::End(-3)).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "fgh");
    }

    #[test]
    fn windowed_reader_skips_without_fetching() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 300 * 1024]).unwrap();

        let source = FsSource;
        let mut reader = WindowedReader::open(&source, file.path()).unwrap();
        assert_eq!(reader.read_array::<4>().unwrap(), [7, 7, 7, 7]);
        reader.skip(250 * 1024).unwrap();
        assert_eq!(reader.read_byte().unwrap(), 7);
        assert!(reader.bytes_fetched() <= 2 * READ_WINDOW as u64);
        assert!(reader.skip(u64::MAX).is_err());
    }

    #[test]
    fn list_dir_is_sorted_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), [0u8; 3]).unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();

        let entries = FsSource.list_dir(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.json", "b.bin"]);
        assert_eq!(entries[1].size_bytes, 3);
    }

    #[test]
    fn memory_source_lists_implied_directories() {
        let source = MemorySource::new()
            .with_file("/m/config.json", b"{}".to_vec())
            .with_file("/m/shards/a.safetensors", vec![0u8; 5])
            .with_file("/m/w.npz", vec![0u8; 3]);

        let names: Vec<_> = source.list_dir(Path::new("/m")).unwrap().into_iter().map(|e| (e.name, e.is_dir)).collect();
        assert_eq!(
            names,
            vec![("config.json".to_string(), false), ("shards".to_string(), true), ("w.npz".to_string(), false)]
        );
        assert!(source.stat(Path::new("/m")).unwrap().is_dir);
        assert_eq!(source.read_at(Path::new("/m/w.npz"), 2, 10).unwrap().len(), 1);
        assert_eq!(source.stat(Path::new("/x")).unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
