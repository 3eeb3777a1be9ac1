//! Filesystem capability consumed by discovery and file formats.
//!
//! Paths are `/`-separated strings. Implementations decide what a path means
//! (an OS path for [`LocalFileSystem`], a key for [`MemoryFileSystem`]).

use std::{
    collections::BTreeMap,
    fmt::Debug,
    fs::File,
    io,
    ops::Range,
    path::Path,
    sync::{Arc, RwLock},
};

use bytes::Bytes;

use crate::{QuarryError, Result};

/// One entry returned by [`FileSystem::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    /// Size in bytes; zero for directories
    pub size: u64,
}

/// Listing and opening files.
pub trait FileSystem: Send + Sync + Debug {
    /// Immediate children of the directory at `path`.
    ///
    /// Returns [`QuarryError::NotFound`] if `path` does not exist.
    fn list(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Open a file for positional reads.
    fn open(&self, path: &str) -> Result<Arc<dyn RandomAccessFile>>;
}

/// A byte-range readable handle. Dropping it releases the underlying handle.
pub trait RandomAccessFile: Send + Sync + Debug {
    fn size(&self) -> u64;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

fn out_of_bounds(path: &str, offset: u64, len: usize, size: u64) -> QuarryError {
    QuarryError::io(
        path,
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read of {len} bytes at {offset} exceeds file size {size}"),
        ),
    )
}

/// The local disk, through `std::fs`.
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFileSystem {
    fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let entries = std::fs::read_dir(path).map_err(|e| QuarryError::io(path, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QuarryError::io(path, e))?;
            let child = Path::new(path).join(entry.file_name());
            let child = child.to_string_lossy().into_owned();
            let metadata = entry.metadata().map_err(|e| QuarryError::io(&child, e))?;
            out.push(FileInfo {
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                path: child,
            });
        }
        Ok(out)
    }

    fn open(&self, path: &str) -> Result<Arc<dyn RandomAccessFile>> {
        let file = File::open(path).map_err(|e| QuarryError::io(path, e))?;
        let size = file.metadata().map_err(|e| QuarryError::io(path, e))?.len();
        Ok(Arc::new(LocalFile {
            path: path.to_string(),
            file,
            size,
        }))
    }
}

/// Open file read with positional reads, so concurrent tasks never contend
/// on a shared cursor.
#[derive(Debug)]
struct LocalFile {
    path: String,
    file: File,
    size: u64,
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

impl RandomAccessFile for LocalFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(out_of_bounds(&self.path, offset, len, self.size));
        }
        let mut buf = vec![0; len];
        read_exact_at(&self.file, &mut buf, offset)
            .map_err(|e| QuarryError::io(&self.path, e))?;
        Ok(Bytes::from(buf))
    }
}

/// Thread-safe in-memory tree of files; directories exist implicitly.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileSystem {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the file at `path`.
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(normalize(path).to_string(), data.into());
        }
    }

    /// Delete the file at `path`, returning whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.files
            .write()
            .map(|mut files| files.remove(normalize(path)).is_some())
            .unwrap_or(false)
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Bytes>>> {
        self.files
            .read()
            .map_err(|_| QuarryError::io("", io::Error::other("memory filesystem lock poisoned")))
    }
}

impl FileSystem for MemoryFileSystem {
    fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = normalize(path);
        let files = self.read_lock()?;
        if files.contains_key(dir) {
            return Err(QuarryError::io(
                dir,
                io::Error::other("not a directory"),
            ));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut out: Vec<FileInfo> = Vec::new();
        for (key, data) in files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => out.push(FileInfo {
                    path: key.clone(),
                    is_dir: false,
                    size: data.len() as u64,
                }),
                Some((child, _)) => {
                    let child = format!("{prefix}{child}");
                    if out.last().is_none_or(|last| last.path != child) {
                        out.push(FileInfo {
                            path: child,
                            is_dir: true,
                            size: 0,
                        });
                    }
                }
            }
        }
        if out.is_empty() && !dir.is_empty() {
            return Err(QuarryError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(out)
    }

    fn open(&self, path: &str) -> Result<Arc<dyn RandomAccessFile>> {
        let files = self.read_lock()?;
        let data = files
            .get(normalize(path))
            .cloned()
            .ok_or_else(|| QuarryError::NotFound {
                path: path.to_string(),
            })?;
        Ok(Arc::new(MemoryFile {
            path: path.to_string(),
            data,
        }))
    }
}

#[derive(Debug)]
struct MemoryFile {
    path: String,
    data: Bytes,
}

impl RandomAccessFile for MemoryFile {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let size = self.size();
        if offset.saturating_add(len as u64) > size {
            return Err(out_of_bounds(&self.path, offset, len, size));
        }
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }
}

/// Location of one fragment's bytes: a path on a filesystem, optionally
/// restricted to a byte range.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: String,
    filesystem: Arc<dyn FileSystem>,
    range: Option<Range<u64>>,
}

impl FileSource {
    pub fn new(path: impl Into<String>, filesystem: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            filesystem,
            range: None,
        }
    }

    /// Restrict the source to `range` of the file.
    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.filesystem
    }

    pub fn range(&self) -> Option<&Range<u64>> {
        self.range.as_ref()
    }

    /// Open the source; offsets of the returned handle are relative to the
    /// start of the range.
    pub fn open(&self) -> Result<Arc<dyn RandomAccessFile>> {
        let file = self.filesystem.open(&self.path)?;
        match &self.range {
            None => Ok(file),
            Some(range) => {
                let size = file.size();
                if range.start > range.end || range.end > size {
                    return Err(QuarryError::InvalidOption {
                        reason: format!(
                            "byte range {range:?} is outside '{}' ({size} bytes)",
                            self.path
                        ),
                    });
                }
                Ok(Arc::new(RangeFile {
                    inner: file,
                    range: range.clone(),
                }))
            }
        }
    }
}

#[derive(Debug)]
struct RangeFile {
    inner: Arc<dyn RandomAccessFile>,
    range: Range<u64>,
}

impl RandomAccessFile for RangeFile {
    fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let size = self.size();
        if offset.saturating_add(len as u64) > size {
            return Err(QuarryError::io(
                "",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {len} bytes at {offset} exceeds range of {size} bytes"),
                ),
            ));
        }
        self.inner.read_at(self.range.start + offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.insert("root/year=2020/a.dat", &b"hello"[..]);
        fs.insert("root/year=2021/b.dat", &b"world!"[..]);
        fs.insert("root/top.dat", &b""[..]);
        fs
    }

    #[test]
    fn memory_listing_is_immediate_children() {
        let fs = tree();
        let entries = fs.list("root").unwrap();
        let paths: Vec<_> = entries.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(
            paths,
            vec![
                ("root/top.dat", false),
                ("root/year=2020", true),
                ("root/year=2021", true),
            ]
        );
        assert_eq!(fs.list("/root/year=2021/").unwrap()[0].size, 6);
        assert!(matches!(
            fs.list("nope").unwrap_err(),
            QuarryError::NotFound { .. }
        ));
        assert!(fs.list("root/top.dat").is_err());
    }

    #[test]
    fn ranged_source_reads_relative_offsets() {
        let fs: Arc<dyn FileSystem> = Arc::new(tree());
        let source = FileSource::new("root/year=2021/b.dat", fs).with_range(1..5);
        let file = source.open().unwrap();
        assert_eq!(file.size(), 4);
        assert_eq!(&file.read_at(0, 4).unwrap()[..], b"orld");
        assert!(file.read_at(2, 3).is_err());
    }

    #[test]
    fn local_filesystem_lists_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("x.bin"), b"0123456789").unwrap();
        let fs = LocalFileSystem::new();
        let root = dir.path().to_string_lossy().into_owned();

        let entries = fs.list(&root).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);

        let file = fs.open(&format!("{}/x.bin", entries[0].path)).unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(&file.read_at(3, 4).unwrap()[..], b"3456");

        assert!(matches!(
            fs.list(&format!("{root}/missing")).unwrap_err(),
            QuarryError::NotFound { .. }
        ));
    }

    #[test]
    fn local_reads_from_many_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255).cycle().take(64 * 1024).collect();
        std::fs::write(&path, &data).unwrap();
        let file = LocalFileSystem::new().open(&path.to_string_lossy()).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let (file, data) = (&file, &data);
                scope.spawn(move || {
                    for i in 0..64 {
                        let offset = (worker * 7919 + i * 1031) % (data.len() as u64 - 512);
                        let bytes = file.read_at(offset, 512).unwrap();
                        assert_eq!(&bytes[..], &data[offset as usize..offset as usize + 512]);
                    }
                });
            }
        });
        assert!(file.read_at(data.len() as u64 - 4, 8).is_err());
    }
}
