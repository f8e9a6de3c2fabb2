//! Content-addressed byte cache.
//!
//! Every blob the system touches — uploads, fetched URIs, pipeline output —
//! lands in one flat directory, named by the lowercase hex MD5 of its
//! bytes. The checksum is the whole identity: ingesting the same bytes
//! twice finds the existing blob, concurrent writers of the same content
//! are harmless (they race to rename identical files), and a record
//! referencing a blob never goes stale because blobs are immutable.
//!
//! # On-disk layout
//!
//! ```text
//! cache_top/
//! ├── 8f57348732b9755b264ef1c15b0e6485        # blob
//! ├── 5eb63bbbe01eeed093cb22bb8f5acdc3        # blob
//! └── 5eb63bbbe01eeed093cb22bb8f5acdc3.jpg    # extension symlink
//! ```
//!
//! Writes are atomic: bytes go to a temp sibling in `cache_top` and are
//! renamed into place, so a crash never leaves a half-written blob under a
//! checksum name. Extension symlinks give tools that sniff by suffix
//! something to chew on; creating one is idempotent and an existing link is
//! left alone whatever it points at.

use crate::error::{Error, Result};
use crate::pipeline::{Cmd, ToolRunner};
use crate::types::{File, FileSource};
use md5::{Digest, Md5};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Lowercase hex MD5 of a byte slice.
pub fn checksum_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

/// Fetches a URI into memory. The cache does not speak HTTP itself; the
/// embedding application supplies whatever client it already has. A plain
/// closure works:
///
/// ```no_run
/// # use darkroom::filecache::UriFetcher;
/// # use darkroom::error::Error;
/// let fetcher = |uri: &str| -> Result<Vec<u8>, Error> {
///     Err(Error::io(format!("no network in this example: {uri}")))
/// };
/// # let _: &dyn UriFetcher = &fetcher;
/// ```
pub trait UriFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

impl<F> UriFetcher for F
where
    F: Fn(&str) -> Result<Vec<u8>> + Send + Sync,
{
    fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        self(uri)
    }
}

/// The blob store. Cheap to clone paths around; all state is on disk.
#[derive(Debug, Clone)]
pub struct FileCache {
    cache_top: PathBuf,
}

impl FileCache {
    /// A cache rooted at `cache_top`. The directory is created lazily on
    /// first ingestion.
    pub fn new(cache_top: impl Into<PathBuf>) -> Self {
        FileCache {
            cache_top: cache_top.into(),
        }
    }

    pub fn cache_top(&self) -> &Path {
        &self.cache_top
    }

    /// Ingest raw bytes.
    ///
    /// `probe` classifies the stored blob (it receives the blob's path so
    /// it can run `file` against it) and `ext_of` turns the classification
    /// into an extension hint for the symlink; an empty extension means no
    /// link. Returns the cache record and the probed classification.
    pub fn from_bytes<T>(
        &self,
        bytes: &[u8],
        probe: impl FnOnce(&Path) -> Result<T>,
        ext_of: impl FnOnce(&T) -> &str,
    ) -> Result<(File, T)> {
        self.ingest(bytes, FileSource::Bytes, probe, ext_of)
            .map_err(|e| e.in_function("FileCache::from_bytes"))
    }

    /// Ingest the contents of a local file.
    pub fn from_path<T>(
        &self,
        path: &Path,
        probe: impl FnOnce(&Path) -> Result<T>,
        ext_of: impl FnOnce(&T) -> &str,
    ) -> Result<(File, T)> {
        let bytes = fs::read(path)
            .map_err(|e| Error::io(format!("reading {}: {e}", path.display())))
            .map_err(|e| e.in_function("FileCache::from_path"))?;
        self.ingest(
            &bytes,
            FileSource::Path(path.to_path_buf()),
            probe,
            ext_of,
        )
        .map_err(|e| e.in_function("FileCache::from_path"))
    }

    /// Ingest the body of a URI via the supplied fetcher.
    pub fn from_uri<T>(
        &self,
        fetcher: &dyn UriFetcher,
        uri: &str,
        probe: impl FnOnce(&Path) -> Result<T>,
        ext_of: impl FnOnce(&T) -> &str,
    ) -> Result<(File, T)> {
        let bytes = fetcher
            .fetch(uri)
            .map_err(|e| e.in_function("FileCache::from_uri"))?;
        self.ingest(&bytes, FileSource::Uri(uri.to_string()), probe, ext_of)
            .map_err(|e| e.in_function("FileCache::from_uri"))
    }

    /// Run `cmd` with empty stdin and ingest its stdout.
    pub fn from_command<T>(
        &self,
        runner: &dyn ToolRunner,
        cmd: &Cmd,
        probe: impl FnOnce(&Path) -> Result<T>,
        ext_of: impl FnOnce(&T) -> &str,
    ) -> Result<(File, T)> {
        let stdout = runner
            .run_pipeline(std::slice::from_ref(cmd), b"")
            .map_err(|e| e.in_function("FileCache::from_command"))?;
        self.ingest(
            &stdout,
            FileSource::Command(cmd.to_string()),
            probe,
            ext_of,
        )
        .map_err(|e| e.in_function("FileCache::from_command"))
    }

    /// Where a record's blob lives. Pure; does not touch disk.
    pub fn path_of(&self, file: &File) -> PathBuf {
        self.cache_top.join(&file.checksum)
    }

    /// Read a record's blob back.
    pub fn load(&self, file: &File) -> Result<Vec<u8>> {
        let path = self.path_of(file);
        fs::read(&path)
            .map_err(|e| Error::io(format!("reading blob {}: {e}", path.display())))
            .map_err(|e| e.in_function("FileCache::load"))
    }

    fn ingest<T>(
        &self,
        bytes: &[u8],
        source: FileSource,
        probe: impl FnOnce(&Path) -> Result<T>,
        ext_of: impl FnOnce(&T) -> &str,
    ) -> Result<(File, T)> {
        fs::create_dir_all(&self.cache_top).map_err(|e| {
            Error::io(format!(
                "creating cache directory {}: {e}",
                self.cache_top.display()
            ))
        })?;

        let checksum = checksum_hex(bytes);
        let blob_path = self.cache_top.join(&checksum);
        if !blob_path.exists() {
            self.write_blob(bytes, &blob_path)?;
        }

        let probed = probe(&blob_path)?;
        let ext = ext_of(&probed).to_string();
        if !ext.is_empty() {
            self.ensure_symlink(&checksum, &ext)?;
        }

        let file = File {
            source: Some(source),
            checksum,
            messages: Vec::new(),
            ext,
        };
        Ok((file, probed))
    }

    /// Write to a temp sibling, sync, rename. A concurrent writer of the
    /// same checksum just renames identical content over us.
    fn write_blob(&self, bytes: &[u8], blob_path: &Path) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.cache_top)
            .map_err(|e| Error::io(format!("creating temp blob: {e}")))?;
        tmp.write_all(bytes)
            .map_err(|e| Error::io(format!("writing temp blob: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(format!("syncing temp blob: {e}")))?;
        tmp.persist(blob_path)
            .map_err(|e| Error::io(format!("renaming blob into place: {e}")))?;
        Ok(())
    }

    /// Ensure `<checksum><ext>` links to `<checksum>`. If anything already
    /// sits at the link name it is left alone — the extension hint is only
    /// a hint.
    fn ensure_symlink(&self, checksum: &str, ext: &str) -> Result<()> {
        let link = self.cache_top.join(format!("{checksum}{ext}"));
        match make_link(Path::new(checksum), &link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::io(format!(
                "linking {}: {e}",
                link.display()
            ))),
        }
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> std::io::Result<()> {
    // No symlinks to lean on; a hard link preserves the extension hint.
    let full_target = link.parent().unwrap_or(Path::new(".")).join(target);
    std::fs::hard_link(full_target, link)
}
