//! Files copied into a container before it starts.
//!
//! Entries are packed into a single tar archive rooted at `/`, which every
//! supported runtime can extract with `cp - <id>:/`.

use std::path::{Path, PathBuf};

use testpod_common::error::{Result, TestpodError};

/// Where the bytes of an injected file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// A file or directory on the host.
    Path(PathBuf),
    /// Literal content.
    Bytes(Vec<u8>),
}

/// One file to place inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Content source.
    pub source: FileSource,
    /// Absolute destination path inside the container.
    pub target: String,
    /// Unix permission bits.
    pub mode: u32,
}

impl FileEntry {
    /// Copies a host file or directory to `target`.
    #[must_use]
    pub fn from_path(source: impl Into<PathBuf>, target: impl Into<String>, mode: u32) -> Self {
        Self {
            source: FileSource::Path(source.into()),
            target: target.into(),
            mode,
        }
    }

    /// Writes literal bytes to `target`.
    #[must_use]
    pub fn from_bytes(content: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> Self {
        Self {
            source: FileSource::Bytes(content.into()),
            target: target.into(),
            mode,
        }
    }
}

/// Packs `entries` into a tar archive meant to be extracted at `/`.
///
/// # Errors
///
/// Returns `TestpodError::Config` for a relative target and
/// `TestpodError::Io` if a host file cannot be read.
pub fn build_archive(entries: &[FileEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let target = entry.target.strip_prefix('/').ok_or_else(|| TestpodError::Config {
            message: format!("file target must be absolute: {}", entry.target),
        })?;
        match &entry.source {
            FileSource::Bytes(content) => append_bytes(&mut builder, target, content, entry.mode)?,
            FileSource::Path(path) if path.is_dir() => builder
                .append_dir_all(target, path)
                .map_err(|source| io_error(path, source))?,
            FileSource::Path(path) => {
                let content = std::fs::read(path).map_err(|source| io_error(path, source))?;
                append_bytes(&mut builder, target, &content, entry.mode)?;
            }
        }
    }
    builder
        .into_inner()
        .map_err(|source| io_error(Path::new("<archive>"), source))
}

fn append_bytes(
    builder: &mut tar::Builder<Vec<u8>>,
    target: &str,
    content: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, target, content)
        .map_err(|source| io_error(Path::new(target), source))
}

fn io_error(path: &Path, source: std::io::Error) -> TestpodError {
    TestpodError::Io {
        path: path.to_path_buf(),
        source,
    }
}
