// ============================================
// archive.rs - Read-only access to the embedded bundle archive
// ============================================
//
// The bundle is a ZIP container held entirely in memory (it comes from
// a Windows resource or from a file read up front). This module wraps
// it and offers:
//   - Entry listing (count, name, directory test)
//   - Single entry extraction by name or by index
//   - Subtree extraction filtered by a name prefix
//
// Entry names are archive paths: '/' is the native separator but '\'
// is accepted everywhere a name is split into components.
// ============================================

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

/// Errors raised while reading or unpacking the archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The byte buffer is not a readable archive
    #[error("bundle has invalid format: {0}")]
    InvalidFormat(#[source] ZipError),

    /// No entry with this name exists
    #[error("entry '{0}' is missing from the bundle")]
    MissingEntry(String),

    /// Index past the end of the entry list
    #[error("entry index {index} is out of range ({count} entries)")]
    IndexOutOfRange { index: usize, count: usize },

    /// Entry name would escape the destination directory
    #[error("entry '{0}' has an unsafe path")]
    UnsafeEntryPath(String),

    /// The entry exists but its data could not be decoded
    #[error("failed to read entry '{name}': {source}")]
    Read {
        name: String,
        #[source]
        source: ZipError,
    },

    /// Writing the entry to disk failed
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Outcome of extracting an entry that may legitimately be absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// The entry was found and written to disk
    Extracted,
    /// The archive has no such entry
    Absent,
}

impl Extraction {
    pub fn is_extracted(self) -> bool {
        self == Extraction::Extracted
    }
}

/// An opened in-memory archive.
///
/// Dropping the value releases the archive; there is no separate close call.
pub struct Archive<'a> {
    inner: ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> Archive<'a> {
    /// Open an archive over a byte buffer.
    ///
    /// Fails with `InvalidFormat` when the central directory can't be read.
    pub fn open(bytes: &'a [u8]) -> Result<Self> {
        let inner = ZipArchive::new(Cursor::new(bytes)).map_err(ArchiveError::InvalidFormat)?;
        Ok(Self { inner })
    }

    /// Number of entries (files and directories)
    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Archive path of the entry at `index`
    pub fn entry_name(&self, index: usize) -> Result<&str> {
        self.inner
            .name_for_index(index)
            .ok_or(ArchiveError::IndexOutOfRange {
                index,
                count: self.count(),
            })
    }

    /// Directory entries are the ones whose name ends with a separator
    pub fn is_directory(&self, index: usize) -> Result<bool> {
        Ok(is_directory_name(self.entry_name(index)?))
    }

    /// Write the entry called `name` to `destination`.
    ///
    /// Parent directories of `destination` are NOT created.
    pub fn extract_by_name(&mut self, name: &str, destination: &Path) -> Result<()> {
        let mut entry = match self.inner.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(name.to_string())),
            Err(source) => {
                return Err(ArchiveError::Read {
                    name: name.to_string(),
                    source,
                })
            }
        };
        write_entry(name, &mut entry, destination)
    }

    /// Write the entry at `index` to `destination`.
    pub fn extract_by_index(&mut self, index: usize, destination: &Path) -> Result<()> {
        let name = self.entry_name(index)?.to_string();
        let mut entry = self
            .inner
            .by_index(index)
            .map_err(|source| ArchiveError::Read {
                name: name.clone(),
                source,
            })?;
        write_entry(&name, &mut entry, destination)
    }

    /// Like `extract_by_name`, but a missing entry is reported as `Absent`
    /// instead of an error. Any other failure is still an error.
    pub fn extract_optional(&mut self, name: &str, destination: &Path) -> Result<Extraction> {
        match self.extract_by_name(name, destination) {
            Ok(()) => Ok(Extraction::Extracted),
            Err(ArchiveError::MissingEntry(_)) => Ok(Extraction::Absent),
            Err(e) => Err(e),
        }
    }

    /// Extract every entry below `prefix` into `destination`.
    ///
    /// Pass 1 creates the directories, pass 2 writes the files. The prefix
    /// and one following separator are stripped from each entry name. An
    /// entry whose name is not longer than the prefix is skipped.
    ///
    /// Returns the number of files written. The first failure aborts the
    /// whole operation; directories created before it are left in place.
    pub fn extract_subtree(&mut self, prefix: &str, destination: &Path) -> Result<usize> {
        // Pass 1: directories
        for index in 0..self.count() {
            let name = self.entry_name(index)?;
            let Some(relative) = strip_subtree_prefix(name, prefix) else {
                continue;
            };

            let target = if is_directory_name(name) {
                join_entry_path(destination, relative, name)?
            } else {
                match join_entry_path(destination, relative, name)?.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => continue,
                }
            };

            if !target.exists() {
                fs::create_dir_all(&target).map_err(|source| ArchiveError::Write {
                    path: target.clone(),
                    source,
                })?;
            }
        }

        // Pass 2: files
        let mut written = 0;
        for index in 0..self.count() {
            if self.is_directory(index)? {
                continue;
            }
            let name = self.entry_name(index)?;
            let Some(relative) = strip_subtree_prefix(name, prefix) else {
                continue;
            };
            let target = join_entry_path(destination, relative, name)?;
            self.extract_by_index(index, &target)?;
            written += 1;
        }

        Ok(written)
    }
}

fn write_entry(name: &str, entry: &mut impl io::Read, destination: &Path) -> Result<()> {
    let write_error = |source| ArchiveError::Write {
        path: destination.to_path_buf(),
        source,
    };

    let mut file = File::create(destination).map_err(write_error)?;
    io::copy(entry, &mut file).map_err(|source| {
        // Decompression errors surface as io errors from the entry reader
        if source.kind() == io::ErrorKind::InvalidData {
            ArchiveError::Read {
                name: name.to_string(),
                source: ZipError::Io(source),
            }
        } else {
            write_error(source)
        }
    })?;
    Ok(())
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn is_directory_name(name: &str) -> bool {
    name.ends_with(is_separator)
}

/// Remaining relative path of `name` under `prefix`, or None when the
/// entry is outside the subtree.
fn strip_subtree_prefix<'n>(name: &'n str, prefix: &str) -> Option<&'n str> {
    if prefix.len() >= name.len() || !name.starts_with(prefix) {
        return None;
    }
    let rest = &name[prefix.len()..];
    Some(rest.strip_prefix(is_separator).unwrap_or(rest))
}

/// Append an archive-relative path to `root`, component by component.
fn join_entry_path(root: &Path, relative: &str, entry_name: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in relative.split(is_separator).filter(|p| !p.is_empty()) {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) => path.push(c),
            (Some(Component::CurDir), None) => {}
            _ => return Err(ArchiveError::UnsafeEntryPath(entry_name.to_string())),
        }
    }
    Ok(path)
}

// ============================================
// TESTS
// ============================================
