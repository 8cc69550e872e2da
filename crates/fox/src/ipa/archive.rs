//! IPA archive creation.
//!
//! Archives are written from a base directory: every entry name is relative
//! to that base, so an IPA packed from a [`WorkingTree`] has `Payload/` at its
//! root. The same writer produces the companion dSYM archive.
//!
//! Entries are written in sorted order with a fixed timestamp, so packing the
//! same tree twice yields byte-identical archives. The archive is written to
//! a temporary file beside the destination and moved into place only once
//! complete.
//!
//! For the reverse operation, see the [`extract`](super::extract) module.

use super::extract::{WorkingTree, PAYLOAD_DIR};
use crate::template::{substitute, OutputVars};
use crate::{Error, Result};
use log::info;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// ZIP compression level for IPA creation.
///
/// # Examples
///
/// ```
/// use fox::ipa::CompressionLevel;
///
/// let fast = CompressionLevel::NONE;
/// let custom = CompressionLevel::new(15);
/// assert_eq!(custom.level(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// No compression (level 0).
    pub const NONE: CompressionLevel = CompressionLevel(0);

    /// Default compression (level 6).
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    /// Maximum compression (level 9).
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Creates a compression level from 0-9, clamping larger values.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    /// Returns the compression level value (0-9).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn options(self) -> SimpleFileOptions {
        let options = SimpleFileOptions::default().last_modified_time(DateTime::default());
        if self.0 == 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.0)))
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Pack a working tree into an IPA at `output`, rooted at `Payload/`.
///
/// `output` must be the final file path; see [`resolve_output`].
pub fn pack(tree: &WorkingTree, output: impl AsRef<Path>, level: CompressionLevel) -> Result<()> {
    let output = output.as_ref();
    write_archive(tree.root(), &[Path::new(PAYLOAD_DIR)], output, level)?;
    info!("wrote {}", output.display());
    Ok(())
}

/// Write a ZIP of `roots` (relative to `base`) to `output`.
///
/// Entry names are relative to `base`. Symlinks are stored as links,
/// regular files keep their Unix permissions.
pub fn write_archive(
    base: &Path,
    roots: &[&Path],
    output: &Path,
    level: CompressionLevel,
) -> Result<()> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let staging = NamedTempFile::new_in(&parent)?;
    let mut zip = ZipWriter::new(staging.reopen()?);
    let options = level.options();

    for root in roots {
        let root_path = base.join(root);
        if !root_path.exists() {
            return Err(Error::not_found("archive source", root_path));
        }

        for entry in WalkDir::new(&root_path)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = entry.path();
            let name = entry_name(base, path)?;
            let metadata = fs::symlink_metadata(path)?;

            if metadata.is_dir() {
                zip.add_directory(format!("{name}/"), options)?;
            } else if metadata.file_type().is_symlink() {
                let target = fs::read_link(path)?;
                zip.add_symlink(name, target.to_string_lossy(), options)?;
            } else {
                #[cfg(unix)]
                let options = {
                    use std::os::unix::fs::PermissionsExt;
                    options.unix_permissions(metadata.permissions().mode())
                };
                zip.start_file(name, options)?;
                let mut file = File::open(path)?;
                io::copy(&mut file, &mut zip)?;
            }
        }
    }

    zip.finish()?.flush()?;
    staging
        .persist(output)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Archive entry name of `path` relative to `base`, `/`-separated.
fn entry_name(base: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is outside {}", path.display(), base.display()),
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Final archive path for `output`.
///
/// `output` is first expanded as a template. If the result is an existing
/// directory, the file name comes from `file_template` instead.
pub fn resolve_output(output: &str, file_template: &str, vars: &OutputVars) -> Result<PathBuf> {
    let output = PathBuf::from(substitute(output, vars)?);
    if output.is_dir() {
        Ok(output.join(substitute(file_template, vars)?))
    } else {
        Ok(output)
    }
}

/// Refuse to replace an existing output unless `overwrite` is set.
///
/// Nothing is deleted here; the archive writer replaces the file atomically.
pub fn check_output(path: &Path, overwrite: bool) -> Result<()> {
    if path.is_dir() {
        return Err(Error::OutputExists(path.to_path_buf()));
    }
    if path.exists() && !overwrite {
        return Err(Error::OutputExists(path.to_path_buf()));
    }
    Ok(())
}
