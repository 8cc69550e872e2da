//! Index over a directory of installed provisioning profiles.
//!
//! References are resolved by a fixed chain of lookups, first success wins:
//!
//! 1. an existing filesystem path,
//! 2. an exact profile name,
//! 3. a glob pattern over profile names (only when pattern matching is on).
//!
//! Directory scans are non-recursive and visit files in file name order, so
//! "first match" is stable across runs.

use super::{EmbeddedPlist, ProfileDecoder, ProvisioningProfile, PROFILE_EXTENSION};
use crate::config::{expand_tilde, Settings};
use crate::{Error, Result};
use glob::Pattern;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Path,
    ExactName,
    Pattern,
}

impl Lookup {
    fn chain(pattern_match: bool) -> &'static [Lookup] {
        if pattern_match {
            &[Lookup::Path, Lookup::ExactName, Lookup::Pattern]
        } else {
            &[Lookup::Path, Lookup::ExactName]
        }
    }
}

/// Resolves profile references against a profile directory.
pub struct ProfileStore {
    dir: PathBuf,
    decoder: Box<dyn ProfileDecoder>,
}

impl ProfileStore {
    /// A store over the configured profile directory.
    pub fn new(settings: &Settings) -> Self {
        Self::with_dir(&settings.profile_dir)
    }

    /// A store over an explicit directory.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            decoder: Box::new(EmbeddedPlist),
        }
    }

    /// Replace the decoder used to read profile payloads.
    pub fn with_decoder(mut self, decoder: impl ProfileDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// The directory this store scans.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode a single profile file.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<ProvisioningProfile> {
        ProvisioningProfile::load(path, self.decoder.as_ref())
    }

    /// Where a profile with `uuid` lives once installed.
    pub fn path_for_uuid(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{uuid}.{PROFILE_EXTENSION}"))
    }

    /// Every profile path matching `reference`, in directory order.
    ///
    /// An existing path yields just that path; no match yields an empty list.
    pub fn find_all(&self, reference: &str, pattern_match: bool) -> Result<Vec<PathBuf>> {
        for lookup in Lookup::chain(pattern_match) {
            let found = match lookup {
                Lookup::Path => {
                    let path = expand_tilde(reference);
                    if path.is_file() {
                        vec![fs::canonicalize(&path)?]
                    } else {
                        Vec::new()
                    }
                }
                Lookup::ExactName => self.scan(|name| name == reference)?,
                Lookup::Pattern => {
                    let pattern = Pattern::new(reference).map_err(|e| {
                        Error::Config(format!("invalid profile pattern '{reference}': {e}"))
                    })?;
                    self.scan(|name| pattern.matches(name))?
                }
            };

            if !found.is_empty() {
                debug!("'{}' resolved by {:?} lookup", reference, lookup);
                return Ok(found);
            }
        }

        Ok(Vec::new())
    }

    /// Path of the profile `reference` refers to.
    ///
    /// Several matches pick the first one and log a warning.
    pub fn resolve_path(&self, reference: &str, pattern_match: bool) -> Result<PathBuf> {
        let mut paths = self.find_all(reference, pattern_match)?;
        if paths.len() > 1 {
            warn!(
                "Multiple matches found for \"{}\", returning first match: {}",
                reference,
                paths[0].display()
            );
        }
        if paths.is_empty() {
            return Err(Error::ProfileNotFound(reference.to_string()));
        }
        Ok(paths.swap_remove(0))
    }

    /// Resolve `reference` and decode the profile it points at.
    pub fn resolve(&self, reference: &str, pattern_match: bool) -> Result<ProvisioningProfile> {
        let path = self.resolve_path(reference, pattern_match)?;
        self.load(path)
    }

    /// The `UUID` of the profile at `path`.
    pub fn uuid(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = expand_tilde(path);
        if !has_profile_extension(&path) {
            return Err(Error::InvalidProfile(format!(
                "{} is not a Provisioning Profile",
                path.display()
            )));
        }
        Ok(self.load(&path)?.unique_id)
    }

    /// Copy a profile into the store as `<UUID>.mobileprovision`.
    pub fn install(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let uuid = self.uuid(path)?;
        fs::create_dir_all(&self.dir)?;
        let dest = self.path_for_uuid(&uuid);
        fs::copy(path, &dest)?;
        Ok(dest)
    }

    /// Lazily render `"<file> : '<name>'"` for every profile in the store.
    ///
    /// A missing directory is reported as [`Error::InputNotFound`].
    pub fn list(&self) -> Result<ProfileListing<'_>> {
        Ok(ProfileListing {
            store: self,
            paths: self.profile_files()?.into_iter(),
        })
    }

    fn profile_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("profile directory", &self.dir));
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && has_profile_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn scan(&self, mut matches: impl FnMut(&str) -> bool) -> Result<Vec<PathBuf>> {
        let paths = match self.profile_files() {
            Ok(paths) => paths,
            Err(e) if e.is_not_found() => {
                warn!("profile directory {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for path in paths {
            match self.load(&path) {
                Ok(profile) if matches(&profile.display_name) => found.push(path),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable profile {}: {}", path.display(), e),
            }
        }
        Ok(found)
    }
}

/// Lazy listing returned by [`ProfileStore::list`].
pub struct ProfileListing<'a> {
    store: &'a ProfileStore,
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for ProfileListing<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(
            self.store
                .load(&path)
                .map(|profile| format!("{} : '{}'", file_name, profile.display_name)),
        )
    }
}

fn has_profile_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PROFILE_EXTENSION)
}
