//! Keychain lookup and session state.
//!
//! All mutations go through the `security` tool. The search list and the
//! lock state of a keychain are shared by every process of the login
//! session; callers must not run two pipelines against the same keychain
//! at once.

use crate::command::ToolCommand;
use crate::config::{expand_tilde, Settings};
use crate::{Error, Result};
use log::{debug, warn};
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};

const SECURITY: &str = "security";

/// File extensions tried, in order, for a bare keychain name.
const KEYCHAIN_EXTENSIONS: &[&str] = &["keychain", "keychain-db"];

/// Keychains of the current user.
#[derive(Debug, Clone)]
pub struct Keychains {
    dir: PathBuf,
    unlock_timeout: u64,
}

impl Keychains {
    pub fn new(settings: &Settings) -> Self {
        Self {
            dir: settings.keychain_dir.clone(),
            unlock_timeout: settings.keychain_unlock_timeout,
        }
    }

    /// Keychains stored in `dir`, with the default unlock timeout.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            unlock_timeout: 3600,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The user's login keychain.
    ///
    /// Falls back to `login.keychain` in the keychain directory when neither
    /// `login.keychain` nor `login.keychain-db` exists.
    pub fn login_keychain(&self) -> PathBuf {
        self.find("login")
            .unwrap_or_else(|| self.dir.join("login.keychain"))
    }

    /// Locate a keychain by path or by name.
    ///
    /// Names starting with `~`, `/` or `.` are paths and are used as given
    /// when they exist. Anything else is looked up in the keychain
    /// directory, adding a `.keychain` (or `.keychain-db`) extension when the
    /// name has none.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        if name.starts_with(['~', '/', '.']) {
            let path = expand_tilde(name);
            if path.exists() {
                return Some(fs::canonicalize(&path).unwrap_or(path));
            }
        }

        let candidates: Vec<PathBuf> = if Path::new(name).extension().is_some() {
            vec![self.dir.join(name)]
        } else {
            KEYCHAIN_EXTENSIONS
                .iter()
                .map(|ext| self.dir.join(format!("{name}.{ext}")))
                .collect()
        };

        candidates.into_iter().find(|path| path.exists())
    }

    /// Like [`Keychains::find`], but a missing keychain is an error.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        self.find(name)
            .ok_or_else(|| Error::not_found("keychain", name))
    }

    /// The current keychain search list.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let output = ToolCommand::new(SECURITY).arg("list-keychains").capture()?;
        Ok(parse_keychain_list(&output))
    }

    /// Append `keychain` to the search list, keeping existing entries.
    pub fn add_to_search_list(&self, keychain: &Path) -> Result<()> {
        let mut keychains = self.list()?;
        if !keychains.iter().any(|k| k == keychain) {
            keychains.push(keychain.to_path_buf());
        }

        ToolCommand::new(SECURITY)
            .arg("list-keychains")
            .arg("-s")
            .args(&keychains)
            .run()?;
        Ok(())
    }

    /// Copy a keychain file into the keychain directory.
    ///
    /// Returns the installed path. With `add`, the installed keychain is also
    /// appended to the search list.
    pub fn install(&self, keychain: impl AsRef<Path>, add: bool) -> Result<PathBuf> {
        let keychain = expand_tilde(keychain);
        if !keychain.is_file() {
            return Err(Error::not_found("keychain", keychain));
        }
        let file_name = keychain
            .file_name()
            .ok_or_else(|| Error::Config(format!("{} has no file name", keychain.display())))?;

        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(file_name);
        fs::copy(&keychain, &dest)?;
        debug!("installed {} to {}", keychain.display(), dest.display());

        if add {
            self.add_to_search_list(&dest)?;
        }
        Ok(dest)
    }

    /// Unlock `keychain` and set its auto-lock timeout.
    pub fn unlock(&self, keychain: &Path, password: &SecretString) -> Result<()> {
        ToolCommand::new(SECURITY)
            .arg("unlock-keychain")
            .arg("-p")
            .secret_arg(password)
            .arg(keychain)
            .run()?;

        ToolCommand::new(SECURITY)
            .arg("-v")
            .arg("set-keychain-settings")
            .arg("-lut")
            .arg(self.unlock_timeout.to_string())
            .arg(keychain)
            .run()?;
        Ok(())
    }

    pub fn lock(&self, keychain: &Path) -> Result<()> {
        ToolCommand::new(SECURITY)
            .arg("lock-keychain")
            .arg(keychain)
            .run()?;
        Ok(())
    }

    /// Unlock `keychain` until the returned guard is dropped.
    pub fn unlocked(&self, keychain: &Path, password: &SecretString) -> Result<UnlockedKeychain<'_>> {
        self.unlock(keychain, password)?;
        Ok(UnlockedKeychain {
            keychains: self,
            path: keychain.to_path_buf(),
            password: password.clone(),
        })
    }
}

/// An unlocked keychain, locked again on drop.
pub struct UnlockedKeychain<'a> {
    keychains: &'a Keychains,
    path: PathBuf,
    password: SecretString,
}

impl UnlockedKeychain<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock again, e.g. after a long build let the timeout expire.
    pub fn refresh(&self) -> Result<()> {
        self.keychains.unlock(&self.path, &self.password)
    }
}

impl Drop for UnlockedKeychain<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.keychains.lock(&self.path) {
            warn!("failed to lock {}: {}", self.path.display(), e);
        }
    }
}

/// Parse `security list-keychains` output: one quoted path per line.
fn parse_keychain_list(output: &str) -> Vec<PathBuf> {
    let mut keychains: Vec<PathBuf> = Vec::new();
    for line in output.lines() {
        let path = line.trim().trim_matches('"');
        if path.is_empty() {
            continue;
        }
        let path = PathBuf::from(path);
        if !keychains.contains(&path) {
            keychains.push(path);
        }
    }
    keychains
}
