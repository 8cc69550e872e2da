//! Application bundle metadata (`Info.plist`).

use crate::{Error, Result};
use plist::Value;
use std::fs;
use std::path::Path;

/// Name of the bundle metadata file.
pub const INFO_PLIST: &str = "Info.plist";

const BINARY_PLIST_MAGIC: &[u8] = b"bplist00";

/// The `Info.plist` keys the pipelines care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleInfo {
    /// `CFBundleIdentifier`
    pub identifier: Option<String>,
    /// `CFBundleExecutable`
    pub executable: Option<String>,
    /// `CFBundleShortVersionString`
    pub marketing_version: Option<String>,
    /// `CFBundleVersion`
    pub build_version: Option<String>,
}

impl BundleInfo {
    /// Read the metadata of the bundle at `bundle_path`.
    pub fn read(bundle_path: impl AsRef<Path>) -> Result<Self> {
        Self::read_plist(bundle_path.as_ref().join(INFO_PLIST))
    }

    /// Read metadata from an `Info.plist` file directly.
    pub fn read_plist(plist_path: impl AsRef<Path>) -> Result<Self> {
        let plist_path = plist_path.as_ref();
        let (value, _) = load(plist_path)?;
        let dict = value.as_dictionary().ok_or_else(|| {
            Error::StructuralIntegrity(format!("{} is not a dictionary", plist_path.display()))
        })?;

        let string = |key: &str| dict.get(key).and_then(Value::as_string).map(str::to_string);

        Ok(Self {
            identifier: string("CFBundleIdentifier"),
            executable: string("CFBundleExecutable"),
            marketing_version: string("CFBundleShortVersionString"),
            build_version: string("CFBundleVersion"),
        })
    }
}

/// Set `CFBundleIdentifier`, keeping the file's plist format.
pub fn set_bundle_identifier(bundle_path: impl AsRef<Path>, identifier: &str) -> Result<()> {
    let plist_path = bundle_path.as_ref().join(INFO_PLIST);
    if is_symlink(&plist_path) {
        return Err(Error::StructuralIntegrity(format!(
            "{} is a symbolic link",
            plist_path.display()
        )));
    }
    let (mut value, binary) = load(&plist_path)?;

    let dict = value.as_dictionary_mut().ok_or_else(|| {
        Error::StructuralIntegrity(format!("{} is not a dictionary", plist_path.display()))
    })?;
    dict.insert(
        "CFBundleIdentifier".to_string(),
        Value::String(identifier.to_string()),
    );

    if binary {
        plist::to_file_binary(&plist_path, &value)?;
    } else {
        plist::to_file_xml(&plist_path, &value)?;
    }
    Ok(())
}

/// Bundle name without the `.app` extension.
pub fn app_name(bundle_path: impl AsRef<Path>) -> String {
    bundle_path
        .as_ref()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether `path` names an application bundle directory.
///
/// Symbolic links are not followed, so a link named `*.app` is not a bundle.
pub fn is_app_bundle(path: &Path) -> bool {
    is_real_dir(path) && path.extension().is_some_and(|ext| ext == "app")
}

/// Whether `path` is a directory and not a link to one.
pub fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_dir())
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

fn load(plist_path: &Path) -> Result<(Value, bool)> {
    if !plist_path.exists() {
        return Err(Error::StructuralIntegrity(format!(
            "{} not found",
            plist_path.display()
        )));
    }
    let data = fs::read(plist_path)?;
    let binary = data.starts_with(BINARY_PLIST_MAGIC);
    Ok((plist::from_bytes(&data)?, binary))
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub fn info_plist(identifier: &str, executable: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>{executable}</string>
    <key>CFBundleIdentifier</key>
    <string>{identifier}</string>
    <key>CFBundleShortVersionString</key>
    <string>1.2</string>
    <key>CFBundleVersion</key>
    <string>42</string>
</dict>
</plist>"#
        )
    }
}
