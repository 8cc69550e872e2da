//! Provisioning profile handling.
//!
//! A `.mobileprovision` file is a CMS signed message whose content is an XML
//! property list. This module turns that file into a [`ProvisioningProfile`]
//! and provides the [`ProfileStore`] that resolves human references (a path,
//! a profile name or a glob pattern) against the installed profiles.
//!
//! Getting at the inner property list is delegated to a [`ProfileDecoder`]:
//!
//! | Decoder | How | Used for |
//! |---------|-----|----------|
//! | [`EmbeddedPlist`] | slices the XML out of the container in-process | scanning the profile directory |
//! | [`SecurityCms`] | `security cms -D -i <path>` | trust metadata during a resign |

pub mod store;

pub use store::{ProfileListing, ProfileStore};

use crate::command::ToolCommand;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// File extension of provisioning profiles.
pub const PROFILE_EXTENSION: &str = "mobileprovision";

/// Entitlement key holding `<team id>.<bundle id>`.
pub const APPLICATION_IDENTIFIER_KEY: &str = "application-identifier";

/// Entitlement key holding the team identifier.
pub const TEAM_IDENTIFIER_KEY: &str = "com.apple.developer.team-identifier";

/// Extracts the plaintext property list from a signed profile container.
pub trait ProfileDecoder {
    /// Return the XML property list carried by the profile at `path`.
    fn decode(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Slices the XML payload out of the signed container without verifying it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedPlist;

impl ProfileDecoder for EmbeddedPlist {
    fn decode(&self, path: &Path) -> Result<Vec<u8>> {
        let data = fs::read(path)?;
        embedded_plist(&data)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::InvalidProfile(format!("no property list found in {}", path.display()))
            })
    }
}

/// Unwraps the signed container with `security cms -D`.
///
/// The tool verifies the signature; its output is trusted as plaintext.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityCms;

impl ProfileDecoder for SecurityCms {
    fn decode(&self, path: &Path) -> Result<Vec<u8>> {
        let output = ToolCommand::new("security")
            .args(["cms", "-D", "-i"])
            .arg(path)
            .capture()?;
        Ok(output.into_bytes())
    }
}

/// Locate the `<?xml ... </plist>` span inside a profile container.
fn embedded_plist(data: &[u8]) -> Option<&[u8]> {
    let start = data.windows(5).position(|w| w == b"<?xml")?;
    let end = data.windows(8).rposition(|w| w == b"</plist>")? + 8;

    if start >= end {
        return None;
    }

    Some(&data[start..end])
}

/// Identity record of one provisioning profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningProfile {
    /// The profile `UUID`.
    pub unique_id: String,
    /// The profile `Name`.
    pub display_name: String,
    /// Team identifier, empty when the profile carries none.
    pub team_id: String,
    /// `application-identifier` entitlement, empty when absent.
    pub app_identifier: String,
    /// The `Entitlements` dictionary.
    pub entitlements: Dictionary,
    /// Where the profile was read from.
    pub source_path: PathBuf,
}

impl ProvisioningProfile {
    /// Load and decode the profile at `path`.
    pub fn load(path: impl AsRef<Path>, decoder: &dyn ProfileDecoder) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found("provisioning profile", path));
        }
        let payload = decoder.decode(path)?;
        Self::from_plist_bytes(&payload, path)
    }

    /// Build a profile from its decoded property list.
    pub fn from_plist_bytes(payload: &[u8], source_path: impl Into<PathBuf>) -> Result<Self> {
        let source_path = source_path.into();
        let value: Value = plist::from_bytes(payload)?;
        let dict = value.as_dictionary().ok_or_else(|| {
            Error::InvalidProfile(format!(
                "{} does not contain a dictionary",
                source_path.display()
            ))
        })?;

        let required = |key: &str| -> Result<String> {
            dict.get(key)
                .and_then(Value::as_string)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::InvalidProfile(format!("{} has no {key}", source_path.display()))
                })
        };

        let unique_id = required("UUID")?;
        let display_name = required("Name")?;

        let entitlements = dict
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .unwrap_or_default();

        let app_identifier = entitlements
            .get(APPLICATION_IDENTIFIER_KEY)
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string();

        let first_string = |key: &str| {
            dict.get(key)
                .and_then(Value::as_array)
                .and_then(|values| values.first())
                .and_then(Value::as_string)
                .map(str::to_string)
        };

        let team_id = entitlements
            .get(TEAM_IDENTIFIER_KEY)
            .and_then(Value::as_string)
            .map(str::to_string)
            .or_else(|| first_string("TeamIdentifier"))
            .or_else(|| first_string("ApplicationIdentifierPrefix"))
            .unwrap_or_default();

        Ok(Self {
            unique_id,
            display_name,
            team_id,
            app_identifier,
            entitlements,
            source_path,
        })
    }

    /// Bundle identifier implied by the profile's application identifier.
    pub fn derived_bundle_id(&self) -> Result<String> {
        derive_bundle_id(&self.app_identifier, &self.team_id)
    }
}

/// Strip the `<team id>.` prefix from an application identifier.
///
/// Fails unless `app_identifier` starts with `team_id` followed by a dot.
pub fn derive_bundle_id(app_identifier: &str, team_id: &str) -> Result<String> {
    if team_id.is_empty() {
        return Err(Error::InvalidProfile(
            "profile has no team identifier".to_string(),
        ));
    }

    app_identifier
        .strip_prefix(team_id)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| {
            Error::InvalidProfile(format!(
                "application identifier '{app_identifier}' does not start with '{team_id}.'"
            ))
        })
        .and_then(|bundle_id| {
            if bundle_id.contains('*') {
                Err(Error::InvalidProfile(format!(
                    "wildcard application identifier '{app_identifier}' needs an explicit bundle identifier"
                )))
            } else {
                Ok(bundle_id.to_string())
            }
        })
}
