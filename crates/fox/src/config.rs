//! Settings, presets and per-pipeline parameters.
//!
//! [`Settings`] carries every path and default the library needs and is
//! injected into each component; only the outermost entry point builds one
//! from the user's home directory. [`ConfigFile`] loads the TOML config whose
//! `preset:<name>` tables become [`Preset`]s, and [`BuildParams`] /
//! [`ResignParams`] hold the inputs of one pipeline run.
//!
//! Precedence is always: explicit invocation value, then preset value, then
//! the [`Settings`] default.

use crate::build::Packaging;
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default build configuration when none is given.
pub const DEFAULT_BUILD_CONFIG: &str = "Debug";

/// Default file name template for archives written into a directory.
pub const DEFAULT_IPA_OUTPUT_TEMPLATE: &str =
    "${app_name}_${marketing_version}_${build_version}_${config}.ipa";

/// Paths and defaults shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding installed `.mobileprovision` files.
    pub profile_dir: PathBuf,
    /// Directory holding the user's keychains.
    pub keychain_dir: PathBuf,
    /// Location of the TOML config file.
    pub config_path: PathBuf,
    /// Build configuration used when none is specified.
    pub build_config: String,
    /// Template for archive names derived inside an output directory.
    pub ipa_output_template: String,
    /// SDK passed to the build and packaging tools.
    pub sdk: String,
    /// Seconds an unlocked keychain stays unlocked.
    pub keychain_unlock_timeout: u64,
}

impl Settings {
    /// Settings rooted at an explicit home directory.
    pub fn with_home(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref();
        Self {
            profile_dir: home.join("Library/MobileDevice/Provisioning Profiles"),
            keychain_dir: home.join("Library/Keychains"),
            config_path: home.join(".fox"),
            build_config: DEFAULT_BUILD_CONFIG.to_string(),
            ipa_output_template: DEFAULT_IPA_OUTPUT_TEMPLATE.to_string(),
            sdk: "iphoneos".to_string(),
            keychain_unlock_timeout: 3600,
        }
    }

    /// Settings rooted at the current user's home directory.
    pub fn from_home() -> Self {
        Self::with_home(dirs::home_dir().unwrap_or_default())
    }

    /// Apply the `[settings]` table of a config file.
    pub fn apply(&mut self, overrides: &SettingsOverrides) {
        if let Some(ref dir) = overrides.profile_dir {
            self.profile_dir = expand_tilde(dir);
        }
        if let Some(ref dir) = overrides.keychain_dir {
            self.keychain_dir = expand_tilde(dir);
        }
        if let Some(ref config) = overrides.build_config {
            self.build_config = config.clone();
        }
        if let Some(ref template) = overrides.ipa_output_template {
            self.ipa_output_template = template.clone();
        }
        if let Some(ref sdk) = overrides.sdk {
            self.sdk = sdk.clone();
        }
        if let Some(timeout) = overrides.keychain_unlock_timeout {
            self.keychain_unlock_timeout = timeout;
        }
    }
}

/// Optional overrides for [`Settings`], read from `[settings]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsOverrides {
    pub profile_dir: Option<PathBuf>,
    pub keychain_dir: Option<PathBuf>,
    pub build_config: Option<String>,
    pub ipa_output_template: Option<String>,
    pub sdk: Option<String>,
    pub keychain_unlock_timeout: Option<u64>,
}

/// A named set of default pipeline parameters.
///
/// Fields cover both pipelines; each pipeline picks the ones it knows.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preset {
    pub workspace: Option<PathBuf>,
    pub scheme: Option<String>,
    pub project: Option<PathBuf>,
    pub target: Option<String>,
    pub config: Option<String>,
    pub profile: Option<String>,
    pub identity: Option<String>,
    pub keychain: Option<String>,
    pub keychain_password: Option<SecretString>,
    pub output: Option<String>,
    pub overwrite: Option<bool>,
    pub build_dir: Option<PathBuf>,
    pub dsym: Option<bool>,
    pub clean: Option<bool>,
    pub sdk: Option<String>,
    pub packaging: Option<Packaging>,
    pub ipa: Option<PathBuf>,
    pub bundle_id: Option<String>,
    pub entitlements: Option<PathBuf>,
    pub resource_rules: Option<PathBuf>,
    pub narrow_keychain_groups: Option<bool>,
    pub allow_unsigned: Option<bool>,
    pub pattern_match: Option<bool>,
}

/// The parsed TOML config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    table: toml::Table,
}

impl ConfigFile {
    /// Parse a config document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            table: text.parse::<toml::Table>()?,
        })
    }

    /// Load a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found("config file", path));
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Load a config file, treating a missing file as empty.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The `[settings]` table, if present.
    pub fn settings(&self) -> Result<SettingsOverrides> {
        match self.table.get("settings") {
            Some(value) => Ok(value.clone().try_into()?),
            None => Ok(SettingsOverrides::default()),
        }
    }

    /// The `preset:<name>` table, if present.
    pub fn preset(&self, name: &str) -> Result<Option<Preset>> {
        match self.table.get(&format!("preset:{name}")) {
            Some(value) => Ok(Some(value.clone().try_into()?)),
            None => Ok(None),
        }
    }

    /// Names of every preset in the file.
    pub fn preset_names(&self) -> Vec<&str> {
        self.table
            .keys()
            .filter_map(|key| key.strip_prefix("preset:"))
            .collect()
    }
}

/// Fill every unset field of `$params` from the same field of `$preset`.
macro_rules! fill_from_preset {
    ($params:expr, $preset:expr, $($field:ident),+ $(,)?) => {
        $(
            if $params.$field.is_none() {
                $params.$field = $preset.$field.clone();
            }
        )+
    };
}

/// Inputs of one build pipeline run.
#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    pub workspace: Option<PathBuf>,
    pub scheme: Option<String>,
    pub project: Option<PathBuf>,
    pub target: Option<String>,
    pub config: Option<String>,
    pub profile: Option<String>,
    pub identity: Option<String>,
    pub keychain: Option<String>,
    pub keychain_password: Option<SecretString>,
    pub output: Option<String>,
    pub overwrite: Option<bool>,
    pub build_dir: Option<PathBuf>,
    pub dsym: Option<bool>,
    pub clean: Option<bool>,
    pub sdk: Option<String>,
    pub packaging: Option<Packaging>,
}

impl BuildParams {
    /// Fill unset fields from a preset; explicit values win.
    #[must_use]
    pub fn with_preset(mut self, preset: &Preset) -> Self {
        fill_from_preset!(
            self,
            preset,
            workspace,
            scheme,
            project,
            target,
            config,
            profile,
            identity,
            keychain,
            keychain_password,
            output,
            overwrite,
            build_dir,
            dsym,
            clean,
            sdk,
            packaging,
        );
        self
    }

    /// Build configuration, falling back to the settings default.
    pub fn config_or_default(&self, settings: &Settings) -> String {
        self.config
            .clone()
            .unwrap_or_else(|| settings.build_config.clone())
    }

    /// SDK, falling back to the settings default.
    pub fn sdk_or_default(&self, settings: &Settings) -> String {
        self.sdk.clone().unwrap_or_else(|| settings.sdk.clone())
    }
}

/// Inputs of one resign pipeline run.
#[derive(Debug, Clone, Default)]
pub struct ResignParams {
    pub ipa: Option<PathBuf>,
    pub profile: Option<String>,
    pub identity: Option<String>,
    pub keychain: Option<String>,
    pub bundle_id: Option<String>,
    pub entitlements: Option<PathBuf>,
    pub resource_rules: Option<PathBuf>,
    pub output: Option<String>,
    pub overwrite: Option<bool>,
    pub narrow_keychain_groups: Option<bool>,
    pub allow_unsigned: Option<bool>,
    pub pattern_match: Option<bool>,
    pub config: Option<String>,
}

impl ResignParams {
    /// Fill unset fields from a preset; explicit values win.
    #[must_use]
    pub fn with_preset(mut self, preset: &Preset) -> Self {
        fill_from_preset!(
            self,
            preset,
            ipa,
            profile,
            identity,
            keychain,
            bundle_id,
            entitlements,
            resource_rules,
            output,
            overwrite,
            narrow_keychain_groups,
            allow_unsigned,
            pattern_match,
            config,
        );
        self
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const CONFIG: &str = r#"
[settings]
build_config = "Release"
sdk = "iphonesimulator"

["preset:release"]
workspace = "App.xcworkspace"
scheme = "App"
config = "Release"
profile = "App Store*"
identity = "iPhone Distribution: Example"
keychain_password = "hunter2"
dsym = true
packaging = "resign"

["preset:adhoc"]
ipa = "App.ipa"
profile = "AdHoc"
identity = "iPhone Distribution: Example"
bundle_id = "com.example.adhoc"
"#;

    #[test]
    fn test_settings_with_home() {
        let settings = Settings::with_home("/Users/ci");
        assert_eq!(
            settings.profile_dir,
            PathBuf::from("/Users/ci/Library/MobileDevice/Provisioning Profiles")
        );
        assert_eq!(settings.config_path, PathBuf::from("/Users/ci/.fox"));
        assert_eq!(settings.build_config, "Debug");
        assert_eq!(settings.ipa_output_template, DEFAULT_IPA_OUTPUT_TEMPLATE);
    }

    #[test]
    fn test_settings_overrides() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        let mut settings = Settings::with_home("/Users/ci");
        settings.apply(&config.settings().unwrap());

        assert_eq!(settings.build_config, "Release");
        assert_eq!(settings.sdk, "iphonesimulator");
        assert_eq!(settings.keychain_dir, PathBuf::from("/Users/ci/Library/Keychains"));
    }

    #[test]
    fn test_preset_lookup() {
        let config = ConfigFile::parse(CONFIG).unwrap();

        let preset = config.preset("release").unwrap().unwrap();
        assert_eq!(preset.scheme.as_deref(), Some("App"));
        assert_eq!(preset.dsym, Some(true));
        assert_eq!(preset.packaging, Some(Packaging::Resign));
        assert_eq!(
            preset.keychain_password.as_ref().unwrap().expose_secret(),
            "hunter2"
        );

        assert!(config.preset("missing").unwrap().is_none());

        let mut names = config.preset_names();
        names.sort_unstable();
        assert_eq!(names, vec!["adhoc", "release"]);
    }

    #[test]
    fn test_unknown_preset_key_rejected() {
        let config = ConfigFile::parse("[\"preset:bad\"]\nschem = \"App\"\n").unwrap();
        assert!(matches!(config.preset("bad"), Err(Error::Toml(_))));
    }

    #[test]
    fn test_build_params_precedence() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        let preset = config.preset("release").unwrap().unwrap();

        let params = BuildParams {
            config: Some("Beta".into()),
            ..Default::default()
        }
        .with_preset(&preset);

        // explicit value wins
        assert_eq!(params.config.as_deref(), Some("Beta"));
        // preset fills the gaps
        assert_eq!(params.scheme.as_deref(), Some("App"));
        assert_eq!(params.dsym, Some(true));
        // untouched by either
        assert!(params.target.is_none());

        let settings = Settings::with_home("/Users/ci");
        assert_eq!(BuildParams::default().config_or_default(&settings), "Debug");
        assert_eq!(params.sdk_or_default(&settings), "iphoneos");
    }

    #[test]
    fn test_resign_params_precedence() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        let preset = config.preset("adhoc").unwrap().unwrap();

        let params = ResignParams {
            profile: Some("Explicit".into()),
            ..Default::default()
        }
        .with_preset(&preset);

        assert_eq!(params.profile.as_deref(), Some("Explicit"));
        assert_eq!(params.ipa, Some(PathBuf::from("App.ipa")));
        assert_eq!(params.bundle_id.as_deref(), Some("com.example.adhoc"));
        assert!(params.overwrite.is_none());
    }

    #[test]
    fn test_load_missing_config() {
        let err = ConfigFile::load("/nonexistent/.fox").unwrap_err();
        assert!(err.is_not_found());
        assert!(ConfigFile::load_or_default("/nonexistent/.fox").is_ok());
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel/path"), PathBuf::from("rel/path"));
    }
}
