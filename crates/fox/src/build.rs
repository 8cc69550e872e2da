//! Building an IPA from an Xcode workspace or project.
//!
//! [`BuildPipeline`] asks `xcodebuild` for the build settings of the
//! requested target, builds it, and packages the product either with
//! `xcrun PackageApplication` or by sending the built bundle through the
//! resign stages. An optional keychain is unlocked around the build and
//! packaging calls only, and an optional dSYM archive is written beside the
//! IPA.

use crate::bundle::{self, BundleInfo};
use crate::command::ToolCommand;
use crate::config::{expand_tilde, BuildParams, Settings};
use crate::ipa::{self, CompressionLevel, WorkingTree};
use crate::keychain::Keychains;
use crate::profile::ProfileStore;
use crate::resign::{ResignOptions, Resigner};
use crate::template::OutputVars;
use crate::{Error, Result};
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Build setting naming the directory the product is written to.
pub const BUILT_PRODUCTS_DIR: &str = "BUILT_PRODUCTS_DIR";
/// Build setting naming the product, e.g. `App.app`.
pub const FULL_PRODUCT_NAME: &str = "FULL_PRODUCT_NAME";
/// Build setting with the product's `Info.plist`, relative to
/// [`BUILT_PRODUCTS_DIR`].
pub const INFOPLIST_PATH: &str = "INFOPLIST_PATH";
/// Build setting with the UUID of the profile the target is set up with.
pub const PROVISIONING_PROFILE: &str = "PROVISIONING_PROFILE";

/// How a built application becomes an IPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Packaging {
    /// `xcrun PackageApplication`.
    #[default]
    PackageApplication,
    /// Copy the bundle into a working tree and resign it in-process.
    Resign,
}

fn settings_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s+.*( = ).*").expect("settings pattern is valid"))
}

/// Parse the `KEY = VALUE` lines of `xcodebuild -showBuildSettings`.
///
/// Only indented lines are considered. The value is the text between the
/// first and second `=`, trimmed.
pub fn parse_build_settings(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter(|line| settings_line().is_match(line))
        .filter_map(|line| {
            let mut parts = line.split('=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// `xcodebuild` arguments selecting what to build.
///
/// A workspace needs a scheme; a project takes a target or a scheme.
pub fn target_args(
    workspace: Option<&Path>,
    scheme: Option<&str>,
    project: Option<&Path>,
    target: Option<&str>,
) -> Result<Vec<OsString>> {
    let mut args: Vec<OsString> = Vec::new();

    if let Some(workspace) = workspace {
        let scheme = scheme
            .ok_or_else(|| Error::Config("a scheme is required when building a workspace".into()))?;
        args.push("-workspace".into());
        args.push(workspace.into());
        args.push("-scheme".into());
        args.push(scheme.into());
    } else if let Some(project) = project {
        args.push("-project".into());
        args.push(project.into());
        match (target, scheme) {
            (Some(target), _) => {
                args.push("-target".into());
                args.push(target.into());
            }
            (None, Some(scheme)) => {
                args.push("-scheme".into());
                args.push(scheme.into());
            }
            (None, None) => {
                return Err(Error::Config(
                    "a target or scheme is required when building a project".into(),
                ))
            }
        }
    } else {
        return Err(Error::Config(
            "either a workspace or a project is required".into(),
        ));
    }

    Ok(args)
}

/// Build settings of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSettings {
    values: BTreeMap<String, String>,
}

impl BuildSettings {
    /// Parse `xcodebuild -showBuildSettings` output.
    pub fn parse(output: &str) -> Self {
        Self {
            values: parse_build_settings(output),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// A setting the build cannot be packaged without.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::StructuralIntegrity(format!("build settings have no {key}")))
    }

    pub fn built_products_dir(&self) -> Result<PathBuf> {
        self.require(BUILT_PRODUCTS_DIR).map(PathBuf::from)
    }

    /// Path of the built `.app`.
    pub fn product_path(&self) -> Result<PathBuf> {
        Ok(self.built_products_dir()?.join(self.require(FULL_PRODUCT_NAME)?))
    }

    pub fn info_plist_path(&self) -> Result<PathBuf> {
        Ok(self.built_products_dir()?.join(self.require(INFOPLIST_PATH)?))
    }

    /// UUID of the configured profile, if set and not blank.
    pub fn provisioning_profile(&self) -> Option<&str> {
        self.get(PROVISIONING_PROFILE)
            .map(str::trim)
            .filter(|uuid| !uuid.is_empty())
    }
}

/// Files written by a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub ipa: PathBuf,
    pub dsym: Option<PathBuf>,
}

/// Drives `xcodebuild` and packaging.
pub struct BuildPipeline {
    settings: Settings,
    store: ProfileStore,
    keychains: Keychains,
    resigner: Resigner,
    xcodebuild: ToolCommand,
    xcrun: ToolCommand,
    compression: CompressionLevel,
}

impl BuildPipeline {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            store: ProfileStore::new(settings),
            keychains: Keychains::new(settings),
            resigner: Resigner::new(settings),
            xcodebuild: ToolCommand::new("xcodebuild"),
            xcrun: ToolCommand::new("xcrun"),
            compression: CompressionLevel::DEFAULT,
        }
    }

    pub fn with_store(mut self, store: ProfileStore) -> Self {
        self.store = store;
        self
    }

    /// Resigner used for [`Packaging::Resign`].
    pub fn with_resigner(mut self, resigner: Resigner) -> Self {
        self.resigner = resigner;
        self
    }

    /// Base command for `xcodebuild`; pipeline arguments are appended to it.
    pub fn with_xcodebuild(mut self, command: ToolCommand) -> Self {
        self.xcodebuild = command;
        self
    }

    /// Base command for `xcrun`; pipeline arguments are appended to it.
    pub fn with_xcrun(mut self, command: ToolCommand) -> Self {
        self.xcrun = command;
        self
    }

    pub fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    /// Build, package and optionally archive debug symbols.
    pub fn run(&self, params: &BuildParams) -> Result<BuildOutput> {
        let targets = target_args(
            params.workspace.as_deref(),
            params.scheme.as_deref(),
            params.project.as_deref(),
            params.target.as_deref(),
        )?;
        let packaging = params.packaging.unwrap_or_default();
        if packaging == Packaging::Resign && params.identity.is_none() {
            return Err(Error::Config(
                "a signing identity is required to package by resigning".into(),
            ));
        }
        let config = params.config_or_default(&self.settings);
        let sdk = params.sdk_or_default(&self.settings);

        let keychain = match (params.keychain.as_deref(), params.keychain_password.is_some()) {
            (Some(name), _) => Some(self.keychains.resolve(name)?),
            (None, true) => Some(self.keychains.login_keychain()),
            (None, false) => None,
        };

        let profile_path = match params.profile {
            Some(ref reference) => Some(self.store.resolve_path(reference, true)?),
            None => None,
        };

        let mut build_args: Vec<OsString> = vec!["-sdk".into(), sdk.clone().into()];
        if params.clean.unwrap_or(false) {
            build_args.push("clean".into());
        }
        build_args.push("build".into());
        build_args.push("-configuration".into());
        build_args.push(config.clone().into());
        build_args.extend(targets);
        if let Some(ref identity) = params.identity {
            build_args.push(format!("CODE_SIGN_IDENTITY={identity}").into());
        }
        if let Some(ref keychain) = keychain {
            build_args.push(format!("OTHER_CODE_SIGN_FLAGS=--keychain={}", keychain.display()).into());
        }
        if let Some(ref build_dir) = params.build_dir {
            let build_dir = expand_tilde(build_dir);
            fs::create_dir_all(&build_dir)?;
            build_args.push(format!("SYMROOT={}", fs::canonicalize(&build_dir)?.display()).into());
        }
        if let Some(ref path) = profile_path {
            let uuid = self.store.uuid(path)?;
            build_args.push(format!("PROVISIONING_PROFILE={uuid}").into());
        }

        let report = self
            .xcodebuild
            .clone()
            .arg("-showBuildSettings")
            .args(&build_args)
            .capture()?;
        let build_settings = BuildSettings::parse(&report);

        let profile_path = match profile_path {
            Some(path) => path,
            None => {
                let uuid = build_settings.provisioning_profile().ok_or_else(|| {
                    Error::ProfileNotFound(format!("{PROVISIONING_PROFILE} build setting"))
                })?;
                self.store.path_for_uuid(uuid)
            }
        };
        if !profile_path.is_file() {
            return Err(Error::not_found("provisioning profile", profile_path));
        }

        // Unlocked for the build and packaging calls only
        let unlocked = match (keychain.as_deref(), params.keychain_password.as_ref()) {
            (Some(keychain), Some(password)) => {
                self.keychains.add_to_search_list(keychain)?;
                Some(self.keychains.unlocked(keychain, password)?)
            }
            _ => None,
        };

        self.xcodebuild.clone().args(&build_args).run()?;

        let product_path = build_settings.product_path()?;
        let info = BundleInfo::read_plist(build_settings.info_plist_path()?)?;
        let vars = OutputVars {
            app_name: bundle::app_name(&product_path),
            marketing_version: info.marketing_version.unwrap_or_default(),
            build_version: info.build_version.unwrap_or_default(),
            config,
        };
        let output = ipa::resolve_output(
            params.output.as_deref().unwrap_or("."),
            &self.settings.ipa_output_template,
            &vars,
        )?;
        let output = absolute(&output)?;
        let overwrite = params.overwrite.unwrap_or(false);
        ipa::check_output(&output, overwrite)?;
        let dsym_output = match params.dsym {
            Some(true) => {
                let dest = dsym_archive_path(&output);
                ipa::check_output(&dest, overwrite)?;
                Some(dest)
            }
            _ => None,
        };

        if let Some(ref unlocked) = unlocked {
            unlocked.refresh()?;
        }

        match packaging {
            Packaging::PackageApplication => {
                self.package_application(&sdk, &product_path, &profile_path, params, &output)?
            }
            Packaging::Resign => {
                self.package_by_resigning(&product_path, &profile_path, keychain, params, &output)?
            }
        }
        drop(unlocked);
        info!("wrote {}", output.display());

        let dsym = match dsym_output {
            Some(dest) => Some(self.archive_dsym(&build_settings, dest)?),
            None => None,
        };

        Ok(BuildOutput { ipa: output, dsym })
    }

    fn package_application(
        &self,
        sdk: &str,
        product_path: &Path,
        profile_path: &Path,
        params: &BuildParams,
        output: &Path,
    ) -> Result<()> {
        let mut cmd = self
            .xcrun
            .clone()
            .arg("-v")
            .arg("-sdk")
            .arg(sdk)
            .arg("PackageApplication")
            .arg(product_path)
            .arg("--embed")
            .arg(profile_path);
        if let Some(ref identity) = params.identity {
            cmd = cmd.arg("--sign").arg(identity);
        }
        cmd.run()?;

        let packaged = product_path.with_extension("ipa");
        if !packaged.is_file() {
            return Err(Error::StructuralIntegrity(format!(
                "PackageApplication did not produce {}",
                packaged.display()
            )));
        }
        move_file(&packaged, output)
    }

    fn package_by_resigning(
        &self,
        product_path: &Path,
        profile_path: &Path,
        keychain: Option<PathBuf>,
        params: &BuildParams,
        output: &Path,
    ) -> Result<()> {
        let identity = params
            .identity
            .clone()
            .ok_or_else(|| Error::Config("a signing identity is required".into()))?;

        let tree = WorkingTree::stage_bundle(product_path)?;
        // The built bundle already carries its identifier
        let bundle_id = BundleInfo::read(tree.app_bundle())?.identifier;
        let options = ResignOptions {
            keychain,
            bundle_id,
            allow_unsigned: true,
            pattern_match: false,
            ..ResignOptions::new(profile_path.to_string_lossy(), identity)
        };
        self.resigner.resign_tree(&tree, &options)?;
        ipa::pack(&tree, output, self.compression)?;
        tree.close()
    }

    /// Zip `<product>.dSYM` to `dest`.
    fn archive_dsym(&self, build_settings: &BuildSettings, dest: PathBuf) -> Result<PathBuf> {
        let base = build_settings.built_products_dir()?;
        let dsym_name = format!("{}.dSYM", build_settings.require(FULL_PRODUCT_NAME)?);
        if !base.join(&dsym_name).exists() {
            return Err(Error::not_found("dSYM", base.join(&dsym_name)));
        }

        ipa::write_archive(&base, &[Path::new(&dsym_name)], &dest, self.compression)?;
        debug!("wrote {}", dest.display());
        Ok(dest)
    }
}

/// `<ipa stem>.dSYM.zip` beside the IPA.
fn dsym_archive_path(ipa_path: &Path) -> PathBuf {
    let stem = ipa_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    ipa_path.with_file_name(format!("{stem}.dSYM.zip"))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Move a file, copying when source and destination are on different
/// filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REPORT: &str = "\
Build settings for action build and target App:
    ACTION = build
    BUILT_PRODUCTS_DIR = /tmp/build/Release-iphoneos
    FULL_PRODUCT_NAME = App.app
    INFOPLIST_PATH = App.app/Info.plist
    OTHER_LDFLAGS = -ObjC -framework=UIKit
    PROVISIONING_PROFILE = \n\
NOT_INDENTED = ignored
    no separator here
";

    #[test]
    fn test_parse_build_settings() {
        let settings = parse_build_settings(REPORT);

        assert_eq!(settings.get("ACTION").map(String::as_str), Some("build"));
        assert_eq!(
            settings.get(BUILT_PRODUCTS_DIR).map(String::as_str),
            Some("/tmp/build/Release-iphoneos")
        );
        // Second `=` ends the value
        assert_eq!(
            settings.get("OTHER_LDFLAGS").map(String::as_str),
            Some("-ObjC -framework")
        );
        assert!(!settings.contains_key("NOT_INDENTED"));
        assert_eq!(settings.len(), 6);
    }

    #[test]
    fn test_build_settings_accessors() {
        let settings = BuildSettings::parse(REPORT);

        assert_eq!(
            settings.product_path().unwrap(),
            PathBuf::from("/tmp/build/Release-iphoneos/App.app")
        );
        assert_eq!(
            settings.info_plist_path().unwrap(),
            PathBuf::from("/tmp/build/Release-iphoneos/App.app/Info.plist")
        );
        assert_eq!(settings.provisioning_profile(), None);

        let err = BuildSettings::default().product_path().unwrap_err();
        assert!(matches!(err, Error::StructuralIntegrity(_)));
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_target_args() {
        let args = target_args(Some(Path::new("App.xcworkspace")), Some("App"), None, None).unwrap();
        assert_eq!(strings(args), ["-workspace", "App.xcworkspace", "-scheme", "App"]);

        let args = target_args(None, None, Some(Path::new("App.xcodeproj")), Some("App")).unwrap();
        assert_eq!(strings(args), ["-project", "App.xcodeproj", "-target", "App"]);

        let args = target_args(None, Some("App"), Some(Path::new("App.xcodeproj")), None).unwrap();
        assert_eq!(strings(args), ["-project", "App.xcodeproj", "-scheme", "App"]);
    }

    #[test]
    fn test_target_args_errors() {
        let err = target_args(Some(Path::new("App.xcworkspace")), None, None, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = target_args(None, None, Some(Path::new("App.xcodeproj")), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = target_args(None, Some("App"), None, Some("App")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_packaging_deserializes() {
        #[derive(Deserialize)]
        struct Doc {
            packaging: Packaging,
        }
        let doc: Doc = toml::from_str("packaging = \"package-application\"").unwrap();
        assert_eq!(doc.packaging, Packaging::PackageApplication);
        let doc: Doc = toml::from_str("packaging = \"resign\"").unwrap();
        assert_eq!(doc.packaging, Packaging::Resign);
    }

    #[test]
    fn test_invalid_target_fails_before_spawning() {
        let dir = TempDir::new().unwrap();
        let pipeline = BuildPipeline::new(&Settings::with_home(dir.path()))
            .with_xcodebuild(ToolCommand::new("/no/such/xcodebuild"));

        let err = pipeline.run(&BuildParams::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_move_file() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("App.ipa");
        fs::write(&from, b"IPA").unwrap();
        let to = dir.path().join("out/Renamed.ipa");

        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(to).unwrap(), b"IPA");
    }
}
