//! Re-signing of an existing IPA with a different provisioning profile.
//!
//! A run walks the bundle through a fixed sequence of [`ResignStage`]s, each
//! a single mutation of the extracted working tree:
//!
//! ```text
//! extract -> strip signature -> replace profile -> trust metadata
//!         -> reconcile identifier -> reconcile entitlements -> sign -> pack
//! ```
//!
//! The first failing stage aborts the run; the error names that stage and the
//! working tree is removed on every exit path.
//!
//! # Examples
//!
//! ```no_run
//! use fox::{ResignParams, Resigner, Settings};
//!
//! let settings = Settings::from_home();
//! let params = ResignParams {
//!     ipa: Some("App.ipa".into()),
//!     profile: Some("MyDistProfile".into()),
//!     identity: Some("iPhone Distribution: Example".into()),
//!     output: Some("Resigned.ipa".into()),
//!     ..Default::default()
//! };
//! let output = Resigner::new(&settings).run(&params)?;
//! println!("{}", output.display());
//! # Ok::<(), fox::Error>(())
//! ```

use crate::bundle::{self, BundleInfo};
use crate::config::{ResignParams, Settings};
use crate::entitlements;
use crate::ipa::{self, CompressionLevel, WorkingTree};
use crate::keychain::Keychains;
use crate::profile::{ProfileDecoder, ProfileStore, ProvisioningProfile, SecurityCms};
use crate::signing::{CodeSigner, Codesign, SigningRequest};
use crate::template::OutputVars;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Signature directory inside an application bundle.
pub const CODE_SIGNATURE_DIR: &str = "_CodeSignature";

/// The profile embedded in an application bundle.
pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";

/// Legacy resource rules shipped inside older bundles.
pub const RESOURCE_RULES: &str = "ResourceRules.plist";

const SYNTHESIZED_ENTITLEMENTS: &str = "entitlements.plist";

/// One step of the resign pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResignStage {
    Extract,
    StripSignature,
    ReplaceProfile,
    TrustMetadata,
    ReconcileIdentifier,
    ReconcileEntitlements,
    Sign,
    Pack,
}

impl fmt::Display for ResignStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResignStage::Extract => "extract",
            ResignStage::StripSignature => "strip signature",
            ResignStage::ReplaceProfile => "replace profile",
            ResignStage::TrustMetadata => "trust metadata",
            ResignStage::ReconcileIdentifier => "reconcile identifier",
            ResignStage::ReconcileEntitlements => "reconcile entitlements",
            ResignStage::Sign => "sign",
            ResignStage::Pack => "pack",
        };
        f.write_str(name)
    }
}

/// Run one stage, attaching the stage to any error.
fn stage<T>(stage: ResignStage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    debug!("resign stage: {}", stage);
    f().map_err(|source| {
        error!("resign failed during {}: {}", stage, source);
        Error::Resign {
            stage,
            source: Box::new(source),
        }
    })
}

/// Resolved options for the stages that mutate a working tree.
#[derive(Debug, Clone)]
pub struct ResignOptions {
    /// Profile reference: a path, a name or a name pattern.
    pub profile: String,
    pub identity: String,
    pub keychain: Option<PathBuf>,
    /// Explicit bundle identifier; derived from the profile when unset.
    pub bundle_id: Option<String>,
    /// Entitlements file used as-is; synthesized from the profile when unset.
    pub entitlements: Option<PathBuf>,
    pub resource_rules: Option<PathBuf>,
    pub narrow_keychain_groups: bool,
    /// Tolerate a bundle without `_CodeSignature`.
    pub allow_unsigned: bool,
    pub pattern_match: bool,
}

impl ResignOptions {
    /// Options with defaults for everything but the profile and identity.
    pub fn new(profile: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            identity: identity.into(),
            keychain: None,
            bundle_id: None,
            entitlements: None,
            resource_rules: None,
            narrow_keychain_groups: true,
            allow_unsigned: false,
            pattern_match: true,
        }
    }
}

/// Drives the resign pipeline.
pub struct Resigner {
    settings: Settings,
    store: ProfileStore,
    keychains: Keychains,
    decoder: Box<dyn ProfileDecoder>,
    signer: Box<dyn CodeSigner>,
    compression: CompressionLevel,
}

impl Resigner {
    /// A resigner using `codesign` and `security cms` from `PATH`.
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            store: ProfileStore::new(settings),
            keychains: Keychains::new(settings),
            decoder: Box::new(SecurityCms),
            signer: Box::new(Codesign::new()),
            compression: CompressionLevel::DEFAULT,
        }
    }

    /// Resolve profile references against `store`.
    pub fn with_store(mut self, store: ProfileStore) -> Self {
        self.store = store;
        self
    }

    /// Decode the embedded profile with `decoder`.
    pub fn with_decoder(mut self, decoder: impl ProfileDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Sign with `signer`.
    pub fn with_signer(mut self, signer: impl CodeSigner + 'static) -> Self {
        self.signer = Box::new(signer);
        self
    }

    pub fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resign `params.ipa` and return the path of the written archive.
    ///
    /// Missing required parameters are reported before anything is touched.
    /// An existing output is refused before the bundle is signed unless
    /// `overwrite` is set.
    pub fn run(&self, params: &ResignParams) -> Result<PathBuf> {
        let ipa_path = params
            .ipa
            .as_deref()
            .ok_or_else(|| Error::Config("an IPA to resign is required".into()))?;
        let options = self.options(params)?;

        let tree = stage(ResignStage::Extract, || WorkingTree::extract(ipa_path))?;

        // Output is settled before anything is signed
        let output = stage(ResignStage::Pack, || {
            let vars = self.output_vars(tree.app_bundle(), params.config.as_deref())?;
            let output = ipa::resolve_output(
                params.output.as_deref().unwrap_or("."),
                &self.settings.ipa_output_template,
                &vars,
            )?;
            ipa::check_output(&output, params.overwrite.unwrap_or(false))?;
            Ok(output)
        })?;

        self.resign_tree(&tree, &options)?;
        stage(ResignStage::Pack, || ipa::pack(&tree, &output, self.compression))?;
        tree.close()?;

        info!("resigned {} -> {}", ipa_path.display(), output.display());
        Ok(output)
    }

    /// Merge invocation parameters into resolved options.
    fn options(&self, params: &ResignParams) -> Result<ResignOptions> {
        let profile = params
            .profile
            .clone()
            .ok_or_else(|| Error::Config("a provisioning profile is required".into()))?;
        let identity = params
            .identity
            .clone()
            .ok_or_else(|| Error::Config("a signing identity is required".into()))?;
        let keychain = params
            .keychain
            .as_deref()
            .map(|name| self.keychains.resolve(name))
            .transpose()?;

        Ok(ResignOptions {
            keychain,
            bundle_id: params.bundle_id.clone(),
            entitlements: params.entitlements.clone(),
            resource_rules: params.resource_rules.clone(),
            narrow_keychain_groups: params.narrow_keychain_groups.unwrap_or(true),
            allow_unsigned: params.allow_unsigned.unwrap_or(false),
            pattern_match: params.pattern_match.unwrap_or(true),
            ..ResignOptions::new(profile, identity)
        })
    }

    fn output_vars(&self, bundle_path: &Path, config: Option<&str>) -> Result<OutputVars> {
        let info = BundleInfo::read(bundle_path)?;
        Ok(OutputVars {
            app_name: bundle::app_name(bundle_path),
            marketing_version: info.marketing_version.unwrap_or_default(),
            build_version: info.build_version.unwrap_or_default(),
            config: config.unwrap_or(&self.settings.build_config).to_string(),
        })
    }

    /// Run every stage from signature removal through signing on `tree`.
    ///
    /// Returns the profile the bundle was signed with.
    pub fn resign_tree(
        &self,
        tree: &WorkingTree,
        options: &ResignOptions,
    ) -> Result<ProvisioningProfile> {
        let bundle_path = tree.app_bundle();

        stage(ResignStage::StripSignature, || {
            strip_signature(bundle_path, options.allow_unsigned)
        })?;

        let embedded = stage(ResignStage::ReplaceProfile, || {
            let source = self
                .store
                .resolve_path(&options.profile, options.pattern_match)?;
            replace_profile(bundle_path, &source)
        })?;

        let profile = stage(ResignStage::TrustMetadata, || {
            ProvisioningProfile::load(&embedded, self.decoder.as_ref())
        })?;
        debug!(
            "signing with profile '{}' ({}) of team {}",
            profile.display_name, profile.unique_id, profile.team_id
        );

        let bundle_id = stage(ResignStage::ReconcileIdentifier, || {
            let bundle_id = match options.bundle_id {
                Some(ref id) => id.clone(),
                None => profile.derived_bundle_id()?,
            };
            bundle::set_bundle_identifier(bundle_path, &bundle_id)?;
            Ok(bundle_id)
        })?;

        let entitlements_path = stage(ResignStage::ReconcileEntitlements, || {
            match options.entitlements {
                Some(ref path) if path.is_file() => Ok(path.clone()),
                Some(ref path) => Err(Error::not_found("entitlements", path)),
                None => {
                    let path = tree.scratch_path(SYNTHESIZED_ENTITLEMENTS);
                    let bytes = entitlements::synthesize(
                        &profile,
                        &bundle_id,
                        options.narrow_keychain_groups,
                    )?;
                    fs::write(&path, bytes)?;
                    Ok(path)
                }
            }
        })?;

        stage(ResignStage::Sign, || {
            let request = SigningRequest {
                bundle_path: bundle_path.to_path_buf(),
                identity: options.identity.clone(),
                entitlements_path,
                keychain: options.keychain.clone(),
                resource_rules: resource_rules(bundle_path, options.resource_rules.as_deref())?,
            };
            let output = self.signer.sign(&request)?;
            if !output.trim().is_empty() {
                debug!("signing tool output:\n{}", output);
            }
            Ok(())
        })?;

        Ok(profile)
    }
}

/// Remove the bundle's existing signature.
fn strip_signature(bundle_path: &Path, allow_unsigned: bool) -> Result<()> {
    let signature = bundle_path.join(CODE_SIGNATURE_DIR);
    if signature.is_dir() {
        fs::remove_dir_all(&signature)?;
        return Ok(());
    }

    if allow_unsigned {
        warn!("{} has no {}, continuing", bundle_path.display(), CODE_SIGNATURE_DIR);
        Ok(())
    } else {
        Err(Error::StructuralIntegrity(format!(
            "{} has no {} directory",
            bundle_path.display(),
            CODE_SIGNATURE_DIR
        )))
    }
}

/// Put the profile at `source` in place of the embedded one.
fn replace_profile(bundle_path: &Path, source: &Path) -> Result<PathBuf> {
    let embedded = bundle_path.join(EMBEDDED_PROFILE);
    // A link is removed, never written through
    if embedded.symlink_metadata().is_ok() {
        fs::remove_file(&embedded)?;
    } else {
        warn!("{} has no {}", bundle_path.display(), EMBEDDED_PROFILE);
    }
    fs::copy(source, &embedded)?;
    Ok(embedded)
}

/// Resource rules passed to the signing tool, if any.
fn resource_rules(bundle_path: &Path, explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) if path.is_file() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(Error::not_found("resource rules", path)),
        None => {
            let bundled = bundle_path.join(RESOURCE_RULES);
            Ok(bundled.is_file().then_some(bundled))
        }
    }
}
