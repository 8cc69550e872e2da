//! Build, package and re-sign iOS application archives.
//!
//! The heavy lifting is done by Apple's tools (`xcodebuild`, `codesign`,
//! `security`); this crate drives them, resolves provisioning profiles by
//! name, and reads and writes IPA archives in-process.
//!
//! - [`Resigner`] re-signs an existing IPA with another profile.
//! - [`BuildPipeline`] builds a workspace or project and packages the result.
//! - [`ProfileStore`] and [`Keychains`] manage installed profiles and keychains.

pub mod build;
pub mod bundle;
pub mod command;
pub mod config;
pub mod entitlements;
pub mod error;
pub mod ipa;
pub mod keychain;
pub mod profile;
pub mod resign;
pub mod signing;
pub mod template;

pub use build::{BuildOutput, BuildPipeline, Packaging};
pub use command::ToolCommand;
pub use config::{BuildParams, ConfigFile, Preset, ResignParams, Settings};
pub use error::Error;
pub use ipa::{CompressionLevel, WorkingTree};
pub use keychain::{Keychains, UnlockedKeychain};
pub use profile::{EmbeddedPlist, ProfileDecoder, ProfileStore, ProvisioningProfile, SecurityCms};
pub use resign::{ResignOptions, ResignStage, Resigner};
pub use signing::{CodeSigner, Codesign, SigningRequest};

pub type Result<T> = std::result::Result<T, Error>;
