//! Error types for fox operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure a build
//! or resign run can hit: missing inputs, unresolvable profiles, malformed
//! archives, failing external tools and invalid configuration.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use crate::resign::ResignStage;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Error type for fox operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
/// Match on variants to handle specific failure cases.
///
/// # Examples
///
/// ```no_run
/// use fox::{Error, ProfileStore, Settings};
///
/// let settings = Settings::from_home();
/// let store = ProfileStore::new(&settings);
/// match store.resolve("MyDistProfile", true) {
///     Ok(profile) => println!("{}", profile.unique_id),
///     Err(Error::ProfileNotFound(reference)) => eprintln!("no profile named {reference}"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// A required input (archive, profile, project, keychain) does not exist.
    #[error("{kind} not found: {}", path.display())]
    InputNotFound {
        /// What kind of input was expected.
        kind: &'static str,
        /// The path that was looked up.
        path: PathBuf,
    },

    /// No provisioning profile matched the reference.
    ///
    /// Raised when a reference is neither an existing path nor the name
    /// (or pattern) of a profile in the profile directory.
    #[error("no provisioning profile matches '{0}'")]
    ProfileNotFound(String),

    /// A provisioning profile could not be decoded or lacks a required key.
    #[error("Invalid provisioning profile: {0}")]
    InvalidProfile(String),

    /// The archive or build output does not have the expected shape.
    ///
    /// Covers a missing or duplicated `.app` under `Payload/`, a missing
    /// `_CodeSignature` directory and missing build settings keys.
    #[error("Structural integrity violation: {0}")]
    StructuralIntegrity(String),

    /// An external tool exited with a non-zero status.
    ///
    /// `output` holds everything the tool printed, untouched.
    #[error("`{command}` failed with {status}:\n{output}")]
    ExternalTool {
        /// The masked command line.
        command: String,
        /// Exit status of the child process.
        status: ExitStatus,
        /// Verbatim tool output.
        output: String,
    },

    /// An external tool could not be started at all.
    #[error("failed to run {program}: {source}")]
    ToolSpawn {
        /// Program that was being spawned.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid or incomplete pipeline configuration.
    ///
    /// Always raised before any external process is spawned.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The output path already exists and overwriting was not requested.
    #[error("output {} already exists (pass --overwrite to replace it)", .0.display())]
    OutputExists(PathBuf),

    /// A resign pipeline stage failed.
    ///
    /// Wraps the underlying error together with the stage that produced it.
    #[error("resign failed during {stage}: {source}")]
    Resign {
        /// The stage that was executing.
        stage: ResignStage,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Property list parsing failed.
    ///
    /// Failed to parse `Info.plist`, entitlements, or a profile payload.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    ///
    /// Occurs during IPA extraction or creation. See [`crate::ipa`] module.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Directory traversal failed while packing.
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// The configuration file is not valid TOML.
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error means "the thing you asked for is not there".
    ///
    /// Used by the CLI to render missing directories as a plain message.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::InputNotFound { .. } | Error::ProfileNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Resign { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping any resign stage context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Resign { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn not_found(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        Error::InputNotFound {
            kind,
            path: path.into(),
        }
    }
}
