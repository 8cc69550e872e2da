//! Invocation of the external code signing tool.
//!
//! Signing itself is not implemented here. A [`SigningRequest`] gathers the
//! resolved inputs and a [`CodeSigner`] carries them out; [`Codesign`] does
//! so by running Apple's `codesign`.

use crate::command::ToolCommand;
use crate::Result;
use std::ffi::OsString;
use std::path::PathBuf;

/// Resolved inputs of one signing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// Bundle to sign.
    pub bundle_path: PathBuf,
    /// Signing identity (certificate common name or hash).
    pub identity: String,
    /// Entitlements plist to embed.
    pub entitlements_path: PathBuf,
    /// Keychain to search for the identity.
    pub keychain: Option<PathBuf>,
    /// Legacy `ResourceRules.plist`.
    pub resource_rules: Option<PathBuf>,
}

impl SigningRequest {
    /// The `codesign` invocation for this request.
    pub fn command(&self, program: impl Into<OsString>) -> ToolCommand {
        let mut cmd = ToolCommand::new(program.into())
            .arg("-f")
            .arg("-s")
            .arg(&self.identity);

        if let Some(ref rules) = self.resource_rules {
            cmd = cmd.arg("--resource-rules").arg(rules);
        }
        cmd = cmd.arg("--entitlements").arg(&self.entitlements_path);
        if let Some(ref keychain) = self.keychain {
            cmd = cmd.arg("--keychain").arg(keychain);
        }

        cmd.arg(&self.bundle_path)
    }
}

/// Carries out a [`SigningRequest`].
pub trait CodeSigner {
    /// Sign the bundle and return the tool's output verbatim.
    fn sign(&self, request: &SigningRequest) -> Result<String>;
}

/// Signs with Apple's `codesign` tool.
#[derive(Debug, Clone)]
pub struct Codesign {
    program: OsString,
}

impl Codesign {
    /// Use `codesign` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: OsString::from("codesign"),
        }
    }

    /// Use a specific `codesign` binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Codesign {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSigner for Codesign {
    fn sign(&self, request: &SigningRequest) -> Result<String> {
        request.command(self.program.clone()).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SigningRequest {
        SigningRequest {
            bundle_path: PathBuf::from("/tmp/fox-x/Payload/App.app"),
            identity: "iPhone Distribution: Example".into(),
            entitlements_path: PathBuf::from("/tmp/fox-x/entitlements.plist"),
            keychain: None,
            resource_rules: None,
        }
    }

    #[test]
    fn test_minimal_command() {
        let args = request().command("codesign").display_args();
        assert_eq!(
            args,
            vec![
                "-f",
                "-s",
                "iPhone Distribution: Example",
                "--entitlements",
                "/tmp/fox-x/entitlements.plist",
                "/tmp/fox-x/Payload/App.app",
            ]
        );
    }

    #[test]
    fn test_full_command() {
        let request = SigningRequest {
            keychain: Some(PathBuf::from("/Users/ci/Library/Keychains/ci.keychain")),
            resource_rules: Some(PathBuf::from("/tmp/fox-x/Payload/App.app/ResourceRules.plist")),
            ..request()
        };
        let args = request.command("codesign").display_args();

        assert_eq!(args[3], "--resource-rules");
        assert_eq!(args[5], "--entitlements");
        assert_eq!(args[7], "--keychain");
        assert_eq!(args.last().unwrap(), "/tmp/fox-x/Payload/App.app");
    }

    #[test]
    #[cfg(unix)]
    fn test_codesign_failure_is_fatal() {
        // `false` ignores its arguments and exits 1
        let err = Codesign::with_program("false").sign(&request()).unwrap_err();
        assert!(matches!(err, crate::Error::ExternalTool { .. }));
    }
}
