//! Typed external command invocation.
//!
//! Every external tool (build tool, signing tool, packager, keychain utility)
//! is driven through a [`ToolCommand`]: an ordered list of arguments in which
//! secrets are marked as such. Arguments are handed to the child as a vector,
//! so no shell ever sees them; quoting only happens when the command line is
//! rendered for logs, and secret arguments render as `********`.

use crate::{Error, Result};
use log::info;
use secrecy::{ExposeSecret, SecretString};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const MASK: &str = "********";

#[derive(Clone)]
enum CommandArg {
    Plain(OsString),
    Secret(SecretString),
}

/// An external command with an ordered argument list.
#[derive(Clone)]
pub struct ToolCommand {
    program: OsString,
    args: Vec<CommandArg>,
    dir: Option<PathBuf>,
}

impl ToolCommand {
    /// Start building an invocation of `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            dir: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(CommandArg::Plain(arg.as_ref().to_os_string()));
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Append an argument that must never appear in logs.
    pub fn secret_arg(mut self, secret: &SecretString) -> Self {
        self.args.push(CommandArg::Secret(secret.clone()));
        self
    }

    /// Run the child in `dir` instead of the current directory.
    ///
    /// Only the child's working directory changes; the caller's is untouched.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program name as passed to [`ToolCommand::new`].
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments as displayed in logs (secrets masked).
    pub fn display_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                CommandArg::Plain(s) => s.to_string_lossy().into_owned(),
                CommandArg::Secret(_) => MASK.to_string(),
            })
            .collect()
    }

    fn expression(&self) -> duct::Expression {
        let args: Vec<OsString> = self
            .args
            .iter()
            .map(|arg| match arg {
                CommandArg::Plain(s) => s.clone(),
                CommandArg::Secret(s) => OsString::from(s.expose_secret()),
            })
            .collect();

        let expression = duct::cmd(&self.program, args).unchecked();
        match self.dir {
            Some(ref dir) => expression.dir(dir),
            None => expression,
        }
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::ToolSpawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        }
    }

    /// Run to completion, echoing merged stdout/stderr line by line.
    ///
    /// Returns everything the tool printed. A non-zero exit is an
    /// [`Error::ExternalTool`] carrying that same output.
    pub fn run(&self) -> Result<String> {
        info!("{}", self);

        let reader = self
            .expression()
            .stderr_to_stdout()
            .reader()
            .map_err(|e| self.spawn_error(e))?;

        let mut output = String::new();
        {
            let buffered = BufReader::new(&reader);
            for line in buffered.split(b'\n') {
                let line = line?;
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches('\r');
                info!("{}", line);
                output.push_str(&line);
                output.push('\n');
            }
        }

        let status = match reader.try_wait()? {
            Some(finished) => finished.status,
            None => {
                return Err(Error::Io(std::io::Error::other(format!(
                    "{} did not exit after closing its output",
                    self.program.to_string_lossy()
                ))))
            }
        };

        if !status.success() {
            return Err(Error::ExternalTool {
                command: self.to_string(),
                status,
                output,
            });
        }

        Ok(output)
    }

    /// Run to completion and return stdout without echoing it.
    ///
    /// On failure the error carries stdout followed by stderr.
    pub fn capture(&self) -> Result<String> {
        info!("{}", self);

        let result = self
            .expression()
            .stdout_capture()
            .stderr_capture()
            .run()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
        if !result.status.success() {
            let mut output = stdout;
            output.push_str(&String::from_utf8_lossy(&result.stderr));
            return Err(Error::ExternalTool {
                command: self.to_string(),
                status: result.status,
                output,
            });
        }

        Ok(stdout)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program.to_string_lossy();
        let mut words = vec![quote(&program)];
        words.extend(self.display_args().iter().map(|arg| quote(arg)));
        write!(f, "{}", words.join(" "))
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("command", &self.to_string())
            .field("dir", &self.dir)
            .finish()
    }
}

fn quote(word: &str) -> String {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| format!("{word:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_arguments() {
        let cmd = ToolCommand::new("codesign")
            .arg("-f")
            .arg("-s")
            .arg("iPhone Distribution: Example")
            .arg("/tmp/Payload/My App.app");

        let words = shlex::split(&cmd.to_string()).unwrap();
        assert_eq!(
            words,
            vec![
                "codesign",
                "-f",
                "-s",
                "iPhone Distribution: Example",
                "/tmp/Payload/My App.app"
            ]
        );
    }

    #[test]
    fn test_display_masks_secrets() {
        let password = SecretString::new("s3cr3t pass".to_string());
        let cmd = ToolCommand::new("security")
            .args(["unlock-keychain", "-p"])
            .secret_arg(&password)
            .arg("/Users/ci/Library/Keychains/ci.keychain");

        let rendered = cmd.to_string();
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("********"));
        assert!(!format!("{cmd:?}").contains("s3cr3t"));
        assert_eq!(cmd.display_args()[2], "********");
    }

    #[test]
    #[cfg(unix)]
    fn test_run_returns_output() {
        let output = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo signed; echo warning >&2")
            .run()
            .unwrap();
        assert!(output.contains("signed\n"));
        assert!(output.contains("warning\n"));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_nonzero_exit_keeps_output() {
        let err = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo 'no identity found'; exit 3")
            .run()
            .unwrap_err();

        match err {
            Error::ExternalTool { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(output, "no identity found\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_run_non_utf8_output_is_kept() {
        let err = ToolCommand::new("sh")
            .arg("-c")
            .arg(r"printf '\377bad signature\n'; exit 1")
            .run()
            .unwrap_err();

        match err {
            Error::ExternalTool { output, .. } => {
                assert_eq!(output, "\u{FFFD}bad signature\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_capture_and_current_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), b"").unwrap();

        let before = std::env::current_dir().unwrap();
        let output = ToolCommand::new("ls").current_dir(dir.path()).capture().unwrap();
        assert_eq!(output.trim(), "marker");
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn test_spawn_failure() {
        let err = ToolCommand::new("/nonexistent/tool-xyz").run().unwrap_err();
        assert!(matches!(err, Error::ToolSpawn { .. }));
    }
}
