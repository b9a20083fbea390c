//! Safe execution of the system tools the bridge drives.
//!
//! Every external program goes through [`SafeCommand`]: the program comes
//! from a fixed allowlist, arguments are validated and passed directly to
//! `execve` (never through `sh -c`), and privileged tools can be prefixed with
//! `sudo` when the process does not run as root.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "command")]
//! # async fn example() -> Result<(), wgb_validation::command::CommandError> {
//! use wgb_validation::command::{SafeCommand, AllowedProgram};
//!
//! let output = SafeCommand::new(AllowedProgram::Wg)
//!     .arg("show")
//!     .arg("wg0")
//!     .execute()
//!     .await?;
//!
//! println!("stdout: {}", output.stdout_lossy());
//! # Ok(())
//! # }
//! ```

use crate::error::ValidationError;
use std::fmt;
use thiserror::Error;

#[cfg(feature = "command")]
use std::process::Stdio;
#[cfg(feature = "command")]
use tokio::process::{Child, Command as TokioCommand};

/// Programs that are explicitly allowed to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AllowedProgram {
    /// The `openvpn` client.
    OpenVpn,
    /// The `wg-quick` interface manager.
    WgQuick,
    /// The `wg` configuration tool.
    Wg,
    /// The iproute2 `ip` tool.
    Ip,
    /// The `sysctl` kernel parameter tool.
    Sysctl,
    /// The `kill` signal sender.
    Kill,
}

impl AllowedProgram {
    /// Get the program name to execute.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenVpn => "openvpn",
            Self::WgQuick => "wg-quick",
            Self::Wg => "wg",
            Self::Ip => "ip",
            Self::Sysctl => "sysctl",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for AllowedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during safe command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Validation of a command argument failed.
    #[error("argument validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// The command returned a non-zero exit code.
    #[error("command '{command}' exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        /// The command that was executed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The program could not be started or awaited.
    #[error("failed to run '{command}': {source}")]
    Spawn {
        /// The command that was attempted.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Create a non-zero exit error.
    #[must_use]
    pub fn non_zero_exit(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::NonZeroExit {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }
}

/// Characters that are never allowed in command arguments.
const FORBIDDEN_CHARS: &[char] = &['\0', '\n', '\r'];

/// Validate a command argument.
///
/// # Errors
///
/// Returns an error if the argument contains forbidden characters.
pub fn validate_argument(arg: &str, field_name: &str) -> Result<(), ValidationError> {
    for c in arg.chars() {
        if c == '\0' {
            return Err(ValidationError::null_byte(field_name));
        }
        if FORBIDDEN_CHARS.contains(&c) {
            return Err(ValidationError::forbidden_char(field_name, c));
        }
    }
    Ok(())
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Exit status code (0 for success, -1 if killed by a signal).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Get stdout as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the command succeeded (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command builder that validates all inputs before anything runs.
#[derive(Debug, Clone)]
pub struct SafeCommand {
    program: AllowedProgram,
    sudo: bool,
    args: Vec<String>,
    validation_errors: Vec<ValidationError>,
}

impl SafeCommand {
    /// Create a new safe command for the given program.
    #[must_use]
    pub fn new(program: AllowedProgram) -> Self {
        Self {
            program,
            sudo: false,
            args: Vec::new(),
            validation_errors: Vec::new(),
        }
    }

    /// Run the program through `sudo` when `enabled`.
    #[must_use]
    pub fn privileged(mut self, enabled: bool) -> Self {
        self.sudo = enabled;
        self
    }

    /// Add a single argument to the command.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        let arg = arg.as_ref();
        match validate_argument(arg, "argument") {
            Ok(()) => self.args.push(arg.to_string()),
            Err(e) => self.validation_errors.push(e),
        }
        self
    }

    /// Add multiple arguments to the command.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// The program this command runs.
    #[must_use]
    pub fn program(&self) -> AllowedProgram {
        self.program
    }

    /// The validated arguments, in order.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Check if there are any validation errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.validation_errors.is_empty()
    }

    /// Get any validation errors that occurred.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.validation_errors
    }

    /// Human-readable command line for logs and error messages.
    #[must_use]
    pub fn command_description(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            parts.push("sudo");
        }
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    #[cfg(feature = "command")]
    fn build(mut self) -> Result<(TokioCommand, String), CommandError> {
        if !self.validation_errors.is_empty() {
            return Err(CommandError::ValidationFailed(self.validation_errors.swap_remove(0)));
        }
        let description = self.command_description();
        let mut cmd = if self.sudo {
            let mut cmd = TokioCommand::new("sudo");
            cmd.arg("-n").arg(self.program.as_str());
            cmd
        } else {
            TokioCommand::new(self.program.as_str())
        };
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        Ok((cmd, description))
    }

    /// Execute the command and return the output.
    ///
    /// # Errors
    ///
    /// Returns an error if validation failed, the program could not be
    /// started, or it exited non-zero.
    #[cfg(feature = "command")]
    pub async fn execute(self) -> Result<CommandOutput, CommandError> {
        let (description, output) = self.run().await?;
        if !output.success() {
            return Err(CommandError::non_zero_exit(
                description,
                output.exit_code,
                output.stderr_lossy().trim(),
            ));
        }
        Ok(output)
    }

    /// Execute the command without checking the exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if validation failed or the command couldn't be executed.
    #[cfg(feature = "command")]
    pub async fn execute_unchecked(self) -> Result<CommandOutput, CommandError> {
        self.run().await.map(|(_, output)| output)
    }

    #[cfg(feature = "command")]
    async fn run(self) -> Result<(String, CommandOutput), CommandError> {
        let (mut cmd, description) = self.build()?;
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|source| CommandError::Spawn {
            command: description.clone(),
            source,
        })?;

        Ok((
            description,
            CommandOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code().unwrap_or(-1),
            },
        ))
    }

    /// Start the program as a long-running child and return its handle.
    ///
    /// Standard streams are detached; such programs are expected to log to
    /// their own files.
    ///
    /// # Errors
    ///
    /// Returns an error if validation failed or the program could not be
    /// started.
    #[cfg(feature = "command")]
    pub fn spawn(self) -> Result<Child, CommandError> {
        let (mut cmd, description) = self.build()?;
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.spawn()
            .map_err(|source| CommandError::Spawn { command: description, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidationErrorKind;

    #[test]
    fn test_validate_argument_valid() {
        assert!(validate_argument("--config", "arg").is_ok());
        assert!(validate_argument("/etc/openvpn/config/client.ovpn", "arg").is_ok());
        assert!(validate_argument("net.ipv4.ip_forward=1", "arg").is_ok());
        assert!(validate_argument("", "arg").is_ok());
    }

    #[test]
    fn test_validate_argument_null_byte() {
        let err = validate_argument("arg\0value", "arg").expect_err("null byte");
        assert_eq!(err.kind, ValidationErrorKind::NullByte);
    }

    #[test]
    fn test_forbidden_chars_rejected() {
        assert!(validate_argument("line1\nline2", "arg").is_err());
        assert!(validate_argument("text\r", "arg").is_err());
    }

    #[test]
    fn test_shell_chars_pass_through() {
        // No shell is involved, so these reach the program verbatim.
        assert!(validate_argument("$(whoami)", "arg").is_ok());
        assert!(validate_argument("a;b", "arg").is_ok());
    }

    #[test]
    fn test_safe_command_builder() {
        let cmd = SafeCommand::new(AllowedProgram::WgQuick).arg("up").arg("wg0");
        assert!(!cmd.has_errors());
        assert_eq!(cmd.arguments(), ["up", "wg0"]);
        assert_eq!(cmd.program(), AllowedProgram::WgQuick);
    }

    #[test]
    fn test_safe_command_with_invalid_arg() {
        let cmd = SafeCommand::new(AllowedProgram::Wg)
            .args(["show", "wg0\n"]);
        assert!(cmd.has_errors());
        assert_eq!(cmd.errors().len(), 1);
        assert_eq!(cmd.arguments(), ["show"]);
    }

    #[test]
    fn test_command_description() {
        let cmd = SafeCommand::new(AllowedProgram::Sysctl).args(["-w", "net.ipv4.ip_forward=1"]);
        assert_eq!(cmd.command_description(), "sysctl -w net.ipv4.ip_forward=1");
    }

    #[test]
    fn test_command_description_with_sudo() {
        let cmd = SafeCommand::new(AllowedProgram::WgQuick)
            .privileged(true)
            .args(["down", "wg0"]);
        assert_eq!(cmd.command_description(), "sudo wg-quick down wg0");
    }

    #[test]
    fn test_allowed_program_as_str() {
        assert_eq!(AllowedProgram::OpenVpn.as_str(), "openvpn");
        assert_eq!(AllowedProgram::WgQuick.as_str(), "wg-quick");
        assert_eq!(AllowedProgram::Ip.to_string(), "ip");
    }

    #[test]
    fn test_command_output_methods() {
        let output = CommandOutput {
            stdout: b"interface: wg0".to_vec(),
            stderr: b"warning".to_vec(),
            exit_code: 0,
        };
        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "interface: wg0");
        assert_eq!(output.stderr_lossy(), "warning");
    }

    #[test]
    fn test_non_zero_exit_display() {
        let err = CommandError::non_zero_exit("wg show wg0", 1, "No such device");
        assert_eq!(
            err.to_string(),
            "command 'wg show wg0' exited with code 1: No such device"
        );
    }

    #[cfg(feature = "command")]
    #[tokio::test]
    async fn test_execute_rejects_before_running() {
        let result = SafeCommand::new(AllowedProgram::Ip)
            .arg("link\0")
            .execute()
            .await;
        assert!(matches!(result, Err(CommandError::ValidationFailed(_))));
    }

    #[cfg(feature = "command")]
    #[test]
    fn test_spawn_rejects_before_running() {
        let result = SafeCommand::new(AllowedProgram::OpenVpn)
            .arg("--config\n")
            .spawn();
        assert!(matches!(result, Err(CommandError::ValidationFailed(_))));
    }
}
