//! Subprocess execution shared by the ZFS and service-manager clients

use crate::error::{Error, Result};
use std::process::Command;

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
///
/// Backends take a runner instead of calling [`Command`] directly so tests
/// can script the output of `zfs` and `systemctl`.
pub trait CommandRunner {
    /// Run a command to completion and capture its output
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command and return stdout, failing on a non-zero exit
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                stderr: output.stderr.trim_end().to_string(),
            })
        }
    }

    /// Run a command, returning Ok(true) if it succeeds, Ok(false) if it fails
    fn check(&self, program: &str, args: &[&str]) -> Result<bool> {
        Ok(self.output(program, args)?.success)
    }
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(command = %format!("{} {}", program, args.join(" ")), "exec");
        let output = Command::new(program).args(args).output()?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        (**self).output(program, args)
    }
}
