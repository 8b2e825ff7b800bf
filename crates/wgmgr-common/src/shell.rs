//! Shell command execution for firewall tooling.
//!
//! Commands are assembled with [`ShellCommand`], which quotes every argument,
//! and run through `/bin/sh -c`. Quoting matters here because rule arguments
//! are built from control plane data (addresses, set names).
//!
//! # Example
//!
//! ```ignore
//! use wgmgr_common::shell::{ShellCommand, IPTABLES_CMD};
//!
//! let rules = ShellCommand::new(IPTABLES_CMD)
//!     .args(["-w", "-t", "nat", "-S", "PORTFORWARDING"])
//!     .output()
//!     .await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{WgMgrError, WgMgrResult};

/// Path to the `iptables` command for IPv4 NAT rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `ip6tables` command for IPv6 NAT rules.
pub const IP6TABLES_CMD: &str = "/sbin/ip6tables";

/// Path to the `ipset` command.
pub const IPSET_CMD: &str = "/sbin/ipset";

/// Characters that need escaping inside shell double quotes:
/// `$`, `` ` ``, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use wgmgr_common::shell::shellquote;
///
/// assert_eq!(shellquote("PORTFORWARDING"), "\"PORTFORWARDING\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout and stderr joined, for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// A program invocation with individually quoted arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Runs the command and returns its result regardless of exit code.
    pub async fn exec(&self) -> WgMgrResult<ExecResult> {
        exec(&self.to_string()).await
    }

    /// Runs the command and returns stdout, failing on non-zero exit.
    pub async fn output(&self) -> WgMgrResult<String> {
        exec_or_throw(&self.to_string()).await
    }
}

impl fmt::Display for ShellCommand {
    /// Renders the command line with the program unquoted and every
    /// argument quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", shellquote(arg))?;
        }
        Ok(())
    }
}

/// Executes a shell command line through `/bin/sh -c`.
///
/// Returns `Err` only when the process could not be spawned; a non-zero exit
/// is reported through [`ExecResult::exit_code`].
pub async fn exec(cmd: &str) -> WgMgrResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| WgMgrError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if !result.success() {
        tracing::debug!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command line and fails on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> WgMgrResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(WgMgrError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
