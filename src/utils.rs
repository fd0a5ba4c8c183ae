//! Process execution and shell quoting helpers.

use crate::error::BeakerUtilError;
use anyhow::{Context, Result};
use std::process::Command;
use tracing::debug;

/// Result of running an external command
#[derive(Debug)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

/// Execute a command and return stdout, stderr, and return code.
///
/// # Arguments
/// * `cmd` - Command and arguments as a slice
/// * `check` - If true, return error on non-zero return code
pub fn run_command(cmd: &[&str], check: bool) -> Result<CommandResult> {
    if cmd.is_empty() {
        anyhow::bail!("Empty command");
    }
    debug!(command = ?cmd, "running");

    let output = Command::new(cmd[0])
        .args(&cmd[1..])
        .output()
        .with_context(|| format!("Failed to execute command: {}", cmd[0]))?;

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        return_code: output.status.code().unwrap_or(-1),
    };

    if check && result.return_code != 0 {
        return Err(BeakerUtilError::CommandFailed {
            command: cmd.join(" "),
            code: result.return_code,
            stderr: result.stderr.trim().to_string(),
        }
        .into());
    }

    Ok(result)
}

/// Escape a value for interpolation inside a double-quoted shell string.
pub fn requote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape a whole command line for a double-quoted string that a shell
/// expands once more, so `$` and backticks survive too.
pub fn embed_double_quoted(s: &str) -> String {
    requote(s).replace('$', "\\$").replace('`', "\\`")
}

/// Render an argv as a single shell command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    shlex::try_join(argv.iter().map(|a| a.as_ref())).with_context(|| {
        let program = argv.first().map(|a| a.as_ref());
        format!("Cannot quote command {:?} for a shell", program)
    })
}

/// Hands a composed command line to the operating system.
pub trait Executor {
    /// Replace the current process with `argv`. Only returns on failure.
    fn exec(&self, argv: &[String]) -> Result<()>;
}

/// Real executor backed by `execvp`.
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    #[cfg(unix)]
    fn exec(&self, argv: &[String]) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let (program, args) = argv.split_first().context("Empty command")?;
        debug!(command = ?argv, "replacing process");
        let err = Command::new(program).args(args).exec();
        Err(err).with_context(|| format!("Failed to execute {}", program))
    }

    #[cfg(not(unix))]
    fn exec(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv.split_first().context("Empty command")?;
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("Failed to execute {}", program))?;
        std::process::exit(status.code().unwrap_or(1));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::unquote_double;
    use super::*;

    #[test]
    fn test_requote() {
        assert_eq!(requote(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(requote("plain"), "plain");
    }

    #[test]
    fn test_requote_round_trip() {
        let original = r#"echo "hi\there" \\ "#;
        let embedded = format!("\"{}\"", requote(original));
        assert_eq!(unquote_double(&embedded), original);
    }

    #[test]
    fn test_embed_keeps_expansions_literal() {
        let original = r#"run 'a $HOME b' "`id`" \x"#;
        let embedded = format!("\"{}\"", embed_double_quoted(original));
        assert_eq!(unquote_double(&embedded), original);
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(
            shell_join(&["beaker", "session", "attach", "01ABC"]).unwrap(),
            "beaker session attach 01ABC"
        );
        let argv = ["echo", "two words", "", r#"a "b" $HOME \x"#, "it's"];
        let joined = shell_join(&argv).unwrap();
        assert_eq!(shlex::split(&joined).unwrap(), argv);
    }

    #[test]
    fn test_shell_join_rejects_nul() {
        assert!(shell_join(&["echo", "a\0b"]).is_err());
    }

    #[test]
    fn test_run_command_empty() {
        assert!(run_command(&[], false).is_err());
    }
}
