//! Shell command execution for setup scripts and worktree plumbing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// A spawned command exited non-zero (or was killed by a signal).
#[derive(Debug, Error)]
#[error("command `{command}` in {} failed with exit code {exit_code}", .cwd.display())]
pub struct CommandExecutionError {
    /// The command line that was run.
    pub command: String,
    /// Working directory the command ran in.
    pub cwd: PathBuf,
    /// Exit code; -1 when the process was terminated by a signal.
    pub exit_code: i32,
    /// Captured stderr tail, for diagnostics.
    pub stderr: String,
}

/// Output of a successfully completed command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command line through `sh -c` in the given directory.
///
/// Stdout/stderr are captured; a non-zero exit becomes a typed
/// [`CommandExecutionError`] carrying the exit code.
pub async fn run_command(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<CommandOutput, CommandExecutionError> {
    debug!("Running `{}` in {}", command, cwd.display());

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|e| CommandExecutionError {
        command: command.to_string(),
        cwd: cwd.to_path_buf(),
        exit_code: -1,
        stderr: e.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(CommandExecutionError {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: tail(&stderr, 2048),
        })
    }
}

/// Keep at most the last `limit` bytes of a string, on a char boundary.
fn tail(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_captures_stdout() {
        let out = run_command("echo hello", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_command_reports_exit_code() {
        let err = run_command("exit 42", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code, 42);
        assert!(err.to_string().contains("exit code 42"));
    }

    #[tokio::test]
    async fn run_command_passes_env() {
        let mut env = HashMap::new();
        env.insert("CELLAR_TEST_VALUE".to_string(), "ok".to_string());
        let out = run_command("echo $CELLAR_TEST_VALUE", Path::new("/tmp"), &env)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "ok");
    }

    #[test]
    fn tail_keeps_suffix() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
