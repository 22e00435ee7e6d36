//! # Executor - Uniform Command Execution in the Linux Environment
//!
//! Every mutation the engine performs happens by running shell/syscall
//! commands inside a Linux environment: a pinned WSL2 distribution on
//! Windows, or the host kernel itself on Linux. This module is the only
//! place that spawns those processes; nothing above it knows about
//! `wsl.exe` invocation details or shell escaping.
//!
//! ## Contract
//!
//! | Operation        | Behavior                                              |
//! |------------------|-------------------------------------------------------|
//! | `run`            | Synchronous, stdout/stderr stream to the console      |
//! | `run_with_input` | Same, with bytes fed to stdin (CRLF → LF normalized)  |
//! | `output`         | Synchronous, stdout captured as a string              |
//! | `prepare`        | Built-but-unstarted command for progress tickers      |
//!
//! ## The CRLF Invariant
//!
//! Any string fed to a Linux shell via stdin MUST be LF-normalized first.
//! On Windows, strings routinely pick up `\r\n` line endings, and a `\r`
//! reaching `sh` corrupts the script. Normalization happens here, at the
//! boundary, unconditionally. This is a correctness invariant, not an
//! optimization.

use crate::error::{Error, Result};
use crate::pathmap::PathStyle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Helpers
// =============================================================================

/// Normalizes CRLF line endings to LF.
///
/// Applied to every stdin payload before it reaches a Linux shell.
pub fn normalize_crlf(input: &str) -> String {
    input.replace("\r\n", "\n")
}

/// Quotes a string for safe interpolation into a POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Joins argv into a single shell-safe command line.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Environment variable name as seen inside the container boundary.
///
/// `PATH` is smuggled as `PLX_CONTAINER_PATH` so it does not clobber the
/// lookup path of the host-side tools that launch the container; the shim
/// re-exports it as `PATH` inside the chroot.
fn container_env_name(key: &str) -> &str {
    if key == "PATH" { "PLX_CONTAINER_PATH" } else { key }
}

fn failed(status: std::process::ExitStatus, stderr: String) -> Error {
    Error::ExecutorFailed {
        status: status.code().unwrap_or(-1),
        stderr,
    }
}

// =============================================================================
// Executor Trait
// =============================================================================

/// Capability set for running commands in the Linux environment.
///
/// Implementations: [`WslExecutor`] (Windows host, pinned WSL2 distro as
/// root) and [`LocalExecutor`] (Linux host, in-process spawn).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Path mapping rules between this host and the executor.
    fn path_style(&self) -> PathStyle;

    /// Runs a command, streaming stdout/stderr to the caller's console.
    /// Non-zero exit is an error.
    async fn run(&self, argv: &[&str]) -> Result<()>;

    /// Runs a command with `input` fed to its stdin (LF-normalized).
    async fn run_with_input(&self, input: &str, argv: &[&str]) -> Result<()>;

    /// Runs a command and captures stdout. Non-zero exit is an error
    /// carrying captured stderr.
    async fn output(&self, argv: &[&str]) -> Result<String>;

    /// Builds a command object that has not been spawned yet, so the
    /// caller can wire stdio and run a progress ticker alongside it.
    fn prepare(&self, argv: &[&str]) -> Command;

    /// Like [`prepare`](Self::prepare), additionally forwarding `env`
    /// across the host→executor boundary (WSLENV protocol on Windows).
    fn prepare_with_env(
        &self,
        argv: &[&str],
        env: &HashMap<String, String>,
        interactive: bool,
    ) -> Command;

    /// Quiet success probe (`test -f`, `test -d`, ...). Never errors.
    async fn succeeds(&self, argv: &[&str]) -> bool {
        self.output(argv).await.is_ok()
    }

    /// Convenience: `sh -c <script>` with streamed output.
    async fn shell(&self, script: &str) -> Result<()> {
        self.run(&["sh", "-c", script]).await
    }

    /// Convenience: `sh -c <script>` with captured stdout.
    async fn shell_output(&self, script: &str) -> Result<String> {
        self.output(&["sh", "-c", script]).await
    }
}

/// Spawns a prepared command and waits for it, printing a
/// once-per-second elapsed-time line to stderr.
///
/// Long executor calls (image extraction, checkpoint saves) otherwise
/// sit silent for minutes; the ticker is the only feedback the caller
/// gets.
pub async fn run_with_progress(mut cmd: Command, label: &str) -> Result<()> {
    let start = std::time::Instant::now();
    let mut child = cmd.stdin(Stdio::null()).spawn()?;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                eprintln!("\x1b[2K\r{}... done. ({}s)", label, start.elapsed().as_secs());
                if !status.success() {
                    return Err(failed(status, String::new()));
                }
                return Ok(());
            }
            _ = ticker.tick() => {
                eprint!("\x1b[2K\r{}... ({}s elapsed)", label, start.elapsed().as_secs());
            }
        }
    }
}

// =============================================================================
// WSL Executor
// =============================================================================

/// Executor backed by `wsl.exe` and a pinned distribution.
///
/// Every command is prefixed with `wsl.exe -d <distro> -u root --` so the
/// engine always acts as root inside the distro. Top-level WSL management
/// commands (`--import`, `--unregister`) are exposed separately via
/// [`WslExecutor::wsl`].
pub struct WslExecutor {
    distro: String,
}

impl WslExecutor {
    /// Creates an executor for the given distribution name.
    pub fn new(distro: impl Into<String>) -> Self {
        Self {
            distro: distro.into(),
        }
    }

    /// The pinned distribution name.
    pub fn distro(&self) -> &str {
        &self.distro
    }

    fn base_command(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new("wsl.exe");
        cmd.arg("-d").arg(&self.distro).arg("-u").arg("root").arg("--");
        cmd.args(argv);
        cmd
    }

    /// Runs a bare `wsl.exe` command (no distro prefix), e.g. `--import`.
    pub async fn wsl(&self, args: &[&str]) -> Result<()> {
        debug!(?args, "wsl.exe");
        let status = Command::new("wsl.exe")
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(failed(status, String::new()));
        }
        Ok(())
    }

    /// Checks whether the pinned distribution is registered.
    pub async fn distro_exists(&self) -> bool {
        Command::new("wsl.exe")
            .args(["-l", "-q", "-d", &self.distro])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Polls until the distro answers a trivial command, or gives up.
    pub async fn wait_until_ready(&self, retries: u32, interval: std::time::Duration) -> Result<()> {
        for attempt in 0..retries {
            if self.succeeds(&["test", "-d", "/"]).await {
                return Ok(());
            }
            debug!(attempt, retries, "distro not ready yet");
            tokio::time::sleep(interval).await;
        }
        Err(Error::Timeout {
            operation: format!("waiting for distro '{}' to become ready", self.distro),
            duration: interval * retries,
        })
    }
}

#[async_trait]
impl Executor for WslExecutor {
    fn name(&self) -> &str {
        "wsl"
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Windows
    }

    async fn run(&self, argv: &[&str]) -> Result<()> {
        debug!(?argv, "wsl run");
        let status = self
            .base_command(argv)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(failed(status, String::new()));
        }
        Ok(())
    }

    async fn run_with_input(&self, input: &str, argv: &[&str]) -> Result<()> {
        let input = normalize_crlf(input);
        debug!(?argv, bytes = input.len(), "wsl run_with_input");
        let mut child = self
            .base_command(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(failed(status, String::new()));
        }
        Ok(())
    }

    async fn output(&self, argv: &[&str]) -> Result<String> {
        debug!(?argv, "wsl output");
        let out = self
            .base_command(argv)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(failed(
                out.status,
                String::from_utf8_lossy(&out.stderr).into_owned(),
            ));
        }
        // wsl.exe is prone to sneaking CRLF into captured text
        Ok(normalize_crlf(&String::from_utf8_lossy(&out.stdout)))
    }

    fn prepare(&self, argv: &[&str]) -> Command {
        let mut cmd = self.base_command(argv);
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn prepare_with_env(
        &self,
        argv: &[&str],
        env: &HashMap<String, String>,
        interactive: bool,
    ) -> Command {
        let mut cmd = self.base_command(argv);
        cmd.stderr(Stdio::inherit());

        // WSLENV carries named host variables into the distro. Each name
        // is suffixed /u (translate for Unix) and prepended to whatever
        // list the host session already exports.
        let mut wslenv: Vec<String> = Vec::new();
        let existing = std::env::var("WSLENV").unwrap_or_default();

        if interactive {
            let term = std::env::var("TERM").unwrap_or_default();
            cmd.env(
                "TERM",
                if term.is_empty() { "xterm-256color".to_string() } else { term },
            );
            if !existing.contains("TERM") {
                wslenv.push("TERM/u".to_string());
            }
        }

        for (k, v) in env {
            let key = container_env_name(k);
            cmd.env(key, v);
            if !existing.contains(key) {
                wslenv.push(format!("{}/u", key));
            }
        }

        if !wslenv.is_empty() || !existing.is_empty() {
            let mut joined = wslenv.join(":");
            if !existing.is_empty() {
                if !joined.is_empty() {
                    joined.push(':');
                }
                joined.push_str(&existing);
            }
            cmd.env("WSLENV", joined);
        }

        cmd
    }
}

// =============================================================================
// Local Executor
// =============================================================================

/// Executor for a Linux host acting as its own container environment.
///
/// Commands run in-process with no prefix. Most operations (mount,
/// unshare, ip) require root; construction warns when the effective UID
/// is not 0 rather than failing, so read-only commands still work.
pub struct LocalExecutor {
    _private: (),
}

impl LocalExecutor {
    /// Creates a local executor.
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no failure modes and touches no memory.
            let euid = unsafe { libc::geteuid() };
            if euid != 0 {
                tracing::warn!("running without root; mount/unshare/ip operations will fail");
            }
        }
        Self { _private: () }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Identity
    }

    async fn run(&self, argv: &[&str]) -> Result<()> {
        debug!(?argv, "local run");
        let (prog, rest) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty argv".to_string()))?;
        let status = Command::new(prog)
            .args(rest)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(failed(status, String::new()));
        }
        Ok(())
    }

    async fn run_with_input(&self, input: &str, argv: &[&str]) -> Result<()> {
        let input = normalize_crlf(input);
        let (prog, rest) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty argv".to_string()))?;
        let mut child = Command::new(prog)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(failed(status, String::new()));
        }
        Ok(())
    }

    async fn output(&self, argv: &[&str]) -> Result<String> {
        let (prog, rest) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty argv".to_string()))?;
        let out = Command::new(prog)
            .args(rest)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(failed(
                out.status,
                String::from_utf8_lossy(&out.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn prepare(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..]);
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn prepare_with_env(
        &self,
        argv: &[&str],
        env: &HashMap<String, String>,
        interactive: bool,
    ) -> Command {
        let mut cmd = self.prepare(argv);
        if interactive && std::env::var("TERM").is_err() {
            cmd.env("TERM", "xterm-256color");
        }
        for (k, v) in env {
            cmd.env(container_env_name(k), v);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_crlf() {
        assert_eq!(normalize_crlf("a\r\nb\r\n"), "a\nb\n");
        assert_eq!(normalize_crlf("already\nclean\n"), "already\nclean\n");
        assert_eq!(normalize_crlf(""), "");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_shell_join() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_join(&argv), "'echo' 'hello world'");
    }

    #[test]
    fn test_container_env_name() {
        assert_eq!(container_env_name("PATH"), "PLX_CONTAINER_PATH");
        assert_eq!(container_env_name("HOME"), "HOME");
    }

    #[tokio::test]
    async fn test_local_output_captures_stdout() {
        let exec = LocalExecutor::new();
        let out = exec.output(&["echo", "hi"]).await.unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_local_output_failure_carries_stderr() {
        let exec = LocalExecutor::new();
        let err = exec
            .shell_output("echo oops >&2; exit 3")
            .await
            .unwrap_err();
        match err {
            Error::ExecutorFailed { status, stderr } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_local_run_with_input_normalizes_crlf() {
        let exec = LocalExecutor::new();
        // A CR reaching sh would make this script fail with a syntax error.
        exec.run_with_input("true\r\ntrue\r\n", &["sh", "-e"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_succeeds_probe() {
        let exec = LocalExecutor::new();
        assert!(exec.succeeds(&["test", "-d", "/"]).await);
        assert!(!exec.succeeds(&["test", "-d", "/definitely/not/a/dir"]).await);
    }
}
