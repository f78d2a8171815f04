//! Subprocess execution with concurrent output capture.
//!
//! Runners shell out to their IaC tool through [`ShellCommand`]. The child
//! inherits the engine's environment, with the command's own variables
//! layered on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::ShellError;

/// Default per-line buffer size.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// Per-line buffer size for tools with very long output lines (plans, JSON).
pub const VERBOSE_MAX_BUFFER: usize = 1024 * 1024;

/// Output stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// An external command to run.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Working directory (inherited when `None`)
    pub dir: Option<PathBuf>,
    /// Program name or path
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment, merged over the inherited one
    pub env: HashMap<String, String>,
    /// Maximum bytes kept per output line
    pub max_buffer: usize,
    /// Log the command line without its arguments
    pub sensitive_args: bool,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            dir: None,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            max_buffer: DEFAULT_MAX_BUFFER,
            sensitive_args: false,
        }
    }

    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer = bytes.max(1);
        self
    }

    pub fn sensitive_args(mut self, sensitive: bool) -> Self {
        self.sensitive_args = sensitive;
        self
    }

    /// Command line as it should appear in logs.
    pub fn display(&self) -> String {
        if self.sensitive_args {
            format!("{} (args redacted)", self.command)
        } else if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ShellError {
        ShellError::Spawn {
            command: self.command.clone(),
            source,
        }
    }

    fn check_status(&self, status: std::process::ExitStatus, output: String) -> Result<String, ShellError> {
        if status.success() {
            Ok(output)
        } else {
            Err(ShellError::NonZeroExit {
                command: self.display(),
                code: status.code(),
                output,
            })
        }
    }

    /// Run the command, letting it write to the engine's stdout/stderr.
    pub async fn run(&self) -> Result<(), ShellError> {
        info!(dir = ?self.dir, "Running {}", self.display());

        let status = self
            .build()
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;

        self.check_status(status, String::new()).map(|_| ())
    }

    /// Run the command and return stdout followed by stderr.
    pub async fn run_and_capture(&self) -> Result<String, ShellError> {
        debug!(dir = ?self.dir, "Running {}", self.display());

        let output = self
            .build()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        self.check_status(output.status, combined)
    }

    /// Run the command and return stdout only.
    ///
    /// stderr is logged at warn and kept in the error output on failure, so
    /// tool warnings never end up in machine-readable stdout.
    pub async fn run_and_capture_stdout(&self) -> Result<String, ShellError> {
        debug!(dir = ?self.dir, "Running {}", self.display());

        let output = self
            .build()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(command = self.command.as_str(), "{}", line);
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            let mut combined = stdout;
            combined.push_str(&stderr);
            self.check_status(output.status, combined)
        }
    }

    /// Run the command, logging every line as it arrives and returning all of them.
    ///
    /// stdout lines are logged at info, stderr lines at error. Both pipes are
    /// drained concurrently; each line is appended to the result atomically.
    pub async fn run_capture_and_stream(&self) -> Result<String, ShellError> {
        info!(dir = ?self.dir, "Running {}", self.display());

        let mut child = self
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let missing_pipe = |name: &str| ShellError::Io {
            command: self.command.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{name} not captured")),
        };
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let lines = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = tokio::spawn(pump(stdout, LogStream::Stdout, self.max_buffer, lines.clone()));
        let stderr_task = tokio::spawn(pump(stderr, LogStream::Stderr, self.max_buffer, lines.clone()));

        let status = child.wait().await.map_err(|source| ShellError::Io {
            command: self.command.clone(),
            source,
        })?;

        for task in [stdout_task, stderr_task] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(ShellError::Io {
                        command: self.command.clone(),
                        source,
                    })
                }
                Err(e) => warn!("Output reader for {} aborted: {}", self.command, e),
            }
        }

        let output = lines.lock().join("\n");
        self.check_status(status, output)
    }
}

/// Read `reader` line by line, logging each line and appending it to `lines`.
///
/// At most `max_buffer` bytes of a line are held; the rest is discarded as it
/// is read.
async fn pump<R>(
    reader: R,
    stream: LogStream,
    max_buffer: usize,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(max_buffer.min(DEFAULT_MAX_BUFFER));

    loop {
        buf.clear();
        let mut line_len = 0usize;
        let mut read_any = false;

        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            read_any = true;

            let newline = available.iter().position(|b| *b == b'\n');
            let content = newline.unwrap_or(available.len());
            let room = max_buffer.saturating_sub(buf.len());
            buf.extend_from_slice(&available[..content.min(room)]);
            line_len += content;

            let consumed = newline.map_or(content, |pos| pos + 1);
            reader.consume(consumed);
            if newline.is_some() {
                break;
            }
        }

        if !read_any {
            return Ok(());
        }

        while buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if line_len > max_buffer {
            warn!(%stream, len = line_len, max_buffer, "Output line exceeds buffer, truncating");
        }

        let line = String::from_utf8_lossy(&buf).into_owned();
        match stream {
            LogStream::Stdout => info!("{}", line),
            LogStream::Stderr => error!("{}", line),
        }
        lines.lock().push(line);
    }
}

/// Exit code carried by a subprocess error, if any.
pub fn exit_code(err: &ShellError) -> Option<i32> {
    err.exit_code()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ShellCommand {
        ShellCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_success() {
        assert!(sh("exit 0").run().await.is_ok());
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let err = sh("exit 3").run().await.unwrap_err();
        assert_eq!(exit_code(&err), Some(3));
    }

    #[tokio::test]
    async fn test_capture_combines_stdout_and_stderr() {
        let output = sh("echo out; echo err 1>&2").run_and_capture().await.unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_stream_collects_all_lines() {
        let output = sh("for i in 1 2 3; do echo line$i; echo warn$i 1>&2; done")
            .run_capture_and_stream()
            .await
            .unwrap();

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 6);
        for expected in ["line1", "line2", "line3", "warn1", "warn2", "warn3"] {
            assert!(lines.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_output() {
        let err = sh("echo partial; exit 7").run_capture_and_stream().await.unwrap_err();
        match err {
            ShellError::NonZeroExit { code, output, .. } => {
                assert_eq!(code, Some(7));
                assert_eq!(output, "partial");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extra_env_wins_over_inherited() {
        std::env::set_var("RUNIAC_SHELL_TEST_VAR", "inherited");
        let output = sh("printf %s \"$RUNIAC_SHELL_TEST_VAR\"")
            .env("RUNIAC_SHELL_TEST_VAR", "override")
            .run_and_capture()
            .await
            .unwrap();
        assert_eq!(output, "override");
    }

    #[tokio::test]
    async fn test_long_lines_are_truncated() {
        let output = sh("printf '%0500d\\n' 0")
            .max_buffer(100)
            .run_capture_and_stream()
            .await
            .unwrap();
        assert_eq!(output.len(), 100);
    }

    #[tokio::test]
    async fn test_oversized_line_discarded_and_next_line_kept() {
        let output = sh("yes 0 | head -n 50000 | tr -d '\\n'; printf '\\nnext\\n'")
            .max_buffer(10)
            .run_capture_and_stream()
            .await
            .unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["0000000000", "next"]);
    }

    #[tokio::test]
    async fn test_capture_stdout_ignores_stderr() {
        let output = sh("echo '{\"a\":1}'; echo 'Warning: deprecated' 1>&2")
            .run_and_capture_stdout()
            .await
            .unwrap();
        assert_eq!(output.trim(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_capture_stdout_failure_keeps_stderr() {
        let err = sh("echo 'Error: broken' 1>&2; exit 2")
            .run_and_capture_stdout()
            .await
            .unwrap_err();
        match err {
            ShellError::NonZeroExit { code, output, .. } => {
                assert_eq!(code, Some(2));
                assert!(output.contains("Error: broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_sensitive_args_are_redacted() {
        let cmd = ShellCommand::new("terraform")
            .args(["apply", "-var", "secret=hunter2"])
            .sensitive_args(true);
        assert_eq!(cmd.display(), "terraform (args redacted)");

        let cmd = ShellCommand::new("terraform").args(["plan"]);
        assert_eq!(cmd.display(), "terraform plan");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let output = sh("cat marker.txt").dir(dir.path()).run_and_capture().await.unwrap();
        assert_eq!(output, "here");
    }
}
