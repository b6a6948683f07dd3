//! External tool invocation
//!
//! Every invocation suspends the caller until the child exits or the timeout
//! expires. On timeout the child's whole process group is killed and the
//! failure surfaces as [`TokenError::Timeout`] rather than a hang.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::TokenError;

/// Default per-invocation timeout. Overridable via [`Invocation::timeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of a finished child process.
///
/// Stdout stays raw bytes: `pkcs11-tool --read-object` emits DER, not text.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Builder for one external tool invocation.
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
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

    /// Extra environment variables for the child, on top of the inherited ones.
    pub fn envs(mut self, envs: &[(String, String)]) -> Self {
        self.envs.extend(envs.iter().cloned());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Payload written to the child's stdin before waiting.
    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command rendering used in log and error messages.
    pub fn describe(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and capture output. The exit status is reported, not
    /// inspected; use [`Invocation::checked`] when success is required.
    pub async fn output(self) -> Result<ExecOutput, TokenError> {
        let command_line = self.describe();
        let program_name = self.program.display().to_string();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        if self.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }
        // Own process group, so a timeout can take down any grandchildren too.
        #[cfg(unix)]
        command.process_group(0);

        debug!(command = %command_line, "spawning external tool");
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TokenError::ResourceUnavailable(program_name)
            } else {
                TokenError::Io(e)
            }
        })?;

        let pid = child.id();
        // The stdin write shares the timeout: a child that never drains its
        // pipe would otherwise block write_all indefinitely.
        let payload = self.stdin;
        let run = async move {
            if let Some(payload) = payload {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(&payload).await?;
                    stdin.shutdown().await?;
                }
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                kill_process_group(pid);
                return Err(TokenError::Timeout {
                    command: command_line,
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    /// Run and require a zero exit status.
    pub async fn checked(self) -> Result<ExecOutput, TokenError> {
        let command_line = self.describe();
        let output = self.output().await?;
        if !output.success() {
            return Err(TokenError::ToolFailed {
                command: command_line,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Spawned as its own group leader, so -pid addresses the full group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
