use crate::error::ExecError;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// An external program invocation. Payloads are always passed as a file on
/// stdin, never inlined into the argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin_file: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// `bash -c <script>`; the script travels as a single argument.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(path) = &self.stdin_file {
            write!(f, " < {}", path.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Process boundary of the engine. Production code uses [`SystemRunner`];
/// tests substitute a fake kernel.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput, ExecError>> + Send;
}

/// Runs commands with `tokio::process`, optionally through `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg(&invocation.program);
            c
        } else {
            Command::new(&invocation.program)
        };
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = self.command(invocation);

        match &invocation.stdin_file {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| ExecError::Stdin {
                        path: path.clone(),
                        source,
                    })?;
                command.stdin(Stdio::from(file.into_std().await));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        debug!("exec: {}", invocation);
        let child = command.spawn().map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    program: invocation.program.clone(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ExecError::Failed {
                program: invocation.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}
