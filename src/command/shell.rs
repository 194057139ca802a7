//! Shell subprocess runner - runs step commands through `sh -c`

use crate::command::{CommandError, CommandOutcome, CommandRunner, Invocation};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

/// Runs step commands as shell subprocesses, tee-ing their output into the log
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Shell used for `<shell> -c <command>`
    shell: String,

    /// Echo step output to the terminal as well as the log
    echo: bool,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            echo: true,
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    async fn open_log(&self, invocation: &Invocation) -> Result<File, CommandError> {
        let log_error = |source| CommandError::Log {
            path: invocation.log_path.clone(),
            source,
        };
        if let Some(dir) = invocation.log_path.parent() {
            fs::create_dir_all(dir).await.map_err(log_error)?;
        }
        let mut log = File::create(&invocation.log_path).await.map_err(log_error)?;
        let header = format!("$ {}\n", invocation.display_command());
        log.write_all(header.as_bytes()).await.map_err(log_error)?;
        Ok(log)
    }

    /// Copy both output streams into the log, byte for byte, in arrival order
    async fn pump(
        &self,
        stdout: ChildStdout,
        stderr: ChildStderr,
        log: &mut File,
        invocation: &Invocation,
    ) -> Result<(), CommandError> {
        let log_error = |source| CommandError::Log {
            path: invocation.log_path.clone(),
            source,
        };

        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        // Partial reads stay in these buffers when the other branch wins the select
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                read = out.read_until(b'\n', &mut out_buf), if !out_done => {
                    if read.map_err(log_error)? == 0 {
                        out_done = true;
                    } else {
                        if self.echo {
                            print!("{}", String::from_utf8_lossy(&out_buf));
                        }
                        log.write_all(&out_buf).await.map_err(log_error)?;
                        out_buf.clear();
                    }
                },
                read = err.read_until(b'\n', &mut err_buf), if !err_done => {
                    if read.map_err(log_error)? == 0 {
                        err_done = true;
                    } else {
                        if self.echo {
                            eprint!("{}", String::from_utf8_lossy(&err_buf));
                        }
                        log.write_all(&err_buf).await.map_err(log_error)?;
                        err_buf.clear();
                    }
                },
            }
        }
        log.flush().await.map_err(log_error)
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome, CommandError> {
        let mut log = self.open_log(invocation).await?;

        debug!("Spawning {} for step {}", self.shell, invocation.step_id);
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&invocation.command)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: invocation.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommandError::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommandError::Internal("stderr was not captured".to_string()))?;

        if let Err(e) = self.pump(stdout, stderr, &mut log, invocation).await {
            // kill() also reaps the child
            if let Err(kill_error) = child.kill().await {
                warn!("Failed to kill {}: {}", invocation.step_id, kill_error);
            }
            return Err(e);
        }

        let status = child.wait().await.map_err(|source| CommandError::Spawn {
            command: invocation.command.clone(),
            source,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!("{} exited with code {}", invocation.step_id, exit_code);
        }

        Ok(CommandOutcome { exit_code })
    }
}
