/// Subprocess-backed step runner.
///
/// `exec` bodies run through `sh -c`; `prompt` bodies are handed to a
/// headless LLM CLI (for example `claude -p`) as the final argument. In
/// both cases the resolved step input is written to stdin.
use crate::errors::{StepError, StepResult};
use crate::traits::StepRunner;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProcessStepRunner {
    shell: String,
    prompt_command: Vec<String>,
    working_dir: Option<PathBuf>,
    environment: HashMap<String, String>,
}

impl Default for ProcessStepRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            prompt_command: vec!["claude".to_string(), "-p".to_string()],
            working_dir: None,
            environment: HashMap::new(),
        }
    }
}

impl ProcessStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command line used for prompt steps, e.g. `["claude", "-p"]`.
    pub fn with_prompt_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.prompt_command = command;
        }
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut command = Command::new(program);
        command.args(args);

        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // A timed-out step must not leave the child behind
        command.kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.environment {
            command.env(key, value);
        }
        command
    }

    async fn run(
        &self,
        mut command: Command,
        label: &str,
        input: Option<&str>,
        timeout: Duration,
    ) -> StepResult<String> {
        let mut child = command.spawn().map_err(|e| StepError::Spawn {
            command: label.to_string(),
            message: e.to_string(),
        })?;

        // Feeding stdin and draining stdout/stderr proceed together under one
        // deadline, so a child that never reads its input cannot outlive it
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut pipe) = stdin else { return };
            if let Some(input) = input {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("stdin write to '{}' ended early: {}", label, e);
                }
            }
        };
        let exchange = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| StepError::Timeout(timeout.as_secs()))?
            .map_err(|e| StepError::Io(e.to_string()))?;

        if !output.status.success() {
            return Err(StepError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim_end_matches(['\n', '\r']).to_string())
    }
}

#[async_trait]
impl StepRunner for ProcessStepRunner {
    async fn run_exec(&self, command: &str, input: Option<&str>, timeout: Duration) -> StepResult<String> {
        debug!("exec: {}", command);
        let cmd = self.command(&self.shell, &["-c".to_string(), command.to_string()]);
        self.run(cmd, command, input, timeout).await
    }

    async fn run_prompt(&self, prompt: &str, input: Option<&str>, timeout: Duration) -> StepResult<String> {
        let (program, base_args) = self
            .prompt_command
            .split_first()
            .ok_or_else(|| StepError::Spawn {
                command: String::new(),
                message: "no prompt command configured".to_string(),
            })?;
        let mut args = base_args.to_vec();
        args.push(prompt.to_string());

        debug!("prompt via {}", program);
        let cmd = self.command(program, &args);
        self.run(cmd, program, input, timeout).await
    }
}
