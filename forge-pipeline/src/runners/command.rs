// Command Executor
// Runs command units through the shell runner with bounded retries

use crate::config::ForgeConfig;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::models::{CommandUnit, Step, StepStatus};
use crate::runners::shell::{OutputCallback, ShellConfig, ShellRunner};
use crate::runners::CommandExecutor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::Instant as Deadline;

/// Outcome of one pass over a unit's commands
struct Attempt {
    success: bool,
    timed_out: bool,
    exit_code: Option<i32>,
    output: String,
    failure: Option<String>,
}

/// Production executor backed by `sh -c`
pub struct ShellExecutor {
    runner: ShellRunner,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    retry_delay: Duration,
    shell_config: ShellConfig,
    event_tx: Option<ProgressSender>,
}

impl ShellExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner: ShellRunner::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            retry_delay: Duration::from_secs(5),
            shell_config: ShellConfig::default(),
            event_tx: None,
        }
    }

    /// Executor using the retry delay, output tail and environment of `config`
    pub fn from_config(config: &ForgeConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self::new(working_dir)
            .with_env(config.env.clone())
            .with_retry_delay(config.retry_delay())
            .with_tail_lines(config.output_tail_lines)
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.shell_config.tail_lines = lines;
        self
    }

    /// Time between interrupting and killing a unit that ran past its time box
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.shell_config.kill_grace = grace;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn output_callback(&self, unit: &CommandUnit) -> Option<OutputCallback> {
        let tx = self.event_tx.clone()?;
        let stage = unit.stage;
        let step_name = unit.name.clone();
        Some(Arc::new(move |line: &str, is_error: bool| {
            tx.send_event(ExecutionEvent::StepOutput {
                stage,
                step_name: step_name.clone(),
                output: line.to_string(),
                is_error,
            });
        }))
    }

    async fn attempt(&self, unit: &CommandUnit) -> Attempt {
        let deadline = unit.time_box.map(|limit| Deadline::now() + limit);
        let mut outputs = Vec::new();
        let mut exit_code = None;

        for (index, command) in unit.commands.iter().enumerate() {
            let mut config = self.shell_config.clone();
            config.timeout =
                deadline.map(|d| d.saturating_duration_since(Deadline::now()));

            tracing::debug!(stage = %unit.stage, step = %unit.name, command = %command, "Running command");

            let output = self
                .runner
                .run(
                    command,
                    &self.env,
                    &self.working_dir,
                    &config,
                    self.output_callback(unit),
                )
                .await;

            let combined = output.combined();
            if !combined.is_empty() {
                outputs.push(combined);
            }
            exit_code = output.exit_code;

            if output.timed_out {
                return Attempt {
                    success: true,
                    timed_out: true,
                    exit_code,
                    output: outputs.join("\n"),
                    failure: None,
                };
            }

            if !output.success() {
                let failure = match output.exit_code {
                    Some(code) => format!(
                        "command {} of {} exited with code {}",
                        index + 1,
                        unit.commands.len(),
                        code
                    ),
                    None => format!(
                        "command {} of {} did not exit normally",
                        index + 1,
                        unit.commands.len()
                    ),
                };
                return Attempt {
                    success: false,
                    timed_out: false,
                    exit_code,
                    output: outputs.join("\n"),
                    failure: Some(failure),
                };
            }
        }

        Attempt {
            success: true,
            timed_out: false,
            exit_code,
            output: outputs.join("\n"),
            failure: None,
        }
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, unit: &CommandUnit) -> Step {
        let start = Instant::now();
        let max_attempts = unit.retries + 1;
        let mut retries_used = 0;

        self.event_tx.send_event(ExecutionEvent::StepStarted {
            stage: unit.stage,
            step_name: unit.name.clone(),
        });

        let attempt = loop {
            let attempt = self.attempt(unit).await;
            if attempt.success || retries_used >= unit.retries {
                break attempt;
            }

            retries_used += 1;
            tracing::warn!(
                stage = %unit.stage,
                step = %unit.name,
                attempt = retries_used,
                max_attempts,
                delay_ms = self.retry_delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            self.event_tx.send_event(ExecutionEvent::StepRetrying {
                stage: unit.stage,
                step_name: unit.name.clone(),
                attempt: retries_used + 1,
                max_attempts,
                delay: self.retry_delay,
            });
            tokio::time::sleep(self.retry_delay).await;
        };

        let status = if attempt.success {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };

        let mut step = Step::new(unit.stage, unit.name.clone(), status);
        step.output = attempt.output;
        step.exit_code = attempt.exit_code;
        step.retries_used = retries_used;
        step.duration = start.elapsed();

        if let Some(failure) = attempt.failure {
            step.add_note(failure);
        }
        if attempt.timed_out {
            if let Some(limit) = unit.time_box {
                step.add_note(format!(
                    "time limit of {}s reached; partial output kept",
                    limit.as_secs()
                ));
            }
        }
        if attempt.success && retries_used > 0 {
            step.add_note(format!("succeeded after {} retries", retries_used));
        }

        tracing::info!(
            stage = %unit.stage,
            step = %unit.name,
            status = %step.status,
            retries = retries_used,
            duration_secs = step.duration.as_secs_f64(),
            "Step finished"
        );

        step
    }
}
