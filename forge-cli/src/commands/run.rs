use crate::output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use forge_pipeline::execution::events::{progress_channel, LogLevel};
use forge_pipeline::host::{check_tools_on_path, required_tools};
use forge_pipeline::{
    ExecutionEvent, ForgeConfig, HostArch, PipelineReport, PipelineRunner, Recipes, ServiceResult,
    ShellExecutor, StageId, StageRegistry, StageStatus, StepStatus,
};

/// Exit status for configuration problems found before any work starts
const CONFIG_ERROR: u8 = 2;

/// Options for a toolchain build
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Stage to start from; earlier stages are assumed complete
    #[arg(
        long = "start-stage",
        alias = "param",
        env = "FORGE_START_STAGE",
        value_name = "STAGE"
    )]
    pub start_stage: Option<String>,

    /// YAML configuration file (defaults apply when absent)
    #[arg(long, short = 'c', env = "FORGE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Working directory for commands
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,
}

/// Everything resolved before the first stage runs
#[derive(Debug)]
struct Plan {
    config: ForgeConfig,
    arch: HostArch,
    stages: Vec<StageId>,
}

fn prepare<F>(args: &RunArgs, preflight: F) -> ServiceResult<Plan>
where
    F: Fn(&[String]) -> ServiceResult<()>,
{
    let config = match &args.config {
        Some(path) => ForgeConfig::from_file(path)?,
        None => ForgeConfig::default(),
    };
    let stages = StageRegistry::new().active_from(args.start_stage.as_deref())?;
    let arch = HostArch::detect()?;
    preflight(&required_tools(&stages, &config.host_compiler_version))?;

    Ok(Plan {
        config,
        arch,
        stages,
    })
}

pub fn list_stages() {
    output::header("Stages");
    for stage in StageRegistry::new().stages() {
        let marker = if stage.is_degradable() { " (optional)" } else { "" };
        println!("  {:<20} {}{}", stage.name(), stage.description(), marker);
    }
}

pub async fn execute(args: RunArgs) -> Result<ExitCode> {
    let plan = match prepare(&args, check_tools_on_path) {
        Ok(plan) => plan,
        Err(e) => {
            output::error(&e.to_string());
            return Ok(ExitCode::from(CONFIG_ERROR));
        }
    };

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    tracing::info!(
        arch = plan.arch.as_str(),
        stages = plan.stages.len(),
        working_dir = %working_dir.display(),
        "Starting toolchain build"
    );
    output::status("Building", &format!("toolchain for {}", plan.arch.as_str()));
    output::info(&format!(
        "Using toolchain file: {}",
        plan.arch.toolchain_file(&plan.config.repo_path).display()
    ));
    if let Some(first) = plan.stages.first() {
        output::info(&format!("Starting from stage [{}]", first));
    }

    let (tx, mut rx) = progress_channel();

    let executor = ShellExecutor::from_config(&plan.config, working_dir).with_progress(tx.clone());
    let runner = PipelineRunner::new(Recipes::new(plan.config, plan.arch), Arc::new(executor))
        .with_progress(tx);

    // Spawn execution in background
    let stages = plan.stages;
    let exec_handle = tokio::spawn(async move { runner.execute(&stages).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        render(&event, args.json);
    }

    let report = exec_handle.await?;
    summarize(&report);

    if args.json {
        println!("{}", report.to_json()?);
    }

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print one progress event. With `json` set stdout is reserved for the
/// report, so command output goes to stderr.
fn render(event: &ExecutionEvent, json: bool) {
    match event {
        ExecutionEvent::PipelineStarted {
            start_stage,
            total_stages,
        } => {
            eprintln!();
            output::header(&format!(
                "Toolchain build from '{}' ({} stages)",
                start_stage, total_stages
            ));
        }

        ExecutionEvent::PipelineCompleted {
            success, duration, ..
        } => {
            eprintln!();
            if *success {
                output::success(&format!(
                    "Pipeline completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!("Pipeline failed after {:.2}s", duration.as_secs_f64()));
            }
        }

        ExecutionEvent::StageStarted {
            stage,
            stage_index,
            total_stages,
        } => {
            output::stage_header(stage.name(), *stage_index + 1, *total_stages);
        }

        ExecutionEvent::StageCompleted {
            stage,
            status,
            duration,
        } => {
            let line = |symbol: &str| {
                format!("  Stage '{}' {} ({:.2}s)", stage, symbol, duration.as_secs_f64())
            };
            match status {
                StageStatus::Succeeded => output::dim_success(&line("OK")),
                StageStatus::Failed => output::dim_failure(&line("FAIL")),
                StageStatus::Degraded => output::warning(&line("DEGRADED")),
            }
        }

        ExecutionEvent::StageSkipped { stage, reason } => {
            output::warning(&format!("  Stage '{}' skipped: {}", stage, reason));
        }

        ExecutionEvent::StepStarted { step_name, .. } => {
            eprintln!("      {}", step_name);
        }

        ExecutionEvent::StepRetrying {
            step_name,
            attempt,
            max_attempts,
            delay,
            ..
        } => {
            output::warning(&format!(
                "        {} failed, attempt {}/{} in {}s",
                step_name,
                attempt,
                max_attempts,
                delay.as_secs()
            ));
        }

        ExecutionEvent::StepOutput {
            output, is_error, ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(line);
                } else if json {
                    output::dim(&format!("        | {}", line));
                } else {
                    output::step_output(line);
                }
            }
        }

        ExecutionEvent::StepCompleted { step } => {
            let exit_info = match step.exit_code {
                Some(code) if code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "        {} ({:.2}s){}",
                step.status,
                step.duration.as_secs_f64(),
                exit_info
            );
            match step.status {
                StepStatus::Succeeded => output::dim_success(&line),
                StepStatus::Failed => output::dim_failure(&line),
                StepStatus::Skipped => output::dim(&line),
            }
            if let Some(note) = &step.note {
                output::dim(&format!("        {}", note));
            }
        }

        ExecutionEvent::PhaseDegraded {
            stage,
            step_name,
            reason,
        } => {
            let at = step_name
                .as_deref()
                .map(|name| format!(" at '{}'", name))
                .unwrap_or_default();
            output::warning(&format!("  Stage '{}' degraded{}: {}", stage, at, reason));
        }

        ExecutionEvent::DirectoryReclaimed { path, .. } => {
            output::dim(&format!("        [reclaimed] {}", path.display()));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Info => output::info(message),
        },
    }
}

/// Per-step table and the overall verdict
fn summarize(report: &PipelineReport) {
    eprintln!();
    output::header("Results");
    for step in &report.steps {
        let line = format!("  {:<8} {:<20} {}", step.status, step.stage, step.name);
        match step.status {
            StepStatus::Succeeded => output::dim_success(&line),
            StepStatus::Failed => output::dim_failure(&line),
            StepStatus::Skipped => output::dim(&line),
        }
        if let Some(note) = &step.note {
            output::dim(&format!("           {}", note));
        }
    }

    eprintln!();
    output::info(&format!(
        "{} succeeded, {} failed, {} skipped",
        report.succeeded_steps, report.failed_steps, report.skipped_steps
    ));
    if let Some(reason) = &report.halt_reason {
        output::error(reason);
    }
    for reason in &report.degradations {
        output::warning(&format!("Optional optimization skipped: {}", reason));
    }

    let verdict = report.verdict().to_string();
    if report.success {
        output::success(&verdict);
    } else {
        output::failure(&verdict);
    }
}
