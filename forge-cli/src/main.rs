use clap::Parser;
use color_eyre::Result;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::run::RunArgs;

/// Build a PGO and BOLT optimized clang toolchain.
///
/// Runs the stages in order (clone_llvm, build_ninja, stage1_build,
/// profile_collection, stage2_build, bolt_optimization, package) and writes a
/// single archive. A failed required stage stops the run; a failed
/// bolt_optimization only skips the optimization.
///
/// EXAMPLES:
///     build-toolchain                              Run every stage
///     build-toolchain --start-stage stage2_build   Resume from stage 2
///     build-toolchain --config forge.yaml --json   Custom config, JSON report
///
/// ENVIRONMENT VARIABLES:
///     FORGE_START_STAGE  Stage to start from
///     FORGE_CONFIG       Path to the YAML configuration
///     RUST_LOG           Log filter for structured logs (default: warn)
#[derive(Parser, Debug)]
#[command(name = "build-toolchain")]
#[command(version)]
struct Cli {
    /// List the stages in order and exit
    #[arg(long)]
    list_stages: bool,

    #[command(flatten)]
    run: RunArgs,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing();

    if cli.list_stages {
        commands::run::list_stages();
        return Ok(ExitCode::SUCCESS);
    }

    commands::run::execute(cli.run).await
}
