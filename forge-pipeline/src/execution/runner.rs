// Pipeline Runner
// Drives the active stages in order, halting on required failures

use crate::discovery::{Discovery, FsDiscovery};
use crate::execution::degradable::DegradablePhase;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender, StageStatus};
use crate::execution::report::PipelineReport;
use crate::execution::run::{PipelineRun, StepLedger};
use crate::models::{CommandUnit, Step};
use crate::postcondition::{override_expected_failure, verify, Postcondition};
use crate::reclaim::DiskReclaimer;
use crate::runners::CommandExecutor;
use crate::stages::recipes::{write_cross_sysroot, BoltTarget};
use crate::stages::{Recipes, StageId};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const PROFILE_BUILD_NOTE: &str = "Build failed at link step (expected); profraw files collected";

/// Runs the toolchain stages against a command executor
pub struct PipelineRunner {
    recipes: Recipes,
    executor: Arc<dyn CommandExecutor>,
    discovery: Arc<dyn Discovery>,
    reclaimer: DiskReclaimer,
    event_tx: Option<ProgressSender>,
}

impl PipelineRunner {
    pub fn new(recipes: Recipes, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            recipes,
            executor,
            discovery: Arc::new(FsDiscovery),
            reclaimer: DiskReclaimer::new(),
            event_tx: None,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.reclaimer = DiskReclaimer::new().with_progress(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    /// Run `stages` and aggregate the outcome. Emits one `PipelineCompleted`.
    pub async fn execute(&self, stages: &[StageId]) -> PipelineReport {
        let start = Instant::now();
        let run = self.run(stages).await;
        let report = PipelineReport::from_run(run, start.elapsed());

        tracing::info!(
            success = report.success,
            steps = report.steps.len(),
            failed = report.failed_steps,
            skipped = report.skipped_steps,
            "Pipeline finished: {}",
            report.verdict()
        );
        report.emit(&self.event_tx);
        report
    }

    /// Run `stages` in order and return the raw run state
    pub async fn run(&self, stages: &[StageId]) -> PipelineRun {
        let mut run = PipelineRun::new();
        let total_stages = stages.len();

        self.event_tx.send_event(ExecutionEvent::PipelineStarted {
            start_stage: stages.first().copied().unwrap_or(StageId::CloneLlvm),
            total_stages,
        });

        let output_dir = &self.recipes.layout().output_dir;
        if let Err(e) = fs::create_dir_all(output_dir) {
            tracing::warn!(path = %output_dir.display(), error = %e, "Could not create output directory");
        }

        for (stage_index, &stage) in stages.iter().enumerate() {
            if !run.may_continue() {
                let reason = run.halt_reason().unwrap_or("an earlier stage failed").to_string();
                tracing::info!(stage = %stage, "Stage not entered");
                self.event_tx.send_event(ExecutionEvent::StageSkipped { stage, reason });
                continue;
            }

            tracing::info!(stage = %stage, "Entering stage: {}", stage.description());
            self.event_tx.send_event(ExecutionEvent::StageStarted {
                stage,
                stage_index,
                total_stages,
            });
            let stage_start = Instant::now();

            let status = match stage {
                StageId::CloneLlvm => self.clone_llvm(&mut run).await,
                StageId::BuildNinja => self.build_ninja(&mut run).await,
                StageId::Stage1Build => self.stage1_build(&mut run).await,
                StageId::ProfileCollection => self.profile_collection(&mut run).await,
                StageId::Stage2Build => self.stage2_build(&mut run).await,
                StageId::BoltOptimization => self.bolt_optimization(&mut run).await,
                StageId::Package => self.package(&mut run).await,
            };

            self.event_tx.send_event(ExecutionEvent::StageCompleted {
                stage,
                status,
                duration: stage_start.elapsed(),
            });
        }

        run
    }

    /// Execute `unit` if the ledger still allows work and record its step
    async fn step<L>(&self, ledger: &mut L, unit: CommandUnit) -> bool
    where
        L: StepLedger + Send,
    {
        if !ledger.can_proceed() {
            return false;
        }
        let step = self.executor.execute(&unit).await;
        self.record(ledger, step)
    }

    fn record<L: StepLedger>(&self, ledger: &mut L, step: Step) -> bool {
        self.event_tx.send_event(ExecutionEvent::StepCompleted { step: step.clone() });
        ledger.record(step)
    }

    fn required_status(run: &PipelineRun) -> StageStatus {
        if run.may_continue() {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        }
    }

    fn warn(&self, stage: StageId, message: String) {
        tracing::warn!(stage = %stage, "{}", message);
        self.event_tx.send_event(ExecutionEvent::warning(message, Some(stage)));
    }

    fn info(&self, stage: StageId, message: String) {
        tracing::info!(stage = %stage, "{}", message);
        self.event_tx.send_event(ExecutionEvent::info(message, Some(stage)));
    }

    async fn clone_llvm(&self, run: &mut PipelineRun) -> StageStatus {
        let layout = self.recipes.layout();
        self.reclaimer.reclaim(StageId::CloneLlvm, &[layout.llvm_source.clone()]);

        self.step(run, self.recipes.clone_llvm()).await;
        Self::required_status(run)
    }

    async fn build_ninja(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::BuildNinja;
        let layout = self.recipes.layout();
        self.reclaimer
            .reclaim(stage, &[layout.ninja_source.clone(), layout.ninja_build.clone()]);

        self.step(run, self.recipes.clone_ninja()).await;
        self.step(run, self.recipes.patch_ninja()).await;
        self.step(run, self.recipes.build_ninja()).await;

        if run.may_continue() {
            self.info(
                stage,
                format!("Custom Ninja built at {}", layout.custom_ninja().display()),
            );
            self.reclaimer.reclaim(stage, &[layout.ninja_source.clone()]);
        }
        Self::required_status(run)
    }

    async fn stage1_build(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::Stage1Build;
        let layout = self.recipes.layout();
        self.reclaimer
            .reclaim(stage, &[layout.stage1_build.clone(), layout.stage1_install.clone()]);

        self.step(run, self.recipes.stage1_configure()).await;
        self.step(run, self.recipes.stage1_build()).await;
        self.step(run, self.recipes.stage1_install()).await;

        if run.may_continue() {
            match self.resource_include() {
                Some(include) => {
                    self.step(run, self.recipes.install_xray_headers(&include)).await;
                }
                None => self.warn(
                    stage,
                    format!(
                        "No clang resource directory found in {}",
                        layout.stage1_install.join("lib/clang/*/include").display()
                    ),
                ),
            }
        }
        Self::required_status(run)
    }

    /// `lib/clang/<version>/include` of the stage 1 install
    fn resource_include(&self) -> Option<PathBuf> {
        let (dir, pattern) = self.recipes.resource_dir_query();
        let include = self.discovery.newest(&dir, &pattern)?.join("include");
        self.discovery.exists(&include).then_some(include)
    }

    async fn profile_collection(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::ProfileCollection;
        let layout = self.recipes.layout();
        self.reclaimer.reclaim(stage, &[layout.profile_build.clone()]);

        self.step(run, self.recipes.checkout_submodules()).await;
        self.step(run, self.recipes.profile_configure()).await;

        if run.may_continue() {
            let mut build = self.executor.execute(&self.recipes.profile_build()).await;
            let profiles = self.recipes.raw_profiles().check(self.discovery.as_ref());
            if override_expected_failure(&mut build, &profiles, PROFILE_BUILD_NOTE) {
                self.info(
                    stage,
                    "Build finished with errors (link failures with the instrumented compiler are expected)"
                        .to_string(),
                );
            }
            self.record(run, build);
        }

        if run.may_continue() {
            self.check(run, stage, "Verify raw PGO profiles", &self.recipes.raw_profiles());
        }
        self.step(run, self.recipes.merge_profiles()).await;
        if run.may_continue() {
            self.check(run, stage, "Verify merged PGO profile", &self.recipes.merged_profile());
        }

        self.save_ninja_log(stage);

        self.reclaimer.reclaim(
            stage,
            &[
                layout.stage1_build.clone(),
                layout.profile_build.clone(),
                layout.stage1_install.clone(),
            ],
        );
        Self::required_status(run)
    }

    /// Record a verification step for an artifact a command may have failed
    /// to produce despite exiting zero
    fn check(&self, run: &mut PipelineRun, stage: StageId, name: &str, condition: &Postcondition) {
        let outcome = condition.check(self.discovery.as_ref());
        self.record(run, verify(stage, name, &outcome));
    }

    /// Keep the build's timing log; it is shipped with the toolchain to seed
    /// scheduling in later builds
    fn save_ninja_log(&self, stage: StageId) {
        let source = self.recipes.profile_ninja_log();
        let saved = &self.recipes.layout().saved_ninja_log;

        if !self.discovery.exists(&source) {
            self.warn(stage, ".ninja_log not found after profile collection build".to_string());
            return;
        }

        match fs::copy(&source, saved) {
            Ok(bytes) => self.info(stage, format!("Saved .ninja_log ({} bytes)", bytes)),
            Err(e) => self.warn(stage, format!("Could not save .ninja_log: {}", e)),
        }
    }

    async fn stage2_build(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::Stage2Build;
        let layout = self.recipes.layout();
        self.reclaimer
            .reclaim(stage, &[layout.stage2_build.clone(), layout.stage2_install.clone()]);

        if let Err(e) = write_cross_sysroot(&layout.cross_sysroot) {
            self.record(
                run,
                Step::failed(stage, "Prepare cross builtins sysroot").with_note(e.to_string()),
            );
        }

        self.step(run, self.recipes.stage2_configure()).await;
        self.step(run, self.recipes.stage2_build()).await;
        self.step(run, self.recipes.stage2_install()).await;

        self.reclaimer.reclaim(stage, &[layout.stage2_build.clone()]);
        Self::required_status(run)
    }

    async fn bolt_optimization(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::BoltOptimization;
        let mut phase = DegradablePhase::new(stage);

        let located = self.discovery.locate(&self.recipes.clang_query());
        if !located.found {
            self.warn(
                stage,
                format!("No versioned clang found, using {}", located.path.display()),
            );
        }
        self.info(stage, format!("BOLT target binary: {}", located.path.display()));
        let target = self.recipes.bolt_target(located.path);

        self.reclaim_bolt(&target);
        let profiles_dir = &self.recipes.layout().bolt_profiles;
        if let Err(e) = fs::create_dir_all(profiles_dir) {
            phase.degrade(format!("could not create {}: {}", profiles_dir.display(), e));
        }

        self.step(&mut phase, self.recipes.bolt_instrument(&target)).await;

        if phase.is_ok() {
            if let Err(e) = link_instrumented_clangpp(&target) {
                phase.degrade(format!("failed to create clang++ symlink: {}", e));
            }
        }

        self.step(&mut phase, self.recipes.bolt_configure(&target)).await;
        self.step(&mut phase, self.recipes.bolt_collect()).await;

        if phase.is_ok() {
            let outcome = self.recipes.bolt_profiles().check(self.discovery.as_ref());
            if outcome.satisfied {
                self.info(stage, format!("Collected {} BOLT profile files", outcome.count));
            } else {
                phase.degrade("no BOLT profiles collected");
            }
        }

        self.step(&mut phase, self.recipes.bolt_merge(&target)).await;
        self.step(&mut phase, self.recipes.bolt_optimize(&target)).await;
        self.step(&mut phase, self.recipes.bolt_install(&target)).await;

        let outcome = phase.finish();
        let status = match &outcome.degradation {
            Some(degradation) => {
                self.warn(
                    stage,
                    format!(
                        "Packaging PGO-only toolchain, BOLT was skipped: {}",
                        degradation.reason
                    ),
                );
                self.event_tx.send_event(ExecutionEvent::PhaseDegraded {
                    stage,
                    step_name: degradation.step_name.clone(),
                    reason: degradation.reason.clone(),
                });
                run.record_degradation(degradation.reason.clone());
                StageStatus::Degraded
            }
            None => {
                self.info(stage, "BOLT optimization applied successfully".to_string());
                StageStatus::Succeeded
            }
        };
        run.append(outcome.steps);

        self.reclaim_bolt(&target);
        status
    }

    fn reclaim_bolt(&self, target: &BoltTarget) {
        let layout = self.recipes.layout();
        let mut files = target.intermediates();
        files.push(layout.bolt_fdata.clone());

        self.reclaimer.reclaim_all(
            StageId::BoltOptimization,
            &[layout.bolt_build.clone(), layout.bolt_profiles.clone()],
            &files,
        );
    }

    async fn package(&self, run: &mut PipelineRun) -> StageStatus {
        let stage = StageId::Package;
        let layout = self.recipes.layout();

        let ninja = layout.custom_ninja();
        if self.discovery.exists(&ninja) {
            let dest = self.recipes.packaged_ninja();
            match install_file(&ninja, &dest, Some(0o755)) {
                Ok(()) => self.info(stage, format!("Installed custom Ninja to {}", dest.display())),
                Err(e) => self.warn(stage, format!("Could not install custom Ninja: {}", e)),
            }
        } else {
            self.warn(stage, format!("Custom Ninja not found at {}", ninja.display()));
        }

        if self.discovery.exists(&layout.saved_ninja_log) {
            let dest = self.recipes.packaged_ninja_log();
            match install_file(&layout.saved_ninja_log, &dest, None) {
                Ok(()) => self.info(stage, format!("Installed .ninja_log to {}", dest.display())),
                Err(e) => self.warn(stage, format!("Could not install .ninja_log: {}", e)),
            }
        } else {
            self.warn(stage, "No saved .ninja_log to package".to_string());
        }

        self.step(run, self.recipes.strip_binaries()).await;
        self.step(run, self.recipes.archive()).await;

        if run.may_continue() {
            let archive = Postcondition::NonEmptyFile(layout.archive.clone());
            self.check(run, stage, "Verify toolchain archive", &archive);
        }

        if run.may_continue() {
            if let Some(size) = self.discovery.file_size(&layout.archive) {
                self.info(
                    stage,
                    format!("Toolchain archive size: {:.1} MB", size as f64 / (1024.0 * 1024.0)),
                );
            }
        }
        Self::required_status(run)
    }
}

/// Copy `source` to `dest`, creating parent directories
fn install_file(source: &Path, dest: &Path, mode: Option<u32>) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// `clang++.inst -> <clang>.inst`, so the instrumented binary also runs as the
/// C++ driver
#[cfg(unix)]
fn link_instrumented_clangpp(target: &BoltTarget) -> io::Result<()> {
    let link = &target.clangpp_instrumented;
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target.instrumented_name(), link)
}

#[cfg(not(unix))]
fn link_instrumented_clangpp(_target: &BoltTarget) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks require a unix host",
    ))
}
