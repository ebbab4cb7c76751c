// Generic deployment pipeline runner.
//
// Both orchestrators describe their work as an ordered list of stage
// descriptors (name, progress window, fatal-vs-warning criticality,
// run-if predicate) and a single runner evaluates the list. Progress is
// fired synchronously before and after every stage; observers must not
// block.
//
// Dry-run is a field on the run options, not ambient global state. It is
// checked before any real step: the runner walks the same stage list on a
// fixed delay schedule, mutates nothing and always succeeds, so the
// orchestration UX can be exercised without side effects.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::time::Instant;
use tokio::time::Duration;

use crate::models::{PipelineReport, ProgressEmitter, ProgressPayload, StepResult};

/// Delay between simulated stages in a dry run.
const DRY_RUN_STAGE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure aborts the remaining stages and fails the run.
    Fatal,
    /// Failure is recorded as a warning; the run continues and still
    /// reports overall success.
    Warning,
}

/// One stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stable identifier the handler dispatches on.
    pub name: &'static str,
    /// Human label for progress messages.
    pub label: &'static str,
    /// Percent reported when the stage starts.
    pub percent_start: i32,
    /// Percent reported when the stage completes.
    pub percent_done: i32,
    pub criticality: Criticality,
}

/// Executes stages by name. Implemented by each orchestrator.
#[async_trait]
pub trait StageHandler: Send {
    /// Phase tag carried in progress payloads ("install", "uninstall").
    fn phase(&self) -> &'static str;

    /// Run-if predicate; a disabled stage is skipped without progress noise.
    fn stage_enabled(&self, _stage: &StageSpec) -> bool {
        true
    }

    /// Execute one stage. `Err` is equivalent to a failed `StepResult`.
    async fn run_stage(&mut self, stage: &StageSpec) -> Result<StepResult>;
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub correlation_id: String,
    pub dry_run: bool,
}

impl PipelineOptions {
    pub fn new(dry_run: bool) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            dry_run,
        }
    }
}

pub async fn run_pipeline<H: StageHandler>(
    handler: &mut H,
    stages: &[StageSpec],
    opts: &PipelineOptions,
    progress: &ProgressEmitter,
) -> PipelineReport {
    let started = Instant::now();
    let phase = handler.phase();

    let emit = |step: &str, severity: &str, percent: i32, message: String| {
        progress(ProgressPayload {
            correlation_id: opts.correlation_id.clone(),
            step: step.to_string(),
            severity: severity.to_string(),
            phase: phase.to_string(),
            percent,
            message,
            elapsed_ms: Some(started.elapsed().as_millis()),
        });
    };

    // Dry-run short-circuits before any real stage work.
    if opts.dry_run {
        info!(
            "[PHASE: {}] [STEP: pipeline] Dry run requested; simulating {} stages",
            phase,
            stages.len()
        );
        for stage in stages {
            emit(
                stage.name,
                "info",
                stage.percent_start,
                format!("{}...", stage.label),
            );
            tokio::time::sleep(DRY_RUN_STAGE_DELAY).await;
            emit(
                stage.name,
                "info",
                stage.percent_done,
                format!("{} (dry run)", stage.label),
            );
        }
        return PipelineReport {
            success: true,
            message: format!("Dry run complete; {} stages simulated", stages.len()),
            error: None,
            warnings: Vec::new(),
            correlation_id: opts.correlation_id.clone(),
        };
    }

    let mut warnings: Vec<String> = Vec::new();

    for stage in stages {
        if !handler.stage_enabled(stage) {
            debug!(
                "[PHASE: {}] [STEP: pipeline] Stage '{}' disabled for this run; skipping",
                phase, stage.name
            );
            continue;
        }

        emit(
            stage.name,
            "info",
            stage.percent_start,
            format!("{}...", stage.label),
        );
        info!(
            "[PHASE: {}] [STEP: {}] Stage entered ({}%)",
            phase, stage.name, stage.percent_start
        );

        let result = match handler.run_stage(stage).await {
            Ok(result) => result,
            Err(e) => StepResult::fail(format!("{} failed", stage.label), format!("{:#}", e)),
        };

        if result.success {
            emit(stage.name, "info", stage.percent_done, result.message.clone());
            info!(
                "[PHASE: {}] [STEP: {}] Stage complete: {}",
                phase, stage.name, result.message
            );
            continue;
        }

        let detail = result
            .error
            .clone()
            .unwrap_or_else(|| result.message.clone());

        match stage.criticality {
            Criticality::Fatal => {
                error!(
                    "[PHASE: {}] [STEP: {}] Fatal stage failure: {}",
                    phase, stage.name, detail
                );
                emit(
                    stage.name,
                    "error",
                    stage.percent_start,
                    format!("{} failed: {}", stage.label, detail),
                );
                return PipelineReport {
                    success: false,
                    message: format!("{} failed", stage.label),
                    error: Some(detail),
                    warnings,
                    correlation_id: opts.correlation_id.clone(),
                };
            }
            Criticality::Warning => {
                warn!(
                    "[PHASE: {}] [STEP: {}] Non-fatal stage failure: {}",
                    phase, stage.name, detail
                );
                emit(
                    stage.name,
                    "warn",
                    stage.percent_done,
                    format!("{} reported a problem: {}", stage.label, detail),
                );
                warnings.push(format!("{}: {}", stage.label, detail));
            }
        }
    }

    let message = if warnings.is_empty() {
        "Completed successfully".to_string()
    } else {
        format!("Completed with {} warning(s)", warnings.len())
    };

    PipelineReport {
        success: true,
        message,
        error: None,
        warnings,
        correlation_id: opts.correlation_id.clone(),
    }
}
