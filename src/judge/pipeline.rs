//! Build/execute pipeline.
//!
//! Drives one request through an environment as a closed state machine:
//!
//! ```text
//! Writing -> Compiling -> CompileFailed
//!                      -> Running -> RunFailed | RunTimedOut
//!                                 -> Completed -> [Disassembling] -> Done
//! ```
//!
//! Compile-only requests go from a clean compile straight to `Completed`.
//! Every terminal stage ends in `Done`. Infrastructure faults at any stage
//! end the run with `infrastructure-error` and contaminate the environment.

use crate::config::service::TimeoutPolicy;
use crate::config::types::{
    Diagnostic, ExecutionRequest, ExecutionResult, FailureKind, Outcome, ResourceLimits, Result,
    SandboxError, Severity,
};
use crate::core::environment::{IsolatedEnvironment, RunReport, RunStatus};
use crate::judge::toolchain::{BuildOptions, Toolchain, ARTIFACT_NAME, SOURCE_NAME};
use crate::utils::output::truncate_text;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Writing,
    Compiling,
    CompileFailed,
    Running,
    RunFailed,
    RunTimedOut,
    Completed,
    Disassembling,
    Done,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }
}

/// What a pipeline run produced
#[derive(Debug)]
pub struct PipelineReport {
    pub result: ExecutionResult,
    /// Stages visited, in order
    pub trace: Vec<Stage>,
}

pub struct Pipeline {
    toolchain: Arc<dyn Toolchain>,
    timeouts: TimeoutPolicy,
}

/// Mutable state threaded through the stages of one run
struct RunState<'a> {
    env: &'a mut IsolatedEnvironment,
    request: &'a ExecutionRequest,
    limits: &'a ResourceLimits,
    result: ExecutionResult,
    compile_elapsed: Duration,
}

impl Pipeline {
    pub fn new(toolchain: Arc<dyn Toolchain>, timeouts: TimeoutPolicy) -> Self {
        Self {
            toolchain,
            timeouts,
        }
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    /// Run `request` inside `env` under `limits`. Never fails: faults are
    /// folded into the returned result.
    pub fn execute(
        &self,
        env: &mut IsolatedEnvironment,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        request_id: &str,
    ) -> PipelineReport {
        let mut result = ExecutionResult::new(request_id, Outcome::Success);
        result.environment_id = Some(env.id().to_string());
        result.limits = Some(limits.clone());

        let mut state = RunState {
            env,
            request,
            limits,
            result,
            compile_elapsed: Duration::ZERO,
        };
        let mut trace = Vec::new();
        let mut stage = Stage::Writing;

        loop {
            trace.push(stage);
            if stage.is_terminal() {
                break;
            }
            stage = match self.step(stage, &mut state) {
                Ok(next) => next,
                Err(e) => {
                    log::error!(
                        "[{}] infrastructure fault during {:?}: {}",
                        request_id,
                        stage,
                        e
                    );
                    state.env.mark_contaminated(format!("{:?} failed: {}", stage, e));
                    let failure = match e {
                        SandboxError::Provisioning(_) => FailureKind::Provisioning,
                        _ => FailureKind::Infrastructure,
                    };
                    let mut failed =
                        ExecutionResult::infrastructure(request_id, failure, e.to_string());
                    failed.environment_id = state.result.environment_id.take();
                    failed.limits = state.result.limits.take();
                    failed.timings = state.result.timings.clone();
                    failed.diagnostics = std::mem::take(&mut state.result.diagnostics);
                    state.result = failed;
                    Stage::Done
                }
            };
        }

        PipelineReport {
            result: state.result,
            trace,
        }
    }

    fn step(&self, stage: Stage, state: &mut RunState<'_>) -> Result<Stage> {
        match stage {
            Stage::Writing => self.write_sources(state),
            Stage::Compiling => self.compile(state),
            Stage::Running => self.run(state),
            Stage::Completed => Ok(if state.request.mode.disassembles() {
                Stage::Disassembling
            } else {
                Stage::Done
            }),
            Stage::Disassembling => self.disassemble(state),
            Stage::CompileFailed | Stage::RunFailed | Stage::RunTimedOut | Stage::Done => {
                Ok(Stage::Done)
            }
        }
    }

    fn write_sources(&self, state: &mut RunState<'_>) -> Result<Stage> {
        let env = &*state.env;
        env.write_file(&format!("work/{}", SOURCE_NAME), state.request.source.as_bytes())?;
        for file in &state.request.extra_files {
            env.write_file(&format!("work/{}", file.path), file.content.as_bytes())?;
        }
        Ok(Stage::Compiling)
    }

    fn compile(&self, state: &mut RunState<'_>) -> Result<Stage> {
        let budget = self.timeouts.split.budget(state.limits.wall_time());
        let options = BuildOptions {
            opt_level: state.request.opt_level,
            extra_args: state.request.compiler_args.clone(),
        };
        let command = self
            .toolchain
            .compile_command(state.env, &options, budget.compile);

        let started = Instant::now();
        let report = state.env.run(&command)?;
        state.compile_elapsed = started.elapsed();
        state.result.timings.compile_ms = state.compile_elapsed.as_millis() as u64;

        let stderr = report.stderr.text();
        state.result.diagnostics = self.toolchain.parse_diagnostics(&stderr);
        if report.stderr.truncated {
            let discarded = report
                .stderr
                .total_bytes
                .saturating_sub(report.stderr.data.len() as u64);
            state.result.diagnostics.push(Diagnostic::new(
                Severity::Warning,
                format!(
                    "compiler output truncated: {} further bytes of diagnostics were discarded",
                    discarded
                ),
            ));
        }

        match report.status {
            RunStatus::Exited(0) => {
                if !state.env.artifact_path(ARTIFACT_NAME).is_file() {
                    return Err(SandboxError::Infrastructure(
                        "compiler succeeded but produced no binary".to_string(),
                    ));
                }
                Ok(if state.request.mode.runs_program() {
                    Stage::Running
                } else {
                    Stage::Completed
                })
            }
            RunStatus::Exited(code) => {
                if !state.result.diagnostics.iter().any(Diagnostic::is_error) {
                    state.result.diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        format!("compiler exited with status {} without diagnostics", code),
                    ));
                }
                state.result.outcome = Outcome::CompileError;
                Ok(Stage::CompileFailed)
            }
            RunStatus::Signaled(sig) => {
                state.result.diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    format!("compiler terminated by signal {}", sig),
                ));
                state.result.outcome = Outcome::CompileError;
                Ok(Stage::CompileFailed)
            }
            RunStatus::TimedOut => {
                state.result.outcome = Outcome::Timeout;
                state.result.message = Some(format!(
                    "compilation exceeded {} ms",
                    budget.compile.as_millis()
                ));
                Ok(Stage::CompileFailed)
            }
            RunStatus::ResourceExceeded(breach) => {
                state.result.outcome = Outcome::ResourceExceeded;
                state.result.limit_breached = Some(breach);
                state.result.message = Some(format!("compiler exceeded its {} limit", breach));
                Ok(Stage::CompileFailed)
            }
        }
    }

    fn run(&self, state: &mut RunState<'_>) -> Result<Stage> {
        let budget = self.timeouts.split.budget(state.limits.wall_time());
        let timeout = budget.run_timeout(state.compile_elapsed, state.limits.wall_time());
        if timeout.is_zero() {
            state.result.outcome = Outcome::Timeout;
            state.result.message = Some("compilation used the whole wall budget".to_string());
            return Ok(Stage::RunTimedOut);
        }

        let stdin = state.request.stdin.as_ref().map(|s| s.as_bytes().to_vec());
        let command =
            self.toolchain
                .run_command(state.env, &state.request.arguments, stdin, timeout);
        let report = state.env.run(&command)?;
        state.result.timings.run_ms = report.elapsed.as_millis() as u64;
        Ok(apply_run_report(&mut state.result, report, timeout))
    }

    fn disassemble(&self, state: &mut RunState<'_>) -> Result<Stage> {
        let command = self
            .toolchain
            .disassemble_command(state.env, self.timeouts.disassemble());
        let started = Instant::now();
        let outcome = state.env.run(&command);
        state.result.timings.disassemble_ms = started.elapsed().as_millis() as u64;

        let failure = match outcome {
            Ok(RunReport {
                status: RunStatus::Exited(0),
                stdout,
                ..
            }) => {
                let filtered = self.toolchain.filter_disassembly(&stdout.text());
                let (text, cut) = truncate_text(&filtered, self.toolchain.disassembly_limit());
                state.result.disassembly = Some(text);
                state.result.disassembly_truncated = cut || stdout.truncated;
                None
            }
            Ok(report) => Some(match report.status {
                RunStatus::Exited(code) => format!(
                    "disassembler exited with status {}: {}",
                    code,
                    report.stderr.text().trim()
                ),
                RunStatus::Signaled(sig) => format!("disassembler killed by signal {}", sig),
                RunStatus::TimedOut => "disassembler timed out".to_string(),
                RunStatus::ResourceExceeded(b) => format!("disassembler exceeded its {} limit", b),
            }),
            Err(e) => Some(format!("disassembler failed: {}", e)),
        };

        if let Some(message) = failure {
            log::warn!("{}", message);
            state
                .result
                .diagnostics
                .push(Diagnostic::new(Severity::Warning, message));
        }
        Ok(Stage::Done)
    }
}

/// Map the program's run onto the result and pick the next stage
fn apply_run_report(result: &mut ExecutionResult, report: RunReport, timeout: Duration) -> Stage {
    result.stdout = report.stdout;
    result.stderr = report.stderr;
    match report.status {
        RunStatus::Exited(code) => {
            result.outcome = Outcome::Success;
            result.exit_code = Some(code);
            Stage::Completed
        }
        RunStatus::Signaled(sig) => {
            result.outcome = Outcome::RuntimeError;
            result.signal = Some(sig);
            result.message = Some(format!("program terminated by signal {}", sig));
            Stage::RunFailed
        }
        RunStatus::TimedOut => {
            result.outcome = Outcome::Timeout;
            result.message = Some(format!(
                "program exceeded its {} ms wall limit",
                timeout.as_millis()
            ));
            Stage::RunTimedOut
        }
        RunStatus::ResourceExceeded(breach) => {
            result.outcome = Outcome::ResourceExceeded;
            result.limit_breached = Some(breach);
            result.message = Some(format!("program exceeded its {} limit", breach));
            Stage::RunFailed
        }
    }
}
