//! Request dispatcher.
//!
//! Public entry point of the service. A request is validated before the pool
//! is touched, its limits are resolved by the limiter, an environment is
//! leased, the pipeline runs, and the lease is always handed back.

use crate::config::limiter::ResourceLimiter;
use crate::config::service::ServiceConfig;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, FailureKind, LimitOverrides, Result, SandboxError,
};
use crate::core::backend::IsolationBackend;
use crate::core::pool::{EnvironmentPool, PoolSettings, PoolStats, ShutdownReport};
use crate::judge::pipeline::Pipeline;
use crate::judge::toolchain::{validate_compiler_args, RustcToolchain, Toolchain, SOURCE_NAME};
use crate::observability::audit::events;
use crate::observability::metrics::MetricsRegistry;
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct Dispatcher {
    limiter: ResourceLimiter,
    pool: Arc<EnvironmentPool>,
    pipeline: Pipeline,
    metrics: Arc<MetricsRegistry>,
    acquire_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher compiling with `rustc` as configured in `config.toolchain`
    pub fn new(config: ServiceConfig, backend: Arc<dyn IsolationBackend>) -> Result<Self> {
        let toolchain = Arc::new(RustcToolchain::new(config.toolchain.clone()));
        Self::with_toolchain(config, backend, toolchain)
    }

    pub fn with_toolchain(
        config: ServiceConfig,
        backend: Arc<dyn IsolationBackend>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Result<Self> {
        let limiter = ResourceLimiter::new(&config.limits)?;
        let metrics = Arc::new(MetricsRegistry::new());
        // Environments are sized for the largest request the limiter allows.
        let settings = PoolSettings::from_config(&config.pool, limiter.maximum().clone());
        let pool = EnvironmentPool::new(backend, settings, Arc::clone(&metrics))?;

        if config.pool.prewarm > 0 {
            if let Err(e) = pool.prewarm(config.pool.prewarm) {
                log::warn!("Prewarming the pool failed: {}", e);
            }
        }

        Ok(Self {
            limiter,
            pool,
            pipeline: Pipeline::new(toolchain, config.timeouts.clone()),
            metrics,
            acquire_timeout: config.pool.acquire_timeout(),
        })
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    /// Reject malformed requests before any resources are committed
    pub fn validate(&self, request: &ExecutionRequest) -> Result<()> {
        if request.source.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("source is empty".to_string()));
        }
        if request.source.contains('\0') {
            return Err(SandboxError::InvalidRequest(
                "source contains NUL bytes".to_string(),
            ));
        }
        check_overrides(&request.limits)?;
        validate_compiler_args(&request.compiler_args)?;

        if request.arguments.iter().any(|a| a.contains('\0')) {
            return Err(SandboxError::InvalidRequest(
                "program arguments contain NUL bytes".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for file in &request.extra_files {
            check_extra_path(&file.path)?;
            if !seen.insert(file.path.as_str()) {
                return Err(SandboxError::InvalidRequest(format!(
                    "extra file {} given twice",
                    file.path
                )));
            }
        }

        let source_bytes: u64 = request.source.len() as u64
            + request
                .extra_files
                .iter()
                .map(|f| f.content.len() as u64)
                .sum::<u64>();
        let quota = self.limiter.maximum().disk_bytes;
        if source_bytes > quota {
            return Err(SandboxError::InvalidRequest(format!(
                "sources total {} bytes, above the {} byte disk quota",
                source_bytes, quota
            )));
        }
        Ok(())
    }

    /// Serve one request. `Err` is returned only for caller faults
    /// (`InvalidRequest`/`InvalidLimits`); every service-side failure comes
    /// back as an `infrastructure-error` result.
    pub fn handle(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let request_id = Uuid::new_v4().simple().to_string();
        let started = Instant::now();

        if let Err(e) = self.validate(request) {
            self.metrics.requests_rejected.inc();
            log::info!("[{}] rejected: {}", request_id, e);
            events::request_rejected(&request_id, &e.to_string());
            return Err(e);
        }

        let effective = self.limiter.effective(&request.limits);
        if !effective.clamped.is_empty() {
            log::debug!(
                "[{}] clamped limits: {}",
                request_id,
                effective.clamped.join(", ")
            );
        }
        let limits = effective.limits;
        events::request_start(&request_id, request.source_digest(), request.mode.as_str());
        log::info!(
            "[{}] {} request, wall {} ms, memory {} bytes",
            request_id,
            request.mode,
            limits.wall_time_ms,
            limits.memory_bytes
        );

        let mut lease = match self.pool.acquire_timeout(&limits, self.acquire_timeout) {
            Ok(lease) => lease,
            Err(e) if e.is_caller_fault() => {
                self.metrics.requests_rejected.inc();
                events::request_rejected(&request_id, &e.to_string());
                return Err(e);
            }
            Err(e) => {
                let failure = match e {
                    SandboxError::PoolExhausted { .. } => FailureKind::PoolExhausted,
                    SandboxError::PoolShutdown => FailureKind::PoolShutdown,
                    SandboxError::Provisioning(_) => FailureKind::Provisioning,
                    _ => FailureKind::Infrastructure,
                };
                log::warn!("[{}] no environment: {}", request_id, e);
                let mut result =
                    ExecutionResult::infrastructure(request_id.clone(), failure, e.to_string());
                result.limits = Some(limits);
                return Ok(self.finish(result, started));
            }
        };
        let acquired = lease.waited();

        let report = self
            .pipeline
            .execute(&mut lease, request, &limits, &request_id);
        let mut result = report.result;
        result.timings.acquire_ms = acquired.as_millis() as u64;

        let contaminated = lease.is_contaminated() || result.outcome.contaminates();
        let environment_id = lease.id().to_string();
        if let Err(e) = lease.release(contaminated) {
            // The request itself completed; the leak is reported through
            // metrics and the audit trail.
            log::error!(
                "[{}] releasing environment {} failed: {}",
                request_id,
                environment_id,
                e
            );
        }

        Ok(self.finish(result, started))
    }

    fn finish(&self, mut result: ExecutionResult, started: Instant) -> ExecutionResult {
        let elapsed = started.elapsed();
        result.elapsed_ms = elapsed.as_millis() as u64;

        self.metrics.record_outcome(result.outcome, result.failure);
        if let Some(breach) = result.limit_breached {
            self.metrics.record_breach(breach);
        }
        if result.timings.compile_ms > 0 {
            self.metrics
                .compile_duration
                .observe(Duration::from_millis(result.timings.compile_ms));
        }
        if result.timings.run_ms > 0 {
            self.metrics
                .run_duration
                .observe(Duration::from_millis(result.timings.run_ms));
        }
        self.metrics.request_duration.observe(elapsed);

        events::request_end(
            &result.request_id,
            result.environment_id.as_deref(),
            result.outcome,
            result.elapsed_ms,
        );
        log::info!(
            "[{}] {} in {} ms",
            result.request_id,
            result.outcome,
            result.elapsed_ms
        );
        result
    }

    /// Stop accepting work and tear the pool down
    pub fn shutdown(&self) -> ShutdownReport {
        self.pool.shutdown()
    }
}

fn check_overrides(overrides: &LimitOverrides) -> Result<()> {
    let zero = [
        ("cpu_time_ms", overrides.cpu_time_ms == Some(0)),
        ("wall_time_ms", overrides.wall_time_ms == Some(0)),
        ("memory_bytes", overrides.memory_bytes == Some(0)),
        ("output_bytes", overrides.output_bytes == Some(0)),
        ("process_count", overrides.process_count == Some(0)),
        ("disk_bytes", overrides.disk_bytes == Some(0)),
    ];
    match zero.iter().find(|(_, is_zero)| *is_zero) {
        Some((field, _)) => Err(SandboxError::InvalidLimits(format!(
            "{} override cannot be zero",
            field
        ))),
        None => Ok(()),
    }
}

fn check_extra_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let plain = !path.is_empty()
        && !path.contains('\0')
        && p.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(SandboxError::InvalidRequest(format!(
            "extra file path must be relative without '..': {:?}",
            path
        )));
    }
    if path == SOURCE_NAME {
        return Err(SandboxError::InvalidRequest(format!(
            "extra file cannot replace {}",
            SOURCE_NAME
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ExecutionMode, Outcome, SourceFile};
    use crate::testing::ScriptedBackend;

    fn dispatcher() -> (Arc<ScriptedBackend>, Dispatcher) {
        let backend = Arc::new(ScriptedBackend::new());
        let dispatcher = Dispatcher::new(ServiceConfig::default(), backend.clone()).unwrap();
        (backend, dispatcher)
    }

    #[test]
    fn empty_source_never_reaches_pool() {
        let (backend, dispatcher) = dispatcher();
        let err = dispatcher
            .handle(&ExecutionRequest::new("   \n", ExecutionMode::CompileOnly))
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert_eq!(backend.created(), 0);
        assert_eq!(dispatcher.metrics().requests_rejected.get(), 1);
    }

    #[test]
    fn zero_override_is_invalid_limits() {
        let (_backend, dispatcher) = dispatcher();
        let request = ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun)
            .with_limits(LimitOverrides {
                wall_time_ms: Some(0),
                ..LimitOverrides::default()
            });
        assert!(matches!(
            dispatcher.handle(&request),
            Err(SandboxError::InvalidLimits(_))
        ));
    }

    #[test]
    fn extra_file_paths_are_checked() {
        let (_backend, dispatcher) = dispatcher();
        for bad in ["../x.rs", "/etc/passwd", "main.rs", "", "a/./../b.rs"] {
            let mut request = ExecutionRequest::new("fn main() {}", ExecutionMode::CompileOnly);
            request.extra_files.push(SourceFile {
                path: bad.to_string(),
                content: String::new(),
            });
            assert!(
                matches!(
                    dispatcher.validate(&request),
                    Err(SandboxError::InvalidRequest(_))
                ),
                "accepted {:?}",
                bad
            );
        }
        let mut request = ExecutionRequest::new("mod util; fn main() {}", ExecutionMode::CompileOnly);
        request.extra_files.push(SourceFile {
            path: "util.rs".to_string(),
            content: "pub fn f() {}".to_string(),
        });
        assert!(dispatcher.validate(&request).is_ok());
    }

    #[test]
    fn disallowed_compiler_args_are_rejected() {
        let (_backend, dispatcher) = dispatcher();
        let mut request = ExecutionRequest::new("fn main() {}", ExecutionMode::CompileOnly);
        request.compiler_args = vec!["-C".to_string(), "linker=/bin/sh".to_string()];
        assert!(matches!(
            dispatcher.handle(&request),
            Err(SandboxError::InvalidRequest(_))
        ));
    }

    #[test]
    fn provisioning_failure_becomes_result() {
        let (backend, dispatcher) = dispatcher();
        backend.fail_create(true);
        let result = dispatcher
            .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileOnly))
            .unwrap();
        assert_eq!(result.outcome, Outcome::InfrastructureError);
        assert_eq!(result.failure, Some(FailureKind::Provisioning));
        assert!(result.retry_hint);
    }

    #[test]
    fn shutdown_refuses_with_structured_result() {
        let (_backend, dispatcher) = dispatcher();
        dispatcher.shutdown();
        let result = dispatcher
            .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileOnly))
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::PoolShutdown));
        assert!(!result.retry_hint);
    }
}
