//! End-to-end request flow through the dispatcher with a scripted backend

mod common;

use boltbox::{
    Dispatcher, ExecutionMode, ExecutionRequest, FailureKind, LimitBreach, LimitOverrides, Outcome,
    Severity,
};
use common::*;

fn dispatcher() -> (std::sync::Arc<boltbox::testing::ScriptedBackend>, Dispatcher) {
    let backend = fake_rustc_backend();
    let dispatcher = Dispatcher::new(small_pool_config(2, 1_000), backend.clone()).unwrap();
    (backend, dispatcher)
}

#[test]
fn test_hello_world() {
    let (_backend, dispatcher) = dispatcher();
    let result = dispatcher
        .handle(&ExecutionRequest::new(
            "fn main() { println!(\"hello\"); }",
            ExecutionMode::CompileAndRun,
        ))
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout.text(), "hello\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.failure.is_none());
    assert!(result.environment_id.is_some());
}

#[test]
fn test_stdin_reaches_program() {
    let (_backend, dispatcher) = dispatcher();
    let request = ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun)
        .with_stdin("42\n");
    let result = dispatcher.handle(&request).unwrap();
    assert_eq!(result.stdout.text(), "42\n");
}

#[test]
fn test_compile_error_reports_diagnostics_and_reuses_environment() {
    let (backend, dispatcher) = dispatcher();
    let broken = format!("fn main() {{ let x = 1 }} // {}", SYNTAX_ERROR);
    let result = dispatcher
        .handle(&ExecutionRequest::new(broken, ExecutionMode::CompileAndRun))
        .unwrap();
    assert_eq!(result.outcome, Outcome::CompileError);
    assert_eq!(result.exit_code, None);
    let diagnostic = &result.diagnostics[0];
    assert_eq!(diagnostic.severity, Severity::Error);
    assert!(diagnostic.message.contains("expected `;`"));
    assert_eq!(diagnostic.location.as_ref().unwrap().line, 1);

    // A compile error is the caller's problem; the environment is recycled.
    let again = dispatcher
        .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
        .unwrap();
    assert_eq!(again.outcome, Outcome::Success);
    assert_eq!(backend.created(), 1);
    assert_eq!(backend.resets(), 2);
}

#[test]
fn test_timeout_destroys_environment() {
    let (backend, dispatcher) = dispatcher();
    let source = format!("fn main() {{ loop {{}} }} // {}", LOOP_FOREVER);
    let request = ExecutionRequest::new(source, ExecutionMode::CompileAndRun).with_limits(
        LimitOverrides {
            wall_time_ms: Some(500),
            ..LimitOverrides::default()
        },
    );
    let result = dispatcher.handle(&request).unwrap();
    assert_eq!(result.outcome, Outcome::Timeout);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.limits.as_ref().unwrap().wall_time_ms, 500);
    assert_eq!(backend.destroyed(), 1);
    assert_eq!(backend.live(), 0);
    assert_eq!(dispatcher.metrics().outcome_timeout.get(), 1);
}

#[test]
fn test_memory_breach_is_resource_exceeded() {
    let (backend, dispatcher) = dispatcher();
    let source = format!("fn main() {{ vec![0u8; 1 << 34]; }} // {}", ALLOC_HUGE);
    let result = dispatcher
        .handle(&ExecutionRequest::new(source, ExecutionMode::CompileAndRun))
        .unwrap();
    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_eq!(result.limit_breached, Some(LimitBreach::Memory));
    assert_eq!(backend.destroyed(), 1);
    assert_eq!(dispatcher.metrics().limit_violations_memory.get(), 1);
}

#[test]
fn test_disassembly_keeps_user_symbols() {
    let (_backend, dispatcher) = dispatcher();
    let result = dispatcher
        .handle(&ExecutionRequest::new(
            "fn main() {}",
            ExecutionMode::CompileAndDisassemble,
        ))
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    let listing = result.disassembly.unwrap();
    assert!(listing.contains("main::main"));
    assert!(!listing.contains("lang_start"));
}

#[test]
fn test_compile_only_never_runs_program() {
    let (backend, dispatcher) = dispatcher();
    let result = dispatcher
        .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileOnly))
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert!(result.stdout.is_empty());
    assert_eq!(backend.runs(), 1);
}

#[test]
fn test_oversized_request_is_clamped_not_rejected() {
    let (_backend, dispatcher) = dispatcher();
    let request = ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun).with_limits(
        LimitOverrides {
            memory_bytes: Some(u64::MAX),
            ..LimitOverrides::default()
        },
    );
    let result = dispatcher.handle(&request).unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(
        result.limits.unwrap().memory_bytes,
        dispatcher.limiter().maximum().memory_bytes
    );
}

#[test]
fn test_shutdown_then_request() {
    let (backend, dispatcher) = dispatcher();
    dispatcher
        .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
        .unwrap();
    let report = dispatcher.shutdown();
    assert_eq!(report.idle_destroyed, 1);
    assert!(report.forced.is_empty());
    assert_eq!(backend.live(), 0);

    let result = dispatcher
        .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
        .unwrap();
    assert_eq!(result.outcome, Outcome::InfrastructureError);
    assert_eq!(result.failure, Some(FailureKind::PoolShutdown));
}

#[test]
fn test_metrics_export_counts_requests() {
    let (_backend, dispatcher) = dispatcher();
    for _ in 0..3 {
        dispatcher
            .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
            .unwrap();
    }
    let _ = dispatcher.handle(&ExecutionRequest::new("", ExecutionMode::CompileAndRun));
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.requests_total.get(), 3);
    assert_eq!(metrics.requests_rejected.get(), 1);
    assert_eq!(metrics.acquisitions_cold.get(), 1);
    assert_eq!(metrics.acquisitions_warm.get(), 2);
    assert!(metrics.export_prometheus().contains("boltbox_requests_total 3"));
}

#[test]
fn test_reused_environment_keeps_no_trace_of_previous_request() {
    let backend = fake_rustc_backend();
    let dispatcher = Dispatcher::new(small_pool_config(1, 1_000), backend.clone()).unwrap();
    let first = dispatcher
        .handle(&ExecutionRequest::new(
            format!("fn main() {{}} // {}", LEAVE_TRACE),
            ExecutionMode::CompileAndRun,
        ))
        .unwrap();
    assert_eq!(first.outcome, Outcome::Success);

    let second = dispatcher
        .handle(&ExecutionRequest::new(
            format!("fn main() {{}} // {}", REPORT_TRACE),
            ExecutionMode::CompileAndRun,
        ))
        .unwrap();
    assert_eq!(second.outcome, Outcome::Success);
    assert_eq!(second.stdout.text(), "clean\n");
    assert_eq!(first.environment_id, second.environment_id);
    assert_eq!(backend.created(), 1);
}

#[test]
fn test_filling_disk_past_quota_is_resource_exceeded() {
    let (backend, dispatcher) = dispatcher();
    let request = ExecutionRequest::new(
        format!("fn main() {{}} // {}", FILL_DISK),
        ExecutionMode::CompileAndRun,
    )
    .with_limits(LimitOverrides {
        disk_bytes: Some((FILL_BYTES / 2) as u64),
        ..LimitOverrides::default()
    });
    let result = dispatcher.handle(&request).unwrap();
    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_eq!(result.limit_breached, Some(LimitBreach::Disk));
    // The files are still there, so the environment is not reused.
    assert_eq!(backend.destroyed(), 1);
    assert_eq!(backend.live(), 0);
}
