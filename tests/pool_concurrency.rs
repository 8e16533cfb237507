//! Concurrency behaviour of the environment pool under load

mod common;

use boltbox::core::pool::{EnvironmentPool, PoolSettings};
use boltbox::observability::metrics::MetricsRegistry;
use boltbox::{Dispatcher, ExecutionMode, ExecutionRequest, FailureKind, Outcome, ResourceLimits};
use common::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_live_environments_never_exceed_capacity() {
    let backend = fake_rustc_backend();
    backend.set_run_delay(Duration::from_millis(20));
    let dispatcher = Arc::new(Dispatcher::new(small_pool_config(3, 10_000), backend.clone()).unwrap());

    let threads = 12;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dispatcher
                    .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let result = handle.join().unwrap();
        assert_eq!(result.outcome, Outcome::Success);
    }
    assert!(backend.max_live() <= 3, "max live {}", backend.max_live());
    assert_eq!(dispatcher.metrics().requests_total.get(), threads as u64);

    let stats = dispatcher.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.provisioning, 0);
    assert!(stats.live <= 3);
}

#[test]
fn test_exhaustion_is_structured_and_bounded() {
    let backend = fake_rustc_backend();
    backend.set_run_delay(Duration::from_millis(300));
    let dispatcher = Arc::new(Dispatcher::new(small_pool_config(2, 100), backend.clone()).unwrap());

    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dispatcher
                    .handle(&ExecutionRequest::new("fn main() {}", ExecutionMode::CompileAndRun))
                    .unwrap()
            })
        })
        .collect();

    let mut served = 0;
    let mut exhausted = 0;
    for handle in handles {
        let result = handle.join().unwrap();
        match result.outcome {
            Outcome::Success => served += 1,
            Outcome::InfrastructureError => {
                assert_eq!(result.failure, Some(FailureKind::PoolExhausted));
                assert!(result.retry_hint);
                assert!(result.environment_id.is_none());
                exhausted += 1;
            }
            other => panic!("unexpected outcome {}", other),
        }
    }
    assert_eq!(served + exhausted, threads);
    assert!(served >= 2);
    assert!(exhausted >= 1);
    assert!(backend.max_live() <= 2);
    assert_eq!(
        dispatcher.metrics().failure_pool_exhausted.get(),
        exhausted as u64
    );
}

#[test]
fn test_shutdown_waits_for_in_flight_lease() {
    let backend = fake_rustc_backend();
    let mut settings = PoolSettings::from_config(
        &small_pool_config(1, 1_000).pool,
        ResourceLimits::default(),
    );
    settings.shutdown_grace = Duration::from_secs(2);
    let pool = EnvironmentPool::new(backend.clone(), settings, Arc::new(MetricsRegistry::new()))
        .unwrap();

    let lease = pool.acquire(&ResourceLimits::default()).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        lease.release(false)
    });

    let report = pool.shutdown();
    releaser.join().unwrap().unwrap();
    assert!(report.forced.is_empty());
    assert_eq!(backend.live(), 0);
    assert!(pool.acquire(&ResourceLimits::default()).is_err());
}
