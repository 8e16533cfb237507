// Acquisition latency: warm reuse vs cold provisioning.
// Uses the scripted backend, so only pool bookkeeping and directory setup are
// measured. Warm acquisition should stay well below cold.

use boltbox::core::pool::{EnvironmentPool, PoolSettings};
use boltbox::observability::metrics::MetricsRegistry;
use boltbox::testing::ScriptedBackend;
use boltbox::{ResourceLimits, ServiceConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 200;
const WARMUP_ITERATIONS: usize = 20;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let sum: Duration = samples.iter().sum();
        Self {
            p50: samples[len / 2],
            p95: samples[(len as f64 * 0.95) as usize],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n=== {} ===", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

fn pool(max_reuses: u32) -> Arc<EnvironmentPool> {
    let mut config = ServiceConfig::default().pool;
    config.capacity = 1;
    config.max_reuses = max_reuses;
    let settings = PoolSettings::from_config(&config, ResourceLimits::default());
    EnvironmentPool::new(
        Arc::new(ScriptedBackend::new()),
        settings,
        Arc::new(MetricsRegistry::new()),
    )
    .expect("pool")
}

/// Time `acquire` alone; release happens outside the measured span
fn measure(pool: &Arc<EnvironmentPool>, iterations: usize) -> Vec<Duration> {
    let limits = ResourceLimits::default();
    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        let lease = pool.acquire(&limits).expect("acquire");
        samples.push(start.elapsed());
        lease.release(false).expect("release");
    }
    samples
}

fn main() {
    // max_reuses = 1 retires every environment after one use.
    let cold = pool(1);
    measure(&cold, WARMUP_ITERATIONS);
    let cold_stats = LatencyStats::from_samples(measure(&cold, ITERATIONS));
    cold_stats.print("cold acquisition (provision per request)");

    let warm = pool(u32::MAX);
    measure(&warm, WARMUP_ITERATIONS);
    let warm_stats = LatencyStats::from_samples(measure(&warm, ITERATIONS));
    warm_stats.print("warm acquisition (reuse after reset)");

    if warm_stats.p50 < cold_stats.p50 {
        println!("\nwarm p50 is {:?} faster", cold_stats.p50 - warm_stats.p50);
    } else {
        println!("\nwarm acquisition is not faster than cold");
    }
}
