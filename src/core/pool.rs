//! Environment pool.
//!
//! A bounded set of isolated environments. The pool is the only shared
//! mutable state in the service: all bookkeeping sits behind one mutex, and
//! slow backend calls (provision, reset, destroy) happen outside it. Waiting
//! acquirers park on a condvar and are woken whenever capacity frees up.

use crate::config::service::PoolConfig;
use crate::config::types::{ResourceLimits, Result, SandboxError};
use crate::core::backend::{ContextHandle, IsolationBackend};
use crate::core::environment::IsolatedEnvironment;
use crate::observability::audit::events;
use crate::observability::metrics::MetricsRegistry;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub capacity: usize,
    pub max_reuses: u32,
    pub max_age: Duration,
    pub acquire_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Ceiling every environment is provisioned with
    pub ceiling: ResourceLimits,
}

impl PoolSettings {
    pub fn from_config(config: &PoolConfig, ceiling: ResourceLimits) -> Self {
        Self {
            capacity: config.capacity,
            max_reuses: config.max_reuses,
            max_age: config.max_age(),
            acquire_timeout: config.acquire_timeout(),
            shutdown_grace: config.shutdown_grace(),
            ceiling,
        }
    }
}

/// Point-in-time view of pool occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub provisioning: usize,
    pub shutting_down: bool,
}

/// What `shutdown` had to do
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    pub idle_destroyed: usize,
    /// Leases still out when the grace period ended
    pub forced: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IsolatedEnvironment>,
    /// Reserved slots: idle + in use + being provisioned
    live: usize,
    in_use: usize,
    provisioning: usize,
    shutting_down: bool,
    leased: HashMap<String, ContextHandle>,
}

impl PoolState {
    fn stats(&self, capacity: usize) -> PoolStats {
        PoolStats {
            capacity,
            live: self.live,
            idle: self.idle.len(),
            in_use: self.in_use,
            provisioning: self.provisioning,
            shutting_down: self.shutting_down,
        }
    }
}

enum Plan {
    Reuse(IsolatedEnvironment),
    Provision { evicted: Option<IsolatedEnvironment> },
}

pub struct EnvironmentPool {
    backend: Arc<dyn IsolationBackend>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    metrics: Arc<MetricsRegistry>,
}

impl EnvironmentPool {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        settings: PoolSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Arc<Self>> {
        if settings.capacity == 0 {
            return Err(SandboxError::Config("pool capacity cannot be zero".to_string()));
        }
        log::info!(
            "Environment pool ready: capacity={} backend={}",
            settings.capacity,
            backend.backend_name()
        );
        Ok(Arc::new(Self {
            backend,
            settings,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            metrics,
        }))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Bookkeeping is updated atomically under the lock, so a poisoned
        // guard still holds consistent counts.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &PoolState) {
        self.metrics
            .record_pool_occupancy(state.live, state.idle.len(), state.in_use);
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats(self.settings.capacity)
    }

    /// Lease an environment able to honour `limits`, waiting up to the
    /// configured acquisition timeout.
    pub fn acquire(self: &Arc<Self>, limits: &ResourceLimits) -> Result<EnvironmentLease> {
        self.acquire_timeout(limits, self.settings.acquire_timeout)
    }

    pub fn acquire_timeout(
        self: &Arc<Self>,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> Result<EnvironmentLease> {
        if !self.settings.ceiling.satisfies(limits) {
            return Err(SandboxError::InvalidLimits(
                "requested limits exceed the pool ceiling".to_string(),
            ));
        }

        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let (plan, expired) = self.plan_acquisition(limits, started, deadline)?;
            for mut env in expired {
                self.destroy_detached(&mut env, "expired while idle");
            }

            let mut env = match plan {
                Plan::Reuse(env) => match env.health_check() {
                    Ok(()) => {
                        self.metrics.acquisitions_warm.inc();
                        env
                    }
                    Err(e) => {
                        log::warn!("Idle environment {} failed health check: {}", env.id(), e);
                        let mut env = env;
                        env.mark_contaminated(format!("health check failed: {}", e));
                        if let Err(e) = self.release_inner(env) {
                            log::error!("Destroy after failed health check failed: {}", e);
                        }
                        continue;
                    }
                },
                Plan::Provision { evicted } => {
                    if let Some(mut old) = evicted {
                        self.destroy_detached(&mut old, "evicted for a larger request");
                    }
                    self.provision_reserved()?
                }
            };

            env.begin_use();
            let waited = started.elapsed();
            self.metrics.acquire_latency.observe(waited);
            log::debug!(
                "Leased environment {} (use {}) after {:?}",
                env.id(),
                env.use_count(),
                waited
            );
            let mut lease = EnvironmentLease {
                pool: Arc::clone(self),
                env: Some(env),
                waited,
            };
            lease.set_active_limits(limits.clone())?;
            return Ok(lease);
        }
    }

    /// Decide under the lock how this acquisition will be served. Expired
    /// idle environments found on the way are handed back for destruction.
    fn plan_acquisition(
        &self,
        limits: &ResourceLimits,
        started: Instant,
        deadline: Instant,
    ) -> Result<(Plan, Vec<IsolatedEnvironment>)> {
        let mut state = self.lock();
        let mut expired = Vec::new();
        loop {
            if state.shutting_down {
                return Err(SandboxError::PoolShutdown);
            }

            while let Some(pos) = state
                .idle
                .iter()
                .position(|env| env.ceiling().satisfies(limits))
            {
                let Some(env) = state.idle.remove(pos) else {
                    break;
                };
                if env.is_expired(self.settings.max_reuses, self.settings.max_age) {
                    state.live -= 1;
                    expired.push(env);
                    continue;
                }
                state.in_use += 1;
                state
                    .leased
                    .insert(env.id().to_string(), env.context().clone());
                self.publish(&state);
                return Ok((Plan::Reuse(env), expired));
            }

            if state.live < self.settings.capacity {
                state.live += 1;
                state.provisioning += 1;
                self.publish(&state);
                return Ok((Plan::Provision { evicted: None }, expired));
            }

            if let Some(env) = state.idle.pop_front() {
                // Slot changes hands: live stays the same.
                state.provisioning += 1;
                self.publish(&state);
                return Ok((Plan::Provision { evicted: Some(env) }, expired));
            }

            if !expired.is_empty() {
                // Slots were freed above; let the caller destroy them first.
                drop(state);
                for mut env in expired.drain(..) {
                    self.destroy_detached(&mut env, "expired while idle");
                }
                state = self.lock();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Provision into a slot already reserved in `live`/`provisioning`
    fn provision_reserved(&self) -> Result<IsolatedEnvironment> {
        let result = IsolatedEnvironment::provision(
            Arc::clone(&self.backend),
            self.settings.ceiling.clone(),
        );

        let mut state = self.lock();
        state.provisioning -= 1;
        match result {
            Ok(mut env) => {
                self.metrics.environments_provisioned.inc();
                self.metrics.acquisitions_cold.inc();
                if state.shutting_down {
                    state.live -= 1;
                    self.publish(&state);
                    drop(state);
                    self.available.notify_all();
                    self.destroy_detached(&mut env, "pool shutting down");
                    return Err(SandboxError::PoolShutdown);
                }
                state.in_use += 1;
                state
                    .leased
                    .insert(env.id().to_string(), env.context().clone());
                self.publish(&state);
                Ok(env)
            }
            Err(e) => {
                state.live -= 1;
                self.publish(&state);
                drop(state);
                self.available.notify_all();
                log::error!("Environment provisioning failed: {}", e);
                events::provisioning_failure(&e.to_string());
                Err(e)
            }
        }
    }

    /// Destroy an environment that holds no slot any more
    fn destroy_detached(&self, env: &mut IsolatedEnvironment, reason: &str) {
        log::debug!("Destroying environment {}: {}", env.id(), reason);
        match env.destroy() {
            Ok(()) => self.metrics.environments_destroyed.inc(),
            Err(e) => {
                self.metrics.destroy_failures.inc();
                log::error!("Failed to destroy environment {}: {}", env.id(), e);
            }
        }
    }

    /// Return a leased environment. Contaminated, expired or unresettable
    /// environments are destroyed; clean ones are reset and parked idle.
    fn release_inner(&self, mut env: IsolatedEnvironment) -> Result<()> {
        let shutting_down = self.lock().shutting_down;

        let retire_reason = if let Some(reason) = env.contamination_reason() {
            self.metrics.environments_contaminated.inc();
            Some(format!("contaminated: {}", reason))
        } else if shutting_down {
            Some("pool shutting down".to_string())
        } else if env.is_expired(self.settings.max_reuses, self.settings.max_age) {
            Some(format!(
                "retired after {} uses / {:?}",
                env.use_count(),
                env.age()
            ))
        } else {
            match env.reset() {
                Ok(()) => {
                    self.metrics.environments_reset.inc();
                    None
                }
                Err(SandboxError::ResetUnsupported(msg)) => {
                    log::debug!("Environment {} cannot be reset: {}", env.id(), msg);
                    Some("reset unsupported".to_string())
                }
                Err(e) => {
                    self.metrics.reset_failures.inc();
                    log::error!("Reset of environment {} failed: {}", env.id(), e);
                    Some(format!("reset failed: {}", e))
                }
            }
        };

        let Some(reason) = retire_reason else {
            let mut state = self.lock();
            state.leased.remove(env.id());
            state.in_use -= 1;
            if state.shutting_down {
                state.live -= 1;
                self.publish(&state);
                drop(state);
                self.available.notify_all();
                return self.destroy_owned(env, "pool shutting down");
            }
            state.idle.push_back(env);
            self.publish(&state);
            drop(state);
            self.available.notify_all();
            return Ok(());
        };

        {
            let mut state = self.lock();
            state.leased.remove(env.id());
            state.in_use -= 1;
            state.live -= 1;
            self.publish(&state);
        }
        self.available.notify_all();
        self.destroy_owned(env, &reason)
    }

    fn destroy_owned(&self, mut env: IsolatedEnvironment, reason: &str) -> Result<()> {
        log::debug!("Destroying environment {}: {}", env.id(), reason);
        match env.destroy() {
            Ok(()) => {
                self.metrics.environments_destroyed.inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.destroy_failures.inc();
                log::error!(
                    "Failed to destroy environment {} ({}): {}",
                    env.id(),
                    reason,
                    e
                );
                Err(e)
            }
        }
    }

    /// Provision up to `count` environments ahead of demand
    pub fn prewarm(&self, count: usize) -> Result<usize> {
        let mut ready = 0;
        for _ in 0..count {
            {
                let mut state = self.lock();
                if state.shutting_down || state.live >= self.settings.capacity {
                    break;
                }
                state.live += 1;
                state.provisioning += 1;
            }
            let result = IsolatedEnvironment::provision(
                Arc::clone(&self.backend),
                self.settings.ceiling.clone(),
            );
            let mut state = self.lock();
            state.provisioning -= 1;
            match result {
                Ok(env) => {
                    self.metrics.environments_provisioned.inc();
                    state.idle.push_back(env);
                    self.publish(&state);
                    ready += 1;
                }
                Err(e) => {
                    state.live -= 1;
                    self.publish(&state);
                    drop(state);
                    self.available.notify_all();
                    return Err(e);
                }
            }
            drop(state);
            self.available.notify_all();
        }
        log::info!("Prewarmed {} environments", ready);
        Ok(ready)
    }

    /// Stop accepting acquisitions, destroy idle environments, give leases
    /// `shutdown_grace` to come back, then force-destroy what is still out.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let idle: Vec<IsolatedEnvironment> = {
            let mut state = self.lock();
            if state.shutting_down {
                log::debug!("Pool shutdown already in progress");
            }
            state.shutting_down = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            self.publish(&state);
            drained
        };
        self.available.notify_all();

        log::info!("Pool shutting down: destroying {} idle environments", idle.len());
        for env in idle {
            let id = env.id().to_string();
            match self.destroy_owned(env, "pool shutdown") {
                Ok(()) => report.idle_destroyed += 1,
                Err(e) => report.errors.push(format!("{}: {}", id, e)),
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_grace;
        let mut state = self.lock();
        while state.in_use > 0 || state.provisioning > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
        let stragglers: Vec<ContextHandle> = state.leased.values().cloned().collect();
        drop(state);

        for ctx in stragglers {
            log::warn!(
                "Force-destroying environment {} still leased after grace period",
                ctx.id
            );
            events::forced_kill(&ctx.id, "leased past shutdown grace period");
            if let Err(e) = self.backend.destroy_context(&ctx) {
                log::error!("Forced destroy of {} failed: {}", ctx.id, e);
                report.errors.push(format!("{}: {}", ctx.id, e));
            }
            report.forced.push(ctx.id);
        }

        log::info!(
            "Pool shut down: {} idle destroyed, {} forced, {} errors",
            report.idle_destroyed,
            report.forced.len(),
            report.errors.len()
        );
        report
    }
}

/// Exclusive loan of one environment. Hand it back with [`release`];
/// dropping a lease without releasing it treats the environment as
/// contaminated.
///
/// [`release`]: EnvironmentLease::release
pub struct EnvironmentLease {
    pool: Arc<EnvironmentPool>,
    env: Option<IsolatedEnvironment>,
    waited: Duration,
}

impl std::fmt::Debug for EnvironmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLease")
            .field("waited", &self.waited)
            .finish_non_exhaustive()
    }
}

impl EnvironmentLease {
    /// Time spent in `acquire`
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Return the environment to the pool
    pub fn release(mut self, contaminated: bool) -> Result<()> {
        match self.env.take() {
            Some(mut env) => {
                if contaminated {
                    env.mark_contaminated("released as contaminated");
                }
                self.pool.release_inner(env)
            }
            None => Ok(()),
        }
    }
}

impl Deref for EnvironmentLease {
    type Target = IsolatedEnvironment;

    fn deref(&self) -> &IsolatedEnvironment {
        match self.env.as_ref() {
            Some(env) => env,
            None => unreachable!("lease used after release"),
        }
    }
}

impl DerefMut for EnvironmentLease {
    fn deref_mut(&mut self) -> &mut IsolatedEnvironment {
        match self.env.as_mut() {
            Some(env) => env,
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if let Some(mut env) = self.env.take() {
            log::warn!("Environment {} lease dropped without release", env.id());
            env.mark_contaminated("lease dropped without release");
            if let Err(e) = self.pool.release_inner(env) {
                log::error!("Release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use std::thread;

    fn settings(capacity: usize) -> PoolSettings {
        PoolSettings {
            capacity,
            max_reuses: 3,
            max_age: Duration::from_secs(600),
            acquire_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(200),
            ceiling: ResourceLimits::default(),
        }
    }

    fn pool(capacity: usize) -> (Arc<ScriptedBackend>, Arc<EnvironmentPool>) {
        let backend = Arc::new(ScriptedBackend::new());
        let pool = EnvironmentPool::new(
            backend.clone(),
            settings(capacity),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        (backend, pool)
    }

    #[test]
    fn clean_release_reuses_environment() {
        let (backend, pool) = pool(2);
        let limits = ResourceLimits::default();

        let lease = pool.acquire(&limits).unwrap();
        let first_id = lease.id().to_string();
        lease.release(false).unwrap();

        let lease = pool.acquire(&limits).unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(lease.use_count(), 2);
        lease.release(false).unwrap();

        assert_eq!(backend.created(), 1);
        assert_eq!(backend.resets(), 2);
    }

    #[test]
    fn contaminated_release_destroys() {
        let (backend, pool) = pool(1);
        let limits = ResourceLimits::default();

        let lease = pool.acquire(&limits).unwrap();
        let id = lease.id().to_string();
        lease.release(true).unwrap();
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(pool.stats().live, 0);

        let lease = pool.acquire(&limits).unwrap();
        assert_ne!(lease.id(), id);
        lease.release(false).unwrap();
    }

    #[test]
    fn reuse_threshold_retires_environment() {
        let (backend, pool) = pool(1);
        let limits = ResourceLimits::default();
        for _ in 0..3 {
            pool.acquire(&limits).unwrap().release(false).unwrap();
        }
        // Third use hit max_reuses: destroyed on release, not reset.
        assert_eq!(backend.created(), 1);
        assert_eq!(backend.resets(), 2);
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn exhaustion_after_timeout() {
        let (_backend, pool) = pool(1);
        let limits = ResourceLimits::default();
        let held = pool.acquire(&limits).unwrap();

        let started = Instant::now();
        let err = pool
            .acquire_timeout(&limits, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SandboxError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        held.release(false).unwrap();
    }

    #[test]
    fn waiter_gets_released_environment() {
        let (_backend, pool) = pool(1);
        let limits = ResourceLimits::default();
        let held = pool.acquire(&limits).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let limits = limits.clone();
            thread::spawn(move || {
                pool.acquire_timeout(&limits, Duration::from_secs(5))
                    .map(|lease| lease.release(false))
            })
        };
        thread::sleep(Duration::from_millis(50));
        held.release(false).unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn dropped_lease_counts_as_contaminated() {
        let (backend, pool) = pool(1);
        {
            let _lease = pool.acquire(&ResourceLimits::default()).unwrap();
        }
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(backend.resets(), 0);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn reset_unsupported_falls_back_to_destroy() {
        let (backend, pool) = pool(1);
        backend.reset_unsupported(true);
        pool.acquire(&ResourceLimits::default())
            .unwrap()
            .release(false)
            .unwrap();
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn provisioning_failure_frees_slot() {
        let (backend, pool) = pool(1);
        backend.fail_create(true);
        let err = pool.acquire(&ResourceLimits::default()).unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));
        assert_eq!(pool.stats().live, 0);

        backend.fail_create(false);
        assert!(pool.acquire(&ResourceLimits::default()).is_ok());
    }

    #[test]
    fn oversized_request_is_rejected() {
        let (_backend, pool) = pool(1);
        let mut limits = ResourceLimits::default();
        limits.memory_bytes *= 2;
        assert!(matches!(
            pool.acquire(&limits),
            Err(SandboxError::InvalidLimits(_))
        ));
    }

    #[test]
    fn shutdown_destroys_idle_and_refuses_new_work() {
        let (backend, pool) = pool(2);
        assert_eq!(pool.prewarm(2).unwrap(), 2);
        let report = pool.shutdown();
        assert_eq!(report.idle_destroyed, 2);
        assert!(report.forced.is_empty());
        assert_eq!(backend.destroyed(), 2);
        assert!(matches!(
            pool.acquire(&ResourceLimits::default()),
            Err(SandboxError::PoolShutdown)
        ));
    }

    #[test]
    fn shutdown_forces_stragglers_after_grace() {
        let (backend, pool) = pool(1);
        let lease = pool.acquire(&ResourceLimits::default()).unwrap();
        let report = pool.shutdown();
        assert_eq!(report.forced, vec![lease.id().to_string()]);
        assert!(backend.destroyed() >= 1);
        // A late release still tears the environment down.
        lease.release(false).unwrap();
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn unhealthy_idle_environment_is_replaced_even_if_destroy_fails() {
        let (backend, pool) = pool(1);
        let limits = ResourceLimits::default();
        let lease = pool.acquire(&limits).unwrap();
        let stale = lease.id().to_string();
        lease.release(false).unwrap();

        std::fs::remove_dir_all(backend.root().join(format!("env-{}", stale)).join("work"))
            .unwrap();
        backend.fail_destroy(true);
        let lease = pool.acquire(&limits).unwrap();
        assert_ne!(lease.id(), stale);
        assert_eq!(pool.stats().live, 1);
        assert_eq!(pool.metrics.destroy_failures.get(), 1);
        backend.fail_destroy(false);
        lease.release(false).unwrap();
    }

    #[test]
    fn destroy_failure_surfaces_but_frees_capacity() {
        let (backend, pool) = pool(1);
        backend.fail_destroy(true);
        let lease = pool.acquire(&ResourceLimits::default()).unwrap();
        let err = lease.release(true).unwrap_err();
        assert!(matches!(err, SandboxError::Infrastructure(_)));
        assert_eq!(pool.stats().live, 0);
        backend.fail_destroy(false);
    }
}
