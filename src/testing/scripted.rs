//! Scripted isolation backend.
//!
//! Contexts are real directories under the system temp dir, but commands
//! never execute: a responder closure decides what each run reports. Used to
//! drive the pool, pipeline and dispatcher deterministically.

use crate::config::types::{ResourceLimits, Result, SandboxError};
use crate::core::backend::{
    CommandSpec, ContextHandle, IsolationBackend, RawRun, OUT_DIR, TEMP_DIR, WORK_DIR,
};
use crate::safety::cleanup::{clear_directory, remove_tree};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

type Responder = dyn Fn(&ContextHandle, &CommandSpec) -> Result<RawRun> + Send + Sync;

pub struct ScriptedBackend {
    root: PathBuf,
    responder: Box<Responder>,
    created: AtomicUsize,
    resets: AtomicUsize,
    destroyed: AtomicUsize,
    runs: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    reset_unsupported: AtomicBool,
    run_delay: Mutex<Duration>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Every command exits 0 with empty output
    pub fn new() -> Self {
        Self::with_responder(|_, _| Ok(RawRun::exited(0, b"")))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&ContextHandle, &CommandSpec) -> Result<RawRun> + Send + Sync + 'static,
    {
        let root = std::env::temp_dir().join(format!(
            "boltbox-scripted-{}",
            Uuid::new_v4().simple()
        ));
        Self {
            root,
            responder: Box::new(responder),
            created: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            max_live: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            reset_unsupported: AtomicBool::new(false),
            run_delay: Mutex::new(Duration::ZERO),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn reset_unsupported(&self, unsupported: bool) {
        self.reset_unsupported.store(unsupported, Ordering::SeqCst);
    }

    /// Sleep this long inside every run
    pub fn set_run_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.run_delay.lock() {
            *guard = delay;
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Contexts currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive contexts seen
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Command lines seen so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn make_layout(root: &Path) -> Result<()> {
        for dir in [WORK_DIR, OUT_DIR, TEMP_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(())
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for ScriptedBackend {
    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn create_context(&self, id: &str, _ceiling: &ResourceLimits) -> Result<ContextHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Provisioning(
                "scripted provisioning failure".to_string(),
            ));
        }
        let root = self.root.join(format!("env-{}", id));
        Self::make_layout(&root)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(ContextHandle::new(id, root))
    }

    fn run_in_context(&self, ctx: &ContextHandle, command: &CommandSpec) -> Result<RawRun> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.display());
        }
        let delay = self.run_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        (self.responder)(ctx, command)
    }

    fn reset_context(&self, ctx: &ContextHandle) -> Result<()> {
        if self.reset_unsupported.load(Ordering::SeqCst) {
            return Err(SandboxError::ResetUnsupported(
                "scripted backend cannot reset".to_string(),
            ));
        }
        clear_directory(&ctx.root)?;
        Self::make_layout(&ctx.root)?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_context(&self, ctx: &ContextHandle) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(SandboxError::Infrastructure(format!(
                "scripted destroy failure for {}",
                ctx.id
            )));
        }
        let existed = ctx.root.exists();
        remove_tree(&ctx.root)?;
        if existed {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        let _ = remove_tree(&self.root);
    }
}
