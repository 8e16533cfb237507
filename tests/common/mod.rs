//! Shared fixtures: a scripted backend that imitates rustc, the compiled
//! program and objdump by looking at markers in the submitted source.

#![allow(dead_code)]

use boltbox::core::backend::{CommandSpec, ContextHandle, RawRun};
use boltbox::judge::toolchain::{ARTIFACT_NAME, SOURCE_NAME};
use boltbox::testing::ScriptedBackend;
use boltbox::{LimitBreach, Result, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;

/// Source containing this fails to compile
pub const SYNTAX_ERROR: &str = "SYNTAX_ERROR";
/// Program containing this never finishes
pub const LOOP_FOREVER: &str = "LOOP_FOREVER";
/// Program containing this is killed by the memory limit
pub const ALLOC_HUGE: &str = "ALLOC_HUGE";
/// Program containing this leaves `TRACE_FILE` in the work and temp dirs
pub const LEAVE_TRACE: &str = "LEAVE_TRACE";
/// Program containing this prints whether `TRACE_FILE` exists
pub const REPORT_TRACE: &str = "REPORT_TRACE";
/// Program containing this writes `FILL_BYTES` into its temp dir
pub const FILL_DISK: &str = "FILL_DISK";

pub const TRACE_FILE: &str = "trace.txt";
pub const FILL_BYTES: usize = 4 * 1024 * 1024;

pub const COMPILE_ERROR_JSON: &str = r#"{"$message_type":"diagnostic","message":"expected `;`, found `}`","code":null,"level":"error","spans":[{"file_name":"main.rs","line_start":1,"line_end":1,"column_start":24,"column_end":25,"is_primary":true}],"children":[],"rendered":"error: expected `;`, found `}`\n"}"#;

pub const LISTING: &str = "0000000000001000 <std::rt::lang_start>:\n    1000:\tret\n\n0000000000001010 <main::main>:\n    1010:\tpush   %rbp\n    1011:\tret\n";

fn fake_toolchain(ctx: &ContextHandle, cmd: &CommandSpec) -> Result<RawRun> {
    let source = std::fs::read_to_string(ctx.root.join("work").join(SOURCE_NAME))?;

    if cmd.args.iter().any(|a| a == SOURCE_NAME) {
        if source.contains(SYNTAX_ERROR) {
            let mut stderr = COMPILE_ERROR_JSON.to_string();
            stderr.push('\n');
            return Ok(RawRun {
                exit_code: Some(1),
                ..RawRun::default()
            }
            .with_stderr(stderr.as_bytes()));
        }
        std::fs::write(ctx.root.join("out").join(ARTIFACT_NAME), b"\x7fELF")?;
        return Ok(RawRun::exited(0, b""));
    }

    if cmd.program.ends_with(ARTIFACT_NAME) {
        if source.contains(LOOP_FOREVER) {
            return Ok(RawRun::timed_out(cmd.timeout));
        }
        if source.contains(ALLOC_HUGE) {
            return Ok(RawRun::breached(LimitBreach::Memory)
                .with_stderr(b"memory allocation of 17179869184 bytes failed\n"));
        }
        if source.contains(LEAVE_TRACE) {
            std::fs::write(ctx.root.join("work").join(TRACE_FILE), b"first")?;
            std::fs::write(ctx.root.join("tmp").join(TRACE_FILE), b"first")?;
            return Ok(RawRun::exited(0, b""));
        }
        if source.contains(REPORT_TRACE) {
            let seen = ["work", "tmp"]
                .iter()
                .any(|dir| ctx.root.join(dir).join(TRACE_FILE).exists());
            let out: &[u8] = if seen { b"dirty\n" } else { b"clean\n" };
            return Ok(RawRun::exited(0, out));
        }
        if source.contains(FILL_DISK) {
            std::fs::write(ctx.root.join("tmp").join("fill.bin"), vec![0u8; FILL_BYTES])?;
            return Ok(RawRun::exited(0, b""));
        }
        // Echo stdin when given, otherwise greet.
        let out = cmd.stdin.clone().unwrap_or_else(|| b"hello\n".to_vec());
        return Ok(RawRun {
            elapsed: Duration::from_millis(3),
            ..RawRun::exited(0, &out)
        });
    }

    Ok(RawRun::exited(0, LISTING.as_bytes()))
}

pub fn fake_rustc_backend() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::with_responder(fake_toolchain))
}

pub fn small_pool_config(capacity: usize, acquire_timeout_ms: u64) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.pool.capacity = capacity;
    config.pool.acquire_timeout_ms = acquire_timeout_ms;
    config.pool.shutdown_grace_ms = 200;
    config
}
