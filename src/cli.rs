use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::ProcessBackend;
use crate::config::service::ServiceConfig;
use crate::config::types::{ExecutionMode, ExecutionRequest, LimitOverrides, OptLevel};
use crate::config::validator::{check_system_capabilities, validate_config};
use crate::dispatcher::Dispatcher;
use crate::judge::toolchain::RustcToolchain;
use crate::kernel::signal::SignalHandler;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Service configuration file (JSON). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile (and optionally run or disassemble) one source file
    Execute {
        /// Rust source file to submit
        #[arg(long)]
        source: PathBuf,
        /// compile-only, compile-and-run or compile-and-disassemble
        #[arg(long, default_value = "compile-and-run")]
        mode: ExecutionMode,
        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// Optimization level (0-3, s, z)
        #[arg(long)]
        opt_level: Option<OptLevel>,
        /// Extra rustc flag from the allowlist (repeatable)
        #[arg(long = "compiler-arg", value_name = "FLAG", allow_hyphen_values = true)]
        compiler_args: Vec<String>,
        /// Wall clock limit in milliseconds
        #[arg(long)]
        wall_ms: Option<u64>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        cpu_ms: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,
        /// Maximum number of processes
        #[arg(long)]
        processes: Option<u32>,
        /// Arguments passed to the compiled program
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Serve newline-delimited JSON requests from stdin
    Serve,
    /// Check that rustc and objdump are installed
    CheckDeps {
        /// Print version strings
        #[arg(long)]
        verbose: bool,
    },
    /// Validate the configuration and report host capabilities
    ValidateConfig,
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !cfg!(target_os = "linux") {
        anyhow::bail!("boltbox requires Linux for process isolation");
    }

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Execute {
            source,
            mode,
            stdin,
            opt_level,
            compiler_args,
            wall_ms,
            cpu_ms,
            memory_mb,
            processes,
            args,
        } => {
            let code = std::fs::read_to_string(&source)
                .with_context(|| format!("cannot read {}", source.display()))?;
            let mut request = ExecutionRequest::new(code, mode)
                .with_arguments(args)
                .with_limits(LimitOverrides {
                    wall_time_ms: wall_ms,
                    cpu_time_ms: cpu_ms,
                    memory_bytes: memory_mb.map(|mb| mb * 1024 * 1024),
                    process_count: processes,
                    ..LimitOverrides::default()
                });
            if let Some(path) = stdin {
                let input = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                request = request.with_stdin(input);
            }
            request.opt_level = opt_level;
            request.compiler_args = compiler_args;

            let dispatcher = build_dispatcher(config)?;
            let outcome = dispatcher.handle(&request);
            dispatcher.shutdown();

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Serve => serve(config),
        Commands::CheckDeps { verbose } => check_dependencies(&config, verbose),
        Commands::ValidateConfig => validate(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let config = match path {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    let report = validate_config(&config)?;
    for warning in &report.warnings {
        log::warn!("config: {}", warning);
    }
    if !report.is_valid() {
        anyhow::bail!("invalid configuration:\n{}", report.errors.join("\n"));
    }
    Ok(config)
}

fn build_dispatcher(config: ServiceConfig) -> Result<Dispatcher> {
    let toolchain = Arc::new(RustcToolchain::new(config.toolchain.clone()));
    let backend = Arc::new(ProcessBackend::with_toolchain_paths(
        &config.backend,
        &toolchain.host_paths(),
    )?);
    Ok(Dispatcher::with_toolchain(config, backend, toolchain)?)
}

/// One request line. The optional `id` is echoed back so callers can match
/// responses that complete out of order.
struct Job {
    id: Value,
    request: std::result::Result<ExecutionRequest, String>,
}

fn parse_line(line: &str) -> Job {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Job {
                id: Value::Null,
                request: Err(format!("malformed JSON: {}", e)),
            }
        }
    };
    let id = value
        .as_object_mut()
        .and_then(|object| object.remove("id"))
        .unwrap_or(Value::Null);
    let request = serde_json::from_value(value).map_err(|e| e.to_string());
    Job { id, request }
}

fn respond(id: &Value, body: (&str, Value)) {
    let mut response = json!({ "id": id });
    response[body.0] = body.1;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if writeln!(out, "{}", response).and_then(|_| out.flush()).is_err() {
        log::error!("stdout closed, dropping response for {}", id);
    }
}

fn work(dispatcher: &Dispatcher, jobs: Receiver<Job>) {
    for job in jobs {
        let request = match job.request {
            Ok(request) => request,
            Err(message) => {
                respond(
                    &job.id,
                    ("error", json!({ "kind": "invalid-request", "message": message })),
                );
                continue;
            }
        };
        match dispatcher.handle(&request) {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => respond(&job.id, ("result", value)),
                Err(e) => respond(
                    &job.id,
                    ("error", json!({ "kind": "infrastructure", "message": e.to_string() })),
                ),
            },
            Err(e) => respond(
                &job.id,
                ("error", json!({ "kind": e.kind(), "message": e.to_string() })),
            ),
        }
    }
}

fn read_lines(lines: Sender<String>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => {
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("reading stdin failed: {}", e);
                break;
            }
        }
    }
}

fn serve(config: ServiceConfig) -> Result<()> {
    let signals = SignalHandler::init().map_err(anyhow::Error::msg)?;
    let workers = config.pool.capacity + 1;
    let dispatcher = Arc::new(build_dispatcher(config)?);

    let (line_tx, line_rx) = crossbeam_channel::bounded::<String>(workers);
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(workers);

    // The reader blocks in read(2); it is detached rather than joined.
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || read_lines(line_tx))?;

    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let dispatcher = Arc::clone(&dispatcher);
        let jobs = job_rx.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("worker-{}", n))
                .spawn(move || work(&dispatcher, jobs))?,
        );
    }
    drop(job_rx);
    log::info!("serving with {} workers", workers);

    loop {
        if signals.shutdown_requested() {
            log::info!("signal {} received, draining", signals.get_signal());
            break;
        }
        match line_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                if job_tx.send(parse_line(&line)).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(job_tx);
    for handle in handles {
        if handle.join().is_err() {
            log::error!("worker thread panicked");
        }
    }

    let report = dispatcher.shutdown();
    log::info!(
        "shutdown: {} idle environments destroyed, {} forced, {} errors",
        report.idle_destroyed,
        report.forced.len(),
        report.errors.len()
    );
    log::debug!("final metrics:\n{}", dispatcher.metrics().export_prometheus());
    Ok(())
}

fn check_dependencies(config: &ServiceConfig, verbose: bool) -> Result<()> {
    use std::process::Command;

    let toolchain = RustcToolchain::new(config.toolchain.clone());
    let tools = [
        ("rustc", toolchain.rustc_path(), true),
        ("objdump", toolchain.objdump_path(), false),
    ];

    let mut missing_required = false;
    for (name, path, required) in tools {
        let version = Command::new(path)
            .arg("--version")
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| {
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string()
            });

        match version {
            Some(version) => {
                println!("{}: OK", name);
                if verbose {
                    println!("  {} -> {}", path.display(), version);
                }
            }
            None if required => {
                println!("{}: MISSING ({})", name, path.display());
                missing_required = true;
            }
            None => {
                println!(
                    "{}: MISSING ({}), compile-and-disassemble requests will report a warning",
                    name,
                    path.display()
                );
            }
        }
    }

    if missing_required {
        std::process::exit(1);
    }
    Ok(())
}

fn validate(config: &ServiceConfig) -> Result<()> {
    println!("configuration: OK");
    println!(
        "pool: capacity {}, max reuses {}, acquire timeout {} ms",
        config.pool.capacity, config.pool.max_reuses, config.pool.acquire_timeout_ms
    );
    for missing in check_system_capabilities() {
        println!("warning: {}", missing);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_extracts_id() {
        let job = parse_line(r#"{"id": 7, "source": "fn main() {}", "mode": "compile-only"}"#);
        assert_eq!(job.id, json!(7));
        let request = job.request.unwrap();
        assert_eq!(request.mode, ExecutionMode::CompileOnly);
    }

    #[test]
    fn test_parse_line_without_id() {
        let job = parse_line(r#"{"source": "fn main() {}"}"#);
        assert_eq!(job.id, Value::Null);
        assert_eq!(job.request.unwrap().mode, ExecutionMode::CompileAndRun);
    }

    #[test]
    fn test_parse_line_rejects_unknown_fields() {
        let job = parse_line(r#"{"id": "a", "source": "fn main() {}", "language": "c"}"#);
        assert_eq!(job.id, json!("a"));
        assert!(job.request.is_err());
    }

    #[test]
    fn test_parse_line_malformed() {
        let job = parse_line("{not json");
        assert!(job.request.unwrap_err().contains("malformed"));
    }

    #[test]
    fn test_cli_parses_execute() {
        let cli = Cli::try_parse_from([
            "boltbox",
            "execute",
            "--source",
            "main.rs",
            "--mode",
            "compile-only",
            "--opt-level",
            "2",
            "--",
            "a",
            "b",
        ])
        .unwrap();
        match cli.command {
            Commands::Execute {
                mode,
                opt_level,
                args,
                ..
            } => {
                assert_eq!(mode, ExecutionMode::CompileOnly);
                assert_eq!(opt_level, Some(OptLevel::O2));
                assert_eq!(args, vec!["a", "b"]);
            }
            _ => panic!("expected execute"),
        }
    }
}
