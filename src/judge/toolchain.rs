use crate::config::service::ToolchainConfig;
use crate::config::types::{Diagnostic, OptLevel, Result, SandboxError};
use crate::core::backend::{CommandLimits, CommandSpec};
use crate::core::environment::IsolatedEnvironment;
use crate::judge::diagnostics::parse_rustc_output;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the entry source inside the environment's work directory
pub const SOURCE_NAME: &str = "main.rs";
/// Name of the produced binary inside the environment's output directory
pub const ARTIFACT_NAME: &str = "main";

/// Compiler diagnostics are verbose JSON; never capture less than this.
const MIN_COMPILER_CAPTURE: u64 = 1024 * 1024;
/// objdump output is captured in full and filtered afterwards.
const DISASSEMBLER_CAPTURE: u64 = 32 * 1024 * 1024;

/// `-C` codegen options a request may set
const ALLOWED_CODEGEN: &[&str] = &[
    "debug-assertions",
    "overflow-checks",
    "target-cpu",
    "panic",
    "codegen-units",
    "lto",
    "debuginfo",
];

/// Per-request compiler options
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub opt_level: Option<OptLevel>,
    pub extra_args: Vec<String>,
}

/// Compile/run/disassemble contract for one language toolchain.
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &'static str;

    /// Command compiling `SOURCE_NAME` in the work dir into the artifact path
    fn compile_command(
        &self,
        env: &IsolatedEnvironment,
        options: &BuildOptions,
        timeout: Duration,
    ) -> CommandSpec;

    fn run_command(
        &self,
        env: &IsolatedEnvironment,
        arguments: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> CommandSpec;

    fn disassemble_command(&self, env: &IsolatedEnvironment, timeout: Duration) -> CommandSpec;

    /// Turn compiler stderr into ordered diagnostics
    fn parse_diagnostics(&self, stderr: &str) -> Vec<Diagnostic>;

    /// Keep the part of the disassembly that belongs to the user's crate
    fn filter_disassembly(&self, text: &str) -> String;

    /// Most disassembly text returned to the caller
    fn disassembly_limit(&self) -> usize;
}

/// Check request-supplied compiler arguments against the allowlist
pub fn validate_compiler_args(args: &[String]) -> Result<()> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let ok = match arg.as_str() {
            "-C" | "--cfg" | "-W" | "-A" | "-D" | "-F" => {
                let value = iter.next().ok_or_else(|| {
                    SandboxError::InvalidRequest(format!("compiler argument {} needs a value", arg))
                })?;
                check_flag_value(arg, value)
            }
            other => {
                if let Some(edition) = other.strip_prefix("--edition=") {
                    is_edition(edition)
                } else if let Some(value) = other.strip_prefix("-C") {
                    check_flag_value("-C", value)
                } else if let Some(value) = other.strip_prefix("--cfg=") {
                    check_flag_value("--cfg", value)
                } else {
                    ["-W", "-A", "-D", "-F"].iter().any(|flag| {
                        other
                            .strip_prefix(flag)
                            .is_some_and(|lint| check_flag_value(flag, lint))
                    })
                }
            }
        };
        if !ok {
            return Err(SandboxError::InvalidRequest(format!(
                "compiler argument not allowed: {}",
                arg
            )));
        }
    }
    Ok(())
}

fn check_flag_value(flag: &str, value: &str) -> bool {
    match flag {
        "-C" => match value.split_once('=') {
            Some((key, val)) => ALLOWED_CODEGEN.contains(&key) && is_plain(val),
            None => false,
        },
        "--cfg" => {
            !value.is_empty()
                && value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "_=\"".contains(c))
        }
        _ => is_lint_name(value),
    }
}

fn is_plain(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_lint_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == ':')
}

pub fn is_edition(value: &str) -> bool {
    matches!(value, "2015" | "2018" | "2021" | "2024")
}

/// Find `program` on the host PATH. Paths with a separator are returned as is.
pub fn locate(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// `rustc` plus `objdump`
pub struct RustcToolchain {
    config: ToolchainConfig,
    rustc: PathBuf,
    objdump: PathBuf,
    passthrough: Vec<(String, String)>,
}

impl RustcToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        // Sandboxed commands get a minimal PATH, so bare names are resolved
        // against the service's own PATH up front.
        let rustc = locate(&config.rustc).unwrap_or_else(|| config.rustc.clone());
        let objdump = locate(&config.objdump).unwrap_or_else(|| config.objdump.clone());
        let passthrough = host_passthrough(&config.preserve_env);
        log::debug!(
            "Toolchain: rustc={} objdump={} edition={}",
            rustc.display(),
            objdump.display(),
            config.edition
        );
        Self {
            config,
            rustc,
            objdump,
            passthrough,
        }
    }

    pub fn rustc_path(&self) -> &Path {
        &self.rustc
    }

    pub fn objdump_path(&self) -> &Path {
        &self.objdump
    }

    /// Host directories a jailed compiler needs to see: the install prefix of
    /// each tool (through symlinks too) and the preserved rustup homes.
    pub fn host_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for tool in [&self.rustc, &self.objdump] {
            let canonical = tool.canonicalize().ok();
            for path in std::iter::once(tool.as_path()).chain(canonical.as_deref()) {
                if let Some(prefix) = install_prefix(path) {
                    if !paths.contains(&prefix) {
                        paths.push(prefix);
                    }
                }
            }
        }
        for (name, value) in &self.passthrough {
            if name.ends_with("_HOME") {
                let home = PathBuf::from(value);
                if home.is_absolute() && !paths.contains(&home) {
                    paths.push(home);
                }
            }
        }
        paths
    }

    fn with_passthrough(&self, mut spec: CommandSpec) -> CommandSpec {
        for (key, value) in &self.passthrough {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }
}

/// `/opt/rust/bin/rustc` lives under `/opt/rust`; `/rustc` under `/`
fn install_prefix(tool: &Path) -> Option<PathBuf> {
    if !tool.is_absolute() {
        return None;
    }
    let bin = tool.parent()?;
    match bin.parent() {
        Some(prefix) if prefix.components().count() > 1 => Some(prefix.to_path_buf()),
        _ => Some(bin.to_path_buf()),
    }
}

/// Host values of the preserved variables. HOME inside the sandbox points at
/// scratch space, so rustup's homes are pinned to the host locations.
fn host_passthrough(names: &[String]) -> Vec<(String, String)> {
    let home = std::env::var("HOME").ok();
    names
        .iter()
        .filter_map(|name| {
            if let Ok(value) = std::env::var(name) {
                return Some((name.clone(), value));
            }
            let fallback = match (name.as_str(), &home) {
                ("RUSTUP_HOME", Some(home)) => Path::new(home).join(".rustup"),
                ("CARGO_HOME", Some(home)) => Path::new(home).join(".cargo"),
                _ => return None,
            };
            fallback
                .is_dir()
                .then(|| (name.clone(), fallback.display().to_string()))
        })
        .collect()
}

impl Toolchain for RustcToolchain {
    fn name(&self) -> &'static str {
        "rustc"
    }

    fn compile_command(
        &self,
        env: &IsolatedEnvironment,
        options: &BuildOptions,
        timeout: Duration,
    ) -> CommandSpec {
        let active = env.active_limits();
        let limits = CommandLimits {
            cpu_time: timeout,
            memory_bytes: self.config.compile_memory_bytes,
            enforce_address_space: false,
            process_count: self.config.compile_process_count,
            output_bytes: active.output_bytes.max(MIN_COMPILER_CAPTURE),
            file_size_bytes: active.disk_bytes,
        };
        let opt_level = options.opt_level.unwrap_or(self.config.opt_level);
        let artifact = env.artifact_path(ARTIFACT_NAME);
        let (edition, extra_args) = split_edition(&options.extra_args, &self.config.edition);

        let mut spec = env
            .command(&self.rustc)
            .args([
                SOURCE_NAME,
                "--crate-name",
                ARTIFACT_NAME,
                "--crate-type",
                "bin",
                "--edition",
                edition,
                "--error-format=json",
                "-C",
            ])
            .args([format!("opt-level={}", opt_level.as_str())])
            .args(extra_args)
            .args(["-o".to_string(), artifact.display().to_string()])
            .timeout(timeout);
        spec.limits = limits;
        self.with_passthrough(spec)
    }

    fn run_command(
        &self,
        env: &IsolatedEnvironment,
        arguments: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> CommandSpec {
        env.command(env.artifact_path(ARTIFACT_NAME))
            .args(arguments.iter().cloned())
            .stdin(stdin)
            .timeout(timeout)
            .isolate_network(true)
    }

    fn disassemble_command(&self, env: &IsolatedEnvironment, timeout: Duration) -> CommandSpec {
        let mut spec = env
            .command(&self.objdump)
            .args(["-d", "-C", "--no-show-raw-insn"])
            .args([env.artifact_path(ARTIFACT_NAME).display().to_string()])
            .timeout(timeout);
        spec.limits.cpu_time = timeout;
        spec.limits.enforce_address_space = false;
        spec.limits.output_bytes = DISASSEMBLER_CAPTURE;
        spec
    }

    fn parse_diagnostics(&self, stderr: &str) -> Vec<Diagnostic> {
        parse_rustc_output(stderr)
    }

    fn filter_disassembly(&self, text: &str) -> String {
        filter_crate_symbols(text, ARTIFACT_NAME)
    }

    fn disassembly_limit(&self) -> usize {
        self.config.disassembly_max_bytes
    }
}

/// A request's `--edition=` replaces the configured default; rustc rejects
/// the flag given twice.
fn split_edition<'a>(args: &'a [String], default: &'a str) -> (&'a str, Vec<String>) {
    let mut edition = default;
    let mut rest = Vec::with_capacity(args.len());
    for arg in args {
        match arg.strip_prefix("--edition=") {
            Some(requested) => edition = requested,
            None => rest.push(arg.clone()),
        }
    }
    (edition, rest)
}

/// Keep the objdump blocks whose symbol belongs to crate `krate`
pub fn filter_crate_symbols(text: &str, krate: &str) -> String {
    let prefix = format!("{}::", krate);
    let nested = format!("<{}::", krate);
    let mut out = String::new();
    let mut keep = false;
    for line in text.lines() {
        if let Some(symbol) = symbol_header(line) {
            keep = symbol == krate
                || symbol.starts_with(&prefix)
                || symbol.contains(&nested)
                || symbol.contains(&format!(" {}", prefix));
            if keep && !out.is_empty() {
                out.push('\n');
            }
        }
        if keep {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// `0000000000401130 <main::main>:` yields `main::main`
fn symbol_header(line: &str) -> Option<&str> {
    let (addr, rest) = line.split_once(' ')?;
    if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    rest.strip_prefix('<')?.strip_suffix(">:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allowlisted_arguments_pass() {
        assert!(validate_compiler_args(&args(&["-C", "overflow-checks=on"])).is_ok());
        assert!(validate_compiler_args(&args(&["-Cpanic=abort", "--edition=2018"])).is_ok());
        assert!(validate_compiler_args(&args(&["-W", "unused", "-Adead_code"])).is_ok());
        assert!(validate_compiler_args(&args(&["--cfg", "feature=\"fast\""])).is_ok());
    }

    #[test]
    fn dangerous_arguments_are_rejected() {
        for bad in [
            vec!["-C", "linker=/bin/sh"],
            vec!["-L", "/etc"],
            vec!["--extern", "evil=/tmp/libevil.rlib"],
            vec!["-o", "/etc/passwd"],
            vec!["-C", "link-arg=-Wl,--wrap"],
            vec!["--edition=1999"],
            vec!["-C"],
            vec!["-Cpanic=abort; rm -rf /"],
        ] {
            assert!(
                matches!(
                    validate_compiler_args(&args(&bad)),
                    Err(SandboxError::InvalidRequest(_))
                ),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn requested_edition_replaces_default() {
        let extra = args(&["-W", "unused", "--edition=2018"]);
        let (edition, rest) = split_edition(&extra, "2021");
        assert_eq!(edition, "2018");
        assert_eq!(rest, args(&["-W", "unused"]));

        let extra = args(&["-Cpanic=abort"]);
        let (edition, rest) = split_edition(&extra, "2021");
        assert_eq!(edition, "2021");
        assert_eq!(rest, args(&["-Cpanic=abort"]));
    }

    #[test]
    fn install_prefixes_cover_the_toolchain() {
        assert_eq!(
            install_prefix(Path::new("/opt/rust/bin/rustc")),
            Some(PathBuf::from("/opt/rust"))
        );
        assert_eq!(
            install_prefix(Path::new("/usr/bin/objdump")),
            Some(PathBuf::from("/usr"))
        );
        assert_eq!(install_prefix(Path::new("/bin/rustc")), Some(PathBuf::from("/bin")));
        assert_eq!(install_prefix(Path::new("rustc")), None);

        let toolchain = RustcToolchain::new(ToolchainConfig {
            rustc: PathBuf::from("/opt/rust/bin/rustc"),
            objdump: PathBuf::from("/usr/bin/objdump"),
            preserve_env: Vec::new(),
            ..ToolchainConfig::default()
        });
        let paths = toolchain.host_paths();
        assert!(paths.contains(&PathBuf::from("/opt/rust")));
        assert!(paths.contains(&PathBuf::from("/usr")));
    }

    #[test]
    fn symbol_filter_keeps_user_code() {
        let text = "\
Disassembly of section .text:

0000000000007000 <std::rt::lang_start>:
    7000:\tpush   %rax
    7001:\tret

0000000000007010 <main::main>:
    7010:\tsub    $0x8,%rsp
    7014:\tret

0000000000007020 <main>:
    7020:\tjmp    7000
";
        let kept = filter_crate_symbols(text, "main");
        assert!(kept.contains("<main::main>:"));
        assert!(kept.contains("<main>:"));
        assert!(!kept.contains("lang_start"));
        assert!(!kept.contains("Disassembly of section"));
    }

    #[test]
    fn symbol_header_needs_address() {
        assert_eq!(symbol_header("0000000000401130 <main::main>:"), Some("main::main"));
        assert_eq!(symbol_header("    401130:\tret"), None);
        assert_eq!(symbol_header("Disassembly of section .text:"), None);
    }

    #[test]
    fn locate_passes_through_explicit_paths() {
        assert_eq!(locate(Path::new("/bin/sh")), Some(PathBuf::from("/bin/sh")));
        assert_eq!(locate(Path::new("/nonexistent/rustc")), None);
        assert!(locate(Path::new("sh")).is_some());
    }
}
