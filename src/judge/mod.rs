//! Compile/run/disassemble pipeline for submitted Rust sources

pub mod diagnostics;
pub mod pipeline;
pub mod toolchain;

pub use pipeline::{Pipeline, PipelineReport, Stage};
pub use toolchain::{validate_compiler_args, BuildOptions, RustcToolchain, Toolchain};
