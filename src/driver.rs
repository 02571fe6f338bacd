//! Pipeline orchestration: source file in, executable (or diagnostic) out.
//!
//! Each stage function is also exposed individually (`check_file`,
//! `emit_tac`, `compile_to_asm`) so the CLI's `check`/`emit-tac` subcommands
//! can stop partway through the pipeline without re-running it. Every stage
//! boundary emits a `tracing` event; run with `BXC_LOG=debug` or `=trace`
//! to watch a compile move through parse/check/lower/optimize/codegen.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, trace};

use crate::ast::Program;
use crate::cfg::linearize_proc;
use crate::codegen::codegen_program;
use crate::config::CompilerConfig;
use crate::error::{CompileResult, Diagnostic, DiagnosticKind};
use crate::lower::lower;
use crate::opt_cfg;
use crate::parser::parse;
use crate::ssa;
use crate::tac::{TacDecl, TacProgram};
use crate::typechecker::check;

fn io_err(file: &str, message: impl std::fmt::Display) -> Diagnostic {
    Diagnostic::new(file, 0, DiagnosticKind::Internal, message.to_string())
}

fn read_source(path: &Path) -> CompileResult<String> {
    fs::read_to_string(path).map_err(|e| io_err(&path.display().to_string(), format!("cannot read {}: {e}", path.display())))
}

/// Parse and type-check `path`, returning the annotated AST. No codegen.
pub fn check_file(path: &Path) -> CompileResult<Program> {
    let file = path.display().to_string();
    let source = read_source(path)?;
    trace!(file = %file, bytes = source.len(), "read source");
    let mut program = parse(&file, &source)?;
    debug!(file = %file, decls = program.decls.len(), "parsed");
    check(&file, &mut program)?;
    debug!(file = %file, "type-checked");
    Ok(program)
}

/// Run the front end and lower to TAC, applying §4.G/§4.H optimizations per
/// `config.optimize`, then re-linearizing every procedure body.
pub fn emit_tac(path: &Path, config: &CompilerConfig) -> CompileResult<TacProgram> {
    let file = path.display().to_string();
    let program = check_file(path)?;
    let mut tac = lower(&file, &program)?;
    debug!(file = %file, decls = tac.decls.len(), "lowered to TAC");

    for decl in &mut tac.decls {
        if let TacDecl::Proc { name, body, .. } = decl {
            *body = if config.optimize {
                trace!(proc = %name, instrs = body.len(), "running CFG/SSA optimization passes");
                let optimized = opt_cfg::optimize_proc(body);
                ssa::optimize_proc(&optimized)
            } else {
                linearize_proc(body)
            };
            trace!(proc = %name, instrs = body.len(), "proc lowering finalized");
        }
    }
    Ok(tac)
}

/// Run the full pipeline through assembly generation, without writing
/// anything to disk.
pub fn compile_to_asm(path: &Path, config: &CompilerConfig) -> CompileResult<String> {
    let tac = emit_tac(path, config)?;
    let asm = codegen_program(&tac);
    debug!(file = %path.display(), bytes = asm.len(), "generated assembly");
    Ok(asm)
}

/// Locate the bundled C runtime's source, relative to this crate (works
/// both from an installed crate and from the workspace during development).
fn runtime_source() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("runtime/bx_runtime.c")
}

/// Full pipeline: parse, check, lower, optimize, codegen, assemble and link
/// via `gcc`. Returns the path to the produced executable.
pub fn compile_file(path: &Path, config: &CompilerConfig) -> CompileResult<PathBuf> {
    let file = path.display().to_string();
    let asm = compile_to_asm(path, config)?;

    let asm_path = path.with_extension("s");
    fs::write(&asm_path, &asm).map_err(|e| io_err(&file, format!("cannot write {}: {e}", asm_path.display())))?;

    if config.keep_tac {
        let tac = emit_tac(path, config)?;
        let tac_path = path.with_extension("tac.json");
        let json = serde_json::to_string_pretty(&tac).map_err(|e| io_err(&file, format!("cannot serialize TAC: {e}")))?;
        fs::write(&tac_path, json).map_err(|e| io_err(&file, format!("cannot write {}: {e}", tac_path.display())))?;
    }

    let output_path = config.output.clone().unwrap_or_else(|| path.with_extension(""));
    let status = Command::new("gcc")
        .arg(&asm_path)
        .arg(runtime_source())
        .arg("-o")
        .arg(&output_path)
        .status()
        .map_err(|e| io_err(&file, format!("failed to invoke gcc: {e}")))?;

    if !config.keep_asm {
        let _ = fs::remove_file(&asm_path);
    }

    if !status.success() {
        return Err(io_err(&file, format!("gcc exited with status {status}")));
    }
    debug!(file = %file, output = %output_path.display(), "assembled and linked");
    Ok(output_path)
}
