//! Wires a frontend (chosen by file extension) to a backend (chosen by
//! output format) and runs the compilation, or hands control to the JIT.

use std::path::Path;

use log::{info, log_enabled, Level};

use crate::asm::{Assembler, IjvmAssembler, JasAssembler, X64Assembler};
use crate::buffer::{Buffer};
use crate::error::{Error, Result};
use crate::frontend::{ij, ijvm, jas};
use crate::lexer::{Lexer};

/** The artifact a `compile` run produces. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    /** Textual JAS assembly. */
    Jas,
    /** An IJVM binary image. */
    Ijvm,
    /** Raw x86-64 machine code. */
    X64,
}

fn run_frontend(input: &Path, a: &mut dyn Assembler) -> Result<()> {
    let ext = input.extension().and_then(|e| e.to_str()).unwrap_or("");
    info!("reading {}", input.display());
    match ext {
        "ij" => {
            let mut l = Lexer::new();
            l.add_source(&input.to_string_lossy())?;
            ij::compile(&mut l, a)
        },
        "jas" => {
            let mut l = Lexer::new();
            l.add_source(&input.to_string_lossy())?;
            jas::compile(&mut l, a)
        },
        "ijvm" => {
            let image = Buffer::from_file(input)?;
            ijvm::compile(&image, a)
        },
        _ => Err(Error::semantic(format!(
            "don't know how to read '{}': expected .ij, .jas or .ijvm input",
            input.display()))),
    }
}

/** Compiles `input` into an in-memory artifact. */
pub fn compile_file(input: &Path, format: Format) -> Result<Vec<u8>> {
    let mut a: Box<dyn Assembler> = match format {
        Format::Jas => Box::new(JasAssembler::new()),
        Format::Ijvm => Box::new(IjvmAssembler::new()),
        Format::X64 => Box::new(X64Assembler::new()),
    };
    run_frontend(input, a.as_mut())?;
    let mut out = Vec::new();
    a.compile(&mut out)?;
    info!("emitted {} bytes", out.len());
    Ok(out)
}

/**
 * Compiles `input` to native code and executes it in-process, optionally
 * redirecting the program's standard streams. Does not return on success.
 */
pub fn run_file(
    input: &Path,
    program_input: Option<&Path>,
    program_output: Option<&Path>,
) -> Result<()> {
    let mut a = X64Assembler::new();
    a.set_trace(log_enabled!(Level::Debug));
    run_frontend(input, &mut a)?;
    a.run(program_input, program_output)
}
