//! The disk-buffered C compiler.
//!
//! Compilation is a chain of passes that use the filesystem as working
//! memory; each pass streams its input file and writes the next one:
//!
//! ```text
//! name.c  --lex-->  name.tok  --parse-->  name.ast  --codegen-->  name.o
//! ```
//!
//! and the linker turns one or more objects into the final `.mimi`. The
//! in-RAM state of each pass is bounded by small buffers and tables; the
//! token stream, AST, and object sections all live on disk between passes.
//!
//! The accepted language is a C subset sufficient for embedded programs:
//! integers, pointers, arrays, loops, conditionals, and function calls.
//! Preprocessor directives are tokenized and then discarded, and struct
//! and union bodies parse without member-offset code generation.

use log::debug;

use crate::common::{ErrorCode, Result};
use crate::fs::{BlockDevice, Volume};
use crate::link;

pub mod token;

pub mod lexer;
pub use lexer::{lex, LexStats};

pub mod ast;

pub mod parser;
pub use parser::{parse, ParseStats};

pub mod thumb;

pub mod codegen;
pub use codegen::{codegen, CodegenStats};

/// How many diagnostics a pass records before giving up.
pub const MAX_ERRORS: u32 = 10;

/// Accumulated diagnostics for one compilation.
///
/// Passes keep going past non-fatal errors; the driver declares the
/// compilation failed at the next pass boundary if anything was recorded.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub error_count: u32,
    pub warning_count: u32,
    /// The first error message and its source line, kept for the shell.
    pub error_msg: Option<String>,
    pub error_line: u32,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Record an error. Returns `Err(Toolarge)` once the error budget is
    /// spent, which aborts the pass.
    pub fn error(&mut self, line: u32, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        debug!("error: line {}: {}", line, msg);
        if self.error_msg.is_none() {
            self.error_msg = Some(msg);
            self.error_line = line;
        }
        self.error_count += 1;
        if self.error_count >= MAX_ERRORS {
            return Err(ErrorCode::Toolarge);
        }
        Ok(())
    }

    pub fn warning(&mut self, line: u32, msg: impl Into<String>) {
        debug!("warning: line {}: {}", line, msg.into());
        self.warning_count += 1;
    }

    pub fn ok(&self) -> bool {
        self.error_count == 0
    }
}

/// Per-pass counters for one compilation.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub lex: LexStats,
    pub parse: ParseStats,
    pub codegen: CodegenStats,
    pub errors: u32,
    pub warnings: u32,
}

/// Derive a working-file name by swapping the extension.
fn with_extension(path: &str, ext: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, _)) => format!("{}.{}", stem, ext),
        None => format!("{}.{}", path, ext),
    }
}

/// Compile one source file to a `.mimi` image.
///
/// Runs every pass, leaving the intermediate `.tok`, `.ast`, and `.o`
/// files on the volume. Returns `Corrupt` if any pass recorded an error.
pub fn compile<D: BlockDevice>(
    vol: &mut Volume<D>,
    source_path: &str,
    output_path: &str,
) -> Result<CompileStats> {
    let tok_path = with_extension(source_path, "tok");
    let ast_path = with_extension(source_path, "ast");
    let obj_path = with_extension(source_path, "o");

    let mut diag = Diagnostics::new();
    let mut stats = CompileStats::default();

    stats.lex = lex(vol, source_path, &tok_path, &mut diag)?;
    if !diag.ok() {
        stats.errors = diag.error_count;
        return Err(ErrorCode::Corrupt);
    }

    stats.parse = parse(vol, &tok_path, &ast_path, &mut diag)?;
    if !diag.ok() {
        stats.errors = diag.error_count;
        return Err(ErrorCode::Corrupt);
    }

    stats.codegen = codegen(vol, &ast_path, &obj_path, &mut diag)?;
    stats.errors = diag.error_count;
    stats.warnings = diag.warning_count;
    if !diag.ok() {
        return Err(ErrorCode::Corrupt);
    }

    let object = vol.read_file(&obj_path)?;
    link::link(vol, &[&object], output_path)?;
    debug!(
        "compile: {} -> {} ({} tokens, {} nodes, {} text bytes)",
        source_path, output_path, stats.lex.tokens, stats.parse.nodes, stats.codegen.text_bytes
    );
    Ok(stats)
}
