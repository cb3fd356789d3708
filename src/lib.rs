//! The Ark language compiler and virtual machine.
//!
//! This crate provides the complete Ark pipeline:
//!
//! 1. **Lexer** (`lexer`) — tokenises source text into a flat `Vec<Token>`.
//! 2. **Parser** (`parser`) — reads the token stream into a [`ast::Node`] tree.
//! 3. **Bytecode** (`bytecode`) — `Instruction` definitions, operator table,
//!    and `Page` (one byte buffer per function body).
//! 4. **Compiler** (`compiler`) — lowers the AST into pages plus symbol and
//!    constant tables.
//! 5. **Container** (`container`) — the binary on-disk format: header,
//!    tables, framed code segments, SHA-256 content hash.
//! 6. **Values** (`value`) — runtime `Value` enum and shared `Scope` vectors.
//! 7. **Builtins** (`builtins`) — native Rust functions exposed to programs.
//! 8. **VM** (`vm`) — the stack-based interpreter executing a loaded image.
//!
//! # Entry point
//!
//! The simplest way to run an Ark program from Rust is:
//!
//! ```rust,ignore
//! use ark::run_source;
//! let result = run_source("(let x 6) (let y 7) (* x y)", "answer.ark")?;
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod container;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

// ─────────────────────────────────────────────────────────────────────────────
// Unified error type
// ─────────────────────────────────────────────────────────────────────────────

use crate::compiler::{CompileError, Compiler};
use crate::container::ContainerError;
use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::value::Value;
use crate::vm::{RuntimeError, Vm};

/// The unified error type for all Ark pipeline stages.
///
/// Each variant wraps errors from the corresponding stage so that callers can
/// handle them uniformly or match on the specific stage.
#[derive(Debug, thiserror::Error)]
pub enum ArkError {
    /// One or more lexical errors.
    #[error("Lex error: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Lex(Vec<LexError>),

    /// A syntax error.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A compile-time error (unbound symbol, arity, table overflow, …).
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// A container error (bad magic, version, hash, truncation).
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// A runtime error raised by the VM.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// An I/O error (file reading or writing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand result type for all Ark operations.
pub type ArkResult<T> = Result<T, ArkError>;

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Compile `source` to container bytes.
///
/// `filename` is used for logging and diagnostics only.
pub fn compile_source(source: &str, filename: &str) -> ArkResult<Vec<u8>> {
    let mut compiler = Compiler::new(0, Vec::new(), 0);
    compiler.feed(source, filename)?;
    compiler.compile()?;
    Ok(compiler.bytecode().to_vec())
}

/// Full pipeline: lex → parse → compile → load → run.
pub fn run_source(source: &str, filename: &str) -> ArkResult<Value> {
    let bytecode = compile_source(source, filename)?;
    let mut machine = Vm::new(false);
    machine.feed_bytes(&bytecode)?;
    Ok(machine.run()?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_helpers() {
        let result = run_source("(+ 1 2)", "<test>").unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn test_errors_carry_their_stage() {
        assert!(matches!(
            run_source("(let x", "<test>"),
            Err(ArkError::Parse(_))
        ));
        assert!(matches!(
            run_source("undefined-name", "<test>"),
            Err(ArkError::Compile(_))
        ));
        assert!(matches!(
            run_source("(/ 1 0)", "<test>"),
            Err(ArkError::Runtime(_))
        ));
    }
}
