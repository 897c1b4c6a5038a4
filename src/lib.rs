#![warn(missing_docs)]
//! # GScript
//!
//! A small statically typed scripting language toolchain: lexer,
//! transactional recursive-descent parser, type/function/module
//! registries, template engine, AST→IR compiler, dataflow optimizer,
//! linear-scan register allocator, and two backends (a bytecode VM and a
//! minimal native x86-64 emitter).
//!
//! ## Quick start
//!
//! ```
//! use gscript::backend::{self, Backend, VmBackend, VmOptions};
//! use gscript::compiler::{CompileOptions, Pipeline};
//! use gscript::source::SourceBuffer;
//!
//! # fn main() -> gscript::Result<()> {
//! let code = r#"
//!     function main(): i32 {
//!         let total: i32 = 0;
//!         for (let i = 1; i <= 10; i = i + 1) {
//!             total = total + i;
//!         }
//!         return total;
//!     }
//! "#;
//!
//! let mut pipeline = Pipeline::new(CompileOptions::default());
//! let mut output = pipeline.compile_source(SourceBuffer::new("sum.gs", code))?;
//!
//! let mut vm = VmBackend::new(VmOptions::default());
//! backend::finalize_module(&mut vm, pipeline.context(), &mut output)?;
//! backend::run_module_init(&mut vm, pipeline.context(), &output)?;
//!
//! let main = pipeline.context().funcs.read().get_by_fqn("sum::main")[0];
//! let mut result = 0u64;
//! vm.call(pipeline.context(), main, Some(&mut result), &[])?;
//! assert_eq!(result as i32, 55);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Source → Tokens → AST → Typed AST + Symbol Tables → IR → Optimized IR
//!        → Register Allocation → Backend Artifact
//! ```
//!
//! The [`compiler::Pipeline`] coordinates one compile; resolving an
//! `import` spawns a child pipeline over the same registries, and the
//! shared import stack turns cycles into diagnostics. Host code binds
//! types, functions, and enums through [`bind`]; the standard set of
//! intrinsics and vector types lives in [`builtin`].

/// Version of the GScript toolchain
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod backend;
pub mod bind;
pub mod builtin;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod modules;
pub mod parser;
pub mod source;
pub mod types;

// Re-export the types most embedders touch
pub use compiler::{CompilationOutput, CompileOptions, Context, Pipeline};
pub use error::{Diagnostic, Error, ErrorCode, Logger, Result, RuntimeError, Severity};
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::{NodeKind, NodePool, NodeRef, ParseOutput, Parser};
pub use source::{SourceBuffer, SourceSpan};
