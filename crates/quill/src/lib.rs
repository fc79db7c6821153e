//! Quill — an embeddable, dynamically typed scripting language.
//!
//! Quill compiles an AST (produced by a separate front-end crate, or
//! assembled in Rust through [`ast`]'s constructors) into compact
//! bytecode and executes it on a stack-based virtual machine.
//!
//! # Features
//!
//! - **Rich value model**: nil, bools and flags, 64-bit ints and uints,
//!   floats, arbitrary-precision decimals, chars, strings, byte buffers,
//!   arrays, insertion-ordered dicts, key/value pairs, errors with cause
//!   chains, and the full callable family.
//! - **First-class functions**: positional, variadic, and named
//!   parameters with defaults; lexical closures capture variables as
//!   shared cells.
//! - **Structured error handling**: `try`/`catch`/`finally` with explicit
//!   protected regions; runtime errors carry traces.
//! - **Embedding surface**: host functions, modules, persistent globals,
//!   resource limits, cancellation, and output capture through
//!   [`Engine`].
//!
//! # Quick start
//!
//! ```
//! use quill::ast::{BinaryOp, Expr, File, Stmt};
//! use quill::{Engine, Value};
//!
//! let mut engine = Engine::new();
//!
//! // return 1 + 2 * 3
//! let file = File::new(vec![Stmt::ret(vec![Expr::binary(
//!     BinaryOp::Add,
//!     Expr::int(1),
//!     Expr::binary(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
//! )])]);
//!
//! assert_eq!(engine.run(&file).unwrap(), Value::Int(7));
//! ```
//!
//! # Architecture
//!
//! Source flows through four stages: an external parser produces the
//! [`ast`]; the [`optimizer`] folds constants and partially evaluates
//! pure sub-expressions; the [`compiler`] lowers the AST to byte-encoded
//! instructions with a per-scope symbol table; and the [`vm`] executes
//! frames over a shared operand stack. Compiled [`Program`]s are
//! immutable and can be run any number of times, on any number of
//! machines.

pub mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod decimal;
mod diagnostic;
mod engine;
mod error;
mod host;
mod methods;
mod modules;
mod operators;
mod optimizer;
mod slice;
mod span;
mod symbol;
mod value;
mod vm;

pub use builtins::BuiltinDef;
pub use bytecode::{CompiledFunction, Opcode, Program, disassemble};
pub use compiler::{Compiler, CompilerOptions};
pub use decimal::Decimal;
pub use diagnostic::{Diagnostic, Label};
pub use engine::{Engine, Output};
pub use error::{CompileError, Error, Result};
pub use host::{ArgInfo, HostCallError, HostFn, HostFnInfo, describe_host_fns};
pub use modules::{ModuleBuilder, ModuleEntry, ModuleMap};
pub use optimizer::Optimizer;
pub use span::{SourceFile, Span};
pub use symbol::{Symbol, SymbolScope, SymbolTable};
pub use value::{
    CallWrapper, CastError, Closure, ErrorValue, FromValue, HostFnImpl, HostFunction, IndexProxy,
    NativeFn, Obj, ObjectPtr, ObjectType, ReaderHandle, RuntimeError, Shared, Value, ValueIter,
    ValueMap, WriterHandle,
};
pub use vm::{AbortHandle, CallContext, Invoker, Limits, RunOptions, Vm};

// Re-export the macro when the macros feature is enabled.
#[cfg(feature = "macros")]
pub use quill_macros::host_fn;
