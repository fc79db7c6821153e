//! The embedding facade.
//!
//! [`Engine`] bundles everything a host needs to run scripts: registered
//! host functions, importable modules, a persistent globals mapping,
//! resource limits, and an abort handle. Each `run` compiles the given
//! AST against the engine's state and executes it; globals persist
//! between runs, so an engine behaves like a session.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ast::File;
use crate::bytecode::Program;
use crate::compiler::{Compiler, CompilerOptions};
use crate::error::Result;
use crate::host::{HostFn, HostFnInfo, describe_host_fns};
use crate::modules::{ModuleBuilder, ModuleMap};
use crate::symbol::SymbolTable;
use crate::value::{ErrorValue, HostFnImpl, HostFunction, Value, ValueMap, WriterHandle};
use crate::vm::{AbortHandle, CallContext, Limits, RunOptions, Vm};

/// An embeddable script engine.
///
/// # Example
///
/// ```
/// use quill::ast::{Expr, File, Stmt};
/// use quill::{Engine, Value};
///
/// let mut engine = Engine::new();
/// engine.register_fn("double", |ctx| {
///     let n = match ctx.args.first() {
///         Some(Value::Int(v)) => *v,
///         _ => 0,
///     };
///     Ok(Value::Int(n * 2))
/// });
///
/// // return double(21)
/// let file = File::new(vec![Stmt::ret(vec![Expr::call(
///     Expr::ident("double"),
///     vec![Expr::int(21)],
/// )])]);
/// assert_eq!(engine.run(&file).unwrap(), Value::Int(42));
/// ```
pub struct Engine {
    module_map: ModuleMap,
    globals: Value,
    /// Names registered by the host; pre-declared at compile time so
    /// scripts can reference them without a `global` statement. Globals a
    /// script creates itself are not in here — re-running a defining
    /// script must not trip the redeclaration check.
    declared: Vec<String>,
    host_infos: Vec<HostFnInfo>,
    limits: Limits,
    abort: AbortHandle,
    optimize: bool,
}

impl Engine {
    /// A fresh engine with no modules or host functions.
    pub fn new() -> Self {
        Self {
            module_map: ModuleMap::new(),
            globals: Value::dict(ValueMap::new()),
            declared: Vec::new(),
            host_infos: Vec::new(),
            limits: Limits::default(),
            abort: AbortHandle::new(),
            optimize: true,
        }
    }

    /// An engine with the builtin modules (`strings`, and `json` when the
    /// `serde` feature is on) pre-registered.
    pub fn with_builtin_modules() -> Self {
        let mut engine = Self::new();
        crate::modules::register_builtins(&mut engine.module_map);
        engine
    }

    /// Register a host function callable from scripts by name.
    ///
    /// # Example
    ///
    /// ```
    /// use quill::ast::{Expr, File, Stmt};
    /// use quill::{Engine, Value};
    ///
    /// let mut engine = Engine::new();
    /// engine.register_fn("greet", |ctx| {
    ///     let name = ctx.args.first().map(Value::to_print_string).unwrap_or_default();
    ///     Ok(Value::str(format!("Hello, {}!", name)))
    /// });
    ///
    /// let file = File::new(vec![Stmt::ret(vec![Expr::call(
    ///     Expr::ident("greet"),
    ///     vec![Expr::str("Ada")],
    /// )])]);
    /// assert_eq!(engine.run(&file).unwrap(), Value::str("Hello, Ada!"));
    /// ```
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut CallContext<'_>) -> std::result::Result<Value, ErrorValue>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let value = Value::HostFn(HostFunction::new(name.clone(), Arc::new(f) as HostFnImpl));
        self.set_global(name, value);
    }

    /// Register a host function together with its metadata, which feeds
    /// [`describe`](Self::describe).
    pub fn register_host_fn<F>(&mut self, info: HostFnInfo, f: F)
    where
        F: Fn(&mut CallContext<'_>) -> std::result::Result<Value, ErrorValue>
            + Send
            + Sync
            + 'static,
    {
        let name = info.name.clone();
        self.host_infos.push(info);
        self.register_fn(name, f);
    }

    /// Register a `#[host_fn]`-generated function.
    pub fn add<T: HostFn + 'static>(&mut self, _: T) {
        let info = T::info().clone();
        let name = info.name.clone();
        self.host_infos.push(info);
        self.register_fn(name, |ctx: &mut CallContext<'_>| T::call(ctx.args.clone()));
    }

    /// Register an importable module built from constants and functions.
    pub fn module<F>(&mut self, name: &str, builder_fn: F)
    where
        F: FnOnce(&mut ModuleBuilder),
    {
        let mut builder = ModuleBuilder::new(name);
        builder_fn(&mut builder);
        self.module_map.add_value(name, builder.build());
    }

    /// Direct access to the module map for AST or precompiled modules.
    pub fn modules_mut(&mut self) -> &mut ModuleMap {
        &mut self.module_map
    }

    /// Set a global visible to scripts. Globals persist across runs.
    pub fn set_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if !self.declared.contains(&name) {
            self.declared.push(name.clone());
        }
        if let Value::Dict(map) | Value::SyncDict(map) = &self.globals {
            map.write().insert(name, value.into());
        }
    }

    /// Read back a global after a run.
    pub fn global(&self, name: &str) -> Option<Value> {
        match &self.globals {
            Value::Dict(map) | Value::SyncDict(map) => map.read().get(name).cloned(),
            _ => None,
        }
    }

    /// Documentation for every host function registered with metadata.
    pub fn describe(&self) -> String {
        describe_host_fns(&self.host_infos)
    }

    /// The registered host function metadata.
    pub fn host_fns(&self) -> &[HostFnInfo] {
        &self.host_infos
    }

    /// Apply resource limits to subsequent runs.
    pub fn limit(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// A handle that aborts the running script from any thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Disable (or re-enable) the optimizer for subsequent compiles.
    pub fn set_optimize(&mut self, on: bool) {
        self.optimize = on;
    }

    /// Compile a file against this engine's modules and globals.
    pub fn compile(&self, file: &File) -> Result<Program> {
        // Pre-declare host-registered names so scripts can reference host
        // functions and host-set values without a `global` statement, and
        // carry over globals earlier runs created (those stay rebindable).
        let mut symbols = SymbolTable::global();
        for name in &self.declared {
            // Duplicates cannot occur in a fresh table.
            let _ = symbols.define_global_ref(name);
        }
        if let Value::Dict(map) | Value::SyncDict(map) = &self.globals {
            for name in map.read().keys() {
                symbols.declare_prior_global(name);
            }
        }
        let opts = CompilerOptions {
            optimize_const: self.optimize,
            optimize_expr: self.optimize,
            module_map: self.module_map.clone(),
            symbol_table: Some(symbols),
            ..CompilerOptions::default()
        };
        Compiler::compile(file, opts)
    }

    /// Compile and execute a file; the result is the script's `return`
    /// value (nil when it does not return).
    pub fn run(&mut self, file: &File) -> Result<Value> {
        let program = self.compile(file)?;
        self.run_program(&program)
    }

    /// Execute an already-compiled program.
    pub fn run_program(&mut self, program: &Program) -> Result<Value> {
        let opts = RunOptions {
            globals: Some(self.globals.clone()),
            abort: Some(self.abort.clone()),
            limits: self.limits.clone(),
            ..RunOptions::default()
        };
        Vm::run(program, opts)
    }

    /// Execute with positional and named script arguments (`param`,
    /// `__args__`).
    pub fn run_with_args(
        &mut self,
        file: &File,
        args: Vec<Value>,
        named_args: ValueMap,
    ) -> Result<Value> {
        let program = self.compile(file)?;
        let opts = RunOptions {
            globals: Some(self.globals.clone()),
            abort: Some(self.abort.clone()),
            limits: self.limits.clone(),
            args,
            named_args,
            ..RunOptions::default()
        };
        Vm::run(&program, opts)
    }

    /// Run a file and capture everything it wrote to the output chain.
    ///
    /// # Example
    ///
    /// ```
    /// use quill::ast::{Expr, File, Stmt};
    /// use quill::{Engine, Value};
    ///
    /// let mut engine = Engine::new();
    /// // println("hi"); return 7
    /// let file = File::new(vec![
    ///     Stmt::expr(Expr::call(Expr::ident("println"), vec![Expr::str("hi")])),
    ///     Stmt::ret(vec![Expr::int(7)]),
    /// ]);
    /// let output = engine.capture(&file).unwrap();
    /// assert_eq!(output.value, Value::Int(7));
    /// assert_eq!(output.output, "hi\n");
    /// ```
    pub fn capture(&mut self, file: &File) -> Result<Output> {
        let program = self.compile(file)?;
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = CaptureSink(buffer.clone());
        let opts = RunOptions {
            globals: Some(self.globals.clone()),
            abort: Some(self.abort.clone()),
            limits: self.limits.clone(),
            stdout: Some(WriterHandle::new(sink)),
            ..RunOptions::default()
        };
        let value = Vm::run(&program, opts)?;
        let bytes = std::mem::take(&mut *buffer.lock());
        Ok(Output {
            value,
            output: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of running with output capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// The script's return value.
    pub value: Value,
    /// Everything written to the output chain.
    pub output: String,
}

struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
