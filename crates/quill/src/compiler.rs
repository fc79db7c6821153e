//! Single-pass bytecode compiler.
//!
//! Walks the AST once and emits byte-encoded instructions. Jump targets use
//! the placeholder/patch approach: jumps are emitted with a zero operand
//! and patched once the real offset is known. Function literals are
//! compiled in a nested scope pushed onto `scopes`; the symbol table tree
//! decides between local, free, global, and builtin access and records the
//! capture list each closure needs.
//!
//! Stack conventions shared with the machine:
//!
//! - `Call argc flags`: `callee, args…[, vararg array][, named bundle]
//!   [, extra named]`, popped top-down.
//! - `CallName` inserts the method-name constant between the receiver and
//!   the arguments.
//! - `SetIndex` pops `value, index, object`; `SliceIndex` pops
//!   `high, low, object`.
//! - A protected region is `SetupTry catch finally … SetupCatch …
//!   SetupFinally … Finalizer depth`; the catch entry point is `0` when
//!   the statement has no catch clause.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{
    self, AssignOp, BinaryOp, CallArgs, DeclSpec, Expr, ExprKind, File, FuncLit, Literal,
    StdioKind, Stmt, StmtKind,
};
use crate::bytecode::{
    self, CompiledFunction, Opcode, Program, call_flags,
};
use crate::error::{CompileError, Error, Result};
use crate::modules::{ModuleEntry, ModuleMap};
use crate::span::{SourceFile, Span};
use crate::symbol::{Symbol, SymbolScope, SymbolTable};
use crate::value::{Value, WriterHandle};

/// Compilation options; the host embedding surface hands these to
/// [`Compiler::compile`].
pub struct CompilerOptions {
    /// AST-level constant folding.
    pub optimize_const: bool,
    /// Instruction-level partial evaluation of sub-expressions.
    pub optimize_expr: bool,
    /// Upper bound on optimizer passes over the file.
    pub max_optimizer_cycles: usize,
    /// Disassembly and optimizer pass log sink.
    pub trace: Option<WriterHandle>,
    /// Importable modules.
    pub module_map: ModuleMap,
    /// Continue compiling against an existing scope chain (REPL).
    pub symbol_table: Option<SymbolTable>,
    /// Seed the constant pool (REPL continuity).
    pub initial_constants: Vec<Value>,
    /// Source file for positions; anonymous when the AST was built in
    /// Rust.
    pub file: Option<Arc<SourceFile>>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimize_const: true,
            optimize_expr: true,
            max_optimizer_cycles: crate::optimizer::DEFAULT_MAX_CYCLES,
            trace: None,
            module_map: ModuleMap::default(),
            symbol_table: None,
            initial_constants: Vec::new(),
            file: None,
        }
    }
}

/// One instruction buffer: the main body, a function literal, or a module
/// body being compiled.
#[derive(Default)]
struct Scope {
    name: String,
    instructions: Vec<u8>,
    source_map: Vec<(u32, Span)>,
    loops: Vec<LoopContext>,
    /// Static nesting depth of protected regions at the current point.
    try_depth: usize,
    last_op: Option<Opcode>,
}

struct LoopContext {
    /// Placeholder jumps to patch to the loop's post/condition position.
    continue_jumps: Vec<usize>,
    /// Placeholder jumps to patch past the loop end.
    break_jumps: Vec<usize>,
    /// A for-in loop keeps its iterator on the stack; `break` pops it.
    is_for_in: bool,
    /// Protected-region depth at loop entry; breaks from deeper levels are
    /// rejected (a finally block may not be skipped).
    try_depth: usize,
}

pub struct Compiler {
    scopes: Vec<Scope>,
    symbols: SymbolTable,
    constants: Vec<Value>,
    file: Arc<SourceFile>,
    module_map: ModuleMap,
    modules: Vec<Arc<CompiledFunction>>,
    module_names: Vec<String>,
    module_indices: HashMap<String, u16>,
    /// Value of `iota` inside the current `const (…)` group.
    iota: Option<i64>,
    trace: Option<WriterHandle>,
}

impl Compiler {
    /// Compile a file into a [`Program`], running the optimizer first when
    /// enabled.
    pub fn compile(file: &File, opts: CompilerOptions) -> Result<Program> {
        if opts.optimize_const || opts.optimize_expr {
            let mut optimized = file.clone();
            let source = opts.file.clone().unwrap_or_else(SourceFile::anonymous);
            let session_shadowed = opts
                .symbol_table
                .as_ref()
                .map(|t| t.shadowed_names())
                .unwrap_or_default();
            crate::optimizer::Optimizer::new(
                opts.optimize_const,
                opts.optimize_expr,
                opts.max_optimizer_cycles,
                source,
                opts.trace.clone(),
            )
            .with_shadowed(session_shadowed)
            .optimize(&mut optimized)?;
            let opts = CompilerOptions {
                optimize_const: false,
                optimize_expr: false,
                ..opts
            };
            return Self::compile(&optimized, opts);
        }

        let source = opts.file.unwrap_or_else(SourceFile::anonymous);
        let mut compiler = Compiler {
            scopes: vec![Scope {
                name: "(main)".to_string(),
                ..Scope::default()
            }],
            symbols: opts.symbol_table.unwrap_or_else(SymbolTable::global),
            constants: opts.initial_constants,
            file: source.clone(),
            module_map: opts.module_map,
            modules: Vec::new(),
            module_names: Vec::new(),
            module_indices: HashMap::new(),
            iota: None,
            trace: opts.trace,
        };

        for stmt in &file.stmts {
            compiler.compile_stmt(stmt).map_err(Error::Compile)?;
        }
        if compiler.scope().last_op != Some(Opcode::Return) {
            compiler.emit(Opcode::Return, &[0], Span::default());
        }

        let scope = compiler.scopes.pop().expect("main scope");
        let main = Arc::new(CompiledFunction {
            name: scope.name,
            instructions: scope.instructions,
            num_locals: compiler.symbols.num_definitions(),
            source_map: scope.source_map,
            file: source.clone(),
            ..CompiledFunction::default()
        });

        if let Some(trace) = &compiler.trace {
            let _ = trace.write_all(
                format!(
                    "-- {} --\n{}",
                    main.name,
                    bytecode::disassemble(&main.instructions)
                )
                .as_bytes(),
            );
        }

        Ok(Program {
            main,
            constants: compiler.constants,
            modules: compiler.modules,
            module_names: compiler.module_names,
            file: source,
        })
    }

    /// Compile a lone expression as `return <expr>` against a throwaway
    /// symbol table; used by the optimizer's partial evaluation.
    pub(crate) fn compile_for_eval(
        expr: &Expr,
        shadowed: std::collections::HashSet<String>,
        file: Arc<SourceFile>,
    ) -> Result<Program> {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            symbol_table: Some(SymbolTable::throwaway(shadowed)),
            file: Some(file),
            ..CompilerOptions::default()
        };
        let file_ast = File::new(vec![Stmt::new(
            StmtKind::Return(vec![expr.clone()]),
            expr.span,
        )]);
        Self::compile(&file_ast, opts)
    }

    // -----------------------------------------------------------------------
    // Emit helpers
    // -----------------------------------------------------------------------

    fn scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("compiler scope")
    }

    fn emit(&mut self, op: Opcode, operands: &[usize], span: Span) -> usize {
        let scope = self.scope();
        let pos = bytecode::emit(&mut scope.instructions, op, operands);
        scope.source_map.push((pos as u32, span));
        scope.last_op = Some(op);
        pos
    }

    fn current_pos(&mut self) -> usize {
        self.scope().instructions.len()
    }

    /// Patch the `idx`-th 2-byte operand of the instruction at `pos`.
    fn patch_operand(&mut self, pos: usize, idx: usize, value: usize) {
        let at = pos + idx * 2;
        bytecode::patch_u16(&mut self.scope().instructions, at, value as u16);
    }

    fn patch_jump_here(&mut self, pos: usize) {
        let target = self.current_pos();
        self.patch_operand(pos, 0, target);
    }

    /// Add a constant, deduplicating scalar literals. Functions are never
    /// deduplicated.
    fn add_const(&mut self, value: Value) -> usize {
        let dedup = matches!(
            value,
            Value::Int(_)
                | Value::Uint(_)
                | Value::Float(_)
                | Value::Char(_)
                | Value::Str(_)
                | Value::Bool(_)
        );
        if dedup {
            for (i, existing) in self.constants.iter().enumerate() {
                if same_literal(existing, &value) {
                    return i;
                }
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn str_const(&mut self, s: &str) -> usize {
        self.add_const(Value::str(s.to_string()))
    }

    fn err(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::new(message, span, self.file.clone())
    }

    fn enter_scope(&mut self, block: bool) {
        let outer = std::mem::take(&mut self.symbols);
        self.symbols = SymbolTable::enclosed(outer, block);
    }

    fn leave_scope(&mut self) -> SymbolTable {
        let table = std::mem::take(&mut self.symbols);
        let (left, parent) = table.split();
        self.symbols = parent.unwrap_or_default();
        left
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn compile_stmt(&mut self, stmt: &Stmt) -> std::result::Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Pop, &[], span);
            }
            StmtKind::Block(stmts) => {
                self.enter_scope(true);
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                self.leave_scope();
            }
            StmtKind::Var(specs) => {
                for spec in specs {
                    match &spec.value {
                        Some(expr) => self.compile_expr(expr)?,
                        None => {
                            self.emit(Opcode::Nil, &[], spec.span);
                        }
                    }
                    self.define_and_store(&spec.name, false, spec.span)?;
                }
            }
            StmtKind::Const(specs) => {
                self.compile_const_group(specs)?;
            }
            StmtKind::Global(names) => {
                for name in names {
                    self.symbols
                        .define_global_ref(name)
                        .map_err(|e| self.err(e.to_string(), span))?;
                }
            }
            StmtKind::Param { names, var_name } => {
                self.compile_param(names, var_name.as_deref(), span)?;
            }
            StmtKind::Assign { lhs, rhs, op } => {
                self.compile_assign(lhs, rhs, *op, span)?;
            }
            StmtKind::If { cond, body, else_stmt } => {
                self.compile_if(cond, body, else_stmt.as_deref(), span)?;
            }
            StmtKind::For { init, cond, post, body } => {
                self.compile_for(init.as_deref(), cond.as_ref(), post.as_deref(), body, span)?;
            }
            StmtKind::ForIn { key, value, iterable, body, else_body } => {
                self.compile_for_in(
                    key.as_deref(),
                    value,
                    iterable,
                    body,
                    else_body.as_deref(),
                    span,
                )?;
            }
            StmtKind::Break => {
                let depth = self.scope().try_depth;
                let loop_info = self
                    .scope()
                    .loops
                    .last()
                    .map(|ctx| (ctx.try_depth, ctx.is_for_in));
                let Some((loop_try_depth, is_for_in)) = loop_info else {
                    return Err(self.err("'break' outside loop", span));
                };
                if depth > loop_try_depth {
                    return Err(self.err("'break' may not cross a try/finally boundary", span));
                }
                if is_for_in {
                    self.emit(Opcode::Pop, &[], span);
                }
                let jump = self.emit(Opcode::Jump, &[0], span);
                self.scope()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .break_jumps
                    .push(jump);
            }
            StmtKind::Continue => {
                let depth = self.scope().try_depth;
                let loop_try_depth = self.scope().loops.last().map(|ctx| ctx.try_depth);
                let Some(loop_try_depth) = loop_try_depth else {
                    return Err(self.err("'continue' outside loop", span));
                };
                if depth > loop_try_depth {
                    return Err(self.err("'continue' may not cross a try/finally boundary", span));
                }
                let jump = self.emit(Opcode::Jump, &[0], span);
                self.scope()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .continue_jumps
                    .push(jump);
            }
            StmtKind::Return(exprs) => {
                match exprs.len() {
                    0 => {
                        self.emit(Opcode::Return, &[0], span);
                    }
                    1 => {
                        self.compile_expr(&exprs[0])?;
                        self.emit(Opcode::Return, &[1], span);
                    }
                    n => {
                        // A comma list returns an implicit array.
                        for expr in exprs {
                            self.compile_expr(expr)?;
                        }
                        self.emit(Opcode::Array, &[n], span);
                        self.emit(Opcode::Return, &[1], span);
                    }
                }
            }
            StmtKind::Throw(expr) => match expr {
                Some(expr) => {
                    self.compile_expr(expr)?;
                    self.emit(Opcode::Throw, &[1], span);
                }
                None => {
                    self.emit(Opcode::Throw, &[0], span);
                }
            },
            StmtKind::Try { body, catch, finally } => {
                self.compile_try(body, catch.as_ref(), finally.as_deref(), span)?;
            }
        }
        Ok(())
    }

    /// `const (…)` group. `iota` counts binding positions; a spec without a
    /// value reuses the previous expression under the new `iota`.
    fn compile_const_group(
        &mut self,
        specs: &[DeclSpec],
    ) -> std::result::Result<(), CompileError> {
        let mut last_expr: Option<&Expr> = None;
        for (i, spec) in specs.iter().enumerate() {
            self.iota = Some(i as i64);
            let expr = match &spec.value {
                Some(expr) => {
                    last_expr = Some(expr);
                    expr
                }
                None => last_expr.ok_or_else(|| {
                    self.err("const group entry has no value to repeat", spec.span)
                })?,
            };
            self.compile_expr(expr)?;
            self.define_and_store(&spec.name, true, spec.span)?;
        }
        self.iota = None;
        Ok(())
    }

    /// `param (a, b, *rest)` — bind script parameters from the run
    /// arguments via `OpArgs`.
    fn compile_param(
        &mut self,
        names: &[String],
        var_name: Option<&str>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        for (i, name) in names.iter().enumerate() {
            self.emit(Opcode::Args, &[], span);
            let idx = self.add_const(Value::Int(i as i64));
            self.emit(Opcode::Constant, &[idx], span);
            self.emit(Opcode::GetIndex, &[1], span);
            self.define_and_store(name, false, span)?;
        }
        if let Some(name) = var_name {
            self.emit(Opcode::Args, &[], span);
            let idx = self.add_const(Value::Int(names.len() as i64));
            self.emit(Opcode::Constant, &[idx], span);
            self.emit(Opcode::Nil, &[], span);
            self.emit(Opcode::SliceIndex, &[], span);
            self.define_and_store(name, false, span)?;
        }
        Ok(())
    }

    /// Define `name` in the current scope and store TOS into it.
    fn define_and_store(
        &mut self,
        name: &str,
        constant: bool,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        if name == "iota" {
            return Err(self.err("cannot assign to iota", span));
        }
        let symbol = if constant {
            self.symbols.define_const(name)
        } else {
            self.symbols.define(name)
        }
        .map_err(|e| self.err(e.to_string(), span))?;
        self.store_symbol(&symbol, true, span);
        Ok(())
    }

    fn store_symbol(&mut self, symbol: &Symbol, define: bool, span: Span) {
        match symbol.scope {
            SymbolScope::Global => {
                let idx = self.str_const(&symbol.name);
                self.emit(Opcode::SetGlobal, &[idx], span);
            }
            SymbolScope::Local => {
                let op = if define { Opcode::DefineLocal } else { Opcode::SetLocal };
                self.emit(op, &[symbol.index as usize], span);
            }
            SymbolScope::Free => {
                self.emit(Opcode::SetFree, &[symbol.index as usize], span);
            }
            SymbolScope::Builtin => unreachable!("builtins are never assignment targets"),
        }
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    fn compile_assign(
        &mut self,
        lhs: &[Expr],
        rhs: &Expr,
        op: AssignOp,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        if lhs.len() > 1 {
            return self.compile_destructuring(lhs, rhs, op, span);
        }
        let target = &lhs[0];

        match op {
            AssignOp::Define => {
                let ExprKind::Ident(name) = &target.kind else {
                    return Err(self.err("':=' target must be an identifier", target.span));
                };
                // Function literals bind their name before the body is
                // compiled so the body can call itself; the closing store
                // writes through the slot (or its promoted cell, when the
                // body captured it) instead of rebinding.
                if let ExprKind::Func(func) = &rhs.kind {
                    let name = name.clone();
                    if name == "iota" {
                        return Err(self.err("cannot assign to iota", span));
                    }
                    let symbol = self
                        .symbols
                        .define(&name)
                        .map_err(|e| self.err(e.to_string(), span))?;
                    self.compile_func_lit(func, Some(&name), rhs.span)?;
                    self.store_symbol(&symbol, false, span);
                    return Ok(());
                }
                self.compile_expr(rhs)?;
                self.define_and_store(name, false, span)?;
            }
            AssignOp::Assign => {
                self.compile_store(target, rhs, None, span)?;
            }
            AssignOp::Aug(binop) => {
                self.compile_store(target, rhs, Some(binop), span)?;
            }
        }
        Ok(())
    }

    /// Store `rhs` (combined with the loaded target under `aug`) into a
    /// target expression.
    fn compile_store(
        &mut self,
        target: &Expr,
        rhs: &Expr,
        aug: Option<BinaryOp>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if name == "iota" {
                    return Err(self.err("cannot assign to iota", span));
                }
                let symbol = self
                    .symbols
                    .resolve(name)
                    .ok_or_else(|| self.err(format!("unresolved reference {:?}", name), target.span))?;
                if symbol.constant {
                    return Err(self.err(format!("assignment to constant {:?}", name), span));
                }
                if symbol.scope == SymbolScope::Builtin {
                    return Err(self.err(format!("cannot assign to builtin {:?}", name), span));
                }
                if let Some(binop) = aug {
                    self.load_symbol(&symbol, target.span);
                    self.compile_expr(rhs)?;
                    self.emit_binary_op(binop, span);
                } else {
                    self.compile_expr(rhs)?;
                }
                self.store_symbol(&symbol, false, span);
            }
            ExprKind::Index { expr, index } => {
                self.compile_expr(expr)?;
                self.compile_expr(index)?;
                if let Some(binop) = aug {
                    // Re-evaluate for the load; index targets of augmented
                    // assignment evaluate their operands twice.
                    self.compile_expr(target)?;
                    self.compile_expr(rhs)?;
                    self.emit_binary_op(binop, span);
                } else {
                    self.compile_expr(rhs)?;
                }
                self.emit(Opcode::SetIndex, &[], span);
            }
            ExprKind::Selector { expr, name } => {
                self.compile_expr(expr)?;
                let idx = self.str_const(name);
                self.emit(Opcode::Constant, &[idx], span);
                if let Some(binop) = aug {
                    self.compile_expr(target)?;
                    self.compile_expr(rhs)?;
                    self.emit_binary_op(binop, span);
                } else {
                    self.compile_expr(rhs)?;
                }
                self.emit(Opcode::SetIndex, &[], span);
            }
            _ => return Err(self.err("invalid assignment target", target.span)),
        }
        Ok(())
    }

    /// `a, b := rhs` — normalize through the private `:makeArray` builtin,
    /// hold the result in a hidden binding, then index each target
    /// left-to-right.
    fn compile_destructuring(
        &mut self,
        lhs: &[Expr],
        rhs: &Expr,
        op: AssignOp,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        if matches!(op, AssignOp::Aug(_)) {
            return Err(self.err("augmented assignment cannot destructure", span));
        }
        let n = lhs.len();

        let builtin = crate::builtins::index_of(":makeArray") as usize;
        self.emit(Opcode::GetBuiltin, &[builtin], span);
        let n_idx = self.add_const(Value::Int(n as i64));
        self.emit(Opcode::Constant, &[n_idx], span);
        self.compile_expr(rhs)?;
        self.emit(Opcode::Call, &[2, 0], span);

        // Hidden binding holding the normalized array. The colon prefix
        // cannot collide with user identifiers.
        let hidden = format!(":destr{}", self.current_pos());
        let hidden_sym = self
            .symbols
            .define(&hidden)
            .map_err(|e| self.err(e.to_string(), span))?;
        self.store_symbol(&hidden_sym, true, span);

        for (i, target) in lhs.iter().enumerate() {
            let load_element = |c: &mut Self| {
                let sym = c.symbols.resolve(&hidden).expect("hidden binding");
                c.load_symbol(&sym, span);
                let idx = c.add_const(Value::Int(i as i64));
                c.emit(Opcode::Constant, &[idx], span);
                c.emit(Opcode::GetIndex, &[1], span);
            };
            match (&target.kind, op) {
                (ExprKind::Ident(name), AssignOp::Define) => {
                    load_element(self);
                    self.define_and_store(name, false, span)?;
                }
                (ExprKind::Ident(name), _) => {
                    let symbol = self.symbols.resolve(name).ok_or_else(|| {
                        self.err(format!("unresolved reference {:?}", name), target.span)
                    })?;
                    if symbol.constant {
                        return Err(self.err(format!("assignment to constant {:?}", name), span));
                    }
                    load_element(self);
                    self.store_symbol(&symbol, false, span);
                }
                (ExprKind::Index { expr, index }, _) => {
                    self.compile_expr(expr)?;
                    self.compile_expr(index)?;
                    load_element(self);
                    self.emit(Opcode::SetIndex, &[], span);
                }
                _ => return Err(self.err("invalid destructuring target", target.span)),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    fn compile_if(
        &mut self,
        cond: &Expr,
        body: &[Stmt],
        else_stmt: Option<&Stmt>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        self.compile_expr(cond)?;
        let else_jump = self.emit(Opcode::JumpFalsy, &[0], span);

        self.enter_scope(true);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.leave_scope();

        match else_stmt {
            Some(else_stmt) => {
                let end_jump = self.emit(Opcode::Jump, &[0], span);
                self.patch_jump_here(else_jump);
                self.compile_stmt(else_stmt)?;
                self.patch_jump_here(end_jump);
            }
            None => {
                self.patch_jump_here(else_jump);
            }
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &[Stmt],
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        self.enter_scope(true);
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let cond_pos = self.current_pos();
        let exit_jump = match cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(Opcode::JumpFalsy, &[0], span))
            }
            None => None,
        };

        let try_depth = self.scope().try_depth;
        self.scope().loops.push(LoopContext {
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
            is_for_in: false,
            try_depth,
        });

        for s in body {
            self.compile_stmt(s)?;
        }

        let post_pos = self.current_pos();
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.emit(Opcode::Jump, &[cond_pos], span);

        let end = self.current_pos();
        if let Some(jump) = exit_jump {
            self.patch_operand(jump, 0, end);
        }
        let ctx = self.scope().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_operand(jump, 0, end);
        }
        for jump in ctx.continue_jumps {
            self.patch_operand(jump, 0, post_pos);
        }
        self.leave_scope();
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        key: Option<&str>,
        value: &str,
        iterable: &Expr,
        body: &[Stmt],
        else_body: Option<&[Stmt]>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        self.compile_expr(iterable)?;
        self.emit(Opcode::IterInit, &[], span);

        let loop_start = self.current_pos();
        let next = self.emit(Opcode::IterNextElse, &[0, 0], span);

        // Body entry.
        let body_pos = self.current_pos();
        self.patch_operand(next, 0, body_pos);

        self.enter_scope(true);
        let try_depth = self.scope().try_depth;
        self.scope().loops.push(LoopContext {
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
            is_for_in: true,
            try_depth,
        });

        if let Some(key) = key {
            self.emit(Opcode::IterKey, &[], span);
            self.define_and_store(key, false, span)?;
        }
        self.emit(Opcode::IterValue, &[], span);
        self.define_and_store(value, false, span)?;

        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit(Opcode::Jump, &[loop_start], span);

        let ctx = self.scope().loops.pop().expect("loop context");
        self.leave_scope();

        // Exhaustion path: the machine has popped the iterator; run the
        // else clause when present. Breaks jump past it.
        let else_pos = self.current_pos();
        self.patch_operand(next, 1, else_pos);
        if let Some(else_body) = else_body {
            self.enter_scope(true);
            for s in else_body {
                self.compile_stmt(s)?;
            }
            self.leave_scope();
        }

        let end = self.current_pos();
        for jump in ctx.break_jumps {
            self.patch_operand(jump, 0, end);
        }
        for jump in ctx.continue_jumps {
            self.patch_operand(jump, 0, loop_start);
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        catch: Option<&ast::CatchClause>,
        finally: Option<&[Stmt]>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        let depth = self.scope().try_depth;
        let setup = self.emit(Opcode::SetupTry, &[0, 0], span);
        self.scope().try_depth += 1;

        self.enter_scope(true);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.leave_scope();
        let body_done = self.emit(Opcode::Jump, &[0], span);

        // Catch entry; 0 means "no catch" to the machine.
        if let Some(catch) = catch {
            let catch_pos = self.current_pos();
            self.patch_operand(setup, 0, catch_pos);
            self.emit(Opcode::SetupCatch, &[], span);
            self.enter_scope(true);
            match &catch.name {
                Some(name) => self.define_and_store(name, false, span)?,
                None => {
                    self.emit(Opcode::Pop, &[], span);
                }
            }
            for s in &catch.body {
                self.compile_stmt(s)?;
            }
            self.leave_scope();
        }

        // Finally entry: always present, possibly empty, so every exit path
        // funnels through one Finalizer.
        let finally_pos = self.current_pos();
        self.patch_operand(setup, 1, finally_pos);
        self.patch_jump_here(body_done);
        self.emit(Opcode::SetupFinally, &[], span);
        if let Some(finally) = finally {
            self.enter_scope(true);
            for s in finally {
                self.compile_stmt(s)?;
            }
            self.leave_scope();
        }
        self.emit(Opcode::Finalizer, &[depth], span);
        self.scope().try_depth -= 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> std::result::Result<(), CompileError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Lit(lit) => self.compile_literal(lit, span),
            ExprKind::Ident(name) => self.compile_ident(name, span)?,
            ExprKind::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Opcode::Array, &[items.len()], span);
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    let idx = self.str_const(key);
                    self.emit(Opcode::Constant, &[idx], span);
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Dict, &[pairs.len()], span);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_binary(*op, lhs, rhs, span)?;
            }
            ExprKind::Unary { op, expr } => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Unary, &[bytecode::unop_to_byte(*op) as usize], span);
            }
            ExprKind::Cond { cond, then, alt } => {
                self.compile_expr(cond)?;
                let else_jump = self.emit(Opcode::JumpFalsy, &[0], span);
                self.compile_expr(then)?;
                let end_jump = self.emit(Opcode::Jump, &[0], span);
                self.patch_jump_here(else_jump);
                self.compile_expr(alt)?;
                self.patch_jump_here(end_jump);
            }
            ExprKind::Index { .. } | ExprKind::Selector { .. } => {
                self.compile_index_chain(expr)?;
            }
            ExprKind::Slice { expr, low, high } => {
                self.compile_expr(expr)?;
                match low {
                    Some(low) => self.compile_expr(low)?,
                    None => {
                        self.emit(Opcode::Nil, &[], span);
                    }
                }
                match high {
                    Some(high) => self.compile_expr(high)?,
                    None => {
                        self.emit(Opcode::Nil, &[], span);
                    }
                }
                self.emit(Opcode::SliceIndex, &[], span);
            }
            ExprKind::Call { callee, args } => {
                self.compile_call(callee, args, span)?;
            }
            ExprKind::Func(func) => {
                self.compile_func_lit(func, None, span)?;
            }
            ExprKind::Import(name) => {
                self.compile_import(name, span)?;
            }
            ExprKind::Stdio(kind) => {
                let op = match kind {
                    StdioKind::In => Opcode::StdIn,
                    StdioKind::Out => Opcode::StdOut,
                    StdioKind::Err => Opcode::StdErr,
                };
                self.emit(op, &[], span);
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, lit: &Literal, span: Span) {
        match lit {
            Literal::Nil => {
                self.emit(Opcode::Nil, &[], span);
            }
            Literal::Bool(true) => {
                self.emit(Opcode::True, &[], span);
            }
            Literal::Bool(false) => {
                self.emit(Opcode::False, &[], span);
            }
            Literal::Flag(true) => {
                self.emit(Opcode::Yes, &[], span);
            }
            Literal::Flag(false) => {
                self.emit(Opcode::No, &[], span);
            }
            Literal::Int(v) => {
                let idx = self.add_const(Value::Int(*v));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::Uint(v) => {
                let idx = self.add_const(Value::Uint(*v));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::Float(v) => {
                let idx = self.add_const(Value::Float(*v));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::Decimal(d) => {
                let idx = self.add_const(Value::Decimal(d.clone()));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::Char(c) => {
                let idx = self.add_const(Value::Char(*c));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::Str(s) => {
                let idx = self.add_const(Value::str(s.clone()));
                self.emit(Opcode::Constant, &[idx], span);
            }
            Literal::RawStr(s) => {
                let idx = self.add_const(Value::RawStr(s.clone().into()));
                self.emit(Opcode::Constant, &[idx], span);
            }
        }
    }

    fn compile_ident(&mut self, name: &str, span: Span) -> std::result::Result<(), CompileError> {
        // Reserved pseudo-identifiers first.
        match name {
            "iota" => {
                let Some(value) = self.iota else {
                    return Err(self.err("iota outside const group", span));
                };
                let idx = self.add_const(Value::Int(value));
                self.emit(Opcode::Constant, &[idx], span);
                return Ok(());
            }
            "__callee__" => {
                self.emit(Opcode::Callee, &[], span);
                return Ok(());
            }
            "__args__" => {
                self.emit(Opcode::Args, &[], span);
                return Ok(());
            }
            "__named_args__" => {
                self.emit(Opcode::NamedArgs, &[], span);
                return Ok(());
            }
            "__name__" => {
                self.emit(Opcode::DotName, &[], span);
                return Ok(());
            }
            "__file__" => {
                self.emit(Opcode::DotFile, &[], span);
                return Ok(());
            }
            "__is_module__" => {
                self.emit(Opcode::IsModule, &[], span);
                return Ok(());
            }
            _ => {}
        }
        let symbol = self
            .symbols
            .resolve(name)
            .ok_or_else(|| self.err(format!("unresolved reference {:?}", name), span))?;
        self.load_symbol(&symbol, span);
        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol, span: Span) {
        match symbol.scope {
            SymbolScope::Global => {
                let idx = self.str_const(&symbol.name);
                self.emit(Opcode::GetGlobal, &[idx], span);
            }
            SymbolScope::Local => {
                self.emit(Opcode::GetLocal, &[symbol.index as usize], span);
            }
            SymbolScope::Free => {
                self.emit(Opcode::GetFree, &[symbol.index as usize], span);
            }
            SymbolScope::Builtin => {
                self.emit(Opcode::GetBuiltin, &[symbol.index as usize], span);
            }
        }
    }

    fn emit_binary_op(&mut self, op: BinaryOp, span: Span) {
        match op {
            BinaryOp::Equal => {
                self.emit(Opcode::Equal, &[], span);
            }
            BinaryOp::NotEqual => {
                self.emit(Opcode::NotEqual, &[], span);
            }
            _ => {
                let byte = bytecode::binop_to_byte(op).expect("vm-level operator");
                self.emit(Opcode::BinaryOp, &[byte as usize], span);
            }
        }
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        match op {
            // Short-circuit forms leave the decisive operand on the stack.
            BinaryOp::LAnd => {
                self.compile_expr(lhs)?;
                let jump = self.emit(Opcode::AndJump, &[0], span);
                self.compile_expr(rhs)?;
                self.patch_jump_here(jump);
            }
            BinaryOp::LOr => {
                self.compile_expr(lhs)?;
                let jump = self.emit(Opcode::OrJump, &[0], span);
                self.compile_expr(rhs)?;
                self.patch_jump_here(jump);
            }
            BinaryOp::NilCoalesce => {
                self.compile_expr(lhs)?;
                let jump = self.emit(Opcode::JumpNotNil, &[0], span);
                self.compile_expr(rhs)?;
                self.patch_jump_here(jump);
            }
            // Nil comparisons have dedicated opcodes.
            BinaryOp::Equal if is_nil_literal(rhs) => {
                self.compile_expr(lhs)?;
                self.emit(Opcode::IsNil, &[], span);
            }
            BinaryOp::NotEqual if is_nil_literal(rhs) => {
                self.compile_expr(lhs)?;
                self.emit(Opcode::NotIsNil, &[], span);
            }
            _ => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.emit_binary_op(op, span);
            }
        }
        Ok(())
    }

    /// Collapse a chain of index/selector accesses into one `GetIndex n`.
    fn compile_index_chain(&mut self, expr: &Expr) -> std::result::Result<(), CompileError> {
        let mut chain = Vec::new();
        let mut base = expr;
        loop {
            match &base.kind {
                ExprKind::Index { expr, index } => {
                    chain.push(IndexStep::Expr(index));
                    base = expr;
                }
                ExprKind::Selector { expr, name } => {
                    chain.push(IndexStep::Name(name, base.span));
                    base = expr;
                }
                _ => break,
            }
        }
        self.compile_expr(base)?;
        chain.reverse();
        let count = chain.len();
        for step in chain {
            match step {
                IndexStep::Expr(index) => self.compile_expr(index)?,
                IndexStep::Name(name, span) => {
                    let idx = self.str_const(name);
                    self.emit(Opcode::Constant, &[idx], span);
                }
            }
        }
        self.emit(Opcode::GetIndex, &[count], expr.span);
        Ok(())
    }

    fn compile_call(
        &mut self,
        callee: &Expr,
        args: &CallArgs,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        // `receiver.name(args)` dispatches through the receiver.
        let named_call = match &callee.kind {
            ExprKind::Selector { expr, name } => Some((expr.as_ref(), name.as_str())),
            _ => None,
        };

        match named_call {
            Some((receiver, name)) => {
                self.compile_expr(receiver)?;
                let idx = self.str_const(name);
                self.emit(Opcode::Constant, &[idx], span);
            }
            None => self.compile_expr(callee)?,
        }

        let mut flags = 0usize;
        for arg in &args.args {
            self.compile_expr(arg)?;
        }
        if let Some(var_arg) = &args.var_arg {
            self.compile_expr(var_arg)?;
            flags |= call_flags::VAR_ARGS as usize;
        }
        if !args.named.is_empty() || args.var_named.is_some() {
            for named in &args.named {
                let idx = self.str_const(&named.name);
                self.emit(Opcode::Constant, &[idx], span);
                match &named.value {
                    Some(value) => {
                        self.compile_expr(value)?;
                        self.emit(Opcode::KeyValue, &[1], span);
                    }
                    // A bare name means `name=yes`.
                    None => {
                        self.emit(Opcode::KeyValue, &[0], span);
                    }
                }
            }
            self.emit(Opcode::KeyValueArray, &[args.named.len()], span);
            flags |= call_flags::NAMED_ARGS as usize;
            if let Some(var_named) = &args.var_named {
                self.compile_expr(var_named)?;
                flags |= call_flags::VAR_NAMED_ARGS as usize;
            }
        }

        let op = if named_call.is_some() { Opcode::CallName } else { Opcode::Call };
        self.emit(op, &[args.args.len(), flags], span);
        Ok(())
    }

    /// Compile a function literal body into a fresh `CompiledFunction`,
    /// then emit the capture sequence and `OpClosure`.
    fn compile_func_lit(
        &mut self,
        func: &FuncLit,
        name: Option<&str>,
        span: Span,
    ) -> std::result::Result<(), CompileError> {
        let params = &func.params;

        // Default thunks are isolated zero-argument functions; they may
        // reference globals and builtins only.
        let mut defaults = Vec::with_capacity(params.named.len());
        for (_, default) in &params.named {
            match default {
                Some(expr) => {
                    let thunk = self.compile_default_thunk(expr)?;
                    defaults.push(Some(thunk));
                }
                None => defaults.push(None),
            }
        }

        self.enter_scope(false);
        self.scopes.push(Scope {
            name: name.unwrap_or("(func)").to_string(),
            ..Scope::default()
        });

        for p in &params.args {
            self.symbols.define(p).map_err(|e| self.err(e.to_string(), span))?;
        }
        if let Some(rest) = &params.var_arg {
            self.symbols.define(rest).map_err(|e| self.err(e.to_string(), span))?;
        }
        for (p, _) in &params.named {
            self.symbols.define(p).map_err(|e| self.err(e.to_string(), span))?;
        }
        if let Some(rest) = &params.var_named {
            self.symbols.define(rest).map_err(|e| self.err(e.to_string(), span))?;
        }

        for s in &func.body {
            self.compile_stmt(s)?;
        }
        if self.scope().last_op != Some(Opcode::Return) {
            self.emit(Opcode::Return, &[0], span);
        }

        let scope = self.scopes.pop().expect("function scope");
        let table = self.leave_scope();
        let free_symbols = table.free_symbols.clone();

        let compiled = Arc::new(CompiledFunction {
            name: scope.name,
            instructions: scope.instructions,
            num_params: params.args.len() as u16,
            variadic: params.var_arg.is_some(),
            named_params: params.named.iter().map(|(n, _)| n.clone()).collect(),
            var_named: params.var_named.is_some(),
            defaults,
            num_locals: table.num_definitions(),
            num_free: free_symbols.len() as u16,
            source_map: scope.source_map,
            file: self.file.clone(),
        });

        if let Some(trace) = &self.trace {
            let _ = trace.write_all(
                format!(
                    "-- {} --\n{}",
                    compiled.name,
                    bytecode::disassemble(&compiled.instructions)
                )
                .as_bytes(),
            );
        }

        let const_idx = {
            self.constants.push(Value::Compiled(compiled));
            self.constants.len() - 1
        };

        for free in &free_symbols {
            match free.scope {
                SymbolScope::Local => {
                    self.emit(Opcode::GetLocalPtr, &[free.index as usize], span);
                }
                SymbolScope::Free => {
                    self.emit(Opcode::GetFreePtr, &[free.index as usize], span);
                }
                _ => unreachable!("captures are locals or frees"),
            }
        }
        self.emit(Opcode::Closure, &[const_idx, free_symbols.len()], span);
        Ok(())
    }

    fn compile_default_thunk(
        &mut self,
        expr: &Expr,
    ) -> std::result::Result<Arc<CompiledFunction>, CompileError> {
        self.enter_scope(false);
        self.scopes.push(Scope {
            name: "(default)".to_string(),
            ..Scope::default()
        });
        self.compile_expr(expr)?;
        self.emit(Opcode::Return, &[1], expr.span);
        let scope = self.scopes.pop().expect("default scope");
        let table = self.leave_scope();
        if !table.free_symbols.is_empty() {
            return Err(self.err(
                "parameter default may not capture enclosing locals",
                expr.span,
            ));
        }
        Ok(Arc::new(CompiledFunction {
            name: scope.name,
            instructions: scope.instructions,
            num_locals: table.num_definitions(),
            source_map: scope.source_map,
            file: self.file.clone(),
            ..CompiledFunction::default()
        }))
    }

    /// First import compiles and registers the module body; every import
    /// site emits the load/store pair that runs it once and caches the
    /// result.
    fn compile_import(&mut self, name: &str, span: Span) -> std::result::Result<(), CompileError> {
        if let Some(&module_idx) = self.module_indices.get(name) {
            let const_idx = self.module_const_index(module_idx);
            self.emit(Opcode::LoadModule, &[const_idx, module_idx as usize], span);
            self.emit(Opcode::StoreModule, &[module_idx as usize], span);
            return Ok(());
        }

        let entry = self
            .module_map
            .get(name)
            .ok_or_else(|| self.err(format!("module {:?} not found", name), span))?;

        match entry {
            ModuleEntry::Value(value) => {
                // Pre-built values need no execution or caching.
                let idx = {
                    self.constants.push(value.clone());
                    self.constants.len() - 1
                };
                self.emit(Opcode::Constant, &[idx], span);
                Ok(())
            }
            ModuleEntry::Compiled(compiled) => {
                let module_idx = self.register_module(name, compiled.clone());
                let const_idx = self.module_const_index(module_idx);
                self.emit(Opcode::LoadModule, &[const_idx, module_idx as usize], span);
                self.emit(Opcode::StoreModule, &[module_idx as usize], span);
                Ok(())
            }
            ModuleEntry::Ast(ast) => {
                let ast = ast.clone();
                let compiled = self.compile_module_body(name, &ast, span)?;
                let module_idx = self.register_module(name, compiled);
                let const_idx = self.module_const_index(module_idx);
                self.emit(Opcode::LoadModule, &[const_idx, module_idx as usize], span);
                self.emit(Opcode::StoreModule, &[module_idx as usize], span);
                Ok(())
            }
        }
    }

    fn compile_module_body(
        &mut self,
        name: &str,
        ast: &File,
        span: Span,
    ) -> std::result::Result<Arc<CompiledFunction>, CompileError> {
        // A module body is a zero-argument function with its own locals;
        // its return value is the module's export.
        self.enter_scope(false);
        self.scopes.push(Scope {
            name: name.to_string(),
            ..Scope::default()
        });
        for s in &ast.stmts {
            self.compile_stmt(s)?;
        }
        if self.scope().last_op != Some(Opcode::Return) {
            self.emit(Opcode::Return, &[0], span);
        }
        let scope = self.scopes.pop().expect("module scope");
        let table = self.leave_scope();
        if !table.free_symbols.is_empty() {
            return Err(self.err("module body may not capture enclosing locals", span));
        }
        Ok(Arc::new(CompiledFunction {
            name: scope.name,
            instructions: scope.instructions,
            num_locals: table.num_definitions(),
            source_map: scope.source_map,
            file: self.file.clone(),
            ..CompiledFunction::default()
        }))
    }

    fn register_module(&mut self, name: &str, compiled: Arc<CompiledFunction>) -> u16 {
        let module_idx = self.modules.len() as u16;
        self.modules.push(compiled);
        self.module_names.push(name.to_string());
        self.module_indices.insert(name.to_string(), module_idx);
        module_idx
    }

    /// The constant slot holding a registered module's compiled body.
    fn module_const_index(&mut self, module_idx: u16) -> usize {
        let compiled = self.modules[module_idx as usize].clone();
        for (i, existing) in self.constants.iter().enumerate() {
            if let Value::Compiled(f) = existing {
                if Arc::ptr_eq(f, &compiled) {
                    return i;
                }
            }
        }
        self.constants.push(Value::Compiled(compiled));
        self.constants.len() - 1
    }
}

enum IndexStep<'a> {
    Expr(&'a Expr),
    Name(&'a str, Span),
}

fn is_nil_literal(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::Lit(Literal::Nil))
}

/// Strict same-variant equality for constant deduplication: `1`, `1u`, and
/// `1.0` are distinct pool entries.
fn same_literal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Uint(x), Value::Uint(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    fn compile(stmts: Vec<Stmt>) -> Program {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            ..CompilerOptions::default()
        };
        Compiler::compile(&File::new(stmts), opts).unwrap()
    }

    #[test]
    fn test_binary_expr_lowering() {
        let program = compile(vec![Stmt::ret(vec![Expr::binary(
            BinaryOp::Add,
            Expr::int(1),
            Expr::binary(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
        )])]);
        let text = bytecode::disassemble(&program.main.instructions);
        assert!(text.contains("OpBinaryOp"), "{}", text);
        assert!(text.contains("OpReturn 1"), "{}", text);
        assert_eq!(program.constants[0], Value::Int(1));
    }

    #[test]
    fn test_constant_dedup_is_variant_strict() {
        let program = compile(vec![
            Stmt::expr(Expr::int(1)),
            Stmt::expr(Expr::int(1)),
            Stmt::expr(Expr::uint(1)),
        ]);
        let ints = program
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Int(1)))
            .count();
        let uints = program
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Uint(1)))
            .count();
        assert_eq!(ints, 1);
        assert_eq!(uints, 1);
    }

    #[test]
    fn test_redeclaration_is_rejected() {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            ..CompilerOptions::default()
        };
        let file = File::new(vec![
            Stmt::define("x", Expr::int(1)),
            Stmt::define("x", Expr::int(2)),
        ]);
        let err = Compiler::compile(&file, opts).unwrap_err();
        assert!(err.to_string().contains("already declared"), "{}", err);
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            ..CompilerOptions::default()
        };
        let file = File::new(vec![Stmt::expr(Expr::ident("missing"))]);
        let err = Compiler::compile(&file, opts).unwrap_err();
        assert!(err.to_string().contains("unresolved reference"), "{}", err);
    }

    #[test]
    fn test_assignment_to_const_rejected() {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            ..CompilerOptions::default()
        };
        let file = File::new(vec![
            Stmt::new(
                StmtKind::Const(vec![DeclSpec {
                    name: "k".to_string(),
                    value: Some(Expr::int(1)),
                    span: Span::default(),
                }]),
                Span::default(),
            ),
            Stmt::assign(Expr::ident("k"), Expr::int(2)),
        ]);
        let err = Compiler::compile(&file, opts).unwrap_err();
        assert!(err.to_string().contains("assignment to constant"), "{}", err);
    }

    #[test]
    fn test_iota_outside_const_group_fails() {
        let opts = CompilerOptions {
            optimize_const: false,
            optimize_expr: false,
            ..CompilerOptions::default()
        };
        let file = File::new(vec![Stmt::expr(Expr::ident("iota"))]);
        let err = Compiler::compile(&file, opts).unwrap_err();
        assert!(err.to_string().contains("iota outside const group"), "{}", err);
    }

    #[test]
    fn test_closure_emits_capture_sequence() {
        use crate::ast::FuncParams;
        // func(){ x := 1; return func(){ return x } }
        let inner = Expr::func(FuncParams::default(), vec![Stmt::ret(vec![Expr::ident("x")])]);
        let outer = Expr::func(
            FuncParams::default(),
            vec![Stmt::define("x", Expr::int(1)), Stmt::ret(vec![inner])],
        );
        let program = compile(vec![Stmt::expr(outer)]);
        let outer_fn = program
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Compiled(f) if f.name == "(func)" && f.num_locals == 1 => Some(f.clone()),
                _ => None,
            })
            .expect("outer function constant");
        let text = bytecode::disassemble(&outer_fn.instructions);
        assert!(text.contains("OpGetLocalPtr 0"), "{}", text);
        assert!(text.contains("OpClosure"), "{}", text);
    }
}
