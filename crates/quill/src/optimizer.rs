//! AST optimization: constant folding and partial evaluation.
//!
//! Two complementary strategies, both optional:
//!
//! 1. **Constant folding** rewrites pure binary/unary operations on
//!    literal operands, picks ternary branches with literal conditions,
//!    and eliminates dead `if` branches. Overflow wraps like the runtime;
//!    division by zero is reported, never folded.
//! 2. **Partial evaluation** compiles a candidate sub-expression against a
//!    throwaway symbol table and runs the machine over the bytecode — but
//!    only when every instruction is on the allow-list below and every
//!    referenced constant is a plain scalar. A successful run whose result
//!    is representable replaces the expression with a literal.
//!
//! The file is re-walked until a pass makes no replacement or the cycle
//! cap is reached. Shadowing is tracked up front: a sub-expression that
//! dereferences any name the user redeclared is refused, so a script-level
//! `len` never gets confused with the builtin. Evaluation failures mark
//! their expression depth in a bitset so sibling expressions at the same
//! depth do not retry in the same pass.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::{
    BinaryOp, Expr, ExprKind, File, Literal, Stmt, StmtKind, UnaryOp,
};
use crate::bytecode::Opcode;
use crate::error::{CompileError, Error, Result};
use crate::span::SourceFile;
use crate::value::{Value, WriterHandle};
use crate::vm::{Limits, RunOptions, Vm};

/// Default pass cap.
pub const DEFAULT_MAX_CYCLES: usize = (1 << 8) - 1;

/// Evaluation budget for one sub-expression.
const EVAL_INSTRUCTION_LIMIT: u64 = 1 << 14;

/// Optimization bails out once the error count passes this.
const MAX_ERRORS: usize = 2;

const DEPTH_LIMIT: usize = 256;

pub struct Optimizer {
    fold_const: bool,
    eval_expr: bool,
    max_cycles: usize,
    file: Arc<SourceFile>,
    trace: Option<WriterHandle>,
    /// Names the user declared anywhere; the evaluator refuses them.
    shadowed: HashSet<String>,
    errors: Vec<Error>,
    /// Replacements made in the current pass.
    replacements: usize,
    /// Bit per expression depth: a failed evaluation at depth `k` stops
    /// siblings at `k` from retrying this pass.
    failed_depths: Vec<bool>,
}

impl Optimizer {
    pub fn new(
        fold_const: bool,
        eval_expr: bool,
        max_cycles: usize,
        file: Arc<SourceFile>,
        trace: Option<WriterHandle>,
    ) -> Self {
        Self {
            fold_const,
            eval_expr,
            max_cycles,
            file,
            trace,
            shadowed: HashSet::new(),
            errors: Vec::new(),
            replacements: 0,
            failed_depths: vec![false; DEPTH_LIMIT],
        }
    }

    /// Seed shadow tracking with names the surrounding session already
    /// redeclared (host functions, globals from earlier runs).
    pub fn with_shadowed(mut self, names: HashSet<String>) -> Self {
        self.shadowed.extend(names);
        self
    }

    /// Optimize the file in place until a pass changes nothing.
    pub fn optimize(&mut self, file: &mut File) -> Result<()> {
        self.collect_shadowed(&file.stmts);

        for cycle in 0..self.max_cycles.max(1) {
            self.replacements = 0;
            self.failed_depths.iter_mut().for_each(|b| *b = false);

            for stmt in &mut file.stmts {
                self.opt_stmt(stmt, 0);
            }

            if let Some(trace) = &self.trace {
                let _ = trace.write_all(
                    format!(
                        "optimizer pass {}: {} replacement(s)\n",
                        cycle + 1,
                        self.replacements
                    )
                    .as_bytes(),
                );
            }
            if self.errors.len() > MAX_ERRORS || self.replacements == 0 {
                break;
            }
        }

        if !self.errors.is_empty() {
            let errors = std::mem::take(&mut self.errors);
            return Err(if errors.len() == 1 {
                errors.into_iter().next().expect("one error")
            } else {
                Error::Multiple(errors)
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shadow tracking
    // -----------------------------------------------------------------------

    fn collect_shadowed(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Var(specs) | StmtKind::Const(specs) => {
                    for spec in specs {
                        self.shadowed.insert(spec.name.clone());
                    }
                }
                StmtKind::Global(names) => {
                    self.shadowed.extend(names.iter().cloned());
                }
                StmtKind::Param { names, var_name } => {
                    self.shadowed.extend(names.iter().cloned());
                    if let Some(name) = var_name {
                        self.shadowed.insert(name.clone());
                    }
                }
                StmtKind::Assign { lhs, .. } => {
                    for target in lhs {
                        if let ExprKind::Ident(name) = &target.kind {
                            self.shadowed.insert(name.clone());
                        }
                    }
                }
                StmtKind::Block(stmts) => self.collect_shadowed(stmts),
                StmtKind::If { body, else_stmt, .. } => {
                    self.collect_shadowed(body);
                    if let Some(else_stmt) = else_stmt {
                        self.collect_shadowed(std::slice::from_ref(else_stmt));
                    }
                }
                StmtKind::For { init, post, body, .. } => {
                    if let Some(init) = init {
                        self.collect_shadowed(std::slice::from_ref(init));
                    }
                    if let Some(post) = post {
                        self.collect_shadowed(std::slice::from_ref(post));
                    }
                    self.collect_shadowed(body);
                }
                StmtKind::ForIn { key, value, body, else_body, .. } => {
                    if let Some(key) = key {
                        self.shadowed.insert(key.clone());
                    }
                    self.shadowed.insert(value.clone());
                    self.collect_shadowed(body);
                    if let Some(else_body) = else_body {
                        self.collect_shadowed(else_body);
                    }
                }
                StmtKind::Try { body, catch, finally } => {
                    self.collect_shadowed(body);
                    if let Some(catch) = catch {
                        if let Some(name) = &catch.name {
                            self.shadowed.insert(name.clone());
                        }
                        self.collect_shadowed(&catch.body);
                    }
                    if let Some(finally) = finally {
                        self.collect_shadowed(finally);
                    }
                }
                _ => {}
            }
            // Function parameters shadow too.
            stmt_exprs(stmt, &mut |expr| {
                if let ExprKind::Func(func) = &expr.kind {
                    self.shadowed.extend(func.params.args.iter().cloned());
                    if let Some(rest) = &func.params.var_arg {
                        self.shadowed.insert(rest.clone());
                    }
                    for (name, _) in &func.params.named {
                        self.shadowed.insert(name.clone());
                    }
                    if let Some(rest) = &func.params.var_named {
                        self.shadowed.insert(rest.clone());
                    }
                    self.collect_shadowed(&func.body);
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Statement walk
    // -----------------------------------------------------------------------

    fn opt_stmt(&mut self, stmt: &mut Stmt, depth: usize) {
        match &mut stmt.kind {
            StmtKind::Expr(expr) => self.opt_expr(expr, depth),
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.opt_stmt(s, depth);
                }
            }
            StmtKind::Var(specs) | StmtKind::Const(specs) => {
                for spec in specs {
                    if let Some(expr) = &mut spec.value {
                        self.opt_expr(expr, depth);
                    }
                }
            }
            StmtKind::Assign { rhs, lhs, .. } => {
                for target in lhs {
                    // Only the index parts of targets are expressions.
                    if let ExprKind::Index { index, .. } = &mut target.kind {
                        self.opt_expr(index, depth + 1);
                    }
                }
                self.opt_expr(rhs, depth);
            }
            StmtKind::If { cond, body, else_stmt } => {
                self.opt_expr(cond, depth);
                for s in body.iter_mut() {
                    self.opt_stmt(s, depth);
                }
                if let Some(else_stmt) = else_stmt {
                    self.opt_stmt(else_stmt, depth);
                }
                // A literal condition eliminates the dead branch.
                if self.fold_const {
                    if let ExprKind::Lit(lit) = &cond.kind {
                        let truthy = !literal_to_value(lit).is_falsy();
                        let replacement = if truthy {
                            Some(StmtKind::Block(std::mem::take(body)))
                        } else {
                            else_stmt
                                .take()
                                .map(|s| StmtKind::Block(vec![*s]))
                                .or(Some(StmtKind::Block(Vec::new())))
                        };
                        if let Some(kind) = replacement {
                            stmt.kind = kind;
                            self.replacements += 1;
                        }
                    }
                }
            }
            StmtKind::For { init, cond, post, body } => {
                if let Some(init) = init {
                    self.opt_stmt(init, depth);
                }
                if let Some(cond) = cond {
                    self.opt_expr(cond, depth);
                }
                if let Some(post) = post {
                    self.opt_stmt(post, depth);
                }
                for s in body {
                    self.opt_stmt(s, depth);
                }
            }
            StmtKind::ForIn { iterable, body, else_body, .. } => {
                self.opt_expr(iterable, depth);
                for s in body {
                    self.opt_stmt(s, depth);
                }
                if let Some(else_body) = else_body {
                    for s in else_body {
                        self.opt_stmt(s, depth);
                    }
                }
            }
            StmtKind::Return(exprs) => {
                for expr in exprs {
                    self.opt_expr(expr, depth);
                }
            }
            StmtKind::Throw(Some(expr)) => self.opt_expr(expr, depth),
            StmtKind::Try { body: _, catch, finally } => {
                // Try bodies exist to observe runtime errors; evaluating
                // or folding them ahead of time would turn those into
                // compile-time reports.
                if let Some(catch) = catch {
                    for s in &mut catch.body {
                        self.opt_stmt(s, depth);
                    }
                }
                if let Some(finally) = finally {
                    for s in finally {
                        self.opt_stmt(s, depth);
                    }
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Expression walk
    // -----------------------------------------------------------------------

    fn opt_expr(&mut self, expr: &mut Expr, depth: usize) {
        let depth = depth.min(DEPTH_LIMIT - 1);

        // Children first, so folds cascade upward within one pass.
        match &mut expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                self.opt_expr(lhs, depth + 1);
                self.opt_expr(rhs, depth + 1);
            }
            ExprKind::Unary { expr: inner, .. } => self.opt_expr(inner, depth + 1),
            ExprKind::Cond { cond, then, alt } => {
                self.opt_expr(cond, depth + 1);
                self.opt_expr(then, depth + 1);
                self.opt_expr(alt, depth + 1);
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.opt_expr(item, depth + 1);
                }
            }
            ExprKind::Dict(pairs) => {
                for (_, value) in pairs {
                    self.opt_expr(value, depth + 1);
                }
            }
            ExprKind::Index { expr: inner, index } => {
                self.opt_expr(inner, depth + 1);
                self.opt_expr(index, depth + 1);
            }
            ExprKind::Selector { expr: inner, .. } => self.opt_expr(inner, depth + 1),
            ExprKind::Slice { expr: inner, low, high } => {
                self.opt_expr(inner, depth + 1);
                if let Some(low) = low {
                    self.opt_expr(low, depth + 1);
                }
                if let Some(high) = high {
                    self.opt_expr(high, depth + 1);
                }
            }
            ExprKind::Call { callee, args } => {
                self.opt_expr(callee, depth + 1);
                for arg in &mut args.args {
                    self.opt_expr(arg, depth + 1);
                }
                if let Some(var_arg) = &mut args.var_arg {
                    self.opt_expr(var_arg, depth + 1);
                }
                for named in &mut args.named {
                    if let Some(value) = &mut named.value {
                        self.opt_expr(value, depth + 1);
                    }
                }
                if let Some(var_named) = &mut args.var_named {
                    self.opt_expr(var_named, depth + 1);
                }
            }
            ExprKind::Func(func) => {
                for s in &mut func.body {
                    self.opt_stmt(s, depth + 1);
                }
            }
            _ => {}
        }

        if self.fold_const && self.try_fold(expr) {
            self.replacements += 1;
            return;
        }
        if self.eval_expr {
            self.try_eval(expr, depth);
        }
    }

    /// AST-level folding of literal operands.
    fn try_fold(&mut self, expr: &mut Expr) -> bool {
        let span = expr.span;
        let folded: Option<Literal> = match &expr.kind {
            ExprKind::Binary { op, lhs, rhs } => {
                match (&lhs.kind, &rhs.kind) {
                    (ExprKind::Lit(a), ExprKind::Lit(b)) => match op {
                        // Short-circuit forms select an operand.
                        BinaryOp::LAnd => Some(if literal_to_value(a).is_falsy() {
                            a.clone()
                        } else {
                            b.clone()
                        }),
                        BinaryOp::LOr => Some(if literal_to_value(a).is_falsy() {
                            b.clone()
                        } else {
                            a.clone()
                        }),
                        BinaryOp::NilCoalesce => Some(if matches!(a, Literal::Nil) {
                            b.clone()
                        } else {
                            a.clone()
                        }),
                        _ => {
                            let va = literal_to_value(a);
                            let vb = literal_to_value(b);
                            match crate::operators::binary_op(*op, &va, &vb) {
                                Ok(result) => value_to_literal(&result),
                                Err(err) => {
                                    // Reported, not folded.
                                    self.report(err.to_string(), span);
                                    None
                                }
                            }
                        }
                    },
                    _ => None,
                }
            }
            ExprKind::Unary { op, expr: inner } => match &inner.kind {
                ExprKind::Lit(lit) => {
                    let v = literal_to_value(lit);
                    match crate::operators::unary_op(*op, &v) {
                        Ok(result) => value_to_literal(&result),
                        Err(_) if *op == UnaryOp::Not => Some(Literal::Bool(v.is_falsy())),
                        Err(err) => {
                            self.report(err.to_string(), span);
                            None
                        }
                    }
                }
                _ => None,
            },
            ExprKind::Cond { cond, then, alt } => match &cond.kind {
                ExprKind::Lit(lit) => {
                    let branch = if literal_to_value(lit).is_falsy() { alt } else { then };
                    // Branch selection replaces the whole expression, not
                    // necessarily with a literal.
                    let replacement = (**branch).clone();
                    *expr = replacement;
                    return true;
                }
                _ => None,
            },
            _ => None,
        };

        match folded {
            Some(lit) => {
                expr.kind = ExprKind::Lit(lit);
                expr.span = span;
                true
            }
            None => false,
        }
    }

    /// Instruction-level partial evaluation of one sub-expression.
    fn try_eval(&mut self, expr: &mut Expr, depth: usize) {
        // Only composite expressions are worth a machine round-trip.
        if !matches!(
            expr.kind,
            ExprKind::Call { .. } | ExprKind::Binary { .. } | ExprKind::Unary { .. }
        ) {
            return;
        }
        if self.failed_depths[depth] || self.errors.len() > MAX_ERRORS {
            return;
        }

        let program = match crate::compiler::Compiler::compile_for_eval(
            expr,
            self.shadowed.clone(),
            self.file.clone(),
        ) {
            Ok(program) => program,
            Err(_) => {
                self.failed_depths[depth] = true;
                return;
            }
        };

        if !eval_allowed(&program) {
            self.failed_depths[depth] = true;
            return;
        }

        let opts = RunOptions {
            limits: Limits {
                max_instructions: Some(EVAL_INSTRUCTION_LIMIT),
                max_recursion_depth: Some(64),
            },
            stdout: Some(WriterHandle::new(std::io::sink())),
            stderr: Some(WriterHandle::new(std::io::sink())),
            ..RunOptions::default()
        };
        match Vm::run(&program, opts) {
            Ok(result) => match value_to_literal(&result) {
                Some(lit) => {
                    expr.kind = ExprKind::Lit(lit);
                    self.replacements += 1;
                }
                None => {
                    self.failed_depths[depth] = true;
                }
            },
            Err(err) => {
                self.failed_depths[depth] = true;
                self.report(err.to_string(), expr.span);
            }
        }
    }

    fn report(&mut self, message: String, span: crate::span::Span) {
        if self.errors.len() <= MAX_ERRORS {
            self.errors.push(Error::Compile(CompileError::new(
                message,
                span,
                self.file.clone(),
            )));
        }
    }
}

/// The closed set of opcodes the evaluator may execute.
fn opcode_allowed(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        Constant
            | Nil
            | BinaryOp
            | Unary
            | NoOp
            | AndJump
            | OrJump
            | Array
            | Return
            | Equal
            | NotEqual
            | Pop
            | GetBuiltin
            | Call
            | SetLocal
            | DefineLocal
            | True
            | False
            | JumpNil
            | JumpNotNil
            | Callee
            | Args
            | NamedArgs
            | StdIn
            | StdOut
            | StdErr
            | TextWriter
    )
}

/// Check the whole program against the allow-list: every instruction
/// allowed, every referenced constant a plain scalar, every builtin pure.
fn eval_allowed(program: &crate::bytecode::Program) -> bool {
    let ins = &program.main.instructions;
    let mut pos = 0;
    while pos < ins.len() {
        let Some(op) = Opcode::from_byte(ins[pos]) else {
            return false;
        };
        if !opcode_allowed(op) {
            return false;
        }
        let (operands, read) = crate::bytecode::read_operands(op, ins, pos + 1);
        match op {
            Opcode::Constant => {
                let scalar = matches!(
                    program.constants.get(operands[0]),
                    Some(
                        Value::Bool(_)
                            | Value::Int(_)
                            | Value::Uint(_)
                            | Value::Float(_)
                            | Value::Char(_)
                            | Value::Str(_)
                            | Value::Nil
                    )
                );
                if !scalar {
                    return false;
                }
            }
            Opcode::GetBuiltin => {
                if !crate::builtins::is_pure(operands[0] as u16) {
                    return false;
                }
            }
            _ => {}
        }
        pos += 1 + read;
    }
    true
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Nil => Value::Nil,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Flag(b) => Value::Flag(*b),
        Literal::Int(v) => Value::Int(*v),
        Literal::Uint(v) => Value::Uint(*v),
        Literal::Float(v) => Value::Float(*v),
        Literal::Decimal(d) => Value::Decimal(d.clone()),
        Literal::Char(c) => Value::Char(*c),
        Literal::Str(s) => Value::str(s.clone()),
        Literal::RawStr(s) => Value::RawStr(s.clone().into()),
    }
}

fn value_to_literal(value: &Value) -> Option<Literal> {
    match value {
        Value::Nil => Some(Literal::Nil),
        Value::Bool(b) => Some(Literal::Bool(*b)),
        Value::Flag(b) => Some(Literal::Flag(*b)),
        Value::Int(v) => Some(Literal::Int(*v)),
        Value::Uint(v) => Some(Literal::Uint(*v)),
        Value::Float(v) => Some(Literal::Float(*v)),
        Value::Decimal(d) => Some(Literal::Decimal(d.clone())),
        Value::Char(c) => Some(Literal::Char(*c)),
        Value::Str(s) => Some(Literal::Str(s.to_string())),
        _ => None,
    }
}

/// Visit the expressions directly contained in a statement.
fn stmt_exprs(stmt: &Stmt, f: &mut impl FnMut(&Expr)) {
    fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
        f(expr);
        match &expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, f);
                walk_expr(rhs, f);
            }
            ExprKind::Unary { expr, .. } => walk_expr(expr, f),
            ExprKind::Cond { cond, then, alt } => {
                walk_expr(cond, f);
                walk_expr(then, f);
                walk_expr(alt, f);
            }
            ExprKind::Array(items) => items.iter().for_each(|e| walk_expr(e, f)),
            ExprKind::Dict(pairs) => pairs.iter().for_each(|(_, e)| walk_expr(e, f)),
            ExprKind::Index { expr, index } => {
                walk_expr(expr, f);
                walk_expr(index, f);
            }
            ExprKind::Selector { expr, .. } => walk_expr(expr, f),
            ExprKind::Slice { expr, low, high } => {
                walk_expr(expr, f);
                if let Some(low) = low {
                    walk_expr(low, f);
                }
                if let Some(high) = high {
                    walk_expr(high, f);
                }
            }
            ExprKind::Call { callee, args } => {
                walk_expr(callee, f);
                args.args.iter().for_each(|e| walk_expr(e, f));
                if let Some(e) = &args.var_arg {
                    walk_expr(e, f);
                }
                for named in &args.named {
                    if let Some(e) = &named.value {
                        walk_expr(e, f);
                    }
                }
                if let Some(e) = &args.var_named {
                    walk_expr(e, f);
                }
            }
            _ => {}
        }
    }

    match &stmt.kind {
        StmtKind::Expr(e) => walk_expr(e, f),
        StmtKind::Assign { lhs, rhs, .. } => {
            lhs.iter().for_each(|e| walk_expr(e, f));
            walk_expr(rhs, f);
        }
        StmtKind::Var(specs) | StmtKind::Const(specs) => {
            for spec in specs {
                if let Some(e) = &spec.value {
                    walk_expr(e, f);
                }
            }
        }
        StmtKind::If { cond, .. } => walk_expr(cond, f),
        StmtKind::For { cond, .. } => {
            if let Some(cond) = cond {
                walk_expr(cond, f);
            }
        }
        StmtKind::ForIn { iterable, .. } => walk_expr(iterable, f),
        StmtKind::Return(exprs) => exprs.iter().for_each(|e| walk_expr(e, f)),
        StmtKind::Throw(Some(e)) => walk_expr(e, f),
        _ => {}
    }
}
