//! Abstract syntax tree consumed by the compiler.
//!
//! Parsing is the job of a separate front-end crate; this module is the
//! contract between it and the compiler. Every node carries a [`Span`] into
//! the original source so compile errors and runtime traces can point at
//! real positions. The constructor helpers at the bottom build span-less
//! nodes and exist for embedders and tests that assemble programs
//! programmatically.

use crate::decimal::Decimal;

pub use crate::span::Span;

/// A parsed source file: the root of the AST.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub stmts: Vec<Stmt>,
}

impl File {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// An expression evaluated for its side effects; the result is popped.
    Expr(Expr),
    /// A `{ ... }` block introducing a new lexical scope.
    Block(Vec<Stmt>),
    /// `var x` / `var (x = 1, y)` declarations.
    Var(Vec<DeclSpec>),
    /// `const (...)` declarations. `iota` is live inside the group.
    Const(Vec<DeclSpec>),
    /// `global name` — binds a name to the host-provided globals map.
    Global(Vec<String>),
    /// `param (a, b, *rest)` — binds script parameters from the run options.
    Param {
        names: Vec<String>,
        /// Name of the variadic tail parameter, if any.
        var_name: Option<String>,
    },
    /// Assignment or definition. `lhs` holds one target, or several for
    /// destructuring (`x, y := expr`). The right side is always a single
    /// expression.
    Assign {
        lhs: Vec<Expr>,
        rhs: Expr,
        op: AssignOp,
    },
    If {
        cond: Expr,
        body: Vec<Stmt>,
        /// Either another `If` statement (else-if) or a `Block`.
        else_stmt: Option<Box<Stmt>>,
    },
    /// C-style loop; all three clauses optional.
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    /// `for k, v in iterable { ... } else { ... }`.
    ForIn {
        /// Loop variable bound to the key, if two variables were given.
        key: Option<String>,
        /// Loop variable bound to the value.
        value: String,
        iterable: Expr,
        body: Vec<Stmt>,
        /// Runs when the iterable produced no elements.
        else_body: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    /// `return` / `return e` / `return a, b` (comma list yields an array).
    Return(Vec<Expr>),
    /// `throw e`, or bare `throw` inside a catch body (re-raise).
    Throw(Option<Expr>),
    Try {
        body: Vec<Stmt>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
}

/// One `name` or `name = expr` inside a `var`/`const` group.
#[derive(Debug, Clone)]
pub struct DeclSpec {
    pub name: String,
    pub value: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    /// Binds the caught error; `None` discards it.
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

/// Assignment operators. `Define` is `:=`; the rest reuse [`BinaryOp`]
/// (e.g. `x += 1` is `Aug(BinaryOp::Add)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Define,
    Assign,
    Aug(BinaryOp),
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Lit(Literal),
    Ident(String),
    Array(Vec<Expr>),
    /// Dict literal; keys are strings in source order.
    Dict(Vec<(String, Expr)>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    /// Ternary `cond ? then : alt`.
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        alt: Box<Expr>,
    },
    /// `expr[index]`.
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    /// `expr.name` — sugar for string indexing; becomes a named call
    /// (`OpCallName`) when used as a callee.
    Selector {
        expr: Box<Expr>,
        name: String,
    },
    /// `expr[low:high]`.
    Slice {
        expr: Box<Expr>,
        low: Option<Box<Expr>>,
        high: Option<Box<Expr>>,
    },
    Call {
        callee: Box<Expr>,
        args: CallArgs,
    },
    Func(FuncLit),
    /// `import("name")`.
    Import(String),
    /// The `stdin` / `stdout` / `stderr` pseudo-values.
    Stdio(StdioKind),
}

/// Literal constants. The parser is expected to have folded sign and radix.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    Bool(bool),
    /// `yes` / `no` — the flag spelling of booleans.
    Flag(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Decimal(Decimal),
    Char(char),
    Str(String),
    /// A string literal that preserves its raw source spelling.
    RawStr(String),
}

/// Arguments at a call site.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Expr>,
    /// `f(*rest)` — an expression expanded into trailing positional args.
    pub var_arg: Option<Box<Expr>>,
    pub named: Vec<NamedArg>,
    /// `f(**extra)` — an expression merged into the named-argument set.
    pub var_named: Option<Box<Expr>>,
}

/// One `name=value` (or bare `name`, meaning `name=yes`) named argument.
#[derive(Debug, Clone)]
pub struct NamedArg {
    pub name: String,
    pub value: Option<Expr>,
}

/// A function literal.
#[derive(Debug, Clone)]
pub struct FuncLit {
    pub params: FuncParams,
    pub body: Vec<Stmt>,
}

/// Declared parameters of a function literal.
#[derive(Debug, Clone, Default)]
pub struct FuncParams {
    /// Positional parameter names, in order.
    pub args: Vec<String>,
    /// `*rest` — collects extra positional arguments into an array.
    pub var_arg: Option<String>,
    /// Named parameters with their optional default expressions.
    pub named: Vec<(String, Option<Expr>)>,
    /// `**extra` — collects unmatched named arguments.
    pub var_named: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioKind {
    In,
    Out,
    Err,
}

/// Binary operator tokens carried by `OpBinaryOp`.
///
/// `&&`, `||` and `??` never reach the VM as binary ops — the compiler
/// lowers them to short-circuit jumps — but they are listed here because the
/// optimizer folds them at the AST level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Equal,
    NotEqual,
    LAnd,
    LOr,
    NilCoalesce,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Less => "<",
            Self::Greater => ">",
            Self::LessEq => "<=",
            Self::GreaterEq => ">=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LAnd => "&&",
            Self::LOr => "||",
            Self::NilCoalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Pos => "+",
            Self::Not => "!",
            Self::BitNot => "^",
        }
    }
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------
//
// The parser produces spanned nodes directly; these helpers build span-less
// nodes for hosts and tests that assemble ASTs in Rust.

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    fn bare(kind: ExprKind) -> Self {
        Self { kind, span: Span::default() }
    }

    pub fn nil() -> Self {
        Self::bare(ExprKind::Lit(Literal::Nil))
    }

    pub fn bool(b: bool) -> Self {
        Self::bare(ExprKind::Lit(Literal::Bool(b)))
    }

    pub fn int(v: i64) -> Self {
        Self::bare(ExprKind::Lit(Literal::Int(v)))
    }

    pub fn uint(v: u64) -> Self {
        Self::bare(ExprKind::Lit(Literal::Uint(v)))
    }

    pub fn float(v: f64) -> Self {
        Self::bare(ExprKind::Lit(Literal::Float(v)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::bare(ExprKind::Lit(Literal::Str(s.into())))
    }

    pub fn char(c: char) -> Self {
        Self::bare(ExprKind::Lit(Literal::Char(c)))
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::bare(ExprKind::Ident(name.into()))
    }

    pub fn array(items: Vec<Expr>) -> Self {
        Self::bare(ExprKind::Array(items))
    }

    pub fn dict(pairs: Vec<(&str, Expr)>) -> Self {
        Self::bare(ExprKind::Dict(
            pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::bare(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        Self::bare(ExprKind::Unary { op, expr: Box::new(expr) })
    }

    pub fn cond(cond: Expr, then: Expr, alt: Expr) -> Self {
        Self::bare(ExprKind::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            alt: Box::new(alt),
        })
    }

    pub fn index(expr: Expr, index: Expr) -> Self {
        Self::bare(ExprKind::Index {
            expr: Box::new(expr),
            index: Box::new(index),
        })
    }

    pub fn selector(expr: Expr, name: impl Into<String>) -> Self {
        Self::bare(ExprKind::Selector {
            expr: Box::new(expr),
            name: name.into(),
        })
    }

    pub fn slice(expr: Expr, low: Option<Expr>, high: Option<Expr>) -> Self {
        Self::bare(ExprKind::Slice {
            expr: Box::new(expr),
            low: low.map(Box::new),
            high: high.map(Box::new),
        })
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Self::bare(ExprKind::Call {
            callee: Box::new(callee),
            args: CallArgs { args, ..CallArgs::default() },
        })
    }

    pub fn call_with(callee: Expr, args: CallArgs) -> Self {
        Self::bare(ExprKind::Call { callee: Box::new(callee), args })
    }

    pub fn func(params: FuncParams, body: Vec<Stmt>) -> Self {
        Self::bare(ExprKind::Func(FuncLit { params, body }))
    }

    pub fn import(name: impl Into<String>) -> Self {
        Self::bare(ExprKind::Import(name.into()))
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    fn bare(kind: StmtKind) -> Self {
        Self { kind, span: Span::default() }
    }

    pub fn expr(expr: Expr) -> Self {
        Self::bare(StmtKind::Expr(expr))
    }

    /// `name := value`.
    pub fn define(name: impl Into<String>, value: Expr) -> Self {
        Self::bare(StmtKind::Assign {
            lhs: vec![Expr::ident(name)],
            rhs: value,
            op: AssignOp::Define,
        })
    }

    /// `a, b := value` (destructuring definition).
    pub fn define_many(names: &[&str], value: Expr) -> Self {
        Self::bare(StmtKind::Assign {
            lhs: names.iter().map(|n| Expr::ident(*n)).collect(),
            rhs: value,
            op: AssignOp::Define,
        })
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::bare(StmtKind::Assign {
            lhs: vec![target],
            rhs: value,
            op: AssignOp::Assign,
        })
    }

    pub fn aug_assign(target: Expr, op: BinaryOp, value: Expr) -> Self {
        Self::bare(StmtKind::Assign {
            lhs: vec![target],
            rhs: value,
            op: AssignOp::Aug(op),
        })
    }

    pub fn ret(exprs: Vec<Expr>) -> Self {
        Self::bare(StmtKind::Return(exprs))
    }

    pub fn if_stmt(cond: Expr, body: Vec<Stmt>, else_stmt: Option<Stmt>) -> Self {
        Self::bare(StmtKind::If {
            cond,
            body,
            else_stmt: else_stmt.map(Box::new),
        })
    }

    pub fn for_in(
        key: Option<&str>,
        value: &str,
        iterable: Expr,
        body: Vec<Stmt>,
    ) -> Self {
        Self::bare(StmtKind::ForIn {
            key: key.map(str::to_string),
            value: value.to_string(),
            iterable,
            body,
            else_body: None,
        })
    }

    pub fn try_stmt(
        body: Vec<Stmt>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Stmt>>,
    ) -> Self {
        Self::bare(StmtKind::Try { body, catch, finally })
    }

    pub fn throw(expr: Expr) -> Self {
        Self::bare(StmtKind::Throw(Some(expr)))
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::bare(StmtKind::Block(stmts))
    }
}
