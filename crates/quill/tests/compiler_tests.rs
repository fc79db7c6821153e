use quill::ast::{BinaryOp, CatchClause, Expr, File, FuncParams, Stmt};
use quill::{Compiler, CompilerOptions, ModuleMap, Program, Value, disassemble};

fn compile(stmts: Vec<Stmt>) -> Program {
    let opts = CompilerOptions {
        optimize_const: false,
        optimize_expr: false,
        ..CompilerOptions::default()
    };
    Compiler::compile(&File::new(stmts), opts).unwrap()
}

fn main_disasm(program: &Program) -> String {
    disassemble(&program.main.instructions)
}

#[test]
fn test_globals_lower_to_named_access() {
    let program = compile(vec![
        Stmt::define("x", Expr::int(1)),
        Stmt::ret(vec![Expr::ident("x")]),
    ]);
    let text = main_disasm(&program);
    assert!(text.contains("OpSetGlobal"), "{}", text);
    assert!(text.contains("OpGetGlobal"), "{}", text);
    // The name lives in the constant pool.
    assert!(program.constants.iter().any(|c| matches!(c, Value::Str(s) if s.as_ref() == "x")));
}

#[test]
fn test_function_locals_lower_to_slots() {
    // func(a){ b := a; return b }
    let f = Expr::func(
        FuncParams { args: vec!["a".to_string()], ..FuncParams::default() },
        vec![
            Stmt::define("b", Expr::ident("a")),
            Stmt::ret(vec![Expr::ident("b")]),
        ],
    );
    let program = compile(vec![Stmt::expr(f)]);
    let func = program
        .constants
        .iter()
        .find_map(|c| match c {
            Value::Compiled(f) => Some(f.clone()),
            _ => None,
        })
        .expect("compiled function");
    assert_eq!(func.num_params, 1);
    assert_eq!(func.num_locals, 2);
    let text = disassemble(&func.instructions);
    assert!(text.contains("OpGetLocal 0"), "{}", text);
    assert!(text.contains("OpDefineLocal 1"), "{}", text);
    assert!(text.contains("OpReturn 1"), "{}", text);
}

#[test]
fn test_short_circuit_uses_and_or_jumps() {
    let program = compile(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::LAnd,
        Expr::ident("len"),
        Expr::binary(BinaryOp::LOr, Expr::int(0), Expr::int(2)),
    )])]);
    let text = main_disasm(&program);
    assert!(text.contains("OpAndJump"), "{}", text);
    assert!(text.contains("OpOrJump"), "{}", text);
}

#[test]
fn test_nil_comparison_uses_dedicated_opcodes() {
    let program = compile(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Equal,
        Expr::ident("len"),
        Expr::nil(),
    )])]);
    let text = main_disasm(&program);
    assert!(text.contains("OpIsNil"), "{}", text);
    assert!(!text.contains("OpEqual"), "{}", text);
}

#[test]
fn test_try_catch_finally_layout() {
    let program = compile(vec![Stmt::try_stmt(
        vec![Stmt::expr(Expr::int(1))],
        Some(CatchClause {
            name: Some("e".to_string()),
            body: vec![Stmt::expr(Expr::ident("e"))],
        }),
        Some(vec![Stmt::expr(Expr::int(2))]),
    )]);
    let text = main_disasm(&program);
    assert!(text.contains("OpSetupTry"), "{}", text);
    assert!(text.contains("OpSetupCatch"), "{}", text);
    assert!(text.contains("OpSetupFinally"), "{}", text);
    assert!(text.contains("OpFinalizer 0"), "{}", text);
}

#[test]
fn test_try_without_catch_uses_zero_sentinel() {
    let program = compile(vec![Stmt::try_stmt(
        vec![Stmt::expr(Expr::int(1))],
        None,
        Some(vec![Stmt::expr(Expr::int(2))]),
    )]);
    let text = main_disasm(&program);
    // First operand of SetupTry is the catch pc; 0 marks "no catch".
    let setup_line = text
        .lines()
        .find(|l| l.contains("OpSetupTry"))
        .expect("SetupTry emitted");
    let operands: Vec<&str> = setup_line.split_whitespace().skip(2).collect();
    assert_eq!(operands[0], "0", "{}", setup_line);
    assert_ne!(operands[1], "0", "{}", setup_line);
}

#[test]
fn test_for_in_lowering() {
    let program = compile(vec![Stmt::for_in(
        Some("k"),
        "v",
        Expr::array(vec![Expr::int(1)]),
        vec![],
    )]);
    let text = main_disasm(&program);
    assert!(text.contains("OpIterInit"), "{}", text);
    assert!(text.contains("OpIterNextElse"), "{}", text);
    assert!(text.contains("OpIterKey"), "{}", text);
    assert!(text.contains("OpIterValue"), "{}", text);
}

#[test]
fn test_destructuring_lowers_through_make_array() {
    let program = compile(vec![Stmt::define_many(&["a", "b"], Expr::int(1))]);
    let text = main_disasm(&program);
    // The private :makeArray builtin has index 0.
    assert!(text.contains("OpGetBuiltin 0"), "{}", text);
    assert!(text.contains("OpCall 2 0"), "{}", text);
}

#[test]
fn test_named_call_through_receiver() {
    // obj.fetch(1, retries=2)
    use quill::ast::{CallArgs, NamedArg};
    let program = compile(vec![
        Stmt::define("obj", Expr::dict(vec![])),
        Stmt::expr(Expr::call_with(
            Expr::selector(Expr::ident("obj"), "fetch"),
            CallArgs {
                args: vec![Expr::int(1)],
                named: vec![NamedArg { name: "retries".to_string(), value: Some(Expr::int(2)) }],
                ..CallArgs::default()
            },
        )),
    ]);
    let text = main_disasm(&program);
    assert!(text.contains("OpKeyValue 1"), "{}", text);
    assert!(text.contains("OpKeyValueArray 1"), "{}", text);
    // argc 1, flags NAMED_ARGS (2).
    assert!(text.contains("OpCallName 1 2"), "{}", text);
}

#[test]
fn test_import_emits_load_store_pair() {
    let mut module_map = ModuleMap::new();
    module_map.add_ast("m", File::new(vec![Stmt::ret(vec![Expr::int(1)])]));
    let opts = CompilerOptions {
        optimize_const: false,
        optimize_expr: false,
        module_map,
        ..CompilerOptions::default()
    };
    let program = Compiler::compile(
        &File::new(vec![
            Stmt::define("a", Expr::import("m")),
            Stmt::define("b", Expr::import("m")),
        ]),
        opts,
    )
    .unwrap();
    assert_eq!(program.num_modules(), 1);
    let text = main_disasm(&program);
    assert_eq!(text.matches("OpLoadModule").count(), 2, "{}", text);
    assert_eq!(text.matches("OpStoreModule").count(), 2, "{}", text);
}

#[test]
fn test_closure_captures_forward_through_scopes() {
    // func(){ x := 1; return func(){ return func(){ return x } } }
    let innermost = Expr::func(FuncParams::default(), vec![Stmt::ret(vec![Expr::ident("x")])]);
    let middle = Expr::func(FuncParams::default(), vec![Stmt::ret(vec![innermost])]);
    let outer = Expr::func(FuncParams::default(), vec![
        Stmt::define("x", Expr::int(1)),
        Stmt::ret(vec![middle]),
    ]);
    let program = compile(vec![Stmt::expr(outer)]);

    let functions: Vec<_> = program
        .constants
        .iter()
        .filter_map(|c| match c {
            Value::Compiled(f) => Some(f.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(functions.len(), 3);

    // The middle function forwards the outer local with GetFreePtr; the
    // outer captures its local with GetLocalPtr.
    let texts: Vec<String> = functions.iter().map(|f| disassemble(&f.instructions)).collect();
    assert!(
        texts.iter().any(|t| t.contains("OpGetLocalPtr 0")),
        "{:?}",
        texts
    );
    assert!(
        texts.iter().any(|t| t.contains("OpGetFreePtr 0")),
        "{:?}",
        texts
    );
    assert!(texts.iter().any(|t| t.contains("OpGetFree 0")), "{:?}", texts);
}

#[test]
fn test_index_chain_collapses() {
    // a[0]["k"] compiles to one GetIndex with count 2.
    let program = compile(vec![
        Stmt::define("a", Expr::array(vec![])),
        Stmt::ret(vec![Expr::index(
            Expr::index(Expr::ident("a"), Expr::int(0)),
            Expr::str("k"),
        )]),
    ]);
    let text = main_disasm(&program);
    assert!(text.contains("OpGetIndex 2"), "{}", text);
}
