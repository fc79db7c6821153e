use pretty_assertions::assert_eq;
use quill::ast::{BinaryOp, Expr, File, Stmt, UnaryOp};
use quill::{Compiler, CompilerOptions, Engine, Value, disassemble};

fn compile_optimized(stmts: Vec<Stmt>) -> quill::Program {
    Compiler::compile(&File::new(stmts), CompilerOptions::default()).unwrap()
}

#[test]
fn test_binary_folding_eliminates_operations() {
    // return 1 + 2 * 3
    let program = compile_optimized(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::int(1),
        Expr::binary(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
    )])]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpBinaryOp"), "{}", text);
    assert!(program.constants.contains(&Value::Int(7)));
}

#[test]
fn test_unary_not_folds() {
    let program = compile_optimized(vec![Stmt::ret(vec![Expr::unary(
        UnaryOp::Not,
        Expr::int(0),
    )])]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpUnary"), "{}", text);
    assert!(text.contains("OpTrue"), "{}", text);
}

#[test]
fn test_ternary_with_literal_condition_picks_branch() {
    let program = compile_optimized(vec![Stmt::ret(vec![Expr::cond(
        Expr::bool(true),
        Expr::int(1),
        Expr::int(2),
    )])]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpJumpFalsy"), "{}", text);
    assert!(program.constants.contains(&Value::Int(1)));
}

#[test]
fn test_if_with_literal_condition_drops_dead_branch() {
    // if false { return 1 }; return 2
    let program = compile_optimized(vec![
        Stmt::if_stmt(Expr::bool(false), vec![Stmt::ret(vec![Expr::int(1)])], None),
        Stmt::ret(vec![Expr::int(2)]),
    ]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpJumpFalsy"), "{}", text);
    assert!(!program.constants.contains(&Value::Int(1)));
}

#[test]
fn test_pure_builtin_call_is_pre_evaluated() {
    // return len("abc")
    let program = compile_optimized(vec![Stmt::ret(vec![Expr::call(
        Expr::ident("len"),
        vec![Expr::str("abc")],
    )])]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpCall"), "{}", text);
    assert!(program.constants.contains(&Value::Int(3)));
}

#[test]
fn test_impure_builtin_call_is_left_alone() {
    // println("x") writes output; the evaluator must not run it.
    let program = compile_optimized(vec![Stmt::expr(Expr::call(
        Expr::ident("println"),
        vec![Expr::str("x")],
    ))]);
    let text = disassemble(&program.main.instructions);
    assert!(text.contains("OpCall"), "{}", text);
}

#[test]
fn test_shadowed_builtin_is_not_pre_evaluated() {
    // len := 3; return len("abc") — `len` is the user's int, so the call
    // must fail at runtime identically with and without optimization.
    let stmts = || {
        vec![
            Stmt::define("len", Expr::int(3)),
            Stmt::ret(vec![Expr::call(Expr::ident("len"), vec![Expr::str("abc")])]),
        ]
    };

    let optimized_err = Engine::new().run(&File::new(stmts())).unwrap_err();

    let mut plain = Engine::new();
    plain.set_optimize(false);
    let plain_err = plain.run(&File::new(stmts())).unwrap_err();

    assert!(optimized_err.to_string().contains("NotCallableError"), "{}", optimized_err);
    assert!(plain_err.to_string().contains("NotCallableError"), "{}", plain_err);
}

#[test]
fn test_division_by_zero_is_reported_not_folded() {
    let err = Compiler::compile(
        &File::new(vec![Stmt::ret(vec![Expr::binary(
            BinaryOp::Div,
            Expr::int(1),
            Expr::int(0),
        )])]),
        CompilerOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("ZeroDivisionError"), "{}", err);
}

#[test]
fn test_optimizer_preserves_results() {
    // The same expressions produce equal values with and without the
    // optimizer.
    let cases: Vec<fn() -> Expr> = vec![
        || Expr::binary(BinaryOp::Add, Expr::int(1), Expr::binary(
            BinaryOp::Mul,
            Expr::int(2),
            Expr::int(3),
        )),
        || Expr::binary(BinaryOp::Shl, Expr::int(1), Expr::int(10)),
        || Expr::binary(BinaryOp::Add, Expr::str("a"), Expr::str("b")),
        || Expr::binary(
            BinaryOp::LOr,
            Expr::int(0),
            Expr::binary(BinaryOp::LAnd, Expr::int(1), Expr::str("x")),
        ),
        || Expr::call(Expr::ident("typeName"), vec![Expr::float(1.5)]),
        || Expr::call(Expr::ident("contains"), vec![Expr::str("hello"), Expr::str("ell")]),
        || Expr::unary(UnaryOp::Neg, Expr::int(5)),
        || Expr::binary(BinaryOp::Equal, Expr::uint(3), Expr::int(3)),
    ];

    for case in cases {
        let optimized = Engine::new()
            .run(&File::new(vec![Stmt::ret(vec![case()])]))
            .unwrap();
        let mut plain_engine = Engine::new();
        plain_engine.set_optimize(false);
        let plain = plain_engine
            .run(&File::new(vec![Stmt::ret(vec![case()])]))
            .unwrap();
        assert_eq!(optimized, plain);
    }
}

#[test]
fn test_try_body_is_not_optimized_away() {
    // try { 1 / 0 } catch e { return "caught" } — the error must stay a
    // runtime event, observable by catch.
    use quill::ast::CatchClause;
    let result = Engine::new()
        .run(&File::new(vec![Stmt::try_stmt(
            vec![Stmt::expr(Expr::binary(BinaryOp::Div, Expr::int(1), Expr::int(0)))],
            Some(CatchClause {
                name: None,
                body: vec![Stmt::ret(vec![Expr::str("caught")])],
            }),
            None,
        )]))
        .unwrap();
    assert_eq!(result, Value::str("caught"));
}

#[test]
fn test_folding_cascades_across_passes() {
    // ((1 + 2) + 3) + 4 collapses fully.
    let expr = Expr::binary(
        BinaryOp::Add,
        Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(2)),
            Expr::int(3),
        ),
        Expr::int(4),
    );
    let program = compile_optimized(vec![Stmt::ret(vec![expr])]);
    let text = disassemble(&program.main.instructions);
    assert!(!text.contains("OpBinaryOp"), "{}", text);
    assert!(program.constants.contains(&Value::Int(10)));
}
