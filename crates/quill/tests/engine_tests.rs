use pretty_assertions::assert_eq;
use quill::ast::{
    BinaryOp, CallArgs, CatchClause, DeclSpec, Expr, File, FuncParams, NamedArg, Span, Stmt,
    StmtKind,
};
use quill::{Engine, ErrorValue, Limits, Value, ValueMap};

fn run(engine: &mut Engine, stmts: Vec<Stmt>) -> Value {
    engine.run(&File::new(stmts)).unwrap()
}

fn run_fresh(stmts: Vec<Stmt>) -> Value {
    run(&mut Engine::new(), stmts)
}

/// `func(params){ body }` with positional parameter names only.
fn func(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::func(
        FuncParams {
            args: params.iter().map(|p| p.to_string()).collect(),
            ..FuncParams::default()
        },
        body,
    )
}

#[test]
fn test_arithmetic() {
    // return 1 + 2 * 3
    let result = run_fresh(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::int(1),
        Expr::binary(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
    )])]);
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_uint_and_float_arithmetic() {
    let result = run_fresh(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Rem,
        Expr::uint(7),
        Expr::uint(3),
    )])]);
    assert_eq!(result, Value::Uint(1));

    let result = run_fresh(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Div,
        Expr::int(1),
        Expr::float(2.0),
    )])]);
    assert_eq!(result, Value::Float(0.5));
}

#[test]
fn test_globals_persist_across_runs() {
    let mut engine = Engine::new();
    run(&mut engine, vec![Stmt::define("x", Expr::int(10))]);
    let result = run(&mut engine, vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::ident("x"),
        Expr::int(5),
    )])]);
    assert_eq!(result, Value::Int(15));
    assert_eq!(engine.global("x"), Some(Value::Int(10)));
}

#[test]
fn test_destructuring_binds_elements() {
    // x, y := [1, 2, 3]; return x, y
    let result = run_fresh(vec![
        Stmt::define_many(&["x", "y"], Expr::array(vec![
            Expr::int(1),
            Expr::int(2),
            Expr::int(3),
        ])),
        Stmt::ret(vec![Expr::ident("x"), Expr::ident("y")]),
    ]);
    assert_eq!(result, Value::from(vec![1i64, 2]));
}

#[test]
fn test_destructuring_pads_with_nil() {
    // a, b, c := [1]; return [a, b, c]
    let result = run_fresh(vec![
        Stmt::define_many(&["a", "b", "c"], Expr::array(vec![Expr::int(1)])),
        Stmt::ret(vec![Expr::array(vec![
            Expr::ident("a"),
            Expr::ident("b"),
            Expr::ident("c"),
        ])]),
    ]);
    assert_eq!(
        result,
        Value::array(vec![Value::Int(1), Value::Nil, Value::Nil])
    );
}

#[test]
fn test_destructuring_non_array_goes_to_first_slot() {
    // a, b := 42; return [a, b]
    let result = run_fresh(vec![
        Stmt::define_many(&["a", "b"], Expr::int(42)),
        Stmt::ret(vec![Expr::array(vec![Expr::ident("a"), Expr::ident("b")])]),
    ]);
    assert_eq!(result, Value::array(vec![Value::Int(42), Value::Nil]));
}

#[test]
fn test_destructuring_leaves_source_unchanged() {
    // src := [1, 2]; a, b, c := src; return len(src)
    let result = run_fresh(vec![
        Stmt::define("src", Expr::array(vec![Expr::int(1), Expr::int(2)])),
        Stmt::define_many(&["a", "b", "c"], Expr::ident("src")),
        Stmt::ret(vec![Expr::call(Expr::ident("len"), vec![Expr::ident("src")])]),
    ]);
    assert_eq!(result, Value::Int(2));
}

#[test]
fn test_recursive_function() {
    // f := func(n){ if n < 2 { return n }; return f(n-1) + f(n-2) }
    // return f(10)
    let body = vec![
        Stmt::if_stmt(
            Expr::binary(BinaryOp::Less, Expr::ident("n"), Expr::int(2)),
            vec![Stmt::ret(vec![Expr::ident("n")])],
            None,
        ),
        Stmt::ret(vec![Expr::binary(
            BinaryOp::Add,
            Expr::call(Expr::ident("f"), vec![Expr::binary(
                BinaryOp::Sub,
                Expr::ident("n"),
                Expr::int(1),
            )]),
            Expr::call(Expr::ident("f"), vec![Expr::binary(
                BinaryOp::Sub,
                Expr::ident("n"),
                Expr::int(2),
            )]),
        )]),
    ];
    let result = run_fresh(vec![
        Stmt::define("f", func(&["n"], body)),
        Stmt::ret(vec![Expr::call(Expr::ident("f"), vec![Expr::int(10)])]),
    ]);
    assert_eq!(result, Value::Int(55));
}

#[test]
fn test_recursion_through_callee() {
    // f := func(n){ if n == 0 { return "done" }; return __callee__(n - 1) }
    let body = vec![
        Stmt::if_stmt(
            Expr::binary(BinaryOp::Equal, Expr::ident("n"), Expr::int(0)),
            vec![Stmt::ret(vec![Expr::str("done")])],
            None,
        ),
        Stmt::ret(vec![Expr::call(Expr::ident("__callee__"), vec![
            Expr::binary(BinaryOp::Sub, Expr::ident("n"), Expr::int(1)),
        ])]),
    ];
    let result = run_fresh(vec![
        Stmt::define("f", func(&["n"], body)),
        Stmt::ret(vec![Expr::call(Expr::ident("f"), vec![Expr::int(3)])]),
    ]);
    assert_eq!(result, Value::str("done"));
}

#[test]
fn test_closure_counter_shares_captured_cell() {
    // f := func(){ x := 0; return func(){ x += 1; return x } }()
    // return [f(), f(), f()]
    let inner = Expr::func(FuncParams::default(), vec![
        Stmt::aug_assign(Expr::ident("x"), BinaryOp::Add, Expr::int(1)),
        Stmt::ret(vec![Expr::ident("x")]),
    ]);
    let outer = Expr::func(FuncParams::default(), vec![
        Stmt::define("x", Expr::int(0)),
        Stmt::ret(vec![inner]),
    ]);
    let result = run_fresh(vec![
        Stmt::define("f", Expr::call(outer, vec![])),
        Stmt::ret(vec![Expr::array(vec![
            Expr::call(Expr::ident("f"), vec![]),
            Expr::call(Expr::ident("f"), vec![]),
            Expr::call(Expr::ident("f"), vec![]),
        ])]),
    ]);
    assert_eq!(result, Value::from(vec![1i64, 2, 3]));
}

#[test]
fn test_two_closures_share_one_cell() {
    // make := func(){ x := 0; return [func(){ x += 1; return x },
    //                                 func(){ return x }] }
    // pair := make(); pair[0](); pair[0](); return pair[1]()
    let bump = Expr::func(FuncParams::default(), vec![
        Stmt::aug_assign(Expr::ident("x"), BinaryOp::Add, Expr::int(1)),
        Stmt::ret(vec![Expr::ident("x")]),
    ]);
    let read = Expr::func(FuncParams::default(), vec![Stmt::ret(vec![Expr::ident("x")])]);
    let make = Expr::func(FuncParams::default(), vec![
        Stmt::define("x", Expr::int(0)),
        Stmt::ret(vec![Expr::array(vec![bump, read])]),
    ]);
    let result = run_fresh(vec![
        Stmt::define("pair", Expr::call(make, vec![])),
        Stmt::expr(Expr::call(Expr::index(Expr::ident("pair"), Expr::int(0)), vec![])),
        Stmt::expr(Expr::call(Expr::index(Expr::ident("pair"), Expr::int(0)), vec![])),
        Stmt::ret(vec![Expr::call(
            Expr::index(Expr::ident("pair"), Expr::int(1)),
            vec![],
        )]),
    ]);
    assert_eq!(result, Value::Int(2));
}

#[test]
fn test_for_in_sums_array() {
    // s := 0; for v in [1,2,3,4] { s += v }; return s
    let result = run_fresh(vec![
        Stmt::define("s", Expr::int(0)),
        Stmt::for_in(
            None,
            "v",
            Expr::array(vec![Expr::int(1), Expr::int(2), Expr::int(3), Expr::int(4)]),
            vec![Stmt::aug_assign(Expr::ident("s"), BinaryOp::Add, Expr::ident("v"))],
        ),
        Stmt::ret(vec![Expr::ident("s")]),
    ]);
    assert_eq!(result, Value::Int(10));
}

#[test]
fn test_for_in_observes_each_pair_once() {
    // count := 0; keys := []
    // for k, v in {a: 1, b: 2} { count += v; append(keys, k) }
    // return [count, keys]
    let result = run_fresh(vec![
        Stmt::define("count", Expr::int(0)),
        Stmt::define("ks", Expr::array(vec![])),
        Stmt::new(
            StmtKind::ForIn {
                key: Some("k".to_string()),
                value: "v".to_string(),
                iterable: Expr::dict(vec![("a", Expr::int(1)), ("b", Expr::int(2))]),
                body: vec![
                    Stmt::aug_assign(Expr::ident("count"), BinaryOp::Add, Expr::ident("v")),
                    Stmt::expr(Expr::call(Expr::ident("append"), vec![
                        Expr::ident("ks"),
                        Expr::ident("k"),
                    ])),
                ],
                else_body: None,
            },
            Span::default(),
        ),
        Stmt::ret(vec![Expr::array(vec![Expr::ident("count"), Expr::ident("ks")])]),
    ]);
    assert_eq!(
        result,
        Value::array(vec![
            Value::Int(3),
            Value::array(vec![Value::str("a"), Value::str("b")]),
        ])
    );
}

#[test]
fn test_for_in_else_runs_on_empty_iterable() {
    let result = run_fresh(vec![
        Stmt::new(
            StmtKind::ForIn {
                key: None,
                value: "v".to_string(),
                iterable: Expr::array(vec![]),
                body: vec![Stmt::ret(vec![Expr::str("looped")])],
                else_body: Some(vec![Stmt::ret(vec![Expr::str("empty")])]),
            },
            Span::default(),
        ),
        Stmt::ret(vec![Expr::str("after")]),
    ]);
    assert_eq!(result, Value::str("empty"));
}

#[test]
fn test_break_and_continue() {
    // s := 0
    // for v in [1,2,3,4,5] { if v == 3 { continue }
    //                        if v == 5 { break }
    //                        s += v }
    // return s
    let result = run_fresh(vec![
        Stmt::define("s", Expr::int(0)),
        Stmt::for_in(
            None,
            "v",
            Expr::array((1..=5).map(Expr::int).collect()),
            vec![
                Stmt::if_stmt(
                    Expr::binary(BinaryOp::Equal, Expr::ident("v"), Expr::int(3)),
                    vec![Stmt::new(StmtKind::Continue, Span::default())],
                    None,
                ),
                Stmt::if_stmt(
                    Expr::binary(BinaryOp::Equal, Expr::ident("v"), Expr::int(5)),
                    vec![Stmt::new(StmtKind::Break, Span::default())],
                    None,
                ),
                Stmt::aug_assign(Expr::ident("s"), BinaryOp::Add, Expr::ident("v")),
            ],
        ),
        Stmt::ret(vec![Expr::ident("s")]),
    ]);
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_c_style_for_loop() {
    // i := 0; for ; i < 5; { i += 1 }; return i
    let result = run_fresh(vec![
        Stmt::define("i", Expr::int(0)),
        Stmt::new(
            StmtKind::For {
                init: None,
                cond: Some(Expr::binary(BinaryOp::Less, Expr::ident("i"), Expr::int(5))),
                post: None,
                body: vec![Stmt::aug_assign(Expr::ident("i"), BinaryOp::Add, Expr::int(1))],
            },
            Span::default(),
        ),
        Stmt::ret(vec![Expr::ident("i")]),
    ]);
    assert_eq!(result, Value::Int(5));
}

#[test]
fn test_try_catch_division_by_zero() {
    // try { 1 / 0 } catch e { return typeName(e) }
    let result = run_fresh(vec![
        Stmt::try_stmt(
            vec![Stmt::expr(Expr::binary(BinaryOp::Div, Expr::int(1), Expr::int(0)))],
            Some(CatchClause {
                name: Some("e".to_string()),
                body: vec![Stmt::ret(vec![Expr::call(Expr::ident("typeName"), vec![
                    Expr::ident("e"),
                ])])],
            }),
            None,
        ),
        Stmt::ret(vec![Expr::str("not reached")]),
    ]);
    assert_eq!(result, Value::str("error"));
}

#[test]
fn test_catch_binds_error_with_kind_name() {
    // try { [][5] = 1 } catch e { return e["name"] }
    let result = run_fresh(vec![
        Stmt::try_stmt(
            vec![Stmt::assign(
                Expr::index(Expr::array(vec![]), Expr::int(5)),
                Expr::int(1),
            )],
            Some(CatchClause {
                name: Some("e".to_string()),
                body: vec![Stmt::ret(vec![Expr::index(
                    Expr::ident("e"),
                    Expr::str("name"),
                )])],
            }),
            None,
        ),
    ]);
    assert_eq!(result, Value::str("IndexOutOfBoundsError"));
}

#[test]
fn test_finally_runs_on_return_and_preserves_value() {
    // f := func(){ try { return 1 } finally { println("fin") } }
    // return f()
    let f = Expr::func(FuncParams::default(), vec![Stmt::try_stmt(
        vec![Stmt::ret(vec![Expr::int(1)])],
        None,
        Some(vec![Stmt::expr(Expr::call(Expr::ident("println"), vec![
            Expr::str("fin"),
        ]))]),
    )]);
    let mut engine = Engine::new();
    let output = engine
        .capture(&File::new(vec![
            Stmt::define("f", f),
            Stmt::ret(vec![Expr::call(Expr::ident("f"), vec![])]),
        ]))
        .unwrap();
    assert_eq!(output.value, Value::Int(1));
    // Exactly once.
    assert_eq!(output.output, "fin\n");
}

#[test]
fn test_finally_runs_when_catch_rethrows() {
    // order := []
    // try { try { throw error("boom") } catch e { append(order, "catch"); throw }
    //       finally { append(order, "finally") } }
    // catch { append(order, "outer") }
    // return order
    let inner_try = Stmt::try_stmt(
        vec![Stmt::throw(Expr::call(Expr::ident("error"), vec![Expr::str("boom")]))],
        Some(CatchClause {
            name: Some("e".to_string()),
            body: vec![
                Stmt::expr(Expr::call(Expr::ident("append"), vec![
                    Expr::ident("order"),
                    Expr::str("catch"),
                ])),
                Stmt::new(StmtKind::Throw(None), Span::default()),
            ],
        }),
        Some(vec![Stmt::expr(Expr::call(Expr::ident("append"), vec![
            Expr::ident("order"),
            Expr::str("finally"),
        ]))]),
    );
    let outer_try = Stmt::try_stmt(
        vec![inner_try],
        Some(CatchClause {
            name: None,
            body: vec![Stmt::expr(Expr::call(Expr::ident("append"), vec![
                Expr::ident("order"),
                Expr::str("outer"),
            ]))],
        }),
        None,
    );
    let result = run_fresh(vec![
        Stmt::define("order", Expr::array(vec![])),
        outer_try,
        Stmt::ret(vec![Expr::ident("order")]),
    ]);
    assert_eq!(
        result,
        Value::array(vec![
            Value::str("catch"),
            Value::str("finally"),
            Value::str("outer"),
        ])
    );
}

#[test]
fn test_uncaught_error_carries_trace() {
    // f := func(){ throw error("inner") }; f()
    let f = Expr::func(FuncParams::default(), vec![Stmt::throw(Expr::call(
        Expr::ident("error"),
        vec![Expr::str("inner")],
    ))]);
    let err = Engine::new()
        .run(&File::new(vec![
            Stmt::define("f", f),
            Stmt::expr(Expr::call(Expr::ident("f"), vec![])),
        ]))
        .unwrap_err();
    match err {
        quill::Error::Runtime(rt) => {
            assert_eq!(rt.error.name, "error");
            assert_eq!(rt.error.message, "inner");
            // One position in the callee, one at the call site.
            assert!(rt.trace.len() >= 2, "trace: {:?}", rt.trace);
        }
        other => panic!("expected runtime error, got {}", other),
    }
}

#[test]
fn test_variadic_apply() {
    // apply := func(fn, *a){ return fn(*a) }
    // return apply(func(x, y){ return x * y }, 6, 7)
    let apply = Expr::func(
        FuncParams {
            args: vec!["fn".to_string()],
            var_arg: Some("a".to_string()),
            ..FuncParams::default()
        },
        vec![Stmt::ret(vec![Expr::call_with(Expr::ident("fn"), CallArgs {
            var_arg: Some(Box::new(Expr::ident("a"))),
            ..CallArgs::default()
        })])],
    );
    let mul = func(&["x", "y"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Mul,
        Expr::ident("x"),
        Expr::ident("y"),
    )])]);
    let result = run_fresh(vec![
        Stmt::define("apply", apply),
        Stmt::ret(vec![Expr::call(Expr::ident("apply"), vec![
            mul,
            Expr::int(6),
            Expr::int(7),
        ])]),
    ]);
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_named_args_with_defaults() {
    // f := func(a; b=10, c=20){ return a + b + c }
    // return f(1, c=5)
    let f = Expr::func(
        FuncParams {
            args: vec!["a".to_string()],
            named: vec![
                ("b".to_string(), Some(Expr::int(10))),
                ("c".to_string(), Some(Expr::int(20))),
            ],
            ..FuncParams::default()
        },
        vec![Stmt::ret(vec![Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Add, Expr::ident("a"), Expr::ident("b")),
            Expr::ident("c"),
        )])],
    );
    let result = run_fresh(vec![
        Stmt::define("f", f),
        Stmt::ret(vec![Expr::call_with(Expr::ident("f"), CallArgs {
            args: vec![Expr::int(1)],
            named: vec![NamedArg { name: "c".to_string(), value: Some(Expr::int(5)) }],
            ..CallArgs::default()
        })]),
    ]);
    assert_eq!(result, Value::Int(16));
}

#[test]
fn test_unexpected_named_arg_raises() {
    let f = func(&["a"], vec![Stmt::ret(vec![Expr::ident("a")])]);
    let err = Engine::new()
        .run(&File::new(vec![
            Stmt::define("f", f),
            Stmt::ret(vec![Expr::call_with(Expr::ident("f"), CallArgs {
                args: vec![Expr::int(1)],
                named: vec![NamedArg { name: "zzz".to_string(), value: Some(Expr::int(2)) }],
                ..CallArgs::default()
            })]),
        ]))
        .unwrap_err();
    assert!(err.to_string().contains("WrongNumArgumentsError"), "{}", err);
}

#[test]
fn test_var_named_collects_extras() {
    // f := func(; **rest){ return rest["k"] }
    // return f(k=7)
    let f = Expr::func(
        FuncParams {
            var_named: Some("rest".to_string()),
            ..FuncParams::default()
        },
        vec![Stmt::ret(vec![Expr::index(Expr::ident("rest"), Expr::str("k"))])],
    );
    let result = run_fresh(vec![
        Stmt::define("f", f),
        Stmt::ret(vec![Expr::call_with(Expr::ident("f"), CallArgs {
            named: vec![NamedArg { name: "k".to_string(), value: Some(Expr::int(7)) }],
            ..CallArgs::default()
        })]),
    ]);
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_wrong_arg_count_raises() {
    let f = func(&["a", "b"], vec![Stmt::ret(vec![Expr::ident("a")])]);
    let err = Engine::new()
        .run(&File::new(vec![
            Stmt::define("f", f),
            Stmt::ret(vec![Expr::call(Expr::ident("f"), vec![Expr::int(1)])]),
        ]))
        .unwrap_err();
    assert!(err.to_string().contains("WrongNumArgumentsError"), "{}", err);
}

#[test]
fn test_const_iota_group() {
    // const (a = iota, b, c); return a, b, c
    let result = run_fresh(vec![
        Stmt::new(
            StmtKind::Const(vec![
                DeclSpec {
                    name: "a".to_string(),
                    value: Some(Expr::ident("iota")),
                    span: Span::default(),
                },
                DeclSpec { name: "b".to_string(), value: None, span: Span::default() },
                DeclSpec { name: "c".to_string(), value: None, span: Span::default() },
            ]),
            Span::default(),
        ),
        Stmt::ret(vec![Expr::ident("a"), Expr::ident("b"), Expr::ident("c")]),
    ]);
    assert_eq!(result, Value::from(vec![0i64, 1, 2]));
}

#[test]
fn test_iota_arithmetic_repeats_expression() {
    // const (a = iota * 2, b, c); return c
    let result = run_fresh(vec![
        Stmt::new(
            StmtKind::Const(vec![
                DeclSpec {
                    name: "a".to_string(),
                    value: Some(Expr::binary(
                        BinaryOp::Mul,
                        Expr::ident("iota"),
                        Expr::int(2),
                    )),
                    span: Span::default(),
                },
                DeclSpec { name: "b".to_string(), value: None, span: Span::default() },
                DeclSpec { name: "c".to_string(), value: None, span: Span::default() },
            ]),
            Span::default(),
        ),
        Stmt::ret(vec![Expr::ident("c")]),
    ]);
    assert_eq!(result, Value::Int(4));
}

#[test]
fn test_error_cause_chain() {
    // base := error("a"); derived := base.New("b")
    // return [isError(derived, base), isError(base, derived)]
    let result = run_fresh(vec![
        Stmt::define("base", Expr::call(Expr::ident("error"), vec![Expr::str("a")])),
        Stmt::define(
            "derived",
            Expr::call(Expr::selector(Expr::ident("base"), "New"), vec![Expr::str("b")]),
        ),
        Stmt::ret(vec![Expr::array(vec![
            Expr::call(Expr::ident("isError"), vec![
                Expr::ident("derived"),
                Expr::ident("base"),
            ]),
            Expr::call(Expr::ident("isError"), vec![
                Expr::ident("base"),
                Expr::ident("derived"),
            ]),
        ])]),
    ]);
    assert_eq!(result, Value::array(vec![Value::Bool(true), Value::Bool(false)]));
}

#[test]
fn test_host_function_and_named_dispatch() {
    let mut engine = Engine::new();
    engine.register_fn("mul", |ctx| {
        let mut product = 1i64;
        for arg in &ctx.args {
            if let Value::Int(v) = arg {
                product *= v;
            }
        }
        Ok(Value::Int(product))
    });
    let result = run(&mut engine, vec![Stmt::ret(vec![Expr::call(
        Expr::ident("mul"),
        vec![Expr::int(6), Expr::int(7)],
    )])]);
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_host_function_error_is_catchable() {
    let mut engine = Engine::new();
    engine.register_fn("fail", |_| Err(ErrorValue::type_error("host said no")));
    let result = run(&mut engine, vec![
        Stmt::try_stmt(
            vec![Stmt::expr(Expr::call(Expr::ident("fail"), vec![]))],
            Some(CatchClause {
                name: Some("e".to_string()),
                body: vec![Stmt::ret(vec![Expr::index(
                    Expr::ident("e"),
                    Expr::str("name"),
                )])],
            }),
            None,
        ),
    ]);
    assert_eq!(result, Value::str("TypeError"));
}

#[test]
fn test_value_module_import() {
    let mut engine = Engine::new();
    engine.module("mymod", |m| {
        m.constant("VERSION", Value::str("1.0"));
        m.function("double", |ctx| {
            let n = match ctx.args.first() {
                Some(Value::Int(v)) => *v,
                _ => 0,
            };
            Ok(Value::Int(n * 2))
        });
    });
    // m := import("mymod"); return m.double(5)
    let result = run(&mut engine, vec![
        Stmt::define("m", Expr::import("mymod")),
        Stmt::ret(vec![Expr::call(Expr::selector(Expr::ident("m"), "double"), vec![
            Expr::int(5),
        ])]),
    ]);
    assert_eq!(result, Value::Int(10));
}

#[test]
fn test_ast_module_runs_once_and_caches() {
    // Module body prints on execution and exports a dict.
    let module = File::new(vec![
        Stmt::expr(Expr::call(Expr::ident("println"), vec![Expr::str("loading")])),
        Stmt::ret(vec![Expr::dict(vec![("answer", Expr::int(41))])]),
    ]);
    let mut engine = Engine::new();
    engine.modules_mut().add_ast("answers", module);

    // a := import("answers"); b := import("answers")
    // return a["answer"] + len([b]) — both imports see the same cache.
    let file = File::new(vec![
        Stmt::define("a", Expr::import("answers")),
        Stmt::define("b", Expr::import("answers")),
        Stmt::ret(vec![Expr::binary(
            BinaryOp::Add,
            Expr::index(Expr::ident("a"), Expr::str("answer")),
            Expr::index(Expr::ident("b"), Expr::str("answer")),
        )]),
    ]);
    let output = engine.capture(&file).unwrap();
    assert_eq!(output.value, Value::Int(82));
    // The module body executed exactly once.
    assert_eq!(output.output, "loading\n");
}

#[test]
fn test_output_buffering() {
    // obstart(); print("abc"); return obend()
    let result = run_fresh(vec![
        Stmt::expr(Expr::call(Expr::ident("obstart"), vec![])),
        Stmt::expr(Expr::call(Expr::ident("print"), vec![Expr::str("abc")])),
        Stmt::ret(vec![Expr::call(Expr::ident("obend"), vec![])]),
    ]);
    assert_eq!(result, Value::str("abc"));
}

#[test]
fn test_buffered_output_not_in_capture() {
    // obstart(); print("hidden"); obend(); print("visible")
    let mut engine = Engine::new();
    let output = engine
        .capture(&File::new(vec![
            Stmt::expr(Expr::call(Expr::ident("obstart"), vec![])),
            Stmt::expr(Expr::call(Expr::ident("print"), vec![Expr::str("hidden")])),
            Stmt::expr(Expr::call(Expr::ident("obend"), vec![])),
            Stmt::expr(Expr::call(Expr::ident("print"), vec![Expr::str("visible")])),
        ]))
        .unwrap();
    assert_eq!(output.output, "visible");
}

#[test]
fn test_stdout_writer_value() {
    // w := stdout; w.write("x"); return nil
    use quill::ast::{ExprKind, StdioKind};
    let stdout_expr = Expr::new(ExprKind::Stdio(StdioKind::Out), Span::default());
    let mut engine = Engine::new();
    let output = engine
        .capture(&File::new(vec![
            Stmt::define("w", stdout_expr),
            Stmt::expr(Expr::call(Expr::selector(Expr::ident("w"), "write"), vec![
                Expr::str("x"),
            ])),
        ]))
        .unwrap();
    assert_eq!(output.output, "x");
}

#[test]
fn test_instruction_limit_is_enforced() {
    let mut engine = Engine::new();
    engine.limit(Limits {
        max_instructions: Some(10_000),
        max_recursion_depth: None,
    });
    // for ;; {}
    let err = engine
        .run(&File::new(vec![Stmt::new(
            StmtKind::For { init: None, cond: None, post: None, body: vec![] },
            Span::default(),
        )]))
        .unwrap_err();
    assert!(err.to_string().contains("instruction limit"), "{}", err);
}

#[test]
fn test_recursion_limit_is_enforced() {
    let mut engine = Engine::new();
    engine.limit(Limits {
        max_instructions: None,
        max_recursion_depth: Some(16),
    });
    // f := func(){ return f() }; f()
    let f = Expr::func(FuncParams::default(), vec![Stmt::ret(vec![Expr::call(
        Expr::ident("f"),
        vec![],
    )])]);
    let err = engine
        .run(&File::new(vec![
            Stmt::define("f", f),
            Stmt::expr(Expr::call(Expr::ident("f"), vec![])),
        ]))
        .unwrap_err();
    assert!(err.to_string().contains("recursion limit"), "{}", err);
}

#[test]
fn test_abort_stops_before_user_code() {
    let mut engine = Engine::new();
    engine.abort_handle().abort();
    let err = engine
        .run(&File::new(vec![Stmt::ret(vec![Expr::int(1)])]))
        .unwrap_err();
    assert!(err.to_string().contains("VMAborted"), "{}", err);

    // The handle can be re-armed.
    engine.abort_handle().reset();
    let result = engine
        .run(&File::new(vec![Stmt::ret(vec![Expr::int(1)])]))
        .unwrap();
    assert_eq!(result, Value::Int(1));
}

#[test]
fn test_abort_from_another_thread() {
    let mut engine = Engine::new();
    let handle = engine.abort_handle();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.abort();
    });
    // for ;; {} — unbounded without the abort.
    let err = engine
        .run(&File::new(vec![Stmt::new(
            StmtKind::For { init: None, cond: None, post: None, body: vec![] },
            Span::default(),
        )]))
        .unwrap_err();
    aborter.join().unwrap();
    assert!(err.to_string().contains("VMAborted"), "{}", err);
}

#[test]
fn test_sync_dict_shared_across_threads() {
    use std::thread;

    let shared = Value::sync_dict(ValueMap::new());
    let mut handles = Vec::new();
    for t in 0..4 {
        let dict = shared.clone();
        handles.push(thread::spawn(move || {
            for i in 0..100 {
                let key = Value::str(format!("k{}-{}", t, i));
                dict.index_set(&key, Value::Int(i)).unwrap();
                // Readers never observe a partial write.
                let read = dict.index_get(&key).unwrap();
                assert_eq!(read, Value::Int(i));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(shared.len(), Some(400));
}

#[test]
fn test_script_reads_and_writes_sync_dict_global() {
    let mut engine = Engine::new();
    engine.set_global("shared", Value::sync_dict(ValueMap::new()));
    run(&mut engine, vec![Stmt::assign(
        Expr::index(Expr::ident("shared"), Expr::str("from_script")),
        Expr::int(99),
    )]);
    let shared = engine.global("shared").unwrap();
    assert_eq!(
        shared.index_get(&Value::str("from_script")).unwrap(),
        Value::Int(99)
    );
}

#[test]
fn test_param_binds_run_arguments() {
    // param (a, b); return a + b
    let mut engine = Engine::new();
    let file = File::new(vec![
        Stmt::new(
            StmtKind::Param { names: vec!["a".to_string(), "b".to_string()], var_name: None },
            Span::default(),
        ),
        Stmt::ret(vec![Expr::binary(BinaryOp::Add, Expr::ident("a"), Expr::ident("b"))]),
    ]);
    let result = engine
        .run_with_args(&file, vec![Value::Int(3), Value::Int(4)], ValueMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_variadic_param_collects_rest() {
    // param (first, *rest); return [first, len(rest)]
    let mut engine = Engine::new();
    let file = File::new(vec![
        Stmt::new(
            StmtKind::Param {
                names: vec!["first".to_string()],
                var_name: Some("rest".to_string()),
            },
            Span::default(),
        ),
        Stmt::ret(vec![Expr::array(vec![
            Expr::ident("first"),
            Expr::call(Expr::ident("len"), vec![Expr::ident("rest")]),
        ])]),
    ]);
    let result = engine
        .run_with_args(
            &file,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            ValueMap::new(),
        )
        .unwrap();
    assert_eq!(result, Value::array(vec![Value::Int(1), Value::Int(2)]));
}

#[test]
fn test_slicing_and_indexing() {
    // return ["hello"[1:3], "abc"[-1], [1,2,3,4][1:]]
    let result = run_fresh(vec![Stmt::ret(vec![Expr::array(vec![
        Expr::slice(Expr::str("hello"), Some(Expr::int(1)), Some(Expr::int(3))),
        Expr::index(Expr::str("abc"), Expr::int(-1)),
        Expr::slice(
            Expr::array(vec![Expr::int(1), Expr::int(2), Expr::int(3), Expr::int(4)]),
            Some(Expr::int(1)),
            None,
        ),
    ])])]);
    assert_eq!(
        result,
        Value::array(vec![
            Value::str("el"),
            Value::Char('c'),
            Value::from(vec![2i64, 3, 4]),
        ])
    );
}

#[test]
fn test_nil_coalescing_and_ternary() {
    // x := nil; return (x ?? 5) > 4 ? "big" : "small"
    let result = run_fresh(vec![
        Stmt::define("x", Expr::nil()),
        Stmt::ret(vec![Expr::cond(
            Expr::binary(
                BinaryOp::Greater,
                Expr::binary(BinaryOp::NilCoalesce, Expr::ident("x"), Expr::int(5)),
                Expr::int(4),
            ),
            Expr::str("big"),
            Expr::str("small"),
        )]),
    ]);
    assert_eq!(result, Value::str("big"));
}

#[test]
fn test_logical_operators_keep_decisive_operand() {
    // return [0 && "x", 0 || "x", 1 && "y"]
    let result = run_fresh(vec![Stmt::ret(vec![Expr::array(vec![
        Expr::binary(BinaryOp::LAnd, Expr::int(0), Expr::str("x")),
        Expr::binary(BinaryOp::LOr, Expr::int(0), Expr::str("x")),
        Expr::binary(BinaryOp::LAnd, Expr::int(1), Expr::str("y")),
    ])])]);
    assert_eq!(
        result,
        Value::array(vec![Value::Int(0), Value::str("x"), Value::str("y")])
    );
}

#[test]
fn test_decimal_arithmetic_is_exact() {
    // return decimal("0.1") + decimal("0.2") == decimal("0.3")
    let dec = |s: &str| Expr::call(Expr::ident("decimal"), vec![Expr::str(s)]);
    let result = run_fresh(vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Equal,
        Expr::binary(BinaryOp::Add, dec("0.1"), dec("0.2")),
        dec("0.3"),
    )])]);
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_object_types_and_bound_methods() {
    // Point := newType("Point", {dist: func(self){ return self["x"] + self["y"] }})
    // p := Point({x: 3, y: 4})
    // return p.dist()
    let dist = func(&["self"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::index(Expr::ident("self"), Expr::str("x")),
        Expr::index(Expr::ident("self"), Expr::str("y")),
    )])]);
    let result = run_fresh(vec![
        Stmt::define(
            "Point",
            Expr::call(Expr::ident("newType"), vec![
                Expr::str("Point"),
                Expr::dict(vec![("dist", dist)]),
            ]),
        ),
        Stmt::define(
            "p",
            Expr::call(Expr::ident("Point"), vec![Expr::dict(vec![
                ("x", Expr::int(3)),
                ("y", Expr::int(4)),
            ])]),
        ),
        Stmt::ret(vec![Expr::call(Expr::selector(Expr::ident("p"), "dist"), vec![])]),
    ]);
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_new_type_extends_resolves_parent_methods() {
    // Base := newType("Base", {hello: func(self){ return "hi" }})
    // Child := newType("Child", {}, [Base])
    // return Child({}).hello()
    let hello = func(&["self"], vec![Stmt::ret(vec![Expr::str("hi")])]);
    let result = run_fresh(vec![
        Stmt::define(
            "Base",
            Expr::call(Expr::ident("newType"), vec![
                Expr::str("Base"),
                Expr::dict(vec![("hello", hello)]),
            ]),
        ),
        Stmt::define(
            "Child",
            Expr::call(Expr::ident("newType"), vec![
                Expr::str("Child"),
                Expr::dict(vec![]),
                Expr::array(vec![Expr::ident("Base")]),
            ]),
        ),
        Stmt::ret(vec![Expr::call(
            Expr::selector(
                Expr::call(Expr::ident("Child"), vec![Expr::dict(vec![])]),
                "hello",
            ),
            vec![],
        )]),
    ]);
    assert_eq!(result, Value::str("hi"));
}

#[test]
fn test_functional_builtins() {
    // nums := [1, 2, 3, 4]
    // return [map(nums, func(v, k){ return v * v })[3],
    //         len(filter(nums, func(v, k){ return v % 2 == 0 })),
    //         reduce(nums, func(acc, v, k){ return acc + v })]
    let square = func(&["v", "k"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Mul,
        Expr::ident("v"),
        Expr::ident("v"),
    )])]);
    let even = func(&["v", "k"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Equal,
        Expr::binary(BinaryOp::Rem, Expr::ident("v"), Expr::int(2)),
        Expr::int(0),
    )])]);
    let sum = func(&["acc", "v", "k"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::ident("acc"),
        Expr::ident("v"),
    )])]);
    let result = run_fresh(vec![
        Stmt::define(
            "nums",
            Expr::array(vec![Expr::int(1), Expr::int(2), Expr::int(3), Expr::int(4)]),
        ),
        Stmt::ret(vec![Expr::array(vec![
            Expr::index(
                Expr::call(Expr::ident("map"), vec![Expr::ident("nums"), square]),
                Expr::int(3),
            ),
            Expr::call(Expr::ident("len"), vec![Expr::call(Expr::ident("filter"), vec![
                Expr::ident("nums"),
                even,
            ])]),
            Expr::call(Expr::ident("reduce"), vec![Expr::ident("nums"), sum]),
        ])]),
    ]);
    assert_eq!(result, Value::from(vec![16i64, 2, 10]));
}

#[test]
fn test_shadowed_builtin_resolves_to_user_binding() {
    // len := 3; return len
    let result = run_fresh(vec![
        Stmt::define("len", Expr::int(3)),
        Stmt::ret(vec![Expr::ident("len")]),
    ]);
    assert_eq!(result, Value::Int(3));
}

#[test]
fn test_rerunning_defining_script_is_allowed() {
    let mut engine = Engine::new();
    let file = File::new(vec![
        Stmt::define("x", Expr::int(1)),
        Stmt::ret(vec![Expr::ident("x")]),
    ]);
    assert_eq!(engine.run(&file).unwrap(), Value::Int(1));
    assert_eq!(engine.run(&file).unwrap(), Value::Int(1));
}

#[test]
fn test_invoker_reenters_the_machine() {
    // A host function that calls its argument twice through the invoker
    // pool.
    let mut engine = Engine::new();
    engine.register_fn("twice", |ctx| {
        let callable = ctx.args.first().cloned().unwrap_or(Value::Nil);
        let mut invoker = ctx.vm.invoker(callable);
        let first = invoker.invoke(vec![Value::Int(1)], vec![])?;
        let second = invoker.invoke(vec![first], vec![])?;
        Ok(second)
    });
    // inc := func(n){ return n + 1 }; return twice(inc)
    let inc = func(&["n"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::ident("n"),
        Expr::int(1),
    )])]);
    let result = run(&mut engine, vec![
        Stmt::define("inc", inc),
        Stmt::ret(vec![Expr::call(Expr::ident("twice"), vec![Expr::ident("inc")])]),
    ]);
    assert_eq!(result, Value::Int(3));
}

#[test]
fn test_index_get_proxy_calls_handler() {
    use quill::{HostFunction, IndexProxy};
    use std::sync::Arc;

    // p[i] answers i * 10 through a host callback.
    let handler = Value::HostFn(HostFunction::new(
        "proxy_get",
        Arc::new(|ctx: &mut quill::CallContext<'_>| {
            match ctx.args.first() {
                Some(Value::Int(i)) => Ok(Value::Int(i * 10)),
                _ => Ok(Value::Nil),
            }
        }),
    ));
    let mut engine = Engine::new();
    engine.set_global("p", Value::GetProxy(Arc::new(IndexProxy { handler })));
    let result = run(&mut engine, vec![Stmt::ret(vec![Expr::index(
        Expr::ident("p"),
        Expr::int(3),
    )])]);
    assert_eq!(result, Value::Int(30));
}

#[test]
fn test_items_yields_key_value_pairs() {
    // return items({a: 1})[0]["key"]
    let result = run_fresh(vec![Stmt::ret(vec![Expr::index(
        Expr::index(
            Expr::call(Expr::ident("items"), vec![Expr::dict(vec![("a", Expr::int(1))])]),
            Expr::int(0),
        ),
        Expr::str("key"),
    )])]);
    assert_eq!(result, Value::str("a"));
}

#[test]
fn test_wrap_builds_partial_application() {
    // add := func(a, b){ return a + b }
    // add5 := wrap(add, 5); return add5(3)
    let add = func(&["a", "b"], vec![Stmt::ret(vec![Expr::binary(
        BinaryOp::Add,
        Expr::ident("a"),
        Expr::ident("b"),
    )])]);
    let result = run_fresh(vec![
        Stmt::define("add", add),
        Stmt::define("add5", Expr::call(Expr::ident("wrap"), vec![
            Expr::ident("add"),
            Expr::int(5),
        ])),
        Stmt::ret(vec![Expr::call(Expr::ident("add5"), vec![Expr::int(3)])]),
    ]);
    assert_eq!(result, Value::Int(8));
}
