use quill::ast::{Expr, File, Stmt};
use quill::{Engine, Value};
use quill_macros::host_fn;

/// Add two numbers together.
///
/// Args:
///     a: First number
///     b: Second number
#[host_fn]
fn add(a: i64, b: i64) -> i64 {
    a + b
}

/// Greet someone, with an optional salutation.
///
/// Args:
///     name: Who to greet
///     salutation: Overrides the default "Hello"
#[host_fn]
fn greet(name: String, salutation: Option<String>) -> String {
    format!("{}, {}!", salutation.unwrap_or_else(|| "Hello".to_string()), name)
}

#[test]
fn test_macro_generates_metadata() {
    let info = &*add::INFO;
    assert_eq!(info.name, "add");
    assert_eq!(info.description, "Add two numbers together.");
    assert_eq!(info.signature(), "add(a: int, b: int) -> int");
    assert_eq!(info.args[0].description, "First number");

    let info = &*greet::INFO;
    assert_eq!(info.signature(), "greet(name: string, salutation?: string) -> string");
}

#[test]
fn test_macro_call_converts_arguments() {
    let result = add::call(vec![Value::Int(2), Value::Int(3)]).unwrap();
    assert_eq!(result, Value::Int(5));

    let err = add::call(vec![Value::Int(2), Value::str("x")]).unwrap_err();
    assert_eq!(err.name, "TypeError");

    let err = add::call(vec![Value::Int(2)]).unwrap_err();
    assert_eq!(err.name, "WrongNumArgumentsError");
}

#[test]
fn test_macro_optional_argument() {
    let result = greet::call(vec![Value::str("Ada")]).unwrap();
    assert_eq!(result, Value::str("Hello, Ada!"));

    let result = greet::call(vec![Value::str("Ada"), Value::str("Hi")]).unwrap();
    assert_eq!(result, Value::str("Hi, Ada!"));
}

#[test]
fn test_registered_macro_fn_is_callable_from_script() {
    let mut engine = Engine::new();
    engine.add(add::HostFn);

    let file = File::new(vec![Stmt::ret(vec![Expr::call(Expr::ident("add"), vec![
        Expr::int(20),
        Expr::int(22),
    ])])]);
    assert_eq!(engine.run(&file).unwrap(), Value::Int(42));
    assert!(engine.describe().contains("func add(a: int, b: int) -> int"));
}
