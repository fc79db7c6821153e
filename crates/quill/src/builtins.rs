//! The builtin function table.
//!
//! Builtins are addressed by index (`OpGetBuiltin`) and resolved by name
//! through [`lookup`] when the symbol table finds nothing else. The `pure`
//! flag marks the closed subset the optimizer may execute during partial
//! evaluation: functions of their arguments alone, no machine state, no
//! re-entry into user code.
//!
//! `:makeArray` is private (the leading colon is not a legal identifier):
//! only the compiler calls it, to normalize the right side of a
//! destructuring assignment into a fixed-length array.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::value::{CallWrapper, ErrorValue, Obj, ObjectType, Value, ValueMap, shared};
use crate::vm::CallContext;

/// One entry of the static builtin table.
pub struct BuiltinDef {
    pub name: &'static str,
    pub func: crate::value::NativeFn,
    /// Eligible for optimizer partial evaluation.
    pub pure: bool,
}

impl std::fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuiltinDef({})", self.name)
    }
}

macro_rules! builtin_table {
    ($(($name:literal, $func:ident, $pure:expr),)*) => {
        pub static BUILTINS: &[BuiltinDef] = &[
            $(BuiltinDef { name: $name, func: $func, pure: $pure },)*
        ];
    };
}

builtin_table![
    (":makeArray", make_array, true),
    ("error", error_fn, false),
    ("typeName", type_name, true),
    ("len", len, true),
    ("append", append, false),
    ("delete", delete, false),
    ("copy", copy, false),
    ("dcopy", dcopy, false),
    ("contains", contains, true),
    ("string", string_fn, true),
    ("int", int_fn, true),
    ("uint", uint_fn, true),
    ("float", float_fn, true),
    ("decimal", decimal_fn, true),
    ("char", char_fn, true),
    ("bool", bool_fn, true),
    ("bytes", bytes_fn, true),
    ("chars", chars_fn, true),
    ("buffer", buffer_fn, true),
    ("keys", keys_fn, true),
    ("values", values_fn, true),
    ("items", items_fn, true),
    ("keyValue", key_value_fn, true),
    ("sprintf", sprintf_fn, true),
    ("isError", is_error, true),
    ("isInt", is_int, true),
    ("isUint", is_uint, true),
    ("isFloat", is_float, true),
    ("isDecimal", is_decimal, true),
    ("isBool", is_bool, true),
    ("isChar", is_char, true),
    ("isNil", is_nil, true),
    ("isString", is_string, true),
    ("isBytes", is_bytes, true),
    ("isArray", is_array, true),
    ("isDict", is_dict, true),
    ("isSyncDict", is_sync_dict, true),
    ("isFunction", is_function, true),
    ("isCallable", is_callable, true),
    ("isIterable", is_iterable, true),
    ("print", print_fn, false),
    ("println", println_fn, false),
    ("printf", printf_fn, false),
    ("sort", sort_fn, false),
    ("sortReverse", sort_reverse_fn, false),
    ("map", map_fn, false),
    ("filter", filter_fn, false),
    ("reduce", reduce_fn, false),
    ("each", each_fn, false),
    ("range", range_fn, false),
    ("newType", new_type, false),
    ("wrap", wrap_fn, false),
    ("obstart", obstart, false),
    ("obend", obend, false),
    ("flush", flush_fn, false),
    ("vmPushWriter", vm_push_writer, false),
    ("vmPopWriter", vm_pop_writer, false),
];

static BY_NAME: Lazy<HashMap<&'static str, u16>> = Lazy::new(|| {
    BUILTINS
        .iter()
        .enumerate()
        .map(|(i, def)| (def.name, i as u16))
        .collect()
});

/// Resolve a builtin name to its table index. Private names (leading
/// colon) are excluded: scripts cannot reference them.
pub fn lookup(name: &str) -> Option<u16> {
    if name.starts_with(':') {
        return None;
    }
    BY_NAME.get(name).copied()
}

/// The table index of a builtin, private ones included; panics on unknown
/// names (compiler-internal use only).
pub fn index_of(name: &str) -> u16 {
    *BY_NAME.get(name).unwrap_or_else(|| panic!("unknown builtin {:?}", name))
}

/// Whether the builtin at `index` is eligible for optimizer evaluation.
pub fn is_pure(index: u16) -> bool {
    BUILTINS.get(index as usize).is_some_and(|d| d.pure)
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn want(ctx: &CallContext<'_>, name: &str, min: usize, max: usize) -> Result<(), ErrorValue> {
    let n = ctx.args.len();
    if n < min || n > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{}..{}", min, max)
        };
        return Err(ErrorValue::wrong_num_arguments(format!(
            "{}() expects {} argument(s), got {}",
            name, expected, n
        )));
    }
    Ok(())
}

fn str_arg<'a>(ctx: &'a CallContext<'_>, i: usize, name: &str) -> Result<&'a str, ErrorValue> {
    match ctx.args.get(i) {
        Some(Value::Str(s) | Value::RawStr(s)) => Ok(s.as_ref()),
        Some(other) => Err(ErrorValue::type_error(format!(
            "{}() argument {} must be a string, not {}",
            name,
            i + 1,
            other.type_name()
        ))),
        None => Err(ErrorValue::wrong_num_arguments(format!(
            "{}() missing argument {}",
            name,
            i + 1
        ))),
    }
}

// ---------------------------------------------------------------------------
// Destructuring support
// ---------------------------------------------------------------------------

/// `:makeArray(n, v)` — normalize any value into an n-length array:
/// arrays are padded or truncated, other values land in slot zero.
fn make_array(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, ":makeArray", 2, 2)?;
    let n = match ctx.args[0] {
        Value::Int(v) if v >= 0 => v as usize,
        _ => return Err(ErrorValue::type_error(":makeArray() count must be a non-negative int")),
    };
    let mut items = match &ctx.args[1] {
        Value::Array(existing) => existing.read().clone(),
        Value::Nil => Vec::new(),
        other => vec![other.clone()],
    };
    items.resize(n, Value::Nil);
    Ok(Value::array(items))
}

// ---------------------------------------------------------------------------
// Values and types
// ---------------------------------------------------------------------------

fn error_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "error", 1, 1)?;
    Ok(Value::error(ctx.args[0].to_print_string()))
}

fn type_name(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "typeName", 1, 1)?;
    Ok(Value::str(ctx.args[0].type_name().into_owned()))
}

fn len(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "len", 1, 1)?;
    match ctx.args[0].len() {
        Some(n) => Ok(Value::Int(n as i64)),
        None => Err(ErrorValue::type_error(format!(
            "len() of {}",
            ctx.args[0].type_name()
        ))),
    }
}

fn append(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    if ctx.args.is_empty() {
        return Err(ErrorValue::wrong_num_arguments("append() expects at least 1 argument"));
    }
    let target = ctx.args[0].clone();
    let rest = &ctx.args[1..];
    match &target {
        Value::Nil => Ok(Value::array(rest.to_vec())),
        Value::Array(items) => {
            items.write().extend(rest.iter().cloned());
            Ok(target.clone())
        }
        Value::Bytes(data) => {
            let mut data = data.write();
            for item in rest {
                match item {
                    Value::Int(v) if (0..=255).contains(v) => data.push(*v as u8),
                    Value::Uint(v) if *v <= 255 => data.push(*v as u8),
                    Value::Bytes(more) => {
                        let more = more.read().clone();
                        data.extend_from_slice(&more);
                    }
                    other => {
                        return Err(ErrorValue::type_error(format!(
                            "cannot append {} to bytes",
                            other.type_name()
                        )));
                    }
                }
            }
            drop(data);
            Ok(target.clone())
        }
        Value::KeyValueArray(items) => {
            let mut items = items.write();
            for item in rest {
                match item {
                    Value::KeyValue(pair) => items.push((pair.0.clone(), pair.1.clone())),
                    other => {
                        return Err(ErrorValue::type_error(format!(
                            "cannot append {} to keyValueArray",
                            other.type_name()
                        )));
                    }
                }
            }
            drop(items);
            Ok(target.clone())
        }
        other => Err(ErrorValue::type_error(format!(
            "append() target must be an array, not {}",
            other.type_name()
        ))),
    }
}

fn delete(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "delete", 2, 2)?;
    let (target, key) = (ctx.args[0].clone(), ctx.args[1].clone());
    ctx.vm.index_delete_dispatch(&target, &key)?;
    Ok(Value::Nil)
}

fn copy(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "copy", 1, 1)?;
    Ok(ctx.args[0].copy())
}

fn dcopy(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "dcopy", 1, 1)?;
    Ok(ctx.args[0].deep_copy())
}

fn contains(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "contains", 2, 2)?;
    let (container, needle) = (&ctx.args[0], &ctx.args[1]);
    let found = match container {
        Value::Array(items) => items.read().iter().any(|v| v.equal(needle)),
        Value::Dict(map) | Value::SyncDict(map) => match needle {
            Value::Str(s) | Value::RawStr(s) => map.read().contains_key(s.as_ref()),
            _ => false,
        },
        Value::Str(s) | Value::RawStr(s) => match needle {
            Value::Str(n) | Value::RawStr(n) => s.contains(n.as_ref()),
            Value::Char(c) => s.contains(*c),
            _ => false,
        },
        Value::Bytes(data) => match needle {
            Value::Int(v) if (0..=255).contains(v) => data.read().contains(&(*v as u8)),
            _ => false,
        },
        other => {
            return Err(ErrorValue::type_error(format!(
                "contains() container must be iterable, not {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Bool(found))
}

// ---------------------------------------------------------------------------
// Coercions
// ---------------------------------------------------------------------------

fn string_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "string", 1, 1)?;
    match &ctx.args[0] {
        Value::Bytes(data) => Ok(Value::str(String::from_utf8_lossy(&data.read()).into_owned())),
        other => Ok(Value::str(other.to_print_string())),
    }
}

fn int_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "int", 1, 1)?;
    let v = match &ctx.args[0] {
        Value::Int(v) => *v,
        Value::Uint(v) if *v <= i64::MAX as u64 => *v as i64,
        Value::Float(f) => *f as i64,
        Value::Decimal(d) => d
            .to_i64()
            .ok_or_else(|| ErrorValue::type_error("decimal out of int range"))?,
        Value::Char(c) => *c as i64,
        Value::Bool(b) | Value::Flag(b) => *b as i64,
        Value::Str(s) | Value::RawStr(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ErrorValue::type_error(format!("cannot parse {:?} as int", s)))?,
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to int",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(v))
}

fn uint_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "uint", 1, 1)?;
    let v = match &ctx.args[0] {
        Value::Uint(v) => *v,
        Value::Int(v) => *v as u64,
        Value::Float(f) => *f as u64,
        Value::Char(c) => *c as u64,
        Value::Bool(b) | Value::Flag(b) => *b as u64,
        Value::Str(s) | Value::RawStr(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| ErrorValue::type_error(format!("cannot parse {:?} as uint", s)))?,
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to uint",
                other.type_name()
            )));
        }
    };
    Ok(Value::Uint(v))
}

fn float_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "float", 1, 1)?;
    let v = match &ctx.args[0] {
        Value::Float(f) => *f,
        Value::Int(v) => *v as f64,
        Value::Uint(v) => *v as f64,
        Value::Decimal(d) => d.to_f64(),
        Value::Bool(b) | Value::Flag(b) => *b as u8 as f64,
        Value::Str(s) | Value::RawStr(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ErrorValue::type_error(format!("cannot parse {:?} as float", s)))?,
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to float",
                other.type_name()
            )));
        }
    };
    Ok(Value::Float(v))
}

fn decimal_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "decimal", 1, 1)?;
    let v = match &ctx.args[0] {
        Value::Decimal(d) => d.clone(),
        Value::Int(v) => crate::decimal::Decimal::from(*v),
        Value::Uint(v) => crate::decimal::Decimal::from(*v),
        Value::Float(f) => crate::decimal::Decimal::try_from(*f)
            .map_err(|_| ErrorValue::type_error("cannot convert non-finite float to decimal"))?,
        Value::Str(s) | Value::RawStr(s) => s
            .parse()
            .map_err(|_| ErrorValue::type_error(format!("cannot parse {:?} as decimal", s)))?,
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to decimal",
                other.type_name()
            )));
        }
    };
    Ok(Value::Decimal(v))
}

fn char_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "char", 1, 1)?;
    let c = match &ctx.args[0] {
        Value::Char(c) => *c,
        Value::Int(v) => u32::try_from(*v)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ErrorValue::type_error("int out of char range"))?,
        Value::Uint(v) => u32::try_from(*v)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ErrorValue::type_error("uint out of char range"))?,
        Value::Str(s) | Value::RawStr(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(ErrorValue::type_error("char() string must hold one character")),
            }
        }
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to char",
                other.type_name()
            )));
        }
    };
    Ok(Value::Char(c))
}

fn bool_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "bool", 1, 1)?;
    Ok(Value::Bool(!ctx.args[0].is_falsy()))
}

fn bytes_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "bytes", 1, 1)?;
    let data = match &ctx.args[0] {
        Value::Bytes(data) => data.read().clone(),
        Value::Str(s) | Value::RawStr(s) => s.as_bytes().to_vec(),
        Value::Int(n) if *n >= 0 => vec![0u8; *n as usize],
        Value::Array(items) => {
            let items = items.read();
            let mut data = Vec::with_capacity(items.len());
            for item in items.iter() {
                match item {
                    Value::Int(v) if (0..=255).contains(v) => data.push(*v as u8),
                    Value::Uint(v) if *v <= 255 => data.push(*v as u8),
                    other => {
                        return Err(ErrorValue::type_error(format!(
                            "bytes() array element must be a byte, not {}",
                            other.type_name()
                        )));
                    }
                }
            }
            data
        }
        other => {
            return Err(ErrorValue::type_error(format!(
                "cannot convert {} to bytes",
                other.type_name()
            )));
        }
    };
    Ok(Value::bytes(data))
}

fn chars_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "chars", 1, 1)?;
    let s = str_arg(ctx, 0, "chars")?;
    Ok(Value::array(s.chars().map(Value::Char).collect()))
}

fn buffer_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "buffer", 0, 1)?;
    let cap = match ctx.args.first() {
        Some(Value::Int(n)) if *n >= 0 => *n as usize,
        Some(Value::Uint(n)) => *n as usize,
        None => 0,
        Some(other) => {
            return Err(ErrorValue::type_error(format!(
                "buffer() size must be an int, not {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Bytes(shared(Vec::with_capacity(cap))))
}

// ---------------------------------------------------------------------------
// Mapping accessors
// ---------------------------------------------------------------------------

fn keys_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "keys", 1, 1)?;
    let keys = match &ctx.args[0] {
        Value::Dict(map) | Value::SyncDict(map) => {
            map.read().keys().map(|k| Value::str(k.clone())).collect()
        }
        Value::Array(items) => (0..items.read().len() as i64).map(Value::Int).collect(),
        Value::KeyValueArray(items) => {
            items.read().iter().map(|(k, _)| k.clone()).collect()
        }
        other => {
            return Err(ErrorValue::type_error(format!(
                "keys() of {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::array(keys))
}

fn values_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "values", 1, 1)?;
    let values = match &ctx.args[0] {
        Value::Dict(map) | Value::SyncDict(map) => map.read().values().cloned().collect(),
        Value::Array(items) => items.read().clone(),
        Value::KeyValueArray(items) => {
            items.read().iter().map(|(_, v)| v.clone()).collect()
        }
        other => {
            return Err(ErrorValue::type_error(format!(
                "values() of {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::array(values))
}

fn items_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "items", 1, 1)?;
    let pairs: Vec<(Value, Value)> = match &ctx.args[0] {
        Value::Dict(map) | Value::SyncDict(map) => map
            .read()
            .iter()
            .map(|(k, v)| (Value::str(k.clone()), v.clone()))
            .collect(),
        Value::KeyValueArray(items) => items.read().clone(),
        Value::Array(items) => items
            .read()
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Int(i as i64), v.clone()))
            .collect(),
        other => {
            return Err(ErrorValue::type_error(format!(
                "items() of {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::KeyValueArray(shared(pairs)))
}

fn key_value_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "keyValue", 2, 2)?;
    Ok(Value::key_value(ctx.args[0].clone(), ctx.args[1].clone()))
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// The `%`-verb formatter shared by `sprintf` and `printf`. Verbs: `%v`
/// display, `%s` print string, `%q` quoted, `%d` `%f` `%t` typed, `%%`
/// literal.
pub(crate) fn format_values(fmt: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut next = 0;
    let mut chars = fmt.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(verb) = chars.next() else {
            out.push('%');
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args.get(next).cloned().unwrap_or(Value::Nil);
        next += 1;
        match verb {
            'v' => out.push_str(&arg.to_string()),
            's' => out.push_str(&arg.to_print_string()),
            'q' => out.push_str(&format!("{:?}", arg.to_print_string())),
            'd' => match arg {
                Value::Int(v) => out.push_str(&v.to_string()),
                Value::Uint(v) => out.push_str(&v.to_string()),
                Value::Char(c) => out.push_str(&(c as u32).to_string()),
                other => out.push_str(&format!("%!d({})", other)),
            },
            'f' => match arg {
                Value::Float(v) => out.push_str(&format!("{:.6}", v)),
                Value::Int(v) => out.push_str(&format!("{:.6}", v as f64)),
                other => out.push_str(&format!("%!f({})", other)),
            },
            't' => out.push_str(if arg.is_falsy() { "false" } else { "true" }),
            other => {
                out.push('%');
                out.push(other);
                next -= 1;
            }
        }
    }
    out
}

fn sprintf_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    if ctx.args.is_empty() {
        return Err(ErrorValue::wrong_num_arguments("sprintf() expects at least 1 argument"));
    }
    let fmt = str_arg(ctx, 0, "sprintf")?;
    Ok(Value::str(format_values(fmt, &ctx.args[1..])))
}

fn printf_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    if ctx.args.is_empty() {
        return Err(ErrorValue::wrong_num_arguments("printf() expects at least 1 argument"));
    }
    let fmt = str_arg(ctx, 0, "printf")?.to_string();
    let text = format_values(&fmt, &ctx.args[1..]);
    ctx.vm.write_out(text.as_bytes())?;
    Ok(Value::Nil)
}

fn print_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    let text = ctx
        .args
        .iter()
        .map(Value::to_print_string)
        .collect::<Vec<_>>()
        .join(" ");
    ctx.vm.write_out(text.as_bytes())?;
    Ok(Value::Nil)
}

fn println_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    let mut text = ctx
        .args
        .iter()
        .map(Value::to_print_string)
        .collect::<Vec<_>>()
        .join(" ");
    text.push('\n');
    ctx.vm.write_out(text.as_bytes())?;
    Ok(Value::Nil)
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

fn is_error(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "isError", 1, 2)?;
    let value = &ctx.args[0];
    match ctx.args.get(1) {
        None => Ok(Value::Bool(matches!(
            value,
            Value::Error(_) | Value::RuntimeError(_)
        ))),
        Some(kind) => {
            let err = match value {
                Value::Error(e) => e.clone(),
                Value::RuntimeError(e) => std::sync::Arc::new(e.error.clone()),
                _ => return Ok(Value::Bool(false)),
            };
            Ok(Value::Bool(err.is_kind(kind)))
        }
    }
}

macro_rules! predicate {
    ($func:ident, $name:literal, $pattern:pat) => {
        fn $func(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
            want(ctx, $name, 1, 1)?;
            Ok(Value::Bool(matches!(&ctx.args[0], $pattern)))
        }
    };
}

predicate!(is_int, "isInt", Value::Int(_));
predicate!(is_uint, "isUint", Value::Uint(_));
predicate!(is_float, "isFloat", Value::Float(_));
predicate!(is_decimal, "isDecimal", Value::Decimal(_));
predicate!(is_bool, "isBool", Value::Bool(_) | Value::Flag(_));
predicate!(is_char, "isChar", Value::Char(_));
predicate!(is_nil, "isNil", Value::Nil);
predicate!(is_string, "isString", Value::Str(_) | Value::RawStr(_));
predicate!(is_bytes, "isBytes", Value::Bytes(_));
predicate!(is_array, "isArray", Value::Array(_));
predicate!(is_dict, "isDict", Value::Dict(_) | Value::SyncDict(_));
predicate!(is_sync_dict, "isSyncDict", Value::SyncDict(_));
predicate!(
    is_function,
    "isFunction",
    Value::Compiled(_) | Value::Closure(_) | Value::HostFn(_)
);

fn is_callable(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "isCallable", 1, 1)?;
    Ok(Value::Bool(ctx.args[0].is_callable()))
}

fn is_iterable(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "isIterable", 1, 1)?;
    Ok(Value::Bool(ctx.args[0].iterate().is_some()))
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

fn sort_impl(ctx: &mut CallContext<'_>, name: &str, reverse: bool) -> Result<Value, ErrorValue> {
    want(ctx, name, 1, 1)?;
    match &ctx.args[0] {
        Value::Array(items) => {
            let mut snapshot = items.read().clone();
            let mut failed = None;
            snapshot.sort_by(|a, b| {
                match crate::operators::compare(crate::ast::BinaryOp::Less, a, b) {
                    Ok(ord) => ord,
                    Err(e) => {
                        failed.get_or_insert(e);
                        std::cmp::Ordering::Equal
                    }
                }
            });
            if let Some(err) = failed {
                return Err(err);
            }
            if reverse {
                snapshot.reverse();
            }
            *items.write() = snapshot;
            Ok(ctx.args[0].clone())
        }
        Value::Str(s) => {
            let mut chars: Vec<char> = s.chars().collect();
            chars.sort_unstable();
            if reverse {
                chars.reverse();
            }
            Ok(Value::str(chars.into_iter().collect::<String>()))
        }
        other => Err(ErrorValue::type_error(format!(
            "{}() of {}",
            name,
            other.type_name()
        ))),
    }
}

fn sort_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    sort_impl(ctx, "sort", false)
}

fn sort_reverse_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    sort_impl(ctx, "sortReverse", true)
}

// ---------------------------------------------------------------------------
// Functional helpers (re-enter the machine)
// ---------------------------------------------------------------------------

fn iterable_pairs(value: &Value) -> Result<Vec<(Value, Value)>, ErrorValue> {
    let mut iter = value
        .iterate()
        .ok_or_else(|| ErrorValue::not_iterable(value.type_name()))?;
    let mut pairs = Vec::new();
    while iter.advance() {
        pairs.push((iter.key(), iter.value()?));
    }
    Ok(pairs)
}

fn map_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "map", 2, 2)?;
    let callee = ctx.args[1].clone();
    let pairs = iterable_pairs(&ctx.args[0])?;
    let mut out = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        out.push(ctx.vm.invoke_value(&callee, vec![value, key])?);
    }
    Ok(Value::array(out))
}

fn filter_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "filter", 2, 2)?;
    let callee = ctx.args[1].clone();
    let pairs = iterable_pairs(&ctx.args[0])?;
    let mut out = Vec::new();
    for (key, value) in pairs {
        let keep = ctx.vm.invoke_value(&callee, vec![value.clone(), key])?;
        if !keep.is_falsy() {
            out.push(value);
        }
    }
    Ok(Value::array(out))
}

fn reduce_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "reduce", 2, 3)?;
    let callee = ctx.args[1].clone();
    let pairs = iterable_pairs(&ctx.args[0])?;
    let mut pairs = pairs.into_iter();
    let mut acc = match ctx.args.get(2) {
        Some(initial) => initial.clone(),
        None => match pairs.next() {
            Some((_, v)) => v,
            None => return Err(ErrorValue::type_error("reduce() of empty iterable with no initial value")),
        },
    };
    for (key, value) in pairs {
        acc = ctx.vm.invoke_value(&callee, vec![acc, value, key])?;
    }
    Ok(acc)
}

fn each_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "each", 2, 2)?;
    let callee = ctx.args[1].clone();
    for (key, value) in iterable_pairs(&ctx.args[0])? {
        ctx.vm.invoke_value(&callee, vec![value, key])?;
    }
    Ok(Value::Nil)
}

fn range_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "range", 1, 3)?;
    let get = |i: usize| -> Result<i64, ErrorValue> {
        match ctx.args.get(i) {
            Some(Value::Int(v)) => Ok(*v),
            Some(other) => Err(ErrorValue::type_error(format!(
                "range() argument must be an int, not {}",
                other.type_name()
            ))),
            None => unreachable!(),
        }
    };
    let (start, stop, step) = match ctx.args.len() {
        1 => (0, get(0)?, 1),
        2 => (get(0)?, get(1)?, 1),
        _ => (get(0)?, get(1)?, get(2)?),
    };
    if step == 0 {
        return Err(ErrorValue::type_error("range() step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut v = start;
    while (step > 0 && v < stop) || (step < 0 && v > stop) {
        out.push(Value::Int(v));
        v += step;
    }
    Ok(Value::array(out))
}

fn wrap_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    if ctx.args.is_empty() {
        return Err(ErrorValue::wrong_num_arguments("wrap() expects at least 1 argument"));
    }
    let callee = ctx.args[0].clone();
    if !callee.is_callable() {
        return Err(ErrorValue::not_callable(callee.type_name()));
    }
    Ok(Value::CallWrapper(std::sync::Arc::new(CallWrapper {
        callee,
        args: ctx.args[1..].to_vec(),
        named: ctx.named.clone(),
    })))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// `newType(name, methods=…, extends=…)` — build an object type. Calling
/// the type constructs instances; `extends` entries are searched for
/// methods after the type's own table.
fn new_type(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "newType", 1, 3)?;
    let name = str_arg(ctx, 0, "newType")?.to_string();

    let mut methods = ValueMap::new();
    let mut extends = Vec::new();
    let mut positional = ctx.args[1..].iter();
    let mut named: HashMap<&str, &Value> =
        ctx.named.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let methods_arg = named.remove("methods").or_else(|| positional.next());
    let extends_arg = named.remove("extends").or_else(|| positional.next());

    if let Some(value) = methods_arg {
        match value {
            Value::Dict(map) => methods = map.read().clone(),
            Value::Nil => {}
            other => {
                return Err(ErrorValue::type_error(format!(
                    "newType() methods must be a dict, not {}",
                    other.type_name()
                )));
            }
        }
    }
    if let Some(value) = extends_arg {
        match value {
            Value::Array(items) => {
                for item in items.read().iter() {
                    match item {
                        Value::ObjectType(t) => extends.push(t.clone()),
                        other => {
                            return Err(ErrorValue::type_error(format!(
                                "newType() extends entry must be a type, not {}",
                                other.type_name()
                            )));
                        }
                    }
                }
            }
            Value::Nil => {}
            other => {
                return Err(ErrorValue::type_error(format!(
                    "newType() extends must be an array, not {}",
                    other.type_name()
                )));
            }
        }
    }

    Ok(Value::ObjectType(std::sync::Arc::new(ObjectType {
        name,
        methods,
        extends,
    })))
}

/// Construct an instance of `ty` from a field dict, used by the machine
/// when an object type is called.
pub(crate) fn construct_object(
    ty: &std::sync::Arc<ObjectType>,
    args: &[Value],
) -> Result<Value, ErrorValue> {
    let fields = match args.first() {
        None | Some(Value::Nil) => ValueMap::new(),
        Some(Value::Dict(map)) => map.read().clone(),
        Some(other) => {
            return Err(ErrorValue::type_error(format!(
                "{}() fields must be a dict, not {}",
                ty.name,
                other.type_name()
            )));
        }
    };
    Ok(Value::Obj(std::sync::Arc::new(Obj {
        ty: ty.clone(),
        fields: shared(fields),
    })))
}

// ---------------------------------------------------------------------------
// Output buffering and the writer chain
// ---------------------------------------------------------------------------

fn obstart(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    ctx.vm.push_buffer_writer();
    Ok(Value::Nil)
}

fn obend(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    match ctx.vm.pop_buffer_writer() {
        Some(data) => Ok(Value::str(String::from_utf8_lossy(&data).into_owned())),
        None => Err(ErrorValue::type_error("obend() without obstart()")),
    }
}

fn flush_fn(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    ctx.vm.flush_out()?;
    Ok(Value::Nil)
}

fn vm_push_writer(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    want(ctx, "vmPushWriter", 1, 1)?;
    match &ctx.args[0] {
        Value::Writer(w) => {
            ctx.vm.push_writer(w.clone());
            Ok(Value::Nil)
        }
        other => Err(ErrorValue::type_error(format!(
            "vmPushWriter() expects a writer, not {}",
            other.type_name()
        ))),
    }
}

fn vm_pop_writer(ctx: &mut CallContext<'_>) -> Result<Value, ErrorValue> {
    match ctx.vm.pop_writer() {
        Some(w) => Ok(Value::Writer(w)),
        None => Err(ErrorValue::type_error("vmPopWriter() on an empty writer chain")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_excludes_private_names() {
        assert!(lookup("len").is_some());
        assert!(lookup(":makeArray").is_none());
        assert_eq!(index_of(":makeArray"), 0);
    }

    #[test]
    fn test_allow_listed_builtins_are_pure() {
        for name in ["contains", "bool", "int", "len", "typeName", "sprintf", "keys", "buffer"] {
            assert!(is_pure(lookup(name).unwrap()), "{} should be pure", name);
        }
        for name in ["print", "append", "map", "obstart", "newType"] {
            assert!(!is_pure(lookup(name).unwrap()), "{} should not be pure", name);
        }
    }

    #[test]
    fn test_format_values() {
        let out = format_values("%s=%d (%v) %q %%", &[
            Value::str("x"),
            Value::Int(7),
            Value::from(vec![1i64, 2]),
            Value::str("hi"),
        ]);
        assert_eq!(out, "x=7 ([1, 2]) \"hi\" %");
    }
}
