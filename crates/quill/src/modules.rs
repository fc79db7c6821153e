//! Importable modules.
//!
//! A [`ModuleMap`] maps a module name to one of three entry kinds: an AST
//! (compiled and executed once, result cached in a module slot), a
//! pre-built value (shared as-is), or an already-compiled body. The
//! [`ModuleBuilder`] is the host-facing way to assemble value modules out
//! of constants and native functions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::File;
use crate::bytecode::CompiledFunction;
use crate::value::{HostFnImpl, HostFunction, Value, ValueMap};

#[derive(Debug, Clone)]
pub enum ModuleEntry {
    /// Source AST: compiled with the importing program, executed on first
    /// import.
    Ast(File),
    /// A pre-built value, typically a dict of exports.
    Value(Value),
    /// A compiled module body.
    Compiled(Arc<CompiledFunction>),
}

/// The importable-module table handed to the compiler.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    entries: HashMap<String, ModuleEntry>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.entries.get(name)
    }

    pub fn add_ast(&mut self, name: impl Into<String>, ast: File) -> &mut Self {
        self.entries.insert(name.into(), ModuleEntry::Ast(ast));
        self
    }

    pub fn add_value(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.entries.insert(name.into(), ModuleEntry::Value(value));
        self
    }

    pub fn add_compiled(
        &mut self,
        name: impl Into<String>,
        compiled: Arc<CompiledFunction>,
    ) -> &mut Self {
        self.entries.insert(name.into(), ModuleEntry::Compiled(compiled));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Builder for value modules.
///
/// # Example
///
/// ```
/// use quill::{Engine, ModuleBuilder, Value};
///
/// let mut engine = Engine::new();
/// engine.module("mymod", |m| {
///     m.constant("VERSION", Value::str("1.0"));
///     m.function("double", |ctx| {
///         let x = match ctx.args.first() {
///             Some(Value::Int(v)) => *v,
///             _ => 0,
///         };
///         Ok(Value::Int(x * 2))
///     });
/// });
/// ```
pub struct ModuleBuilder {
    name: String,
    exports: ValueMap,
}

impl ModuleBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exports: ValueMap::new(),
        }
    }

    /// Export a constant value.
    pub fn constant(&mut self, name: &str, value: Value) {
        self.exports.insert(name.to_string(), value);
    }

    /// Export a native function, callable as `mod.name(args)`.
    pub fn function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut crate::vm::CallContext<'_>) -> Result<Value, crate::value::ErrorValue>
            + Send
            + Sync
            + 'static,
    {
        let full_name = format!("{}.{}", self.name, name);
        self.exports.insert(
            name.to_string(),
            Value::HostFn(HostFunction::new(full_name, Arc::new(f) as HostFnImpl)),
        );
    }

    pub(crate) fn build(self) -> Value {
        Value::dict(self.exports)
    }
}

// ---------------------------------------------------------------------------
// Builtin modules
// ---------------------------------------------------------------------------

/// Register the builtin modules on a module map.
pub fn register_builtins(map: &mut ModuleMap) {
    register_strings(map);
    #[cfg(feature = "serde")]
    register_json(map);
}

fn register_strings(map: &mut ModuleMap) {
    let mut builder = ModuleBuilder::new("strings");
    builder.function("repeat", |ctx| {
        let (s, n) = match (ctx.args.first(), ctx.args.get(1)) {
            (Some(Value::Str(s)), Some(Value::Int(n))) => (s.clone(), (*n).max(0) as usize),
            _ => {
                return Err(crate::value::ErrorValue::type_error(
                    "strings.repeat(string, int)",
                ));
            }
        };
        Ok(Value::str(s.repeat(n)))
    });
    builder.function("fields", |ctx| {
        match ctx.args.first() {
            Some(Value::Str(s)) => Ok(Value::array(
                s.split_whitespace().map(|p| Value::str(p.to_string())).collect(),
            )),
            _ => Err(crate::value::ErrorValue::type_error("strings.fields(string)")),
        }
    });
    builder.function("padLeft", |ctx| {
        let (s, width) = match (ctx.args.first(), ctx.args.get(1)) {
            (Some(Value::Str(s)), Some(Value::Int(n))) => (s.clone(), (*n).max(0) as usize),
            _ => {
                return Err(crate::value::ErrorValue::type_error(
                    "strings.padLeft(string, int)",
                ));
            }
        };
        let mut out = String::new();
        for _ in s.chars().count()..width {
            out.push(' ');
        }
        out.push_str(&s);
        Ok(Value::str(out))
    });
    map.add_value("strings", builder.build());
}

#[cfg(feature = "serde")]
fn register_json(map: &mut ModuleMap) {
    let mut builder = ModuleBuilder::new("json");
    builder.function("decode", |ctx| {
        let s = match ctx.args.first() {
            Some(Value::Str(s) | Value::RawStr(s)) => s.clone(),
            _ => return Err(crate::value::ErrorValue::type_error("json.decode(string)")),
        };
        match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(v) => Ok(json_to_value(&v)),
            Err(e) => Err(crate::value::ErrorValue::new("error", format!("invalid json: {}", e))),
        }
    });
    builder.function("encode", |ctx| {
        let v = ctx.args.first().cloned().unwrap_or(Value::Nil);
        let json = value_to_json(&v);
        match serde_json::to_string(&json) {
            Ok(s) => Ok(Value::str(s)),
            Err(e) => Err(crate::value::ErrorValue::new("error", format!("encode failed: {}", e))),
        }
    });
    map.add_value("json", builder.build());
}

#[cfg(feature = "serde")]
fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(obj) => Value::dict(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

#[cfg(feature = "serde")]
fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) | Value::Flag(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Uint(u) => serde_json::Value::Number((*u).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Decimal(d) => serde_json::Value::String(d.to_string()),
        Value::Char(c) => serde_json::Value::String(c.to_string()),
        Value::Str(s) | Value::RawStr(s) => serde_json::Value::String(s.to_string()),
        Value::Array(items) => {
            serde_json::Value::Array(items.read().iter().map(value_to_json).collect())
        }
        Value::Dict(map) | Value::SyncDict(map) => serde_json::Value::Object(
            map.read()
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        other => serde_json::Value::String(other.to_print_string()),
    }
}
