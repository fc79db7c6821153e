//! The runtime value universe.
//!
//! [`Value`] is a tagged union covering every value a script can observe:
//! scalars, strings, byte buffers, containers, errors, and the callable
//! family (compiled functions, closures, builtins, host functions, partial
//! applications). Shared mutable containers (`Array`, `Dict`, `Bytes`,
//! captured-variable cells) are reference-counted `RwLock` cells, so a
//! closure and its enclosing frame observe the same storage. `SyncDict`
//! carries the same lock but is the variant documented as safe to share
//! between concurrently running machines.
//!
//! Every value answers its type name, a display string, truthiness, and
//! equality here. Operator application lives in [`crate::operators`] and
//! named-method dispatch in [`crate::methods`]; this module stays free of
//! VM state.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::CompiledFunction;
use crate::decimal::Decimal;
use crate::span::{SourceFile, Span};

/// Insertion-ordered string-keyed map: the storage behind `Dict`.
pub type ValueMap = IndexMap<String, Value>;

/// A reference-counted read/write cell.
pub type Shared<T> = Arc<RwLock<T>>;

pub(crate) fn shared<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Signature of a builtin or host-registered native function.
///
/// Native callees receive a [`CallContext`](crate::vm::CallContext) and
/// either return a value or raise an [`ErrorValue`], which the machine
/// wraps with a trace and unwinds.
pub type NativeFn =
    fn(&mut crate::vm::CallContext<'_>) -> Result<Value, ErrorValue>;

/// A host function closure (registered at runtime, unlike table builtins).
pub type HostFnImpl = Arc<
    dyn Fn(&mut crate::vm::CallContext<'_>) -> Result<Value, ErrorValue>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    /// `yes`/`no` — semantically a flag, numerically a bool.
    Flag(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Decimal(Decimal),
    Char(char),
    Str(Arc<str>),
    /// A string literal that preserves its raw source spelling.
    RawStr(Arc<str>),
    Bytes(Shared<Vec<u8>>),
    Array(Shared<Vec<Value>>),
    Dict(Shared<ValueMap>),
    /// A dict documented as shareable between machines; writers exclude
    /// readers on the same instance.
    SyncDict(Shared<ValueMap>),
    KeyValue(Arc<(Value, Value)>),
    /// Ordered pair sequence tolerating duplicate keys.
    KeyValueArray(Shared<Vec<(Value, Value)>>),
    Error(Arc<ErrorValue>),
    RuntimeError(Arc<RuntimeError>),
    /// An immutable compiled function template.
    Compiled(Arc<CompiledFunction>),
    /// A compiled function bundled with its captured cells.
    Closure(Arc<Closure>),
    /// An entry of the static builtin table.
    Builtin(&'static crate::builtins::BuiltinDef),
    /// A host-registered native function.
    HostFn(HostFunction),
    /// A partial application carrying pre-bound arguments.
    CallWrapper(Arc<CallWrapper>),
    ObjectType(Arc<ObjectType>),
    Obj(Arc<Obj>),
    /// A captured-variable cell; the sole writable handle for a captured
    /// local.
    Ptr(ObjectPtr),
    /// Callback-backed virtual objects.
    GetProxy(Arc<IndexProxy>),
    SetProxy(Arc<IndexProxy>),
    DelProxy(Arc<IndexProxy>),
    /// A live iterator (only observable while a for-in loop runs, unless a
    /// script retains it deliberately).
    Iter(Shared<ValueIter>),
    Writer(WriterHandle),
    Reader(ReaderHandle),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(shared(items))
    }

    pub fn dict(map: ValueMap) -> Self {
        Self::Dict(shared(map))
    }

    pub fn sync_dict(map: ValueMap) -> Self {
        Self::SyncDict(shared(map))
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Self::Bytes(shared(data))
    }

    pub fn key_value(key: Value, value: Value) -> Self {
        Self::KeyValue(Arc::new((key, value)))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(Arc::new(ErrorValue::new("error", message)))
    }

    /// The user-facing type name.
    pub fn type_name(&self) -> Cow<'static, str> {
        match self {
            Self::Nil => "nil".into(),
            Self::Bool(_) => "bool".into(),
            Self::Flag(_) => "flag".into(),
            Self::Int(_) => "int".into(),
            Self::Uint(_) => "uint".into(),
            Self::Float(_) => "float".into(),
            Self::Decimal(_) => "decimal".into(),
            Self::Char(_) => "char".into(),
            Self::Str(_) => "string".into(),
            Self::RawStr(_) => "rawstring".into(),
            Self::Bytes(_) => "bytes".into(),
            Self::Array(_) => "array".into(),
            Self::Dict(_) => "dict".into(),
            Self::SyncDict(_) => "syncDict".into(),
            Self::KeyValue(_) => "keyValue".into(),
            Self::KeyValueArray(_) => "keyValueArray".into(),
            Self::Error(_) | Self::RuntimeError(_) => "error".into(),
            Self::Compiled(_) => "compiledFunction".into(),
            Self::Closure(_) => "function".into(),
            Self::Builtin(_) => "builtinFunction".into(),
            Self::HostFn(_) => "function".into(),
            Self::CallWrapper(_) => "callWrapper".into(),
            Self::ObjectType(t) => format!("type:{}", t.name).into(),
            Self::Obj(o) => o.ty.name.clone().into(),
            Self::Ptr(_) => "objectPtr".into(),
            Self::GetProxy(_) => "indexGetProxy".into(),
            Self::SetProxy(_) => "indexSetProxy".into(),
            Self::DelProxy(_) => "indexDeleteProxy".into(),
            Self::Iter(_) => "iterator".into(),
            Self::Writer(_) => "writer".into(),
            Self::Reader(_) => "reader".into(),
        }
    }

    /// Truthiness: the falsy values are nil, false/no, numeric zero, NaN,
    /// the NUL char, empty strings/containers, and errors.
    pub fn is_falsy(&self) -> bool {
        match self {
            Self::Nil => true,
            Self::Bool(b) | Self::Flag(b) => !b,
            Self::Int(v) => *v == 0,
            Self::Uint(v) => *v == 0,
            Self::Float(v) => *v == 0.0 || v.is_nan(),
            Self::Decimal(d) => d.is_zero(),
            Self::Char(c) => *c == '\0',
            Self::Str(s) | Self::RawStr(s) => s.is_empty(),
            Self::Bytes(b) => b.read().is_empty(),
            Self::Array(a) => a.read().is_empty(),
            Self::Dict(d) | Self::SyncDict(d) => d.read().is_empty(),
            Self::KeyValueArray(a) => a.read().is_empty(),
            Self::Error(_) | Self::RuntimeError(_) => true,
            _ => false,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Compiled(_)
                | Self::Closure(_)
                | Self::Builtin(_)
                | Self::HostFn(_)
                | Self::CallWrapper(_)
                | Self::ObjectType(_)
        )
    }

    /// Equality with numeric coercion across int/uint/float/decimal/char,
    /// and deep equality for containers.
    pub fn equal(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a) | Flag(a), Bool(b) | Flag(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Uint(a), Uint(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Decimal(a), Decimal(b)) => a == b,
            (Int(a), Uint(b)) | (Uint(b), Int(a)) => *a >= 0 && *a as u64 == *b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => *a as f64 == *b,
            (Uint(a), Float(b)) | (Float(b), Uint(a)) => *a as f64 == *b,
            (Int(a), Char(b)) | (Char(b), Int(a)) => *a == *b as i64,
            (Uint(a), Char(b)) | (Char(b), Uint(a)) => *a == *b as u64,
            (Decimal(a), Int(b)) | (Int(b), Decimal(a)) => *a == crate::decimal::Decimal::from(*b),
            (Decimal(a), Uint(b)) | (Uint(b), Decimal(a)) => *a == crate::decimal::Decimal::from(*b),
            (Decimal(a), Float(b)) | (Float(b), Decimal(a)) => {
                crate::decimal::Decimal::try_from(*b).is_ok_and(|d| *a == d)
            }
            (Str(a) | RawStr(a), Str(b) | RawStr(b)) => a == b,
            (Bytes(a), Bytes(b)) => *a.read() == *b.read(),
            (Array(a), Array(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Dict(a) | SyncDict(a), Dict(b) | SyncDict(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.equal(w)))
            }
            (KeyValue(a), KeyValue(b)) => a.0.equal(&b.0) && a.1.equal(&b.1),
            (KeyValueArray(a), KeyValueArray(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.0.equal(&y.0) && x.1.equal(&y.1))
            }
            (Error(a), Error(b)) => Arc::ptr_eq(a, b) || (a.name == b.name && a.message == b.message),
            (RuntimeError(a), RuntimeError(b)) => Arc::ptr_eq(a, b),
            (Compiled(a), Compiled(b)) => Arc::ptr_eq(a, b),
            (Closure(a), Closure(b)) => Arc::ptr_eq(a, b),
            (Builtin(a), Builtin(b)) => a.name == b.name,
            (HostFn(a), HostFn(b)) => Arc::ptr_eq(&a.func, &b.func),
            (CallWrapper(a), CallWrapper(b)) => Arc::ptr_eq(a, b),
            (ObjectType(a), ObjectType(b)) => Arc::ptr_eq(a, b),
            (Obj(a), Obj(b)) => Arc::ptr_eq(a, b),
            (Ptr(a), Ptr(b)) => a.ptr_eq(b),
            (Writer(a), Writer(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Reader(a), Reader(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }

    /// Format the value for display output (no quotes around strings),
    /// matching what `print` writes.
    pub fn to_print_string(&self) -> String {
        match self {
            Self::Str(s) | Self::RawStr(s) => s.to_string(),
            Self::Char(c) => c.to_string(),
            other => other.to_string(),
        }
    }

    // -- Indexing --------------------------------------------------------

    /// `self[index]` for the data-backed variants. Proxy and object
    /// variants are dispatched by the machine, which can re-enter user
    /// code.
    pub fn index_get(&self, index: &Value) -> Result<Value, ErrorValue> {
        match self {
            Self::Array(items) => {
                let items = items.read();
                let idx = normalize_index(index, items.len())?;
                Ok(items.get(idx).cloned().unwrap_or(Value::Nil))
            }
            Self::Bytes(data) => {
                let data = data.read();
                let idx = normalize_index(index, data.len())?;
                Ok(data
                    .get(idx)
                    .map(|b| Value::Int(*b as i64))
                    .unwrap_or(Value::Nil))
            }
            Self::Str(s) | Self::RawStr(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(index, chars.len())?;
                Ok(chars
                    .get(idx)
                    .map(|c| Value::Char(*c))
                    .unwrap_or(Value::Nil))
            }
            Self::Dict(map) | Self::SyncDict(map) => {
                let key = index_key(index)?;
                // A missing key reads as nil rather than raising.
                Ok(map.read().get(key.as_ref()).cloned().unwrap_or(Value::Nil))
            }
            Self::KeyValue(pair) => match index_key(index)?.as_ref() {
                "key" => Ok(pair.0.clone()),
                "value" => Ok(pair.1.clone()),
                _ => Ok(Value::Nil),
            },
            Self::KeyValueArray(items) => {
                let items = items.read();
                let idx = normalize_index(index, items.len())?;
                Ok(items
                    .get(idx)
                    .map(|(k, v)| Value::key_value(k.clone(), v.clone()))
                    .unwrap_or(Value::Nil))
            }
            Self::Error(err) => match index_key(index)?.as_ref() {
                "name" => Ok(Value::str(err.name.clone())),
                "message" => Ok(Value::str(err.message.clone())),
                "cause" => Ok(err.cause.clone().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            },
            Self::RuntimeError(rt) => match index_key(index)?.as_ref() {
                "name" => Ok(Value::str(rt.error.name.clone())),
                "message" => Ok(Value::str(rt.error.message.clone())),
                "cause" => Ok(rt.error.cause.clone().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            },
            Self::Obj(obj) => {
                let key = index_key(index)?;
                if let Some(v) = obj.fields.read().get(key.as_ref()) {
                    return Ok(v.clone());
                }
                Ok(obj.ty.resolve_method(key.as_ref()).unwrap_or(Value::Nil))
            }
            Self::ObjectType(ty) => {
                let key = index_key(index)?;
                Ok(ty.resolve_method(key.as_ref()).unwrap_or(Value::Nil))
            }
            other => Err(ErrorValue::not_indexable(other.type_name())),
        }
    }

    /// `self[index] = value` for the data-backed variants.
    pub fn index_set(&self, index: &Value, value: Value) -> Result<(), ErrorValue> {
        match self {
            Self::Array(items) => {
                let mut items = items.write();
                let len = items.len();
                let idx = normalize_index(index, len)?;
                if idx >= len {
                    return Err(ErrorValue::index_out_of_bounds(format!(
                        "index {} out of range for length {}",
                        idx, len
                    )));
                }
                items[idx] = value;
                Ok(())
            }
            Self::Bytes(data) => {
                let mut data = data.write();
                let len = data.len();
                let idx = normalize_index(index, len)?;
                if idx >= len {
                    return Err(ErrorValue::index_out_of_bounds(format!(
                        "index {} out of range for length {}",
                        idx, len
                    )));
                }
                let byte = match value {
                    Value::Int(v) if (0..=255).contains(&v) => v as u8,
                    Value::Uint(v) if v <= 255 => v as u8,
                    Value::Char(c) if (c as u32) <= 255 => c as u8,
                    other => {
                        return Err(ErrorValue::type_error(format!(
                            "cannot store {} in bytes",
                            other.type_name()
                        )));
                    }
                };
                data[idx] = byte;
                Ok(())
            }
            Self::Dict(map) | Self::SyncDict(map) => {
                let key = index_key(index)?;
                map.write().insert(key.into_owned(), value);
                Ok(())
            }
            Self::Obj(obj) => {
                let key = index_key(index)?;
                obj.fields.write().insert(key.into_owned(), value);
                Ok(())
            }
            other => Err(ErrorValue::not_index_assignable(other.type_name())),
        }
    }

    /// Delete `self[index]`; only mapping variants support it.
    pub fn index_delete(&self, index: &Value) -> Result<(), ErrorValue> {
        match self {
            Self::Dict(map) | Self::SyncDict(map) => {
                let key = index_key(index)?;
                map.write().shift_remove(key.as_ref());
                Ok(())
            }
            Self::Obj(obj) => {
                let key = index_key(index)?;
                obj.fields.write().shift_remove(key.as_ref());
                Ok(())
            }
            other => Err(ErrorValue::not_index_assignable(other.type_name())),
        }
    }

    /// Element count, for the variants with a length.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::RawStr(s) => Some(s.chars().count()),
            Self::Bytes(b) => Some(b.read().len()),
            Self::Array(a) => Some(a.read().len()),
            Self::Dict(d) | Self::SyncDict(d) => Some(d.read().len()),
            Self::KeyValueArray(a) => Some(a.read().len()),
            _ => None,
        }
    }

    // -- Copying ---------------------------------------------------------

    /// Shallow copy: containers get fresh storage, elements are shared.
    pub fn copy(&self) -> Value {
        match self {
            Self::Array(a) => Value::array(a.read().clone()),
            Self::Dict(d) => Value::dict(d.read().clone()),
            Self::SyncDict(d) => Value::sync_dict(d.read().clone()),
            Self::Bytes(b) => Value::bytes(b.read().clone()),
            Self::KeyValueArray(a) => Value::KeyValueArray(shared(a.read().clone())),
            other => other.clone(),
        }
    }

    /// Deep copy: containers are copied recursively.
    pub fn deep_copy(&self) -> Value {
        match self {
            Self::Array(a) => {
                Value::array(a.read().iter().map(Value::deep_copy).collect())
            }
            Self::Dict(d) => Value::dict(
                d.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Self::SyncDict(d) => Value::sync_dict(
                d.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Self::KeyValueArray(a) => Value::KeyValueArray(shared(
                a.read()
                    .iter()
                    .map(|(k, v)| (k.deep_copy(), v.deep_copy()))
                    .collect(),
            )),
            other => other.copy(),
        }
    }

    // -- Iteration -------------------------------------------------------

    /// Build an iterator over this value, or `None` if it is not iterable.
    pub fn iterate(&self) -> Option<ValueIter> {
        match self {
            Self::Array(items) => Some(ValueIter::Array {
                items: items.clone(),
                next: 0,
            }),
            Self::Dict(map) | Self::SyncDict(map) => Some(ValueIter::Dict {
                keys: map.read().keys().cloned().collect(),
                map: map.clone(),
                next: 0,
            }),
            Self::Str(s) | Self::RawStr(s) => Some(ValueIter::Chars {
                chars: s.chars().collect(),
                next: 0,
            }),
            Self::Bytes(data) => Some(ValueIter::Bytes {
                data: data.clone(),
                next: 0,
            }),
            Self::KeyValueArray(items) => Some(ValueIter::Pairs {
                items: items.clone(),
                next: 0,
            }),
            _ => None,
        }
    }
}

/// Resolve an index value to a vector offset, supporting negative indices.
fn normalize_index(index: &Value, len: usize) -> Result<usize, ErrorValue> {
    let idx = match index {
        Value::Int(v) => *v,
        Value::Uint(v) => *v as i64,
        Value::Char(c) => *c as i64,
        other => {
            return Err(ErrorValue::type_error(format!(
                "index must be an integer, not {}",
                other.type_name()
            )));
        }
    };
    let resolved = if idx < 0 { idx + len as i64 } else { idx };
    if resolved < 0 {
        return Err(ErrorValue::index_out_of_bounds(format!(
            "index {} out of range for length {}",
            idx, len
        )));
    }
    Ok(resolved as usize)
}

/// Mapping keys are strings; chars coerce.
fn index_key(index: &Value) -> Result<Cow<'_, str>, ErrorValue> {
    match index {
        Value::Str(s) | Value::RawStr(s) => Ok(Cow::Borrowed(s.as_ref())),
        Value::Char(c) => Ok(Cow::Owned(c.to_string())),
        Value::Int(v) => Ok(Cow::Owned(v.to_string())),
        Value::Uint(v) => Ok(Cow::Owned(v.to_string())),
        other => Err(ErrorValue::type_error(format!(
            "dict key must be a string, not {}",
            other.type_name()
        ))),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Nil
    }
}

// ---------------------------------------------------------------------------
// Display / Debug
// ---------------------------------------------------------------------------

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Flag(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            Self::Int(v) => write!(f, "{}", v),
            Self::Uint(v) => write!(f, "{}", v),
            Self::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{}.0", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Char(c) => write!(f, "'{}'", c),
            Self::Str(s) => write!(f, "{:?}", s.as_ref()),
            Self::RawStr(s) => write!(f, "`{}`", s),
            Self::Bytes(b) => {
                write!(f, "bytes(")?;
                for byte in b.read().iter() {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ")")
            }
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Dict(map) | Self::SyncDict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::KeyValue(pair) => write!(f, "{}={}", pair.0, pair.1),
            Self::KeyValueArray(items) => {
                write!(f, "(")?;
                for (i, (k, v)) in items.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, ")")
            }
            Self::Error(err) => write!(f, "{}", err),
            Self::RuntimeError(err) => write!(f, "{}", err),
            Self::Compiled(func) => write!(f, "<compiledFunction {}>", func.name),
            Self::Closure(c) => write!(f, "<function {}>", c.func.name),
            Self::Builtin(def) => write!(f, "<builtin {}>", def.name),
            Self::HostFn(func) => write!(f, "<function {}>", func.name),
            Self::CallWrapper(_) => write!(f, "<callWrapper>"),
            Self::ObjectType(t) => write!(f, "<type {}>", t.name),
            Self::Obj(o) => {
                write!(f, "{}{{", o.ty.name)?;
                for (i, (k, v)) in o.fields.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::Ptr(p) => write!(f, "<objectPtr {}>", p.0.read()),
            Self::GetProxy(_) => write!(f, "<indexGetProxy>"),
            Self::SetProxy(_) => write!(f, "<indexSetProxy>"),
            Self::DelProxy(_) => write!(f, "<indexDeleteProxy>"),
            Self::Iter(_) => write!(f, "<iterator>"),
            Self::Writer(_) => write!(f, "<writer>"),
            Self::Reader(_) => write!(f, "<reader>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self)
    }
}

// ---------------------------------------------------------------------------
// Errors as values
// ---------------------------------------------------------------------------

/// A script-level error: a stable kind name, a message, and an optional
/// cause forming a chain.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub cause: Option<Value>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn wrong_num_arguments(message: impl Into<String>) -> Self {
        Self::new("WrongNumArgumentsError", message)
    }

    pub fn invalid_operator(message: impl Into<String>) -> Self {
        Self::new("InvalidOperatorError", message)
    }

    pub fn index_out_of_bounds(message: impl Into<String>) -> Self {
        Self::new("IndexOutOfBoundsError", message)
    }

    pub fn not_iterable(type_name: impl fmt::Display) -> Self {
        Self::new("NotIterableError", format!("{} is not iterable", type_name))
    }

    pub fn not_indexable(type_name: impl fmt::Display) -> Self {
        Self::new("NotIndexableError", format!("{} is not indexable", type_name))
    }

    pub fn not_index_assignable(type_name: impl fmt::Display) -> Self {
        Self::new(
            "NotIndexAssignableError",
            format!("{} is not index-assignable", type_name),
        )
    }

    pub fn not_callable(type_name: impl fmt::Display) -> Self {
        Self::new("NotCallableError", format!("{} is not callable", type_name))
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new("NotImplementedError", message)
    }

    pub fn zero_division() -> Self {
        Self::new("ZeroDivisionError", "division by zero")
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn aborted() -> Self {
        Self::new("VMAborted", "VM aborted")
    }

    /// Walk the cause chain looking for `kind` (by identity, then by
    /// name+message).
    pub fn is_kind(self: &Arc<Self>, kind: &Value) -> bool {
        let mut current = Value::Error(self.clone());
        loop {
            match (&current, kind) {
                (Value::Error(a), Value::Error(b)) => {
                    if Arc::ptr_eq(a, b) || (a.name == b.name && a.message == b.message) {
                        return true;
                    }
                    match &a.cause {
                        Some(cause) => current = cause.clone(),
                        None => return false,
                    }
                }
                _ => return false,
            }
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// A raised error carrying its call trace.
///
/// The trace accumulates source positions innermost-first while the machine
/// unwinds, and is frozen once the error reaches a catch clause or the
/// top-level caller.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub error: ErrorValue,
    pub trace: Vec<Span>,
    pub file: Arc<SourceFile>,
}

impl RuntimeError {
    pub fn new(error: ErrorValue, file: Arc<SourceFile>) -> Self {
        Self { error, trace: Vec::new(), file }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        // `{:+}` appends the trace and the cause chain.
        if f.sign_plus() {
            for span in &self.trace {
                write!(f, "\n\tat {}", self.file.format_pos(*span))?;
            }
            let mut cause = self.error.cause.as_ref();
            while let Some(value) = cause {
                write!(f, "\ncaused by: {}", value)?;
                cause = match value {
                    Value::Error(err) => err.cause.as_ref(),
                    _ => None,
                };
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

// ---------------------------------------------------------------------------
// Callables
// ---------------------------------------------------------------------------

/// A compiled function plus its captured cells.
#[derive(Debug)]
pub struct Closure {
    pub func: Arc<CompiledFunction>,
    pub free: Vec<ObjectPtr>,
}

/// A host function registered at runtime.
#[derive(Clone)]
pub struct HostFunction {
    pub name: Arc<str>,
    pub func: HostFnImpl,
}

impl HostFunction {
    pub fn new(name: impl Into<Arc<str>>, func: HostFnImpl) -> Self {
        Self { name: name.into(), func }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A partial application: calling it prepends the bound arguments.
#[derive(Debug)]
pub struct CallWrapper {
    pub callee: Value,
    pub args: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

/// A user-defined type descriptor created by `newType`.
#[derive(Debug)]
pub struct ObjectType {
    pub name: String,
    pub methods: ValueMap,
    /// Parent types searched for methods after `methods` misses.
    pub extends: Vec<Arc<ObjectType>>,
}

impl ObjectType {
    /// Look up a method on this type or, failing that, its ancestors.
    pub fn resolve_method(&self, name: &str) -> Option<Value> {
        if let Some(m) = self.methods.get(name) {
            return Some(m.clone());
        }
        self.extends.iter().find_map(|t| t.resolve_method(name))
    }
}

/// An instance of an [`ObjectType`].
#[derive(Debug)]
pub struct Obj {
    pub ty: Arc<ObjectType>,
    pub fields: Shared<ValueMap>,
}

/// A mutable heap cell. Closures store pointers, never values; writing
/// through any clone of the cell is visible to every holder.
#[derive(Debug, Clone)]
pub struct ObjectPtr(pub Shared<Value>);

impl ObjectPtr {
    pub fn new(value: Value) -> Self {
        Self(shared(value))
    }

    pub fn get(&self) -> Value {
        self.0.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A callback-backed virtual object: indexing operations are forwarded to
/// the stored callable.
#[derive(Debug)]
pub struct IndexProxy {
    pub handler: Value,
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// A lazy, finite iterator over `(key, value)` pairs.
///
/// `next` is the index of the element `advance` will move to; after a
/// successful `advance`, `key`/`value` read element `next - 1`.
#[derive(Debug)]
pub enum ValueIter {
    Array { items: Shared<Vec<Value>>, next: usize },
    Dict { map: Shared<ValueMap>, keys: Vec<String>, next: usize },
    Chars { chars: Vec<char>, next: usize },
    Bytes { data: Shared<Vec<u8>>, next: usize },
    Pairs { items: Shared<Vec<(Value, Value)>>, next: usize },
}

impl ValueIter {
    /// Advance; returns whether a current pair now exists.
    pub fn advance(&mut self) -> bool {
        let (next, len) = match self {
            Self::Array { items, next } => (next, items.read().len()),
            Self::Dict { keys, next, .. } => (next, keys.len()),
            Self::Chars { chars, next } => (next, chars.len()),
            Self::Bytes { data, next } => (next, data.read().len()),
            Self::Pairs { items, next } => (next, items.read().len()),
        };
        if *next < len {
            *next += 1;
            true
        } else {
            false
        }
    }

    /// The key of the current pair.
    pub fn key(&self) -> Value {
        match self {
            Self::Array { next, .. }
            | Self::Chars { next, .. }
            | Self::Bytes { next, .. }
            | Self::Pairs { next, .. } => Value::Int(*next as i64 - 1),
            Self::Dict { keys, next, .. } => keys
                .get(*next - 1)
                .map(|k| Value::str(k.clone()))
                .unwrap_or(Value::Nil),
        }
    }

    /// The value of the current pair. Fails when the underlying source has
    /// shrunk since the iterator advanced.
    pub fn value(&self) -> Result<Value, ErrorValue> {
        let missing =
            || ErrorValue::index_out_of_bounds("iterator source shrank during iteration");
        match self {
            Self::Array { items, next } => {
                items.read().get(*next - 1).cloned().ok_or_else(missing)
            }
            Self::Dict { map, keys, next } => {
                let key = keys.get(*next - 1).ok_or_else(missing)?;
                Ok(map.read().get(key).cloned().unwrap_or(Value::Nil))
            }
            Self::Chars { chars, next } => {
                chars.get(*next - 1).map(|c| Value::Char(*c)).ok_or_else(missing)
            }
            Self::Bytes { data, next } => data
                .read()
                .get(*next - 1)
                .map(|b| Value::Int(*b as i64))
                .ok_or_else(missing),
            Self::Pairs { items, next } => items
                .read()
                .get(*next - 1)
                .map(|(k, v)| Value::key_value(k.clone(), v.clone()))
                .ok_or_else(missing),
        }
    }
}

// ---------------------------------------------------------------------------
// I/O handles
// ---------------------------------------------------------------------------

/// A shareable writer sink on the machine's output chain.
#[derive(Clone)]
pub struct WriterHandle(pub Arc<Mutex<dyn io::Write + Send>>);

impl WriterHandle {
    pub fn new(w: impl io::Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(w)))
    }

    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.0.lock().write_all(bytes)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

impl fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterHandle(..)")
    }
}

/// A shareable reader source.
#[derive(Clone)]
pub struct ReaderHandle(pub Arc<Mutex<dyn io::Read + Send>>);

impl ReaderHandle {
    pub fn new(r: impl io::Read + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(r)))
    }
}

impl fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderHandle(..)")
    }
}

// ---------------------------------------------------------------------------
// Conversions from Rust types
// ---------------------------------------------------------------------------

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

// ---------------------------------------------------------------------------
// Conversions to Rust types
// ---------------------------------------------------------------------------

/// Error when converting a [`Value`] to a Rust type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastError {
    pub expected: &'static str,
    pub got: String,
}

impl CastError {
    pub fn new(expected: &'static str, got: impl Into<String>) -> Self {
        Self { expected, got: got.into() }
    }
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, got {}", self.expected, self.got)
    }
}

impl std::error::Error for CastError {}

/// Trait for converting a [`Value`] to a Rust type.
///
/// Used by the `#[host_fn]` macro to validate and convert arguments with
/// proper error messages.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, CastError>;

    /// The script type name expected by this type (for error messages).
    fn expected_type() -> &'static str;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        Ok(value.clone())
    }

    fn expected_type() -> &'static str {
        "any"
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::Uint(v) if *v <= i64::MAX as u64 => Ok(*v as i64),
            Value::Bool(b) | Value::Flag(b) => Ok(*b as i64),
            Value::Char(c) => Ok(*c as i64),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "int"
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Uint(v) => Ok(*v),
            Value::Int(v) if *v >= 0 => Ok(*v as u64),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "uint"
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Uint(v) => Ok(*v as f64),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "float"
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Bool(b) | Value::Flag(b) => Ok(*b),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "bool"
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Str(s) | Value::RawStr(s) => Ok(s.to_string()),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "string"
    }
}

impl FromValue for char {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Char(c) => Ok(*c),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "char"
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn expected_type() -> &'static str {
        "optional"
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Array(items) => items.read().iter().map(T::from_value).collect(),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "array"
    }
}

impl FromValue for () {
    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Nil => Ok(()),
            other => Err(CastError::new(Self::expected_type(), other.type_name())),
        }
    }

    fn expected_type() -> &'static str {
        "nil"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Nil.is_falsy());
        assert!(Value::Int(0).is_falsy());
        assert!(Value::str("").is_falsy());
        assert!(Value::array(vec![]).is_falsy());
        assert!(!Value::Int(1).is_falsy());
        assert!(!Value::str("x").is_falsy());
        assert!(Value::error("boom").is_falsy());
    }

    #[test]
    fn test_numeric_equality_coerces() {
        assert_eq!(Value::Int(1), Value::Uint(1));
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_eq!(Value::Char('a'), Value::Int(97));
        assert_ne!(Value::Int(-1), Value::Uint(u64::MAX));
    }

    #[test]
    fn test_array_index_negative() {
        let arr = Value::from(vec![1i64, 2, 3]);
        assert_eq!(arr.index_get(&Value::Int(-1)).unwrap(), Value::Int(3));
        assert_eq!(arr.index_get(&Value::Int(5)).unwrap(), Value::Nil);
    }

    #[test]
    fn test_dict_missing_key_is_nil() {
        let d = Value::dict(ValueMap::new());
        assert_eq!(d.index_get(&Value::str("nope")).unwrap(), Value::Nil);
    }

    #[test]
    fn test_index_set_shared() {
        let arr = Value::from(vec![1i64, 2]);
        let alias = arr.clone();
        arr.index_set(&Value::Int(0), Value::Int(9)).unwrap();
        assert_eq!(alias.index_get(&Value::Int(0)).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_copy_detaches_storage() {
        let arr = Value::from(vec![1i64]);
        let copied = arr.copy();
        arr.index_set(&Value::Int(0), Value::Int(9)).unwrap();
        assert_eq!(copied.index_get(&Value::Int(0)).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_object_ptr_shared_write() {
        let cell = ObjectPtr::new(Value::Int(0));
        let alias = cell.clone();
        cell.set(Value::Int(42));
        assert_eq!(alias.get(), Value::Int(42));
    }

    #[test]
    fn test_iterator_pairs() {
        let arr = Value::from(vec![10i64, 20]);
        let mut it = arr.iterate().unwrap();
        assert!(it.advance());
        assert_eq!(it.key(), Value::Int(0));
        assert_eq!(it.value().unwrap(), Value::Int(10));
        assert!(it.advance());
        assert!(!it.advance());
    }

    #[test]
    fn test_error_kind_chain() {
        let base = Value::Error(Arc::new(ErrorValue::new("MyError", "base")));
        let derived = match &base {
            Value::Error(e) => Value::Error(Arc::new(
                ErrorValue::new(e.name.clone(), "derived").with_cause(base.clone()),
            )),
            _ => unreachable!(),
        };
        match &derived {
            Value::Error(e) => assert!(e.is_kind(&base)),
            _ => unreachable!(),
        }
    }
}
