//! Named-method dispatch (`receiver.name(args)` via `OpCallName`).
//!
//! Errors expose `New` for building cause chains; objects resolve methods
//! through their type (bound to the receiver); dicts treat callable
//! members as methods; strings carry a small method set. Anything else
//! falls back to indexing the receiver and calling the member.

use std::sync::Arc;

use crate::value::{ErrorValue, Value};
use crate::vm::CallContext;

/// Dispatch `receiver.name(ctx.args)`.
pub fn call_name(
    ctx: &mut CallContext<'_>,
    receiver: &Value,
    name: &str,
) -> Result<Value, ErrorValue> {
    match receiver {
        Value::Error(err) => error_method(ctx, err, name),
        Value::RuntimeError(rt) => {
            let err = Arc::new(rt.error.clone());
            error_method(ctx, &err, name)
        }
        Value::Obj(obj) => {
            if let Some(member) = obj.fields.read().get(name).cloned() {
                if member.is_callable() {
                    return ctx.vm.invoke_value(&member, ctx.args.clone());
                }
                return Err(ErrorValue::not_callable(member.type_name()));
            }
            match obj.ty.resolve_method(name) {
                Some(method) => {
                    // Bound call: the receiver is the first argument.
                    let mut args = Vec::with_capacity(ctx.args.len() + 1);
                    args.push(receiver.clone());
                    args.extend(ctx.args.iter().cloned());
                    ctx.vm.invoke_value(&method, args)
                }
                None => Err(ErrorValue::not_implemented(format!(
                    "{} has no method {:?}",
                    obj.ty.name, name
                ))),
            }
        }
        Value::ObjectType(ty) => match ty.resolve_method(name) {
            Some(method) => ctx.vm.invoke_value(&method, ctx.args.clone()),
            None => Err(ErrorValue::not_implemented(format!(
                "type {} has no method {:?}",
                ty.name, name
            ))),
        },
        Value::Dict(_) | Value::SyncDict(_) => {
            let member = receiver.index_get(&Value::str(name))?;
            if member.is_callable() {
                return ctx.vm.invoke_value(&member, ctx.args.clone());
            }
            Err(ErrorValue::not_callable(member.type_name()))
        }
        Value::Str(s) | Value::RawStr(s) => string_method(ctx, s, name),
        Value::Writer(w) => writer_method(ctx, w, name),
        other => {
            let member = other.index_get(&Value::str(name))?;
            if member.is_callable() {
                return ctx.vm.invoke_value(&member, ctx.args.clone());
            }
            Err(ErrorValue::not_implemented(format!(
                "{} has no method {:?}",
                other.type_name(),
                name
            )))
        }
    }
}

/// `err.New(message)` derives an error whose cause chain leads back to
/// `err`; `isError` walks that chain.
fn error_method(
    ctx: &mut CallContext<'_>,
    err: &Arc<ErrorValue>,
    name: &str,
) -> Result<Value, ErrorValue> {
    match name {
        "New" => {
            let message = ctx
                .args
                .first()
                .map(Value::to_print_string)
                .unwrap_or_default();
            Ok(Value::Error(Arc::new(
                ErrorValue::new(err.name.clone(), message)
                    .with_cause(Value::Error(err.clone())),
            )))
        }
        _ => Err(ErrorValue::not_implemented(format!(
            "error has no method {:?}",
            name
        ))),
    }
}

fn string_method(
    ctx: &mut CallContext<'_>,
    s: &Arc<str>,
    name: &str,
) -> Result<Value, ErrorValue> {
    let arg_str = |i: usize| -> Result<&str, ErrorValue> {
        match ctx.args.get(i) {
            Some(Value::Str(v) | Value::RawStr(v)) => Ok(v.as_ref()),
            Some(other) => Err(ErrorValue::type_error(format!(
                "string.{}() argument must be a string, not {}",
                name,
                other.type_name()
            ))),
            None => Err(ErrorValue::wrong_num_arguments(format!(
                "string.{}() missing argument {}",
                name,
                i + 1
            ))),
        }
    };
    match name {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "trim" => Ok(Value::str(s.trim().to_string())),
        "split" => {
            let sep = arg_str(0)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::str(c.to_string())).collect()
            } else {
                s.split(sep).map(|p| Value::str(p.to_string())).collect()
            };
            Ok(Value::array(parts))
        }
        "startsWith" => Ok(Value::Bool(s.starts_with(arg_str(0)?))),
        "endsWith" => Ok(Value::Bool(s.ends_with(arg_str(0)?))),
        "replace" => {
            let (from, to) = (arg_str(0)?, arg_str(1)?);
            Ok(Value::str(s.replace(from, to)))
        }
        "indexOf" => {
            let needle = arg_str(0)?;
            let index = s.find(needle).map(|byte| s[..byte].chars().count() as i64);
            Ok(Value::Int(index.unwrap_or(-1)))
        }
        "join" => match ctx.args.first() {
            Some(Value::Array(items)) => {
                let parts: Vec<String> =
                    items.read().iter().map(Value::to_print_string).collect();
                Ok(Value::str(parts.join(s)))
            }
            Some(other) => Err(ErrorValue::type_error(format!(
                "string.join() argument must be an array, not {}",
                other.type_name()
            ))),
            None => Err(ErrorValue::wrong_num_arguments("string.join() missing argument 1")),
        },
        _ => Err(ErrorValue::not_implemented(format!(
            "string has no method {:?}",
            name
        ))),
    }
}

fn writer_method(
    ctx: &mut CallContext<'_>,
    w: &crate::value::WriterHandle,
    name: &str,
) -> Result<Value, ErrorValue> {
    match name {
        "write" => {
            let data = match ctx.args.first() {
                Some(Value::Bytes(b)) => b.read().clone(),
                Some(Value::Str(s) | Value::RawStr(s)) => s.as_bytes().to_vec(),
                Some(other) => {
                    return Err(ErrorValue::type_error(format!(
                        "writer.write() expects bytes or a string, not {}",
                        other.type_name()
                    )));
                }
                None => {
                    return Err(ErrorValue::wrong_num_arguments(
                        "writer.write() missing argument 1",
                    ));
                }
            };
            w.write_all(&data)
                .map_err(|e| ErrorValue::new("error", format!("write failed: {}", e)))?;
            Ok(Value::Int(data.len() as i64))
        }
        "flush" => {
            w.flush()
                .map_err(|e| ErrorValue::new("error", format!("flush failed: {}", e)))?;
            Ok(Value::Nil)
        }
        _ => Err(ErrorValue::not_implemented(format!(
            "writer has no method {:?}",
            name
        ))),
    }
}
