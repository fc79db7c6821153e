//! Slicing helpers for strings, arrays, and byte buffers.
//!
//! Stateless: the machine pops `low`, `high`, and the container, and calls
//! in here. Bounds follow the usual rules — negative indices count from the
//! end, a missing bound means "start" or "end", and a resolved range with
//! `low > high` or an end past the length raises `IndexOutOfBoundsError`.

use crate::value::{ErrorValue, Value};

/// Resolve the optional bounds against `len`.
fn resolve_bounds(
    low: &Value,
    high: &Value,
    len: usize,
) -> Result<(usize, usize), ErrorValue> {
    let resolve = |bound: &Value, default: usize| -> Result<usize, ErrorValue> {
        let idx = match bound {
            Value::Nil => return Ok(default),
            Value::Int(v) => *v,
            Value::Uint(v) => *v as i64,
            other => {
                return Err(ErrorValue::type_error(format!(
                    "slice bound must be an integer, not {}",
                    other.type_name()
                )));
            }
        };
        let resolved = if idx < 0 { idx + len as i64 } else { idx };
        if resolved < 0 || resolved > len as i64 {
            return Err(ErrorValue::index_out_of_bounds(format!(
                "slice bound {} out of range for length {}",
                idx, len
            )));
        }
        Ok(resolved as usize)
    };

    let lo = resolve(low, 0)?;
    let hi = resolve(high, len)?;
    if lo > hi {
        return Err(ErrorValue::index_out_of_bounds(format!(
            "invalid slice range {}..{}",
            lo, hi
        )));
    }
    Ok((lo, hi))
}

/// `value[low:high]` for the sliceable variants.
pub fn slice_value(value: &Value, low: &Value, high: &Value) -> Result<Value, ErrorValue> {
    match value {
        Value::Array(items) => {
            let items = items.read();
            let (lo, hi) = resolve_bounds(low, high, items.len())?;
            Ok(Value::array(items[lo..hi].to_vec()))
        }
        Value::Bytes(data) => {
            let data = data.read();
            let (lo, hi) = resolve_bounds(low, high, data.len())?;
            Ok(Value::bytes(data[lo..hi].to_vec()))
        }
        Value::Str(s) | Value::RawStr(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = resolve_bounds(low, high, chars.len())?;
            Ok(Value::str(chars[lo..hi].iter().collect::<String>()))
        }
        other => Err(ErrorValue::not_indexable(other.type_name())),
    }
}
