//! Binary and unary operator application.
//!
//! Stateless helpers: the machine pops operands, calls in here, pushes the
//! result. Arithmetic on `int`/`uint` wraps (two's-complement modular);
//! floats follow IEEE-754; `decimal` operands promote the other side to
//! decimal. Division and remainder by zero raise `ZeroDivisionError`.

use std::cmp::Ordering;

use crate::ast::{BinaryOp, UnaryOp};
use crate::decimal::Decimal;
use crate::value::{ErrorValue, Value};

/// Apply a binary operator to two values.
pub fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ErrorValue> {
    match op {
        BinaryOp::Equal => return Ok(Value::Bool(left.equal(right))),
        BinaryOp::NotEqual => return Ok(Value::Bool(!left.equal(right))),
        BinaryOp::Less => return Ok(Value::Bool(compare(op, left, right)? == Ordering::Less)),
        BinaryOp::Greater => {
            return Ok(Value::Bool(compare(op, left, right)? == Ordering::Greater));
        }
        BinaryOp::LessEq => {
            return Ok(Value::Bool(compare(op, left, right)? != Ordering::Greater));
        }
        BinaryOp::GreaterEq => {
            return Ok(Value::Bool(compare(op, left, right)? != Ordering::Less));
        }
        _ => {}
    }

    // String / container forms first, then numeric promotion.
    match (left, right) {
        (Value::Str(a), Value::Str(b) | Value::RawStr(b)) if op == BinaryOp::Add => {
            return Ok(Value::str(format!("{}{}", a, b)));
        }
        (Value::Str(a), Value::Char(c)) if op == BinaryOp::Add => {
            return Ok(Value::str(format!("{}{}", a, c)));
        }
        (Value::Char(c), Value::Str(a)) if op == BinaryOp::Add => {
            return Ok(Value::str(format!("{}{}", c, a)));
        }
        (Value::Str(s), Value::Int(n)) if op == BinaryOp::Mul => {
            let n = (*n).max(0) as usize;
            return Ok(Value::str(s.repeat(n)));
        }
        (Value::Array(a), Value::Array(b)) if op == BinaryOp::Add => {
            let mut items = a.read().clone();
            items.extend(b.read().iter().cloned());
            return Ok(Value::array(items));
        }
        (Value::Bytes(a), Value::Bytes(b)) if op == BinaryOp::Add => {
            let mut data = a.read().clone();
            data.extend_from_slice(&b.read());
            return Ok(Value::bytes(data));
        }
        (Value::Dict(a), Value::Dict(b)) if op == BinaryOp::Add => {
            let mut map = a.read().clone();
            for (k, v) in b.read().iter() {
                map.insert(k.clone(), v.clone());
            }
            return Ok(Value::dict(map));
        }
        _ => {}
    }

    numeric_binop(op, left, right)
}

/// Numeric operand domains after coercion.
enum Domain {
    Int(i64, i64),
    Uint(u64, u64),
    Float(f64, f64),
    Decimal(Decimal, Decimal),
}

fn classify(op: BinaryOp, left: &Value, right: &Value) -> Result<Domain, ErrorValue> {
    let bad = || {
        ErrorValue::invalid_operator(format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };
    // Decimal dominates, then float, then uint, then int. Bool and char
    // coerce to int.
    let as_int = |v: &Value| -> Option<i64> {
        match v {
            Value::Int(i) => Some(*i),
            Value::Bool(b) | Value::Flag(b) => Some(*b as i64),
            Value::Char(c) => Some(*c as i64),
            _ => None,
        }
    };
    match (left, right) {
        (Value::Decimal(a), _) => {
            let b = to_decimal(right).ok_or_else(bad)?;
            Ok(Domain::Decimal(a.clone(), b))
        }
        (_, Value::Decimal(b)) => {
            let a = to_decimal(left).ok_or_else(bad)?;
            Ok(Domain::Decimal(a, b.clone()))
        }
        (Value::Float(a), _) => Ok(Domain::Float(*a, to_float(right).ok_or_else(bad)?)),
        (_, Value::Float(b)) => Ok(Domain::Float(to_float(left).ok_or_else(bad)?, *b)),
        (Value::Uint(a), _) => Ok(Domain::Uint(*a, to_uint(right).ok_or_else(bad)?)),
        (_, Value::Uint(b)) => Ok(Domain::Uint(to_uint(left).ok_or_else(bad)?, *b)),
        _ => match (as_int(left), as_int(right)) {
            (Some(a), Some(b)) => Ok(Domain::Int(a, b)),
            _ => Err(bad()),
        },
    }
}

fn to_float(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::Uint(u) => Some(*u as f64),
        Value::Bool(b) | Value::Flag(b) => Some(*b as u8 as f64),
        Value::Char(c) => Some(*c as u32 as f64),
        _ => None,
    }
}

fn to_uint(v: &Value) -> Option<u64> {
    match v {
        Value::Uint(u) => Some(*u),
        Value::Int(i) => Some(*i as u64),
        Value::Bool(b) | Value::Flag(b) => Some(*b as u64),
        Value::Char(c) => Some(*c as u64),
        _ => None,
    }
}

fn to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Decimal(d) => Some(d.clone()),
        Value::Int(i) => Some(Decimal::from(*i)),
        Value::Uint(u) => Some(Decimal::from(*u)),
        Value::Float(f) => Decimal::try_from(*f).ok(),
        _ => None,
    }
}

fn numeric_binop(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ErrorValue> {
    // Char arithmetic keeps the char domain for +/- with integers.
    if let (Value::Char(c), Value::Int(n)) = (left, right) {
        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let delta = if op == BinaryOp::Add { *n } else { -*n };
                let code = (*c as i64).wrapping_add(delta);
                if let Some(ch) = u32::try_from(code).ok().and_then(char::from_u32) {
                    return Ok(Value::Char(ch));
                }
            }
            _ => {}
        }
    }
    if let (Value::Char(a), Value::Char(b)) = (left, right) {
        if op == BinaryOp::Sub {
            return Ok(Value::Int(*a as i64 - *b as i64));
        }
    }

    match classify(op, left, right)? {
        Domain::Int(a, b) => int_binop(op, a, b),
        Domain::Uint(a, b) => uint_binop(op, a, b),
        Domain::Float(a, b) => float_binop(op, a, b).ok_or_else(|| invalid(op, left, right)),
        Domain::Decimal(a, b) => decimal_binop(op, &a, &b).ok_or_else(|| invalid(op, left, right)),
    }
    .and_then(|v| match v {
        // Division by zero surfaces from the integer paths as nil.
        Value::Nil => Err(ErrorValue::zero_division()),
        other => Ok(other),
    })
}

fn invalid(op: BinaryOp, left: &Value, right: &Value) -> ErrorValue {
    ErrorValue::invalid_operator(format!(
        "unsupported operand types for {}: {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn int_binop(op: BinaryOp, a: i64, b: i64) -> Result<Value, ErrorValue> {
    let v = match op {
        BinaryOp::Add => Value::Int(a.wrapping_add(b)),
        BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ErrorValue::zero_division());
            }
            Value::Int(a.wrapping_div(b))
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(ErrorValue::zero_division());
            }
            Value::Int(a.wrapping_rem(b))
        }
        BinaryOp::BitAnd => Value::Int(a & b),
        BinaryOp::BitOr => Value::Int(a | b),
        BinaryOp::BitXor => Value::Int(a ^ b),
        BinaryOp::Shl => Value::Int(a.wrapping_shl(b as u32)),
        BinaryOp::Shr => Value::Int(a.wrapping_shr(b as u32)),
        _ => {
            return Err(ErrorValue::invalid_operator(format!(
                "unsupported int operator {}",
                op.symbol()
            )));
        }
    };
    Ok(v)
}

fn uint_binop(op: BinaryOp, a: u64, b: u64) -> Result<Value, ErrorValue> {
    let v = match op {
        BinaryOp::Add => Value::Uint(a.wrapping_add(b)),
        BinaryOp::Sub => Value::Uint(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::Uint(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ErrorValue::zero_division());
            }
            Value::Uint(a / b)
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(ErrorValue::zero_division());
            }
            Value::Uint(a % b)
        }
        BinaryOp::BitAnd => Value::Uint(a & b),
        BinaryOp::BitOr => Value::Uint(a | b),
        BinaryOp::BitXor => Value::Uint(a ^ b),
        BinaryOp::Shl => Value::Uint(a.wrapping_shl(b as u32)),
        BinaryOp::Shr => Value::Uint(a.wrapping_shr(b as u32)),
        _ => {
            return Err(ErrorValue::invalid_operator(format!(
                "unsupported uint operator {}",
                op.symbol()
            )));
        }
    };
    Ok(v)
}

fn float_binop(op: BinaryOp, a: f64, b: f64) -> Option<Value> {
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return None,
    };
    Some(Value::Float(v))
}

fn decimal_binop(op: BinaryOp, a: &Decimal, b: &Decimal) -> Option<Value> {
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        // The None from zero division maps to Value::Nil, translated to
        // ZeroDivisionError by the caller.
        BinaryOp::Div => return Some((a / b).map(Value::Decimal).unwrap_or(Value::Nil)),
        BinaryOp::Rem => return Some((a % b).map(Value::Decimal).unwrap_or(Value::Nil)),
        _ => return None,
    };
    Some(Value::Decimal(v))
}

/// Three-way comparison used by the ordering operators and `sort`.
pub fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering, ErrorValue> {
    match (left, right) {
        (Value::Str(a) | Value::RawStr(a), Value::Str(b) | Value::RawStr(b)) => {
            return Ok(a.as_ref().cmp(b.as_ref()));
        }
        (Value::Char(a), Value::Char(b)) => return Ok(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => return Ok(a.read().cmp(&b.read())),
        _ => {}
    }
    match classify(op, left, right)? {
        Domain::Int(a, b) => Ok(a.cmp(&b)),
        Domain::Uint(a, b) => Ok(a.cmp(&b)),
        Domain::Float(a, b) => a.partial_cmp(&b).ok_or_else(|| {
            ErrorValue::invalid_operator("cannot order NaN".to_string())
        }),
        Domain::Decimal(a, b) => Ok(a.cmp(&b)),
    }
}

/// Apply a unary operator to a value.
pub fn unary_op(op: UnaryOp, operand: &Value) -> Result<Value, ErrorValue> {
    let bad = || {
        ErrorValue::invalid_operator(format!(
            "unsupported operand type for unary {}: {}",
            op.symbol(),
            operand.type_name()
        ))
    };
    let v = match (op, operand) {
        (UnaryOp::Not, v) => Value::Bool(v.is_falsy()),
        (UnaryOp::Neg, Value::Int(v)) => Value::Int(v.wrapping_neg()),
        (UnaryOp::Neg, Value::Uint(v)) => Value::Uint(v.wrapping_neg()),
        (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
        (UnaryOp::Neg, Value::Decimal(d)) => Value::Decimal(-d),
        (UnaryOp::Pos, v @ (Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Decimal(_))) => {
            v.clone()
        }
        (UnaryOp::Pos, Value::Bool(b) | Value::Flag(b)) => Value::Int(*b as i64),
        (UnaryOp::Pos, Value::Char(c)) => Value::Int(*c as i64),
        (UnaryOp::BitNot, Value::Int(v)) => Value::Int(!v),
        (UnaryOp::BitNot, Value::Uint(v)) => Value::Uint(!v),
        _ => return Err(bad()),
    };
    Ok(v)
}
