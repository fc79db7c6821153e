//! Arbitrary-precision decimal numbers.
//!
//! Stored as `coefficient * 10^exponent` with a `BigInt` coefficient, so
//! every decimal source literal is represented exactly. Arithmetic keeps
//! full precision except for division, which rounds half-even at
//! [`DIV_SCALE`] fractional digits.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::str::FromStr;

use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_traits::{Pow, Signed, ToPrimitive, Zero};

/// Fractional digits kept by division.
pub const DIV_SCALE: u32 = 34;

/// A finite decimal number: `coefficient * 10^exponent`.
#[derive(Debug, Clone)]
pub struct Decimal {
    coefficient: BigInt,
    exponent: i32,
}

impl Decimal {
    pub fn zero() -> Self {
        Self { coefficient: BigInt::zero(), exponent: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.coefficient.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.coefficient.is_negative()
    }

    /// Rescale both operands to a common exponent (the smaller of the two).
    fn align(&self, other: &Self) -> (BigInt, BigInt, i32) {
        let exp = self.exponent.min(other.exponent);
        let a = rescale(&self.coefficient, self.exponent, exp);
        let b = rescale(&other.coefficient, other.exponent, exp);
        (a, b, exp)
    }

    /// Drop trailing zero digits from the coefficient without changing the
    /// value. Keeps display output short after division.
    fn normalized(mut self) -> Self {
        if self.coefficient.is_zero() {
            self.exponent = 0;
            return self;
        }
        let ten = BigInt::from(10);
        while self.exponent < 0 {
            let (q, r) = self.coefficient.div_rem(&ten);
            if !r.is_zero() {
                break;
            }
            self.coefficient = q;
            self.exponent += 1;
        }
        self
    }

    pub fn to_f64(&self) -> f64 {
        let c = self.coefficient.to_f64().unwrap_or(f64::NAN);
        c * 10f64.powi(self.exponent)
    }

    pub fn to_i64(&self) -> Option<i64> {
        let truncated = if self.exponent >= 0 {
            self.coefficient.clone() * pow10(self.exponent as u32)
        } else {
            self.coefficient.clone() / pow10((-self.exponent) as u32)
        };
        truncated.to_i64()
    }

    /// Division rounding half-even at `scale` fractional digits.
    pub fn div_with_scale(&self, rhs: &Self, scale: u32) -> Option<Self> {
        if rhs.is_zero() {
            return None;
        }
        // numerator * 10^(scale + shift) / denominator, where shift aligns
        // the operand exponents into the quotient exponent.
        let exponent = -(scale as i32);
        let shift = self.exponent - rhs.exponent - exponent;
        let mut num = self.coefficient.clone();
        let mut den = rhs.coefficient.clone();
        if shift >= 0 {
            num *= pow10(shift as u32);
        } else {
            den *= pow10((-shift) as u32);
        }
        let (mut q, r) = num.div_rem(&den);
        // Half-even rounding on the remainder.
        let r2: BigInt = r.abs() * 2;
        let den_abs = den.abs();
        let round_up = match r2.cmp(&den_abs) {
            Ordering::Greater => true,
            Ordering::Equal => q.is_odd(),
            Ordering::Less => false,
        };
        if round_up {
            if (num.sign() == Sign::Minus) != (den.sign() == Sign::Minus) {
                q -= 1;
            } else {
                q += 1;
            }
        }
        Some(Self { coefficient: q, exponent }.normalized())
    }
}

fn pow10(n: u32) -> BigInt {
    BigInt::from(10).pow(n)
}

fn rescale(coefficient: &BigInt, from: i32, to: i32) -> BigInt {
    debug_assert!(from >= to);
    coefficient * pow10((from - to) as u32)
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Self { coefficient: BigInt::from(v), exponent: 0 }
    }
}

impl From<u64> for Decimal {
    fn from(v: u64) -> Self {
        Self { coefficient: BigInt::from(v), exponent: 0 }
    }
}

impl TryFrom<f64> for Decimal {
    type Error = DecimalParseError;

    /// Converts through the float's shortest decimal representation, which
    /// preserves the value the script author wrote.
    fn try_from(v: f64) -> Result<Self, DecimalParseError> {
        if !v.is_finite() {
            return Err(DecimalParseError);
        }
        format!("{}", v).parse()
    }
}

/// The input was not a valid finite decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalParseError;

impl fmt::Display for DecimalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal literal")
    }
}

impl std::error::Error for DecimalParseError {}

impl FromStr for Decimal {
    type Err = DecimalParseError;

    fn from_str(s: &str) -> Result<Self, DecimalParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DecimalParseError);
        }
        // Split off an exponent part: 1.5e-3
        let (mantissa, exp_part) = match s.find(['e', 'E']) {
            Some(i) => (&s[..i], s[i + 1..].parse::<i32>().map_err(|_| DecimalParseError)?),
            None => (s, 0),
        };
        let (int_part, frac_part) = match mantissa.find('.') {
            Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
            None => (mantissa, ""),
        };
        if frac_part.contains(['+', '-']) {
            return Err(DecimalParseError);
        }
        let digits: String = format!("{}{}", int_part, frac_part);
        if digits.is_empty() || digits == "+" || digits == "-" {
            return Err(DecimalParseError);
        }
        let coefficient = BigInt::from_str(&digits).map_err(|_| DecimalParseError)?;
        let exponent = exp_part - frac_part.len() as i32;
        Ok(Self { coefficient, exponent })
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

impl Add for &Decimal {
    type Output = Decimal;
    fn add(self, rhs: &Decimal) -> Decimal {
        let (a, b, exp) = self.align(rhs);
        Decimal { coefficient: a + b, exponent: exp }
    }
}

impl Sub for &Decimal {
    type Output = Decimal;
    fn sub(self, rhs: &Decimal) -> Decimal {
        let (a, b, exp) = self.align(rhs);
        Decimal { coefficient: a - b, exponent: exp }
    }
}

impl Mul for &Decimal {
    type Output = Decimal;
    fn mul(self, rhs: &Decimal) -> Decimal {
        Decimal {
            coefficient: &self.coefficient * &rhs.coefficient,
            exponent: self.exponent + rhs.exponent,
        }
    }
}

impl Div for &Decimal {
    type Output = Option<Decimal>;
    fn div(self, rhs: &Decimal) -> Option<Decimal> {
        self.div_with_scale(rhs, DIV_SCALE)
    }
}

impl Rem for &Decimal {
    type Output = Option<Decimal>;
    fn rem(self, rhs: &Decimal) -> Option<Decimal> {
        if rhs.is_zero() {
            return None;
        }
        let (a, b, exp) = self.align(rhs);
        Some(Decimal { coefficient: a % b, exponent: exp })
    }
}

impl Neg for &Decimal {
    type Output = Decimal;
    fn neg(self) -> Decimal {
        Decimal {
            coefficient: -self.coefficient.clone(),
            exponent: self.exponent,
        }
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let (a, b, _) = self.align(other);
        a == b
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b, _) = self.align(other);
        a.cmp(&b)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent >= 0 {
            let scaled = &self.coefficient * pow10(self.exponent as u32);
            return write!(f, "{}", scaled);
        }
        let scale = (-self.exponent) as usize;
        let abs = self.coefficient.abs().to_string();
        let sign = if self.coefficient.is_negative() { "-" } else { "" };
        let digits = if abs.len() > scale {
            format!("{}.{}", &abs[..abs.len() - scale], &abs[abs.len() - scale..])
        } else {
            format!("0.{}{}", "0".repeat(scale - abs.len()), abs)
        };
        write!(f, "{}{}", sign, digits)
    }
}
