//! Kubernetes resource quantity parsing
//!
//! Quantities are strings such as `500m`, `2`, `4Gi` or `1e3`. CPU values are
//! read at milli precision and converted to fractional cores, memory values
//! are read as whole bytes. Both round up, like the control plane does when
//! it scales a quantity down.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Error parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// Mantissa and exponents of a parsed quantity.
/// Value = (-1)^negative * mantissa * 2^binary_exp * 10^(decimal_exp - fraction_digits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Parsed {
    negative: bool,
    mantissa: i128,
    fraction_digits: i32,
    decimal_exp: i32,
    binary_exp: u32,
}

/// Allocatable/requested CPU in fractional cores
pub fn cpu_cores(quantity: &Quantity) -> Result<f64, QuantityError> {
    Ok(scaled_value(&quantity.0, 3)? as f64 / 1000.0)
}

/// Memory in bytes
pub fn bytes(quantity: &Quantity) -> Result<f64, QuantityError> {
    Ok(scaled_value(&quantity.0, 0)? as f64)
}

/// Value of `input` multiplied by `10^scale`, rounded away from zero
pub fn scaled_value(input: &str, scale: i32) -> Result<i128, QuantityError> {
    let parsed = parse(input)?;
    let out_of_range = || QuantityError::OutOfRange(input.to_string());

    let numerator = 2i128
        .checked_pow(parsed.binary_exp)
        .and_then(|factor| parsed.mantissa.checked_mul(factor))
        .ok_or_else(out_of_range)?;
    if numerator == 0 {
        return Ok(0);
    }

    let exp = parsed
        .decimal_exp
        .checked_sub(parsed.fraction_digits)
        .and_then(|exp| exp.checked_add(scale))
        .ok_or_else(out_of_range)?;
    let magnitude = if exp >= 0 {
        10i128
            .checked_pow(exp as u32)
            .and_then(|factor| numerator.checked_mul(factor))
            .ok_or_else(out_of_range)?
    } else {
        match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(divisor) => ceil_div(numerator, divisor),
            // Divisor exceeds any representable numerator
            None => i128::from(numerator > 0),
        }
    };

    Ok(if parsed.negative { -magnitude } else { magnitude })
}

fn ceil_div(numerator: i128, divisor: i128) -> i128 {
    let quotient = numerator / divisor;
    if numerator % divisor == 0 {
        quotient
    } else {
        quotient + 1
    }
}

fn parse(input: &str) -> Result<Parsed, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let invalid = || QuantityError::Invalid(input.to_string());

    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_end);

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    let digits: String = whole.chars().chain(fraction.chars()).collect();
    let digits = digits.trim_start_matches('0');
    if digits.len() > 36 {
        return Err(QuantityError::OutOfRange(input.to_string()));
    }
    let mantissa = if digits.is_empty() {
        0
    } else {
        digits.parse::<i128>().map_err(|_| invalid())?
    };

    let (decimal_exp, binary_exp) = parse_suffix(suffix).ok_or_else(invalid)?;
    let fraction_digits = i32::try_from(fraction.len())
        .map_err(|_| QuantityError::OutOfRange(input.to_string()))?;

    Ok(Parsed {
        negative,
        mantissa,
        fraction_digits,
        decimal_exp,
        binary_exp,
    })
}

/// Returns `(decimal exponent, binary exponent)` for a suffix
fn parse_suffix(suffix: &str) -> Option<(i32, u32)> {
    let exponents = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            if exponent.is_empty() {
                return None;
            }
            let value: i32 = exponent.parse().ok()?;
            (value, 0)
        }
    };
    Some(exponents)
}
