//! Literal text parsing and half-precision bit conversion

use crate::diagnostics::{InternalError, Result};
use crate::lir::Kind;

fn invalid(value: &str, kind: Kind) -> crate::diagnostics::Error {
    InternalError::InvalidLiteral {
        value: value.to_string(),
        kind,
    }
    .into()
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(invalid(other, Kind::Bool)),
    }
}

/// Integer literal truncated to the kind's width
pub fn parse_int(value: &str, kind: Kind) -> Result<u64> {
    let text = value.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|_| invalid(text, kind))?;

    let raw = if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    };
    Ok(mask(raw, kind.bits()))
}

pub fn parse_float(value: &str, kind: Kind) -> Result<f64> {
    let text = value.trim();
    let trimmed = text
        .strip_suffix('f')
        .or_else(|| text.strip_suffix('F'))
        .unwrap_or(text);
    match trimmed {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        _ => trimmed.parse::<f64>().map_err(|_| invalid(text, kind)),
    }
}

pub fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Sign-extend the low `bits` of `value`
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_masks() {
        assert_eq!(parse_int("-1", Kind::I8).unwrap(), 0xff);
        assert_eq!(parse_int("-1", Kind::I32).unwrap(), 0xffff_ffff);
        assert_eq!(parse_int("0x10", Kind::I64).unwrap(), 16);
        assert_eq!(parse_int("300", Kind::I8).unwrap(), 44);
        assert!(parse_int("1.5", Kind::I32).is_err());
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xff, 8), -1);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0xffff_fffe, 32), -2);
    }

    #[test]
    fn test_parse_float_suffix() {
        assert_eq!(parse_float("2.5f", Kind::F32).unwrap(), 2.5);
        assert!(parse_float("abc", Kind::F32).is_err());
    }
}
