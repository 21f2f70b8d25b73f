use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};

/// Largest decimals value whose scale still fits in a u128.
const MAX_DECIMALS: u32 = 38;

/// An amount carried both as exact smallest units and as a display string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenAmount {
    /// smallest unit, serialized as a string so JS consumers keep precision
    #[serde(serialize_with = "serialize_u128")]
    pub raw: u128,
    pub formatted: String,
}

impl TokenAmount {
    pub fn from_raw(raw: u128, decimals: u32) -> Self {
        Self {
            raw,
            formatted: format_units(raw, decimals),
        }
    }
}

fn serialize_u128<S: serde::Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_string())
}

fn scale(decimals: u32) -> LedgerResult<u128> {
    if decimals > MAX_DECIMALS {
        return Err(LedgerError::configuration(format!(
            "token decimals {} exceeds {}",
            decimals, MAX_DECIMALS
        )));
    }
    Ok(10u128.pow(decimals))
}

/// Parse a human decimal string ("0.5", "12", "1.000") into smallest units.
/// Zero, negative, malformed and over-precise input is rejected.
pub fn parse_units(input: &str, decimals: u32) -> LedgerResult<u128> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidAmount("amount is required".into()));
    }
    if trimmed.starts_with('-') {
        return Err(LedgerError::InvalidAmount(format!("{} is negative", trimmed)));
    }

    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(LedgerError::InvalidAmount(format!("{} is not a number", trimmed)));
    }
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return Err(LedgerError::InvalidAmount(format!("{} is not a number", trimmed)));
    }

    let frac = frac.trim_end_matches('0');
    if frac.len() as u32 > decimals {
        return Err(LedgerError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            trimmed, decimals
        )));
    }

    let unit = scale(decimals)?;
    let overflow = || LedgerError::InvalidAmount(format!("{} is too large", trimmed));

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().map_err(|_| overflow())?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        padded.parse::<u128>().map_err(|_| overflow())?
    };

    let raw = whole_units
        .checked_mul(unit)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(overflow)?;

    if raw == 0 {
        return Err(LedgerError::InvalidAmount("amount must be greater than zero".into()));
    }
    Ok(raw)
}

/// Render smallest units as a decimal string without trailing zeros.
pub fn format_units(raw: u128, decimals: u32) -> String {
    if decimals == 0 {
        return raw.to_string();
    }
    let digits = raw.to_string();
    let decimals = decimals as usize;
    let (whole, frac) = if digits.len() > decimals {
        let split = digits.len() - decimals;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{:0>width$}", digits, width = decimals))
    };
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole
    } else {
        format!("{}.{}", whole, frac)
    }
}
