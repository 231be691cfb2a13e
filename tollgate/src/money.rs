//! Fixed-point money at nanocurrency precision.
//!
//! Every stored or transmitted price and every computed total in this crate is
//! carried as an integer number of 10⁻⁹ currency units ("nanos"). Decimal
//! strings are parsed into nanos on ingestion and formatted from nanos on
//! egress; no monetary total ever passes through floating point.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;

/// Integer count of 10⁻⁹ currency units.
pub type Nanos = i64;

/// Nanos per whole currency unit (e.g. 1 USD).
pub const NANOS_PER_UNIT: i64 = 1_000_000_000;

/// Nanos per cent (10⁻² currency units).
pub const NANOS_PER_CENT: i64 = 10_000_000;

/// Parses a decimal string into nanos.
///
/// Accepts an optionally-signed decimal with up to 9 fractional digits; digits
/// beyond the ninth are truncated, never rounded. Scientific notation and
/// other non-plain input fall back to `Decimal::from_scientific` and finally
/// to a float parse-then-round. Unparseable input yields 0, matching the
/// catalog contract where an absent price means "free".
pub fn parse_decimal_to_nanos(s: &str) -> Nanos {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0;
    }

    if let Ok(dec) = Decimal::from_str(trimmed) {
        if let Some(nanos) = decimal_to_nanos(dec) {
            return nanos;
        }
    }

    if let Ok(dec) = Decimal::from_scientific(trimmed) {
        if let Some(nanos) = decimal_to_nanos(dec) {
            return nanos;
        }
    }

    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => (f * NANOS_PER_UNIT as f64).round() as Nanos,
        _ => 0,
    }
}

fn decimal_to_nanos(dec: Decimal) -> Option<Nanos> {
    // Scale to nanos, then truncate toward zero: sub-nano digits are dropped.
    dec.checked_mul(Decimal::from(NANOS_PER_UNIT))?.trunc().to_i64()
}

/// Formats nanos as an exact decimal string with `dp` fractional digits.
///
/// Always truncates toward zero, never rounds, so that
/// `parse_decimal_to_nanos(&format_nanos_exact(n, 9)) == n` for every nanos
/// value the engine can produce.
pub fn format_nanos_exact(nanos: Nanos, dp: u32) -> String {
    // i128 avoids the i64::MIN abs() edge case.
    let negative = nanos < 0;
    let abs = (nanos as i128).unsigned_abs();
    let whole = abs / NANOS_PER_UNIT as u128;
    let frac = abs % NANOS_PER_UNIT as u128;

    let sign = if negative { "-" } else { "" };
    if dp == 0 {
        return format!("{sign}{whole}");
    }

    let mut frac_digits = format!("{frac:09}");
    if (dp as usize) <= frac_digits.len() {
        frac_digits.truncate(dp as usize);
    } else {
        frac_digits.extend(std::iter::repeat('0').take(dp as usize - frac_digits.len()));
    }
    format!("{sign}{whole}.{frac_digits}")
}

/// Ceiling conversion from nanos to cents.
///
/// Any sub-cent remainder is billed in the provider's favor.
pub fn ceil_nanos_to_cents(nanos: Nanos) -> i64 {
    let cents = nanos.div_euclid(NANOS_PER_CENT);
    if nanos.rem_euclid(NANOS_PER_CENT) == 0 { cents } else { cents + 1 }
}
