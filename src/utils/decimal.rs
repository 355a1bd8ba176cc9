//! Decimal arithmetic utilities for prices and PnL.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Number of decimals the router uses for prices.
pub const PRICE_DECIMALS: u32 = 18;

/// Convert a fixed-point integer with `decimals` places into a decimal.
///
/// Returns `None` if the value does not fit in a `Decimal`.
pub fn from_fixed_point(raw: u128, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(raw).ok()?;
    if decimals <= 28 {
        return Decimal::try_from_i128_with_scale(raw, decimals).ok();
    }
    // Beyond the supported scale: shift the surplus digits off first.
    let surplus = 10i128.checked_pow(decimals - 28)?;
    Decimal::try_from_i128_with_scale(raw / surplus, 28).ok()
}

/// Convert an 18-decimal router price into USD.
pub fn price_from_wei(raw: u128) -> Option<Decimal> {
    from_fixed_point(raw, PRICE_DECIMALS)
}

/// Relative change of `current` against `reference`, in percent.
///
/// Returns `None` when `reference` is zero or the result overflows.
pub fn percent_change(current: Decimal, reference: Decimal) -> Option<Decimal> {
    if reference == Decimal::ZERO {
        return None;
    }
    current
        .checked_sub(reference)?
        .checked_div(reference)?
        .checked_mul(dec!(100))
}
