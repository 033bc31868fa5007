//! Decimal arithmetic utilities for sizes and prices.

use rust_decimal::{Decimal, RoundingStrategy};

/// Tolerance below which a size or delta is treated as zero.
pub const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 9); // 1e-9

/// Round a quantity to the instrument's decimal precision (nearest, away from zero).
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Round down (toward zero) to the instrument's decimal precision.
pub fn floor_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Snap a price to the venue tick size: `round(px / tick) * tick`.
///
/// The result carries exactly as many digits as the tick size, because the
/// Follower venue rejects prices whose precision disagrees with the symbol
/// filter: `30000` with tick `0.1` must be sent as `"30000.0"`.
pub fn snap_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return price;
    }
    let mut snapped = (price / tick_size).round() * tick_size;
    snapped.rescale(tick_size.scale());
    snapped
}

/// Render a price with exactly as many digits as the tick size carries.
pub fn format_price(price: Decimal, tick_size: Decimal) -> String {
    snap_to_tick(price, tick_size).to_string()
}

/// Whether two prices agree within a small relative tolerance.
///
/// Used by snapshot recovery to re-adopt mappings after a restart, where the
/// two venues may render the same price with different trailing precision.
pub fn prices_match(a: Decimal, b: Decimal, relative_tolerance: Decimal) -> bool {
    if a == b {
        return true;
    }
    let reference = a.abs().max(b.abs());
    if reference == Decimal::ZERO {
        return true;
    }
    ((a - b).abs() / reference) <= relative_tolerance
}

/// Signed size from a side flag: buys positive, sells negative.
pub fn signed(size: Decimal, is_buy: bool) -> Decimal {
    if is_buy {
        size
    } else {
        -size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snap_to_tick() {
        assert_eq!(snap_to_tick(dec!(30000.04), dec!(0.1)), dec!(30000.0));
        assert_eq!(snap_to_tick(dec!(30000.06), dec!(0.1)), dec!(30000.1));
        assert_eq!(snap_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(snap_to_tick(dec!(1234.5), dec!(1)), dec!(1235));
    }

    #[test]
    fn test_format_price_matches_tick_digits() {
        assert_eq!(format_price(dec!(30000), dec!(0.1)), "30000.0");
        assert_eq!(format_price(dec!(30000.04), dec!(0.1)), "30000.0");
        assert_eq!(format_price(dec!(0.12345), dec!(0.0001)), "0.1235");
        assert_eq!(format_price(dec!(1234.9), dec!(1)), "1235");
    }

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(dec!(0.0025), 3), dec!(0.003));
        assert_eq!(round_to_precision(dec!(0.0024), 3), dec!(0.002));
        assert_eq!(floor_to_precision(dec!(0.0029), 3), dec!(0.002));
    }

    #[test]
    fn test_prices_match_tolerance() {
        assert!(prices_match(dec!(30000.0), dec!(30000.0), dec!(0.0001)));
        assert!(prices_match(dec!(30000.0), dec!(30001.5), dec!(0.0001)));
        assert!(!prices_match(dec!(30000.0), dec!(30010.0), dec!(0.0001)));
        assert!(prices_match(Decimal::ZERO, Decimal::ZERO, dec!(0.0001)));
    }

    #[test]
    fn test_signed() {
        assert_eq!(signed(dec!(0.02), true), dec!(0.02));
        assert_eq!(signed(dec!(0.02), false), dec!(-0.02));
    }
}
