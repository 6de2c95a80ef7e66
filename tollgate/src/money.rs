//! Fixed-point money helpers.
//!
//! Amounts are `rust_decimal::Decimal` in memory and INTEGER nano-dollars
//! (scale 9) in the store, so the billing engine's conditional UPDATEs stay
//! exact integer arithmetic. Scale 9 rather than 6: per-1k prices carry six
//! fractional digits, and dividing by 1000 needs three more.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Fractional digits persisted for monetary amounts.
pub const MONEY_SCALE: u32 = 9;

/// Convert a decimal amount to stored nano-dollar units.
pub fn to_nanos(amount: Decimal) -> i64 {
    amount
        .round_dp(MONEY_SCALE)
        .checked_mul(Decimal::from(1_000_000_000i64))
        .and_then(|d| d.to_i64())
        .unwrap_or(i64::MAX)
}

/// Convert stored nano-dollar units back to a decimal amount.
pub fn from_nanos(nanos: i64) -> Decimal {
    Decimal::new(nanos, MONEY_SCALE).normalize()
}

pub fn opt_to_nanos(amount: Option<Decimal>) -> Option<i64> {
    amount.map(to_nanos)
}

pub fn opt_from_nanos(nanos: Option<i64>) -> Option<Decimal> {
    nanos.map(from_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scale_nine() {
        let cost: Decimal = "0.0000625".parse().unwrap();
        assert_eq!(to_nanos(cost), 62_500);
        assert_eq!(from_nanos(62_500), cost);
    }

    #[test]
    fn whole_dollars() {
        let ten: Decimal = "10".parse().unwrap();
        assert_eq!(to_nanos(ten), 10_000_000_000);
        assert_eq!(from_nanos(10_000_000_000), ten);
    }

    #[test]
    fn sub_nano_amounts_round() {
        let tiny: Decimal = "0.0000000004".parse().unwrap();
        assert_eq!(to_nanos(tiny), 0);
        let tiny: Decimal = "0.0000000016".parse().unwrap();
        assert_eq!(to_nanos(tiny), 2);
    }
}
