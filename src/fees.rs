//! Exchange Fee Calculation
//! Mission: A profitable trade on paper must be profitable in reality
//!
//! Fee schedule:
//!     taker fee = ceil(0.07   * C * P * (1 - P))   per order, in cents
//!     maker fee = ceil(0.0175 * C * P * (1 - P))   (25% of taker)
//!
//! C = number of contracts, P = contract price in dollars (0.0 - 1.0).
//! No settlement fee, no membership fee.

/// Round to 8 decimal places before ceiling, to suppress float drift like
/// `1.7500000000000002` turning a 2-cent fee into 3 cents.
#[inline]
fn ceil_cents(raw_cents: f64) -> f64 {
    ((raw_cents * 1e8).round() / 1e8).ceil()
}

/// Taker fee in dollars for `count` contracts at `price`.
pub fn taker_fee(count: i64, price: f64) -> f64 {
    if count <= 0 || price <= 0.0 || price >= 1.0 {
        return 0.0;
    }
    let raw_cents = 7.0 * count as f64 * price * (1.0 - price);
    ceil_cents(raw_cents) / 100.0
}

/// Maker (resting) fee in dollars.
pub fn maker_fee(count: i64, price: f64) -> f64 {
    if count <= 0 || price <= 0.0 || price >= 1.0 {
        return 0.0;
    }
    let raw_cents = 1.75 * count as f64 * price * (1.0 - price);
    ceil_cents(raw_cents) / 100.0
}

/// Total fees for a buy + sell round trip, both sides as taker.
pub fn estimate_round_trip_fees(count: i64, buy_price: f64, sell_price: f64) -> f64 {
    taker_fee(count, buy_price) + taker_fee(count, sell_price)
}

/// Maximum taker fee for a single contract at a given price.
pub fn max_fee_per_contract(price: f64) -> f64 {
    taker_fee(1, price)
}

/// Whether a mispricing survives fees with a safety margin.
///
/// `magnitude` is the raw spread in dollars per contract; `prices` the leg
/// prices involved. The safety multiplier (default 2.0) is the single knob
/// protecting against fee-edge losses.
pub fn is_profitable_after_fees(
    magnitude: f64,
    count: i64,
    prices: &[f64],
    safety_multiplier: f64,
) -> bool {
    let total_fees: f64 = prices.iter().map(|&p| taker_fee(count, p)).sum();
    let fee_per_contract = if count > 0 {
        total_fees / count as f64
    } else {
        0.0
    };
    magnitude > fee_per_contract * safety_multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taker_fee_seed_values() {
        assert_eq!(taker_fee(1, 0.50), 0.02);
        assert_eq!(taker_fee(100, 0.50), 1.75);
        assert_eq!(taker_fee(1, 0.05), 0.01);
        assert_eq!(taker_fee(0, 0.50), 0.00);
        assert_eq!(taker_fee(10, 1.0), 0.00);
        assert_eq!(taker_fee(10, 0.0), 0.00);
        assert_eq!(taker_fee(-5, 0.50), 0.00);
    }

    #[test]
    fn taker_fee_is_symmetric_around_half() {
        for count in [1, 7, 100, 2500] {
            for p in [0.01, 0.05, 0.13, 0.25, 0.37, 0.49] {
                assert_eq!(
                    taker_fee(count, p),
                    taker_fee(count, 1.0 - p),
                    "fee symmetry broken at count={} p={}",
                    count,
                    p
                );
            }
        }
    }

    #[test]
    fn maker_fee_is_quarter_schedule() {
        // 1.75 * 100 * 0.25 = 43.75 cents -> ceil 44
        assert_eq!(maker_fee(100, 0.50), 0.44);
        assert_eq!(maker_fee(0, 0.50), 0.00);
        assert!(maker_fee(100, 0.50) < taker_fee(100, 0.50));
    }

    #[test]
    fn round_trip_sums_both_legs() {
        let rt = estimate_round_trip_fees(10, 0.40, 0.60);
        assert_eq!(rt, taker_fee(10, 0.40) + taker_fee(10, 0.60));
    }

    #[test]
    fn no_float_drift_on_ceil() {
        // 7 * 3 * 0.5 * 0.5 = 5.25 exactly; drift would ceil to 6
        assert_eq!(taker_fee(3, 0.50), 0.06);
        // 7 * 1 * 0.3 * 0.7 = 1.47 -> 2 cents
        assert_eq!(taker_fee(1, 0.30), 0.02);
    }

    #[test]
    fn profitability_hurdle() {
        // Fees at 0.65/0.50 are 2c + 2c = 4c for one contract; with the
        // default 2x safety a 13-cent spread clears, a 7-cent one does not.
        assert!(is_profitable_after_fees(0.13, 1, &[0.65, 0.50], 2.0));
        assert!(!is_profitable_after_fees(0.07, 1, &[0.65, 0.50], 2.0));
        // Degenerate count never divides by zero
        assert!(!is_profitable_after_fees(0.0, 0, &[0.5], 2.0));
    }
}
