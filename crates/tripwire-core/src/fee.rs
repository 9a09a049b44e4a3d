//! Fee-rate grids and fee arithmetic.
//!
//! Trigger and panic transactions are pre-signed at a whole grid of fee rates
//! so that at least one variant stays broadcastable if the fee market moves
//! after the vault is funded. Log spacing gives finer granularity at the low
//! rates that actually occur while still covering rare spikes.

use bitcoin::Amount;
use thiserror::Error;

/// Upper bound on a single fee rate, in sat/vB.
pub const MAX_RATE: f64 = 1_000_000.0;

/// Upper bound on the number of grid points.
pub const MAX_SAMPLES: usize = 100_000;

#[derive(Error, Debug)]
pub enum FeeError {
    #[error("invalid sampling parameter: {0}")]
    InvalidParameter(String),
}

/// Generate a monotonic grid of exactly `count` fee rates spanning
/// `[min_rate, max_rate]`.
///
/// The first value is exactly `min_rate` and the last exactly `max_rate`.
/// Log mode steps by the constant factor `(max/min)^(1/(count-1))`, linear
/// mode by a constant additive step.
pub fn sample_rates(
    min_rate: f64,
    max_rate: f64,
    count: usize,
    log_scale: bool,
) -> Result<Vec<f64>, FeeError> {
    if !min_rate.is_finite() || !max_rate.is_finite() {
        return Err(FeeError::InvalidParameter("rates must be finite".into()));
    }
    if min_rate < 1.0 || min_rate > max_rate || max_rate > MAX_RATE {
        return Err(FeeError::InvalidParameter(format!(
            "rates must satisfy 1 <= {} <= {} <= {}",
            min_rate, max_rate, MAX_RATE
        )));
    }
    if !(2..=MAX_SAMPLES).contains(&count) {
        return Err(FeeError::InvalidParameter(format!(
            "sample count {} outside [2, {}]",
            count, MAX_SAMPLES
        )));
    }

    let mut rates = Vec::with_capacity(count);
    if log_scale {
        let factor = (max_rate / min_rate).powf(1.0 / (count - 1) as f64);
        let mut rate = min_rate;
        for _ in 0..count - 1 {
            rates.push(rate);
            rate *= factor;
        }
    } else {
        let step = (max_rate - min_rate) / (count - 1) as f64;
        for i in 0..count - 1 {
            rates.push(min_rate + step * i as f64);
        }
    }
    // Close the grid on the exact ceiling, not an accumulated approximation.
    rates.push(max_rate);

    Ok(rates)
}

/// Miner fee for a transaction of `vsize` virtual bytes at `rate` sat/vB,
/// rounded up to a whole satoshi.
pub fn fee_for_vsize(rate: f64, vsize: usize) -> Amount {
    Amount::from_sat((rate * vsize as f64).ceil() as u64)
}
