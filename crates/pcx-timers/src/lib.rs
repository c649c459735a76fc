//! Cycle-driven scheduling for timed PC devices.
//!
//! The CPU loop reports how many cycles each step consumed; the [`Scheduler`] forwards that
//! count to every registered [`TimedDevice`]. Devices that fire at a rate derived from the
//! CPU base frequency keep their budget in 32.32 fixed point ([`PeriodicClock`]) so that
//! fractional cycles-per-period never accumulate floating point drift.
#![forbid(unsafe_code)]

mod clock;
mod scheduler;

pub use clock::{PeriodicClock, PeriodicTimer};
pub use scheduler::{DeviceId, Scheduler};

/// Number of fractional bits in a fixed-point cycle value.
pub const FRACTION_BITS: u32 = 32;

/// `1.0` in fixed-point cycles.
pub const FIXED_ONE: u64 = 1 << FRACTION_BITS;

/// Convert a ratio (e.g. base frequency / device frequency) to 32.32 fixed point.
///
/// Negative and NaN ratios map to zero; ratios beyond the representable range saturate.
pub fn to_fixed_point(ratio: f64) -> u64 {
    if ratio.is_nan() || ratio <= 0.0 {
        return 0;
    }
    // `as` saturates for out-of-range floats.
    (ratio * FIXED_ONE as f64).round() as u64
}

pub fn from_fixed_point(value: u64) -> f64 {
    value as f64 / FIXED_ONE as f64
}

/// Elapsed guest nanoseconds for `cycles` at `base_hz`, rounded down.
pub fn cycles_to_nanos(cycles: u64, base_hz: u64) -> u64 {
    if base_hz == 0 {
        return 0;
    }
    ((cycles as u128) * 1_000_000_000u128 / base_hz as u128) as u64
}

/// A participant in cycle scheduling.
///
/// `Ctx` is whatever the device needs to act on when it fires; in a full machine this is the
/// interrupt controller.
pub trait TimedDevice<Ctx: ?Sized> {
    /// Called on registration and whenever the CPU base frequency changes.
    fn set_base_frequency(&mut self, hz: f64);

    /// Advance the device by `cycles` CPU cycles.
    fn update_clock(&mut self, cycles: u64, ctx: &mut Ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_round_trips_simple_ratios() {
        assert_eq!(to_fixed_point(1.0), FIXED_ONE);
        assert_eq!(to_fixed_point(0.5), FIXED_ONE / 2);
        assert_eq!(from_fixed_point(3 * FIXED_ONE + FIXED_ONE / 4), 3.25);
        assert_eq!(to_fixed_point(-2.0), 0);
        assert_eq!(to_fixed_point(f64::NAN), 0);
    }

    #[test]
    fn fixed_point_keeps_sub_cycle_precision() {
        // 4.77 MHz CPU driving the 1.193182 MHz PIT input: ~3.9977 cycles per tick.
        let ratio = 4_772_728.0 / 1_193_182.0;
        let fixed = to_fixed_point(ratio);
        assert!((from_fixed_point(fixed) - ratio).abs() < 1e-9);
    }

    #[test]
    fn cycles_to_nanos_uses_wide_math() {
        assert_eq!(cycles_to_nanos(1_000_000, 1_000_000), 1_000_000_000);
        assert_eq!(cycles_to_nanos(u64::MAX / 2, 4_000_000_000), 2_305_843_009_213_693_951);
        assert_eq!(cycles_to_nanos(10, 0), 0);
    }
}
