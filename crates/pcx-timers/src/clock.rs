use crate::{to_fixed_point, TimedDevice, FRACTION_BITS};

/// A fixed-point countdown that fires once per period.
///
/// The period is expressed in CPU cycles (32.32 fixed point). Each underflow re-arms the
/// budget by adding the period to whatever remained, so the long-run rate is exact even
/// when a period is a fractional number of cycles.
#[derive(Debug, Clone, Default)]
pub struct PeriodicClock {
    period: u64,
    remaining: u64,
}

impl PeriodicClock {
    /// A clock with no period; it never fires until [`PeriodicClock::set_period`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock firing at `target_hz` on a CPU running at `base_hz`.
    pub fn with_frequencies(base_hz: f64, target_hz: f64) -> Self {
        let mut clock = Self::new();
        clock.set_frequencies(base_hz, target_hz);
        clock
    }

    pub fn set_frequencies(&mut self, base_hz: f64, target_hz: f64) {
        let period = if target_hz > 0.0 {
            to_fixed_point(base_hz / target_hz)
        } else {
            0
        };
        self.set_period(period);
    }

    /// Set the period in fixed-point cycles and restart the countdown.
    pub fn set_period(&mut self, period: u64) {
        self.period = period;
        self.remaining = period;
    }

    #[inline]
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Fixed-point cycles left until the next expiry.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.period != 0
    }

    /// Consume `cycles` whole CPU cycles and return how many periods expired.
    pub fn advance(&mut self, cycles: u64) -> u64 {
        if self.period == 0 {
            return 0;
        }

        let delta = (cycles as u128) << FRACTION_BITS;
        let remaining = self.remaining as u128;
        if delta < remaining {
            self.remaining -= delta as u64;
            return 0;
        }

        let period = self.period as u128;
        let past = delta - remaining;
        let fired = 1 + past / period;
        self.remaining = (period - past % period) as u64;
        fired.min(u64::MAX as u128) as u64
    }
}

/// A [`TimedDevice`] that invokes a callback at a fixed guest frequency.
///
/// This is the shape of the PC's periodic sources (PIT channel ticks, RTC periodic interrupt,
/// UART character clock): they only need "N periods have elapsed, act N times".
pub struct PeriodicTimer<Ctx: ?Sized, F>
where
    F: FnMut(&mut Ctx),
{
    target_hz: f64,
    clock: PeriodicClock,
    on_period: F,
    fired: u64,
    _ctx: core::marker::PhantomData<fn(&mut Ctx)>,
}

impl<Ctx: ?Sized, F> PeriodicTimer<Ctx, F>
where
    F: FnMut(&mut Ctx),
{
    pub fn new(target_hz: f64, on_period: F) -> Self {
        Self {
            target_hz,
            clock: PeriodicClock::new(),
            on_period,
            fired: 0,
            _ctx: core::marker::PhantomData,
        }
    }

    /// Total periods fired since creation.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn clock(&self) -> &PeriodicClock {
        &self.clock
    }
}

impl<Ctx: ?Sized, F> TimedDevice<Ctx> for PeriodicTimer<Ctx, F>
where
    F: FnMut(&mut Ctx),
{
    fn set_base_frequency(&mut self, hz: f64) {
        self.clock.set_frequencies(hz, self.target_hz);
    }

    fn update_clock(&mut self, cycles: u64, ctx: &mut Ctx) {
        let fired = self.clock.advance(cycles);
        for _ in 0..fired {
            (self.on_period)(ctx);
        }
        self.fired = self.fired.wrapping_add(fired);
    }
}
