use tracing::debug;

use crate::TimedDevice;

/// Index of a device registered with a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

/// Distributes consumed CPU cycles to every timed device.
pub struct Scheduler<Ctx: ?Sized> {
    base_hz: f64,
    devices: Vec<Box<dyn TimedDevice<Ctx>>>,
    total_cycles: u64,
}

impl<Ctx: ?Sized> Scheduler<Ctx> {
    pub fn new(base_hz: f64) -> Self {
        Self {
            base_hz,
            devices: Vec::new(),
            total_cycles: 0,
        }
    }

    #[inline]
    pub fn base_frequency(&self) -> f64 {
        self.base_hz
    }

    /// Total cycles reported through [`Scheduler::update_clock`] since creation.
    #[inline]
    pub fn elapsed_cycles(&self) -> u64 {
        self.total_cycles
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Register a device; it is told the current base frequency immediately.
    pub fn add_device(&mut self, mut device: Box<dyn TimedDevice<Ctx>>) -> DeviceId {
        device.set_base_frequency(self.base_hz);
        self.devices.push(device);
        DeviceId(self.devices.len() - 1)
    }

    /// Change the CPU base frequency and notify every device.
    pub fn set_base_frequency(&mut self, hz: f64) {
        debug!(hz, "scheduler base frequency changed");
        self.base_hz = hz;
        for device in &mut self.devices {
            device.set_base_frequency(hz);
        }
    }

    pub fn update_clock(&mut self, cycles: u64, ctx: &mut Ctx) {
        if cycles == 0 {
            return;
        }
        self.total_cycles = self.total_cycles.wrapping_add(cycles);
        for device in &mut self.devices {
            device.update_clock(cycles, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeriodicTimer;

    struct Recorder {
        cycles: u64,
    }

    impl TimedDevice<Vec<u64>> for Recorder {
        fn set_base_frequency(&mut self, _hz: f64) {}

        fn update_clock(&mut self, cycles: u64, ctx: &mut Vec<u64>) {
            self.cycles += cycles;
            ctx.push(self.cycles);
        }
    }

    #[test]
    fn devices_see_every_update() {
        let mut scheduler: Scheduler<Vec<u64>> = Scheduler::new(1_000.0);
        scheduler.add_device(Box::new(Recorder { cycles: 0 }));
        let mut log = Vec::new();

        scheduler.update_clock(5, &mut log);
        scheduler.update_clock(0, &mut log);
        scheduler.update_clock(7, &mut log);
        assert_eq!(log, vec![5, 12]);
        assert_eq!(scheduler.elapsed_cycles(), 12);
    }

    #[test]
    fn base_frequency_change_reprograms_periodic_devices() {
        let mut scheduler: Scheduler<Vec<u64>> = Scheduler::new(100.0);
        scheduler.add_device(Box::new(PeriodicTimer::new(10.0, |log: &mut Vec<u64>| {
            log.push(0)
        })));
        let mut log = Vec::new();

        scheduler.update_clock(20, &mut log);
        assert_eq!(log.len(), 2);

        scheduler.set_base_frequency(200.0);
        log.clear();
        scheduler.update_clock(40, &mut log);
        assert_eq!(log.len(), 2);
    }
}
