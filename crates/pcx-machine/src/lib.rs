//! A PC assembled around `pcx-cpu-core`: CPU engine, physical memory, port I/O, an interrupt
//! controller and the cycle scheduler that keeps timed devices in step with the CPU.
//!
//! Concrete chipset devices live outside this crate. They are plugged in as [`IoDevice`]s,
//! [`MmioHandler`]s and [`TimedDevice`]s; the interrupt controller is the caller's type.
#![forbid(unsafe_code)]

mod config;
mod input;

use std::ops::RangeInclusive;

use pcx_cpu_core::{
    ConfigError, CpuState, Engine, InterruptController, IoBus, IoDevice, IoDeviceId, MmioHandler,
    PhysicalMemory, Step, StepExit,
};
use pcx_timers::{DeviceId, Scheduler, TimedDevice};
use tracing::{debug, trace, warn};

pub use config::MachineConfig;
pub use input::{InputEvent, InputQueue, InputSender, InputSink};

/// What timed devices act on when they fire: the interrupt controller.
pub type IrqContext = dyn InterruptController;

/// Why [`Machine::run_slice`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget was used up.
    Completed { cycles: u64 },
    /// The budget was used up with the CPU halted and nothing pending.
    Halted { cycles: u64 },
    /// The CPU triple faulted and the guest was reset.
    Reset { cycles: u64 },
}

impl RunExit {
    /// Guest cycles consumed by the slice.
    pub fn cycles(&self) -> u64 {
        match *self {
            RunExit::Completed { cycles }
            | RunExit::Halted { cycles }
            | RunExit::Reset { cycles } => cycles,
        }
    }
}

pub struct Machine<P: InterruptController + 'static> {
    config: MachineConfig,
    engine: Engine,
    memory: PhysicalMemory,
    io: IoBus,
    pic: P,
    scheduler: Scheduler<IrqContext>,
    input: InputQueue,
    input_sink: Option<Box<dyn InputSink>>,
    cycles_since_sweep: u64,
    resets: u64,
}

impl<P: InterruptController + 'static> Machine<P> {
    pub fn new(config: MachineConfig, pic: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let memory = PhysicalMemory::new(config.ram_size_bytes)?;
        debug!(
            model = ?config.cpu_model,
            ram = config.ram_size_bytes,
            hz = config.base_frequency_hz,
            "machine created"
        );
        Ok(Self {
            engine: Engine::new(config.cpu_config()),
            memory,
            io: IoBus::new(),
            pic,
            scheduler: Scheduler::new(config.base_frequency_hz),
            input: InputQueue::new(),
            input_sink: None,
            cycles_since_sweep: 0,
            resets: 0,
            config,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CpuState {
        &self.engine.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.engine.cpu
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    pub fn io_mut(&mut self) -> &mut IoBus {
        &mut self.io
    }

    pub fn pic(&self) -> &P {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut P {
        &mut self.pic
    }

    /// Guest resets caused by triple faults or [`Machine::reset`].
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Cycles handed to the scheduler since power-on.
    pub fn elapsed_cycles(&self) -> u64 {
        self.scheduler.elapsed_cycles()
    }

    // --- wiring ---

    pub fn load_ram(&mut self, paddr: u32, data: &[u8]) -> Result<(), ConfigError> {
        self.memory.load_ram(paddr, data)
    }

    pub fn map_rom(&mut self, base: u32, image: Vec<u8>) -> Result<(), ConfigError> {
        self.memory.map_rom(base, image)
    }

    pub fn map_mmio(
        &mut self,
        base: u32,
        len: u32,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), ConfigError> {
        self.memory.map_mmio(base, len, handler)
    }

    pub fn register_io(
        &mut self,
        ports: RangeInclusive<u16>,
        device: Box<dyn IoDevice>,
    ) -> Result<IoDeviceId, ConfigError> {
        self.io.register(ports, device)
    }

    pub fn add_timed_device(&mut self, device: Box<dyn TimedDevice<IrqContext>>) -> DeviceId {
        self.scheduler.add_device(device)
    }

    pub fn set_base_frequency(&mut self, hz: f64) -> Result<(), ConfigError> {
        MachineConfig {
            base_frequency_hz: hz,
            ..self.config.clone()
        }
        .validate()?;
        self.config.base_frequency_hz = hz;
        self.scheduler.set_base_frequency(hz);
        Ok(())
    }

    /// The chipset's A20 gate (keyboard controller output port or port 0x92).
    pub fn set_a20(&mut self, enabled: bool) {
        self.engine.cpu.mmu.set_a20(enabled);
    }

    pub fn input_sender(&self) -> InputSender {
        self.input.sender()
    }

    pub fn set_input_sink(&mut self, sink: Box<dyn InputSink>) {
        self.input_sink = Some(sink);
    }

    // --- execution ---

    /// Guest reset: processor state back to power-on, cached code dropped, devices reset.
    pub fn reset(&mut self) {
        debug!(resets = self.resets + 1, "guest reset");
        self.resets += 1;
        self.engine.reset(&mut self.memory);
        self.io.reset();
        self.cycles_since_sweep = 0;
    }

    /// Run one engine step and give its cycles to the timed devices.
    pub fn step(&mut self) -> Step {
        let step = self.engine.step(&mut self.memory, &mut self.io, &mut self.pic);
        self.scheduler.update_clock(step.cycles, &mut self.pic);

        self.cycles_since_sweep += step.cycles;
        if self.cycles_since_sweep >= self.config.sweep_interval_cycles {
            self.cycles_since_sweep = 0;
            let swept = self.engine.sweep_code_cache(&mut self.memory);
            trace!(swept, "code cache sweep");
        }

        if step.exit == StepExit::TripleFault {
            warn!(eip = self.engine.cpu.eip, "triple fault, resetting guest");
            self.reset();
        }
        step
    }

    /// Deliver queued host input to the sink.
    pub fn pump_input(&mut self) {
        let events = self.input.take_all();
        if events.is_empty() {
            return;
        }
        let Some(sink) = self.input_sink.as_mut() else {
            trace!(dropped = events.len(), "input without a sink");
            return;
        };
        for event in events {
            sink.handle_input(event, &mut self.pic);
        }
    }

    /// Run for at least `max_cycles` guest cycles (the last step may overshoot).
    ///
    /// Halted time still advances the timed devices so that they can raise the interrupt that
    /// wakes the CPU.
    pub fn run_slice(&mut self, max_cycles: u64) -> RunExit {
        self.pump_input();
        let mut cycles = 0u64;
        while cycles < max_cycles {
            let step = self.step();
            cycles += step.cycles.max(1);
            if step.exit == StepExit::TripleFault {
                return RunExit::Reset { cycles };
            }
        }
        if self.engine.cpu.halted && !self.pic.is_pending() {
            RunExit::Halted { cycles }
        } else {
            RunExit::Completed { cycles }
        }
    }
}
