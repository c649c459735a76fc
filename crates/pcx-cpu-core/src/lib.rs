//! x86 processor core for an IBM-PC class machine: 8086 through Pentium.
//!
//! The pieces, bottom up:
//! - [`registers`], [`flags`]: architectural register file and EFLAGS, masked by [`CpuModel`].
//! - [`descriptor`], [`segment`], [`protection`]: selectors, descriptor parsing, segment loads
//!   and the privilege rules around them.
//! - [`task`]: the task register, TSS layouts and hardware task switching.
//! - [`bus`]: physical memory with code-write tracking, and the port I/O bus.
//! - [`decoder`], [`code_cache`]: instructions decoded once per physical address and cached in
//!   per-page blocks that are dropped when the guest writes over them.
//! - [`engine`]: the step loop that accepts interrupts, runs blocks and dispatches faults.
//!
//! Paging lives in the `pcx-mmu` crate; the TLB sits inside [`CpuState`].
#![forbid(unsafe_code)]

pub mod bus;
pub mod code_cache;
pub mod ctx;
pub mod decoder;
pub mod descriptor;
pub mod engine;
pub mod fault;
pub mod flags;
mod interp;
pub mod interrupts;
pub mod protection;
pub mod registers;
pub mod segment;
pub mod state;
pub mod task;

pub use bus::{IoBus, IoDevice, IoDeviceId, MmioHandler, PhysicalMemory};
pub use code_cache::{CacheStats, CodeBlock, CodeCache};
pub use ctx::ExecCtx;
pub use engine::{CpuConfig, CycleCosts, Engine, Step, StepExit};
pub use fault::{ConfigError, Fault};
pub use flags::{CpuModel, FlagRegister, Flags};
pub use interrupts::{InterruptController, InterruptSource};
pub use registers::{Gpr, OpSize, Registers};
pub use segment::SegReg;
pub use state::CpuState;

pub use pcx_mmu as mmu;
