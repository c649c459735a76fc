//! The fetch/execute loop: interrupt acceptance, block lookup, fault dispatch and cycle
//! accounting.

use std::rc::Rc;
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use pcx_mmu::AccessType;
use tracing::{debug, trace, warn};

use crate::bus::{IoBus, PhysicalMemory};
use crate::code_cache::{CacheStats, CodeBlock, CodeCache};
use crate::ctx::ExecCtx;
use crate::decoder::{decode_one, DecodeFailure, ExecOutcome, Insn, MAX_INSN_LEN};
use crate::fault::{ConfigError, Fault, GP0};
use crate::flags::CpuModel;
use crate::interrupts::{deliver_interrupt, raise_fault, FaultDelivery, InterruptController, InterruptSource};
use crate::registers::OpSize;
use crate::segment::SegReg;
use crate::state::CpuState;

/// DR6.BS: the #DB was raised by single-stepping.
const DR6_BS: u32 = 1 << 14;

/// Cycles charged per unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleCosts {
    pub instruction: u64,
    pub interrupt_ack: u64,
    /// Charged per step while halted.
    pub idle: u64,
    pub rep_iteration: u64,
}

impl Default for CycleCosts {
    fn default() -> Self {
        Self {
            instruction: 1,
            interrupt_ack: 20,
            idle: 100,
            rep_iteration: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub costs: CycleCosts,
    /// Iterations a REP string instruction runs before the engine looks at interrupts again.
    pub rep_budget: u32,
    /// Blocks unused for this long are dropped by [`Engine::sweep_code_cache`].
    pub cache_unused_window: Duration,
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rep_budget == 0 {
            return Err(ConfigError::InvalidRepBudget);
        }
        Ok(())
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::default(),
            costs: CycleCosts::default(),
            rep_budget: 4096,
            cache_unused_window: Duration::from_secs(10),
        }
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// Instructions ran normally.
    Executed,
    /// An external interrupt with this vector was accepted.
    Interrupted(u8),
    /// The processor is halted waiting for an interrupt.
    Halted,
    /// An instruction faulted and the exception was delivered.
    Fault(Fault),
    /// Exception delivery failed three times over; the machine must reset.
    TripleFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub cycles: u64,
    pub exit: StepExit,
}

/// One emulated CPU together with its decoded-code cache.
#[derive(Debug)]
pub struct Engine {
    pub cpu: CpuState,
    cache: CodeCache,
    config: CpuConfig,
}

impl Engine {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            cpu: CpuState::new(config.model),
            cache: CodeCache::new(config.model),
            config,
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Cached block count.
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// RESET: architectural state back to power-on and every cached block dropped.
    pub fn reset(&mut self, mem: &mut PhysicalMemory) {
        debug!("engine reset");
        self.cpu.reset();
        self.cache.invalidate_all(mem);
    }

    /// Drop blocks that have not run recently.
    pub fn sweep_code_cache(&mut self, mem: &mut PhysicalMemory) -> usize {
        self.cache
            .sweep_unused(mem, Instant::now(), self.config.cache_unused_window)
    }

    /// Run until the end of the current block, a control transfer, a fault or an interrupt.
    pub fn step(
        &mut self,
        mem: &mut PhysicalMemory,
        io: &mut IoBus,
        pic: &mut dyn InterruptController,
    ) -> Step {
        let step = self.step_inner(mem, io, pic);
        self.cpu.tsc = self.cpu.tsc.wrapping_add(step.cycles);
        step
    }

    fn step_inner(
        &mut self,
        mem: &mut PhysicalMemory,
        io: &mut IoBus,
        pic: &mut dyn InterruptController,
    ) -> Step {
        let costs = self.config.costs;
        let rep_budget = self.config.rep_budget;

        if !self.cpu.interrupt_shadow && self.cpu.flags.interrupts_enabled() && pic.is_pending() {
            self.cpu.halted = false;
            let vector = pic.get_interrupt();
            let mut ctx = ExecCtx::new(&mut self.cpu, mem, io, pic, rep_budget);
            let exit = match deliver_interrupt(&mut ctx, vector, InterruptSource::External, None) {
                Ok(()) => StepExit::Interrupted(vector),
                Err(fault) => dispatch_fault(&mut ctx, fault),
            };
            return Step {
                cycles: costs.interrupt_ack,
                exit,
            };
        }

        if self.cpu.halted {
            return Step {
                cycles: costs.idle,
                exit: StepExit::Halted,
            };
        }

        let block = match self.fetch_block(mem, io, pic, rep_budget) {
            Ok(block) => block,
            Err(exit) => {
                return Step {
                    cycles: costs.instruction,
                    exit,
                }
            }
        };

        let mut ctx = ExecCtx::new(&mut self.cpu, mem, io, pic, rep_budget);
        ctx.rep_iteration_cycles = costs.rep_iteration;
        let (executed, exit) = run_block(&mut ctx, &block);
        Step {
            cycles: executed * costs.instruction + ctx.extra_cycles,
            exit,
        }
    }

    /// Translate CS:EIP and look up (or decode) the block there.
    fn fetch_block(
        &mut self,
        mem: &mut PhysicalMemory,
        io: &mut IoBus,
        pic: &mut dyn InterruptController,
        rep_budget: u32,
    ) -> Result<Rc<CodeBlock>, StepExit> {
        let code32 = self.cpu.code32();
        let paddr = {
            let mut ctx = ExecCtx::new(&mut self.cpu, mem, io, pic, rep_budget);
            let eip = ctx.cpu.eip;
            let user = ctx.cpu.cpl == 3;
            let translated = ctx
                .linear_address(SegReg::Cs, eip, 1, AccessType::Execute)
                .and_then(|linear| ctx.translate(linear, AccessType::Execute, user));
            match translated {
                Ok(paddr) => paddr,
                Err(fault) => return Err(dispatch_fault(&mut ctx, fault)),
            }
        };

        match self.cache.fetch(mem, paddr, code32) {
            Ok(block) => Ok(block),
            Err(DecodeFailure::CrossesPage(_)) => {
                let mut ctx = ExecCtx::new(&mut self.cpu, mem, io, pic, rep_budget);
                match fetch_straddling(&mut ctx, paddr, code32) {
                    Ok(block) => Ok(Rc::new(block)),
                    Err(fault) => Err(dispatch_fault(&mut ctx, fault)),
                }
            }
        }
    }
}

/// Decode the single instruction that continues onto the next page, reading through the
/// linear address space. The result is never cached.
fn fetch_straddling(ctx: &mut ExecCtx, paddr: u32, code32: bool) -> Result<CodeBlock, Fault> {
    let eip = ctx.cpu.eip;
    let mut bytes = Vec::with_capacity(MAX_INSN_LEN);
    let mut first_fault = None;
    for i in 0..MAX_INSN_LEN as u32 {
        let offset = eip.wrapping_add(i);
        let fetched = ctx
            .linear_address(SegReg::Cs, offset, 1, AccessType::Execute)
            .and_then(|linear| ctx.read_linear(linear, OpSize::Byte));
        match fetched {
            Ok(byte) => bytes.push(byte as u8),
            Err(fault) => {
                first_fault = Some(fault);
                break;
            }
        }
    }
    let model = ctx.cpu.model;
    match decode_one(&bytes, code32, model) {
        Some(insn) => Ok(CodeBlock::new(paddr, code32, vec![insn])),
        None => Err(first_fault.unwrap_or(GP0)),
    }
}

/// Deliver `fault` and report the step outcome. `cpu.eip` must already point at the
/// instruction to report.
fn dispatch_fault(ctx: &mut ExecCtx, fault: Fault) -> StepExit {
    trace!(%fault, eip = ctx.cpu.eip, "fault");
    ctx.cpu.halted = false;
    match raise_fault(ctx, fault) {
        FaultDelivery::Delivered => StepExit::Fault(fault),
        FaultDelivery::TripleFault => {
            warn!(%fault, "triple fault");
            StepExit::TripleFault
        }
    }
}

/// Execute instructions of `block`. Returns the number retired and how the step ended.
fn run_block(ctx: &mut ExecCtx, block: &CodeBlock) -> (u64, StepExit) {
    let eip_mask = if block.code32() { u32::MAX } else { 0xffff };
    ctx.mem
        .code_watch_mut()
        .begin_block(block.start(), block.end());
    let mut executed = 0;
    let mut exit = StepExit::Executed;

    for insn in block.insns() {
        // A shadow left by STI or an SS load covers exactly this instruction; the step ends
        // once it retires.
        let shadowed = std::mem::take(&mut ctx.cpu.interrupt_shadow);
        let single_step = ctx.cpu.flags.tf();
        ctx.insn_eip = ctx.cpu.eip;
        ctx.cpu.eip = ctx.cpu.eip.wrapping_add(insn.len) & eip_mask;

        let outcome = execute(ctx, insn);
        executed += 1;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(fault) => {
                ctx.cpu.eip = ctx.insn_eip;
                exit = dispatch_fault(ctx, fault);
                break;
            }
        };

        if outcome == ExecOutcome::Halt {
            exit = StepExit::Halted;
            break;
        }
        if single_step && outcome != ExecOutcome::RepInterrupted {
            ctx.cpu.debug_regs[6] |= DR6_BS;
            exit = dispatch_fault(ctx, Fault::Debug);
            break;
        }
        if ctx.mem.code_watch_mut().take_abort() {
            trace!(eip = ctx.cpu.eip, "block modified while executing");
            break;
        }
        if outcome != ExecOutcome::Continue || shadowed {
            break;
        }
    }

    ctx.mem.code_watch_mut().end_block();
    (executed, exit)
}

#[inline]
fn execute(ctx: &mut ExecCtx, insn: &Insn) -> Result<ExecOutcome, Fault> {
    (insn.handler)(ctx, insn)
}
