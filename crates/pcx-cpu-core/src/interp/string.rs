//! String instructions and their REP forms.
//!
//! Each completed iteration commits its register updates, so a fault in the middle of a
//! repeated instruction restarts it with the remaining count.

use iced_x86::Mnemonic;

use super::{memory_segment, ExecResult};
use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Insn};
use crate::fault::Fault;
use crate::registers::{Gpr, OpSize};
use crate::segment::SegReg;
use crate::task::check_io;

use super::alu::sub_with_flags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    fn compares(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RepMode {
    None,
    Rep,
    Repe,
    Repne,
}

/// F3 is REPE and F2 is REPNE for CMPS/SCAS; any other string op treats both as REP.
fn effective_rep_mode(op: StringOp, insn: &Insn) -> RepMode {
    let f3 = insn.instr.has_rep_prefix();
    let f2 = insn.instr.has_repne_prefix();
    match (op.compares(), f3, f2) {
        (_, false, false) => RepMode::None,
        (true, true, _) => RepMode::Repe,
        (true, false, true) => RepMode::Repne,
        (false, _, _) => RepMode::Rep,
    }
}

fn element_size(mnemonic: Mnemonic) -> OpSize {
    use Mnemonic::*;
    match mnemonic {
        Movsb | Cmpsb | Stosb | Lodsb | Scasb | Insb | Outsb => OpSize::Byte,
        Movsw | Cmpsw | Stosw | Lodsw | Scasw | Insw | Outsw => OpSize::Word,
        _ => OpSize::Dword,
    }
}

struct StringInsn {
    op: StringOp,
    size: OpSize,
    /// Width of SI/DI/CX.
    addr: OpSize,
    src: SegReg,
}

impl StringInsn {
    fn step(&self, ctx: &ExecCtx) -> u32 {
        if ctx.cpu.flags.df() {
            self.size.bytes().wrapping_neg()
        } else {
            self.size.bytes()
        }
    }

    fn advance(&self, ctx: &mut ExecCtx, reg: Gpr) {
        let step = self.step(ctx);
        let value = ctx.cpu.regs.get(reg, self.addr).wrapping_add(step);
        ctx.cpu.regs.set(reg, self.addr, value);
    }

    fn si(&self, ctx: &ExecCtx) -> u32 {
        ctx.cpu.regs.get(Gpr::Esi, self.addr)
    }

    fn di(&self, ctx: &ExecCtx) -> u32 {
        ctx.cpu.regs.get(Gpr::Edi, self.addr)
    }

    fn port(ctx: &ExecCtx) -> u16 {
        ctx.cpu.regs.get16(Gpr::Edx)
    }

    /// One iteration. Registers change only after every memory access succeeded.
    fn once(&self, ctx: &mut ExecCtx) -> Result<(), Fault> {
        let size = self.size;
        match self.op {
            StringOp::Movs => {
                let value = ctx.read(self.src, self.si(ctx), size)?;
                ctx.write(SegReg::Es, self.di(ctx), size, value)?;
                self.advance(ctx, Gpr::Esi);
                self.advance(ctx, Gpr::Edi);
            }
            StringOp::Cmps => {
                let a = ctx.read(self.src, self.si(ctx), size)?;
                let b = ctx.read(SegReg::Es, self.di(ctx), size)?;
                sub_with_flags(&mut ctx.cpu.flags, a, b, false, size);
                self.advance(ctx, Gpr::Esi);
                self.advance(ctx, Gpr::Edi);
            }
            StringOp::Stos => {
                let value = ctx.cpu.regs.get(Gpr::Eax, size);
                ctx.write(SegReg::Es, self.di(ctx), size, value)?;
                self.advance(ctx, Gpr::Edi);
            }
            StringOp::Lods => {
                let value = ctx.read(self.src, self.si(ctx), size)?;
                ctx.cpu.regs.set(Gpr::Eax, size, value);
                self.advance(ctx, Gpr::Esi);
            }
            StringOp::Scas => {
                let acc = ctx.cpu.regs.get(Gpr::Eax, size);
                let value = ctx.read(SegReg::Es, self.di(ctx), size)?;
                sub_with_flags(&mut ctx.cpu.flags, acc, value, false, size);
                self.advance(ctx, Gpr::Edi);
            }
            StringOp::Ins => {
                let value = ctx.io_read(Self::port(ctx), size);
                ctx.write(SegReg::Es, self.di(ctx), size, value)?;
                self.advance(ctx, Gpr::Edi);
            }
            StringOp::Outs => {
                let value = ctx.read(self.src, self.si(ctx), size)?;
                ctx.io_write(Self::port(ctx), size, value);
                self.advance(ctx, Gpr::Esi);
            }
        }
        Ok(())
    }
}

fn execute(ctx: &mut ExecCtx, insn: &Insn, op: StringOp) -> ExecResult {
    let string = StringInsn {
        op,
        size: element_size(insn.mnemonic()),
        addr: if insn.addr32 {
            OpSize::Dword
        } else {
            OpSize::Word
        },
        src: memory_segment(insn),
    };
    if matches!(op, StringOp::Ins | StringOp::Outs) {
        let port = StringInsn::port(ctx);
        check_io(ctx, port, string.size.bytes())?;
    }

    let rep = effective_rep_mode(op, insn);
    if rep == RepMode::None {
        string.once(ctx)?;
        return Ok(ExecOutcome::Continue);
    }

    let mut budget = ctx.rep_budget.max(1);
    loop {
        let count = ctx.cpu.regs.get(Gpr::Ecx, string.addr);
        if count == 0 {
            return Ok(ExecOutcome::Continue);
        }
        string.once(ctx)?;
        let remaining = count - 1;
        ctx.cpu.regs.set(Gpr::Ecx, string.addr, remaining);
        ctx.extra_cycles += ctx.rep_iteration_cycles;

        let done = match rep {
            RepMode::Repe => !ctx.cpu.flags.zf(),
            RepMode::Repne => ctx.cpu.flags.zf(),
            _ => false,
        };
        if done || remaining == 0 {
            return Ok(ExecOutcome::Continue);
        }

        budget -= 1;
        let irq_waiting = ctx.cpu.flags.interrupts_enabled() && ctx.pic.is_pending();
        if budget == 0 || irq_waiting {
            // Resume at the same instruction once the engine has had its turn.
            ctx.cpu.eip = ctx.insn_eip;
            return Ok(ExecOutcome::RepInterrupted);
        }
    }
}

pub(super) fn movs(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Movs)
}

pub(super) fn cmps(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Cmps)
}

pub(super) fn stos(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Stos)
}

pub(super) fn lods(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Lods)
}

pub(super) fn scas(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Scas)
}

pub(super) fn ins(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Ins)
}

pub(super) fn outs(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    execute(ctx, insn, StringOp::Outs)
}
