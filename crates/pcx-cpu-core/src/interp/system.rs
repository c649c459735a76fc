//! Port I/O, interrupt flag control and the privileged system instructions.

use iced_x86::{Mnemonic, OpKind, Register};
use pcx_mmu::{AccessType, CR0_PE, CR0_PG, CR0_TS};
use tracing::{debug, trace};

use super::{effective_address, memory_segment, operand_size, read_operand, write_operand, ExecResult};
use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Insn};
use crate::descriptor::{DescriptorTable, Selector};
use crate::fault::{Fault, GP0};
use crate::flags::{CpuModel, Flags};
use crate::protection::{self, require_cpl0};
use crate::registers::{Gpr, OpSize};
use crate::segment::SegReg;
use crate::state::{CR0_EM, CR0_MP};
use crate::task::{self, check_io};

const CR4_TSD: u32 = 1 << 2;
const MSR_TSC: u32 = 0x10;

// --- port I/O ---

fn port_operand(ctx: &ExecCtx, insn: &Insn, n: u32) -> u16 {
    match insn.instr.op_kind(n) {
        OpKind::Register => ctx.cpu.regs.get16(Gpr::Edx),
        _ => insn.instr.immediate(n) as u16,
    }
}

pub(super) fn in_(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let port = port_operand(ctx, insn, 1);
    check_io(ctx, port, size.bytes())?;
    let value = ctx.io_read(port, size);
    ctx.cpu.regs.set(Gpr::Eax, size, value);
    Ok(ExecOutcome::Continue)
}

pub(super) fn out(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 1);
    let port = port_operand(ctx, insn, 0);
    check_io(ctx, port, size.bytes())?;
    let value = ctx.cpu.regs.get(Gpr::Eax, size);
    ctx.io_write(port, size, value);
    Ok(ExecOutcome::Continue)
}

// --- flags ---

/// CLI/STI need CPL <= IOPL in protected and virtual-8086 mode.
fn check_iopl(ctx: &ExecCtx) -> Result<(), Fault> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl > ctx.cpu.flags.iopl() {
        Err(GP0)
    } else {
        Ok(())
    }
}

pub(super) fn cli(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    check_iopl(ctx)?;
    ctx.cpu.flags.set(Flags::IF, false);
    Ok(ExecOutcome::Continue)
}

/// STI enables interrupts only after the following instruction.
pub(super) fn sti(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    check_iopl(ctx)?;
    if !ctx.cpu.flags.interrupts_enabled() {
        ctx.cpu.interrupt_shadow = true;
    }
    ctx.cpu.flags.set(Flags::IF, true);
    Ok(ExecOutcome::Continue)
}

/// CLC, STC, CMC, CLD, STD.
pub(super) fn flag_op(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let flags = &mut ctx.cpu.flags;
    match insn.mnemonic() {
        Mnemonic::Clc => flags.set(Flags::CF, false),
        Mnemonic::Stc => flags.set(Flags::CF, true),
        Mnemonic::Cmc => {
            let cf = flags.cf();
            flags.set(Flags::CF, !cf);
        }
        Mnemonic::Cld => flags.set(Flags::DF, false),
        _ => flags.set(Flags::DF, true),
    }
    Ok(ExecOutcome::Continue)
}

pub(super) fn nop(_ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    Ok(ExecOutcome::Continue)
}

// --- coprocessor ---

/// WAIT: `#NM` when MP and TS are both set.
pub(super) fn wait(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let cr0 = ctx.cpu.cr0();
    if cr0 & CR0_MP != 0 && cr0 & CR0_TS != 0 {
        return Err(Fault::DeviceNotAvailable);
    }
    Ok(ExecOutcome::Continue)
}

/// x87 escapes. No coprocessor is attached; the escape is swallowed unless EM or TS asks for
/// `#NM` so an OS can emulate it or switch FPU context.
pub(super) fn fpu_escape(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    if ctx.cpu.cr0() & (CR0_EM | CR0_TS) != 0 {
        return Err(Fault::DeviceNotAvailable);
    }
    Ok(ExecOutcome::Continue)
}

// --- descriptor table registers ---

fn table_operand(ctx: &ExecCtx, insn: &Insn) -> Result<(SegReg, u32, u32), Fault> {
    if insn.instr.op0_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let ea = effective_address(ctx, insn);
    let mut base_at = ea.wrapping_add(2);
    if !insn.addr32 {
        base_at &= 0xffff;
    }
    Ok((memory_segment(insn), ea, base_at))
}

/// LGDT / LIDT. With a 16-bit operand only 24 bits of base are loaded.
pub(super) fn load_table(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    let (seg, ea, base_at) = table_operand(ctx, insn)?;
    let limit = ctx.read_u16(seg, ea)?;
    let mut base = ctx.read_u32(seg, base_at)?;
    if !insn.op32 {
        base &= 0x00ff_ffff;
    }
    let table = DescriptorTable { base, limit };
    if insn.mnemonic() == Mnemonic::Lgdt {
        debug!(base, limit, "lgdt");
        ctx.cpu.gdtr = table;
    } else {
        debug!(base, limit, "lidt");
        ctx.cpu.idtr = table;
    }
    Ok(ExecOutcome::EndBlock)
}

/// SGDT / SIDT.
pub(super) fn store_table(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let (seg, ea, base_at) = table_operand(ctx, insn)?;
    let table = if insn.mnemonic() == Mnemonic::Sgdt {
        ctx.cpu.gdtr
    } else {
        ctx.cpu.idtr
    };
    // The 286 stores 0xff in the unused top byte.
    let base = match ctx.cpu.model {
        CpuModel::I286 => table.base | 0xff00_0000,
        _ if !insn.op32 => table.base & 0x00ff_ffff,
        _ => table.base,
    };
    // Check both halves before writing either.
    ctx.linear_address(seg, ea, 6, AccessType::Write)?;
    ctx.write(seg, ea, OpSize::Word, table.limit as u32)?;
    ctx.write(seg, base_at, OpSize::Dword, base)?;
    Ok(ExecOutcome::Continue)
}

fn protected_only(ctx: &ExecCtx) -> Result<(), Fault> {
    if !ctx.cpu.protected_mode() || ctx.cpu.flags.vm() {
        Err(Fault::InvalidOpcode)
    } else {
        Ok(())
    }
}

pub(super) fn lldt(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let selector = read_operand(ctx, insn, 0, OpSize::Word)? as u16;
    task::lldt(ctx, Selector(selector))?;
    Ok(ExecOutcome::EndBlock)
}

pub(super) fn sldt(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    protected_only(ctx)?;
    let size = operand_size(insn, 0);
    let selector = ctx.cpu.ldtr.selector.0 as u32;
    write_operand(ctx, insn, 0, size, selector)?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn ltr(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let selector = read_operand(ctx, insn, 0, OpSize::Word)? as u16;
    task::ltr(ctx, Selector(selector))?;
    Ok(ExecOutcome::EndBlock)
}

/// STR.
pub(super) fn store_task_register(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    protected_only(ctx)?;
    let size = operand_size(insn, 0);
    let selector = ctx.cpu.tr.selector.0 as u32;
    write_operand(ctx, insn, 0, size, selector)?;
    Ok(ExecOutcome::Continue)
}

// --- control registers ---

/// LMSW loads the low four CR0 bits; it can set PE but never clear it.
pub(super) fn lmsw(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    let value = read_operand(ctx, insn, 0, OpSize::Word)?;
    let cr0 = ctx.cpu.cr0();
    let updated = (cr0 & !0xf) | (value & 0xf) | (cr0 & CR0_PE);
    ctx.cpu.set_cr0(updated);
    Ok(ExecOutcome::EndBlock)
}

pub(super) fn smsw(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let cr0 = ctx.cpu.cr0();
    write_operand(ctx, insn, 0, size, cr0 & size.mask())?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn clts(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    let cr0 = ctx.cpu.cr0();
    ctx.cpu.set_cr0(cr0 & !CR0_TS);
    Ok(ExecOutcome::EndBlock)
}

pub(super) fn invlpg(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    if insn.instr.op0_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let linear = ctx
        .cpu
        .seg(memory_segment(insn))
        .base()
        .wrapping_add(effective_address(ctx, insn));
    ctx.cpu.mmu.invlpg(linear);
    Ok(ExecOutcome::EndBlock)
}

/// INVD / WBINVD: there are no caches to write back.
pub(super) fn cache_flush(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    Ok(ExecOutcome::EndBlock)
}

/// MOV to or from CRn / DRn. Test registers do not exist on the emulated models.
pub(super) fn mov_control(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    let instr = &insn.instr;
    let to_system = ctx.cpu.regs.read(instr.op0_register()).is_none();
    let (system, gpr) = if to_system {
        (instr.op0_register(), instr.op1_register())
    } else {
        (instr.op1_register(), instr.op0_register())
    };

    if system.is_dr() {
        let index = system.number();
        if to_system {
            let value = ctx.cpu.regs.read(gpr).unwrap_or(0);
            ctx.cpu.debug_regs[index] = value;
        } else {
            let value = ctx.cpu.debug_regs[index];
            ctx.cpu.regs.write(gpr, value);
        }
        return Ok(ExecOutcome::Continue);
    }

    let pentium = ctx.cpu.model >= CpuModel::Pentium;
    if !to_system {
        let value = match system {
            Register::CR0 => ctx.cpu.cr0(),
            Register::CR2 => ctx.cpu.mmu.cr2(),
            Register::CR3 => ctx.cpu.mmu.cr3(),
            Register::CR4 if pentium => ctx.cpu.mmu.cr4(),
            _ => return Err(Fault::InvalidOpcode),
        };
        ctx.cpu.regs.write(gpr, value);
        return Ok(ExecOutcome::Continue);
    }

    let value = ctx.cpu.regs.read(gpr).unwrap_or(0);
    match system {
        Register::CR0 => {
            if value & CR0_PG != 0 && value & CR0_PE == 0 {
                return Err(GP0);
            }
            ctx.cpu.set_cr0(value);
        }
        Register::CR2 => ctx.cpu.mmu.set_cr2(value),
        Register::CR3 => {
            trace!(cr3 = value, "cr3 load");
            ctx.cpu.mmu.set_cr3(value);
        }
        Register::CR4 if pentium => {
            // VME, PVI, TSD, DE, PSE and MCE are the architected Pentium bits.
            if value & !0x5f != 0 {
                return Err(GP0);
            }
            ctx.cpu.mmu.set_cr4(value);
        }
        _ => return Err(Fault::InvalidOpcode),
    }
    Ok(ExecOutcome::EndBlock)
}

// --- protection probes ---

pub(super) fn arpl(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    protected_only(ctx)?;
    let dest = read_operand(ctx, insn, 0, OpSize::Word)? as u16;
    let src = read_operand(ctx, insn, 1, OpSize::Word)? as u16;
    let (adjusted, changed) = protection::arpl(dest, src);
    if changed {
        write_operand(ctx, insn, 0, OpSize::Word, adjusted as u32)?;
    }
    ctx.cpu.flags.set(Flags::ZF, changed);
    Ok(ExecOutcome::Continue)
}

fn probe_result(ctx: &mut ExecCtx, insn: &Insn, result: Option<u32>) -> ExecResult {
    if let Some(value) = result {
        let size = operand_size(insn, 0);
        write_operand(ctx, insn, 0, size, value & size.mask())?;
    }
    ctx.cpu.flags.set(Flags::ZF, result.is_some());
    Ok(ExecOutcome::Continue)
}

pub(super) fn lar(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let selector = Selector(read_operand(ctx, insn, 1, OpSize::Word)? as u16);
    let result = protection::lar(ctx, selector)?;
    probe_result(ctx, insn, result)
}

pub(super) fn lsl(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let selector = Selector(read_operand(ctx, insn, 1, OpSize::Word)? as u16);
    let result = protection::lsl(ctx, selector)?;
    probe_result(ctx, insn, result)
}

/// VERR / VERW.
pub(super) fn verify(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let selector = Selector(read_operand(ctx, insn, 0, OpSize::Word)? as u16);
    let ok = if insn.mnemonic() == Mnemonic::Verr {
        protection::verr(ctx, selector)?
    } else {
        protection::verw(ctx, selector)?
    };
    ctx.cpu.flags.set(Flags::ZF, ok);
    Ok(ExecOutcome::Continue)
}

// --- identification and timestamps ---

const FEATURE_TSC: u32 = 1 << 4;
const FEATURE_MSR: u32 = 1 << 5;
const FEATURE_CX8: u32 = 1 << 8;

pub(super) fn cpuid(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let regs = &mut ctx.cpu.regs;
    let (eax, ebx, ecx, edx) = match regs.get32(Gpr::Eax) {
        0 => (
            1,
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ntel"),
            u32::from_le_bytes(*b"ineI"),
        ),
        // Family 5, model 4, stepping 3.
        1 => (0x0543, 0, 0, FEATURE_TSC | FEATURE_MSR | FEATURE_CX8),
        _ => (0, 0, 0, 0),
    };
    regs.set32(Gpr::Eax, eax);
    regs.set32(Gpr::Ebx, ebx);
    regs.set32(Gpr::Ecx, ecx);
    regs.set32(Gpr::Edx, edx);
    Ok(ExecOutcome::Continue)
}

pub(super) fn rdtsc(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    if ctx.cpu.mmu.cr4() & CR4_TSD != 0 && ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        return Err(GP0);
    }
    let tsc = ctx.cpu.tsc;
    ctx.cpu.regs.set32(Gpr::Eax, tsc as u32);
    ctx.cpu.regs.set32(Gpr::Edx, (tsc >> 32) as u32);
    Ok(ExecOutcome::Continue)
}

/// RDMSR / WRMSR. Only the time-stamp counter is modeled.
pub(super) fn msr(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    if ctx.cpu.regs.get32(Gpr::Ecx) != MSR_TSC {
        return Err(GP0);
    }
    let regs = &mut ctx.cpu.regs;
    if insn.mnemonic() == Mnemonic::Rdmsr {
        let tsc = ctx.cpu.tsc;
        regs.set32(Gpr::Eax, tsc as u32);
        regs.set32(Gpr::Edx, (tsc >> 32) as u32);
    } else {
        ctx.cpu.tsc = (regs.get32(Gpr::Edx) as u64) << 32 | regs.get32(Gpr::Eax) as u64;
    }
    Ok(ExecOutcome::Continue)
}
