//! Data movement: MOV and friends, stack operations, flag transfers.

use iced_x86::{Mnemonic, OpKind, Register};

use super::{
    condition_met, effective_address, memory_segment, operand_size, read_operand, system,
    write_operand, ExecResult,
};
use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Insn};
use crate::fault::{Fault, GP0};
use crate::flags::{CpuModel, Flags};
use crate::interrupts::writable_flags;
use crate::protection::load_segment;
use crate::registers::{Gpr, OpSize};
use crate::segment::SegReg;

use super::alu::sub_with_flags;

fn segment_operand(insn: &Insn, n: u32) -> Option<SegReg> {
    (insn.instr.op_kind(n) == OpKind::Register)
        .then(|| SegReg::from_iced(insn.instr.op_register(n)))
        .flatten()
}

fn is_system_register(reg: Register) -> bool {
    reg.is_cr() || reg.is_dr() || reg.is_tr()
}

pub(super) fn mov(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let instr = &insn.instr;
    let system = (0..2).any(|n| {
        instr.op_kind(n) == OpKind::Register && is_system_register(instr.op_register(n))
    });
    if system {
        return system::mov_control(ctx, insn);
    }

    if let Some(seg) = segment_operand(insn, 0) {
        if seg == SegReg::Cs {
            return Err(Fault::InvalidOpcode);
        }
        let selector = read_operand(ctx, insn, 1, OpSize::Word)? as u16;
        load_segment(ctx, seg, selector)?;
        return Ok(ExecOutcome::Continue);
    }

    let size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 1, size)?;
    write_operand(ctx, insn, 0, size, value)?;
    Ok(ExecOutcome::Continue)
}

/// MOVZX / MOVSX.
pub(super) fn mov_extend(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let src_size = operand_size(insn, 1);
    let dest_size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 1, src_size)?;
    let value = if insn.mnemonic() == Mnemonic::Movsx {
        src_size.sign_extend(value)
    } else {
        value
    };
    write_operand(ctx, insn, 0, dest_size, value & dest_size.mask())?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn lea(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    if insn.instr.op1_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let size = operand_size(insn, 0);
    let ea = effective_address(ctx, insn);
    write_operand(ctx, insn, 0, size, ea & size.mask())?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn xchg(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let a = read_operand(ctx, insn, 0, size)?;
    let b = read_operand(ctx, insn, 1, size)?;
    // The memory side goes first so a fault leaves the register alone.
    if insn.instr.op1_kind() == OpKind::Memory {
        write_operand(ctx, insn, 1, size, a)?;
        write_operand(ctx, insn, 0, size, b)?;
    } else {
        write_operand(ctx, insn, 0, size, b)?;
        write_operand(ctx, insn, 1, size, a)?;
    }
    Ok(ExecOutcome::Continue)
}

pub(super) fn xlat(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let value = read_operand(ctx, insn, 0, OpSize::Byte)?;
    ctx.cpu.regs.set8(0, value as u8);
    Ok(ExecOutcome::Continue)
}

// --- stack ---

fn stack_operand_size(insn: &Insn) -> OpSize {
    match insn.instr.op0_kind() {
        OpKind::Register | OpKind::Memory if segment_operand(insn, 0).is_none() => {
            operand_size(insn, 0)
        }
        _ => OpSize::word_or_dword(insn.op32),
    }
}

pub(super) fn push(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = stack_operand_size(insn);
    let mut value = read_operand(ctx, insn, 0, size)?;
    // The 8086 pushes SP after the decrement.
    if ctx.cpu.model < CpuModel::I286
        && insn.instr.op0_kind() == OpKind::Register
        && insn.instr.op0_register() == Register::SP
    {
        value = value.wrapping_sub(2) & 0xffff;
    }
    ctx.push(value, size)?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn pop(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = stack_operand_size(insn);
    let value = ctx.peek(0, size)?;
    let old_sp = ctx.cpu.stack_pointer();

    if let Some(seg) = segment_operand(insn, 0) {
        if seg == SegReg::Cs {
            return Err(Fault::InvalidOpcode);
        }
        load_segment(ctx, seg, value as u16)?;
        ctx.cpu.set_stack_pointer(old_sp.wrapping_add(size.bytes()));
        return Ok(ExecOutcome::Continue);
    }

    // A memory destination addressed through ESP sees the incremented value.
    ctx.cpu.set_stack_pointer(old_sp.wrapping_add(size.bytes()));
    if let Err(fault) = write_operand(ctx, insn, 0, size, value) {
        ctx.cpu.set_stack_pointer(old_sp);
        return Err(fault);
    }
    Ok(ExecOutcome::Continue)
}

const PUSHA_ORDER: [Gpr; 8] = [
    Gpr::Eax,
    Gpr::Ecx,
    Gpr::Edx,
    Gpr::Ebx,
    Gpr::Esp,
    Gpr::Ebp,
    Gpr::Esi,
    Gpr::Edi,
];

pub(super) fn pusha(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let sp = ctx.cpu.stack_pointer();
    let mask = ctx.cpu.stack_mask();
    for (i, gpr) in PUSHA_ORDER.iter().enumerate() {
        let value = ctx.cpu.regs.get(*gpr, size);
        let offset = sp.wrapping_sub((i as u32 + 1) * size.bytes()) & mask;
        ctx.write(SegReg::Ss, offset, size, value)?;
    }
    ctx.cpu.set_stack_pointer(sp.wrapping_sub(8 * size.bytes()));
    Ok(ExecOutcome::Continue)
}

pub(super) fn popa(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let mut values = [0u32; 8];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = ctx.peek(i as u32, size)?;
    }
    for (value, gpr) in values.iter().zip(PUSHA_ORDER.iter().rev()) {
        if *gpr != Gpr::Esp {
            ctx.cpu.regs.set(*gpr, size, *value);
        }
    }
    let sp = ctx.cpu.stack_pointer();
    ctx.cpu.set_stack_pointer(sp.wrapping_add(8 * size.bytes()));
    Ok(ExecOutcome::Continue)
}

fn check_v86_iopl(ctx: &ExecCtx) -> Result<(), Fault> {
    if ctx.cpu.flags.vm() && ctx.cpu.flags.iopl() < 3 {
        Err(GP0)
    } else {
        Ok(())
    }
}

pub(super) fn pushf(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    check_v86_iopl(ctx)?;
    let size = OpSize::word_or_dword(insn.op32);
    let value = ctx.cpu.flags.value() & !(Flags::VM.bits() | Flags::RF.bits());
    ctx.push(value & size.mask(), size)?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn popf(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    check_v86_iopl(ctx)?;
    let size = OpSize::word_or_dword(insn.op32);
    let value = ctx.pop(size)?;
    let mask = writable_flags(ctx.cpu, insn.op32);
    ctx.cpu.flags.set_value(value, mask);
    Ok(ExecOutcome::Continue)
}

const LAHF_FLAGS: u32 =
    Flags::SF.bits() | Flags::ZF.bits() | Flags::AF.bits() | Flags::PF.bits() | Flags::CF.bits();

pub(super) fn lahf(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let value = ctx.cpu.flags.value() as u8;
    ctx.cpu.regs.set8(4, value);
    Ok(ExecOutcome::Continue)
}

pub(super) fn sahf(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let ah = ctx.cpu.regs.get8(4) as u32;
    ctx.cpu.flags.set_value(ah, LAHF_FLAGS);
    Ok(ExecOutcome::Continue)
}

/// LDS, LES, LFS, LGS, LSS.
pub(super) fn load_far_pointer(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    if insn.instr.op1_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let seg = match insn.mnemonic() {
        Mnemonic::Lds => SegReg::Ds,
        Mnemonic::Les => SegReg::Es,
        Mnemonic::Lfs => SegReg::Fs,
        Mnemonic::Lgs => SegReg::Gs,
        _ => SegReg::Ss,
    };
    let size = operand_size(insn, 0);
    let src = memory_segment(insn);
    let ea = effective_address(ctx, insn);
    let offset = ctx.read(src, ea, size)?;
    let mut selector_at = ea.wrapping_add(size.bytes());
    if !insn.addr32 {
        selector_at &= 0xffff;
    }
    let selector = ctx.read_u16(src, selector_at)?;
    load_segment(ctx, seg, selector)?;
    write_operand(ctx, insn, 0, size, offset)?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn bswap(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 0, size)?;
    // The 16-bit form is undefined; the 486 clears the register.
    let swapped = match size {
        OpSize::Dword => value.swap_bytes(),
        _ => 0,
    };
    write_operand(ctx, insn, 0, size, swapped)?;
    Ok(ExecOutcome::Continue)
}

pub(super) fn cmpxchg(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let dest = read_operand(ctx, insn, 0, size)?;
    let src = read_operand(ctx, insn, 1, size)?;
    let acc = ctx.cpu.regs.get(Gpr::Eax, size);

    let mut flags = ctx.cpu.flags;
    sub_with_flags(&mut flags, acc, dest, false, size);
    if flags.zf() {
        write_operand(ctx, insn, 0, size, src)?;
    } else {
        // The destination is always written back.
        write_operand(ctx, insn, 0, size, dest)?;
        ctx.cpu.regs.set(Gpr::Eax, size, dest);
    }
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

pub(super) fn cmpxchg8b(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    if insn.instr.op0_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let seg = memory_segment(insn);
    let ea = effective_address(ctx, insn);
    let high_at = ea.wrapping_add(4);
    let low = ctx.read_u32(seg, ea)?;
    let high = ctx.read_u32(seg, high_at)?;

    let regs = ctx.cpu.regs;
    let equal = low == regs.get32(Gpr::Eax) && high == regs.get32(Gpr::Edx);
    let (new_low, new_high) = if equal {
        (regs.get32(Gpr::Ebx), regs.get32(Gpr::Ecx))
    } else {
        (low, high)
    };
    ctx.write(seg, ea, OpSize::Dword, new_low)?;
    ctx.write(seg, high_at, OpSize::Dword, new_high)?;
    if !equal {
        ctx.cpu.regs.set32(Gpr::Eax, low);
        ctx.cpu.regs.set32(Gpr::Edx, high);
    }
    ctx.cpu.flags.set(Flags::ZF, equal);
    Ok(ExecOutcome::Continue)
}

pub(super) fn xadd(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let dest = read_operand(ctx, insn, 0, size)?;
    let src = read_operand(ctx, insn, 1, size)?;
    let mut flags = ctx.cpu.flags;
    let sum = super::alu::add_with_flags(&mut flags, dest, src, false, size);
    if insn.instr.op0_kind() == OpKind::Memory {
        write_operand(ctx, insn, 0, size, sum)?;
        write_operand(ctx, insn, 1, size, dest)?;
    } else {
        // With both operands naming one register, the sum wins.
        write_operand(ctx, insn, 1, size, dest)?;
        write_operand(ctx, insn, 0, size, sum)?;
    }
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

pub(super) fn setcc(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let value = condition_met(&ctx.cpu.flags, insn.mnemonic()) as u32;
    write_operand(ctx, insn, 0, OpSize::Byte, value)?;
    Ok(ExecOutcome::Continue)
}

/// Undocumented SALC: AL = CF ? 0xff : 0.
pub(super) fn salc(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let value = if ctx.cpu.flags.cf() { 0xff } else { 0 };
    ctx.cpu.regs.set8(0, value);
    Ok(ExecOutcome::Continue)
}
