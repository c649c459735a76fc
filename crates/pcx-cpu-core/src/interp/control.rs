//! Control transfers: near and far jumps, calls and returns, gates, software interrupts.

use iced_x86::{MemorySize, Mnemonic, OpKind};

use super::{
    condition_met, effective_address, ip_mask, memory_segment, read_operand, relative_target,
    ExecResult,
};
use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Insn};
use crate::descriptor::{Descriptor, DescriptorKind, Selector, SystemKind};
use crate::fault::{Fault, GP0};
use crate::interrupts::{deliver_interrupt, iret as interrupt_return, InterruptSource};
use crate::protection::{
    check_direct_code_target, check_stack_segment, install_code_segment, install_stack_segment,
    invalidate_outer_data_segments, require_cpl0,
};
use crate::registers::{Gpr, OpSize};
use crate::segment::SegReg;
use crate::task::{stack_for_cpl, switch_to_task, TaskSwitchKind};

/// `#GP(0)` unless `target` lies inside CS.
fn check_cs_limit(ctx: &ExecCtx, target: u32) -> Result<u32, Fault> {
    if ctx.cpu.seg(SegReg::Cs).cache.contains(target, 1) {
        Ok(target)
    } else {
        Err(GP0)
    }
}

pub(super) fn jcc(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    if !condition_met(&ctx.cpu.flags, insn.mnemonic()) {
        return Ok(ExecOutcome::Continue);
    }
    let target = check_cs_limit(ctx, relative_target(ctx, insn))?;
    ctx.cpu.eip = target;
    Ok(ExecOutcome::Branch)
}

/// Where a JMP or CALL goes.
enum Target {
    Near(u32),
    Far { selector: u16, offset: u32 },
}

fn is_far_pointer(insn: &Insn) -> bool {
    matches!(
        insn.instr.memory_size(),
        MemorySize::SegPtr16 | MemorySize::SegPtr32
    )
}

fn branch_target(ctx: &mut ExecCtx, insn: &Insn) -> Result<Target, Fault> {
    let instr = &insn.instr;
    let size = OpSize::word_or_dword(insn.op32);
    Ok(match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 => Target::Near(relative_target(ctx, insn)),
        OpKind::FarBranch16 => Target::Far {
            selector: instr.far_branch_selector(),
            offset: instr.far_branch16() as u32,
        },
        OpKind::FarBranch32 => Target::Far {
            selector: instr.far_branch_selector(),
            offset: instr.far_branch32(),
        },
        OpKind::Memory if is_far_pointer(insn) => {
            let seg = memory_segment(insn);
            let ea = effective_address(ctx, insn);
            let offset = ctx.read(seg, ea, size)?;
            let mut selector_at = ea.wrapping_add(size.bytes());
            if !insn.addr32 {
                selector_at &= 0xffff;
            }
            let selector = ctx.read_u16(seg, selector_at)?;
            Target::Far { selector, offset }
        }
        OpKind::Register | OpKind::Memory => {
            Target::Near(read_operand(ctx, insn, 0, size)? & ip_mask(insn.op32))
        }
        _ => return Err(Fault::InvalidOpcode),
    })
}

pub(super) fn jmp(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    match branch_target(ctx, insn)? {
        Target::Near(target) => {
            ctx.cpu.eip = check_cs_limit(ctx, target)?;
        }
        Target::Far { selector, offset } => far_transfer(ctx, selector, offset, false, insn.op32)?,
    }
    Ok(ExecOutcome::Branch)
}

pub(super) fn call(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    match branch_target(ctx, insn)? {
        Target::Near(target) => {
            let target = check_cs_limit(ctx, target)?;
            let size = OpSize::word_or_dword(insn.op32);
            let return_eip = ctx.cpu.eip;
            ctx.push(return_eip, size)?;
            ctx.cpu.eip = target;
        }
        Target::Far { selector, offset } => far_transfer(ctx, selector, offset, true, insn.op32)?,
    }
    Ok(ExecOutcome::Branch)
}

fn release_bytes(insn: &Insn) -> u32 {
    if insn.instr.op_count() > 0 {
        insn.instr.immediate(0) as u32 & 0xffff
    } else {
        0
    }
}

pub(super) fn ret_near(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let popped = ctx.peek(0, size)?;
    let target = check_cs_limit(ctx, popped)?;
    let sp = ctx.cpu.stack_pointer();
    ctx.cpu
        .set_stack_pointer(sp.wrapping_add(size.bytes() + release_bytes(insn)));
    ctx.cpu.eip = target;
    Ok(ExecOutcome::Branch)
}

// --- far transfers ---

fn far_transfer(
    ctx: &mut ExecCtx,
    selector: u16,
    offset: u32,
    call: bool,
    op32: bool,
) -> Result<(), Fault> {
    let size = OpSize::word_or_dword(op32);
    let offset = offset & size.mask();
    if ctx.cpu.real_addressing() {
        if offset > 0xffff {
            return Err(GP0);
        }
        return ctx.transaction(|ctx| {
            if call {
                let cs = ctx.cpu.seg(SegReg::Cs).selector.0 as u32;
                let ip = ctx.cpu.eip;
                ctx.push(cs, size)?;
                ctx.push(ip, size)?;
            }
            ctx.cpu.load_real_segment(SegReg::Cs, selector);
            ctx.cpu.eip = offset;
            Ok(())
        });
    }

    let selector = Selector(selector);
    if selector.is_null() {
        return Err(GP0);
    }
    let code = selector.error_code();
    let desc = ctx.read_descriptor(selector)?;
    let cpl = ctx.cpu.cpl;
    let switch_kind = if call {
        TaskSwitchKind::Call
    } else {
        TaskSwitchKind::Jmp
    };

    match desc.kind {
        DescriptorKind::Code { .. } => {
            let new_cpl = check_direct_code_target(selector, &desc, cpl)?;
            if offset > desc.limit {
                return Err(GP0);
            }
            ctx.transaction(|ctx| {
                if call {
                    push_return_address(ctx, size)?;
                }
                install_code_segment(ctx, selector, &desc, new_cpl)?;
                ctx.cpu.eip = offset;
                Ok(())
            })
        }
        DescriptorKind::System(kind) if kind.is_tss() => {
            if desc.dpl < cpl || desc.dpl < selector.rpl() {
                return Err(Fault::GeneralProtection(code));
            }
            switch_to_task(ctx, selector, &desc, switch_kind)
        }
        DescriptorKind::System(SystemKind::TaskGate) => {
            if desc.dpl < cpl || desc.dpl < selector.rpl() {
                return Err(Fault::GeneralProtection(code));
            }
            if !desc.present {
                return Err(Fault::SegmentNotPresent(code));
            }
            let tss = desc.gate_selector();
            if tss.uses_ldt() {
                return Err(Fault::GeneralProtection(tss.error_code()));
            }
            let tss_desc = ctx.read_descriptor(tss)?;
            switch_to_task(ctx, tss, &tss_desc, switch_kind)
        }
        DescriptorKind::System(SystemKind::CallGate16 | SystemKind::CallGate32) => {
            through_call_gate(ctx, selector, &desc, call)
        }
        _ => Err(Fault::GeneralProtection(code)),
    }
}

fn push_return_address(ctx: &mut ExecCtx, size: OpSize) -> Result<(), Fault> {
    let cs = ctx.cpu.seg(SegReg::Cs).selector.0 as u32;
    let eip = ctx.cpu.eip;
    ctx.push(cs, size)?;
    ctx.push(eip, size)
}

fn through_call_gate(
    ctx: &mut ExecCtx,
    gate_selector: Selector,
    gate: &Descriptor,
    call: bool,
) -> Result<(), Fault> {
    let cpl = ctx.cpu.cpl;
    let gate_code = gate_selector.error_code();
    if gate.dpl < cpl || gate.dpl < gate_selector.rpl() {
        return Err(Fault::GeneralProtection(gate_code));
    }
    if !gate.present {
        return Err(Fault::SegmentNotPresent(gate_code));
    }

    let cs = gate.gate_selector();
    if cs.is_null() {
        return Err(GP0);
    }
    let cs_code = cs.error_code();
    let cs_desc = ctx.read_descriptor(cs)?;
    if !cs_desc.is_code() || cs_desc.dpl > cpl {
        return Err(Fault::GeneralProtection(cs_code));
    }
    if !cs_desc.present {
        return Err(Fault::SegmentNotPresent(cs_code));
    }

    let size = if gate.system_kind().is_some_and(SystemKind::is_32bit_gate) {
        OpSize::Dword
    } else {
        OpSize::Word
    };
    let offset = gate.gate_offset() & size.mask();
    if offset > cs_desc.limit {
        return Err(GP0);
    }
    let inner = !cs_desc.is_conforming_code() && cs_desc.dpl < cpl;

    if !call {
        // JMP through a gate never changes privilege.
        if inner {
            return Err(Fault::GeneralProtection(cs_code));
        }
        return ctx.transaction(|ctx| {
            install_code_segment(ctx, cs, &cs_desc, cpl)?;
            ctx.cpu.eip = offset;
            Ok(())
        });
    }

    if !inner {
        return ctx.transaction(|ctx| {
            push_return_address(ctx, size)?;
            install_code_segment(ctx, cs, &cs_desc, cpl)?;
            ctx.cpu.eip = offset;
            Ok(())
        });
    }

    let new_cpl = cs_desc.dpl;
    let (ss, esp) = stack_for_cpl(ctx, new_cpl)?;
    let ss_desc = check_stack_segment(ctx, ss, new_cpl, Fault::InvalidTss)?;

    let count = gate.gate_param_count() as u32;
    let mut params = Vec::with_capacity(count as usize);
    for i in 0..count {
        params.push(ctx.peek(i, size)?);
    }

    ctx.transaction(|ctx| {
        let old_ss = ctx.cpu.seg(SegReg::Ss).selector.0 as u32;
        let old_esp = ctx.cpu.regs.get32(Gpr::Esp);
        let old_cs = ctx.cpu.seg(SegReg::Cs).selector.0 as u32;
        let old_eip = ctx.cpu.eip;

        ctx.cpu.cpl = new_cpl;
        install_stack_segment(ctx, ss, &ss_desc)?;
        ctx.cpu.regs.set32(Gpr::Esp, esp);

        ctx.push(old_ss, size)?;
        ctx.push(old_esp, size)?;
        for param in params.iter().rev() {
            ctx.push(*param, size)?;
        }
        ctx.push(old_cs, size)?;
        ctx.push(old_eip, size)?;

        install_code_segment(ctx, cs, &cs_desc, new_cpl)?;
        ctx.cpu.eip = offset;
        Ok(())
    })
}

pub(super) fn ret_far(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let release = release_bytes(insn);
    let eip = ctx.peek(0, size)? & size.mask();
    let cs = ctx.peek(1, size)? as u16;

    if ctx.cpu.real_addressing() {
        ctx.transaction(|ctx| {
            let sp = ctx.cpu.stack_pointer();
            ctx.cpu
                .set_stack_pointer(sp.wrapping_add(2 * size.bytes() + release));
            ctx.cpu.load_real_segment(SegReg::Cs, cs);
            ctx.cpu.eip = eip;
            Ok(())
        })?;
        return Ok(ExecOutcome::Branch);
    }

    let cs = Selector(cs);
    let cpl = ctx.cpu.cpl;
    if cs.is_null() {
        return Err(GP0);
    }
    let cs_code = cs.error_code();
    if cs.rpl() < cpl {
        return Err(Fault::GeneralProtection(cs_code));
    }
    let cs_desc = ctx.read_descriptor(cs)?;
    let cs_ok = match cs_desc.kind {
        DescriptorKind::Code {
            conforming: true, ..
        } => cs_desc.dpl <= cs.rpl(),
        DescriptorKind::Code { .. } => cs_desc.dpl == cs.rpl(),
        _ => false,
    };
    if !cs_ok {
        return Err(Fault::GeneralProtection(cs_code));
    }
    if !cs_desc.present {
        return Err(Fault::SegmentNotPresent(cs_code));
    }
    if eip > cs_desc.limit {
        return Err(GP0);
    }

    let new_cpl = cs.rpl();
    if new_cpl == cpl {
        ctx.transaction(|ctx| {
            let sp = ctx.cpu.stack_pointer();
            ctx.cpu
                .set_stack_pointer(sp.wrapping_add(2 * size.bytes() + release));
            install_code_segment(ctx, cs, &cs_desc, cpl)?;
            ctx.cpu.eip = eip;
            Ok(())
        })?;
        return Ok(ExecOutcome::Branch);
    }

    // Return to an outer level: the caller's SS:ESP sits above the released parameters.
    let mask = ctx.cpu.stack_mask();
    let outer_at = ctx
        .cpu
        .stack_pointer()
        .wrapping_add(2 * size.bytes() + release)
        & mask;
    let esp = ctx.read(SegReg::Ss, outer_at, size)?;
    let ss = Selector(ctx.read(SegReg::Ss, outer_at.wrapping_add(size.bytes()) & mask, size)? as u16);
    let ss_desc = check_stack_segment(ctx, ss, new_cpl, Fault::GeneralProtection)?;

    ctx.transaction(|ctx| {
        install_code_segment(ctx, cs, &cs_desc, new_cpl)?;
        ctx.cpu.eip = eip;
        install_stack_segment(ctx, ss, &ss_desc)?;
        ctx.cpu.set_stack_pointer(esp.wrapping_add(release));
        invalidate_outer_data_segments(ctx);
        Ok(())
    })?;
    Ok(ExecOutcome::Branch)
}

// --- loops ---

fn count_register(insn: &Insn) -> OpSize {
    if insn.addr32 {
        OpSize::Dword
    } else {
        OpSize::Word
    }
}

/// LOOP, LOOPE, LOOPNE.
pub(super) fn loop_(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = count_register(insn);
    let count = ctx.cpu.regs.get(Gpr::Ecx, size).wrapping_sub(1) & size.mask();
    let taken = count != 0
        && match insn.mnemonic() {
            Mnemonic::Loope => ctx.cpu.flags.zf(),
            Mnemonic::Loopne => !ctx.cpu.flags.zf(),
            _ => true,
        };
    let target = if taken {
        Some(check_cs_limit(ctx, relative_target(ctx, insn))?)
    } else {
        None
    };
    ctx.cpu.regs.set(Gpr::Ecx, size, count);
    match target {
        Some(target) => {
            ctx.cpu.eip = target;
            Ok(ExecOutcome::Branch)
        }
        None => Ok(ExecOutcome::Continue),
    }
}

/// JCXZ / JECXZ.
pub(super) fn jcxz(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = if insn.mnemonic() == Mnemonic::Jecxz {
        OpSize::Dword
    } else {
        OpSize::Word
    };
    if ctx.cpu.regs.get(Gpr::Ecx, size) != 0 {
        return Ok(ExecOutcome::Continue);
    }
    ctx.cpu.eip = check_cs_limit(ctx, relative_target(ctx, insn))?;
    Ok(ExecOutcome::Branch)
}

// --- software interrupts ---

/// INT n, INT3 and INTO trap to the monitor in virtual-8086 mode unless IOPL is 3.
fn software_interrupt(ctx: &mut ExecCtx, vector: u8) -> ExecResult {
    if ctx.cpu.flags.vm() && ctx.cpu.flags.iopl() < 3 {
        return Err(GP0);
    }
    deliver_interrupt(ctx, vector, InterruptSource::Software, None)?;
    Ok(ExecOutcome::Branch)
}

pub(super) fn int(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    software_interrupt(ctx, insn.instr.immediate(0) as u8)
}

pub(super) fn int3(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    software_interrupt(ctx, Fault::Breakpoint.vector())
}

/// ICEBP raises #DB without the gate privilege check.
pub(super) fn int1(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    deliver_interrupt(ctx, Fault::Debug.vector(), InterruptSource::Exception, None)?;
    Ok(ExecOutcome::Branch)
}

pub(super) fn into(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    if !ctx.cpu.flags.of() {
        return Ok(ExecOutcome::Continue);
    }
    software_interrupt(ctx, Fault::Overflow.vector())
}

pub(super) fn iret(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    interrupt_return(ctx, insn.op32)?;
    Ok(ExecOutcome::Branch)
}

pub(super) fn bound(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    if insn.instr.op1_kind() != OpKind::Memory {
        return Err(Fault::InvalidOpcode);
    }
    let size = OpSize::word_or_dword(insn.op32);
    let index = size.sign_extend(read_operand(ctx, insn, 0, size)?) as i32;
    let seg = memory_segment(insn);
    let ea = effective_address(ctx, insn);
    let mut upper_at = ea.wrapping_add(size.bytes());
    if !insn.addr32 {
        upper_at &= 0xffff;
    }
    let lower = size.sign_extend(ctx.read(seg, ea, size)?) as i32;
    let upper = size.sign_extend(ctx.read(seg, upper_at, size)?) as i32;
    if index < lower || index > upper {
        return Err(Fault::BoundRange);
    }
    Ok(ExecOutcome::Continue)
}

// --- frames ---

pub(super) fn enter(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let alloc = insn.instr.immediate(0) as u32 & 0xffff;
    let level = insn.instr.immediate(1) as u32 & 0x1f;
    let stack32 = ctx.cpu.stack32();

    ctx.transaction(|ctx| {
        let ebp = ctx.cpu.regs.get32(Gpr::Ebp);
        ctx.push(ebp, size)?;
        let frame = ctx.cpu.stack_pointer();

        if level > 0 {
            let mask = ctx.cpu.stack_mask();
            let mut link = ebp;
            for _ in 1..level {
                link = link.wrapping_sub(size.bytes()) & mask;
                let value = ctx.read(SegReg::Ss, link, size)?;
                ctx.push(value, size)?;
            }
            ctx.push(frame, size)?;
        }

        let frame_size = if stack32 { OpSize::Dword } else { OpSize::Word };
        ctx.cpu.regs.set(Gpr::Ebp, frame_size, frame);
        let sp = ctx.cpu.stack_pointer();
        ctx.cpu.set_stack_pointer(sp.wrapping_sub(alloc));
        // The allocated frame must fit in SS.
        let lowest = ctx.cpu.stack_pointer();
        if alloc > 0 {
            ctx.read(SegReg::Ss, lowest, OpSize::Byte)?;
        }
        Ok(ExecOutcome::Continue)
    })
}

pub(super) fn leave(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = OpSize::word_or_dword(insn.op32);
    let frame = ctx.cpu.regs.get32(Gpr::Ebp) & ctx.cpu.stack_mask();
    let saved = ctx.read(SegReg::Ss, frame, size)?;
    ctx.cpu.set_stack_pointer(frame.wrapping_add(size.bytes()));
    ctx.cpu.regs.set(Gpr::Ebp, size, saved);
    Ok(ExecOutcome::Continue)
}

pub(super) fn hlt(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    require_cpl0(ctx)?;
    ctx.cpu.halted = true;
    Ok(ExecOutcome::Halt)
}
