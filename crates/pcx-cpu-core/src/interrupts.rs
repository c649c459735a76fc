//! Interrupt and exception delivery (IVT/IDT), privilege transitions and IRET.

use tracing::{trace, warn};

use crate::ctx::ExecCtx;
use crate::descriptor::{Descriptor, Selector, SystemKind};
use crate::fault::{should_double_fault, Fault, GP0};
use crate::flags::{Flags, STATUS_FLAGS};
use crate::protection::{
    check_stack_segment, install_code_segment, install_stack_segment,
    invalidate_outer_data_segments,
};
use crate::registers::{Gpr, OpSize};
use crate::segment::SegReg;
use crate::state::CpuState;
use crate::task::{stack_for_cpl, switch_to_task, TaskSwitchKind, TssKind};

/// External interrupt controller (the PIC pair on a PC).
pub trait InterruptController {
    /// Raise an IRQ line.
    fn set_interrupt(&mut self, irq: u8);
    /// Lower an IRQ line.
    fn clear_interrupt(&mut self, irq: u8);
    /// Whether an unmasked interrupt is waiting to be acknowledged.
    fn is_pending(&self) -> bool;
    /// Acknowledge the highest priority pending interrupt and return its vector.
    fn get_interrupt(&mut self) -> u8;
}

impl<T: InterruptController + ?Sized> InterruptController for &mut T {
    fn set_interrupt(&mut self, irq: u8) {
        (**self).set_interrupt(irq)
    }

    fn clear_interrupt(&mut self, irq: u8) {
        (**self).clear_interrupt(irq)
    }

    fn is_pending(&self) -> bool {
        (**self).is_pending()
    }

    fn get_interrupt(&mut self) -> u8 {
        (**self).get_interrupt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Hardware IRQ from the interrupt controller.
    External,
    /// INT n, INT3, INTO.
    Software,
    /// Processor exception.
    Exception,
}

/// Flags an instruction running at the current privilege may change (POPF, IRET).
pub fn writable_flags(cpu: &CpuState, op32: bool) -> u32 {
    let mut mask = STATUS_FLAGS
        | Flags::TF.bits()
        | Flags::DF.bits()
        | Flags::NT.bits()
        | Flags::AC.bits()
        | Flags::ID.bits();
    if cpu.cpl == 0 {
        mask |= Flags::IOPL.bits() | Flags::IF.bits();
    } else if cpu.cpl <= cpu.flags.iopl() {
        mask |= Flags::IF.bits();
    }
    if !op32 {
        mask &= 0xffff;
    }
    mask
}

/// Deliver `vector`. `cpu.eip` must already hold the return address.
pub fn deliver_interrupt(
    ctx: &mut ExecCtx,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u32>,
) -> Result<(), Fault> {
    trace!(vector, ?source, eip = ctx.cpu.eip, "delivering interrupt");
    if ctx.cpu.protected_mode() {
        deliver_protected(ctx, vector, source, error_code)
    } else {
        deliver_real(ctx, vector)
    }
}

fn deliver_real(ctx: &mut ExecCtx, vector: u8) -> Result<(), Fault> {
    let entry = vector as u32 * 4;
    if entry + 3 > ctx.cpu.idtr.limit as u32 {
        return Err(Fault::GeneralProtection(vector as u16 * 8 + 2));
    }
    let base = ctx.cpu.idtr.base;
    let offset = ctx.read_sys(base + entry, OpSize::Word)?;
    let segment = ctx.read_sys(base + entry + 2, OpSize::Word)? as u16;

    ctx.transaction(|ctx| {
        let flags = ctx.cpu.flags.value();
        let cs = ctx.cpu.seg(SegReg::Cs).selector.0 as u32;
        let ip = ctx.cpu.eip;
        ctx.push(flags, OpSize::Word)?;
        ctx.push(cs, OpSize::Word)?;
        ctx.push(ip, OpSize::Word)?;
        ctx.cpu.flags.set(Flags::IF, false);
        ctx.cpu.flags.set(Flags::TF, false);
        ctx.cpu.flags.set(Flags::AC, false);
        ctx.cpu.load_real_segment(SegReg::Cs, segment);
        ctx.cpu.eip = offset;
        Ok(())
    })
}

fn deliver_protected(
    ctx: &mut ExecCtx,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u32>,
) -> Result<(), Fault> {
    let ext = u16::from(source == InterruptSource::External);
    let idt_code = (vector as u16) << 3 | 2 | ext;

    let entry = vector as u32 * 8;
    if entry + 7 > ctx.cpu.idtr.limit as u32 {
        return Err(Fault::GeneralProtection(idt_code));
    }
    let base = ctx.cpu.idtr.base;
    let lo = ctx.read_sys(base + entry, OpSize::Dword)? as u64;
    let hi = ctx.read_sys(base + entry + 4, OpSize::Dword)? as u64;
    let gate = Descriptor::parse(lo | hi << 32);

    let kind = match gate.system_kind() {
        Some(
            kind @ (SystemKind::InterruptGate16
            | SystemKind::InterruptGate32
            | SystemKind::TrapGate16
            | SystemKind::TrapGate32
            | SystemKind::TaskGate),
        ) => kind,
        _ => return Err(Fault::GeneralProtection(idt_code)),
    };
    if source == InterruptSource::Software && gate.dpl < ctx.cpu.cpl {
        return Err(Fault::GeneralProtection(idt_code));
    }
    if !gate.present {
        return Err(Fault::SegmentNotPresent(idt_code));
    }

    if kind == SystemKind::TaskGate {
        return deliver_through_task_gate(ctx, &gate, error_code);
    }

    let cs = gate.gate_selector();
    let cs_code = cs.error_code();
    if cs.is_null() {
        return Err(Fault::GeneralProtection(ext));
    }
    let cs_desc = ctx.read_descriptor(cs)?;
    if !cs_desc.is_code() || cs_desc.dpl > ctx.cpu.cpl {
        return Err(Fault::GeneralProtection(cs_code));
    }
    if !cs_desc.present {
        return Err(Fault::SegmentNotPresent(cs_code));
    }

    let size = if kind.is_32bit_gate() {
        OpSize::Dword
    } else {
        OpSize::Word
    };
    let offset = gate.gate_offset();
    let clear_if = matches!(
        kind,
        SystemKind::InterruptGate16 | SystemKind::InterruptGate32
    );
    let v86 = ctx.cpu.flags.vm();
    let inner = !cs_desc.is_conforming_code() && cs_desc.dpl < ctx.cpu.cpl;

    if v86 && (!inner || cs_desc.dpl != 0) {
        return Err(Fault::GeneralProtection(cs_code));
    }

    ctx.transaction(|ctx| {
        let old_flags = ctx.cpu.flags.value();
        let old_cs = ctx.cpu.seg(SegReg::Cs).selector.0 as u32;
        let old_eip = ctx.cpu.eip;

        let new_cpl = if inner {
            let new_cpl = cs_desc.dpl;
            let (ss, esp) = stack_for_cpl(ctx, new_cpl)?;
            let ss_desc = check_stack_segment(ctx, ss, new_cpl, Fault::InvalidTss)?;
            let old_ss = ctx.cpu.seg(SegReg::Ss).selector.0 as u32;
            let old_esp = ctx.cpu.regs.get32(Gpr::Esp);

            ctx.cpu.flags.set(Flags::VM, false);
            ctx.cpu.cpl = new_cpl;
            install_stack_segment(ctx, ss, &ss_desc)?;
            ctx.cpu.regs.set32(Gpr::Esp, esp);

            if v86 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    let sel = ctx.cpu.seg(seg).selector.0 as u32;
                    ctx.push(sel, size)?;
                    ctx.cpu.seg_mut(seg).load_null(Selector(0));
                }
            }
            ctx.push(old_ss, size)?;
            ctx.push(old_esp, size)?;
            new_cpl
        } else {
            ctx.cpu.cpl
        };

        ctx.push(old_flags, size)?;
        ctx.push(old_cs, size)?;
        ctx.push(old_eip, size)?;
        if let Some(code) = error_code {
            ctx.push(code, size)?;
        }

        install_code_segment(ctx, cs, &cs_desc, new_cpl)?;
        ctx.cpu.eip = if size == OpSize::Dword {
            offset
        } else {
            offset & 0xffff
        };
        for flag in [Flags::TF, Flags::NT, Flags::VM, Flags::RF] {
            ctx.cpu.flags.set(flag, false);
        }
        if clear_if {
            ctx.cpu.flags.set(Flags::IF, false);
        }
        Ok(())
    })
}

fn deliver_through_task_gate(
    ctx: &mut ExecCtx,
    gate: &Descriptor,
    error_code: Option<u32>,
) -> Result<(), Fault> {
    let tss = gate.gate_selector();
    if tss.uses_ldt() {
        return Err(Fault::GeneralProtection(tss.error_code()));
    }
    let desc = ctx.read_descriptor(tss)?;
    switch_to_task(ctx, tss, &desc, TaskSwitchKind::Interrupt)?;
    if let Some(code) = error_code {
        let size = match ctx.cpu.tr.kind {
            TssKind::Tss32 => OpSize::Dword,
            TssKind::Tss16 => OpSize::Word,
        };
        ctx.push(code, size)?;
    }
    Ok(())
}

/// IRET / IRETD.
pub fn iret(ctx: &mut ExecCtx, op32: bool) -> Result<(), Fault> {
    let size = OpSize::word_or_dword(op32);
    if !ctx.cpu.protected_mode() {
        return iret_real(ctx, size);
    }
    if ctx.cpu.flags.vm() {
        if ctx.cpu.flags.iopl() < 3 {
            return Err(GP0);
        }
        return iret_real(ctx, size);
    }
    if ctx.cpu.flags.nt() {
        return iret_task(ctx);
    }

    let eip = ctx.peek(0, size)?;
    let cs = Selector(ctx.peek(1, size)? as u16);
    let flags = ctx.peek(2, size)?;

    if op32 && flags & Flags::VM.bits() != 0 && ctx.cpu.cpl == 0 {
        return iret_to_v86(ctx, eip, cs.0, flags);
    }

    let cs_code = cs.error_code();
    if cs.is_null() {
        return Err(GP0);
    }
    if cs.rpl() < ctx.cpu.cpl {
        return Err(Fault::GeneralProtection(cs_code));
    }
    let cs_desc = ctx.read_descriptor(cs)?;
    let cs_ok = if cs_desc.is_conforming_code() {
        cs_desc.dpl <= cs.rpl()
    } else {
        cs_desc.is_code() && cs_desc.dpl == cs.rpl()
    };
    if !cs_ok {
        return Err(Fault::GeneralProtection(cs_code));
    }
    if !cs_desc.present {
        return Err(Fault::SegmentNotPresent(cs_code));
    }

    let mask = writable_flags(ctx.cpu, op32);
    let new_cpl = cs.rpl();
    if new_cpl == ctx.cpu.cpl {
        return ctx.transaction(|ctx| {
            for _ in 0..3 {
                ctx.pop(size)?;
            }
            install_code_segment(ctx, cs, &cs_desc, new_cpl)?;
            ctx.cpu.eip = eip & size.mask();
            ctx.cpu.flags.set_value(flags, mask);
            Ok(())
        });
    }

    let esp = ctx.peek(3, size)?;
    let ss = Selector(ctx.peek(4, size)? as u16);
    let ss_desc = check_stack_segment(ctx, ss, new_cpl, Fault::GeneralProtection)?;
    ctx.transaction(|ctx| {
        ctx.cpu.flags.set_value(flags, mask);
        install_code_segment(ctx, cs, &cs_desc, new_cpl)?;
        ctx.cpu.eip = eip & size.mask();
        install_stack_segment(ctx, ss, &ss_desc)?;
        ctx.cpu.set_stack_pointer(esp);
        invalidate_outer_data_segments(ctx);
        Ok(())
    })
}

fn iret_real(ctx: &mut ExecCtx, size: OpSize) -> Result<(), Fault> {
    let eip = ctx.peek(0, size)?;
    let cs = ctx.peek(1, size)? as u16;
    let flags = ctx.peek(2, size)?;
    let mut mask = writable_flags(ctx.cpu, size == OpSize::Dword);
    mask &= !(Flags::VM.bits() | Flags::VIF.bits() | Flags::VIP.bits());
    ctx.transaction(|ctx| {
        for _ in 0..3 {
            ctx.pop(size)?;
        }
        ctx.cpu.load_real_segment(SegReg::Cs, cs);
        ctx.cpu.eip = eip & size.mask();
        ctx.cpu.flags.set_value(flags, mask);
        Ok(())
    })
}

fn iret_to_v86(ctx: &mut ExecCtx, eip: u32, cs: u16, flags: u32) -> Result<(), Fault> {
    let esp = ctx.peek(3, OpSize::Dword)?;
    let mut segs = [0u16; 5];
    for (i, slot) in segs.iter_mut().enumerate() {
        *slot = ctx.peek(4 + i as u32, OpSize::Dword)? as u16;
    }
    let [ss, es, ds, fs, gs] = segs;
    ctx.transaction(|ctx| {
        ctx.cpu.flags.set_value(flags, !0);
        ctx.cpu.cpl = 3;
        for (seg, sel) in [
            (SegReg::Cs, cs),
            (SegReg::Ss, ss),
            (SegReg::Es, es),
            (SegReg::Ds, ds),
            (SegReg::Fs, fs),
            (SegReg::Gs, gs),
        ] {
            ctx.cpu.seg_mut(seg).load_v86(seg, sel);
        }
        ctx.cpu.regs.set32(Gpr::Esp, esp);
        ctx.cpu.eip = eip & 0xffff;
        Ok(())
    })
}

fn iret_task(ctx: &mut ExecCtx) -> Result<(), Fault> {
    let tr = ctx.cpu.tr;
    let link = Selector(ctx.read_sys(tr.base, OpSize::Word)? as u16);
    let code = link.error_code();
    if link.uses_ldt() || link.is_null() {
        return Err(Fault::InvalidTss(code));
    }
    let desc = ctx
        .fetch_descriptor(link)?
        .ok_or(Fault::InvalidTss(code))?;
    if !desc.system_kind().is_some_and(SystemKind::is_tss) {
        return Err(Fault::InvalidTss(code));
    }
    switch_to_task(ctx, link, &desc, TaskSwitchKind::Iret)
}

/// Result of routing a fault through the IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDelivery {
    Delivered,
    TripleFault,
}

/// Deliver `fault`, escalating to `#DF` and finally to a triple fault when delivery itself
/// faults. `cpu.eip` must point at the faulting instruction.
pub fn raise_fault(ctx: &mut ExecCtx, fault: Fault) -> FaultDelivery {
    let mut current = fault;
    // Benign faults during delivery are delivered in turn; a guest with a broken IDT could
    // chain them forever, so give up after a handful.
    for _ in 0..8 {
        trace!(%current, eip = ctx.cpu.eip, "raising exception");
        let result = deliver_interrupt(
            ctx,
            current.vector(),
            InterruptSource::Exception,
            current.error_code(),
        );
        match result {
            Ok(()) => return FaultDelivery::Delivered,
            Err(second) if current == Fault::DoubleFault => {
                warn!(%second, "fault while delivering #DF");
                return FaultDelivery::TripleFault;
            }
            Err(second) if should_double_fault(current, second) => current = Fault::DoubleFault,
            Err(second) => current = second,
        }
    }
    warn!(%fault, "exception delivery did not converge");
    FaultDelivery::TripleFault
}
