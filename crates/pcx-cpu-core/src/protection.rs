//! Protected-mode segment loads and access-rights probes.

use crate::ctx::ExecCtx;
use crate::descriptor::{Descriptor, DescriptorKind, Selector, SystemKind, DESC_ACCESSED};
use crate::fault::{Fault, GP0};
use crate::segment::{data_load_allowed, SegReg};

fn mark_accessed(ctx: &mut ExecCtx, selector: Selector, desc: &Descriptor) -> Result<(), Fault> {
    if desc.raw & DESC_ACCESSED == 0 {
        ctx.update_descriptor(selector, DESC_ACCESSED, 0)?;
    }
    Ok(())
}

/// Load SS, DS, ES, FS or GS (MOV Sreg, POP Sreg, LDS and friends).
///
/// Loading SS holds off interrupts until the next instruction has run.
pub fn load_segment(ctx: &mut ExecCtx, seg: SegReg, selector: u16) -> Result<(), Fault> {
    debug_assert!(seg != SegReg::Cs);
    if ctx.cpu.real_addressing() {
        ctx.cpu.load_real_segment(seg, selector);
    } else if seg == SegReg::Ss {
        load_stack_segment(ctx, Selector(selector))?;
    } else {
        load_data_segment(ctx, seg, Selector(selector))?;
    }
    if seg == SegReg::Ss {
        ctx.cpu.interrupt_shadow = true;
    }
    Ok(())
}

fn load_data_segment(ctx: &mut ExecCtx, seg: SegReg, selector: Selector) -> Result<(), Fault> {
    if selector.is_null() {
        ctx.cpu.seg_mut(seg).load_null(selector);
        return Ok(());
    }
    let code = selector.error_code();
    let cpl = ctx.cpu.cpl;
    let desc = ctx.read_descriptor(selector)?;
    if !data_load_allowed(selector, &desc, cpl) {
        return Err(Fault::GeneralProtection(code));
    }
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    mark_accessed(ctx, selector, &desc)?;
    ctx.cpu.seg_mut(seg).load_protected(selector, &desc, cpl);
    Ok(())
}

/// Validate a stack segment for privilege level `cpl` and return its descriptor.
///
/// `fault` builds the exception for a malformed selector (`#GP` for instruction loads, `#TS`
/// when the selector comes from a TSS); a merely absent segment raises `#SS`.
pub fn check_stack_segment(
    ctx: &mut ExecCtx,
    selector: Selector,
    cpl: u8,
    fault: fn(u16) -> Fault,
) -> Result<Descriptor, Fault> {
    let code = selector.error_code();
    if selector.is_null() {
        return Err(fault(0));
    }
    let desc = ctx.fetch_descriptor(selector)?.ok_or(fault(code))?;
    if selector.rpl() != cpl || !desc.is_writable_data() || desc.dpl != cpl {
        return Err(fault(code));
    }
    if !desc.present {
        return Err(Fault::StackFault(code));
    }
    Ok(desc)
}

fn load_stack_segment(ctx: &mut ExecCtx, selector: Selector) -> Result<(), Fault> {
    let cpl = ctx.cpu.cpl;
    let desc = check_stack_segment(ctx, selector, cpl, Fault::GeneralProtection)?;
    mark_accessed(ctx, selector, &desc)?;
    ctx.cpu.seg_mut(SegReg::Ss).load_stack(selector, &desc);
    Ok(())
}

/// Load SS with an already-validated descriptor (privilege-changing transfers).
pub fn install_stack_segment(ctx: &mut ExecCtx, selector: Selector, desc: &Descriptor) -> Result<(), Fault> {
    mark_accessed(ctx, selector, desc)?;
    ctx.cpu.seg_mut(SegReg::Ss).load_stack(selector, desc);
    Ok(())
}

/// Check a direct far JMP/CALL target and return the CPL the code will run at.
pub fn check_direct_code_target(selector: Selector, desc: &Descriptor, cpl: u8) -> Result<u8, Fault> {
    let code = selector.error_code();
    match desc.kind {
        DescriptorKind::Code {
            conforming: true, ..
        } if desc.dpl <= cpl => {}
        DescriptorKind::Code {
            conforming: false, ..
        } if selector.rpl() <= cpl && desc.dpl == cpl => {}
        _ => return Err(Fault::GeneralProtection(code)),
    }
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    Ok(cpl)
}

/// Load CS and make `cpl` current. The selector's RPL is replaced by `cpl`.
pub fn install_code_segment(
    ctx: &mut ExecCtx,
    selector: Selector,
    desc: &Descriptor,
    cpl: u8,
) -> Result<(), Fault> {
    mark_accessed(ctx, selector, desc)?;
    ctx.cpu.seg_mut(SegReg::Cs).load_code(selector.with_rpl(cpl), desc);
    ctx.cpu.cpl = cpl;
    Ok(())
}

/// On a return to an outer level, null any data segment register the new CPL may not use.
pub fn invalidate_outer_data_segments(ctx: &mut ExecCtx) {
    let cpl = ctx.cpu.cpl;
    for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
        let reg = ctx.cpu.seg_mut(seg);
        let cache = &reg.cache;
        let privileged = cache.valid && !(cache.executable && cache.conforming) && cache.dpl < cpl;
        if privileged {
            reg.load_null(Selector(0));
        }
    }
}

/// ARPL: raise `dest`'s RPL to `src`'s. Returns the new selector and whether it changed (ZF).
pub fn arpl(dest: u16, src: u16) -> (u16, bool) {
    if dest & 3 < src & 3 {
        ((dest & !3) | (src & 3), true)
    } else {
        (dest, false)
    }
}

/// Whether a descriptor is visible to LAR/LSL/VERR/VERW at this CPL and RPL.
fn visible(selector: Selector, desc: &Descriptor, cpl: u8) -> bool {
    desc.is_conforming_code() || desc.dpl >= cpl.max(selector.rpl())
}

fn probe(ctx: &mut ExecCtx, selector: Selector) -> Result<Option<Descriptor>, Fault> {
    if !ctx.cpu.protected_mode() || ctx.cpu.flags.vm() {
        return Err(Fault::InvalidOpcode);
    }
    if selector.is_null() {
        return Ok(None);
    }
    let cpl = ctx.cpu.cpl;
    Ok(ctx
        .fetch_descriptor(selector)?
        .filter(|desc| visible(selector, desc, cpl)))
}

/// LAR: the access-rights bytes of a descriptor, or `None` (ZF=0).
pub fn lar(ctx: &mut ExecCtx, selector: Selector) -> Result<Option<u32>, Fault> {
    let Some(desc) = probe(ctx, selector)? else {
        return Ok(None);
    };
    let allowed = match desc.kind {
        DescriptorKind::System(kind) => matches!(
            kind,
            SystemKind::Tss16 { .. }
                | SystemKind::Tss32 { .. }
                | SystemKind::Ldt
                | SystemKind::CallGate16
                | SystemKind::CallGate32
                | SystemKind::TaskGate
        ),
        _ => true,
    };
    Ok(allowed.then_some((desc.raw >> 32) as u32 & 0x00f0_ff00))
}

/// LSL: the byte-granular segment limit, or `None` (ZF=0).
pub fn lsl(ctx: &mut ExecCtx, selector: Selector) -> Result<Option<u32>, Fault> {
    let Some(desc) = probe(ctx, selector)? else {
        return Ok(None);
    };
    let allowed = match desc.kind {
        DescriptorKind::System(kind) => kind.is_tss() || kind == SystemKind::Ldt,
        _ => true,
    };
    Ok(allowed.then_some(desc.limit))
}

/// VERR: ZF=1 when the segment is readable at the current privilege.
pub fn verr(ctx: &mut ExecCtx, selector: Selector) -> Result<bool, Fault> {
    Ok(probe(ctx, selector)?.is_some_and(|desc| desc.is_readable()))
}

/// VERW: ZF=1 when the segment is writable at the current privilege.
pub fn verw(ctx: &mut ExecCtx, selector: Selector) -> Result<bool, Fault> {
    Ok(probe(ctx, selector)?.is_some_and(|desc| desc.is_writable_data()))
}

/// `#GP(0)` for instructions that need CPL 0.
pub fn require_cpl0(ctx: &ExecCtx) -> Result<(), Fault> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        Err(GP0)
    } else {
        Ok(())
    }
}
