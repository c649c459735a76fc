//! Task register, TSS layouts and the hardware task switch.

use tracing::debug;

use crate::ctx::ExecCtx;
use crate::descriptor::{Descriptor, Selector, SystemKind, DESC_TSS_BUSY};
use crate::fault::{Fault, GP0};
use crate::flags::Flags;
use crate::registers::{Gpr, OpSize};
use crate::segment::{data_load_allowed, SegReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TssKind {
    Tss16,
    #[default]
    Tss32,
}

/// TR: the selector of the running task plus its cached TSS geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskRegister {
    pub selector: Selector,
    pub base: u32,
    pub limit: u32,
    pub kind: TssKind,
    pub busy: bool,
    pub valid: bool,
}

/// What caused a task switch; decides busy-bit, back-link and NT handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchKind {
    Interrupt,
    Iret,
    Jmp,
    Call,
}

/// Field offsets of a TSS format.
struct TssLayout {
    min_limit: u32,
    width: OpSize,
    /// Offset of SP0/ESP0; SSn follows at `+ width`, and each level is `2 * stride` apart.
    stack0: u32,
    stack_stride: u32,
    cr3: Option<u32>,
    ip: u32,
    flags: u32,
    gprs: u32,
    segs: u32,
    /// ES, CS, SS, DS; the 32-bit format adds FS and GS.
    seg_count: usize,
    ldt: u32,
    iomap: Option<u32>,
}

const TSS32: TssLayout = TssLayout {
    min_limit: 103,
    width: OpSize::Dword,
    stack0: 0x04,
    stack_stride: 8,
    cr3: Some(0x1c),
    ip: 0x20,
    flags: 0x24,
    gprs: 0x28,
    segs: 0x48,
    seg_count: 6,
    ldt: 0x60,
    iomap: Some(0x66),
};

const TSS16: TssLayout = TssLayout {
    min_limit: 43,
    width: OpSize::Word,
    stack0: 0x02,
    stack_stride: 4,
    cr3: None,
    ip: 0x0e,
    flags: 0x10,
    gprs: 0x12,
    segs: 0x22,
    seg_count: 4,
    ldt: 0x2a,
    iomap: None,
};

const BACK_LINK: u32 = 0;

impl TssKind {
    fn layout(self) -> &'static TssLayout {
        match self {
            TssKind::Tss16 => &TSS16,
            TssKind::Tss32 => &TSS32,
        }
    }

    pub fn min_limit(self) -> u32 {
        self.layout().min_limit
    }

    fn of(kind: SystemKind) -> Option<(TssKind, bool)> {
        match kind {
            SystemKind::Tss16 { busy } => Some((TssKind::Tss16, busy)),
            SystemKind::Tss32 { busy } => Some((TssKind::Tss32, busy)),
            _ => None,
        }
    }
}

/// Register image stored in a TSS.
#[derive(Debug, Clone, Copy)]
struct TaskImage {
    gprs: [u32; 8],
    eip: u32,
    eflags: u32,
    cr3: Option<u32>,
    segs: [u16; 6],
    ldt: u16,
}

const GPRS: [Gpr; 8] = [
    Gpr::Eax,
    Gpr::Ecx,
    Gpr::Edx,
    Gpr::Ebx,
    Gpr::Esp,
    Gpr::Ebp,
    Gpr::Esi,
    Gpr::Edi,
];

fn read_image(ctx: &mut ExecCtx, base: u32, layout: &TssLayout) -> Result<TaskImage, Fault> {
    let w = layout.width;
    let mut gprs = [0u32; 8];
    for (i, slot) in gprs.iter_mut().enumerate() {
        *slot = ctx.read_sys(base + layout.gprs + i as u32 * w.bytes(), w)?;
    }
    let mut segs = [0u16; 6];
    for (i, slot) in segs.iter_mut().take(layout.seg_count).enumerate() {
        *slot = ctx.read_sys(base + layout.segs + i as u32 * w.bytes(), OpSize::Word)? as u16;
    }
    let cr3 = match layout.cr3 {
        Some(offset) => Some(ctx.read_sys(base + offset, OpSize::Dword)?),
        None => None,
    };
    Ok(TaskImage {
        gprs,
        eip: ctx.read_sys(base + layout.ip, w)?,
        eflags: ctx.read_sys(base + layout.flags, w)?,
        cr3,
        segs,
        ldt: ctx.read_sys(base + layout.ldt, OpSize::Word)? as u16,
    })
}

fn save_image(ctx: &mut ExecCtx, base: u32, layout: &TssLayout, image: &TaskImage) -> Result<(), Fault> {
    let w = layout.width;
    for (i, value) in image.gprs.iter().enumerate() {
        ctx.write_sys(base + layout.gprs + i as u32 * w.bytes(), w, *value)?;
    }
    for (i, sel) in image.segs.iter().take(layout.seg_count).enumerate() {
        ctx.write_sys(base + layout.segs + i as u32 * w.bytes(), OpSize::Word, *sel as u32)?;
    }
    if let (Some(offset), Some(cr3)) = (layout.cr3, image.cr3) {
        ctx.write_sys(base + offset, OpSize::Dword, cr3)?;
    }
    ctx.write_sys(base + layout.ip, w, image.eip)?;
    ctx.write_sys(base + layout.flags, w, image.eflags)
}

/// Segment order inside a TSS image.
const TSS_SEGS: [SegReg; 6] = [
    SegReg::Es,
    SegReg::Cs,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Fs,
    SegReg::Gs,
];

/// Switch to the task described by `desc` (already read from the GDT through `selector`).
///
/// Everything that can fail before the outgoing state is saved is checked first. Once the new
/// image is loaded, segment faults are reported in the context of the incoming task: the
/// faulting instruction pointer becomes the new task's EIP.
pub fn switch_to_task(
    ctx: &mut ExecCtx,
    selector: Selector,
    desc: &Descriptor,
    kind: TaskSwitchKind,
) -> Result<(), Fault> {
    let code = selector.error_code();
    let Some((tss_kind, busy)) = desc.system_kind().and_then(TssKind::of) else {
        return Err(Fault::GeneralProtection(code));
    };
    if selector.uses_ldt() {
        return Err(Fault::GeneralProtection(code));
    }
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    if desc.limit < tss_kind.min_limit() {
        return Err(Fault::InvalidTss(code));
    }
    match kind {
        TaskSwitchKind::Iret if !busy => return Err(Fault::InvalidTss(code)),
        TaskSwitchKind::Jmp | TaskSwitchKind::Call | TaskSwitchKind::Interrupt if busy => {
            return Err(Fault::GeneralProtection(code))
        }
        _ => {}
    }

    let old = ctx.cpu.tr;
    let new_layout = tss_kind.layout();
    let incoming = read_image(ctx, desc.base, new_layout)?;

    debug!(
        from = old.selector.0,
        to = selector.0,
        ?kind,
        eip = incoming.eip,
        "hardware task switch"
    );

    // (1) save the outgoing image.
    if old.valid {
        let mut eflags = ctx.cpu.flags.value();
        if kind == TaskSwitchKind::Iret {
            eflags &= !Flags::NT.bits();
        }
        let mut gprs = [0u32; 8];
        for (slot, gpr) in gprs.iter_mut().zip(GPRS) {
            *slot = ctx.cpu.regs.get32(gpr);
        }
        let mut segs = [0u16; 6];
        for (slot, seg) in segs.iter_mut().zip(TSS_SEGS) {
            *slot = ctx.cpu.seg(seg).selector.0;
        }
        let outgoing = TaskImage {
            gprs,
            eip: ctx.cpu.eip,
            eflags,
            cr3: Some(ctx.cpu.mmu.cr3()),
            segs,
            ldt: ctx.cpu.ldtr.selector.0,
        };
        save_image(ctx, old.base, old.kind.layout(), &outgoing)?;
    }

    // The outgoing task is no longer busy unless it is waiting for an IRET back. Cleared only
    // once its state is stored.
    if matches!(kind, TaskSwitchKind::Jmp | TaskSwitchKind::Iret) && old.valid {
        ctx.update_descriptor(old.selector, 0, DESC_TSS_BUSY)?;
    }

    // (2) nesting tasks record where to return.
    let nested = matches!(kind, TaskSwitchKind::Call | TaskSwitchKind::Interrupt);
    if nested {
        ctx.write_sys(desc.base + BACK_LINK, OpSize::Word, old.selector.0 as u32)?;
    }

    // (3) load the incoming image.
    match tss_kind {
        TssKind::Tss32 => {
            for (gpr, value) in GPRS.into_iter().zip(incoming.gprs) {
                ctx.cpu.regs.set32(gpr, value);
            }
        }
        TssKind::Tss16 => {
            for (gpr, value) in GPRS.into_iter().zip(incoming.gprs) {
                ctx.cpu.regs.set16(gpr, value as u16);
            }
        }
    }
    if let Some(cr3) = incoming.cr3 {
        ctx.cpu.mmu.set_cr3(cr3);
    }
    ctx.cpu.eip = incoming.eip;
    ctx.insn_eip = incoming.eip;
    let flag_mask = match tss_kind {
        TssKind::Tss32 => !0,
        TssKind::Tss16 => 0xffff,
    };
    ctx.cpu.flags.set_value(incoming.eflags, flag_mask);
    for (i, seg) in TSS_SEGS.into_iter().enumerate() {
        let reg = ctx.cpu.seg_mut(seg);
        reg.selector = Selector(incoming.segs[i]);
        reg.cache.valid = false;
    }
    ctx.cpu.ldtr.selector = Selector(incoming.ldt);
    ctx.cpu.ldtr.valid = false;

    // (4)
    if nested {
        ctx.cpu.flags.set(Flags::NT, true);
    }

    // (5)
    if kind != TaskSwitchKind::Iret {
        ctx.update_descriptor(selector, DESC_TSS_BUSY, 0)?;
    }
    ctx.cpu.tr = TaskRegister {
        selector,
        base: desc.base,
        limit: desc.limit,
        kind: tss_kind,
        busy: true,
        valid: true,
    };
    ctx.cpu.set_ts();

    // (6) validate and load the new task's segments.
    load_task_segments(ctx, &incoming)
}

fn load_task_segments(ctx: &mut ExecCtx, image: &TaskImage) -> Result<(), Fault> {
    load_task_ldt(ctx, Selector(image.ldt))?;

    if ctx.cpu.flags.vm() {
        for (i, seg) in TSS_SEGS.into_iter().enumerate() {
            ctx.cpu.seg_mut(seg).load_v86(seg, image.segs[i]);
        }
        ctx.cpu.cpl = 3;
        return Ok(());
    }

    let cs = Selector(image.segs[1]);
    let cs_code = cs.error_code();
    if cs.is_null() {
        return Err(Fault::InvalidTss(cs_code));
    }
    let cs_desc = ctx
        .fetch_descriptor(cs)?
        .ok_or(Fault::InvalidTss(cs_code))?;
    let cs_ok = if cs_desc.is_conforming_code() {
        cs_desc.dpl <= cs.rpl()
    } else {
        cs_desc.is_code() && cs_desc.dpl == cs.rpl()
    };
    if !cs_ok {
        return Err(Fault::InvalidTss(cs_code));
    }
    if !cs_desc.present {
        return Err(Fault::SegmentNotPresent(cs_code));
    }
    ctx.cpu.cpl = cs.rpl();
    ctx.cpu.seg_mut(SegReg::Cs).load_code(cs, &cs_desc);

    let cpl = ctx.cpu.cpl;
    let ss = Selector(image.segs[2]);
    let ss_code = ss.error_code();
    if ss.is_null() {
        return Err(Fault::InvalidTss(ss_code));
    }
    let ss_desc = ctx
        .fetch_descriptor(ss)?
        .ok_or(Fault::InvalidTss(ss_code))?;
    if !ss_desc.is_writable_data() || ss.rpl() != cpl || ss_desc.dpl != cpl {
        return Err(Fault::InvalidTss(ss_code));
    }
    if !ss_desc.present {
        return Err(Fault::StackFault(ss_code));
    }
    ctx.cpu.seg_mut(SegReg::Ss).load_stack(ss, &ss_desc);

    for (i, seg) in TSS_SEGS.into_iter().enumerate() {
        if matches!(seg, SegReg::Cs | SegReg::Ss) {
            continue;
        }
        let sel = Selector(image.segs[i]);
        if sel.is_null() {
            ctx.cpu.seg_mut(seg).load_null(sel);
            continue;
        }
        let desc = ctx
            .fetch_descriptor(sel)?
            .ok_or(Fault::InvalidTss(sel.error_code()))?;
        if !data_load_allowed(sel, &desc, cpl) {
            return Err(Fault::InvalidTss(sel.error_code()));
        }
        if !desc.present {
            return Err(Fault::SegmentNotPresent(sel.error_code()));
        }
        ctx.cpu.seg_mut(seg).load_protected(sel, &desc, cpl);
    }
    Ok(())
}

fn load_task_ldt(ctx: &mut ExecCtx, selector: Selector) -> Result<(), Fault> {
    let code = selector.error_code();
    if selector.is_null() {
        ctx.cpu.ldtr.selector = selector;
        ctx.cpu.ldtr.valid = false;
        return Ok(());
    }
    if selector.uses_ldt() {
        return Err(Fault::InvalidTss(code));
    }
    let desc = ctx
        .fetch_descriptor(selector)?
        .ok_or(Fault::InvalidTss(code))?;
    if desc.system_kind() != Some(SystemKind::Ldt) {
        return Err(Fault::InvalidTss(code));
    }
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    install_ldt(ctx, selector, &desc);
    Ok(())
}

fn install_ldt(ctx: &mut ExecCtx, selector: Selector, desc: &Descriptor) {
    ctx.cpu.ldtr.selector = selector;
    ctx.cpu.ldtr.base = desc.base;
    ctx.cpu.ldtr.limit = desc.limit;
    ctx.cpu.ldtr.valid = true;
}

/// The SS:ESP pair the current TSS holds for privilege level `cpl` (0..=2).
pub fn stack_for_cpl(ctx: &mut ExecCtx, cpl: u8) -> Result<(Selector, u32), Fault> {
    let tr = ctx.cpu.tr;
    let tr_fault = Fault::InvalidTss(tr.selector.error_code());
    if !tr.valid {
        return Err(tr_fault);
    }
    let layout = tr.kind.layout();
    let sp_offset = layout.stack0 + cpl as u32 * layout.stack_stride;
    let ss_offset = sp_offset + layout.width.bytes();
    if ss_offset + 1 > tr.limit {
        return Err(tr_fault);
    }
    let sp = ctx.read_sys(tr.base + sp_offset, layout.width)?;
    let ss = ctx.read_sys(tr.base + ss_offset, OpSize::Word)? as u16;
    Ok((Selector(ss), sp))
}

/// Whether a `len`-byte port access is allowed at the current privilege.
///
/// In protected mode with `CPL > IOPL`, and always in virtual-8086 mode, the TSS I/O permission
/// bitmap decides. A 16-bit TSS has no bitmap, so such accesses are denied.
pub fn io_permitted(ctx: &mut ExecCtx, port: u16, len: u32) -> Result<bool, Fault> {
    let cpu = &ctx.cpu;
    if !cpu.protected_mode() || (!cpu.flags.vm() && cpu.cpl <= cpu.flags.iopl()) {
        return Ok(true);
    }
    let tr = cpu.tr;
    let Some(iomap_offset) = tr.kind.layout().iomap.filter(|_| tr.valid) else {
        return Ok(false);
    };
    if tr.limit < iomap_offset + 1 {
        return Ok(false);
    }
    let iomap = ctx.read_sys(tr.base + iomap_offset, OpSize::Word)?;
    let byte_offset = iomap + port as u32 / 8;
    if byte_offset + 1 > tr.limit {
        return Ok(false);
    }
    let bits = ctx.read_sys(tr.base + byte_offset, OpSize::Word)?;
    let mask = ((1u32 << len) - 1) << (port & 7);
    Ok(bits & mask == 0)
}

/// `#GP(0)` unless the port access is permitted.
pub fn check_io(ctx: &mut ExecCtx, port: u16, len: u32) -> Result<(), Fault> {
    if io_permitted(ctx, port, len)? {
        Ok(())
    } else {
        Err(GP0)
    }
}

/// LTR.
pub fn ltr(ctx: &mut ExecCtx, selector: Selector) -> Result<(), Fault> {
    if !ctx.cpu.protected_mode() || ctx.cpu.flags.vm() {
        return Err(Fault::InvalidOpcode);
    }
    if ctx.cpu.cpl != 0 || selector.is_null() {
        return Err(GP0);
    }
    let code = selector.error_code();
    if selector.uses_ldt() {
        return Err(Fault::GeneralProtection(code));
    }
    let desc = ctx.read_descriptor(selector)?;
    let Some((kind, false)) = desc.system_kind().and_then(TssKind::of) else {
        return Err(Fault::GeneralProtection(code));
    };
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    ctx.update_descriptor(selector, DESC_TSS_BUSY, 0)?;
    ctx.cpu.tr = TaskRegister {
        selector,
        base: desc.base,
        limit: desc.limit,
        kind,
        busy: true,
        valid: true,
    };
    Ok(())
}

/// LLDT.
pub fn lldt(ctx: &mut ExecCtx, selector: Selector) -> Result<(), Fault> {
    if !ctx.cpu.protected_mode() || ctx.cpu.flags.vm() {
        return Err(Fault::InvalidOpcode);
    }
    if ctx.cpu.cpl != 0 {
        return Err(GP0);
    }
    if selector.is_null() {
        ctx.cpu.ldtr.selector = selector;
        ctx.cpu.ldtr.valid = false;
        return Ok(());
    }
    let code = selector.error_code();
    if selector.uses_ldt() {
        return Err(Fault::GeneralProtection(code));
    }
    let desc = ctx.read_descriptor(selector)?;
    if desc.system_kind() != Some(SystemKind::Ldt) {
        return Err(Fault::GeneralProtection(code));
    }
    if !desc.present {
        return Err(Fault::SegmentNotPresent(code));
    }
    install_ldt(ctx, selector, &desc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_architectural_offsets() {
        // EDI is the last GPR, GS the last selector.
        assert_eq!(TSS32.gprs + 7 * 4, 0x44);
        assert_eq!(TSS32.segs + 5 * 4, 0x5c);
        assert_eq!(TSS16.gprs + 7 * 2, 0x20);
        assert_eq!(TSS16.segs + 3 * 2, 0x28);
        // SS2:ESP2 of the 32-bit TSS sit at 0x18/0x14.
        assert_eq!(TSS32.stack0 + 2 * TSS32.stack_stride, 0x14);
        assert_eq!(TSS16.stack0 + 2 * TSS16.stack_stride + 2, 0x0c);
    }
}
