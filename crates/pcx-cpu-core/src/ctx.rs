use pcx_mmu::{AccessType, MemoryBus};

use crate::bus::{IoBus, PhysicalMemory};
use crate::descriptor::{Descriptor, Selector};
use crate::fault::{Fault, GP0};
use crate::flags::FlagRegister;
use crate::interrupts::InterruptController;
use crate::registers::{OpSize, Registers};
use crate::segment::{SegReg, SegmentRegister};
use crate::state::CpuState;

/// Everything an instruction handler may touch while it executes.
pub struct ExecCtx<'a> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut PhysicalMemory,
    pub io: &'a mut IoBus,
    pub pic: &'a mut dyn InterruptController,
    /// EIP of the instruction being executed; `cpu.eip` already points past it.
    pub insn_eip: u32,
    /// Cycles charged on top of the base instruction cost (e.g. rep iterations).
    pub extra_cycles: u64,
    /// Iterations a repeated string instruction may run before yielding.
    pub rep_budget: u32,
    /// Cost of one repeated string iteration.
    pub rep_iteration_cycles: u64,
}

#[derive(Clone)]
struct Snapshot {
    regs: Registers,
    eip: u32,
    flags: FlagRegister,
    segs: [SegmentRegister; 6],
    cpl: u8,
}

impl<'a> ExecCtx<'a> {
    pub fn new(
        cpu: &'a mut CpuState,
        mem: &'a mut PhysicalMemory,
        io: &'a mut IoBus,
        pic: &'a mut dyn InterruptController,
        rep_budget: u32,
    ) -> Self {
        let insn_eip = cpu.eip;
        Self {
            cpu,
            mem,
            io,
            pic,
            insn_eip,
            extra_cycles: 0,
            rep_budget,
            rep_iteration_cycles: 1,
        }
    }

    /// Run `f`; if it faults, roll back registers, EIP, flags, segments and CPL.
    ///
    /// Memory writes already performed are not undone, matching hardware where a fault in the
    /// middle of an interrupt frame leaves partially written stack bytes.
    pub fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, Fault>,
    ) -> Result<R, Fault> {
        let saved = Snapshot {
            regs: self.cpu.regs,
            eip: self.cpu.eip,
            flags: self.cpu.flags,
            segs: self.cpu.segs,
            cpl: self.cpu.cpl,
        };
        let result = f(self);
        if result.is_err() {
            self.cpu.regs = saved.regs;
            self.cpu.eip = saved.eip;
            self.cpu.flags = saved.flags;
            self.cpu.segs = saved.segs;
            self.cpu.cpl = saved.cpl;
        }
        result
    }

    #[inline]
    fn user(&self) -> bool {
        self.cpu.cpl == 3
    }

    // --- linear address space ---

    pub fn translate(&mut self, linear: u32, access: AccessType, user: bool) -> Result<u32, Fault> {
        Ok(self.cpu.mmu.translate(&mut *self.mem, linear, access, user)?)
    }

    /// Read `size` bytes at a linear address. Both pages of a split access are translated
    /// before any byte is read.
    pub fn read_linear_as(&mut self, linear: u32, size: OpSize, user: bool) -> Result<u32, Fault> {
        let len = size.bytes() as u8;
        let span = self
            .cpu
            .mmu
            .translate_span(&mut *self.mem, linear, len, AccessType::Read, user)?;
        if !span.is_split(len) {
            return Ok(match size {
                OpSize::Byte => self.mem.read_u8(span.first) as u32,
                OpSize::Word => self.mem.read_u16(span.first) as u32,
                OpSize::Dword => self.mem.read_u32(span.first),
            });
        }
        let mut value = 0u32;
        for i in 0..len {
            value |= (self.mem.read_u8(span.byte(i)) as u32) << (8 * i as u32);
        }
        Ok(value)
    }

    /// Write `size` bytes at a linear address. A fault on either page leaves memory untouched.
    pub fn write_linear_as(
        &mut self,
        linear: u32,
        size: OpSize,
        value: u32,
        user: bool,
    ) -> Result<(), Fault> {
        let len = size.bytes() as u8;
        let span = self
            .cpu
            .mmu
            .translate_span(&mut *self.mem, linear, len, AccessType::Write, user)?;
        for (i, byte) in value.to_le_bytes().into_iter().take(len as usize).enumerate() {
            self.mem.write_u8(span.byte(i as u8), byte);
        }
        Ok(())
    }

    #[inline]
    pub fn read_linear(&mut self, linear: u32, size: OpSize) -> Result<u32, Fault> {
        let user = self.user();
        self.read_linear_as(linear, size, user)
    }

    #[inline]
    pub fn write_linear(&mut self, linear: u32, size: OpSize, value: u32) -> Result<(), Fault> {
        let user = self.user();
        self.write_linear_as(linear, size, value, user)
    }

    /// Supervisor read of a system structure (descriptor tables, TSS), regardless of CPL.
    #[inline]
    pub fn read_sys(&mut self, linear: u32, size: OpSize) -> Result<u32, Fault> {
        self.read_linear_as(linear, size, false)
    }

    #[inline]
    pub fn write_sys(&mut self, linear: u32, size: OpSize, value: u32) -> Result<(), Fault> {
        self.write_linear_as(linear, size, value, false)
    }

    // --- segmented access ---

    /// Check an access of `len` bytes at `seg:offset` and return its linear address.
    pub fn linear_address(
        &self,
        seg: SegReg,
        offset: u32,
        len: u32,
        access: AccessType,
    ) -> Result<u32, Fault> {
        let cache = &self.cpu.seg(seg).cache;
        let limit_fault = if seg == SegReg::Ss {
            Fault::StackFault(0)
        } else {
            GP0
        };

        if !self.cpu.real_addressing() {
            if !cache.valid {
                return Err(limit_fault);
            }
            match access {
                AccessType::Write if cache.executable || !cache.writable => return Err(GP0),
                AccessType::Read if cache.executable && !cache.readable => return Err(GP0),
                _ => {}
            }
        }
        if !cache.contains(offset, len) {
            return Err(limit_fault);
        }
        Ok(cache.base.wrapping_add(offset))
    }

    pub fn read(&mut self, seg: SegReg, offset: u32, size: OpSize) -> Result<u32, Fault> {
        let linear = self.linear_address(seg, offset, size.bytes(), AccessType::Read)?;
        self.read_linear(linear, size)
    }

    pub fn write(&mut self, seg: SegReg, offset: u32, size: OpSize, value: u32) -> Result<(), Fault> {
        let linear = self.linear_address(seg, offset, size.bytes(), AccessType::Write)?;
        self.write_linear(linear, size, value)
    }

    #[inline]
    pub fn read_u8(&mut self, seg: SegReg, offset: u32) -> Result<u8, Fault> {
        Ok(self.read(seg, offset, OpSize::Byte)? as u8)
    }

    #[inline]
    pub fn read_u16(&mut self, seg: SegReg, offset: u32) -> Result<u16, Fault> {
        Ok(self.read(seg, offset, OpSize::Word)? as u16)
    }

    #[inline]
    pub fn read_u32(&mut self, seg: SegReg, offset: u32) -> Result<u32, Fault> {
        self.read(seg, offset, OpSize::Dword)
    }

    // --- stack ---

    pub fn push(&mut self, value: u32, size: OpSize) -> Result<(), Fault> {
        let sp = self.cpu.stack_pointer().wrapping_sub(size.bytes()) & self.cpu.stack_mask();
        self.write(SegReg::Ss, sp, size, value)?;
        self.cpu.set_stack_pointer(sp);
        Ok(())
    }

    pub fn pop(&mut self, size: OpSize) -> Result<u32, Fault> {
        let sp = self.cpu.stack_pointer();
        let value = self.read(SegReg::Ss, sp, size)?;
        self.cpu.set_stack_pointer(sp.wrapping_add(size.bytes()));
        Ok(value)
    }

    /// Read the stack slot `index` entries of `size` above the stack pointer without popping.
    pub fn peek(&mut self, index: u32, size: OpSize) -> Result<u32, Fault> {
        let offset = self
            .cpu
            .stack_pointer()
            .wrapping_add(index * size.bytes())
            & self.cpu.stack_mask();
        self.read(SegReg::Ss, offset, size)
    }

    // --- descriptor tables ---

    /// Linear address of a selector's descriptor, or `None` when it lies outside the table.
    pub fn descriptor_address(&self, selector: Selector) -> Option<u32> {
        let (base, limit) = if selector.uses_ldt() {
            if !self.cpu.ldtr.valid {
                return None;
            }
            (self.cpu.ldtr.base, self.cpu.ldtr.limit)
        } else {
            (self.cpu.gdtr.base, self.cpu.gdtr.limit as u32)
        };
        let offset = selector.table_offset();
        (offset + 7 <= limit).then(|| base.wrapping_add(offset))
    }

    /// Read a descriptor; `Ok(None)` when the selector is beyond the table limit.
    pub fn fetch_descriptor(&mut self, selector: Selector) -> Result<Option<Descriptor>, Fault> {
        let Some(addr) = self.descriptor_address(selector) else {
            return Ok(None);
        };
        let lo = self.read_sys(addr, OpSize::Dword)? as u64;
        let hi = self.read_sys(addr.wrapping_add(4), OpSize::Dword)? as u64;
        Ok(Some(Descriptor::parse(lo | (hi << 32))))
    }

    /// Read a descriptor, faulting with `#GP(selector)` when it is outside the table.
    pub fn read_descriptor(&mut self, selector: Selector) -> Result<Descriptor, Fault> {
        self.fetch_descriptor(selector)?
            .ok_or(Fault::GeneralProtection(selector.error_code()))
    }

    /// Set and clear bits of a descriptor's high dword in the table (accessed/busy bits).
    pub fn update_descriptor(&mut self, selector: Selector, set: u64, clear: u64) -> Result<(), Fault> {
        let Some(addr) = self.descriptor_address(selector) else {
            return Err(Fault::GeneralProtection(selector.error_code()));
        };
        let addr = addr.wrapping_add(4);
        let hi = self.read_sys(addr, OpSize::Dword)?;
        let updated = (hi | (set >> 32) as u32) & !((clear >> 32) as u32);
        if updated != hi {
            self.write_sys(addr, OpSize::Dword, updated)?;
        }
        Ok(())
    }

    // --- port I/O ---

    pub fn io_read(&mut self, port: u16, size: OpSize) -> u32 {
        match size {
            OpSize::Byte => self.io.read_u8(port) as u32,
            OpSize::Word => self.io.read_u16(port) as u32,
            OpSize::Dword => self.io.read_u32(port),
        }
    }

    pub fn io_write(&mut self, port: u16, size: OpSize, value: u32) {
        match size {
            OpSize::Byte => self.io.write_u8(port, value as u8),
            OpSize::Word => self.io.write_u16(port, value as u16),
            OpSize::Dword => self.io.write_u32(port, value),
        }
    }
}
