use pcx_mmu::{Mmu, CR0_PE, CR0_PG, CR0_TS, CR0_WP};
use tracing::debug;

use crate::descriptor::{DescriptorTable, LdtRegister};
use crate::flags::{CpuModel, FlagRegister};
use crate::registers::{Gpr, Registers};
use crate::segment::{SegReg, SegmentRegister};
use crate::task::TaskRegister;

pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;

/// Architectural processor state. One instance per emulated CPU, owned by the engine.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub model: CpuModel,
    pub regs: Registers,
    pub eip: u32,
    pub flags: FlagRegister,
    pub segs: [SegmentRegister; 6],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: LdtRegister,
    pub tr: TaskRegister,
    pub mmu: Mmu,
    pub cpl: u8,
    pub halted: bool,
    /// Maskable interrupts are held off until the next instruction retires (STI, MOV SS).
    pub interrupt_shadow: bool,
    pub tsc: u64,
    /// DR0..DR7. Stored for MOV DRn; breakpoints are not armed.
    pub debug_regs: [u32; 8],
}

impl CpuState {
    pub fn new(model: CpuModel) -> Self {
        let mut state = Self {
            model,
            regs: Registers::default(),
            eip: 0,
            flags: FlagRegister::new(model),
            segs: [SegmentRegister::default(); 6],
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable::default(),
            ldtr: LdtRegister::default(),
            tr: TaskRegister::default(),
            mmu: Mmu::new(),
            cpl: 0,
            halted: false,
            interrupt_shadow: false,
            tsc: 0,
            debug_regs: [0; 8],
        };
        state.reset();
        state
    }

    /// Power-on / RESET state: real mode, execution starting at F000:FFF0.
    pub fn reset(&mut self) {
        debug!(model = ?self.model, "cpu reset");
        let model = self.model;
        self.regs = Registers::default();
        // EDX holds the component/stepping signature after reset.
        self.regs.set32(
            Gpr::Edx,
            match model {
                CpuModel::I386 => 0x0303,
                CpuModel::I486 => 0x0402,
                CpuModel::Pentium => 0x0543,
                _ => 0,
            },
        );
        self.flags = FlagRegister::new(model);
        for seg in SegReg::ALL {
            self.segs[seg as usize].load_real(seg, 0);
        }
        self.segs[SegReg::Cs as usize].load_real(SegReg::Cs, 0xf000);
        self.eip = 0xfff0;
        self.gdtr = DescriptorTable::default();
        self.idtr = DescriptorTable {
            base: 0,
            limit: 0x3ff,
        };
        self.ldtr = LdtRegister::default();
        self.tr = TaskRegister::default();
        self.mmu = Mmu::new();
        if model >= CpuModel::I486 {
            self.mmu.set_cr0(CR0_ET);
        }
        self.cpl = 0;
        self.halted = false;
        self.interrupt_shadow = false;
        self.debug_regs = [0; 8];
        self.debug_regs[6] = 0xffff_0ff0;
        self.debug_regs[7] = 0x400;
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &SegmentRegister {
        &self.segs[seg as usize]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentRegister {
        &mut self.segs[seg as usize]
    }

    #[inline]
    pub fn cr0(&self) -> u32 {
        self.mmu.cr0()
    }

    /// CR0 bits the model implements.
    fn cr0_capability(&self) -> u32 {
        match self.model {
            CpuModel::I8086 | CpuModel::I186 => 0,
            CpuModel::I286 => CR0_PE | CR0_MP | CR0_EM | CR0_TS,
            CpuModel::I386 => CR0_PE | CR0_MP | CR0_EM | CR0_TS | CR0_ET | CR0_PG,
            CpuModel::I486 | CpuModel::Pentium => 0xe005_003f,
        }
    }

    /// Write CR0, tracking real/protected mode transitions.
    pub fn set_cr0(&mut self, value: u32) {
        let old = self.mmu.cr0();
        let mut value = value & self.cr0_capability();
        if self.model >= CpuModel::I486 {
            value |= CR0_ET;
        }
        if (old ^ value) & (CR0_PE | CR0_PG | CR0_WP) != 0 {
            debug!(old, new = value, "cr0 mode change");
        }
        self.mmu.set_cr0(value);
        if value & CR0_PE == 0 {
            self.cpl = 0;
        }
    }

    pub fn set_ts(&mut self) {
        let cr0 = self.mmu.cr0();
        self.mmu.set_cr0(cr0 | CR0_TS);
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.mmu.cr0() & CR0_PE != 0
    }

    #[inline]
    pub fn v86_mode(&self) -> bool {
        self.protected_mode() && self.flags.vm()
    }

    /// Real mode or virtual-8086 mode: segments are loaded as `selector * 16`.
    #[inline]
    pub fn real_addressing(&self) -> bool {
        !self.protected_mode() || self.flags.vm()
    }

    /// Default operand/address size of the current code segment.
    #[inline]
    pub fn code32(&self) -> bool {
        !self.real_addressing() && self.segs[SegReg::Cs as usize].cache.big
    }

    /// Stack accesses use ESP rather than SP.
    #[inline]
    pub fn stack32(&self) -> bool {
        !self.real_addressing() && self.segs[SegReg::Ss as usize].cache.big
    }

    #[inline]
    pub fn stack_mask(&self) -> u32 {
        if self.stack32() {
            0xffff_ffff
        } else {
            0xffff
        }
    }

    #[inline]
    pub fn stack_pointer(&self) -> u32 {
        self.regs.get32(Gpr::Esp) & self.stack_mask()
    }

    /// Update SP or ESP according to the stack segment size; the upper half of ESP is kept
    /// for 16-bit stacks.
    #[inline]
    pub fn set_stack_pointer(&mut self, value: u32) {
        let mask = self.stack_mask();
        let esp = self.regs.get32(Gpr::Esp);
        self.regs.set32(Gpr::Esp, (esp & !mask) | (value & mask));
    }

    /// Load a segment register by `selector * 16` in real or V86 mode.
    pub fn load_real_segment(&mut self, seg: SegReg, selector: u16) {
        if self.flags.vm() && self.protected_mode() {
            self.seg_mut(seg).load_v86(seg, selector);
        } else {
            self.seg_mut(seg).load_real(seg, selector);
        }
    }

    /// Recompute CPL after CS or mode changes that do not go through a protected CS load.
    pub fn sync_cpl_for_mode(&mut self) {
        if !self.protected_mode() {
            self.cpl = 0;
        } else if self.flags.vm() {
            self.cpl = 3;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_vector() {
        let cpu = CpuState::new(CpuModel::I386);
        let cs = cpu.seg(SegReg::Cs);
        assert_eq!(cs.base().wrapping_add(cpu.eip), 0xf_fff0);
        assert_eq!(cpu.flags.value(), 0x2);
        assert!(!cpu.protected_mode());
        assert_eq!(cpu.regs.get32(Gpr::Edx), 0x0303);
    }

    #[test]
    fn sixteen_bit_stack_keeps_upper_esp() {
        let mut cpu = CpuState::new(CpuModel::I386);
        cpu.regs.set32(Gpr::Esp, 0x1234_0000);
        cpu.set_stack_pointer(0xfffe);
        assert_eq!(cpu.regs.get32(Gpr::Esp), 0x1234_fffe);
        assert_eq!(cpu.stack_pointer(), 0xfffe);
    }

    #[test]
    fn cr0_is_masked_by_model() {
        let mut cpu = CpuState::new(CpuModel::I286);
        cpu.set_cr0(0xffff_ffff);
        assert_eq!(cpu.cr0(), 0xf);

        let mut cpu = CpuState::new(CpuModel::I486);
        cpu.set_cr0(CR0_PE);
        assert_eq!(cpu.cr0(), CR0_PE | CR0_ET);
        assert!(cpu.protected_mode());
    }
}
