#![allow(dead_code)]

use std::collections::VecDeque;

use pcx_cpu_core::descriptor::{encode_descriptor, Descriptor, Selector};
use pcx_cpu_core::mmu::{MemoryBus, CR0_PE};
use pcx_cpu_core::{
    CpuConfig, CpuModel, Engine, InterruptController, IoBus, PhysicalMemory, SegReg, Step,
};

pub const RAM_SIZE: usize = 1 << 20;

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x4000;

pub const CODE0: u16 = 0x08;
pub const DATA0: u16 = 0x10;
pub const CODE3: u16 = 0x1b;
pub const DATA3: u16 = 0x23;

/// Interrupt controller double: a queue of vectors waiting to be acknowledged.
#[derive(Default)]
pub struct TestPic {
    pub pending: VecDeque<u8>,
    pub acknowledged: Vec<u8>,
}

impl InterruptController for TestPic {
    fn set_interrupt(&mut self, irq: u8) {
        self.pending.push_back(0x08 + irq);
    }

    fn clear_interrupt(&mut self, irq: u8) {
        self.pending.retain(|&v| v != 0x08 + irq);
    }

    fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn get_interrupt(&mut self) -> u8 {
        let vector = self.pending.pop_front().unwrap_or(0x0f);
        self.acknowledged.push(vector);
        vector
    }
}

pub struct Harness {
    pub engine: Engine,
    pub mem: PhysicalMemory,
    pub io: IoBus,
    pub pic: TestPic,
}

impl Harness {
    pub fn new(model: CpuModel) -> Self {
        Self {
            engine: Engine::new(CpuConfig {
                model,
                ..CpuConfig::default()
            }),
            mem: PhysicalMemory::new(RAM_SIZE).unwrap(),
            io: IoBus::new(),
            pic: TestPic::default(),
        }
    }

    /// Real mode, code at `0000:ip`, stack at `0000:8000`.
    pub fn real(model: CpuModel, ip: u16, code: &[u8]) -> Self {
        let mut h = Self::new(model);
        h.load(ip as u32, code);
        let cpu = &mut h.engine.cpu;
        cpu.load_real_segment(SegReg::Cs, 0);
        cpu.load_real_segment(SegReg::Ss, 0);
        cpu.load_real_segment(SegReg::Ds, 0);
        cpu.regs.set32(pcx_cpu_core::Gpr::Esp, 0x8000);
        cpu.eip = ip as u32;
        h
    }

    /// Flat 32-bit protected mode at CPL 0 with the standard GDT; code at `eip`.
    pub fn protected(model: CpuModel, eip: u32, code: &[u8]) -> Self {
        let mut h = Self::new(model);
        h.write_gdt();
        h.load(eip, code);
        let cpu = &mut h.engine.cpu;
        cpu.set_cr0(cpu.cr0() | CR0_PE);
        cpu.gdtr.base = GDT_BASE;
        cpu.gdtr.limit = 8 * 8 - 1;
        cpu.idtr.base = IDT_BASE;
        cpu.idtr.limit = 0;
        h.enter_cpl(0, CODE0, DATA0);
        h.engine.cpu.regs.set32(pcx_cpu_core::Gpr::Esp, 0x9_0000);
        h.engine.cpu.eip = eip;
        h
    }

    /// GDT: null, code0, data0, code3, data3 (all flat, 32-bit).
    pub fn write_gdt(&mut self) {
        self.set_descriptor(1, encode_descriptor(0, 0xffff_ffff, 0x9a, 0x4));
        self.set_descriptor(2, encode_descriptor(0, 0xffff_ffff, 0x92, 0x4));
        self.set_descriptor(3, encode_descriptor(0, 0xffff_ffff, 0xfa, 0x4));
        self.set_descriptor(4, encode_descriptor(0, 0xffff_ffff, 0xf2, 0x4));
    }

    pub fn set_descriptor(&mut self, index: u32, raw: u64) {
        self.load(GDT_BASE + index * 8, &raw.to_le_bytes());
    }

    pub fn descriptor(&self, index: u32) -> Descriptor {
        let mut raw = [0u8; 8];
        let start = (GDT_BASE + index * 8) as usize;
        raw.copy_from_slice(&self.mem.ram()[start..start + 8]);
        Descriptor::parse(u64::from_le_bytes(raw))
    }

    pub fn set_gate(&mut self, vector: u8, raw: u64) {
        self.load(IDT_BASE + vector as u32 * 8, &raw.to_le_bytes());
        let limit = (vector as u16 + 1) * 8 - 1;
        if limit > self.engine.cpu.idtr.limit {
            self.engine.cpu.idtr.limit = limit;
        }
    }

    /// Load CS and the data segments straight from the GDT and make `cpl` current.
    pub fn enter_cpl(&mut self, cpl: u8, code: u16, data: u16) {
        let code_desc = self.descriptor(code as u32 >> 3);
        let data_desc = self.descriptor(data as u32 >> 3);
        let cpu = &mut self.engine.cpu;
        cpu.cpl = cpl;
        cpu.seg_mut(SegReg::Cs).load_code(Selector(code), &code_desc);
        cpu.seg_mut(SegReg::Ss).load_stack(Selector(data), &data_desc);
        for seg in [SegReg::Ds, SegReg::Es] {
            cpu.seg_mut(seg).load_protected(Selector(data), &data_desc, cpl);
        }
    }

    pub fn load(&mut self, paddr: u32, bytes: &[u8]) {
        self.mem.load_ram(paddr, bytes).unwrap();
    }

    pub fn read_u16(&mut self, paddr: u32) -> u16 {
        self.mem.read_u16(paddr)
    }

    pub fn read_u32(&mut self, paddr: u32) -> u32 {
        self.mem.read_u32(paddr)
    }

    pub fn step(&mut self) -> Step {
        self.engine.step(&mut self.mem, &mut self.io, &mut self.pic)
    }
}
