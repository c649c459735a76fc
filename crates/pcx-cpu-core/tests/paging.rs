mod common;

use common::{Harness, CODE0};
use pcx_cpu_core::descriptor::encode_gate;
use pcx_cpu_core::mmu::{CR0_PG, PF_PRESENT, PF_WRITE};
use pcx_cpu_core::{CpuModel, Fault, Gpr, SegReg, StepExit};

const PAGE_DIR: u32 = 0x1_0000;
const PAGE_TABLE: u32 = 0x1_1000;
const HOLE: u32 = 0x5_0000;
const CODE_AT: u32 = 0x2_0000;

/// Identity-map the first 4 MiB except the page at `HOLE`, then turn paging on.
fn paged(code: &[u8]) -> Harness {
    let mut h = Harness::protected(CpuModel::I486, CODE_AT, code);
    h.load(PAGE_DIR, &(PAGE_TABLE | 0x7).to_le_bytes());
    let table: Vec<u8> = (0..1024u32)
        .map(|i| if i << 12 == HOLE { 0 } else { (i << 12) | 0x7 })
        .flat_map(u32::to_le_bytes)
        .collect();
    h.load(PAGE_TABLE, &table);
    h.set_gate(14, encode_gate(CODE0, 0x3_0000, 0x8e, 0));

    let cpu = &mut h.engine.cpu;
    cpu.mmu.set_cr3(PAGE_DIR);
    cpu.set_cr0(cpu.cr0() | CR0_PG);
    h
}

#[test]
fn read_from_unmapped_page_faults() {
    // mov eax, [0x50000]
    let mut h = paged(&[0xa1, 0x00, 0x00, 0x05, 0x00]);
    h.engine.cpu.regs.set32(Gpr::Eax, 0x1234);

    assert_eq!(
        h.step().exit,
        StepExit::Fault(Fault::PageFault {
            addr: HOLE,
            code: 0
        })
    );
    let cpu = &h.engine.cpu;
    assert_eq!(cpu.mmu.cr2(), HOLE);
    assert_eq!(cpu.regs.get32(Gpr::Eax), 0x1234);
    assert_eq!(cpu.eip, 0x3_0000);
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(h.read_u32(esp + 4), CODE_AT);
}

#[test]
fn write_to_read_only_page_faults_with_protection_code() {
    // mov dword [0x40000], eax
    let mut h = paged(&[0xa3, 0x00, 0x00, 0x04, 0x00]);
    // Clear R/W on the target page and set CR0.WP so supervisor writes are checked.
    h.load(PAGE_TABLE + 0x40 * 4, &(0x4_0000u32 | 0x5).to_le_bytes());
    let cpu = &mut h.engine.cpu;
    cpu.set_cr0(cpu.cr0() | pcx_cpu_core::mmu::CR0_WP);

    assert_eq!(
        h.step().exit,
        StepExit::Fault(Fault::PageFault {
            addr: 0x4_0000,
            code: PF_PRESENT | PF_WRITE
        })
    );
}

#[test]
fn mapped_access_goes_through() {
    // mov eax, [0x60000] ; hlt
    let mut h = paged(&[0xa1, 0x00, 0x00, 0x06, 0x00, 0xf4]);
    h.load(0x6_0000, &0xcafe_f00du32.to_le_bytes());
    assert_eq!(h.step().exit, StepExit::Halted);
    assert_eq!(h.engine.cpu.regs.get32(Gpr::Eax), 0xcafe_f00d);
}

#[test]
fn disabled_a20_wraps_at_one_megabyte() {
    // mov byte [0x10], 0x77 ; hlt  with DS = 0xffff
    let mut h = Harness::real(CpuModel::I386, 0x7c00, &[0xc6, 0x06, 0x10, 0x00, 0x77, 0xf4]);
    h.engine.cpu.load_real_segment(SegReg::Ds, 0xffff);
    assert!(!h.engine.cpu.mmu.a20_enabled());

    assert_eq!(h.step().exit, StepExit::Halted);
    assert_eq!(h.mem.ram()[0], 0x77);
}
