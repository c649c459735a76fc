mod common;

use std::rc::Rc;

use common::Harness;
use pcx_cpu_core::mmu::MemoryBus;
use pcx_cpu_core::{CodeCache, CpuModel, Gpr, PhysicalMemory, StepExit};

fn memory_with(code: &[u8], at: u32) -> PhysicalMemory {
    let mut mem = PhysicalMemory::new(common::RAM_SIZE).unwrap();
    mem.load_ram(at, code).unwrap();
    mem
}

#[test]
fn repeated_fetch_reuses_block() {
    // inc ax ; inc ax ; hlt
    let mut mem = memory_with(&[0x40, 0x40, 0xf4], 0x7c00);
    let mut cache = CodeCache::new(CpuModel::I386);

    let first = cache.fetch(&mut mem, 0x7c00, false).unwrap();
    let second = cache.fetch(&mut mem, 0x7c00, false).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(first.insns().len(), 3);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn operand_size_keys_blocks_separately() {
    let mut mem = memory_with(&[0x40, 0xf4], 0x7c00);
    let mut cache = CodeCache::new(CpuModel::I386);

    let real = cache.fetch(&mut mem, 0x7c00, false).unwrap();
    let flat = cache.fetch(&mut mem, 0x7c00, true).unwrap();
    assert!(!Rc::ptr_eq(&real, &flat));
    assert_eq!(cache.len(), 2);
}

#[test]
fn write_into_block_invalidates_it() {
    let mut mem = memory_with(&[0x40, 0x40, 0xf4], 0x7c00);
    let mut cache = CodeCache::new(CpuModel::I386);

    let before = cache.fetch(&mut mem, 0x7c00, false).unwrap();
    // inc ax -> dec ax
    mem.write_u8(0x7c01, 0x48);
    let after = cache.fetch(&mut mem, 0x7c00, false).unwrap();

    assert!(!Rc::ptr_eq(&before, &after));
    assert_eq!(cache.stats().invalidations, 1);
    assert_eq!(after.insns()[1].mnemonic(), iced_x86::Mnemonic::Dec);
}

#[test]
fn write_elsewhere_on_page_keeps_block() {
    let mut mem = memory_with(&[0x40, 0x40, 0xf4], 0x7c00);
    let mut cache = CodeCache::new(CpuModel::I386);

    let before = cache.fetch(&mut mem, 0x7c00, false).unwrap();
    mem.write_u8(0x7e00, 0xcc);
    let after = cache.fetch(&mut mem, 0x7c00, false).unwrap();

    assert!(Rc::ptr_eq(&before, &after));
    assert_eq!(cache.stats().invalidations, 0);
}

#[test]
fn store_into_running_block_takes_effect() {
    // mov byte [0x7c0b], 0x40 ; nop x6 ; dec ax ; hlt
    // The store turns the DEC into an INC before execution reaches it.
    let code = [
        0xc6, 0x06, 0x0b, 0x7c, 0x40, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x48, 0xf4,
    ];
    let mut h = Harness::real(CpuModel::I386, 0x7c00, &code);
    h.engine.cpu.regs.set16(Gpr::Eax, 0x10);

    let mut halted = false;
    for _ in 0..4 {
        if h.step().exit == StepExit::Halted {
            halted = true;
            break;
        }
    }
    assert!(halted);
    assert_eq!(h.mem.ram()[0x7c0b], 0x40);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 0x11);
    assert!(h.engine.cache_stats().invalidations >= 1);
}

#[test]
fn reset_drops_cached_code() {
    let mut h = Harness::real(CpuModel::I386, 0x7c00, &[0x40, 0xf4]);
    h.step();
    assert!(h.engine.cached_blocks() > 0);
    h.engine.reset(&mut h.mem);
    assert_eq!(h.engine.cached_blocks(), 0);
}

#[test]
fn store_below_block_start_in_its_paragraph_aborts() {
    // mov byte [0x7c01], 0x90 ; inc ax ; inc ax ; hlt
    let code = [0xc6, 0x06, 0x01, 0x7c, 0x90, 0x40, 0x40, 0xf4];
    let mut h = Harness::real(CpuModel::I386, 0x7c04, &code);

    let step = h.step();
    assert_eq!(step.exit, StepExit::Executed);
    assert_eq!(h.engine.cpu.eip, 0x7c09);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 0);

    while h.step().exit != StepExit::Halted {}
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 2);
    assert_eq!(h.engine.cache_stats().invalidations, 1);
}
