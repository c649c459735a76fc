mod common;

use common::{Harness, CODE0, DATA0};
use pcx_cpu_core::descriptor::{
    encode_descriptor, encode_gate, DescriptorKind, Selector, SystemKind,
};
use pcx_cpu_core::mmu::{CR0_PG, CR0_TS};
use pcx_cpu_core::task::{TaskRegister, TssKind};
use pcx_cpu_core::{CpuModel, Fault, Flags, Gpr, SegReg, StepExit};

const CODE_AT: u32 = 0x2_0000;
const TASK_ENTRY: u32 = 0x2_1000;

const CURRENT_TSS: u32 = 0x6000;
const CURRENT_SEL: u16 = 0x28;
const NEXT_TSS: u32 = 0x7000;
const NEXT_SEL: u16 = 0x18;

fn tss_busy(h: &Harness, index: u32) -> bool {
    match h.descriptor(index).kind {
        DescriptorKind::System(SystemKind::Tss32 { busy }) => busy,
        other => panic!("descriptor {index} is not a 32-bit TSS: {other:?}"),
    }
}

/// Running task in the TSS at GDT index 5; an idle task at index 3 with the minimum limit.
fn two_tasks(code: &[u8], entry_code: &[u8]) -> Harness {
    let mut h = Harness::protected(CpuModel::I386, CODE_AT, code);
    h.load(TASK_ENTRY, entry_code);

    h.set_descriptor(5, encode_descriptor(CURRENT_TSS, 103, 0x8b, 0));
    h.engine.cpu.tr = TaskRegister {
        selector: Selector(CURRENT_SEL),
        base: CURRENT_TSS,
        limit: 103,
        kind: TssKind::Tss32,
        busy: true,
        valid: true,
    };

    h.set_descriptor(3, encode_descriptor(NEXT_TSS, 103, 0x89, 0));
    let mut tss = [0u8; 104];
    let mut put = |offset: usize, value: u32| {
        tss[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    };
    put(0x1c, 0x9000);
    put(0x20, TASK_ENTRY);
    put(0x24, 0x0202);
    put(0x28, 0x1111_1111);
    put(0x34, 0x2222_2222);
    put(0x38, 0x8_8000);
    for offset in [0x48, 0x50, 0x54] {
        put(offset, DATA0 as u32);
    }
    put(0x4c, CODE0 as u32);
    h.load(NEXT_TSS, &tss);
    h
}

#[test]
fn jmp_to_tss_switches_tasks() {
    // jmp far 0x18:0
    let mut h = two_tasks(&[0xea, 0, 0, 0, 0, 0x18, 0], &[0xf4]);
    h.engine.cpu.regs.set32(Gpr::Eax, 0xdead_beef);
    h.engine.cpu.flags.set(Flags::NT, true);

    assert_eq!(h.step().exit, StepExit::Executed);

    let cpu = &h.engine.cpu;
    assert_eq!(cpu.tr.selector.0, NEXT_SEL);
    assert_eq!(cpu.eip, TASK_ENTRY);
    assert_eq!(cpu.regs.get32(Gpr::Eax), 0x1111_1111);
    assert_eq!(cpu.regs.get32(Gpr::Ebx), 0x2222_2222);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x8_8000);
    assert_eq!(cpu.mmu.cr3(), 0x9000);
    assert!(cpu.flags.interrupts_enabled());
    assert!(!cpu.flags.nt());
    assert_ne!(cpu.cr0() & CR0_TS, 0);
    assert_eq!(cpu.seg(SegReg::Cs).selector.0, CODE0);
    assert_eq!(cpu.seg(SegReg::Ds).selector.0, DATA0);

    assert!(tss_busy(&h, 3));
    assert!(!tss_busy(&h, 5));
    // The outgoing task resumes after the JMP; no back-link for a JMP.
    assert_eq!(h.read_u32(CURRENT_TSS + 0x20), CODE_AT + 7);
    assert_eq!(h.read_u32(CURRENT_TSS + 0x28), 0xdead_beef);
    assert_eq!(h.read_u16(NEXT_TSS), 0);

    assert_eq!(h.step().exit, StepExit::Halted);
}

#[test]
fn call_nests_and_iret_returns() {
    // call far 0x18:0 ; hlt
    let mut h = two_tasks(&[0x9a, 0, 0, 0, 0, 0x18, 0, 0xf4], &[0xcf]);
    h.engine.cpu.regs.set32(Gpr::Eax, 0x5555);

    h.step();
    assert_eq!(h.engine.cpu.tr.selector.0, NEXT_SEL);
    assert!(h.engine.cpu.flags.nt());
    assert_eq!(h.read_u16(NEXT_TSS), CURRENT_SEL);
    assert!(tss_busy(&h, 3));
    assert!(tss_busy(&h, 5));

    // iret inside the nested task
    h.step();
    let cpu = &h.engine.cpu;
    assert_eq!(cpu.tr.selector.0, CURRENT_SEL);
    assert_eq!(cpu.eip, CODE_AT + 7);
    assert_eq!(cpu.regs.get32(Gpr::Eax), 0x5555);
    assert!(!cpu.flags.nt());
    assert!(!tss_busy(&h, 3));
    assert!(tss_busy(&h, 5));

    assert_eq!(h.step().exit, StepExit::Halted);
}

#[test]
fn busy_task_cannot_be_entered_by_jmp() {
    let mut h = two_tasks(&[0xea, 0, 0, 0, 0, 0x28, 0], &[0xf4]);
    let exit = h.step().exit;
    // #GP has no gate in this IDT, so delivery collapses.
    assert_eq!(exit, StepExit::TripleFault);
    assert_eq!(h.engine.cpu.tr.selector.0, CURRENT_SEL);
}

#[test]
fn short_tss_is_rejected() {
    let mut h = two_tasks(&[0xea, 0, 0, 0, 0, 0x18, 0], &[0xf4]);
    h.set_descriptor(3, encode_descriptor(NEXT_TSS, 102, 0x89, 0));
    h.set_gate(10, encode_gate(CODE0, 0x3_0000, 0x8e, 0));
    assert_eq!(
        h.step().exit,
        StepExit::Fault(Fault::InvalidTss(NEXT_SEL))
    );
    assert_eq!(h.engine.cpu.eip, 0x3_0000);
    assert!(!tss_busy(&h, 3));
}

#[test]
fn failed_save_leaves_outgoing_task_busy() {
    // jmp far 0x18:0
    let mut h = two_tasks(&[0xea, 0, 0, 0, 0, 0x18, 0], &[0xf4]);
    // Identity-map the first 4 MiB with the outgoing TSS page left out.
    let (dir, table) = (0x1_0000u32, 0x1_1000u32);
    h.load(dir, &(table | 0x3).to_le_bytes());
    let entries: Vec<u8> = (0..1024u32)
        .map(|i| if i << 12 == CURRENT_TSS { 0 } else { (i << 12) | 0x3 })
        .flat_map(u32::to_le_bytes)
        .collect();
    h.load(table, &entries);
    h.set_gate(14, encode_gate(CODE0, 0x3_0000, 0x8e, 0));
    let cpu = &mut h.engine.cpu;
    cpu.mmu.set_cr3(dir);
    cpu.set_cr0(cpu.cr0() | CR0_PG);

    let exit = h.step().exit;
    assert!(
        matches!(exit, StepExit::Fault(Fault::PageFault { addr, .. }) if addr >> 12 == CURRENT_TSS >> 12),
        "{exit:?}"
    );
    assert_eq!(h.engine.cpu.tr.selector.0, CURRENT_SEL);
    assert!(tss_busy(&h, 5));
    assert!(!tss_busy(&h, 3));
}
