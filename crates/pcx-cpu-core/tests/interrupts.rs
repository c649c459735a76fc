mod common;

use common::{Harness, CODE0, CODE3, DATA3};
use pcx_cpu_core::descriptor::encode_gate;
use pcx_cpu_core::{CpuModel, Fault, Flags, Gpr, SegReg, StepExit};

const ORIGIN: u16 = 0x7c00;

fn set_vector(h: &mut Harness, vector: u8, segment: u16, offset: u16) {
    let mut entry = [0u8; 4];
    entry[..2].copy_from_slice(&offset.to_le_bytes());
    entry[2..].copy_from_slice(&segment.to_le_bytes());
    h.load(vector as u32 * 4, &entry);
}

#[test]
fn real_mode_software_interrupt() {
    // int 0x21
    let mut h = Harness::real(CpuModel::I8086, ORIGIN, &[0xcd, 0x21]);
    set_vector(&mut h, 0x21, 0x0100, 0x1234);
    h.engine.cpu.flags.set(Flags::IF, true);
    let flags = h.engine.cpu.flags.value();

    assert_eq!(h.step().exit, StepExit::Executed);
    let cpu = &h.engine.cpu;
    assert_eq!(cpu.seg(SegReg::Cs).selector.0, 0x0100);
    assert_eq!(cpu.seg(SegReg::Cs).base(), 0x1000);
    assert_eq!(cpu.eip, 0x1234);
    assert!(!cpu.flags.interrupts_enabled());
    assert_eq!(cpu.regs.get16(Gpr::Esp), 0x7ffa);
    assert_eq!(h.read_u16(0x7ffa), ORIGIN + 2);
    assert_eq!(h.read_u16(0x7ffc), 0);
    assert_eq!(h.read_u16(0x7ffe) as u32, flags);
}

#[test]
fn external_interrupt_wakes_halted_cpu() {
    // sti ; hlt
    let mut h = Harness::real(CpuModel::I386, ORIGIN, &[0xfb, 0xf4]);
    set_vector(&mut h, 0x08, 0, 0x9000);
    h.load(0x9000, &[0xf4]);

    h.step();
    assert_eq!(h.step().exit, StepExit::Halted);
    let idle = h.step();
    assert_eq!(idle.exit, StepExit::Halted);
    assert_eq!(idle.cycles, h.engine.config().costs.idle);

    h.pic.pending.push_back(0x08);
    let step = h.step();
    assert_eq!(step.exit, StepExit::Interrupted(0x08));
    assert_eq!(step.cycles, h.engine.config().costs.interrupt_ack);
    assert!(!h.engine.cpu.halted);
    assert_eq!(h.engine.cpu.eip, 0x9000);
    assert_eq!(h.pic.acknowledged, vec![0x08]);
    // The frame returns past the HLT.
    assert_eq!(h.read_u16(0x7ffa), ORIGIN + 2);
}

#[test]
fn masked_interrupts_wait() {
    // inc ax ; hlt
    let mut h = Harness::real(CpuModel::I386, ORIGIN, &[0x40, 0xf4]);
    h.pic.pending.push_back(0x08);
    assert_eq!(h.step().exit, StepExit::Halted);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 1);
    assert!(h.pic.acknowledged.is_empty());
}

#[test]
fn sti_holds_interrupts_for_one_instruction() {
    // sti ; inc ax ; inc ax ; hlt
    let mut h = Harness::real(CpuModel::I386, ORIGIN, &[0xfb, 0x40, 0x40, 0xf4]);
    set_vector(&mut h, 0x08, 0, 0x9000);
    h.load(0x9000, &[0xf4]);
    h.pic.pending.push_back(0x08);

    assert_eq!(h.step().exit, StepExit::Executed);
    assert_eq!(h.step().exit, StepExit::Executed);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 1);
    assert_eq!(h.step().exit, StepExit::Interrupted(0x08));
    assert_eq!(h.read_u16(0x7ffa), ORIGIN + 2);
}

#[test]
fn ss_load_mid_block_shadows_only_the_next_instruction() {
    // mov ss, ax ; inc ax ; inc ax ; hlt
    let mut h = Harness::real(CpuModel::I386, ORIGIN, &[0x8e, 0xd0, 0x40, 0x40, 0xf4]);
    set_vector(&mut h, 0x08, 0, 0x9000);
    h.load(0x9000, &[0xf4]);
    h.engine.cpu.flags.set(Flags::IF, true);

    assert_eq!(h.step().exit, StepExit::Executed);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 1);
    assert!(!h.engine.cpu.interrupt_shadow);

    h.pic.pending.push_back(0x08);
    assert_eq!(h.step().exit, StepExit::Interrupted(0x08));
    assert_eq!(h.read_u16(0x7ffa), ORIGIN + 3);
}

#[test]
fn single_step_traps_after_each_instruction() {
    // inc ax ; inc ax ; hlt
    let mut h = Harness::real(CpuModel::I386, ORIGIN, &[0x40, 0x40, 0xf4]);
    set_vector(&mut h, 0x01, 0, 0x9000);
    h.engine.cpu.flags.set(Flags::TF, true);

    assert_eq!(h.step().exit, StepExit::Fault(Fault::Debug));
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Eax), 1);
    assert_eq!(h.engine.cpu.eip, 0x9000);
    assert!(!h.engine.cpu.flags.tf());
    assert_eq!(h.read_u16(0x7ffa), ORIGIN + 1);
    assert_ne!(h.engine.cpu.debug_regs[6] & (1 << 14), 0);
}

#[test]
fn user_int_through_kernel_only_gate() {
    // int 0x30
    let mut h = Harness::protected(CpuModel::I386, 0x2_0000, &[0xcd, 0x30]);
    h.set_gate(0x30, encode_gate(CODE0, 0x3_1000, 0x8e, 0));
    h.set_gate(13, encode_gate(CODE0, 0x3_0000, 0x8e, 0));
    h.enter_cpl(3, CODE3, DATA3);
    // Ring-0 stack for the #GP frame.
    h.set_descriptor(5, pcx_cpu_core::descriptor::encode_descriptor(0x6000, 103, 0x8b, 0));
    h.load(0x6004, &0x8_0000u32.to_le_bytes());
    h.load(0x6008, &0x10u32.to_le_bytes());
    h.engine.cpu.tr = pcx_cpu_core::task::TaskRegister {
        selector: pcx_cpu_core::descriptor::Selector(0x28),
        base: 0x6000,
        limit: 103,
        kind: pcx_cpu_core::task::TssKind::Tss32,
        busy: true,
        valid: true,
    };

    assert_eq!(
        h.step().exit,
        StepExit::Fault(Fault::GeneralProtection(0x30 << 3 | 2))
    );
    assert_eq!(h.engine.cpu.eip, 0x3_0000);
    assert_eq!(h.engine.cpu.cpl, 0);
}

#[test]
fn protected_mode_iret_returns_to_user() {
    // int 0x40 ; hlt   (the handler is a bare iret)
    let mut h = Harness::protected(CpuModel::I386, 0x2_0000, &[0xcd, 0x40, 0xf4]);
    h.load(0x3_1000, &[0xcf]);
    h.set_gate(0x40, encode_gate(CODE0, 0x3_1000, 0xee, 0));
    h.enter_cpl(3, CODE3, DATA3);
    h.engine.cpu.regs.set32(Gpr::Esp, 0x7_0000);
    h.set_descriptor(5, pcx_cpu_core::descriptor::encode_descriptor(0x6000, 103, 0x8b, 0));
    h.load(0x6004, &0x8_0000u32.to_le_bytes());
    h.load(0x6008, &0x10u32.to_le_bytes());
    h.engine.cpu.tr = pcx_cpu_core::task::TaskRegister {
        selector: pcx_cpu_core::descriptor::Selector(0x28),
        base: 0x6000,
        limit: 103,
        kind: pcx_cpu_core::task::TssKind::Tss32,
        busy: true,
        valid: true,
    };

    h.step();
    assert_eq!(h.engine.cpu.cpl, 0);
    assert_eq!(h.engine.cpu.eip, 0x3_1000);

    h.step();
    let cpu = &h.engine.cpu;
    assert_eq!(cpu.cpl, 3);
    assert_eq!(cpu.eip, 0x2_0002);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x7_0000);
    assert_eq!(cpu.seg(SegReg::Ss).selector.0, DATA3);
    assert_eq!(cpu.seg(SegReg::Cs).selector.0, CODE3);
}
