mod common;

use common::Harness;
use pcx_cpu_core::{CpuModel, Gpr, StepExit};

const ORIGIN: u16 = 0x7c00;

#[test]
fn near_call_and_ret() {
    // call +1 ; hlt ; ret
    let mut h = Harness::real(CpuModel::I8086, ORIGIN, &[0xe8, 0x01, 0x00, 0xf4, 0xc3]);

    assert_eq!(h.step().exit, StepExit::Executed);
    assert_eq!(h.engine.cpu.eip, ORIGIN as u32 + 4);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Esp), 0x7ffe);
    assert_eq!(h.read_u16(0x7ffe), ORIGIN + 3);

    assert_eq!(h.step().exit, StepExit::Executed);
    assert_eq!(h.engine.cpu.eip, ORIGIN as u32 + 3);
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Esp), 0x8000);

    assert_eq!(h.step().exit, StepExit::Halted);
}

#[test]
fn ret_imm_releases_arguments() {
    // push ax ; push ax ; call +1 ; hlt ; ret 4
    let code = [0x50, 0x50, 0xe8, 0x01, 0x00, 0xf4, 0xc2, 0x04, 0x00];
    let mut h = Harness::real(CpuModel::I8086, ORIGIN, &code);

    while h.step().exit != StepExit::Halted {}
    assert_eq!(h.engine.cpu.regs.get16(Gpr::Esp), 0x8000);
    assert_eq!(h.engine.cpu.eip, ORIGIN as u32 + 6);
}
