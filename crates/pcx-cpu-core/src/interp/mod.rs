//! Instruction handlers and the mnemonic dispatch table.
//!
//! Handlers run with `cpu.eip` already advanced past the instruction and must leave registers,
//! flags and memory untouched when they return a fault (repeated string instructions excepted:
//! completed iterations stay committed, as on hardware).

mod alu;
mod control;
mod data;
mod string;
mod system;

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Handler, Insn};
use crate::fault::Fault;
use crate::flags::{CpuModel, FlagRegister};
use crate::registers::{gpr_size, OpSize};
use crate::segment::SegReg;

pub(crate) type ExecResult = Result<ExecOutcome, Fault>;

/// Handler for undecodable or unsupported opcodes.
pub(crate) fn undefined(_ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    Err(Fault::InvalidOpcode)
}

/// The first processor generation implementing `mnemonic`.
fn introduced_in(mnemonic: Mnemonic) -> CpuModel {
    use Mnemonic::*;
    match mnemonic {
        Pusha | Pushad | Popa | Popad | Bound | Enter | Leave | Insb | Insw | Insd | Outsb
        | Outsw | Outsd => CpuModel::I186,
        Lgdt | Lidt | Sgdt | Sidt | Lldt | Sldt | Ltr | Str | Lmsw | Smsw | Clts | Arpl | Lar
        | Lsl | Verr | Verw => CpuModel::I286,
        Movzx | Movsx | Bt | Bts | Btr | Btc | Bsf | Bsr | Shld | Shrd | Lfs | Lgs | Lss
        | Cwde | Cdq | Seto | Setno | Setb | Setae | Sete | Setne | Setbe | Seta | Sets
        | Setns | Setp | Setnp | Setl | Setge | Setle | Setg | Jecxz => CpuModel::I386,
        Bswap | Cmpxchg | Xadd | Invlpg | Invd | Wbinvd => CpuModel::I486,
        Cpuid | Rdtsc | Cmpxchg8b | Rdmsr | Wrmsr => CpuModel::Pentium,
        _ => CpuModel::I8086,
    }
}

/// Bind a decoded instruction to its handler.
pub(crate) fn handler_for(
    instr: &Instruction,
    x87: bool,
    size_prefix: bool,
    model: CpuModel,
) -> Handler {
    use Mnemonic::*;

    if x87 {
        return system::fpu_escape;
    }
    let mnemonic = instr.mnemonic();
    let required = match mnemonic {
        // IMUL r, r/m, imm came with the 186; IMUL r, r/m (0F AF) with the 386.
        Imul if instr.op_count() == 3 => CpuModel::I186,
        Imul if instr.op_count() == 2 => CpuModel::I386,
        other => introduced_in(other),
    };
    if required > model || (size_prefix && !model.has_32bit()) {
        return undefined;
    }
    // Two-byte opcodes, FS and GS do not exist before the 386; 0F is POP CS on the 8086 and
    // plain invalid on the 186/286 for anything but the 286 system group.
    if !model.has_32bit() && uses_386_registers(instr) {
        return undefined;
    }

    match mnemonic {
        Add => alu::add,
        Adc => alu::adc,
        Sub => alu::sub,
        Sbb => alu::sbb,
        Cmp => alu::cmp,
        And => alu::and,
        Or => alu::or,
        Xor => alu::xor,
        Test => alu::test,
        Inc => alu::inc,
        Dec => alu::dec,
        Neg => alu::neg,
        Not => alu::not,
        Mul => alu::mul,
        Imul => alu::imul,
        Div => alu::div,
        Idiv => alu::idiv,
        Rol | Ror | Rcl | Rcr | Shl | Sal | Shr | Sar => alu::shift,
        Shld | Shrd => alu::double_shift,
        Bt | Bts | Btr | Btc => alu::bit_test,
        Bsf | Bsr => alu::bit_scan,
        Daa => alu::daa,
        Das => alu::das,
        Aaa => alu::aaa,
        Aas => alu::aas,
        Aam => alu::aam,
        Aad => alu::aad,
        Cbw | Cwde => alu::widen_accumulator,
        Cwd | Cdq => alu::sign_extend_into_dx,

        Mov => data::mov,
        Movzx | Movsx => data::mov_extend,
        Lea => data::lea,
        Xchg => data::xchg,
        Xlatb => data::xlat,
        Push => data::push,
        Pop => data::pop,
        Pusha | Pushad => data::pusha,
        Popa | Popad => data::popa,
        Pushf | Pushfd => data::pushf,
        Popf | Popfd => data::popf,
        Lahf => data::lahf,
        Sahf => data::sahf,
        Lds | Les | Lfs | Lgs | Lss => data::load_far_pointer,
        Bswap => data::bswap,
        Cmpxchg => data::cmpxchg,
        Cmpxchg8b => data::cmpxchg8b,
        Xadd => data::xadd,
        Seto | Setno | Setb | Setae | Sete | Setne | Setbe | Seta | Sets | Setns | Setp
        | Setnp | Setl | Setge | Setle | Setg => data::setcc,
        Salc => data::salc,

        Jo | Jno | Jb | Jae | Je | Jne | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jge | Jle | Jg => {
            control::jcc
        }
        Jmp => control::jmp,
        Call => control::call,
        Ret => control::ret_near,
        Retf => control::ret_far,
        Loop | Loope | Loopne => control::loop_,
        Jcxz | Jecxz => control::jcxz,
        Int => control::int,
        Int3 => control::int3,
        Int1 => control::int1,
        Into => control::into,
        Iret | Iretd => control::iret,
        Bound => control::bound,
        Enter => control::enter,
        Leave => control::leave,
        Hlt => control::hlt,

        Movsb | Movsw | Movsd => string::movs,
        Cmpsb | Cmpsw | Cmpsd => string::cmps,
        Stosb | Stosw | Stosd => string::stos,
        Lodsb | Lodsw | Lodsd => string::lods,
        Scasb | Scasw | Scasd => string::scas,
        Insb | Insw | Insd => string::ins,
        Outsb | Outsw | Outsd => string::outs,

        In => system::in_,
        Out => system::out,
        Cli => system::cli,
        Sti => system::sti,
        Clc | Stc | Cmc | Cld | Std => system::flag_op,
        Nop => system::nop,
        Wait => system::wait,
        Lgdt | Lidt => system::load_table,
        Sgdt | Sidt => system::store_table,
        Lldt => system::lldt,
        Sldt => system::sldt,
        Ltr => system::ltr,
        Str => system::store_task_register,
        Lmsw => system::lmsw,
        Smsw => system::smsw,
        Clts => system::clts,
        Invlpg => system::invlpg,
        Invd | Wbinvd => system::cache_flush,
        Arpl => system::arpl,
        Lar => system::lar,
        Lsl => system::lsl,
        Verr | Verw => system::verify,
        Cpuid => system::cpuid,
        Rdtsc => system::rdtsc,
        Rdmsr | Wrmsr => system::msr,
        _ => undefined,
    }
}

fn uses_386_registers(instr: &Instruction) -> bool {
    let is_386_reg = |reg: Register| {
        matches!(reg, Register::FS | Register::GS)
            || gpr_size(reg) == Some(OpSize::Dword)
            || reg.is_cr()
            || reg.is_dr()
    };
    if instr.segment_prefix() != Register::None && is_386_reg(instr.segment_prefix()) {
        return true;
    }
    (0..instr.op_count()).any(|n| {
        instr.op_kind(n) == OpKind::Register && is_386_reg(instr.op_register(n))
    })
}

// --- operand access ---

/// Effective address of the memory operand, truncated to the address size.
pub(crate) fn effective_address(ctx: &ExecCtx, insn: &Insn) -> u32 {
    let instr = &insn.instr;
    let reg = |reg: Register| ctx.cpu.regs.read(reg).unwrap_or(0);
    let base = reg(instr.memory_base());
    let index = reg(instr.memory_index()).wrapping_mul(instr.memory_index_scale());
    let ea = base
        .wrapping_add(index)
        .wrapping_add(instr.memory_displacement32());
    if insn.addr32 {
        ea
    } else {
        ea & 0xffff
    }
}

/// Segment of the memory operand, after any override prefix.
pub(crate) fn memory_segment(insn: &Insn) -> SegReg {
    SegReg::from_iced(insn.instr.memory_segment()).unwrap_or(SegReg::Ds)
}

/// Width of operand `n`.
pub(crate) fn operand_size(insn: &Insn, n: u32) -> OpSize {
    let instr = &insn.instr;
    match instr.op_kind(n) {
        OpKind::Register => gpr_size(instr.op_register(n)).unwrap_or(OpSize::Word),
        OpKind::Memory => OpSize::from_bytes(instr.memory_size().size())
            .unwrap_or(OpSize::word_or_dword(insn.op32)),
        OpKind::Immediate8 | OpKind::Immediate8_2nd => OpSize::Byte,
        OpKind::Immediate16 | OpKind::Immediate8to16 => OpSize::Word,
        _ => OpSize::word_or_dword(insn.op32),
    }
}

pub(crate) fn read_operand(ctx: &mut ExecCtx, insn: &Insn, n: u32, size: OpSize) -> Result<u32, Fault> {
    let instr = &insn.instr;
    match instr.op_kind(n) {
        OpKind::Register => {
            let reg = instr.op_register(n);
            if let Some(value) = ctx.cpu.regs.read(reg) {
                return Ok(value);
            }
            match SegReg::from_iced(reg) {
                Some(seg) => Ok(ctx.cpu.seg(seg).selector.0 as u32),
                None => Err(Fault::InvalidOpcode),
            }
        }
        OpKind::Memory => {
            let offset = effective_address(ctx, insn);
            ctx.read(memory_segment(insn), offset, size)
        }
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32 => Ok(instr.immediate(n) as u32 & size.mask()),
        _ => Err(Fault::InvalidOpcode),
    }
}

/// Write a GPR or memory operand.
pub(crate) fn write_operand(
    ctx: &mut ExecCtx,
    insn: &Insn,
    n: u32,
    size: OpSize,
    value: u32,
) -> Result<(), Fault> {
    let instr = &insn.instr;
    match instr.op_kind(n) {
        OpKind::Register => {
            if ctx.cpu.regs.write(instr.op_register(n), value) {
                Ok(())
            } else {
                Err(Fault::InvalidOpcode)
            }
        }
        OpKind::Memory => {
            let offset = effective_address(ctx, insn);
            ctx.write(memory_segment(insn), offset, size, value)
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

/// Evaluate the condition of a Jcc or SETcc mnemonic.
pub(crate) fn condition_met(flags: &FlagRegister, mnemonic: Mnemonic) -> bool {
    use Mnemonic::*;
    match mnemonic {
        Jo | Seto => flags.of(),
        Jno | Setno => !flags.of(),
        Jb | Setb => flags.cf(),
        Jae | Setae => !flags.cf(),
        Je | Sete => flags.zf(),
        Jne | Setne => !flags.zf(),
        Jbe | Setbe => flags.cf() || flags.zf(),
        Ja | Seta => !flags.cf() && !flags.zf(),
        Js | Sets => flags.sf(),
        Jns | Setns => !flags.sf(),
        Jp | Setp => flags.pf(),
        Jnp | Setnp => !flags.pf(),
        Jl | Setl => flags.sf() != flags.of(),
        Jge | Setge => flags.sf() == flags.of(),
        Jle | Setle => flags.zf() || flags.sf() != flags.of(),
        Jg | Setg => !flags.zf() && flags.sf() == flags.of(),
        _ => false,
    }
}

/// Mask applied to EIP after a near transfer.
#[inline]
pub(crate) fn ip_mask(op32: bool) -> u32 {
    if op32 {
        0xffff_ffff
    } else {
        0xffff
    }
}

/// Target of a relative branch, relative to the already-advanced EIP.
pub(crate) fn relative_target(ctx: &ExecCtx, insn: &Insn) -> u32 {
    let instr = &insn.instr;
    let displacement = instr.near_branch_target().wrapping_sub(instr.next_ip()) as u32;
    ctx.cpu.eip.wrapping_add(displacement) & ip_mask(insn.op32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode16(bytes: &[u8]) -> Instruction {
        Decoder::with_ip(16, bytes, 0, DecoderOptions::NONE).decode()
    }

    #[test]
    fn model_gating() {
        // movzx ax, bl
        let movzx = decode16(&[0x0f, 0xb6, 0xc3]);
        assert_eq!(
            handler_for(&movzx, false, false, CpuModel::I286) as usize,
            undefined as usize
        );
        assert_ne!(
            handler_for(&movzx, false, false, CpuModel::I386) as usize,
            undefined as usize
        );
        // mov eax, ebx needs a 386
        let mov32 = decode16(&[0x66, 0x89, 0xd8]);
        assert_eq!(
            handler_for(&mov32, false, true, CpuModel::I286) as usize,
            undefined as usize
        );
    }
}
