//! x86 decoding on top of `iced-x86`, binding each instruction to its handler.

use std::fmt;

use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register,
};
use thiserror::Error;

use crate::ctx::ExecCtx;
use crate::fault::Fault;
use crate::flags::CpuModel;
use crate::interp;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Upper bound on instructions per cached block.
pub const MAX_BLOCK_INSNS: usize = 32;

/// What a handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Fall through to the next instruction of the block.
    Continue,
    /// Control was transferred; `cpu.eip` holds the target.
    Branch,
    /// HLT: stop until an interrupt arrives.
    Halt,
    /// A repeated string instruction used up its iteration budget; it resumes next step.
    RepInterrupted,
    /// Processor mode or translation state changed; refetch before continuing.
    EndBlock,
}

/// Instruction handler.
pub type Handler = fn(&mut ExecCtx, &Insn) -> Result<ExecOutcome, Fault>;

/// A decoded instruction bound to its handler.
#[derive(Clone)]
pub struct Insn {
    pub instr: Instruction,
    pub handler: Handler,
    /// 32-bit operand size after prefixes.
    pub op32: bool,
    /// 32-bit address size after prefixes.
    pub addr32: bool,
    pub len: u32,
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Insn")
            .field("instr", &self.instr)
            .field("op32", &self.op32)
            .field("addr32", &self.addr32)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Insn {
    #[inline]
    pub fn mnemonic(&self) -> Mnemonic {
        self.instr.mnemonic()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    /// The first instruction continues past the end of the fetched bytes (page end).
    #[error("instruction at {0:#010x} crosses a page boundary")]
    CrossesPage(u32),
}

/// Operand/address-size overrides and whether the opcode is an x87 escape.
fn scan_prefixes(bytes: &[u8]) -> (bool, bool, bool) {
    let mut opsize = false;
    let mut addrsize = false;
    for &byte in bytes {
        match byte {
            0x66 => opsize = true,
            0x67 => addrsize = true,
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0xf0 | 0xf2 | 0xf3 => {}
            opcode => return (opsize, addrsize, (0xd8..=0xdf).contains(&opcode)),
        }
    }
    (opsize, addrsize, false)
}

/// Whether execution must leave the block after this instruction.
fn ends_block(instr: &Instruction) -> bool {
    if instr.flow_control() != FlowControl::Next {
        return true;
    }
    match instr.mnemonic() {
        Mnemonic::Hlt
        | Mnemonic::Cli
        | Mnemonic::Sti
        | Mnemonic::Popf
        | Mnemonic::Popfd
        | Mnemonic::Lmsw
        | Mnemonic::Ltr
        | Mnemonic::Lldt
        | Mnemonic::Lgdt
        | Mnemonic::Lidt
        | Mnemonic::Clts
        | Mnemonic::Invlpg
        | Mnemonic::Invd
        | Mnemonic::Wbinvd
        | Mnemonic::Lss => true,
        Mnemonic::Mov => {
            instr.op0_kind() == OpKind::Register
                && (instr.op0_register() == Register::SS || instr.op0_register().is_cr())
        }
        Mnemonic::Pop => instr.op0_kind() == OpKind::Register && instr.op0_register() == Register::SS,
        _ => false,
    }
}

fn bind(instr: Instruction, bytes: &[u8], code32: bool, model: CpuModel) -> Insn {
    let len = instr.len();
    let (opsize, addrsize, x87) = scan_prefixes(&bytes[..len.min(bytes.len())]);
    let handler = if instr.is_invalid() {
        interp::undefined
    } else {
        interp::handler_for(&instr, x87, opsize || addrsize, model)
    };
    Insn {
        instr,
        handler,
        op32: code32 ^ opsize,
        addr32: code32 ^ addrsize,
        len: len as u32,
    }
}

/// Decode a run of instructions from `bytes`, which start at physical address `paddr`.
///
/// Stops after a control transfer or mode-changing instruction, after
/// [`MAX_BLOCK_INSNS`], or before an instruction truncated by the end of `bytes`.
pub fn decode_run(
    bytes: &[u8],
    paddr: u32,
    code32: bool,
    model: CpuModel,
) -> Result<Vec<Insn>, DecodeFailure> {
    let bitness = if code32 { 32 } else { 16 };
    let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
    let mut insns = Vec::new();

    while decoder.can_decode() && insns.len() < MAX_BLOCK_INSNS {
        let pos = decoder.position();
        let instr = decoder.decode();
        if instr.is_invalid() && decoder.last_error() == DecoderError::NoMoreBytes {
            break;
        }
        let insn = bind(instr, &bytes[pos..], code32, model);
        let stop = ends_block(&insn.instr) || insn.instr.is_invalid();
        insns.push(insn);
        if stop {
            break;
        }
    }

    if insns.is_empty() {
        return Err(DecodeFailure::CrossesPage(paddr));
    }
    Ok(insns)
}

/// Decode exactly one instruction (used for fetches that straddle a page boundary).
pub fn decode_one(bytes: &[u8], code32: bool, model: CpuModel) -> Option<Insn> {
    let bitness = if code32 { 32 } else { 16 };
    let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() && decoder.last_error() == DecoderError::NoMoreBytes {
        return None;
    }
    Some(bind(instr, bytes, code32, model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_stops_after_branch() {
        // mov ax, 1 ; inc ax ; jmp $ ; nop
        let bytes = [0xb8, 0x01, 0x00, 0x40, 0xeb, 0xfe, 0x90];
        let insns = decode_run(&bytes, 0x7c00, false, CpuModel::I386).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[2].mnemonic(), Mnemonic::Jmp);
        assert_eq!(insns.iter().map(|i| i.len).sum::<u32>(), 6);
    }

    #[test]
    fn block_stops_after_mode_change() {
        // mov cr0, eax ; nop
        let bytes = [0x0f, 0x22, 0xc0, 0x90];
        let insns = decode_run(&bytes, 0, false, CpuModel::I386).unwrap();
        assert_eq!(insns.len(), 1);
    }

    #[test]
    fn prefixes_flip_sizes() {
        // o32 mov eax, 0x12345678 in 16-bit code
        let bytes = [0x66, 0xb8, 0x78, 0x56, 0x34, 0x12];
        let insn = decode_one(&bytes, false, CpuModel::I386).unwrap();
        assert!(insn.op32);
        assert!(!insn.addr32);
        assert_eq!(insn.len, 6);
    }

    #[test]
    fn truncated_first_instruction_is_reported() {
        // mov eax, imm32 cut off after two bytes
        let bytes = [0xb8, 0x78];
        assert_eq!(
            decode_run(&bytes, 0x0fff_fffe, true, CpuModel::I386).unwrap_err(),
            DecodeFailure::CrossesPage(0x0fff_fffe)
        );
        assert!(decode_one(&bytes, true, CpuModel::I386).is_none());
    }

    #[test]
    fn truncated_tail_is_left_for_the_next_block() {
        // nop ; mov ax, imm16 (cut)
        let bytes = [0x90, 0xb8, 0x01];
        let insns = decode_run(&bytes, 0, false, CpuModel::I386).unwrap();
        assert_eq!(insns.len(), 1);
    }
}
