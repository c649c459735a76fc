//! Arithmetic, logic, shift and BCD instructions.

use super::{effective_address, memory_segment, operand_size, read_operand, write_operand, ExecResult};
use crate::ctx::ExecCtx;
use crate::decoder::{ExecOutcome, Insn};
use crate::fault::Fault;
use crate::flags::{CpuModel, FlagRegister, Flags};
use crate::registers::{Gpr, OpSize};
use iced_x86::{Mnemonic, OpKind};

pub(crate) fn add_with_flags(
    flags: &mut FlagRegister,
    dest: u32,
    src: u32,
    carry_in: bool,
    size: OpSize,
) -> u32 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let full = dest as u64 + src as u64 + carry_in as u64;
    let result = full as u32 & mask;

    let sb = size.sign_bit();
    flags.set(Flags::CF, full > mask as u64);
    flags.set(Flags::OF, (dest ^ result) & (src ^ result) & sb != 0);
    flags.set(Flags::AF, (dest ^ src ^ result) & 0x10 != 0);
    flags.set_szp(result, size);
    result
}

pub(crate) fn sub_with_flags(
    flags: &mut FlagRegister,
    dest: u32,
    src: u32,
    borrow_in: bool,
    size: OpSize,
) -> u32 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = src as u64 + borrow_in as u64;
    let result = (dest as u64).wrapping_sub(subtrahend) as u32 & mask;

    let sb = size.sign_bit();
    flags.set(Flags::CF, (dest as u64) < subtrahend);
    flags.set(Flags::OF, (dest ^ src) & (dest ^ result) & sb != 0);
    flags.set(Flags::AF, (dest ^ src ^ result) & 0x10 != 0);
    flags.set_szp(result, size);
    result
}

pub(crate) fn logic_with_flags(flags: &mut FlagRegister, result: u32, size: OpSize) -> u32 {
    let result = result & size.mask();
    flags.set(Flags::CF, false);
    flags.set(Flags::OF, false);
    flags.set(Flags::AF, false);
    flags.set_szp(result, size);
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
}

fn binary(ctx: &mut ExecCtx, insn: &Insn, op: BinOp) -> ExecResult {
    let size = operand_size(insn, 0);
    let dest = read_operand(ctx, insn, 0, size)?;
    let src = read_operand(ctx, insn, 1, size)?;

    let mut flags = ctx.cpu.flags;
    let carry = flags.cf();
    let result = match op {
        BinOp::Add => add_with_flags(&mut flags, dest, src, false, size),
        BinOp::Adc => add_with_flags(&mut flags, dest, src, carry, size),
        BinOp::Sub | BinOp::Cmp => sub_with_flags(&mut flags, dest, src, false, size),
        BinOp::Sbb => sub_with_flags(&mut flags, dest, src, carry, size),
        BinOp::And | BinOp::Test => logic_with_flags(&mut flags, dest & src, size),
        BinOp::Or => logic_with_flags(&mut flags, dest | src, size),
        BinOp::Xor => logic_with_flags(&mut flags, dest ^ src, size),
    };
    if !matches!(op, BinOp::Cmp | BinOp::Test) {
        write_operand(ctx, insn, 0, size, result)?;
    }
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

pub(super) fn add(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Add)
}

pub(super) fn adc(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Adc)
}

pub(super) fn sub(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Sub)
}

pub(super) fn sbb(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Sbb)
}

pub(super) fn cmp(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Cmp)
}

pub(super) fn and(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::And)
}

pub(super) fn or(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Or)
}

pub(super) fn xor(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Xor)
}

pub(super) fn test(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    binary(ctx, insn, BinOp::Test)
}

/// INC and DEC leave CF alone.
fn step_by_one(ctx: &mut ExecCtx, insn: &Insn, down: bool) -> ExecResult {
    let size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 0, size)?;
    let mut flags = ctx.cpu.flags;
    let carry = flags.cf();
    let result = if down {
        sub_with_flags(&mut flags, value, 1, false, size)
    } else {
        add_with_flags(&mut flags, value, 1, false, size)
    };
    flags.set(Flags::CF, carry);
    write_operand(ctx, insn, 0, size, result)?;
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

pub(super) fn inc(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    step_by_one(ctx, insn, false)
}

pub(super) fn dec(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    step_by_one(ctx, insn, true)
}

pub(super) fn neg(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 0, size)?;
    let mut flags = ctx.cpu.flags;
    let result = sub_with_flags(&mut flags, 0, value, false, size);
    write_operand(ctx, insn, 0, size, result)?;
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

pub(super) fn not(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let value = read_operand(ctx, insn, 0, size)?;
    write_operand(ctx, insn, 0, size, !value & size.mask())?;
    Ok(ExecOutcome::Continue)
}

// --- multiply / divide ---

/// Split a double-width value into the accumulator pair for `size`.
fn store_wide(ctx: &mut ExecCtx, size: OpSize, value: u64) {
    let regs = &mut ctx.cpu.regs;
    match size {
        OpSize::Byte => regs.set16(Gpr::Eax, value as u16),
        OpSize::Word => {
            regs.set16(Gpr::Eax, value as u16);
            regs.set16(Gpr::Edx, (value >> 16) as u16);
        }
        OpSize::Dword => {
            regs.set32(Gpr::Eax, value as u32);
            regs.set32(Gpr::Edx, (value >> 32) as u32);
        }
    }
}

fn load_wide(ctx: &ExecCtx, size: OpSize) -> u64 {
    let regs = &ctx.cpu.regs;
    match size {
        OpSize::Byte => regs.get16(Gpr::Eax) as u64,
        OpSize::Word => (regs.get16(Gpr::Edx) as u64) << 16 | regs.get16(Gpr::Eax) as u64,
        OpSize::Dword => (regs.get32(Gpr::Edx) as u64) << 32 | regs.get32(Gpr::Eax) as u64,
    }
}

fn set_mul_flags(flags: &mut FlagRegister, overflow: bool, low: u32, size: OpSize) {
    flags.set(Flags::CF, overflow);
    flags.set(Flags::OF, overflow);
    flags.set_szp(low, size);
}

pub(super) fn mul(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let src = read_operand(ctx, insn, 0, size)?;
    let acc = ctx.cpu.regs.get(Gpr::Eax, size);
    let product = acc as u64 * src as u64;
    store_wide(ctx, size, product);
    let high = product >> size.bits();
    set_mul_flags(&mut ctx.cpu.flags, high != 0, product as u32, size);
    Ok(ExecOutcome::Continue)
}

pub(super) fn imul(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    if insn.instr.op_count() == 1 {
        let src = size.sign_extend(read_operand(ctx, insn, 0, size)?) as i32 as i64;
        let acc = size.sign_extend(ctx.cpu.regs.get(Gpr::Eax, size)) as i32 as i64;
        let product = acc * src;
        store_wide(ctx, size, product as u64);
        let low = size.sign_extend(product as u32) as i32 as i64;
        set_mul_flags(&mut ctx.cpu.flags, low != product, product as u32, size);
        return Ok(ExecOutcome::Continue);
    }

    let (a, b) = if insn.instr.op_count() == 2 {
        (read_operand(ctx, insn, 0, size)?, read_operand(ctx, insn, 1, size)?)
    } else {
        (read_operand(ctx, insn, 1, size)?, read_operand(ctx, insn, 2, size)?)
    };
    let product = size.sign_extend(a) as i32 as i64 * size.sign_extend(b) as i32 as i64;
    let truncated = product as u32 & size.mask();
    let overflow = size.sign_extend(truncated) as i32 as i64 != product;
    write_operand(ctx, insn, 0, size, truncated)?;
    set_mul_flags(&mut ctx.cpu.flags, overflow, truncated, size);
    Ok(ExecOutcome::Continue)
}

/// Divide the accumulator pair; `#DE` leaves every register untouched.
pub(super) fn div(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let divisor = read_operand(ctx, insn, 0, size)? as u64;
    if divisor == 0 {
        return Err(Fault::DivideError);
    }
    let dividend = load_wide(ctx, size);
    let quotient = dividend / divisor;
    let remainder = dividend % divisor;
    if quotient > size.mask() as u64 {
        return Err(Fault::DivideError);
    }
    store_quotient(ctx, size, quotient as u32, remainder as u32);
    Ok(ExecOutcome::Continue)
}

pub(super) fn idiv(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let divisor = size.sign_extend(read_operand(ctx, insn, 0, size)?) as i32 as i64;
    if divisor == 0 {
        return Err(Fault::DivideError);
    }
    let wide = load_wide(ctx, size);
    let dividend = match size {
        OpSize::Byte => wide as u16 as i16 as i64,
        OpSize::Word => wide as u32 as i32 as i64,
        OpSize::Dword => wide as i64,
    };
    // i64::MIN / -1 overflows; it is out of range for every size anyway.
    let Some(quotient) = dividend.checked_div(divisor) else {
        return Err(Fault::DivideError);
    };
    let remainder = dividend % divisor;
    let half = size.sign_bit() as i64;
    if quotient < -half || quotient >= half {
        return Err(Fault::DivideError);
    }
    store_quotient(ctx, size, quotient as u32, remainder as u32);
    Ok(ExecOutcome::Continue)
}

fn store_quotient(ctx: &mut ExecCtx, size: OpSize, quotient: u32, remainder: u32) {
    let regs = &mut ctx.cpu.regs;
    match size {
        OpSize::Byte => {
            regs.set8(0, quotient as u8);
            regs.set8(4, remainder as u8);
        }
        OpSize::Word => {
            regs.set16(Gpr::Eax, quotient as u16);
            regs.set16(Gpr::Edx, remainder as u16);
        }
        OpSize::Dword => {
            regs.set32(Gpr::Eax, quotient);
            regs.set32(Gpr::Edx, remainder);
        }
    }
}

// --- shifts and rotates ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

/// Shift or rotate `value` by an already-masked `count`. A zero count changes nothing.
pub(crate) fn shift_with_flags(
    flags: &mut FlagRegister,
    op: ShiftOp,
    value: u32,
    count: u32,
    size: OpSize,
) -> u32 {
    let bits = size.bits();
    let mask = size.mask();
    let value = value & mask;
    let msb = |v: u32| v & size.sign_bit() != 0;
    if count == 0 {
        return value;
    }

    match op {
        ShiftOp::Rol => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                ((value << n) | (value >> (bits - n))) & mask
            };
            let cf = result & 1 != 0;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, msb(result) ^ cf);
            result
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                ((value >> n) | (value << (bits - n))) & mask
            };
            flags.set(Flags::CF, msb(result));
            flags.set(Flags::OF, msb(result) ^ (result & (size.sign_bit() >> 1) != 0));
            result
        }
        ShiftOp::Rcl => {
            let width = bits + 1;
            let n = count % width;
            let wide = (flags.cf() as u64) << bits | value as u64;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide << n) | (wide >> (width - n))) & ((1u64 << width) - 1)
            };
            let result = rotated as u32 & mask;
            let cf = rotated >> bits & 1 != 0;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, msb(result) ^ cf);
            result
        }
        ShiftOp::Rcr => {
            let width = bits + 1;
            let n = count % width;
            flags.set(Flags::OF, msb(value) ^ flags.cf());
            let wide = (flags.cf() as u64) << bits | value as u64;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide >> n) | (wide << (width - n))) & ((1u64 << width) - 1)
            };
            flags.set(Flags::CF, rotated >> bits & 1 != 0);
            rotated as u32 & mask
        }
        ShiftOp::Shl => {
            let wide = (value as u64) << count.min(63);
            let result = wide as u32 & mask;
            let cf = count <= bits && wide >> bits & 1 != 0;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, msb(result) ^ cf);
            flags.set_szp(result, size);
            result
        }
        ShiftOp::Shr => {
            let cf = count <= bits && (value as u64) >> (count - 1) & 1 != 0;
            let result = ((value as u64) >> count.min(63)) as u32;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, msb(value));
            flags.set_szp(result, size);
            result
        }
        ShiftOp::Sar => {
            let signed = size.sign_extend(value) as i32 as i64;
            let n = count.min(bits);
            let cf = (signed >> (n - 1)) & 1 != 0;
            let result = (signed >> n) as u32 & mask;
            flags.set(Flags::CF, cf);
            flags.set(Flags::OF, false);
            flags.set_szp(result, size);
            result
        }
    }
}

pub(super) fn shift(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let op = match insn.mnemonic() {
        Mnemonic::Rol => ShiftOp::Rol,
        Mnemonic::Ror => ShiftOp::Ror,
        Mnemonic::Rcl => ShiftOp::Rcl,
        Mnemonic::Rcr => ShiftOp::Rcr,
        Mnemonic::Shl | Mnemonic::Sal => ShiftOp::Shl,
        Mnemonic::Shr => ShiftOp::Shr,
        _ => ShiftOp::Sar,
    };
    let size = operand_size(insn, 0);
    let mut count = read_operand(ctx, insn, 1, OpSize::Byte)?;
    if ctx.cpu.model.masks_shift_count() {
        count &= 0x1f;
    }
    let value = read_operand(ctx, insn, 0, size)?;
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    let mut flags = ctx.cpu.flags;
    let result = shift_with_flags(&mut flags, op, value, count, size);
    write_operand(ctx, insn, 0, size, result)?;
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

/// SHLD / SHRD.
pub(super) fn double_shift(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let count = read_operand(ctx, insn, 2, OpSize::Byte)? & 0x1f;
    let dest = read_operand(ctx, insn, 0, size)?;
    let src = read_operand(ctx, insn, 1, size)?;
    if count == 0 {
        return Ok(ExecOutcome::Continue);
    }
    let bits = size.bits();
    let mask = size.mask() as u128;
    let (result, cf) = if insn.mnemonic() == Mnemonic::Shld {
        let cat = (dest as u128) << bits | src as u128;
        let shifted = cat << count;
        (
            (shifted >> bits & mask) as u32,
            shifted >> (2 * bits) & 1 != 0,
        )
    } else {
        let cat = (src as u128) << bits | dest as u128;
        ((cat >> count & mask) as u32, cat >> (count - 1) & 1 != 0)
    };
    let mut flags = ctx.cpu.flags;
    flags.set(Flags::CF, cf);
    flags.set(Flags::OF, (result ^ dest) & size.sign_bit() != 0);
    flags.set_szp(result, size);
    write_operand(ctx, insn, 0, size, result)?;
    ctx.cpu.flags = flags;
    Ok(ExecOutcome::Continue)
}

// --- bit operations ---

/// BT, BTS, BTR, BTC. A register bit offset on a memory operand may address outside it.
pub(super) fn bit_test(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let bits = size.bits();
    let offset = read_operand(ctx, insn, 1, size)?;
    let bit = offset & (bits - 1);

    let memory = insn.instr.op0_kind() == OpKind::Memory;
    let (value, addr) = if memory {
        let mut addr = effective_address(ctx, insn);
        if insn.instr.op1_kind() == OpKind::Register {
            let signed = size.sign_extend(offset) as i32;
            let displacement = (signed >> bits.trailing_zeros()) * size.bytes() as i32;
            addr = addr.wrapping_add(displacement as u32);
            if !insn.addr32 {
                addr &= 0xffff;
            }
        }
        (ctx.read(memory_segment(insn), addr, size)?, addr)
    } else {
        (read_operand(ctx, insn, 0, size)?, 0)
    };

    let set = value >> bit & 1 != 0;
    let updated = match insn.mnemonic() {
        Mnemonic::Bts => Some(value | 1 << bit),
        Mnemonic::Btr => Some(value & !(1 << bit)),
        Mnemonic::Btc => Some(value ^ 1 << bit),
        _ => None,
    };
    if let Some(updated) = updated {
        if memory {
            ctx.write(memory_segment(insn), addr, size, updated)?;
        } else {
            write_operand(ctx, insn, 0, size, updated)?;
        }
    }
    ctx.cpu.flags.set(Flags::CF, set);
    Ok(ExecOutcome::Continue)
}

/// BSF / BSR. A zero source sets ZF and leaves the destination alone.
pub(super) fn bit_scan(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = operand_size(insn, 0);
    let src = read_operand(ctx, insn, 1, size)? & size.mask();
    if src == 0 {
        ctx.cpu.flags.set(Flags::ZF, true);
        return Ok(ExecOutcome::Continue);
    }
    let index = if insn.mnemonic() == Mnemonic::Bsf {
        src.trailing_zeros()
    } else {
        31 - src.leading_zeros()
    };
    write_operand(ctx, insn, 0, size, index)?;
    ctx.cpu.flags.set(Flags::ZF, false);
    Ok(ExecOutcome::Continue)
}

// --- BCD ---

fn al(ctx: &ExecCtx) -> u8 {
    ctx.cpu.regs.get8(0)
}

fn ah(ctx: &ExecCtx) -> u8 {
    ctx.cpu.regs.get8(4)
}

pub(super) fn daa(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let old_al = al(ctx);
    let flags = &mut ctx.cpu.flags;
    let old_cf = flags.cf();
    let mut value = old_al;
    let mut cf = false;
    if value & 0x0f > 9 || flags.af() {
        let (sum, carry) = value.overflowing_add(6);
        value = sum;
        cf = old_cf || carry;
        flags.set(Flags::AF, true);
    } else {
        flags.set(Flags::AF, false);
    }
    if old_al > 0x99 || old_cf {
        value = value.wrapping_add(0x60);
        cf = true;
    }
    flags.set(Flags::CF, cf);
    flags.set_szp8(value);
    ctx.cpu.regs.set8(0, value);
    Ok(ExecOutcome::Continue)
}

pub(super) fn das(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    let old_al = al(ctx);
    let flags = &mut ctx.cpu.flags;
    let old_cf = flags.cf();
    let mut value = old_al;
    let mut cf = false;
    if value & 0x0f > 9 || flags.af() {
        cf = old_cf || value < 6;
        value = value.wrapping_sub(6);
        flags.set(Flags::AF, true);
    } else {
        flags.set(Flags::AF, false);
    }
    if old_al > 0x99 || old_cf {
        value = value.wrapping_sub(0x60);
        cf = true;
    }
    flags.set(Flags::CF, cf);
    flags.set_szp8(value);
    ctx.cpu.regs.set8(0, value);
    Ok(ExecOutcome::Continue)
}

/// AAA / AAS.
fn ascii_adjust(ctx: &mut ExecCtx, subtract: bool) -> ExecResult {
    let adjust = al(ctx) & 0x0f > 9 || ctx.cpu.flags.af();
    if adjust {
        let ax = ctx.cpu.regs.get16(Gpr::Eax);
        let ax = if subtract {
            let al = (ax as u8).wrapping_sub(6);
            let ah = ((ax >> 8) as u8).wrapping_sub(1);
            (ah as u16) << 8 | al as u16
        } else if ctx.cpu.model >= CpuModel::I286 {
            ax.wrapping_add(0x106)
        } else {
            let al = (ax as u8).wrapping_add(6);
            let ah = ((ax >> 8) as u8).wrapping_add(1);
            (ah as u16) << 8 | al as u16
        };
        ctx.cpu.regs.set16(Gpr::Eax, ax);
    }
    let flags = &mut ctx.cpu.flags;
    flags.set(Flags::AF, adjust);
    flags.set(Flags::CF, adjust);
    let value = al(ctx) & 0x0f;
    ctx.cpu.regs.set8(0, value);
    Ok(ExecOutcome::Continue)
}

pub(super) fn aaa(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    ascii_adjust(ctx, false)
}

pub(super) fn aas(ctx: &mut ExecCtx, _insn: &Insn) -> ExecResult {
    ascii_adjust(ctx, true)
}

pub(super) fn aam(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let base = insn.instr.immediate(0) as u8;
    if base == 0 {
        return Err(Fault::DivideError);
    }
    let value = al(ctx);
    ctx.cpu.regs.set8(4, value / base);
    ctx.cpu.regs.set8(0, value % base);
    ctx.cpu.flags.set_szp8(value % base);
    Ok(ExecOutcome::Continue)
}

pub(super) fn aad(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let base = insn.instr.immediate(0) as u8;
    let value = al(ctx).wrapping_add(ah(ctx).wrapping_mul(base));
    ctx.cpu.regs.set16(Gpr::Eax, value as u16);
    ctx.cpu.flags.set_szp8(value);
    Ok(ExecOutcome::Continue)
}

// --- sign extension ---

/// CBW / CWDE.
pub(super) fn widen_accumulator(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let regs = &mut ctx.cpu.regs;
    if insn.mnemonic() == Mnemonic::Cwde {
        let ax = regs.get16(Gpr::Eax);
        regs.set32(Gpr::Eax, OpSize::Word.sign_extend(ax as u32));
    } else {
        let al = regs.get8(0);
        regs.set16(Gpr::Eax, OpSize::Byte.sign_extend(al as u32) as u16);
    }
    Ok(ExecOutcome::Continue)
}

/// CWD / CDQ.
pub(super) fn sign_extend_into_dx(ctx: &mut ExecCtx, insn: &Insn) -> ExecResult {
    let size = if insn.mnemonic() == Mnemonic::Cdq {
        OpSize::Dword
    } else {
        OpSize::Word
    };
    let regs = &mut ctx.cpu.regs;
    let negative = regs.get(Gpr::Eax, size) & size.sign_bit() != 0;
    regs.set(Gpr::Edx, size, if negative { !0 } else { 0 });
    Ok(ExecOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::parity;

    fn flags() -> FlagRegister {
        FlagRegister::new(CpuModel::I486)
    }

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut f = flags();
        assert_eq!(add_with_flags(&mut f, 0x7f, 1, false, OpSize::Byte), 0x80);
        assert!(f.of() && !f.cf() && f.sf() && f.af());

        assert_eq!(add_with_flags(&mut f, 0xffff, 1, false, OpSize::Word), 0);
        assert!(f.cf() && f.zf() && !f.of() && f.pf());

        assert_eq!(add_with_flags(&mut f, 0xffff_ffff, 0, true, OpSize::Dword), 0);
        assert!(f.cf() && f.zf());
    }

    #[test]
    fn sub_borrow_and_overflow() {
        let mut f = flags();
        assert_eq!(sub_with_flags(&mut f, 0, 1, false, OpSize::Byte), 0xff);
        assert!(f.cf() && f.sf() && !f.of());

        assert_eq!(sub_with_flags(&mut f, 0x8000, 1, false, OpSize::Word), 0x7fff);
        assert!(f.of() && !f.cf());

        // SBB with a full-width subtrahend and borrow in.
        assert_eq!(sub_with_flags(&mut f, 0x7f, 0xff, true, OpSize::Byte), 0x7f);
        assert!(f.cf() && !f.of());
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let mut f = flags();
        f.set(Flags::CF, true);
        f.set(Flags::OF, true);
        assert_eq!(logic_with_flags(&mut f, 0x1_0000, OpSize::Word), 0);
        assert!(!f.cf() && !f.of() && f.zf());
    }

    #[test]
    fn rol_by_zero_changes_nothing() {
        let mut f = flags();
        f.set(Flags::CF, true);
        let before = f;
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Rol, 0x8001, 0, OpSize::Word), 0x8001);
        assert_eq!(f, before);
    }

    #[test]
    fn rol_by_one() {
        let mut f = flags();
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Rol, 0x8001, 1, OpSize::Word), 0x0003);
        assert!(f.cf() && f.of());
    }

    #[test]
    fn rcr_through_carry() {
        let mut f = flags();
        f.set(Flags::CF, true);
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Rcr, 0x01, 1, OpSize::Byte), 0x80);
        assert!(f.cf());
        // Nine-bit rotation: 9 rotations bring the byte back.
        let mut f = flags();
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Rcl, 0x5a, 9, OpSize::Byte), 0x5a);
        assert!(!f.cf());
    }

    #[test]
    fn shifts_past_width() {
        let mut f = flags();
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Shl, 0x01, 8, OpSize::Byte), 0);
        assert!(f.cf() && f.zf());
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Shr, 0x80, 9, OpSize::Byte), 0);
        assert!(!f.cf());
        assert_eq!(shift_with_flags(&mut f, ShiftOp::Sar, 0x80, 20, OpSize::Byte), 0xff);
        assert!(f.cf() && f.sf());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn add_matches_wide_math(a in any::<u16>(), b in any::<u16>(), c in any::<bool>()) {
                let mut f = flags();
                let r = add_with_flags(&mut f, a as u32, b as u32, c, OpSize::Word);
                let wide = a as u32 + b as u32 + c as u32;
                prop_assert_eq!(r, wide & 0xffff);
                prop_assert_eq!(f.cf(), wide > 0xffff);
                let signed = a as i16 as i32 + b as i16 as i32 + c as i32;
                prop_assert_eq!(f.of(), signed != r as u16 as i16 as i32);
            }

            #[test]
            fn sub_matches_wide_math(a in any::<u8>(), b in any::<u8>(), c in any::<bool>()) {
                let mut f = flags();
                let r = sub_with_flags(&mut f, a as u32, b as u32, c, OpSize::Byte);
                let wide = a as i32 - b as i32 - c as i32;
                prop_assert_eq!(r, wide as u32 & 0xff);
                prop_assert_eq!(f.cf(), wide < 0);
                let signed = a as i8 as i32 - b as i8 as i32 - c as i32;
                prop_assert_eq!(f.of(), signed != r as u8 as i8 as i32);
                prop_assert_eq!(f.pf(), parity(r as u8));
            }

            #[test]
            fn rotate_left_then_right_is_identity(v in any::<u32>(), n in 1u32..32) {
                let mut f = flags();
                let rotated = shift_with_flags(&mut f, ShiftOp::Rol, v, n, OpSize::Dword);
                prop_assert_eq!(rotated, v.rotate_left(n));
                let back = shift_with_flags(&mut f, ShiftOp::Ror, rotated, n, OpSize::Dword);
                prop_assert_eq!(back, v);
            }
        }
    }
}
