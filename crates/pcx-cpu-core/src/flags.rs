use bitflags::bitflags;

use crate::registers::OpSize;

/// The emulated processor generation.
///
/// Later models expose more flag bits, system registers and instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CpuModel {
    I8086,
    I186,
    I286,
    I386,
    #[default]
    I486,
    Pentium,
}

impl CpuModel {
    /// EFLAGS bits this model implements.
    pub const fn flag_capability(self) -> u32 {
        const BASE: u32 = 0x0fd5;
        match self {
            CpuModel::I8086 | CpuModel::I186 => BASE,
            CpuModel::I286 => BASE | Flags::IOPL.bits() | Flags::NT.bits(),
            CpuModel::I386 => 0x3_7fd5,
            CpuModel::I486 => 0x7_7fd5,
            CpuModel::Pentium => 0x3f_7fd5,
        }
    }

    #[inline]
    pub fn has_protected_mode(self) -> bool {
        self >= CpuModel::I286
    }

    #[inline]
    pub fn has_32bit(self) -> bool {
        self >= CpuModel::I386
    }

    #[inline]
    pub fn has_cpuid(self) -> bool {
        self >= CpuModel::Pentium
    }

    /// Shift/rotate counts are masked to 5 bits from the 186 on.
    #[inline]
    pub fn masks_shift_count(self) -> bool {
        self >= CpuModel::I186
    }
}

bitflags! {
    /// EFLAGS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

/// Arithmetic status flags touched by ALU operations.
pub const STATUS_FLAGS: u32 = Flags::CF.bits()
    | Flags::PF.bits()
    | Flags::AF.bits()
    | Flags::ZF.bits()
    | Flags::SF.bits()
    | Flags::OF.bits();

/// The flag register, masked by the model's capability.
///
/// The 8086 reads bits 12..15 as ones; that quirk is not modeled, so those bits read back as
/// zero on every model that lacks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRegister {
    bits: u32,
    capability: u32,
}

impl FlagRegister {
    pub fn new(model: CpuModel) -> Self {
        Self {
            bits: 0,
            capability: model.flag_capability(),
        }
    }

    #[inline]
    pub fn capability(&self) -> u32 {
        self.capability
    }

    /// The architectural flag word; the reserved bit 1 always reads as 1.
    #[inline]
    pub fn value(&self) -> u32 {
        (self.bits & self.capability) | Flags::RESERVED1.bits()
    }

    /// Replace the bits selected by `mask` with those of `value`.
    ///
    /// Bits the model does not implement are ignored.
    #[inline]
    pub fn set_value(&mut self, value: u32, mask: u32) {
        let mask = mask & self.capability;
        self.bits = (self.bits & !mask) | (value & mask);
    }

    #[inline]
    pub fn contains(&self, flag: Flags) -> bool {
        self.bits & flag.bits() != 0
    }

    #[inline]
    pub fn set(&mut self, flag: Flags, on: bool) {
        let mask = flag.bits() & self.capability;
        if on {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }

    #[inline]
    pub fn cf(&self) -> bool {
        self.contains(Flags::CF)
    }

    #[inline]
    pub fn pf(&self) -> bool {
        self.contains(Flags::PF)
    }

    #[inline]
    pub fn af(&self) -> bool {
        self.contains(Flags::AF)
    }

    #[inline]
    pub fn zf(&self) -> bool {
        self.contains(Flags::ZF)
    }

    #[inline]
    pub fn sf(&self) -> bool {
        self.contains(Flags::SF)
    }

    #[inline]
    pub fn tf(&self) -> bool {
        self.contains(Flags::TF)
    }

    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        self.contains(Flags::IF)
    }

    #[inline]
    pub fn df(&self) -> bool {
        self.contains(Flags::DF)
    }

    #[inline]
    pub fn of(&self) -> bool {
        self.contains(Flags::OF)
    }

    #[inline]
    pub fn nt(&self) -> bool {
        self.contains(Flags::NT)
    }

    #[inline]
    pub fn vm(&self) -> bool {
        self.contains(Flags::VM)
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.bits & self.capability & Flags::IOPL.bits()) >> 12) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        self.set_value((iopl as u32 & 3) << 12, Flags::IOPL.bits());
    }

    /// Sign, zero and parity from a result of `size`.
    #[inline]
    pub fn set_szp(&mut self, result: u32, size: OpSize) {
        let result = result & size.mask();
        self.set(Flags::SF, result & size.sign_bit() != 0);
        self.set(Flags::ZF, result == 0);
        self.set(Flags::PF, parity(result as u8));
    }

    #[inline]
    pub fn set_szp8(&mut self, result: u8) {
        self.set_szp(result as u32, OpSize::Byte);
    }

    #[inline]
    pub fn set_szp16(&mut self, result: u16) {
        self.set_szp(result as u32, OpSize::Word);
    }

    #[inline]
    pub fn set_szp32(&mut self, result: u32) {
        self.set_szp(result, OpSize::Dword);
    }
}

/// Even parity of the low byte.
#[inline]
pub fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bit_always_reads_as_one() {
        let mut flags = FlagRegister::new(CpuModel::I386);
        assert_eq!(flags.value(), 0x2);
        flags.set_value(0, !0);
        assert_eq!(flags.value(), 0x2);
    }

    #[test]
    fn model_capability_hides_later_flags() {
        let mut flags = FlagRegister::new(CpuModel::I8086);
        flags.set_value(!0, !0);
        assert_eq!(flags.value(), 0x0fd7);
        assert!(!flags.nt());
        assert_eq!(flags.iopl(), 0);

        let mut flags = FlagRegister::new(CpuModel::I486);
        flags.set(Flags::ID, true);
        assert!(!flags.contains(Flags::ID), "CPUID detection relies on ID sticking at 0");

        let mut flags = FlagRegister::new(CpuModel::Pentium);
        flags.set(Flags::ID, true);
        assert!(flags.contains(Flags::ID));
    }

    #[test]
    fn szp_helpers() {
        let mut flags = FlagRegister::new(CpuModel::I386);
        flags.set_szp8(0x80);
        assert!(flags.sf() && !flags.zf() && !flags.pf());
        flags.set_szp16(0);
        assert!(!flags.sf() && flags.zf() && flags.pf());
        flags.set_szp32(0x0000_0107);
        assert!(!flags.sf() && !flags.zf() && !flags.pf());
        flags.set_szp32(0x8000_0003);
        assert!(flags.sf() && flags.pf());
    }

    #[test]
    fn iopl_round_trips() {
        let mut flags = FlagRegister::new(CpuModel::I286);
        flags.set_iopl(3);
        assert_eq!(flags.iopl(), 3);
        assert_eq!(flags.value(), 0x3002);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn model() -> impl Strategy<Value = CpuModel> {
            prop_oneof![
                Just(CpuModel::I8086),
                Just(CpuModel::I186),
                Just(CpuModel::I286),
                Just(CpuModel::I386),
                Just(CpuModel::I486),
                Just(CpuModel::Pentium),
            ]
        }

        proptest! {
            #[test]
            fn set_value_round_trips_through_capability(model in model(), value in any::<u32>()) {
                let mut flags = FlagRegister::new(model);
                flags.set_value(value, !0);
                prop_assert_eq!(flags.value(), (value & model.flag_capability()) | 0x2);
            }
        }
    }
}
