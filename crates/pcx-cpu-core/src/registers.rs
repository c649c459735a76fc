use iced_x86::Register;

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl OpSize {
    #[inline]
    pub const fn bytes(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            OpSize::Byte => 0xff,
            OpSize::Word => 0xffff,
            OpSize::Dword => 0xffff_ffff,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend the low `self` bits of `value` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            OpSize::Byte => value as u8 as i8 as i32 as u32,
            OpSize::Word => value as u16 as i16 as i32 as u32,
            OpSize::Dword => value,
        }
    }

    /// Size for a byte count of 1, 2 or 4.
    #[inline]
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(OpSize::Byte),
            2 => Some(OpSize::Word),
            4 => Some(OpSize::Dword),
            _ => None,
        }
    }

    #[inline]
    pub fn word_or_dword(op32: bool) -> Self {
        if op32 {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }
}

/// General purpose register index, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

/// The eight 32-bit general purpose registers.
///
/// The 16-bit and 8-bit registers are views into the same storage: writing AX leaves the
/// upper half of EAX alone, writing AH leaves AL and the upper half alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    gpr: [u32; 8],
}

impl Registers {
    #[inline]
    pub fn get32(&self, reg: Gpr) -> u32 {
        self.gpr[reg as usize]
    }

    #[inline]
    pub fn set32(&mut self, reg: Gpr, value: u32) {
        self.gpr[reg as usize] = value;
    }

    #[inline]
    pub fn get16(&self, reg: Gpr) -> u16 {
        self.gpr[reg as usize] as u16
    }

    #[inline]
    pub fn set16(&mut self, reg: Gpr, value: u16) {
        let slot = &mut self.gpr[reg as usize];
        *slot = (*slot & 0xffff_0000) | value as u32;
    }

    /// 8-bit register by encoding: 0..=3 are AL/CL/DL/BL, 4..=7 are AH/CH/DH/BH.
    #[inline]
    pub fn get8(&self, encoding: u8) -> u8 {
        let slot = self.gpr[(encoding & 3) as usize];
        if encoding & 4 == 0 {
            slot as u8
        } else {
            (slot >> 8) as u8
        }
    }

    #[inline]
    pub fn set8(&mut self, encoding: u8, value: u8) {
        let slot = &mut self.gpr[(encoding & 3) as usize];
        if encoding & 4 == 0 {
            *slot = (*slot & !0xff) | value as u32;
        } else {
            *slot = (*slot & !0xff00) | ((value as u32) << 8);
        }
    }

    /// Read a register of the given width, zero-extended.
    #[inline]
    pub fn get(&self, reg: Gpr, size: OpSize) -> u32 {
        self.gpr[reg as usize] & size.mask()
    }

    /// Write the low `size` bits of a register.
    #[inline]
    pub fn set(&mut self, reg: Gpr, size: OpSize, value: u32) {
        let slot = &mut self.gpr[reg as usize];
        *slot = (*slot & !size.mask()) | (value & size.mask());
    }

    /// Read a decoder register operand. Returns `None` for non-GPR registers.
    pub fn read(&self, reg: Register) -> Option<u32> {
        let (view, size) = gpr_view(reg)?;
        Some(match view {
            GprView::Full(gpr) => self.get(gpr, size),
            GprView::High8(gpr) => (self.gpr[gpr as usize] >> 8) & 0xff,
        })
    }

    /// Write a decoder register operand; returns `false` for non-GPR registers.
    pub fn write(&mut self, reg: Register, value: u32) -> bool {
        match gpr_view(reg) {
            Some((GprView::Full(gpr), size)) => {
                self.set(gpr, size, value);
                true
            }
            Some((GprView::High8(gpr), _)) => {
                self.set8(gpr as u8 | 4, value as u8);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GprView {
    Full(Gpr),
    High8(Gpr),
}

fn gpr_view(reg: Register) -> Option<(GprView, OpSize)> {
    use GprView::{Full, High8};

    Some(match reg {
        Register::AL => (Full(Gpr::Eax), OpSize::Byte),
        Register::CL => (Full(Gpr::Ecx), OpSize::Byte),
        Register::DL => (Full(Gpr::Edx), OpSize::Byte),
        Register::BL => (Full(Gpr::Ebx), OpSize::Byte),
        Register::AH => (High8(Gpr::Eax), OpSize::Byte),
        Register::CH => (High8(Gpr::Ecx), OpSize::Byte),
        Register::DH => (High8(Gpr::Edx), OpSize::Byte),
        Register::BH => (High8(Gpr::Ebx), OpSize::Byte),
        Register::AX => (Full(Gpr::Eax), OpSize::Word),
        Register::CX => (Full(Gpr::Ecx), OpSize::Word),
        Register::DX => (Full(Gpr::Edx), OpSize::Word),
        Register::BX => (Full(Gpr::Ebx), OpSize::Word),
        Register::SP => (Full(Gpr::Esp), OpSize::Word),
        Register::BP => (Full(Gpr::Ebp), OpSize::Word),
        Register::SI => (Full(Gpr::Esi), OpSize::Word),
        Register::DI => (Full(Gpr::Edi), OpSize::Word),
        Register::EAX => (Full(Gpr::Eax), OpSize::Dword),
        Register::ECX => (Full(Gpr::Ecx), OpSize::Dword),
        Register::EDX => (Full(Gpr::Edx), OpSize::Dword),
        Register::EBX => (Full(Gpr::Ebx), OpSize::Dword),
        Register::ESP => (Full(Gpr::Esp), OpSize::Dword),
        Register::EBP => (Full(Gpr::Ebp), OpSize::Dword),
        Register::ESI => (Full(Gpr::Esi), OpSize::Dword),
        Register::EDI => (Full(Gpr::Edi), OpSize::Dword),
        _ => return None,
    })
}

/// Width of a GPR decoder register.
pub fn gpr_size(reg: Register) -> Option<OpSize> {
    gpr_view(reg).map(|(_, size)| size)
}
