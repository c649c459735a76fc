//! Selectors and 8-byte segment/gate descriptors.

/// A segment selector: table index, table indicator and requested privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u16);

impl Selector {
    #[inline]
    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    #[inline]
    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// TI bit: the selector refers to the LDT.
    #[inline]
    pub fn uses_ldt(self) -> bool {
        self.0 & 4 != 0
    }

    /// Index 0 of the GDT, with any RPL.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 & !3 == 0
    }

    /// The selector as pushed in a fault error code (RPL cleared).
    #[inline]
    pub fn error_code(self) -> u16 {
        self.0 & 0xfffc
    }

    #[inline]
    pub fn with_rpl(self, rpl: u8) -> Self {
        Selector((self.0 & !3) | (rpl as u16 & 3))
    }

    /// Byte offset of the descriptor within its table.
    #[inline]
    pub fn table_offset(self) -> u32 {
        (self.0 & !7) as u32
    }
}

/// System descriptor types (S bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    Tss16 { busy: bool },
    Ldt,
    CallGate16,
    TaskGate,
    InterruptGate16,
    TrapGate16,
    Tss32 { busy: bool },
    CallGate32,
    InterruptGate32,
    TrapGate32,
    Reserved,
}

impl SystemKind {
    fn from_type(ty: u8) -> Self {
        match ty {
            0x1 => SystemKind::Tss16 { busy: false },
            0x2 => SystemKind::Ldt,
            0x3 => SystemKind::Tss16 { busy: true },
            0x4 => SystemKind::CallGate16,
            0x5 => SystemKind::TaskGate,
            0x6 => SystemKind::InterruptGate16,
            0x7 => SystemKind::TrapGate16,
            0x9 => SystemKind::Tss32 { busy: false },
            0xb => SystemKind::Tss32 { busy: true },
            0xc => SystemKind::CallGate32,
            0xe => SystemKind::InterruptGate32,
            0xf => SystemKind::TrapGate32,
            _ => SystemKind::Reserved,
        }
    }

    pub fn is_tss(self) -> bool {
        matches!(self, SystemKind::Tss16 { .. } | SystemKind::Tss32 { .. })
    }

    pub fn is_gate(self) -> bool {
        matches!(
            self,
            SystemKind::CallGate16
                | SystemKind::CallGate32
                | SystemKind::TaskGate
                | SystemKind::InterruptGate16
                | SystemKind::InterruptGate32
                | SystemKind::TrapGate16
                | SystemKind::TrapGate32
        )
    }

    /// Gate pushes 32-bit values.
    pub fn is_32bit_gate(self) -> bool {
        matches!(
            self,
            SystemKind::CallGate32 | SystemKind::InterruptGate32 | SystemKind::TrapGate32
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Code { conforming: bool, readable: bool },
    Data { expand_down: bool, writable: bool },
    System(SystemKind),
}

/// A parsed descriptor table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
    pub base: u32,
    /// Byte-granular limit (already scaled when G=1).
    pub limit: u32,
    pub present: bool,
    pub dpl: u8,
    /// Raw 4-bit type field.
    pub ty: u8,
    /// D/B bit.
    pub big: bool,
    pub kind: DescriptorKind,
}

/// Bit 40+0: accessed (code/data), and the busy bit position for TSS descriptors.
pub const DESC_ACCESSED: u64 = 1 << 40;
pub const DESC_TSS_BUSY: u64 = 1 << 41;

impl Descriptor {
    pub fn parse(raw: u64) -> Self {
        let lo = raw as u32;
        let hi = (raw >> 32) as u32;

        let base = (lo >> 16) | ((hi & 0xff) << 16) | (hi & 0xff00_0000);
        let mut limit = (lo & 0xffff) | (hi & 0x000f_0000);
        if hi & (1 << 23) != 0 {
            limit = (limit << 12) | 0xfff;
        }

        let ty = ((hi >> 8) & 0xf) as u8;
        let is_segment = hi & (1 << 12) != 0;
        let kind = if !is_segment {
            DescriptorKind::System(SystemKind::from_type(ty))
        } else if ty & 0x8 != 0 {
            DescriptorKind::Code {
                conforming: ty & 0x4 != 0,
                readable: ty & 0x2 != 0,
            }
        } else {
            DescriptorKind::Data {
                expand_down: ty & 0x4 != 0,
                writable: ty & 0x2 != 0,
            }
        };

        Self {
            raw,
            base,
            limit,
            present: hi & (1 << 15) != 0,
            dpl: ((hi >> 13) & 3) as u8,
            ty,
            big: hi & (1 << 22) != 0,
            kind,
        }
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Code { .. })
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self.kind, DescriptorKind::Data { .. })
    }

    #[inline]
    pub fn system_kind(&self) -> Option<SystemKind> {
        match self.kind {
            DescriptorKind::System(kind) => Some(kind),
            _ => None,
        }
    }

    #[inline]
    pub fn is_conforming_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Code { conforming: true, .. })
    }

    /// Data, or code that may be read.
    #[inline]
    pub fn is_readable(&self) -> bool {
        matches!(
            self.kind,
            DescriptorKind::Data { .. } | DescriptorKind::Code { readable: true, .. }
        )
    }

    #[inline]
    pub fn is_writable_data(&self) -> bool {
        matches!(self.kind, DescriptorKind::Data { writable: true, .. })
    }

    /// Target selector of a gate descriptor.
    #[inline]
    pub fn gate_selector(&self) -> Selector {
        Selector((self.raw >> 16) as u16)
    }

    /// Target offset of a gate descriptor (16-bit gates only use the low half).
    #[inline]
    pub fn gate_offset(&self) -> u32 {
        let low = self.raw as u32 & 0xffff;
        match self.system_kind() {
            Some(kind) if kind.is_32bit_gate() => low | ((self.raw >> 32) as u32 & 0xffff_0000),
            _ => low,
        }
    }

    /// Number of stack parameters copied by a call gate.
    #[inline]
    pub fn gate_param_count(&self) -> u8 {
        ((self.raw >> 32) & 0x1f) as u8
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// LDTR: the selector it was loaded from plus the cached table geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LdtRegister {
    pub selector: Selector,
    pub base: u32,
    pub limit: u32,
    pub valid: bool,
}

/// Build a raw descriptor. Used by tests and by the reset path.
pub fn encode_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let (limit, granular) = if limit > 0xf_ffff {
        (limit >> 12, true)
    } else {
        (limit, false)
    };
    let flags = (flags & 0x4) | if granular { 0x8 } else { 0 };

    (limit as u64 & 0xffff)
        | ((base as u64 & 0xff_ffff) << 16)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xf) << 48)
        | ((flags as u64) << 52)
        | (((base as u64 >> 24) & 0xff) << 56)
}

/// Build a raw gate descriptor.
pub fn encode_gate(selector: u16, offset: u32, access: u8, param_count: u8) -> u64 {
    (offset as u64 & 0xffff)
        | ((selector as u64) << 16)
        | ((param_count as u64 & 0x1f) << 32)
        | ((access as u64) << 40)
        | (((offset as u64) >> 16) << 48)
}
