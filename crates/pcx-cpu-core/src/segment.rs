use iced_x86::Register;

use crate::descriptor::{Descriptor, DescriptorKind, Selector};

/// Segment register slot, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn from_iced(reg: Register) -> Option<Self> {
        Some(match reg {
            Register::ES => SegReg::Es,
            Register::CS => SegReg::Cs,
            Register::SS => SegReg::Ss,
            Register::DS => SegReg::Ds,
            Register::FS => SegReg::Fs,
            Register::GS => SegReg::Gs,
            _ => return None,
        })
    }
}

/// The hidden descriptor cache behind a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub base: u32,
    /// Raw (byte-granular) limit from the descriptor.
    pub limit: u32,
    /// Lowest valid offset.
    pub limit_min: u32,
    /// Highest valid offset.
    pub limit_max: u32,
    pub dpl: u8,
    /// Raw descriptor type nibble.
    pub ty: u8,
    pub big: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub conforming: bool,
    pub expand_down: bool,
    /// An expand-down segment whose limit leaves no valid offsets.
    pub empty: bool,
    /// False when the register holds a null selector or failed a load check.
    pub valid: bool,
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::real(0, false)
    }
}

impl SegmentCache {
    /// The 64 KiB template real-mode loads leave behind: read/write data (type 3), or
    /// readable code (type 0xb) for CS.
    fn real(base: u32, code: bool) -> Self {
        Self {
            base,
            limit: 0xffff,
            limit_min: 0,
            limit_max: 0xffff,
            dpl: 0,
            ty: if code { 0xb } else { 0x3 },
            big: false,
            readable: true,
            writable: !code,
            executable: code,
            conforming: false,
            expand_down: false,
            empty: false,
            valid: true,
        }
    }

    fn from_descriptor(desc: &Descriptor) -> Self {
        let (readable, writable, executable, conforming, expand_down) = match desc.kind {
            DescriptorKind::Code {
                conforming,
                readable,
            } => (readable, false, true, conforming, false),
            DescriptorKind::Data {
                expand_down,
                writable,
            } => (true, writable, false, false, expand_down),
            DescriptorKind::System(_) => (false, false, false, false, false),
        };
        let (limit_min, limit_max, empty) = if expand_down {
            let top = if desc.big { 0xffff_ffff } else { 0xffff };
            match desc.limit.checked_add(1) {
                Some(min) => (min, top, min > top),
                None => (0, 0, true),
            }
        } else {
            (0, desc.limit, false)
        };
        Self {
            base: desc.base,
            limit: desc.limit,
            limit_min,
            limit_max,
            dpl: desc.dpl,
            ty: desc.ty,
            big: desc.big,
            readable,
            writable,
            executable,
            conforming,
            expand_down,
            empty,
            valid: desc.present,
        }
    }

    /// Whether every byte of `[offset, offset + len)` lies inside the segment.
    #[inline]
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        if self.empty {
            return false;
        }
        if len == 0 {
            return true;
        }
        let first = offset as u64;
        let last = first + len as u64 - 1;
        first >= self.limit_min as u64 && last <= self.limit_max as u64
    }
}

/// A segment register: the visible selector plus its descriptor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: Selector,
    pub cache: SegmentCache,
}

impl SegmentRegister {
    /// Real-mode load: base = selector * 16, limit and rights untouched by the selector.
    ///
    /// The limit is reset to 64 KiB; "unreal mode" limits are not preserved across real-mode
    /// loads.
    pub fn load_real(&mut self, seg: SegReg, selector: u16) {
        self.selector = Selector(selector);
        self.cache = SegmentCache::real((selector as u32) << 4, seg == SegReg::Cs);
    }

    /// Virtual-8086 load: real-mode addressing with a DPL 3 descriptor shape.
    pub fn load_v86(&mut self, seg: SegReg, selector: u16) {
        self.load_real(seg, selector);
        self.cache.dpl = 3;
    }

    /// Protected-mode data segment load (DS/ES/FS/GS) with the privilege rule applied.
    ///
    /// A null selector or a descriptor that may not be loaded leaves the register marked
    /// invalid. The base is copied either way so that diagnostic reads of the cache stay
    /// meaningful. Returns the resulting validity.
    pub fn load_protected(&mut self, selector: Selector, desc: &Descriptor, cpl: u8) -> bool {
        self.selector = selector;
        self.cache = SegmentCache::from_descriptor(desc);
        if selector.is_null() || !data_load_allowed(selector, desc, cpl) {
            self.cache.valid = false;
        }
        self.cache.valid
    }

    /// Load a code segment descriptor into CS; the caller has already checked privilege.
    pub fn load_code(&mut self, selector: Selector, desc: &Descriptor) {
        self.selector = selector;
        self.cache = SegmentCache::from_descriptor(desc);
    }

    /// Load an already-validated stack segment.
    pub fn load_stack(&mut self, selector: Selector, desc: &Descriptor) {
        self.selector = selector;
        self.cache = SegmentCache::from_descriptor(desc);
    }

    /// Load a null selector: any later access faults.
    pub fn load_null(&mut self, selector: Selector) {
        self.selector = selector;
        self.cache.valid = false;
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.cache.base
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.cache.valid
    }
}

/// Whether a descriptor may be loaded into DS/ES/FS/GS.
pub fn data_load_allowed(selector: Selector, desc: &Descriptor, cpl: u8) -> bool {
    match desc.kind {
        DescriptorKind::Data { .. }
        | DescriptorKind::Code {
            readable: true,
            conforming: false,
        } => desc.dpl >= cpl.max(selector.rpl()),
        DescriptorKind::Code {
            readable: true,
            conforming: true,
        } => true,
        _ => false,
    }
}
