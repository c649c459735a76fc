pub(crate) const TLB_SETS: usize = 1024;

const FLAG_VALID: u8 = 1 << 0;
const FLAG_READ_ONLY: u8 = 1 << 1;
const FLAG_SUPERVISOR: u8 = 1 << 2;
const FLAG_DIRTY: u8 = 1 << 3;
const FLAG_LARGE: u8 = 1 << 4;

/// A cached linear → physical page translation.
///
/// Entries always describe a single 4KiB linear page; 4MiB pages are cached
/// one 4KiB slice at a time and remember that they came from a large PDE so
/// `invlpg` can drop every slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbEntry {
    vpn: u32,
    pbase: u32,
    /// Physical address of the leaf paging-structure entry (PTE or 4MiB PDE).
    pub(crate) leaf_addr: u32,
    flags: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntryAttributes {
    pub(crate) read_only: bool,
    pub(crate) supervisor_only: bool,
    pub(crate) dirty: bool,
    pub(crate) large: bool,
    pub(crate) leaf_addr: u32,
}

impl TlbEntry {
    pub(crate) fn new(linear: u32, pbase: u32, attrs: TlbEntryAttributes) -> Self {
        let mut flags = FLAG_VALID;
        if attrs.read_only {
            flags |= FLAG_READ_ONLY;
        }
        if attrs.supervisor_only {
            flags |= FLAG_SUPERVISOR;
        }
        if attrs.dirty {
            flags |= FLAG_DIRTY;
        }
        if attrs.large {
            flags |= FLAG_LARGE;
        }
        Self {
            vpn: linear >> 12,
            pbase: pbase & !0xfff,
            leaf_addr: attrs.leaf_addr,
            flags,
        }
    }

    /// Linear page number this entry is keyed by.
    #[inline]
    pub fn linear_page(&self) -> u32 {
        self.vpn
    }

    /// Physical base address of the 4KiB frame.
    #[inline]
    pub fn phys_base(&self) -> u32 {
        self.pbase
    }

    #[inline]
    pub fn read_only(&self) -> bool {
        self.flags & FLAG_READ_ONLY != 0
    }

    #[inline]
    pub fn supervisor_only(&self) -> bool {
        self.flags & FLAG_SUPERVISOR != 0
    }

    #[inline]
    pub(crate) fn dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    #[inline]
    fn valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    #[inline]
    fn large(&self) -> bool {
        self.flags & FLAG_LARGE != 0
    }

    #[inline]
    pub(crate) fn translate(&self, linear: u32) -> u32 {
        self.pbase | (linear & 0xfff)
    }
}

/// Direct-mapped software TLB indexed by the low bits of the linear page number.
#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    entries: Box<[TlbEntry]>,
    has_large: bool,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![TlbEntry::default(); TLB_SETS].into_boxed_slice(),
            has_large: false,
        }
    }

    #[inline]
    fn set_index(vpn: u32) -> usize {
        (vpn as usize) & (TLB_SETS - 1)
    }

    #[inline]
    pub(crate) fn lookup(&self, linear: u32) -> Option<&TlbEntry> {
        let vpn = linear >> 12;
        let entry = &self.entries[Self::set_index(vpn)];
        (entry.valid() && entry.vpn == vpn).then_some(entry)
    }

    pub(crate) fn insert(&mut self, entry: TlbEntry) {
        if entry.large() {
            self.has_large = true;
        }
        let idx = Self::set_index(entry.vpn);
        self.entries[idx] = entry;
    }

    pub(crate) fn set_dirty(&mut self, linear: u32) {
        let vpn = linear >> 12;
        let entry = &mut self.entries[Self::set_index(vpn)];
        if entry.valid() && entry.vpn == vpn {
            entry.flags |= FLAG_DIRTY;
        }
    }

    pub(crate) fn flush_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.flags = 0;
        }
        self.has_large = false;
    }

    pub(crate) fn invalidate(&mut self, linear: u32) {
        let vpn = linear >> 12;
        let idx = Self::set_index(vpn);
        if self.entries[idx].vpn == vpn {
            self.entries[idx].flags = 0;
        }

        if self.has_large {
            let large_vpn = vpn >> 10;
            for entry in self.entries.iter_mut() {
                if entry.valid() && entry.large() && entry.vpn >> 10 == large_vpn {
                    entry.flags = 0;
                }
            }
        }
    }
}
