//! 32-bit x86 MMU: linear → physical translation with a software TLB.
//!
//! Covers the paging modes a 386/486/Pentium class PC exposes:
//! - No paging (identity mapping)
//! - Two-level 32-bit paging with 4KiB pages, plus 4MiB pages when CR4.PSE is set
//!
//! The A20 gate is applied as the final step of every translation, paged or not.
#![forbid(unsafe_code)]

mod tlb;

pub use tlb::TlbEntry;
use tlb::{Tlb, TlbEntryAttributes};

#[cfg(test)]
mod tests;

/// Physical memory access used for page-table walking and guest memory.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u32) -> u8;
    fn write_u8(&mut self, paddr: u32, value: u8);

    #[inline]
    fn read_u16(&mut self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))])
    }

    #[inline]
    fn read_u32(&mut self, paddr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u32, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u32, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u32, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u32));
        }
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u32, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u32), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u32) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u32, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u32) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u32) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u32, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u32, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u32, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u32, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;
pub const CR4_PSE: u32 = 1 << 4;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;
const PTE_PS: u32 = 1 << 7;

/// Bits 13..=21 of a 4MiB PDE are reserved on a 32-bit physical address space.
const PDE_4MB_RESERVED_MASK: u32 = 0x003f_e000;

pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;
pub const PF_RSVD: u32 = 1 << 3;

const A20_BIT: u32 = 1 << 20;

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    /// Error code as per Intel SDM (P, W/R, U/S, RSVD).
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn new(addr: u32, error_code: u32) -> Self {
        Self { addr, error_code }
    }
}

#[inline]
fn pf_error_code(present: bool, access: AccessType, is_user: bool, rsvd: bool) -> u32 {
    let mut code = 0;
    if present {
        code |= PF_PRESENT;
    }
    if access.is_write() {
        code |= PF_WRITE;
    }
    if is_user {
        code |= PF_USER;
    }
    if rsvd {
        code |= PF_RSVD;
    }
    code
}

/// Physical placement of a multi-byte linear access.
///
/// `first_len` bytes live at `first`; the rest (if any) continue at `second`,
/// which is the start of the next linear page's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysSpan {
    pub first: u32,
    pub first_len: u8,
    pub second: u32,
}

impl PhysSpan {
    /// Physical address of byte `i` of the access.
    #[inline]
    pub fn byte(&self, i: u8) -> u32 {
        if i < self.first_len {
            self.first.wrapping_add(i as u32)
        } else {
            self.second.wrapping_add((i - self.first_len) as u32)
        }
    }

    #[inline]
    pub fn is_split(&self, len: u8) -> bool {
        self.first_len < len
    }
}

/// 32-bit x86 MMU with a software TLB.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    a20_enabled: bool,
    tlb: Tlb,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            a20_enabled: false,
            tlb: Tlb::new(),
        }
    }

    #[inline]
    pub fn cr0(&self) -> u32 {
        self.cr0
    }

    #[inline]
    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    #[inline]
    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    #[inline]
    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    pub fn set_cr0(&mut self, value: u32) {
        let relevant = CR0_PG | CR0_WP;
        let old = self.cr0 & relevant;
        self.cr0 = value;
        if old != value & relevant {
            self.tlb.flush_all();
        }
    }

    /// MOV CR2 (the guest may overwrite the latched fault address).
    pub fn set_cr2(&mut self, value: u32) {
        self.cr2 = value;
    }

    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.tlb.flush_all();
    }

    pub fn set_cr4(&mut self, value: u32) {
        let old = self.cr4 & CR4_PSE;
        self.cr4 = value;
        if old != value & CR4_PSE {
            self.tlb.flush_all();
        }
    }

    pub fn set_a20(&mut self, enabled: bool) {
        if self.a20_enabled != enabled {
            self.a20_enabled = enabled;
            self.tlb.flush_all();
        }
    }

    /// INVLPG.
    pub fn invlpg(&mut self, linear: u32) {
        self.tlb.invalidate(linear);
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.flush_all();
    }

    /// The cached translation for `linear`'s page, if any.
    pub fn tlb_entry(&self, linear: u32) -> Option<TlbEntry> {
        self.tlb.lookup(linear).copied()
    }

    #[inline]
    fn a20_mask(&self) -> u32 {
        if self.a20_enabled {
            !0
        } else {
            !A20_BIT
        }
    }

    #[inline]
    fn wp_enabled(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    #[inline]
    fn pse_enabled(&self) -> bool {
        self.cr4 & CR4_PSE != 0
    }

    /// Translate a linear address to a physical address.
    ///
    /// `is_user` marks a CPL 3 data or code access; descriptor-table and TSS
    /// accesses are always supervisor accesses regardless of CPL.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<u32, PageFault> {
        if !self.paging_enabled() {
            return Ok(linear & self.a20_mask());
        }

        if let Some(entry) = self.tlb.lookup(linear).copied() {
            if let Err(pf) = self.check_perms(
                linear,
                !entry.supervisor_only(),
                !entry.read_only(),
                access,
                is_user,
            ) {
                self.cr2 = pf.addr;
                return Err(pf);
            }

            // Lazily set D on the first write hit.
            if access.is_write() && !entry.dirty() {
                let pte = bus.read_u32(entry.leaf_addr);
                bus.write_u32(entry.leaf_addr, pte | PTE_D);
                self.tlb.set_dirty(linear);
            }

            return Ok(entry.translate(linear) & self.a20_mask());
        }

        match self.walk(bus, linear, access, is_user) {
            Ok(entry) => {
                self.tlb.insert(entry);
                Ok(entry.translate(linear) & self.a20_mask())
            }
            Err(pf) => {
                self.cr2 = pf.addr;
                Err(pf)
            }
        }
    }

    /// Translate every page touched by a `len`-byte access at `linear`.
    ///
    /// Both pages of a page-crossing access are checked before the caller
    /// touches memory, so a fault on the second page leaves the first intact.
    pub fn translate_span(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        len: u8,
        access: AccessType,
        is_user: bool,
    ) -> Result<PhysSpan, PageFault> {
        let first = self.translate(bus, linear, access, is_user)?;
        let room = 0x1000 - (linear & 0xfff);
        if room >= len as u32 {
            return Ok(PhysSpan {
                first,
                first_len: len,
                second: first.wrapping_add(room),
            });
        }

        let next_page = (linear & !0xfff).wrapping_add(0x1000);
        let second = self.translate(bus, next_page, access, is_user)?;
        Ok(PhysSpan {
            first,
            first_len: room as u8,
            second,
        })
    }

    fn check_perms(
        &self,
        linear: u32,
        user_ok: bool,
        writable_ok: bool,
        access: AccessType,
        is_user: bool,
    ) -> Result<(), PageFault> {
        if is_user && !user_ok {
            return Err(PageFault::new(
                linear,
                pf_error_code(true, access, is_user, false),
            ));
        }

        if access.is_write() && !writable_ok && (is_user || self.wp_enabled()) {
            return Err(PageFault::new(
                linear,
                pf_error_code(true, access, is_user, false),
            ));
        }

        Ok(())
    }

    fn walk(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<TlbEntry, PageFault> {
        let pd_base = self.cr3 & !0xfff;
        let pde_addr = pd_base + ((linear >> 22) & 0x3ff) * 4;
        let pde = bus.read_u32(pde_addr);
        if pde & PTE_P == 0 {
            return Err(PageFault::new(
                linear,
                pf_error_code(false, access, is_user, false),
            ));
        }

        if pde & PTE_PS != 0 && self.pse_enabled() {
            if pde & PDE_4MB_RESERVED_MASK != 0 {
                return Err(PageFault::new(
                    linear,
                    pf_error_code(true, access, is_user, true),
                ));
            }

            let user_ok = pde & PTE_US != 0;
            let writable_ok = pde & PTE_RW != 0;
            self.check_perms(linear, user_ok, writable_ok, access, is_user)?;

            let new_pde = mark_used(pde, access);
            if new_pde != pde {
                bus.write_u32(pde_addr, new_pde);
            }

            let pbase = (pde & 0xffc0_0000) | (linear & 0x003f_f000);
            return Ok(TlbEntry::new(
                linear,
                pbase,
                TlbEntryAttributes {
                    read_only: !writable_ok,
                    supervisor_only: !user_ok,
                    dirty: new_pde & PTE_D != 0,
                    large: true,
                    leaf_addr: pde_addr,
                },
            ));
        }

        let pte_addr = (pde & !0xfff) + ((linear >> 12) & 0x3ff) * 4;
        let pte = bus.read_u32(pte_addr);
        if pte & PTE_P == 0 {
            return Err(PageFault::new(
                linear,
                pf_error_code(false, access, is_user, false),
            ));
        }

        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let writable_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(linear, user_ok, writable_ok, access, is_user)?;

        if pde & PTE_A == 0 {
            bus.write_u32(pde_addr, pde | PTE_A);
        }
        let new_pte = mark_used(pte, access);
        if new_pte != pte {
            bus.write_u32(pte_addr, new_pte);
        }

        Ok(TlbEntry::new(
            linear,
            pte & !0xfff,
            TlbEntryAttributes {
                read_only: !writable_ok,
                supervisor_only: !user_ok,
                dirty: new_pte & PTE_D != 0,
                large: false,
                leaf_addr: pte_addr,
            },
        ))
    }
}

/// Accessed on every successful walk, dirty only on a successful write.
#[inline]
fn mark_used(entry: u32, access: AccessType) -> u32 {
    let mut entry = entry | PTE_A;
    if access.is_write() {
        entry |= PTE_D;
    }
    entry
}
