use std::collections::HashMap;

use pcx_mmu::MemoryBus;
use tracing::trace;

use crate::fault::ConfigError;

const REGION_ALIGNMENT: u32 = 0x1000;
const PARAGRAPHS_PER_PAGE: usize = 0x1000 / 16;

/// One bit per 16-byte paragraph of a 4 KiB page.
pub type ParagraphBitmap = [u64; PARAGRAPHS_PER_PAGE / 64];

/// A memory-mapped device window.
pub trait MmioHandler {
    /// `offset` is relative to the start of the mapped window.
    fn read_u8(&mut self, offset: u32) -> u8;
    fn write_u8(&mut self, offset: u32, value: u8);
}

enum RegionKind {
    Rom(Vec<u8>),
    Mmio(Box<dyn MmioHandler>),
}

struct Region {
    base: u32,
    len: u32,
    kind: RegionKind,
}

impl Region {
    #[inline]
    fn offset_of(&self, paddr: u32) -> Option<u32> {
        let offset = paddr.wrapping_sub(self.base);
        (offset < self.len).then_some(offset)
    }
}

/// Physical address space: RAM from address 0, overlaid by ROM and MMIO windows.
///
/// Reads of unmapped addresses return all ones; writes to them (and to ROM) are dropped.
/// Every RAM write is reported to the [`CodeWatch`] so cached code can be invalidated.
pub struct PhysicalMemory {
    ram: Vec<u8>,
    regions: Vec<Region>,
    watch: CodeWatch,
}

impl PhysicalMemory {
    pub fn new(ram_size: usize) -> Result<Self, ConfigError> {
        if ram_size == 0 || ram_size as u64 > 1 << 32 || ram_size % REGION_ALIGNMENT as usize != 0
        {
            return Err(ConfigError::InvalidRamSize(ram_size));
        }
        Ok(Self {
            ram: vec![0; ram_size],
            regions: Vec::new(),
            watch: CodeWatch::default(),
        })
    }

    #[inline]
    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Copy host data into RAM (e.g. a boot image). Cached code over the range is invalidated.
    pub fn load_ram(&mut self, paddr: u32, data: &[u8]) -> Result<(), ConfigError> {
        let start = paddr as usize;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= self.ram.len())
            .ok_or(ConfigError::OutOfRange {
                base: paddr,
                len: data.len() as u64,
            })?;
        self.ram[start..end].copy_from_slice(data);
        for i in 0..data.len() as u32 {
            self.watch.on_write(paddr.wrapping_add(i));
        }
        Ok(())
    }

    /// Map a read-only image (BIOS, option ROM). It shadows any RAM below it.
    pub fn map_rom(&mut self, base: u32, image: Vec<u8>) -> Result<(), ConfigError> {
        let len = Self::check_geometry(base, image.len() as u64)?;
        self.insert_region(Region {
            base,
            len,
            kind: RegionKind::Rom(image),
        })
    }

    pub fn map_mmio(
        &mut self,
        base: u32,
        len: u32,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), ConfigError> {
        let len = Self::check_geometry(base, len as u64)?;
        self.insert_region(Region {
            base,
            len,
            kind: RegionKind::Mmio(handler),
        })
    }

    fn check_geometry(base: u32, len: u64) -> Result<u32, ConfigError> {
        if len == 0 || base as u64 + len > 1 << 32 {
            return Err(ConfigError::OutOfRange { base, len });
        }
        let len32 = len as u32;
        if base % REGION_ALIGNMENT != 0 || len32 % REGION_ALIGNMENT != 0 {
            return Err(ConfigError::Misaligned {
                base,
                len: len32,
                alignment: REGION_ALIGNMENT,
            });
        }
        Ok(len32)
    }

    fn insert_region(&mut self, region: Region) -> Result<(), ConfigError> {
        let new_end = region.base as u64 + region.len as u64;
        let overlaps = self.regions.iter().any(|r| {
            let end = r.base as u64 + r.len as u64;
            (region.base as u64) < end && (r.base as u64) < new_end
        });
        if overlaps {
            return Err(ConfigError::MemoryOverlap {
                base: region.base,
                len: region.len,
            });
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn code_watch(&self) -> &CodeWatch {
        &self.watch
    }

    pub fn code_watch_mut(&mut self) -> &mut CodeWatch {
        &mut self.watch
    }
}

impl MemoryBus for PhysicalMemory {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        for region in &mut self.regions {
            if let Some(offset) = region.offset_of(paddr) {
                return match &mut region.kind {
                    RegionKind::Rom(image) => image[offset as usize],
                    RegionKind::Mmio(handler) => handler.read_u8(offset),
                };
            }
        }
        self.ram.get(paddr as usize).copied().unwrap_or(0xff)
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        for region in &mut self.regions {
            if let Some(offset) = region.offset_of(paddr) {
                if let RegionKind::Mmio(handler) = &mut region.kind {
                    handler.write_u8(offset, value);
                }
                return;
            }
        }
        if let Some(slot) = self.ram.get_mut(paddr as usize) {
            *slot = value;
            self.watch.on_write(paddr);
        }
    }
}

/// Tracks writes to physical pages that hold cached code.
///
/// Each watched page carries a bitmap with one bit per 16-byte paragraph. The block currently
/// executing is registered as a physical range; a write to any paragraph it touches raises the
/// abort flag.
#[derive(Debug, Default)]
pub struct CodeWatch {
    pages: HashMap<u32, ParagraphBitmap>,
    executing: Option<(u32, u32)>,
    abort: bool,
}

impl CodeWatch {
    pub fn watch_page(&mut self, page: u32) {
        self.pages.entry(page).or_default();
    }

    pub fn unwatch_page(&mut self, page: u32) {
        self.pages.remove(&page);
    }

    pub fn is_watched(&self, page: u32) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.executing = None;
        self.abort = false;
    }

    #[inline]
    pub fn on_write(&mut self, paddr: u32) {
        if let Some(bits) = self.pages.get_mut(&(paddr >> 12)) {
            let paragraph = ((paddr >> 4) & 0xff) as usize;
            bits[paragraph / 64] |= 1 << (paragraph % 64);
        }
        if let Some((start, end)) = self.executing {
            let paragraph = paddr >> 4;
            let first = start >> 4;
            let last = end.saturating_sub(1).max(start) >> 4;
            if (first..=last).contains(&paragraph) && !self.abort {
                trace!(paddr, "write into executing code block");
                self.abort = true;
            }
        }
    }

    /// Take and clear the dirty-paragraph bitmap of `page`, if any paragraph is dirty.
    pub fn take_dirty(&mut self, page: u32) -> Option<ParagraphBitmap> {
        let bits = self.pages.get_mut(&page)?;
        if bits.iter().all(|word| *word == 0) {
            return None;
        }
        Some(std::mem::take(bits))
    }

    /// Mark `[start, end)` as the physical range of the block about to run.
    pub fn begin_block(&mut self, start: u32, end: u32) {
        self.executing = Some((start, end));
        self.abort = false;
    }

    pub fn end_block(&mut self) {
        self.executing = None;
    }

    /// Whether a write hit the executing block since the last call; clears the flag.
    pub fn take_abort(&mut self) -> bool {
        std::mem::take(&mut self.abort)
    }
}

/// Whether any paragraph of `[start, end)` (physical, within one page) is set in `bits`.
pub fn range_is_dirty(bits: &ParagraphBitmap, start: u32, end: u32) -> bool {
    if end <= start {
        return false;
    }
    let first = ((start >> 4) & 0xff) as usize;
    let last = (((end - 1) >> 4) & 0xff) as usize;
    (first..=last).any(|p| bits[p / 64] & (1 << (p % 64)) != 0)
}
