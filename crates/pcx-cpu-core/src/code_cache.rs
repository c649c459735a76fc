//! Physical-page-indexed cache of decoded code blocks.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use pcx_mmu::MemoryBus;
use tracing::trace;

use crate::bus::{range_is_dirty, ParagraphBitmap, PhysicalMemory};
use crate::decoder::{decode_run, DecodeFailure, Insn};
use crate::flags::CpuModel;

/// Bytes read ahead when decoding a new block.
const FETCH_WINDOW: u32 = 512;

/// An immutable run of decoded instructions starting at a physical address.
///
/// Blocks never extend past the end of the 4 KiB page they start in.
#[derive(Debug)]
pub struct CodeBlock {
    start: u32,
    end: u32,
    code32: bool,
    insns: Vec<Insn>,
    last_used: Cell<Instant>,
}

impl CodeBlock {
    pub(crate) fn new(start: u32, code32: bool, insns: Vec<Insn>) -> Self {
        let len: u32 = insns.iter().map(|insn| insn.len).sum();
        Self {
            start,
            end: start.wrapping_add(len),
            code32,
            insns,
            last_used: Cell::new(Instant::now()),
        }
    }

    /// First physical byte.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last physical byte.
    #[inline]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[inline]
    pub fn code32(&self) -> bool {
        self.code32
    }

    #[inline]
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn last_used(&self) -> Instant {
        self.last_used.get()
    }

    fn touch(&self) {
        self.last_used.set(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Blocks evicted because their bytes were written.
    pub invalidations: u64,
    /// Blocks evicted by [`CodeCache::sweep_unused`].
    pub swept: u64,
}

/// Decoded blocks keyed by physical page, then by `offset << 1 | code32`.
#[derive(Debug)]
pub struct CodeCache {
    model: CpuModel,
    pages: HashMap<u32, HashMap<u32, Rc<CodeBlock>>>,
    stats: CacheStats,
}

#[inline]
fn block_key(paddr: u32, code32: bool) -> u32 {
    ((paddr & 0xfff) << 1) | code32 as u32
}

impl CodeCache {
    pub fn new(model: CpuModel) -> Self {
        Self {
            model,
            pages: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.pages.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The block starting at `paddr`, decoding it on a miss.
    ///
    /// Pending writes to the page are applied first: every block overlapping a written
    /// paragraph is dropped, so the returned block always reflects current memory.
    pub fn fetch(
        &mut self,
        mem: &mut PhysicalMemory,
        paddr: u32,
        code32: bool,
    ) -> Result<Rc<CodeBlock>, DecodeFailure> {
        let page = paddr >> 12;
        if let Some(dirty) = mem.code_watch_mut().take_dirty(page) {
            self.evict_dirty(mem, page, &dirty);
        }

        let key = block_key(paddr, code32);
        if let Some(block) = self.pages.get(&page).and_then(|blocks| blocks.get(&key)) {
            self.stats.hits += 1;
            block.touch();
            return Ok(Rc::clone(block));
        }

        self.stats.misses += 1;
        let window = FETCH_WINDOW.min(0x1000 - (paddr & 0xfff));
        let mut bytes = vec![0u8; window as usize];
        mem.read_bytes(paddr, &mut bytes);
        let insns = decode_run(&bytes, paddr, code32, self.model)?;
        let block = Rc::new(CodeBlock::new(paddr, code32, insns));

        mem.code_watch_mut().watch_page(page);
        self.pages
            .entry(page)
            .or_default()
            .insert(key, Rc::clone(&block));
        Ok(block)
    }

    fn evict_dirty(&mut self, mem: &mut PhysicalMemory, page: u32, dirty: &ParagraphBitmap) {
        let Some(blocks) = self.pages.get_mut(&page) else {
            return;
        };
        let before = blocks.len();
        blocks.retain(|_, block| !range_is_dirty(dirty, block.start, block.end));
        let evicted = before - blocks.len();
        if evicted > 0 {
            trace!(page, evicted, "evicted modified code blocks");
            self.stats.invalidations += evicted as u64;
        }
        if blocks.is_empty() {
            self.pages.remove(&page);
            mem.code_watch_mut().unwatch_page(page);
        }
    }

    /// Drop every block (reset, or a change that invalidates all decoding).
    pub fn invalidate_all(&mut self, mem: &mut PhysicalMemory) {
        self.pages.clear();
        mem.code_watch_mut().clear();
    }

    /// Evict blocks not used within `window` of `now`. Returns how many were evicted.
    pub fn sweep_unused(&mut self, mem: &mut PhysicalMemory, now: Instant, window: Duration) -> usize {
        let mut evicted = 0;
        self.pages.retain(|page, blocks| {
            let before = blocks.len();
            blocks.retain(|_, block| now.saturating_duration_since(block.last_used()) <= window);
            evicted += before - blocks.len();
            if blocks.is_empty() {
                mem.code_watch_mut().unwatch_page(*page);
                false
            } else {
                true
            }
        });
        if evicted > 0 {
            trace!(evicted, "swept unused code blocks");
        }
        self.stats.swept += evicted as u64;
        evicted
    }
}
