use super::*;

use core::convert::TryInto;

#[derive(Clone)]
struct TestMemory {
    data: Vec<u8>,
    reads: usize,
    writes: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
            writes: 0,
        }
    }

    fn write_u32_raw(&mut self, paddr: u32, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32_raw(&self, paddr: u32) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.reads += 1;
        self.data[paddr as usize]
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        self.writes += 1;
        self.data[paddr as usize] = value;
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        self.reads += 1;
        self.read_u32_raw(paddr)
    }

    fn write_u32(&mut self, paddr: u32, value: u32) {
        self.writes += 1;
        self.write_u32_raw(paddr, value);
    }
}

const PD: u32 = 0x1000;
const PT: u32 = 0x2000;

/// Maps linear 0x0040_0000.. through PT and enables paging.
fn paged_mmu(mem: &mut TestMemory, pde_flags: u32, pte_flags: u32) -> Mmu {
    mem.write_u32_raw(PD + 4, PT | pde_flags);
    mem.write_u32_raw(PT, 0x5000 | pte_flags);
    mem.write_u32_raw(PT + 4, 0x9000 | pte_flags);

    let mut mmu = Mmu::new();
    mmu.set_a20(true);
    mmu.set_cr3(PD);
    mmu.set_cr0(CR0_PE | CR0_PG);
    mmu
}

#[test]
fn memory_bus_is_implemented_for_mut_refs() {
    fn read_through<B: MemoryBus>(mut bus: B, paddr: u32) -> u8 {
        bus.read_u8(paddr)
    }

    let mut mem = TestMemory::new(0x10);
    mem.data[0] = 0xaa;
    assert_eq!(read_through(&mut mem, 0), 0xaa);
    assert_eq!(mem.reads, 1);
}

#[test]
fn no_paging_is_identity_with_a20_mask() {
    let mut mem = TestMemory::new(0x10);
    let mut mmu = Mmu::new();

    assert_eq!(
        mmu.translate(&mut mem, 0x0010_0010, AccessType::Read, false),
        Ok(0x0000_0010)
    );

    mmu.set_a20(true);
    assert_eq!(
        mmu.translate(&mut mem, 0x0010_0010, AccessType::Read, false),
        Ok(0x0010_0010)
    );
    assert_eq!(mem.reads, 0);
}

#[test]
fn walk_sets_accessed_and_dirty_bits() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    let paddr = mmu
        .translate(&mut mem, 0x0040_0123, AccessType::Read, false)
        .unwrap();
    assert_eq!(paddr, 0x5123);
    assert_ne!(mem.read_u32_raw(PD + 4) & PTE_A, 0);
    assert_ne!(mem.read_u32_raw(PT) & PTE_A, 0);
    assert_eq!(mem.read_u32_raw(PT) & PTE_D, 0);

    // The write hits the TLB entry created by the read and sets D lazily.
    mmu.translate(&mut mem, 0x0040_0123, AccessType::Write, false)
        .unwrap();
    assert_ne!(mem.read_u32_raw(PT) & PTE_D, 0);

    let writes = mem.writes;
    mmu.translate(&mut mem, 0x0040_0200, AccessType::Write, false)
        .unwrap();
    assert_eq!(mem.writes, writes, "D already cached, no extra PTE write");
}

#[test]
fn not_present_fault_latches_cr2() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    let err = mmu
        .translate(&mut mem, 0x0080_0004, AccessType::Write, true)
        .unwrap_err();
    assert_eq!(err.addr, 0x0080_0004);
    assert_eq!(err.error_code, PF_WRITE | PF_USER);
    assert_eq!(mmu.cr2(), 0x0080_0004);
}

#[test]
fn user_access_to_supervisor_page_faults() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW);

    assert_eq!(
        mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false),
        Ok(0x5000)
    );
    let err = mmu
        .translate(&mut mem, 0x0040_0000, AccessType::Read, true)
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_USER);
}

#[test]
fn read_only_page_faults_user_writes_and_supervisor_writes_only_with_wp() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_US);

    let err = mmu
        .translate(&mut mem, 0x0040_0000, AccessType::Write, true)
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_WRITE | PF_USER);

    assert!(mmu
        .translate(&mut mem, 0x0040_0000, AccessType::Write, false)
        .is_ok());

    mmu.set_cr0(mmu.cr0() | CR0_WP);
    let err = mmu
        .translate(&mut mem, 0x0040_0000, AccessType::Write, false)
        .unwrap_err();
    assert_eq!(err.error_code, PF_PRESENT | PF_WRITE);
}

#[test]
fn repeated_translation_reuses_the_same_tlb_entry() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    let first = mmu
        .translate(&mut mem, 0x0040_1010, AccessType::Read, false)
        .unwrap();
    let entry = mmu.tlb_entry(0x0040_1010).expect("cached");
    let reads = mem.reads;

    let second = mmu
        .translate(&mut mem, 0x0040_1010, AccessType::Read, false)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(mmu.tlb_entry(0x0040_1010), Some(entry));
    assert_eq!(mem.reads, reads, "TLB hit performs no page walk");

    assert_eq!(entry.phys_base(), 0x9000);
    assert!(!entry.read_only());
    assert!(!entry.supervisor_only());
}

#[test]
fn cr3_write_and_paging_toggle_flush_the_tlb() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false)
        .unwrap();
    assert!(mmu.tlb_entry(0x0040_0000).is_some());

    mmu.set_cr3(PD);
    assert!(mmu.tlb_entry(0x0040_0000).is_none());

    mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false)
        .unwrap();
    mmu.set_cr0(CR0_PE);
    assert!(mmu.tlb_entry(0x0040_0000).is_none());
}

#[test]
fn invlpg_drops_a_single_page() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false)
        .unwrap();
    mmu.translate(&mut mem, 0x0040_1000, AccessType::Read, false)
        .unwrap();

    // Remap page 0 behind the TLB's back; only INVLPG makes it visible.
    mem.write_u32_raw(PT, 0x7000 | PTE_P | PTE_RW | PTE_US);
    assert_eq!(
        mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false),
        Ok(0x5000)
    );

    mmu.invlpg(0x0040_0fff);
    assert_eq!(
        mmu.translate(&mut mem, 0x0040_0000, AccessType::Read, false),
        Ok(0x7000)
    );
    assert!(mmu.tlb_entry(0x0040_1000).is_some());
}

#[test]
fn pse_maps_4mb_pages() {
    let mut mem = TestMemory::new(0x10000);
    mem.write_u32_raw(PD + 8, 0x0c00_0000 | PTE_P | PTE_RW | PTE_PS);

    let mut mmu = Mmu::new();
    mmu.set_a20(true);
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr3(PD);
    mmu.set_cr0(CR0_PE | CR0_PG);

    assert_eq!(
        mmu.translate(&mut mem, 0x0092_3456, AccessType::Write, false),
        Ok(0x0c12_3456)
    );
    let pde = mem.read_u32_raw(PD + 8);
    assert_ne!(pde & PTE_A, 0);
    assert_ne!(pde & PTE_D, 0);

    mmu.invlpg(0x0080_0000);
    assert!(mmu.tlb_entry(0x0092_3456).is_none());
}

#[test]
fn page_crossing_span_checks_both_pages_first() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);

    let span = mmu
        .translate_span(&mut mem, 0x0040_0ffe, 4, AccessType::Write, false)
        .unwrap();
    assert!(span.is_split(4));
    assert_eq!(span.byte(0), 0x5ffe);
    assert_eq!(span.byte(1), 0x5fff);
    assert_eq!(span.byte(2), 0x9000);
    assert_eq!(span.byte(3), 0x9001);

    // Second page not present: the fault names the second page.
    let err = mmu
        .translate_span(&mut mem, 0x0040_1ffe, 4, AccessType::Read, false)
        .unwrap_err();
    assert_eq!(err.addr, 0x0040_2000);
}

#[test]
fn a20_is_applied_after_paging() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);
    mem.write_u32_raw(PT + 8, 0x0010_3000 | PTE_P | PTE_RW | PTE_US);

    assert_eq!(
        mmu.translate(&mut mem, 0x0040_2004, AccessType::Read, false),
        Ok(0x0010_3004)
    );
    mmu.set_a20(false);
    assert_eq!(
        mmu.translate(&mut mem, 0x0040_2004, AccessType::Read, false),
        Ok(0x0000_3004)
    );
}

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn translation_is_stable_without_state_changes(offset in 0u32..0x2000, write in any::<bool>()) {
            let mut mem = TestMemory::new(0x10000);
            let mut mmu = paged_mmu(&mut mem, PTE_P | PTE_RW | PTE_US, PTE_P | PTE_RW | PTE_US);
            let access = if write { AccessType::Write } else { AccessType::Read };
            let linear = 0x0040_0000 + offset;

            let a = mmu.translate(&mut mem, linear, access, true).unwrap();
            let entry = mmu.tlb_entry(linear);
            let b = mmu.translate(&mut mem, linear, access, true).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(mmu.tlb_entry(linear), entry);
        }
    }
}
