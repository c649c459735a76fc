#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use pcx_mmu::{AccessType, MemoryBus, Mmu, CR0_PE, CR0_PG};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("PCX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct BenchMemory {
    data: Vec<u8>,
}

#[cfg(not(target_arch = "wasm32"))]
impl MemoryBus for BenchMemory {
    #[inline]
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.data[paddr as usize]
    }

    #[inline]
    fn write_u8(&mut self, paddr: u32, value: u8) {
        self.data[paddr as usize] = value;
    }
}

/// Identity-maps the first 4MiB with one page table at 0x2000.
#[cfg(not(target_arch = "wasm32"))]
fn setup() -> (Mmu, BenchMemory) {
    let mut mem = BenchMemory {
        data: vec![0; 0x4000],
    };
    mem.write_u32(0x1000, 0x2000 | 0x7);
    for i in 0..1024u32 {
        mem.write_u32(0x2000 + i * 4, (i << 12) | 0x7);
    }

    let mut mmu = Mmu::new();
    mmu.set_a20(true);
    mmu.set_cr3(0x1000);
    mmu.set_cr0(CR0_PE | CR0_PG);
    (mmu, mem)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb(c: &mut Criterion) {
    const PAGES: u32 = 256;

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(PAGES as u64));

    group.bench_function("hit_read", |b| {
        let (mut mmu, mut mem) = setup();
        for page in 0..PAGES {
            mmu.translate(&mut mem, page << 12, AccessType::Read, false)
                .unwrap();
        }
        b.iter(|| {
            for page in 0..PAGES {
                black_box(
                    mmu.translate(&mut mem, black_box(page << 12 | 0x10), AccessType::Read, false)
                        .unwrap(),
                );
            }
        })
    });

    group.bench_function("miss_walk", |b| {
        let (mut mmu, mut mem) = setup();
        b.iter(|| {
            mmu.flush_tlb();
            for page in 0..PAGES {
                black_box(
                    mmu.translate(&mut mem, black_box(page << 12), AccessType::Read, false)
                        .unwrap(),
                );
            }
        })
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
