use criterion::{Criterion, black_box, criterion_group, criterion_main};
use nftl_core::FtlStore;
use nftl_device::MemNandDevice;
use nftl_types::{EngineFlags, FtlConfig, HOST_PAGE_SIZE, Lpn};
use std::sync::Arc;

fn bench_store() -> FtlStore {
    let config = FtlConfig {
        nr_pools: 4,
        nr_blks_per_pool: 64,
        nr_pages_per_blk: 64,
        flags: EngineFlags::NO_WAITS,
        ..FtlConfig::default()
    };
    let geometry = config.geometry().unwrap();
    let device = Arc::new(MemNandDevice::new(geometry, 25, 500, 1500));
    FtlStore::new(config, device).unwrap()
}

fn write_read_cycle(c: &mut Criterion) {
    let page = vec![0x5A_u8; HOST_PAGE_SIZE];

    c.bench_function("write_page_sequential", |b| {
        let store = bench_store();
        let mut l = 0_u64;
        let span = store.nr_pages() / 2;
        b.iter(|| {
            store.write_page(Lpn(l % span), black_box(&page)).unwrap();
            l += 1;
        });
    });

    c.bench_function("overwrite_same_page", |b| {
        let store = bench_store();
        b.iter(|| {
            store.write_page(Lpn(7), black_box(&page)).unwrap();
        });
    });

    c.bench_function("read_page_hot", |b| {
        let store = bench_store();
        store.write_page(Lpn(3), &page).unwrap();
        let mut buf = vec![0_u8; HOST_PAGE_SIZE];
        b.iter(|| {
            store.read_page_into(Lpn(3), black_box(&mut buf)).unwrap();
        });
    });
}

criterion_group!(benches, write_read_cycle);
criterion_main!(benches);
