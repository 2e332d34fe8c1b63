use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reportvault::{generate_master_key, MemoryStore, StoreOptions, Vault};

fn benchmark_store_reveal(c: &mut Criterion) {
    let mut group = c.benchmark_group("vault");

    // Setup vault once; the first store creates the data key.
    let vault = Vault::with_master_key(generate_master_key().unwrap(), Arc::new(MemoryStore::new()));

    let sizes = [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)];

    for (name, size) in sizes {
        let payload = vec![0u8; size];
        let pointer = vault
            .store_bytes("bench-report", name, &payload, StoreOptions::default())
            .unwrap()
            .pointer();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("store", name), &payload, |b, payload| {
            b.iter(|| {
                let item = vault
                    .store_bytes(
                        black_box("bench-report"),
                        black_box("field"),
                        black_box(payload),
                        StoreOptions::default(),
                    )
                    .unwrap();
                // Keep the store from growing across iterations.
                vault.delete_by_id(&item.id).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("reveal", name), &pointer, |b, pointer| {
            b.iter(|| vault.reveal(black_box(pointer)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_cold_reveal(c: &mut Criterion) {
    // Reveal right after a cache reset: includes unwrapping the data key.
    let vault = Vault::with_master_key(generate_master_key().unwrap(), Arc::new(MemoryStore::new()));
    let pointer = vault
        .store_string("bench-report", "phone", "06 12 34 56 78", StoreOptions::default())
        .unwrap()
        .pointer();

    c.bench_function("reveal_cold_cache", |b| {
        b.iter(|| {
            vault.key_store().reset_cache();
            vault.reveal(black_box(&pointer)).unwrap()
        });
    });
}

criterion_group!(benches, benchmark_store_reveal, benchmark_cold_reveal);
criterion_main!(benches);
