use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;

use stratadb::common::types::{PageId, Rid, SlotId};
use stratadb::storage::disk::DiskManager;
use stratadb::{BPlusTree, BufferPoolManager};

// Create a buffer pool over a temporary db file
fn create_bench_buffer_pool(pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let disk_manager = Arc::new(DiskManager::new(path).unwrap());

    // Keep the temp file alive for the whole run
    std::mem::forget(temp_file);

    Arc::new(BufferPoolManager::new(pool_size, disk_manager, None))
}

fn buffer_pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool");

    for size in [16usize, 128].iter() {
        group.bench_with_input(BenchmarkId::new("fetch_unpin", size), size, |b, &size| {
            let buffer_pool = create_bench_buffer_pool(size);
            let mut page_ids = Vec::new();
            for _ in 0..size * 2 {
                let (_, page_id) = buffer_pool.new_page().unwrap();
                buffer_pool.unpin_page(page_id, true).unwrap();
                page_ids.push(page_id);
            }

            let mut rng = rand::thread_rng();
            b.iter(|| {
                let page_id = *page_ids.choose(&mut rng).unwrap();
                let page = buffer_pool.fetch_page(page_id).unwrap();
                {
                    let guard = page.read();
                    std::hint::black_box(guard.data[0]);
                }
                buffer_pool.unpin_page(page_id, false).unwrap();
            });
        });
    }
    group.finish();
}

fn btree_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree");

    group.bench_function("insert_sequential", |b| {
        let buffer_pool = create_bench_buffer_pool(256);
        let tree = BPlusTree::<i64>::new("bench_insert", buffer_pool).unwrap();
        let mut key = 0i64;
        b.iter(|| {
            key += 1;
            tree.insert(key, Rid::new(key as PageId, key as SlotId)).unwrap();
        });
    });

    group.bench_function("get_value", |b| {
        let buffer_pool = create_bench_buffer_pool(256);
        let tree = BPlusTree::<i64>::new("bench_get", buffer_pool).unwrap();
        for key in 0..10_000i64 {
            tree.insert(key, Rid::new(key as PageId, key as SlotId)).unwrap();
        }
        let mut rng = rand::thread_rng();
        b.iter(|| {
            let key = rng.gen_range(0..10_000i64);
            std::hint::black_box(tree.get_value(&key).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, buffer_pool_benchmark, btree_benchmark);
criterion_main!(benches);
