// Streaming cache hot-path benchmarks
//
// Scheduler churn, slot life-cycle transitions and cut swaps: the operations
// a render loop and its loader workers hit every frame.

use atlas_streamer::memory::SlotPool;
use atlas_streamer::streaming::{Cut, CutCamera, RequestScheduler, TileExtent, UpdateMode};
use atlas_streamer::TileId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Mat4;
use std::time::Duration;

const REQUEST_COUNTS: &[u64] = &[1_000, 10_000];

fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    for &count in REQUEST_COUNTS {
        group.bench_with_input(BenchmarkId::new("push_pop", count), &count, |b, &count| {
            b.iter(|| {
                let scheduler = RequestScheduler::new(UpdateMode::Always);
                for id in 0..count {
                    scheduler.push(TileId(id), (id * 7919 % 97) as i32, TileExtent::new(id * 64, 64));
                }
                while let Some(job) = scheduler.pop_highest(Duration::ZERO) {
                    black_box(scheduler.complete(job.handle));
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("escalate", count), &count, |b, &count| {
            let scheduler = RequestScheduler::new(UpdateMode::Always);
            for id in 0..count {
                scheduler.push(TileId(id), 0, TileExtent::new(id * 64, 64));
            }
            let mut priority = 0;
            b.iter(|| {
                priority += 1;
                for id in (0..count).step_by(10) {
                    black_box(scheduler.update(TileId(id), priority));
                }
            });
        });
    }

    group.finish();
}

fn bench_slot_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_pool");
    let pool: SlotPool = SlotPool::new(4096, 256);

    group.bench_function("acquire_publish_evict", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            if let Some(slot) = pool.acquire_free(Duration::ZERO, |_, _| {}) {
                let _ = pool.set_owner(slot, TileId(id));
                let _ = pool.publish(slot, 4096);
            }
        });
    });

    let slot = pool.acquire_free(Duration::ZERO, |_, _| {}).unwrap_or(0);
    let _ = pool.publish(slot, 4096);
    group.bench_function("pin_unpin", |b| {
        b.iter(|| {
            black_box(pool.begin_read(slot));
            let _ = pool.end_read(slot);
        });
    });

    group.finish();
}

fn bench_cut(c: &mut Criterion) {
    let cut = Cut::new(1.0);
    let camera = CutCamera::new(Mat4::IDENTITY, Mat4::perspective_rh(1.0, 1.5, 0.1, 100.0), 1080.0);

    c.bench_function("cut_commit_swap_1k_nodes", |b| {
        b.iter(|| {
            cut.set_camera(camera);
            cut.update_back(|back| back.visible.extend(0..1_000));
            cut.commit();
            black_box(cut.swap());
        });
    });
}

criterion_group!(benches, bench_scheduler, bench_slot_pool, bench_cut);
criterion_main!(benches);
