use atlas_streamer::streaming::{CutCamera, CutKey, MmapStore, UniformResolver};
use atlas_streamer::{StreamCache, StreamConfig, TileId};
use glam::{Mat4, Vec3};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const TILE_BYTES: u64 = 64 * 1024;
const TILE_COUNT: u64 = 512;
const FRAMES: u64 = 600;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Atlas Streamer - Out-of-Core Streaming Test");
    println!("===========================================");

    let path = std::env::temp_dir().join(format!("atlas-streamer-{}.atlas", std::process::id()));
    write_atlas(&path)?;
    let result = run(&path);
    std::fs::remove_file(&path)?;
    result
}

/// Tiles filled with a byte pattern derived from their id
fn write_atlas(path: &Path) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for id in 0..TILE_COUNT {
        let tile = vec![(id % 251) as u8; TILE_BYTES as usize];
        writer.write_all(&tile)?;
    }
    writer.flush()?;
    println!("Atlas: {} tiles x {} KiB at {}", TILE_COUNT, TILE_BYTES / 1024, path.display());
    Ok(())
}

fn run(path: &Path) -> anyhow::Result<()> {
    let config = StreamConfig {
        slot_size: TILE_BYTES as usize,
        slot_count: 64,
        ..StreamConfig::default()
    };
    let cache = StreamCache::new(config, UniformResolver::new(0, TILE_BYTES, TILE_COUNT), MmapStore::open(path)?)?;

    let context = cache.cuts().register_context()?;
    let view = cache.cuts().register_view()?;
    let model = cache.cuts().register_model()?;
    let key = CutKey::new(context, view, model);
    let running = AtomicBool::new(true);
    let start = Instant::now();

    thread::scope(|scope| -> anyhow::Result<()> {
        // Update thread: pick the visible window and publish it through the cut
        let producer = scope.spawn(|| {
            let cut = cache.cut(key);
            let mut frame = 0u64;
            while running.load(Ordering::Acquire) {
                let eye = Vec3::new(frame as f32, 10.0, 0.0);
                let view = Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y);
                cut.set_camera(CutCamera::new(view, Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 500.0), 1080.0));
                cut.update_back(|back| back.visible.extend((frame..frame + 48).map(|node| node % TILE_COUNT)));
                cut.commit();
                frame += 1;
                thread::sleep(Duration::from_millis(2));
            }
        });

        // Render thread: swap, request what the front says is visible, report usage
        let render = || -> anyhow::Result<u64> {
            let cut = cache.cut(key);
            let mut corrupt = 0u64;
            let mut visible: Vec<u64> = Vec::new();
            for _ in 0..FRAMES {
                cache.swap(key);
                // Re-read the visible set only when a new front came in
                if cut.is_front_modified() {
                    visible = cut.front().visible.iter().copied().collect();
                    cut.acknowledge_front();
                }

                let mut used = Vec::new();
                for (rank, &node) in visible.iter().enumerate() {
                    let id = TileId(node);
                    if let Some(tile) = cache.get(id, (visible.len() - rank) as i32)? {
                        if tile.iter().any(|&b| b != (node % 251) as u8) {
                            corrupt += 1;
                        }
                        used.push(id);
                    }
                }
                cache.feedback(&used);
                thread::sleep(Duration::from_millis(1));
            }
            Ok(corrupt)
        };
        let rendered = render();

        running.store(false, Ordering::Release);
        producer.join().map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
        let corrupt = rendered?;
        anyhow::ensure!(corrupt == 0, "{} corrupt tiles observed", corrupt);
        Ok(())
    })?;

    let stats = cache.stats();
    println!("\nFrames: {} in {:.2?}", FRAMES, start.elapsed());
    println!("Hit rate: {:.1}% ({} hits, {} misses)", stats.hit_rate() * 100.0, stats.hits, stats.misses);
    println!("Loads: {} ({} MiB), evictions: {}", stats.loads, stats.bytes_loaded / (1024 * 1024), stats.evictions);
    println!("Retries: {}, failures: {}, discarded: {}", stats.retries, stats.failures, stats.discarded);
    println!("Slots: {:?}", stats.pool);

    for failure in cache.take_failures() {
        log::warn!("tile {} failed: {}", failure.id, failure.error);
    }
    cache.cuts().remove_context(context);

    println!("\nStreaming test complete");
    Ok(())
}
