use atlas_streamer::streaming::{ContextId, CutCamera, CutDatabase, CutKey, ModelId, ViewId};
use glam::{Mat4, Vec3};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn camera(step: u64) -> CutCamera {
    CutCamera::new(
        Mat4::from_translation(Vec3::new(step as f32, 0.0, 0.0)),
        Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 1000.0),
        1080.0,
    )
}

#[test]
fn test_swap_during_next_cycle_shows_first_commit() {
    let database = CutDatabase::new(1.0);
    let key = CutKey::new(ContextId(0), ViewId(0), ModelId(0));
    let cut = database.cut(key);

    cut.set_camera(camera(1));
    for node in [10, 11, 12] {
        cut.set_visible(node, true);
    }
    cut.commit();

    // Producer is halfway through the next cycle
    cut.set_camera(camera(2));
    cut.set_visible(13, true);

    assert!(database.swap(key));
    let front = cut.front_snapshot();
    assert_eq!(front.camera, camera(1));
    assert_eq!(front.visible.iter().copied().collect::<Vec<_>>(), vec![10, 11, 12]);
}

#[test]
fn test_consumer_never_sees_mixed_cycles() {
    let database = CutDatabase::new(1.0);
    let key = CutKey::new(ContextId(1), ViewId(2), ModelId(3));
    let cut = database.cut(key);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let producer = scope.spawn(|| {
            for step in 1..=2_000u64 {
                // Every field of one cycle encodes the same step
                cut.set_camera(camera(step));
                cut.set_threshold(step as f32);
                cut.set_transform(Mat4::from_scale(Vec3::splat(step as f32)));
                for node in 0..3 {
                    cut.set_visible(step * 10 + node, true);
                }
                cut.commit();
            }
            done.store(true, Ordering::Release);
        });

        let mut swaps = 0;
        while !done.load(Ordering::Acquire) || cut.is_swap_required() {
            if !database.swap(key) {
                continue;
            }
            swaps += 1;
            let front = cut.front();
            let step = front.threshold as u64;
            assert_eq!(front.camera, camera(step));
            assert_eq!(front.transform, Mat4::from_scale(Vec3::splat(step as f32)));
            assert_eq!(
                front.visible.iter().copied().collect::<Vec<_>>(),
                vec![step * 10, step * 10 + 1, step * 10 + 2]
            );
            assert_eq!(front.commit_seq, step);
        }

        producer.join().expect("producer joins");
        assert!(swaps > 0);
    });

    assert_eq!(cut.front().commit_seq, 2_000);
}

#[test]
fn test_contexts_are_independent() {
    let database = CutDatabase::default();
    let a = CutKey::new(ContextId(0), ViewId(0), ModelId(0));
    let b = CutKey::new(ContextId(1), ViewId(0), ModelId(0));

    database.cut(a).set_threshold(5.0);
    database.cut(a).commit();
    database.cut(b).commit();

    assert_eq!(database.swap_context(ContextId(0)), 1);
    assert_eq!(database.cut(a).front().threshold, 5.0);
    assert!(database.cut(b).is_swap_required());
    assert_eq!(database.remove_context(ContextId(1)), 1);
    assert!(database.get(b).is_none());
}
