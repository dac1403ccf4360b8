/// Cut: per-frame consistency record
///
/// Three copies of the same state: the producer mutates `back`, `commit`
/// moves the finished back into `pending`, and the consumer's `swap` moves
/// pending into `front`. Producer and consumer only ever meet on the
/// `pending` lock, and a swap exchanges whole copies, so the consumer sees
/// every field of one commit together or none of them.
///
/// Lock order is always `back -> pending` or `front -> pending`.

use glam::{Mat4, Vec3};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::TileId;

/// Node of the consumer's hierarchy (tile tree, bounding-volume tree)
pub type NodeId = u64;

/// Camera as seen by the consumer for one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutCamera {
    pub view: Mat4,
    pub projection: Mat4,
    /// Viewport height divided by the near-plane height, converts
    /// projected object-space error into pixels
    pub viewport_scale: f32,
}

impl Default for CutCamera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            viewport_scale: 1.0,
        }
    }
}

impl CutCamera {
    pub fn new(view: Mat4, projection: Mat4, viewport_height: f32) -> Self {
        // projection.y_axis.y = 2n / (top - bottom) for a standard perspective
        let viewport_scale = viewport_height * projection.y_axis.y * 0.5;
        Self { view, projection, viewport_scale }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// World-space eye position
    pub fn position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }
}

/// One complete copy of the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutState {
    pub camera: CutCamera,
    pub transform: Mat4,
    pub visible: BTreeSet<NodeId>,
    pub threshold: f32,
    pub used: BTreeSet<TileId>,
    pub rendered: bool,
    /// Commit that produced this copy, 0 before the first commit
    pub commit_seq: u64,
    /// Set by `commit`, cleared when the consumer acknowledges this copy
    /// as its front
    #[serde(skip)]
    modified: bool,
}

impl CutState {
    pub fn new(threshold: f32) -> Self {
        Self {
            camera: CutCamera::default(),
            transform: Mat4::IDENTITY,
            visible: BTreeSet::new(),
            threshold,
            used: BTreeSet::new(),
            rendered: false,
            commit_seq: 0,
            modified: false,
        }
    }

    pub fn is_visible(&self, node: NodeId) -> bool {
        self.visible.contains(&node)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Fresh copy for the next update cycle: scalars carry over, per-frame
    /// sets start empty
    fn next_cycle(&self) -> Self {
        Self {
            camera: self.camera,
            transform: self.transform,
            threshold: self.threshold,
            commit_seq: self.commit_seq,
            ..Self::new(self.threshold)
        }
    }
}

impl Default for CutState {
    fn default() -> Self {
        Self::new(0.0)
    }
}

pub struct Cut {
    back: Mutex<CutState>,
    pending: Mutex<CutState>,
    front: RwLock<CutState>,
    swap_required: AtomicBool,
    commits: AtomicU64,
}

impl Cut {
    pub fn new(threshold: f32) -> Self {
        Self {
            back: Mutex::new(CutState::new(threshold)),
            pending: Mutex::new(CutState::new(threshold)),
            front: RwLock::new(CutState::new(threshold)),
            swap_required: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        }
    }

    // Producer side

    pub fn set_camera(&self, camera: CutCamera) {
        self.back.lock().camera = camera;
    }

    pub fn set_transform(&self, transform: Mat4) {
        self.back.lock().transform = transform;
    }

    pub fn set_visible(&self, node: NodeId, visible: bool) {
        let mut back = self.back.lock();
        if visible {
            back.visible.insert(node);
        } else {
            back.visible.remove(&node);
        }
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.back.lock().threshold = threshold;
    }

    pub fn mark_used(&self, tile: TileId) {
        self.back.lock().used.insert(tile);
    }

    pub fn set_rendered(&self, rendered: bool) {
        self.back.lock().rendered = rendered;
    }

    /// Several back mutations under one lock
    pub fn update_back<R>(&self, f: impl FnOnce(&mut CutState) -> R) -> R {
        f(&mut self.back.lock())
    }

    pub fn back_snapshot(&self) -> CutState {
        self.back.lock().clone()
    }

    /// Publish the back copy for the consumer's next swap. An earlier commit
    /// that was never swapped in is superseded. Returns the commit number.
    pub fn commit(&self) -> u64 {
        let seq = self.commits.fetch_add(1, Ordering::AcqRel) + 1;
        let mut back = self.back.lock();
        back.commit_seq = seq;
        back.modified = true;

        {
            let mut pending = self.pending.lock();
            mem::swap(&mut *back, &mut *pending);
            self.swap_required.store(true, Ordering::Release);
            *back = pending.next_cycle();
        }

        log::trace!("[Cut::commit] commit {}", seq);
        seq
    }

    // Consumer side

    /// Bring the latest commit to the front. O(1); returns false when nothing
    /// was committed since the last swap.
    pub fn swap(&self) -> bool {
        let mut front = self.front.write();
        let mut pending = self.pending.lock();
        if !self.swap_required.swap(false, Ordering::AcqRel) {
            return false;
        }
        mem::swap(&mut *front, &mut *pending);
        true
    }

    pub fn front(&self) -> RwLockReadGuard<'_, CutState> {
        self.front.read()
    }

    pub fn front_snapshot(&self) -> CutState {
        self.front.read().clone()
    }

    pub fn is_swap_required(&self) -> bool {
        self.swap_required.load(Ordering::Acquire)
    }

    /// Whether the current front was swapped in since the consumer last
    /// acknowledged it
    pub fn is_front_modified(&self) -> bool {
        self.front.read().modified
    }

    /// Clears the flag on the front copy only; a commit still waiting for
    /// its swap keeps its own
    pub fn acknowledge_front(&self) {
        self.front.write().modified = false;
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }
}

impl Default for Cut {
    fn default() -> Self {
        Self::new(0.0)
    }
}
