use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::Frame;

/// Most recent frame per camera, for whoever draws the live view.
pub struct PreviewBoard {
    slots: Vec<ArcSwapOption<Frame>>,
}

impl PreviewBoard {
    pub fn new(cameras: usize) -> Self {
        Self {
            slots: (0..cameras).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    pub fn publish(&self, camera: usize, frame: Arc<Frame>) {
        if let Some(slot) = self.slots.get(camera) {
            slot.store(Some(frame));
        }
    }

    pub fn latest(&self, camera: usize) -> Option<Arc<Frame>> {
        self.slots.get(camera)?.load_full()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
