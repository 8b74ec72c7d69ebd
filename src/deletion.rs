// Frame countdown deletion queue
//
// Pipelines and transient resources cannot be destroyed while a prior
// frame's command buffers still reference them. Instead of a device
// wait-idle on the hot path, retired handles sit in this queue for
// SWAPCHAIN_IMAGES_COUNT frame epilogues and are destroyed once every
// frame that could have referenced them has drained.
use ash::vk;

use crate::memory::BlockRef;
use crate::SWAPCHAIN_IMAGES_COUNT;

/// A handle waiting on the countdown, tagged with enough information
/// for the engine to destroy it properly.
#[derive(Debug, Clone, PartialEq)]
pub enum RetiredResource {
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    /// A pooled block going back to its region's allocator.
    MemoryBlock(BlockRef),
}

struct ScheduledDestruction {
    sd_countdown: usize,
    sd_resource: RetiredResource,
}

/// The queue itself. One per engine, ticked once per frame epilogue.
pub struct DeletionQueue {
    dq_entries: Vec<ScheduledDestruction>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self {
            dq_entries: Vec::new(),
        }
    }

    /// Schedule `resource` for destruction SWAPCHAIN_IMAGES_COUNT frame
    /// epilogues from now.
    pub fn schedule(&mut self, resource: RetiredResource) {
        self.dq_entries.push(ScheduledDestruction {
            sd_countdown: SWAPCHAIN_IMAGES_COUNT,
            sd_resource: resource,
        });
    }

    /// Advance the queue by one frame.
    ///
    /// Entries whose countdown already reached zero are returned for
    /// destruction, then every remaining countdown is decremented. An
    /// entry scheduled during frame F therefore comes back during the
    /// epilogue of frame F + SWAPCHAIN_IMAGES_COUNT and not a frame
    /// earlier.
    pub fn tick(&mut self) -> Vec<RetiredResource> {
        let mut due = Vec::new();

        let mut i = 0;
        while i < self.dq_entries.len() {
            if self.dq_entries[i].sd_countdown == 0 {
                due.push(self.dq_entries.swap_remove(i).sd_resource);
            } else {
                self.dq_entries[i].sd_countdown -= 1;
                i += 1;
            }
        }

        due
    }

    /// Everything still pending, regardless of countdown. Used at
    /// teardown after a device wait-idle.
    pub fn drain_all(&mut self) -> Vec<RetiredResource> {
        self.dq_entries.drain(..).map(|e| e.sd_resource).collect()
    }

    pub fn len(&self) -> usize {
        self.dq_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dq_entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pipeline(raw: u64) -> RetiredResource {
        RetiredResource::Pipeline(vk::Pipeline::from_raw(raw))
    }

    #[test]
    fn countdown_destroys_exactly_after_swapchain_count_frames() {
        let mut dq = DeletionQueue::new();

        // scheduled during frame F
        dq.schedule(pipeline(1));

        // epilogue of F and F + 1: still alive, recording may reference it
        assert!(dq.tick().is_empty());
        assert!(dq.tick().is_empty());
        assert_eq!(dq.len(), 1);

        // epilogue of F + SWAPCHAIN_IMAGES_COUNT: destroyed
        assert_eq!(SWAPCHAIN_IMAGES_COUNT, 2);
        let due = dq.tick();
        assert_eq!(due, vec![pipeline(1)]);
        assert!(dq.is_empty());
    }

    #[test]
    fn entries_scheduled_on_different_frames_retire_independently() {
        let mut dq = DeletionQueue::new();

        dq.schedule(pipeline(1));
        assert!(dq.tick().is_empty());

        dq.schedule(pipeline(2));
        assert!(dq.tick().is_empty());

        // pipeline 1 is due now, pipeline 2 one frame later
        assert_eq!(dq.tick(), vec![pipeline(1)]);
        assert_eq!(dq.tick(), vec![pipeline(2)]);
        assert!(dq.is_empty());
    }

    #[test]
    fn drain_all_returns_everything_pending() {
        let mut dq = DeletionQueue::new();
        dq.schedule(pipeline(1));
        dq.schedule(RetiredResource::Buffer(vk::Buffer::from_raw(7)));
        dq.tick();

        let all = dq.drain_all();
        assert_eq!(all.len(), 2);
        assert!(dq.is_empty());
    }
}
