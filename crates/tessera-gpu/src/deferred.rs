//! Deferred destruction of native GPU objects.
//!
//! Resource handles are reference counted. When the last owner drops, the
//! native object may still be referenced by recorded or in-flight GPU work, so
//! it is retired into this queue instead of being destroyed. The device drains
//! the queue after a queue-wide flush, when all work submitted up to that point
//! is known to be complete.

use std::collections::VecDeque;

use ash::vk;

/// A native object waiting for destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetiredResource {
    /// A buffer and its memory.
    Buffer(vk::Buffer),
    /// An image, its default view and its memory.
    Image { image: vk::Image, view: vk::ImageView },
    /// A descriptor pool and every set allocated from it.
    DescriptorPool(vk::DescriptorPool),
}

/// A resource pending deletion.
#[derive(Debug)]
pub struct PendingDeletion {
    /// The resource to be destroyed.
    pub resource: RetiredResource,
    /// Frame number when this resource was retired.
    pub frame_queued: u64,
}

/// Queue for deferred resource deletions.
///
/// Frame numbers only move forward, so the queue stays sorted by
/// `frame_queued` and only the front can mature.
#[derive(Debug, Default)]
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frame: u64,
}

impl DeferredDeletionQueue {
    /// Create an empty queue starting at frame 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire a resource in the current frame.
    pub fn retire(&mut self, resource: RetiredResource) {
        tracing::trace!(?resource, frame = self.frame, "Retiring GPU resource");
        self.pending.push_back(PendingDeletion {
            resource,
            frame_queued: self.frame,
        });
    }

    /// Current frame number.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Close the current frame after the device has gone idle.
    ///
    /// Everything retired up to and including the closed frame is returned for
    /// destruction, and the frame counter advances.
    pub fn end_frame(&mut self) -> Vec<RetiredResource> {
        let completed = self.frame;
        let mut ready = Vec::new();
        while matches!(self.pending.front(), Some(p) if p.frame_queued <= completed) {
            if let Some(pending) = self.pending.pop_front() {
                ready.push(pending.resource);
            }
        }
        self.frame += 1;
        ready
    }

    /// Take every pending resource regardless of frame.
    ///
    /// Call this during shutdown after the device is idle.
    pub fn drain_all(&mut self) -> Vec<RetiredResource> {
        self.pending.drain(..).map(|p| p.resource).collect()
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn end_frame_releases_everything_retired_before_flush() {
        let mut queue = DeferredDeletionQueue::new();
        queue.retire(RetiredResource::Buffer(vk::Buffer::from_raw(1)));
        queue.retire(RetiredResource::DescriptorPool(vk::DescriptorPool::from_raw(2)));
        assert_eq!(queue.pending_count(), 2);

        let ready = queue.end_frame();
        assert_eq!(ready.len(), 2);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.frame(), 1);
    }

    #[test]
    fn drain_all_ignores_frames() {
        let mut queue = DeferredDeletionQueue::new();
        queue.retire(RetiredResource::Buffer(vk::Buffer::from_raw(7)));
        assert_eq!(queue.drain_all(), vec![RetiredResource::Buffer(vk::Buffer::from_raw(7))]);
        assert_eq!(queue.pending_count(), 0);
    }
}
