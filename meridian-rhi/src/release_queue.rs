use std::collections::VecDeque;
use crate::backend::NativeObject;
use crate::dynamic_heap::MasterBlock;

/// Something the GPU may still be reading.
#[derive(Debug)]
pub(crate) enum StaleResource {
    Native(NativeObject),
    /// A master block of the shared dynamic buffer.
    DynamicBlock(MasterBlock),
}

/// Resources waiting for a timeline value before they can be destroyed or reused.
///
/// Objects destroyed while the immediate context may still reference them sit in the stale list
/// without a value. They are stamped by the next submission of the immediate context, never by a
/// one-off device submission.
#[derive(Default, Debug)]
pub(crate) struct ReleaseQueue {
    stale: Vec<StaleResource>,
    entries: VecDeque<(u64, StaleResource)>,
}

impl ReleaseQueue {
    /// Queue a resource whose last use is the submission with `fence_value`.
    pub fn push(&mut self, fence_value: u64, resource: StaleResource) {
        self.entries.push_back((fence_value, resource));
    }

    /// Hold a resource until the next immediate submission stamps it.
    pub fn push_stale(&mut self, resource: StaleResource) {
        self.stale.push(resource);
    }

    /// Stamp every stale resource with the value of the submission that just went out.
    pub fn discard_stale(&mut self, fence_value: u64) -> usize {
        let count = self.stale.len();
        for resource in self.stale.drain(..) {
            self.entries.push_back((fence_value, resource));
        }
        count
    }

    /// Remove and return every resource whose fence value has completed.
    pub fn drain_completed(&mut self, completed: u64) -> Vec<StaleResource> {
        let mut released = Vec::new();
        let mut pending = VecDeque::with_capacity(self.entries.len());
        for (fence_value, resource) in self.entries.drain(..) {
            if fence_value <= completed {
                released.push(resource);
            } else {
                pending.push_back((fence_value, resource));
            }
        }
        self.entries = pending;
        released
    }

    pub fn drain_all(&mut self) -> Vec<StaleResource> {
        let mut all: Vec<_> = self.entries.drain(..).map(|(_, resource)| resource).collect();
        all.append(&mut self.stale);
        all
    }

    /// Stale and stamped resources together.
    pub fn len(&self) -> usize {
        self.stale.len() + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use ash::vk::Handle;

    fn view(raw: u64) -> StaleResource {
        StaleResource::Native(NativeObject::ImageView(vk::ImageView::from_raw(raw)))
    }

    #[test]
    fn only_completed_values_are_released() {
        let mut queue = ReleaseQueue::default();
        queue.push(1, view(1));
        queue.push(3, view(3));
        queue.push(2, view(2));

        let released = queue.drain_completed(2);
        assert_eq!(released.len(), 2);
        assert_eq!(queue.len(), 1);

        assert!(queue.drain_completed(2).is_empty());
        assert_eq!(queue.drain_all().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_resources_wait_for_a_stamp() {
        let mut queue = ReleaseQueue::default();
        queue.push_stale(view(1));
        queue.push(1, view(2));
        assert_eq!(queue.len(), 2);

        // Completion of anything does not free an unstamped resource.
        assert_eq!(queue.drain_completed(u64::MAX).len(), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.discard_stale(5), 1);
        assert!(queue.drain_completed(4).is_empty());
        assert_eq!(queue.drain_completed(5).len(), 1);
        assert!(queue.is_empty());
    }
}
