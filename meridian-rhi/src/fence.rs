//! CPU-side fences layered over the device timeline.

use std::collections::VecDeque;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::backend::GpuBackend;
use crate::error::RhiError;

#[derive(Default)]
struct FenceState {
    /// (timeline value, user value) pairs not yet known to be complete.
    pending: VecDeque<(u64, u64)>,
    completed: u64,
}

/// A user-valued fence. `signal_fence` attaches a user value to the next submission of the
/// immediate context; the fence reaches that value once the submission completes.
pub struct Fence {
    name: String,
    backend: Arc<dyn GpuBackend>,
    state: Mutex<FenceState>,
}

impl Fence {
    pub(crate) fn new(name: impl Into<String>, backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            state: Mutex::new(FenceState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn enqueue(&self, timeline_value: u64, user_value: u64) {
        self.state.lock().pending.push_back((timeline_value, user_value));
    }

    /// Largest user value whose submission has completed.
    pub fn completed_value(&self) -> u64 {
        let gpu_completed = self.backend.completed_fence_value();
        let mut state = self.state.lock();
        while let Some(&(timeline, user)) = state.pending.front() {
            if timeline > gpu_completed {
                break;
            }
            state.completed = state.completed.max(user);
            state.pending.pop_front();
        }
        state.completed
    }

    /// Block until the fence reaches `value`. Values that were never signaled return immediately
    /// with a warning.
    pub fn wait(&self, value: u64) -> Result<(), RhiError> {
        if self.completed_value() >= value {
            return Ok(());
        }
        let timeline = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .find(|&&(_, user)| user >= value)
                .map(|&(timeline, _)| timeline)
        };
        match timeline {
            Some(timeline) => {
                self.backend.wait_for_fence_value(timeline)?;
                self.completed_value();
                Ok(())
            }
            None => {
                log::warn!(
                    "Waiting for value {} of fence '{}' that has not been signaled; flush the context first",
                    value,
                    self.name
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence").field("name", &self.name).finish_non_exhaustive()
    }
}
