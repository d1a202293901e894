//! Operations only the immediate context has: submission, authoritative state updates, fences
//! and queries.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use ash::vk;
use crate::backend::CommandRecorder;
use crate::barrier::SubresourceRange;
use crate::context::kind::{ContextKind, Immediate};
use crate::context::{CommandList, DeviceContext, TransitionResource};
use crate::error::RhiError;
use crate::fence::Fence;
use crate::query::{Query, QueryData, QueryPhase, QueryType, PENDING_FENCE_VALUE};
use crate::resource::{BufferId, TextureId};
use crate::state::ResourceState;

impl ContextKind for Immediate {
    const DEFERRED: bool = false;
    const LABEL: &'static str = "immediate";

    fn after_command(context: &mut DeviceContext<Self>) {
        context.commands_since_flush += 1;
        if context.commands_since_flush < context.device.config().num_commands_to_flush || context.explicit_pass {
            return;
        }
        log::trace!("{} commands recorded, flushing the immediate context", context.commands_since_flush);
        if let Err(err) = context.flush() {
            log::error!("Automatic flush of the immediate context failed: {}", err);
        }
    }
}

impl DeviceContext<Immediate> {
    /// Transition a texture, resolving `UNKNOWN` against the stored state.
    ///
    /// With `update_stored_state` unset the stored state is left alone, which is how callers
    /// describe transitions they track themselves. Returns whether a barrier was recorded.
    pub fn transition_texture_state(
        &mut self,
        texture: TextureId,
        old_state: ResourceState,
        new_state: ResourceState,
        update_stored_state: bool,
        range: Option<SubresourceRange>,
    ) -> bool {
        self.transition_texture(texture, old_state, new_state, update_stored_state, range)
    }

    pub fn transition_buffer_state(
        &mut self,
        buffer: BufferId,
        old_state: ResourceState,
        new_state: ResourceState,
        update_stored_state: bool,
    ) -> bool {
        self.transition_buffer(buffer, old_state, new_state, update_stored_state)
    }

    /// Close the open command buffer and submit it, followed by `extra`, as one submission.
    fn submit(&mut self, extra: Option<Box<dyn CommandRecorder>>) -> Result<u64, RhiError> {
        if self.explicit_pass {
            log::error!("Flushing the immediate context inside a render pass begun with begin_render_pass; the pass is ended");
            self.explicit_pass = false;
        }
        if self.active_queries > 0 {
            log::error!(
                "Flushing the immediate context with {} active queries; their results will be undefined",
                self.active_queries
            );
        }

        let query_manager = self.device.query_manager().clone();
        let mut recorders = Vec::with_capacity(2);
        if self.cmd.is_some() || query_manager.has_stale_queries() || !self.pending_fence_signals.is_empty() {
            if self.command_buffer().is_none() {
                return Err(RhiError::Backend(format!("context '{}' could not begin a command buffer", self.name)));
            }
            if let Some(mut cmd) = self.cmd.take() {
                if cmd.is_in_render_pass() {
                    cmd.end_render_pass();
                }
                let resets = cmd.reset_stale_queries(&query_manager);
                if resets > 0 {
                    log::trace!("Reset {} stale query slots", resets);
                }
                recorders.push(cmd.end()?);
            }
        }
        recorders.extend(extra);

        let fence_value = if recorders.is_empty() {
            self.device.backend().next_fence_value() - 1
        } else {
            self.device.backend().submit(recorders)?
        };
        for (fence, value) in self.pending_fence_signals.drain(..) {
            fence.enqueue(fence_value, value);
        }
        for end_fence_value in self.pending_queries.drain(..) {
            end_fence_value.store(fence_value, Ordering::Release);
        }
        self.device.discard_stale_resources(fence_value);
        self.commands_since_flush = 0;
        self.invalidate_bindings();
        Ok(fence_value)
    }

    /// Submit everything recorded so far. Returns the timeline value of the submission.
    ///
    /// Bound pipeline, buffers, render targets and descriptors stay bound and are re-recorded
    /// into the next command buffer.
    #[profiling::function]
    pub fn flush(&mut self) -> Result<u64, RhiError> {
        self.submit(None)
    }

    /// Submit a command list recorded by a deferred context, after any outstanding commands of
    /// this context, and commit the final states it recorded in recording order.
    #[profiling::function]
    pub fn execute_command_list(&mut self, list: CommandList) -> Result<u64, RhiError> {
        let CommandList {
            name,
            recorder,
            state_updates,
        } = list;
        log::trace!("Executing command list '{}' with {} state updates", name, state_updates.len());
        let fence_value = self.submit(Some(recorder))?;
        for update in state_updates {
            match update.resource {
                TransitionResource::Texture(id) => self.device.set_texture_state(id, Some(update.state)),
                TransitionResource::Buffer(id) => self.device.set_buffer_state(id, update.state),
            }
        }
        Ok(fence_value)
    }

    /// Make `fence` reach `value` once the next submission completes.
    pub fn signal_fence(&mut self, fence: &Arc<Fence>, value: u64) {
        self.pending_fence_signals.push((fence.clone(), value));
    }

    /// Block until `fence` reaches `value`. With `flush_context` set, outstanding commands are
    /// submitted first so a pending signal can complete.
    pub fn wait_for_fence(&mut self, fence: &Fence, value: u64, flush_context: bool) -> Result<(), RhiError> {
        if flush_context {
            self.flush()?;
        }
        fence.wait(value)
    }

    /// Submit everything and wait for the GPU to go idle.
    pub fn wait_for_idle(&mut self) -> Result<(), RhiError> {
        self.flush()?;
        self.device.wait_idle()
    }

    /// Begin a scoped or duration query. Timestamp queries only end.
    pub fn begin_query(&mut self, query: &mut Query) -> bool {
        let ty = query.query_type();
        if ty == QueryType::Timestamp {
            log::error!("Timestamp query '{}' can not be begun, only ended", query.name());
            return false;
        }
        if query.phase == QueryPhase::Querying {
            log::error!("Query '{}' is already being recorded", query.name());
            return false;
        }
        if !query.allocate_slots() {
            return false;
        }
        let pool = query.pool();
        let Some(cmd) = self.command_buffer() else {
            return false;
        };
        let started = if ty.is_scoped() {
            let flags = if ty == QueryType::Occlusion {
                vk::QueryControlFlags::PRECISE
            } else {
                vk::QueryControlFlags::empty()
            };
            cmd.begin_query(ty, pool, query.slot(0), flags)
        } else {
            cmd.write_timestamp(pool, query.slot(0));
            true
        };
        if !started {
            query.invalidate();
            return false;
        }
        query.phase = QueryPhase::Querying;
        if ty.is_scoped() {
            self.active_queries += 1;
        }
        true
    }

    /// End a query. Results become available once the submission that contains the end completes.
    pub fn end_query(&mut self, query: &mut Query) -> bool {
        let ty = query.query_type();
        if ty == QueryType::Timestamp {
            if !query.allocate_slots() {
                return false;
            }
        } else if query.phase != QueryPhase::Querying {
            log::error!("Query '{}' has not been begun", query.name());
            return false;
        }
        let pool = query.pool();
        let Some(cmd) = self.command_buffer() else {
            return false;
        };
        match ty {
            QueryType::Timestamp => cmd.write_timestamp(pool, query.slot(0)),
            QueryType::Duration => cmd.write_timestamp(pool, query.slot(1)),
            _ => {
                cmd.end_query(ty, pool, query.slot(0));
                self.active_queries = self.active_queries.saturating_sub(1);
            }
        }
        query.phase = QueryPhase::Ended;
        // Stamped by the submission that carries the end.
        query.end_fence_value.store(PENDING_FENCE_VALUE, Ordering::Release);
        self.pending_queries.push(query.end_fence_value.clone());
        true
    }

    /// Results of `query`, or `None` until the GPU has produced them.
    pub fn get_query_data(&self, query: &Query) -> Option<QueryData> {
        query.data()
    }
}
