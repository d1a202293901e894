//! The transition engine: resolves old states, decides whether a barrier is needed, and keeps
//! the stored or recorded state in step.

use crate::barrier::SubresourceRange;
use crate::context::{ContextKind, DeviceContext};
use crate::error::{verify, CHECKS_ENABLED};
use crate::resource::{BufferId, ObjectId, TextureId};
use crate::state::{resource_state_to_access_flags, resource_state_to_image_layout, ResourceState, StateTransitionMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionResource {
    Buffer(BufferId),
    Texture(TextureId),
}

impl From<TransitionResource> for ObjectId {
    fn from(resource: TransitionResource) -> Self {
        match resource {
            TransitionResource::Buffer(id) => ObjectId::Buffer(id),
            TransitionResource::Texture(id) => ObjectId::Texture(id),
        }
    }
}

/// One entry of [`DeviceContext::transition_resource_states`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateTransitionDesc {
    pub resource: TransitionResource,
    /// `UNKNOWN` uses the state the context knows.
    pub old_state: ResourceState,
    pub new_state: ResourceState,
    pub first_mip: u32,
    /// 0 selects every remaining mip.
    pub num_mips: u32,
    pub first_slice: u32,
    /// 0 selects every remaining slice.
    pub num_slices: u32,
    /// Write `new_state` back as the resource's state. Deferred contexts always record it.
    pub update_state: bool,
}

impl StateTransitionDesc {
    pub fn texture(texture: TextureId, new_state: ResourceState) -> Self {
        Self {
            resource: TransitionResource::Texture(texture),
            old_state: ResourceState::UNKNOWN,
            new_state,
            first_mip: 0,
            num_mips: 0,
            first_slice: 0,
            num_slices: 0,
            update_state: true,
        }
    }

    pub fn buffer(buffer: BufferId, new_state: ResourceState) -> Self {
        Self {
            resource: TransitionResource::Buffer(buffer),
            ..Self::texture(TextureId(0), new_state)
        }
    }

    pub fn with_old_state(mut self, old_state: ResourceState) -> Self {
        self.old_state = old_state;
        self
    }

    pub fn with_mips(mut self, first_mip: u32, num_mips: u32) -> Self {
        self.first_mip = first_mip;
        self.num_mips = num_mips;
        self
    }

    pub fn with_slices(mut self, first_slice: u32, num_slices: u32) -> Self {
        self.first_slice = first_slice;
        self.num_slices = num_slices;
        self
    }

    pub fn with_update_state(mut self, update_state: bool) -> Self {
        self.update_state = update_state;
        self
    }
}

/// A final state recorded by a deferred context, committed when its command list executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    pub resource: TransitionResource,
    pub state: ResourceState,
}

impl<K: ContextKind> DeviceContext<K> {
    /// Apply a batch of transitions in order.
    ///
    /// On a deferred context every transition records its new state into the command list,
    /// regardless of `update_state`.
    #[profiling::function]
    pub fn transition_resource_states(&mut self, barriers: &[StateTransitionDesc]) {
        verify!(
            !self.explicit_pass,
            "State transitions are not allowed inside a render pass begun with begin_render_pass"
        );
        for barrier in barriers {
            let update = barrier.update_state || K::DEFERRED;
            match barrier.resource {
                TransitionResource::Texture(id) => {
                    let Some(desc) = self.device.texture_desc(id) else {
                        log::error!("{} is not registered with the device", id);
                        continue;
                    };
                    let mip_count = match barrier.num_mips {
                        0 => desc.mip_levels.saturating_sub(barrier.first_mip),
                        n => n,
                    };
                    let slice_count = match barrier.num_slices {
                        0 => desc.slice_count().saturating_sub(barrier.first_slice),
                        n => n,
                    };
                    if mip_count == 0
                        || slice_count == 0
                        || barrier.first_mip + mip_count > desc.mip_levels
                        || barrier.first_slice + slice_count > desc.slice_count()
                    {
                        log::error!(
                            "Transition of texture '{}' selects mips {}+{} and slices {}+{} outside of the texture",
                            desc.name,
                            barrier.first_mip,
                            mip_count,
                            barrier.first_slice,
                            slice_count
                        );
                        continue;
                    }
                    let range =
                        SubresourceRange::new(desc.aspect(), barrier.first_mip, mip_count, barrier.first_slice, slice_count);
                    self.transition_texture(id, barrier.old_state, barrier.new_state, update, Some(range));
                }
                TransitionResource::Buffer(id) => {
                    self.transition_buffer(id, barrier.old_state, barrier.new_state, update);
                }
            }
        }
    }

    pub(super) fn record_state(&mut self, resource: TransitionResource, state: ResourceState) {
        self.local_states.insert(resource.into(), state);
        self.state_updates.push(StateUpdate { resource, state });
    }

    /// Transition a texture from `old_state` (or the known state when `UNKNOWN`) to `new_state`.
    ///
    /// Returns whether a barrier was queued.
    pub(crate) fn transition_texture(
        &mut self,
        id: TextureId,
        old_state: ResourceState,
        new_state: ResourceState,
        update: bool,
        range: Option<SubresourceRange>,
    ) -> bool {
        let (image, name, full_range, fresh) = {
            let arena = self.device.arena();
            let Some(entry) = arena.textures.get(&id) else {
                log::error!("{} is not registered with the device", id);
                return false;
            };
            (
                entry.native.handle,
                entry.desc.name.clone(),
                entry.desc.full_range(),
                entry.fresh,
            )
        };
        let known = self.known_state(ObjectId::Texture(id));

        let old_state = if old_state.is_unknown() {
            match known {
                Some(state) => state,
                None if K::DEFERRED => {
                    log::error!(
                        "Deferred context '{}' can not transition texture '{}' from an unknown state; \
                         specify the old state explicitly",
                        self.name,
                        name
                    );
                    return false;
                }
                None if fresh => {
                    log::debug!("Texture '{}' is used for the first time in an unknown state; contents are discarded", name);
                    ResourceState::UNDEFINED
                }
                None => {
                    log::warn!(
                        "Failed to transition texture '{}' to {}: its state is unknown and no old state was given",
                        name,
                        new_state
                    );
                    return false;
                }
            }
        } else {
            if let Some(known) = known {
                if known != old_state {
                    log::error!(
                        "Texture '{}' is in state {}, which does not match the old state {} of the transition",
                        name,
                        known,
                        old_state
                    );
                }
            }
            old_state
        };

        let mut emitted = false;
        if old_state != new_state || new_state == ResourceState::UNORDERED_ACCESS {
            verify!(
                !self.explicit_pass,
                "Texture '{}' can not be transitioned inside a render pass begun with begin_render_pass",
                name
            );
            let old_layout = resource_state_to_image_layout(old_state, false);
            let new_layout = resource_state_to_image_layout(new_state, false);
            if let Some(cmd) = self.command_buffer() {
                cmd.transition_image_layout(image, old_layout, new_layout, range.unwrap_or(full_range));
                emitted = true;
            }
        }

        if K::DEFERRED {
            if update {
                self.record_state(TransitionResource::Texture(id), new_state);
            }
        } else if update {
            self.device.set_texture_state(id, Some(new_state));
        } else if fresh {
            self.device.set_texture_state(id, None);
        }
        emitted
    }

    /// Transition a buffer. A barrier is queued only when `new_state` is not already covered by the
    /// old state, or for unordered access after unordered access.
    pub(crate) fn transition_buffer(
        &mut self,
        id: BufferId,
        old_state: ResourceState,
        new_state: ResourceState,
        update: bool,
    ) -> bool {
        let (handle, name, dynamic) = {
            let arena = self.device.arena();
            let Some(entry) = arena.buffers.get(&id) else {
                log::error!("{} is not registered with the device", id);
                return false;
            };
            (entry.native.handle, entry.desc.name.clone(), entry.desc.is_dynamic())
        };
        if dynamic {
            // Lives in host-coherent memory written before submission.
            return false;
        }
        let known = self.known_state(ObjectId::Buffer(id));

        let old_state = if old_state.is_unknown() {
            match known {
                Some(state) => state,
                None => {
                    log::error!(
                        "Failed to transition buffer '{}' in context '{}': its state is unknown and no old state was given",
                        name,
                        self.name
                    );
                    return false;
                }
            }
        } else {
            if let Some(known) = known {
                if known != old_state {
                    log::error!(
                        "Buffer '{}' is in state {}, which does not match the old state {} of the transition",
                        name,
                        known,
                        old_state
                    );
                }
            }
            old_state
        };

        let needed = !old_state.contains(new_state) || new_state == ResourceState::UNORDERED_ACCESS;
        let mut emitted = false;
        if needed {
            verify!(
                !self.explicit_pass,
                "Buffer '{}' can not be transitioned inside a render pass begun with begin_render_pass",
                name
            );
            let src_access = resource_state_to_access_flags(old_state);
            let dst_access = resource_state_to_access_flags(new_state);
            if let Some(cmd) = self.command_buffer() {
                cmd.buffer_memory_barrier(handle, src_access, dst_access);
                emitted = true;
            }
        }

        if update && (needed || known.is_none()) {
            if K::DEFERRED {
                self.record_state(TransitionResource::Buffer(id), new_state);
            } else {
                self.device.set_buffer_state(id, new_state);
            }
        }
        emitted
    }

    /// Bring a texture into `required` per `mode`. `op` names the operation in diagnostics.
    pub(crate) fn transition_or_verify_texture(
        &mut self,
        id: TextureId,
        mode: StateTransitionMode,
        required: ResourceState,
        op: &str,
    ) {
        match mode {
            StateTransitionMode::None => {}
            StateTransitionMode::Transition => {
                let known = self.known_state(ObjectId::Texture(id));
                if !known.is_some_and(|state| state.contains(required)) {
                    self.transition_texture(id, ResourceState::UNKNOWN, required, true, None);
                }
            }
            StateTransitionMode::Verify => {
                if CHECKS_ENABLED {
                    self.verify_state(ObjectId::Texture(id), required, op);
                }
            }
        }
    }

    pub(crate) fn transition_or_verify_buffer(
        &mut self,
        id: BufferId,
        mode: StateTransitionMode,
        required: ResourceState,
        op: &str,
    ) {
        match mode {
            StateTransitionMode::None => {}
            StateTransitionMode::Transition => {
                let known = self.known_state(ObjectId::Buffer(id));
                if !known.is_some_and(|state| state.contains(required)) {
                    self.transition_buffer(id, ResourceState::UNKNOWN, required, true);
                }
            }
            StateTransitionMode::Verify => {
                if CHECKS_ENABLED {
                    self.verify_state(ObjectId::Buffer(id), required, op);
                }
            }
        }
    }

    fn verify_state(&self, object: ObjectId, required: ResourceState, op: &str) {
        let Some(state) = self.known_state(object) else {
            return;
        };
        verify!(
            state.contains(required),
            "{} requires {} to be in state {}, but it is in state {}",
            op,
            object,
            required,
            state
        );
    }
}
