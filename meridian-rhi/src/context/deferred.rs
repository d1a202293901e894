//! Deferred contexts record command lists on worker threads; the immediate context executes them.

use crate::backend::CommandRecorder;
use crate::context::kind::{ContextKind, Deferred};
use crate::context::{DeviceContext, StateUpdate};
use crate::error::RhiError;

/// A closed command buffer and the resource states it leaves behind.
pub struct CommandList {
    pub(super) name: String,
    pub(super) recorder: Box<dyn CommandRecorder>,
    pub(super) state_updates: Vec<StateUpdate>,
}

impl CommandList {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Final states in recording order; applied to the device when the list executes.
    pub fn state_updates(&self) -> &[StateUpdate] {
        &self.state_updates
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("name", &self.name)
            .field("state_updates", &self.state_updates.len())
            .finish_non_exhaustive()
    }
}

impl ContextKind for Deferred {
    const DEFERRED: bool = true;
    const LABEL: &'static str = "deferred";

    fn after_command(_context: &mut DeviceContext<Self>) {}
}

impl DeviceContext<Deferred> {
    /// Close the recorded commands into a list. The context starts over with nothing bound and no
    /// known resource states.
    #[profiling::function]
    pub fn finish_command_list(&mut self) -> Result<CommandList, RhiError> {
        if self.explicit_pass {
            log::error!(
                "Deferred context '{}' finished a command list inside a render pass begun with begin_render_pass",
                self.name
            );
            self.explicit_pass = false;
        }
        if self.active_queries > 0 {
            log::error!("Deferred context '{}' finished a command list with active queries", self.name);
        }
        if self.command_buffer().is_none() {
            return Err(RhiError::Backend(format!(
                "deferred context '{}' could not begin a command buffer",
                self.name
            )));
        }
        let cmd = self
            .cmd
            .take()
            .ok_or_else(|| RhiError::Backend(format!("deferred context '{}' has no command buffer", self.name)))?;
        let recorder = cmd.end()?;

        let state_updates = std::mem::take(&mut self.state_updates);
        self.local_states.clear();
        self.invalidate_bindings();
        log::trace!(
            "Deferred context '{}' finished a command list with {} state updates",
            self.name,
            state_updates.len()
        );
        Ok(CommandList {
            name: self.name.clone(),
            recorder,
            state_updates,
        })
    }
}
