use crate::context::DeviceContext;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Immediate {}
    impl Sealed for super::Deferred {}
}

/// Compile-time flavor of a [`DeviceContext`].
///
/// Operations that touch the device's authoritative resource state, submit work, or manage
/// queries and fences exist only on [`ImmediateContext`].
pub trait ContextKind: sealed::Sealed + Sized + Send + 'static {
    const DEFERRED: bool;
    const LABEL: &'static str;

    /// Runs after every draw and dispatch.
    fn after_command(context: &mut DeviceContext<Self>);
}

/// Marker for the context that submits to the GPU.
#[derive(Debug)]
pub enum Immediate {}

/// Marker for contexts that record command lists for the immediate context to execute.
#[derive(Debug)]
pub enum Deferred {}

pub type ImmediateContext = DeviceContext<Immediate>;
pub type DeferredContext = DeviceContext<Deferred>;
