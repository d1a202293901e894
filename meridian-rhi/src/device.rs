//! The render device: object arena, caches, and the deferred release queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use ash::vk;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use crate::backend::{GpuBackend, NativeBuffer, NativeImage, NativeObject};
use crate::config::DeviceConfig;
use crate::context::{DeferredContext, ImmediateContext};
use crate::dynamic_heap::{DynamicMemoryManager, MasterBlock};
use crate::error::RhiError;
use crate::fence::Fence;
use crate::framebuffer_cache::{FramebufferCache, RenderPassCache};
use crate::generate_mips::{MipComputeProvider, MipGenerator};
use crate::object_cache::ObjectCache;
use crate::query::{Query, QueryManager, QueryType};
use crate::release_queue::{ReleaseQueue, StaleResource};
use crate::resource::{
    BufferDesc, BufferEntry, BufferId, MipLevelViews, PipelineDesc, PipelineEntry, PipelineId, ResourceArena,
    TextureDesc, TextureEntry, TextureId, TextureViewDesc, TextureViewEntry, TextureViewId, TextureViewType, Usage,
};
use crate::state::ResourceState;

/// Owner of every object created through it.
///
/// Contexts and caches refer to objects by identity. Destroying an object notifies the caches and
/// hands its native handles to the release queue as stale. The next submission of the immediate
/// context stamps them with its timeline value; they are destroyed once that value completes.
pub struct RenderDevice {
    backend: Arc<dyn GpuBackend>,
    config: DeviceConfig,
    next_id: AtomicU64,
    arena: RwLock<ResourceArena>,
    release_queue: Mutex<ReleaseQueue>,
    object_cache: ObjectCache,
    render_passes: RenderPassCache,
    framebuffers: FramebufferCache,
    query_manager: Arc<QueryManager>,
    dynamic_memory: DynamicMemoryManager,
    mip_generator: MipGenerator,
    immediate_created: AtomicBool,
}

impl RenderDevice {
    pub fn new(backend: Arc<dyn GpuBackend>, config: DeviceConfig) -> Result<Arc<Self>, RhiError> {
        Self::with_mip_provider(backend, config, None)
    }

    /// Create a device whose `generate_mips` uses compute shaders from `mip_provider` when a view has per-mip views.
    pub fn with_mip_provider(
        backend: Arc<dyn GpuBackend>,
        config: DeviceConfig,
        mip_provider: Option<Arc<dyn MipComputeProvider>>,
    ) -> Result<Arc<Self>, RhiError> {
        let query_manager = Arc::new(QueryManager::new(
            backend.clone(),
            &config.query_pool_sizes,
            config.stale_query_reuse,
        )?);
        let dynamic_memory = DynamicMemoryManager::new(backend.clone(), config.dynamic_heap_size)?;

        let device = Arc::new(Self {
            backend: backend.clone(),
            config,
            next_id: AtomicU64::new(1),
            arena: RwLock::new(ResourceArena::default()),
            release_queue: Mutex::new(ReleaseQueue::default()),
            object_cache: ObjectCache::new(),
            render_passes: RenderPassCache::default(),
            framebuffers: FramebufferCache::default(),
            query_manager,
            dynamic_memory,
            mip_generator: MipGenerator::new(mip_provider),
            immediate_created: AtomicBool::new(false),
        });
        device.mip_generator.warm_up(&device);

        log::info!("Render device created on the {} backend", backend.name());
        Ok(device)
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The one context that submits to the GPU. Fails while another immediate context is alive.
    pub fn create_immediate_context(self: &Arc<Self>) -> Result<ImmediateContext, RhiError> {
        if self.immediate_created.swap(true, Ordering::AcqRel) {
            return Err(RhiError::InvalidArgument(
                "the device already has an immediate context".to_owned(),
            ));
        }
        Ok(ImmediateContext::new("immediate context", self.clone()))
    }

    pub(crate) fn release_immediate_context(&self) {
        self.immediate_created.store(false, Ordering::Release);
    }

    pub fn create_deferred_context(self: &Arc<Self>, name: &str) -> DeferredContext {
        DeferredContext::new(name, self.clone())
    }

    /// Create a buffer. Device-local buffers with `initial_data` are filled through a staging copy
    /// and start in `COPY_DEST`.
    pub fn create_buffer(&self, desc: &BufferDesc, initial_data: Option<&[u8]>) -> Result<BufferId, RhiError> {
        if desc.size == 0 {
            return Err(RhiError::InvalidArgument(format!("buffer '{}' has zero size", desc.name)));
        }
        if let Some(data) = initial_data {
            if data.len() as vk::DeviceSize > desc.size {
                return Err(RhiError::InvalidArgument(format!(
                    "{} bytes of initial data do not fit buffer '{}' of {} bytes",
                    data.len(),
                    desc.name,
                    desc.size
                )));
            }
        }

        let mut state = desc.initial_state;
        let native = match desc.usage {
            Usage::Dynamic => {
                if initial_data.is_some() {
                    log::warn!("Initial data of dynamic buffer '{}' is ignored; map it instead", desc.name);
                }
                NativeBuffer::default()
            }
            Usage::Staging => {
                let native = self.backend.create_buffer(desc, true)?;
                if let Some(data) = initial_data {
                    self.backend.write_buffer(&native, 0, data)?;
                }
                native
            }
            Usage::Default | Usage::Immutable => {
                let native = self.backend.create_buffer(desc, false)?;
                if let Some(data) = initial_data {
                    self.upload_initial_data(desc, &native, data)?;
                    state = ResourceState::COPY_DEST;
                } else if desc.usage == Usage::Immutable {
                    log::warn!("Immutable buffer '{}' created without initial data", desc.name);
                }
                native
            }
        };

        let id = BufferId(self.next_id());
        self.arena.write().buffers.insert(
            id,
            BufferEntry {
                desc: desc.clone(),
                native,
                state,
            },
        );
        log::trace!("Created {} '{}' ({} bytes, {})", id, desc.name, desc.size, desc.usage);
        Ok(id)
    }

    fn upload_initial_data(&self, desc: &BufferDesc, dst: &NativeBuffer, data: &[u8]) -> Result<(), RhiError> {
        let staging_desc = BufferDesc::staging(&format!("{} upload", desc.name), data.len() as vk::DeviceSize);
        let staging = self.backend.create_buffer(&staging_desc, true)?;
        self.backend.write_buffer(&staging, 0, data)?;

        let mut recorder = self.backend.begin_commands(&staging_desc.name)?;
        recorder.copy_buffer(
            staging.handle,
            dst.handle,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as vk::DeviceSize,
            }],
        );
        recorder.end()?;
        let fence_value = self.backend.submit(vec![recorder])?;
        self.release_queue
            .lock()
            .push(fence_value, StaleResource::Native(NativeObject::Buffer(staging)));
        Ok(())
    }

    /// Create a texture in `desc.initial_state`.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RhiError> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(RhiError::InvalidArgument(format!("texture '{}' has an empty extent", desc.name)));
        }
        let native = self.backend.create_image(desc)?;
        Ok(self.insert_texture(desc, native, desc.initial_state, true))
    }

    /// Wrap an image created elsewhere. The image is not destroyed with the texture.
    ///
    /// `state` may be `UNKNOWN` when the caller does not know the current layout.
    pub fn import_texture(&self, desc: &TextureDesc, image: vk::Image, state: ResourceState) -> TextureId {
        let native = NativeImage {
            handle: image,
            memory: vk::DeviceMemory::null(),
        };
        self.insert_texture(desc, native, state, false)
    }

    fn insert_texture(&self, desc: &TextureDesc, native: NativeImage, state: ResourceState, owned: bool) -> TextureId {
        let id = TextureId(self.next_id());
        self.arena.write().textures.insert(
            id,
            TextureEntry {
                desc: desc.clone(),
                native,
                state,
                fresh: true,
                owned,
            },
        );
        log::trace!("Created {} '{}' {}x{}x{}", id, desc.name, desc.width, desc.height, desc.depth);
        id
    }

    pub fn create_texture_view(&self, texture: TextureId, desc: &TextureViewDesc) -> Result<TextureViewId, RhiError> {
        let (image, texture_desc) = {
            let arena = self.arena.read();
            let entry = arena
                .textures
                .get(&texture)
                .ok_or_else(|| RhiError::ObjectNotFound(texture.to_string()))?;
            (entry.native.handle, entry.desc.clone())
        };

        let resolved = desc.resolve(&texture_desc);
        if resolved.num_mips == 0
            || resolved.most_detailed_mip + resolved.num_mips > texture_desc.mip_levels
            || resolved.num_slices == 0
            || resolved.first_slice + resolved.num_slices > texture_desc.slice_count()
        {
            return Err(RhiError::InvalidArgument(format!(
                "view '{}' selects mips {}+{} and slices {}+{} of texture '{}' with {} mips and {} slices",
                desc.name,
                resolved.most_detailed_mip,
                resolved.num_mips,
                resolved.first_slice,
                resolved.num_slices,
                texture_desc.name,
                texture_desc.mip_levels,
                texture_desc.slice_count()
            )));
        }

        let required_usage = match resolved.view_type {
            TextureViewType::ShaderResource => vk::ImageUsageFlags::SAMPLED,
            TextureViewType::RenderTarget => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            TextureViewType::DepthStencil => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            TextureViewType::UnorderedAccess => vk::ImageUsageFlags::STORAGE,
        };
        if !texture_desc.usage.contains(required_usage) {
            return Err(RhiError::InvalidArgument(format!(
                "{} view '{}' requires texture '{}' to have {:?} usage",
                resolved.view_type, desc.name, texture_desc.name, required_usage
            )));
        }

        let handle = self.backend.create_image_view(image, &texture_desc, &resolved)?;

        let mut mip_views = Vec::new();
        if resolved.allow_mip_generation
            && resolved.view_type == TextureViewType::ShaderResource
            && self.mip_generator.has_compute()
            && texture_desc.usage.contains(vk::ImageUsageFlags::STORAGE)
        {
            for mip in resolved.most_detailed_mip..resolved.most_detailed_mip + resolved.num_mips {
                let single = |view_type| {
                    TextureViewDesc {
                        view_type,
                        most_detailed_mip: mip,
                        num_mips: 1,
                        allow_mip_generation: false,
                        ..resolved.clone()
                    }
                };
                let sampled = self
                    .backend
                    .create_image_view(image, &texture_desc, &single(TextureViewType::ShaderResource))?;
                let storage = self
                    .backend
                    .create_image_view(image, &texture_desc, &single(TextureViewType::UnorderedAccess))?;
                mip_views.push(MipLevelViews { sampled, storage });
            }
        }

        let id = TextureViewId(self.next_id());
        self.arena.write().views.insert(
            id,
            TextureViewEntry {
                texture,
                desc: resolved,
                handle,
                mip_views,
            },
        );
        Ok(id)
    }

    /// Take ownership of a pipeline built outside the engine.
    pub fn register_pipeline(&self, desc: PipelineDesc, handle: vk::Pipeline) -> PipelineId {
        let id = PipelineId(self.next_id());
        log::debug!("Registered {} '{}' ({})", id, desc.name, desc.kind);
        self.arena.write().pipelines.insert(id, PipelineEntry { desc, handle });
        id
    }

    fn release(&self, object: NativeObject) {
        self.release_queue.lock().push_stale(StaleResource::Native(object));
    }

    pub(crate) fn release_master_blocks(&self, blocks: Vec<MasterBlock>) {
        if blocks.is_empty() {
            return;
        }
        let mut queue = self.release_queue.lock();
        for block in blocks {
            queue.push_stale(StaleResource::DynamicBlock(block));
        }
    }

    /// Stamp every stale resource with `fence_value`, the value of an immediate context submission.
    pub(crate) fn discard_stale_resources(&self, fence_value: u64) {
        let count = self.release_queue.lock().discard_stale(fence_value);
        if count > 0 {
            log::trace!("{} stale resources wait for timeline value {}", count, fence_value);
        }
    }

    pub fn destroy_buffer(&self, id: BufferId) -> Result<(), RhiError> {
        let entry = self
            .arena
            .write()
            .buffers
            .remove(&id)
            .ok_or_else(|| RhiError::ObjectNotFound(id.to_string()))?;
        self.object_cache.on_destroy_buffer(id);
        if entry.native.handle != vk::Buffer::null() {
            self.release(NativeObject::Buffer(entry.native));
        }
        Ok(())
    }

    /// Destroy a texture together with every view created from it.
    pub fn destroy_texture(&self, id: TextureId) -> Result<(), RhiError> {
        let views = self.arena.read().views_of(id);
        for view in views {
            self.destroy_texture_view(view)?;
        }
        let entry = self
            .arena
            .write()
            .textures
            .remove(&id)
            .ok_or_else(|| RhiError::ObjectNotFound(id.to_string()))?;
        if entry.owned {
            self.release(NativeObject::Image(entry.native));
        }
        Ok(())
    }

    pub fn destroy_texture_view(&self, id: TextureViewId) -> Result<(), RhiError> {
        let entry = self
            .arena
            .write()
            .views
            .remove(&id)
            .ok_or_else(|| RhiError::ObjectNotFound(id.to_string()))?;
        for framebuffer in self.framebuffers.on_destroy_view(id) {
            self.release(NativeObject::Framebuffer(framebuffer));
        }
        self.release(NativeObject::ImageView(entry.handle));
        for mip in entry.mip_views {
            self.release(NativeObject::ImageView(mip.sampled));
            self.release(NativeObject::ImageView(mip.storage));
        }
        Ok(())
    }

    pub fn destroy_pipeline(&self, id: PipelineId) -> Result<(), RhiError> {
        let entry = self
            .arena
            .write()
            .pipelines
            .remove(&id)
            .ok_or_else(|| RhiError::ObjectNotFound(id.to_string()))?;
        self.object_cache.on_destroy_pipeline(id);
        self.release(NativeObject::Pipeline(entry.handle));
        Ok(())
    }

    pub fn buffer_desc(&self, id: BufferId) -> Option<BufferDesc> {
        self.arena.read().buffers.get(&id).map(|b| b.desc.clone())
    }

    /// Stored state of a buffer. Only the immediate context updates it.
    pub fn buffer_state(&self, id: BufferId) -> Option<ResourceState> {
        self.arena.read().buffers.get(&id).map(|b| b.state)
    }

    pub fn buffer_handle(&self, id: BufferId) -> Option<vk::Buffer> {
        self.arena.read().buffers.get(&id).map(|b| b.native.handle)
    }

    pub fn texture_desc(&self, id: TextureId) -> Option<TextureDesc> {
        self.arena.read().textures.get(&id).map(|t| t.desc.clone())
    }

    pub fn texture_state(&self, id: TextureId) -> Option<ResourceState> {
        self.arena.read().textures.get(&id).map(|t| t.state)
    }

    pub fn texture_handle(&self, id: TextureId) -> Option<vk::Image> {
        self.arena.read().textures.get(&id).map(|t| t.native.handle)
    }

    /// The resolved description of a view and the texture it belongs to.
    pub fn texture_view_desc(&self, id: TextureViewId) -> Option<(TextureId, TextureViewDesc)> {
        self.arena.read().views.get(&id).map(|v| (v.texture, v.desc.clone()))
    }

    pub fn texture_view_handle(&self, id: TextureViewId) -> Option<vk::ImageView> {
        self.arena.read().views.get(&id).map(|v| v.handle)
    }

    pub fn pipeline_desc(&self, id: PipelineId) -> Option<PipelineDesc> {
        self.arena.read().pipelines.get(&id).map(|p| p.desc.clone())
    }

    pub fn pipeline_handle(&self, id: PipelineId) -> Option<vk::Pipeline> {
        self.arena.read().pipelines.get(&id).map(|p| p.handle)
    }

    pub(crate) fn arena(&self) -> RwLockReadGuard<'_, ResourceArena> {
        self.arena.read()
    }

    /// Overwrite the stored state. `None` only clears the "fresh" flag.
    pub(crate) fn set_texture_state(&self, id: TextureId, state: Option<ResourceState>) {
        if let Some(entry) = self.arena.write().textures.get_mut(&id) {
            if let Some(state) = state {
                entry.state = state;
            }
            entry.fresh = false;
        }
    }

    pub(crate) fn set_buffer_state(&self, id: BufferId, state: ResourceState) {
        if let Some(entry) = self.arena.write().buffers.get_mut(&id) {
            entry.state = state;
        }
    }

    /// A query object. Native slots are taken when it first begins.
    pub fn create_query(&self, name: &str, ty: QueryType) -> Query {
        Query::new(name, ty, self.query_manager.clone())
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }

    pub fn create_fence(&self, name: &str) -> Arc<Fence> {
        Arc::new(Fence::new(name, self.backend.clone()))
    }

    pub fn object_cache(&self) -> &ObjectCache {
        &self.object_cache
    }

    pub(crate) fn render_passes(&self) -> &RenderPassCache {
        &self.render_passes
    }

    pub(crate) fn framebuffers(&self) -> &FramebufferCache {
        &self.framebuffers
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn dynamic_memory(&self) -> &DynamicMemoryManager {
        &self.dynamic_memory
    }

    pub(crate) fn mip_generator(&self) -> &MipGenerator {
        &self.mip_generator
    }

    /// Take a master block, purging completed releases and retrying once when the heap is full.
    pub fn allocate_master_block(&self, size: vk::DeviceSize) -> Option<MasterBlock> {
        let size = size.max(self.config.dynamic_heap_page_size);
        if let Some(block) = self.dynamic_memory.allocate_master_block(size) {
            return Some(block);
        }
        self.purge_release_queue();
        let block = self.dynamic_memory.allocate_master_block(size);
        if block.is_none() {
            log::error!(
                "Dynamic heap of {} bytes is exhausted ({} bytes in use). Increase dynamic_heap_size in the device config.",
                self.dynamic_memory.size(),
                self.dynamic_memory.used_size()
            );
        }
        block
    }

    /// Destroy everything whose timeline value has completed. Returns the number of released objects.
    pub fn purge_release_queue(&self) -> usize {
        let completed = self.backend.completed_fence_value();
        let released = self.release_queue.lock().drain_completed(completed);
        let count = released.len();
        for resource in released {
            self.destroy_stale(resource);
        }
        count
    }

    fn destroy_stale(&self, resource: StaleResource) {
        match resource {
            StaleResource::Native(object) => self.backend.destroy(object),
            StaleResource::DynamicBlock(block) => self.dynamic_memory.release_master_block(block),
        }
    }

    /// Resources in the release queue, stamped or not.
    pub fn pending_releases(&self) -> usize {
        self.release_queue.lock().len()
    }

    pub fn wait_idle(&self) -> Result<(), RhiError> {
        self.backend.wait_idle()?;
        self.purge_release_queue();
        Ok(())
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            log::error!("Failed to wait for the GPU before destroying the device: {}", err);
        }

        for id in self.mip_generator.take_pipelines() {
            let _ = self.destroy_pipeline(id);
        }

        let (views, textures, buffers, pipelines) = {
            let arena = self.arena.read();
            (
                arena.views.keys().copied().collect::<Vec<_>>(),
                arena.textures.keys().copied().collect::<Vec<_>>(),
                arena.buffers.keys().copied().collect::<Vec<_>>(),
                arena.pipelines.keys().copied().collect::<Vec<_>>(),
            )
        };
        let leaked = views.len() + textures.len() + buffers.len() + pipelines.len();
        if leaked > 0 {
            log::warn!("{} objects were still alive when the device was destroyed", leaked);
        }
        for id in views {
            let _ = self.destroy_texture_view(id);
        }
        for id in textures {
            let _ = self.destroy_texture(id);
        }
        for id in buffers {
            let _ = self.destroy_buffer(id);
        }
        for id in pipelines {
            let _ = self.destroy_pipeline(id);
        }

        for framebuffer in self.framebuffers.drain() {
            self.backend.destroy(NativeObject::Framebuffer(framebuffer));
        }
        for render_pass in self.render_passes.drain() {
            self.backend.destroy(NativeObject::RenderPass(render_pass));
        }

        let remaining = self.release_queue.get_mut().drain_all();
        for resource in remaining {
            self.destroy_stale(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::capture::{CaptureBackend, Command};

    fn device() -> (CaptureBackend, Arc<RenderDevice>) {
        let capture = CaptureBackend::new();
        let device = RenderDevice::new(Arc::new(capture.clone()), DeviceConfig::default()).unwrap();
        (capture, device)
    }

    #[test]
    fn ids_are_never_reused() {
        let (_capture, device) = device();
        let a = device.create_buffer(&BufferDesc::vertex("a", 64), None).unwrap();
        device.destroy_buffer(a).unwrap();
        let b = device.create_buffer(&BufferDesc::vertex("b", 64), None).unwrap();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
        assert!(device.destroy_buffer(a).is_err());
    }

    #[test]
    fn initial_data_goes_through_a_staging_copy() {
        let (capture, device) = device();
        let id = device
            .create_buffer(&BufferDesc::vertex("vb", 16), Some(&[1u8; 16]))
            .unwrap();
        assert_eq!(device.buffer_state(id), Some(ResourceState::COPY_DEST));
        assert!(capture
            .submitted_commands()
            .iter()
            .any(|c| matches!(c, Command::CopyBuffer { dst, .. } if *dst == device.buffer_handle(id).unwrap())));

        // The staging buffer waits for the upload to complete.
        assert_eq!(device.pending_releases(), 1);
        capture.complete_all();
        assert_eq!(device.purge_release_queue(), 1);
    }

    #[test]
    fn destruction_waits_for_the_timeline() {
        let (capture, device) = device();
        let texture = device
            .create_texture(&TextureDesc::new_color_attachment(32, 32, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let view = device
            .create_texture_view(texture, &TextureViewDesc::render_target())
            .unwrap();
        let image = device.texture_handle(texture).unwrap();

        let mut context = device.create_immediate_context().unwrap();
        device.destroy_texture(texture).unwrap();
        assert!(device.texture_view_desc(view).is_none());
        capture.complete_all();
        assert_eq!(device.purge_release_queue(), 0);

        // A one-off submission does not stamp stale objects.
        device.create_buffer(&BufferDesc::storage("upload", 16), Some(&[0u8; 16])).unwrap();
        capture.complete_all();
        assert_eq!(device.purge_release_queue(), 1);
        assert_eq!(device.pending_releases(), 2);

        let fence_value = context.flush().unwrap();
        capture.complete_up_to(fence_value);
        assert_eq!(device.purge_release_queue(), 2);
        assert!(capture
            .destroyed_objects()
            .iter()
            .any(|o| matches!(o, NativeObject::Image(i) if i.handle == image)));
    }

    #[test]
    fn imported_images_are_not_destroyed() {
        let (capture, device) = device();
        let desc = TextureDesc::new_2d(8, 8, vk::Format::B8G8R8A8_UNORM);
        let image = vk::Image::null();
        let id = device.import_texture(&desc, image, ResourceState::UNKNOWN);
        assert_eq!(device.texture_state(id), Some(ResourceState::UNKNOWN));
        device.destroy_texture(id).unwrap();
        device.wait_idle().unwrap();
        assert!(!capture
            .destroyed_objects()
            .iter()
            .any(|o| matches!(o, NativeObject::Image(_))));
    }

    #[test]
    fn view_ranges_are_validated() {
        let (_capture, device) = device();
        let texture = device
            .create_texture(&TextureDesc::new_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_mip_levels(2))
            .unwrap();
        assert!(device
            .create_texture_view(texture, &TextureViewDesc::shader_resource().with_mips(1, 2))
            .is_err());
        // No COLOR_ATTACHMENT usage.
        assert!(device
            .create_texture_view(texture, &TextureViewDesc::render_target())
            .is_err());
    }

    #[test]
    fn only_one_immediate_context_at_a_time() {
        let (_capture, device) = device();
        let context = device.create_immediate_context().unwrap();
        assert!(device.create_immediate_context().is_err());
        drop(context);
        assert!(device.create_immediate_context().is_ok());
    }
}
