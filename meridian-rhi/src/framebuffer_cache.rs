//! Render pass and framebuffer caches.

use ash::vk;
use meridian_core::collections::hashmap::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use crate::backend::{GpuBackend, RenderPassKey};
use crate::error::RhiError;
use crate::resource::{TextureViewId, MAX_RENDER_TARGETS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferCacheStats {
    pub render_passes: usize,
    pub framebuffers: usize,
}

/// One render pass per distinct set of attachment formats.
#[derive(Default)]
pub struct RenderPassCache {
    passes: Mutex<HashMap<RenderPassKey, vk::RenderPass>>,
}

impl RenderPassCache {
    pub fn get_or_create(&self, backend: &dyn GpuBackend, key: &RenderPassKey) -> Result<vk::RenderPass, RhiError> {
        let mut passes = self.passes.lock();
        if let Some(&pass) = passes.get(key) {
            return Ok(pass);
        }

        let pass = backend.create_render_pass(key)?;
        log::debug!(
            "Created render pass for {} colour attachments, depth {:?}",
            key.color_formats.len(),
            key.depth_format
        );
        passes.insert(key.clone(), pass);
        Ok(pass)
    }

    pub fn len(&self) -> usize {
        self.passes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.lock().is_empty()
    }

    /// Remove every render pass for destruction.
    pub fn drain(&self) -> Vec<vk::RenderPass> {
        self.passes.lock().drain().map(|(_, pass)| pass).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    /// Colour views in slot order, then the depth view.
    pub attachments: SmallVec<[TextureViewId; MAX_RENDER_TARGETS + 1]>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// Framebuffers keyed by render pass and attachment view identities.
#[derive(Default)]
pub struct FramebufferCache {
    framebuffers: Mutex<HashMap<FramebufferKey, vk::Framebuffer>>,
}

impl FramebufferCache {
    pub fn get_or_create(
        &self,
        backend: &dyn GpuBackend,
        key: &FramebufferKey,
        attachments: &[vk::ImageView],
    ) -> Result<vk::Framebuffer, RhiError> {
        let mut framebuffers = self.framebuffers.lock();
        if let Some(&framebuffer) = framebuffers.get(key) {
            return Ok(framebuffer);
        }

        let framebuffer =
            backend.create_framebuffer(key.render_pass, attachments, key.width, key.height, key.layers)?;
        framebuffers.insert(key.clone(), framebuffer);
        Ok(framebuffer)
    }

    /// Evict every framebuffer that uses `view`. The returned handles still need a deferred release.
    pub fn on_destroy_view(&self, view: TextureViewId) -> Vec<vk::Framebuffer> {
        let mut evicted = Vec::new();
        self.framebuffers.lock().retain(|key, framebuffer| {
            if key.attachments.contains(&view) {
                evicted.push(*framebuffer);
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.framebuffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<vk::Framebuffer> {
        self.framebuffers.lock().drain().map(|(_, framebuffer)| framebuffer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::capture::CaptureBackend;
    use ash::vk::Handle;
    use smallvec::smallvec;

    #[test]
    fn render_passes_are_shared_by_format() {
        let backend = CaptureBackend::new();
        let cache = RenderPassCache::default();
        let key = RenderPassKey {
            color_formats: smallvec![vk::Format::R8G8B8A8_UNORM],
            depth_format: Some(vk::Format::D32_SFLOAT),
            samples: vk::SampleCountFlags::TYPE_1,
        };
        let a = cache.get_or_create(&backend, &key).unwrap();
        let b = cache.get_or_create(&backend, &key).unwrap();
        assert_eq!(a, b);

        let other = RenderPassKey { depth_format: None, ..key };
        assert_ne!(cache.get_or_create(&backend, &other).unwrap(), a);
        assert_eq!(cache.drain().len(), 2);
    }

    #[test]
    fn destroying_a_view_evicts_its_framebuffers() {
        let backend = CaptureBackend::new();
        let cache = FramebufferCache::default();
        let pass = vk::RenderPass::from_raw(1);
        let key = |views: &[u64]| FramebufferKey {
            render_pass: pass,
            attachments: views.iter().map(|&v| TextureViewId(v)).collect(),
            width: 64,
            height: 64,
            layers: 1,
        };

        let shared = cache.get_or_create(&backend, &key(&[1, 2]), &[]).unwrap();
        cache.get_or_create(&backend, &key(&[3, 2]), &[]).unwrap();
        cache.get_or_create(&backend, &key(&[3]), &[]).unwrap();
        assert_eq!(cache.get_or_create(&backend, &key(&[1, 2]), &[]).unwrap(), shared);

        assert_eq!(cache.on_destroy_view(TextureViewId(2)).len(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.on_destroy_view(TextureViewId(1)).is_empty());
    }
}
