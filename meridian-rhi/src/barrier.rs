use ash::vk;
use smallvec::SmallVec;
use crate::error::verify;
use crate::state::{access_flags_to_pipeline_stages, image_layout_to_access_flags};

/// A contiguous block of mips and array layers of one image aspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn new(aspect: vk::ImageAspectFlags, base_mip: u32, mip_count: u32, base_layer: u32, layer_count: u32) -> Self {
        Self { aspect, base_mip, mip_count, base_layer, layer_count }
    }

    /// Every mip and layer of an image with the given dimensions.
    pub fn whole(aspect: vk::ImageAspectFlags, mip_levels: u32, array_layers: u32) -> Self {
        Self::new(aspect, 0, mip_levels, 0, array_layers)
    }

    pub fn with_mips(mut self, base_mip: u32, mip_count: u32) -> Self {
        self.base_mip = base_mip;
        self.mip_count = mip_count;
        self
    }

    pub fn with_layers(mut self, base_layer: u32, layer_count: u32) -> Self {
        self.base_layer = base_layer;
        self.layer_count = layer_count;
        self
    }

    #[inline]
    pub fn mip_end(&self) -> u32 {
        self.base_mip + self.mip_count
    }

    #[inline]
    pub fn layer_end(&self) -> u32 {
        self.base_layer + self.layer_count
    }

    pub fn overlaps(&self, other: &SubresourceRange) -> bool {
        self.aspect.intersects(other.aspect)
            && self.base_mip < other.mip_end()
            && other.base_mip < self.mip_end()
            && self.base_layer < other.layer_end()
            && other.base_layer < self.layer_end()
    }

    pub fn to_vk(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }

    pub fn to_vk_layers(&self, mip: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect,
            mip_level: mip,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

/// An image layout transition with fully resolved stage and access masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub range: SubresourceRange,
}

impl ImageBarrier {
    /// Derive access and stage masks from the two layouts.
    pub fn from_layouts(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: SubresourceRange,
        shader_stages: vk::PipelineStageFlags2,
    ) -> Self {
        let src_access = image_layout_to_access_flags(old_layout, false);
        let dst_access = image_layout_to_access_flags(new_layout, true);

        let src_stage = if old_layout == vk::ImageLayout::PRESENT_SRC_KHR {
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE
        } else if !src_access.is_empty() {
            non_empty_or_all(access_flags_to_pipeline_stages(src_access, shader_stages))
        } else {
            vk::PipelineStageFlags2::TOP_OF_PIPE
        };

        let dst_stage = if new_layout == vk::ImageLayout::PRESENT_SRC_KHR {
            vk::PipelineStageFlags2::TOP_OF_PIPE
        } else if !dst_access.is_empty() {
            non_empty_or_all(access_flags_to_pipeline_stages(dst_access, shader_stages))
        } else {
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE
        };

        Self {
            image,
            old_layout,
            new_layout,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
            range,
        }
    }

    /// Extend `self` by `other` when both describe the same transition on adjacent mip ranges.
    fn try_merge(&mut self, other: &ImageBarrier) -> bool {
        let same_transition = self.image == other.image
            && self.old_layout == other.old_layout
            && self.new_layout == other.new_layout
            && self.src_access == other.src_access
            && self.dst_access == other.dst_access
            && self.src_stage == other.src_stage
            && self.dst_stage == other.dst_stage
            && self.range.aspect == other.range.aspect
            && self.range.base_layer == other.range.base_layer
            && self.range.layer_count == other.range.layer_count;
        if !same_transition {
            return false;
        }

        if self.range.mip_end() == other.range.base_mip {
            self.range.mip_count += other.range.mip_count;
            true
        } else if other.range.mip_end() == self.range.base_mip {
            self.range.base_mip = other.range.base_mip;
            self.range.mip_count += other.range.mip_count;
            true
        } else {
            false
        }
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .image(self.image)
            .subresource_range(self.range.to_vk())
    }
}

/// A buffer memory dependency with fully resolved stage and access masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl BufferBarrier {
    pub fn from_access(
        buffer: vk::Buffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        shader_stages: vk::PipelineStageFlags2,
    ) -> Self {
        verify!(!dst_access.is_empty(), "Destination access mask of a buffer barrier must not be empty");

        let src_stage = if src_access.is_empty() {
            vk::PipelineStageFlags2::TOP_OF_PIPE
        } else {
            non_empty_or_all(access_flags_to_pipeline_stages(src_access, shader_stages))
        };
        let dst_stage = non_empty_or_all(access_flags_to_pipeline_stages(dst_access, shader_stages));

        Self {
            buffer,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }

    pub fn with_range(mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    pub fn flush_all_writes() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }

    pub fn to_vk(&self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
    }
}

fn non_empty_or_all(stages: vk::PipelineStageFlags2) -> vk::PipelineStageFlags2 {
    if stages.is_empty() {
        vk::PipelineStageFlags2::ALL_COMMANDS
    } else {
        stages
    }
}

/// Barriers waiting to be emitted as one native call.
///
/// Barriers inside one call are unordered, so a barrier that touches memory already
/// covered by a pending one must not join the batch; see [`BarrierBatch::conflicts_with_image`].
#[derive(Default, Debug)]
pub struct BarrierBatch {
    images: SmallVec<[ImageBarrier; 8]>,
    buffers: SmallVec<[BufferBarrier; 8]>,
    memory: SmallVec<[MemoryBarrier; 2]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty() && self.memory.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len() + self.buffers.len() + self.memory.len()
    }

    pub fn conflicts_with_image(&self, barrier: &ImageBarrier) -> bool {
        self.images
            .iter()
            .any(|pending| pending.image == barrier.image && pending.range.overlaps(&barrier.range))
    }

    pub fn conflicts_with_buffer(&self, barrier: &BufferBarrier) -> bool {
        self.buffers.iter().any(|pending| pending.buffer == barrier.buffer)
    }

    pub fn push_image(&mut self, barrier: ImageBarrier) {
        for pending in self.images.iter_mut() {
            if pending.try_merge(&barrier) {
                return;
            }
        }
        self.images.push(barrier);
    }

    pub fn push_buffer(&mut self, barrier: BufferBarrier) {
        self.buffers.push(barrier);
    }

    pub fn push_memory(&mut self, barrier: MemoryBarrier) {
        self.memory.push(barrier);
    }

    pub fn images(&self) -> &[ImageBarrier] {
        &self.images
    }

    pub fn buffers(&self) -> &[BufferBarrier] {
        &self.buffers
    }

    pub fn memory(&self) -> &[MemoryBarrier] {
        &self.memory
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const SHADERS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COMPUTE_SHADER;

    fn image() -> vk::Image {
        vk::Image::from_raw(0x10)
    }

    fn color_mips(base: u32, count: u32) -> SubresourceRange {
        SubresourceRange::whole(vk::ImageAspectFlags::COLOR, 1, 1).with_mips(base, count)
    }

    #[test]
    fn undefined_source_waits_on_nothing() {
        let barrier = ImageBarrier::from_layouts(
            image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            color_mips(0, 1),
            SHADERS,
        );
        assert_eq!(barrier.src_access, vk::AccessFlags2::NONE);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(
            barrier.dst_access,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::INPUT_ATTACHMENT_READ
        );
        assert_eq!(barrier.dst_stage, SHADERS | vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn present_uses_pipe_ends() {
        let to_present = ImageBarrier::from_layouts(
            image(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            color_mips(0, 1),
            SHADERS,
        );
        assert_eq!(to_present.dst_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);

        let from_present = ImageBarrier::from_layouts(
            image(),
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            color_mips(0, 1),
            SHADERS,
        );
        assert_eq!(from_present.src_stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
    }

    #[test]
    fn adjacent_mips_merge_into_one_barrier() {
        let mut batch = BarrierBatch::default();
        for mip in 0..4 {
            batch.push_image(ImageBarrier::from_layouts(
                image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                color_mips(mip, 1),
                SHADERS,
            ));
        }
        assert_eq!(batch.images().len(), 1);
        assert_eq!(batch.images()[0].range.mip_count, 4);
    }

    #[test]
    fn disjoint_mips_stay_separate() {
        let mut batch = BarrierBatch::default();
        for mip in [0, 2] {
            batch.push_image(ImageBarrier::from_layouts(
                image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                color_mips(mip, 1),
                SHADERS,
            ));
        }
        assert_eq!(batch.images().len(), 2);
    }

    #[test]
    fn overlapping_ranges_conflict() {
        let mut batch = BarrierBatch::default();
        batch.push_image(ImageBarrier::from_layouts(
            image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color_mips(0, 3),
            SHADERS,
        ));
        let next = ImageBarrier::from_layouts(
            image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            color_mips(2, 1),
            SHADERS,
        );
        assert!(batch.conflicts_with_image(&next));
        let elsewhere = ImageBarrier { image: vk::Image::from_raw(0x20), ..next };
        assert!(!batch.conflicts_with_image(&elsewhere));
    }

    #[test]
    fn buffer_barrier_from_nothing_starts_at_top() {
        let barrier = BufferBarrier::from_access(
            vk::Buffer::from_raw(1),
            vk::AccessFlags2::NONE,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            SHADERS,
        );
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::VERTEX_INPUT);
        assert_eq!(barrier.size, vk::WHOLE_SIZE);
    }
}
