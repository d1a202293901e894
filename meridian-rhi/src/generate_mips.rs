//! Mip chain generation: linear blits by default, a compute downsampler when the device has one.

use std::sync::Arc;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use meridian_core::collections::hashmap::HashMap;
use parking_lot::Mutex;
use crate::barrier::SubresourceRange;
use crate::command::CommandBuffer;
use crate::device::RenderDevice;
use crate::error::RhiError;
use crate::resource::{MipLevelViews, PipelineDesc, PipelineId, TextureDesc, TextureDimension, TextureViewDesc};

/// Compute variants by parity of the source mip: odd extents need extra taps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MipVariant {
    Even = 0,
    OddWidth = 1,
    OddHeight = 2,
    OddBoth = 3,
}

impl MipVariant {
    pub const ALL: [MipVariant; 4] = [
        MipVariant::Even,
        MipVariant::OddWidth,
        MipVariant::OddHeight,
        MipVariant::OddBoth,
    ];

    pub fn from_extent(width: u32, height: u32) -> Self {
        Self::ALL[((width & 1) | ((height & 1) << 1)) as usize]
    }
}

/// Formats whose compute pipelines are created with the device.
const WARM_FORMATS: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM];

/// Levels one compute dispatch writes at most.
const MAX_MIPS_PER_DISPATCH: u32 = 4;
const GROUP_SIZE: u32 = 8;

/// Supplies the shader side of the compute downsampler.
///
/// The shader reads the source mip through a sampled view and writes up to four destination
/// levels through storage views; unused destination slots repeat the last written level.
pub trait MipComputeProvider: Send + Sync {
    fn pipeline_layout(&self) -> vk::PipelineLayout;
    fn create_pipeline(&self, format: vk::Format, variant: MipVariant) -> Result<vk::Pipeline, RhiError>;
    fn descriptor_set(&self, src: vk::ImageView, dst: &[vk::ImageView; 4]) -> Option<vk::DescriptorSet>;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct MipConstants {
    src_mip_level: i32,
    num_mip_levels: i32,
    array_slice: i32,
    _pad: i32,
    texel_size: [f32; 2],
}

/// One `generate_mips` call.
pub(crate) struct MipJob<'a> {
    pub image: vk::Image,
    pub texture: &'a TextureDesc,
    /// Resolved view.
    pub view: &'a TextureViewDesc,
    pub mip_views: &'a [MipLevelViews],
    /// Layout every level of the view is in before generation.
    pub original_layout: vk::ImageLayout,
}

pub struct MipGenerator {
    provider: Option<Arc<dyn MipComputeProvider>>,
    pipelines: Mutex<HashMap<vk::Format, [PipelineId; 4]>>,
}

impl MipGenerator {
    pub fn new(provider: Option<Arc<dyn MipComputeProvider>>) -> Self {
        Self {
            provider,
            pipelines: Mutex::new(HashMap::default()),
        }
    }

    pub fn has_compute(&self) -> bool {
        self.provider.is_some()
    }

    /// Create the compute pipelines of the common colour formats up front.
    pub fn warm_up(&self, device: &Arc<RenderDevice>) {
        if self.provider.is_none() {
            return;
        }
        for format in WARM_FORMATS {
            if let Err(err) = self.pipelines_for(device, format) {
                log::warn!("Failed to create mip generation pipelines for {:?}: {}", format, err);
            }
        }
    }

    /// Hand back every registered pipeline for destruction.
    pub fn take_pipelines(&self) -> Vec<PipelineId> {
        self.pipelines.lock().drain().flat_map(|(_, ids)| ids).collect()
    }

    fn pipelines_for(&self, device: &RenderDevice, format: vk::Format) -> Result<[PipelineId; 4], RhiError> {
        let Some(provider) = self.provider.as_ref() else {
            return Err(RhiError::Unsupported("compute mip generation".to_owned()));
        };
        let mut pipelines = self.pipelines.lock();
        if let Some(ids) = pipelines.get(&format) {
            return Ok(*ids);
        }
        let mut ids = [PipelineId(0); 4];
        for variant in MipVariant::ALL {
            let handle = provider.create_pipeline(format, variant)?;
            let desc = PipelineDesc::compute(&format!("generate mips {:?} {:?}", format, variant), provider.pipeline_layout());
            ids[variant as usize] = device.register_pipeline(desc, handle);
        }
        pipelines.insert(format, ids);
        Ok(ids)
    }

    /// Record mip generation. On return every level of the view is in `SHADER_READ_ONLY_OPTIMAL`.
    pub(crate) fn generate(&self, device: &RenderDevice, cmd: &mut CommandBuffer, job: &MipJob<'_>) {
        let compute_capable = self.provider.is_some()
            && !job.mip_views.is_empty()
            && matches!(job.texture.dimension, TextureDimension::Tex2D | TextureDimension::Tex2DArray);
        if compute_capable {
            let format = job.view.format.unwrap_or(job.texture.format);
            let passes = self
                .pipelines_for(device, format)
                .and_then(|pipelines| self.plan_compute(device, job, &pipelines));
            match passes {
                Ok(passes) => return self.generate_compute(cmd, job, &passes),
                Err(err) => log::warn!(
                    "Compute mip generation is unavailable for {:?} ({}); falling back to blits",
                    format,
                    err
                ),
            }
        }
        Self::generate_blit(cmd, job);
    }

    fn generate_blit(cmd: &mut CommandBuffer, job: &MipJob<'_>) {
        let view = job.view;
        let aspect = job.texture.aspect();
        let top = view.most_detailed_mip;
        let bottom = top + view.num_mips;
        let slices = |mip, count| SubresourceRange::new(aspect, mip, count, view.first_slice, view.num_slices);

        if job.original_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            cmd.transition_image_layout(
                job.image,
                job.original_layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                slices(top, 1),
            );
        }
        for mip in top + 1..bottom {
            let src = job.texture.mip_extent(mip - 1);
            let dst = job.texture.mip_extent(mip);
            if job.original_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                cmd.transition_image_layout(
                    job.image,
                    job.original_layout,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    slices(mip, 1),
                );
            }
            let blit = vk::ImageBlit {
                src_subresource: slices(mip - 1, 1).to_vk_layers(mip - 1),
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src.width as i32,
                        y: src.height as i32,
                        z: src.depth as i32,
                    },
                ],
                dst_subresource: slices(mip, 1).to_vk_layers(mip),
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst.width as i32,
                        y: dst.height as i32,
                        z: dst.depth as i32,
                    },
                ],
            };
            cmd.blit_image(job.image, job.image, &[blit], vk::Filter::LINEAR);
            cmd.transition_image_layout(
                job.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                slices(mip, 1),
            );
        }
        cmd.transition_image_layout(
            job.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            slices(top, view.num_mips),
        );
    }

    /// Resolve the pipeline and descriptor set of every dispatch before anything is recorded, so a
    /// failure leaves the texture untouched.
    fn plan_compute(
        &self,
        device: &RenderDevice,
        job: &MipJob<'_>,
        pipelines: &[PipelineId; 4],
    ) -> Result<Vec<ComputePass>, RhiError> {
        let Some(provider) = self.provider.as_ref() else {
            return Err(RhiError::Unsupported("compute mip generation".to_owned()));
        };
        let top = job.view.most_detailed_mip;
        let bottom = top + job.view.num_mips - 1;
        let local = |mip: u32| job.mip_views[(mip - top) as usize];

        let mut passes = Vec::new();
        let mut src_mip = top;
        while src_mip < bottom {
            let src = job.texture.mip_extent(src_mip);
            let dst_width = (src.width >> 1).max(1);
            let dst_height = (src.height >> 1).max(1);
            let variant = MipVariant::from_extent(src.width, src.height);
            // Only even extents can be reduced again in the same dispatch.
            let num_mips = (1 + (dst_width | dst_height).trailing_zeros().min(MAX_MIPS_PER_DISPATCH - 1))
                .min(bottom - src_mip);

            let dst_views: [vk::ImageView; 4] =
                std::array::from_fn(|u| local(src_mip + (u as u32 + 1).min(num_mips)).storage);
            let descriptor_set = provider
                .descriptor_set(local(src_mip).sampled, &dst_views)
                .ok_or_else(|| RhiError::Backend(format!("no descriptor set for source mip {}", src_mip)))?;
            let pipeline = device
                .pipeline_handle(pipelines[variant as usize])
                .ok_or_else(|| RhiError::ObjectNotFound(pipelines[variant as usize].to_string()))?;

            passes.push(ComputePass {
                src_mip,
                num_mips,
                dst_extent: (dst_width, dst_height),
                pipeline,
                descriptor_set,
            });
            src_mip += num_mips;
        }
        Ok(passes)
    }

    fn generate_compute(&self, cmd: &mut CommandBuffer, job: &MipJob<'_>, passes: &[ComputePass]) {
        let Some(provider) = self.provider.as_ref() else {
            return;
        };
        let view = job.view;
        let aspect = job.texture.aspect();
        let top = view.most_detailed_mip;
        let layout = provider.pipeline_layout();
        let slices = |mip, count| SubresourceRange::new(aspect, mip, count, view.first_slice, view.num_slices);

        if job.original_layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
            cmd.transition_image_layout(
                job.image,
                job.original_layout,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                slices(top, 1),
            );
        }

        for pass in passes {
            let first_dst = pass.src_mip + 1;
            let (dst_width, dst_height) = pass.dst_extent;
            if job.original_layout != vk::ImageLayout::GENERAL {
                cmd.transition_image_layout(
                    job.image,
                    job.original_layout,
                    vk::ImageLayout::GENERAL,
                    slices(first_dst, pass.num_mips),
                );
            }
            cmd.bind_compute_pipeline(pass.pipeline);
            cmd.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, 0, &[pass.descriptor_set], &[]);
            let constants = MipConstants {
                src_mip_level: pass.src_mip as i32,
                num_mip_levels: pass.num_mips as i32,
                array_slice: view.first_slice as i32,
                _pad: 0,
                texel_size: [1.0 / dst_width as f32, 1.0 / dst_height as f32],
            };
            cmd.push_constants(layout, vk::ShaderStageFlags::COMPUTE, 0, bytemuck::bytes_of(&constants));
            cmd.dispatch(
                dst_width.div_ceil(GROUP_SIZE),
                dst_height.div_ceil(GROUP_SIZE),
                view.num_slices,
            );
            cmd.transition_image_layout(
                job.image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                slices(first_dst, pass.num_mips),
            );
        }
    }
}

/// One compute dispatch writing `num_mips` levels below `src_mip`.
struct ComputePass {
    src_mip: u32,
    num_mips: u32,
    dst_extent: (u32, u32),
    pipeline: vk::Pipeline,
    descriptor_set: vk::DescriptorSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_follows_source_parity() {
        assert_eq!(MipVariant::from_extent(64, 64), MipVariant::Even);
        assert_eq!(MipVariant::from_extent(63, 64), MipVariant::OddWidth);
        assert_eq!(MipVariant::from_extent(64, 33), MipVariant::OddHeight);
        assert_eq!(MipVariant::from_extent(1, 1), MipVariant::OddBoth);
    }

    #[test]
    fn constants_match_shader_layout() {
        assert_eq!(std::mem::size_of::<MipConstants>(), 24);
    }
}
