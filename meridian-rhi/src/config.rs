use ash::vk;
use derive_builder::Builder;
use crate::query::{QueryType, StaleQueryReuse};

/// Number of slots in each query pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryPoolSizes {
    pub occlusion: u32,
    pub binary_occlusion: u32,
    pub timestamp: u32,
    pub pipeline_statistics: u32,
    /// Duration queries take two slots each; the pool holds twice this many.
    pub duration: u32,
}

impl QueryPoolSizes {
    pub fn get(&self, ty: QueryType) -> u32 {
        match ty {
            QueryType::Occlusion => self.occlusion,
            QueryType::BinaryOcclusion => self.binary_occlusion,
            QueryType::Timestamp => self.timestamp,
            QueryType::PipelineStatistics => self.pipeline_statistics,
            QueryType::Duration => self.duration,
        }
    }

    pub fn uniform(count: u32) -> Self {
        Self {
            occlusion: count,
            binary_occlusion: count,
            timestamp: count,
            pipeline_statistics: count,
            duration: count,
        }
    }
}

impl Default for QueryPoolSizes {
    fn default() -> Self {
        Self {
            occlusion: 64,
            binary_occlusion: 64,
            timestamp: 128,
            pipeline_statistics: 32,
            duration: 128,
        }
    }
}

/// Device-wide settings fixed at creation time.
#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct DeviceConfig {
    #[builder(default)]
    pub query_pool_sizes: QueryPoolSizes,
    #[builder(default)]
    pub stale_query_reuse: StaleQueryReuse,
    /// Size of the host-visible buffer backing all dynamic heaps.
    #[builder(default = "8 << 20")]
    pub dynamic_heap_size: vk::DeviceSize,
    /// Smallest master block a context heap takes from the shared buffer.
    #[builder(default = "256 << 10")]
    pub dynamic_heap_page_size: vk::DeviceSize,
    /// The immediate context submits on its own after this many draws and dispatches.
    #[builder(default = "4096")]
    pub num_commands_to_flush: u32,
    /// Shader stages that shader reads and writes are synchronized against.
    #[builder(default = "default_shader_stages()")]
    pub shader_stages: vk::PipelineStageFlags2,
}

fn default_shader_stages() -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::VERTEX_SHADER
        | vk::PipelineStageFlags2::FRAGMENT_SHADER
        | vk::PipelineStageFlags2::COMPUTE_SHADER
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            query_pool_sizes: QueryPoolSizes::default(),
            stale_query_reuse: StaleQueryReuse::default(),
            dynamic_heap_size: 8 << 20,
            dynamic_heap_page_size: 256 << 10,
            num_commands_to_flush: 4096,
            shader_stages: default_shader_stages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = DeviceConfigBuilder::default()
            .num_commands_to_flush(16u32)
            .build()
            .unwrap();
        assert_eq!(config.num_commands_to_flush, 16);
        assert_eq!(config.dynamic_heap_page_size, DeviceConfig::default().dynamic_heap_page_size);
        assert_eq!(config.query_pool_sizes.get(QueryType::Timestamp), 128);
        assert_eq!(config.stale_query_reuse, StaleQueryReuse::Front);
    }
}
