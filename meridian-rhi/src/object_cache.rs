//! Cache of vertex binding sets keyed by pipeline, index buffer and vertex streams.
//!
//! Keys are built from object identities, never native handles, so a destroyed and recreated
//! buffer can not alias an old entry. Reverse maps from every referenced object to its keys make
//! invalidation proportional to the number of entries that use the destroyed object.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;
use meridian_core::collections::hashmap::HashMap;
use meridian_core::collections::hashset::HashSet;
use parking_lot::Mutex;
use smallvec::SmallVec;
use crate::error::verify;
use crate::resource::{BufferId, PipelineId, ResourceArena, MAX_BUFFER_SLOTS};

/// A vertex buffer bound to one slot of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VertexStream {
    pub buffer: Option<BufferId>,
    pub offset: vk::DeviceSize,
}

impl VertexStream {
    pub fn new(buffer: BufferId, offset: vk::DeviceSize) -> Self {
        Self { buffer: Some(buffer), offset }
    }
}

/// Key component for one slot the pipeline reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub slot: u32,
    pub buffer: BufferId,
    pub stride: u32,
    pub offset: vk::DeviceSize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectCacheKey {
    pub pipeline: PipelineId,
    pub index_buffer: Option<BufferId>,
    /// Only slots referenced by the pipeline's input layout, in slot order.
    pub streams: SmallVec<[StreamKey; 4]>,
}

impl ObjectCacheKey {
    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.index_buffer.into_iter().chain(self.streams.iter().map(|s| s.buffer))
    }
}

/// One resolved vertex stream of a binding set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundStream {
    pub slot: u32,
    pub buffer: BufferId,
    /// Null for dynamic buffers; the context substitutes its current allocation.
    pub handle: vk::Buffer,
    pub offset: vk::DeviceSize,
}

/// The cached composite: native vertex and index bindings for one key.
#[derive(Debug)]
pub struct VertexBindingSet {
    pub key: ObjectCacheKey,
    pub streams: SmallVec<[BoundStream; 4]>,
    pub index_buffer: Option<vk::Buffer>,
    pub serial: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct CacheMaps {
    entries: HashMap<ObjectCacheKey, Arc<VertexBindingSet>>,
    by_pipeline: HashMap<PipelineId, HashSet<ObjectCacheKey>>,
    by_buffer: HashMap<BufferId, HashSet<ObjectCacheKey>>,
}

impl CacheMaps {
    fn insert(&mut self, set: Arc<VertexBindingSet>) {
        let key = set.key.clone();
        self.by_pipeline.entry(key.pipeline).or_default().insert(key.clone());
        for buffer in key.buffers() {
            self.by_buffer.entry(buffer).or_default().insert(key.clone());
        }
        self.entries.insert(key, set);
    }

    /// Drop `key` from the forward map and from every reverse map except `skip_*`.
    fn remove(&mut self, key: &ObjectCacheKey, skip_pipeline: bool, skip_buffer: Option<BufferId>) {
        self.entries.remove(key);
        if !skip_pipeline {
            if let Some(keys) = self.by_pipeline.get_mut(&key.pipeline) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_pipeline.remove(&key.pipeline);
                }
            }
        }
        for buffer in key.buffers() {
            if Some(buffer) == skip_buffer {
                continue;
            }
            if let Some(keys) = self.by_buffer.get_mut(&buffer) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_buffer.remove(&buffer);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.by_pipeline.is_empty() && self.by_buffer.is_empty()
    }
}

/// Device-wide binding-set cache shared by all contexts behind one lock.
#[derive(Default)]
pub struct ObjectCache {
    maps: Mutex<CacheMaps>,
    next_serial: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for a draw with `pipeline`, or `None` if the pipeline is unknown or a slot it reads is unbound.
    pub fn make_key(
        arena: &ResourceArena,
        pipeline: PipelineId,
        index_buffer: Option<BufferId>,
        streams: &[VertexStream],
    ) -> Option<ObjectCacheKey> {
        let Some(entry) = arena.pipelines.get(&pipeline) else {
            log::error!("{} is not registered with the device", pipeline);
            return None;
        };

        let referenced = entry.desc.referenced_slots();
        let mut keys = SmallVec::new();
        for slot in 0..MAX_BUFFER_SLOTS as u32 {
            if referenced & (1 << slot) == 0 {
                continue;
            }
            let Some(buffer) = streams.get(slot as usize).and_then(|s| s.buffer) else {
                log::error!(
                    "Pipeline '{}' reads vertex buffer slot {} but no buffer is bound to it",
                    entry.desc.name,
                    slot
                );
                return None;
            };
            keys.push(StreamKey {
                slot,
                buffer,
                stride: entry.desc.stride(slot),
                offset: streams[slot as usize].offset,
            });
        }

        Some(ObjectCacheKey {
            pipeline,
            index_buffer,
            streams: keys,
        })
    }

    /// Look up the binding set for this combination, creating it on first use.
    #[profiling::function]
    pub fn get_or_create(
        &self,
        arena: &ResourceArena,
        pipeline: PipelineId,
        index_buffer: Option<BufferId>,
        streams: &[VertexStream],
    ) -> Option<Arc<VertexBindingSet>> {
        let key = Self::make_key(arena, pipeline, index_buffer, streams)?;

        let mut maps = self.maps.lock();
        if let Some(set) = maps.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(set.clone());
        }

        let mut bound = SmallVec::new();
        for stream in key.streams.iter() {
            let Some(buffer) = arena.buffers.get(&stream.buffer) else {
                log::error!("Vertex {} is not registered with the device", stream.buffer);
                return None;
            };
            verify!(
                buffer.desc.bind_flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER),
                "Buffer '{}' bound to slot {} was not created with VERTEX_BUFFER",
                buffer.desc.name,
                stream.slot
            );
            bound.push(BoundStream {
                slot: stream.slot,
                buffer: stream.buffer,
                handle: buffer.native.handle,
                offset: stream.offset,
            });
        }

        let index_handle = match key.index_buffer {
            Some(id) => {
                let Some(buffer) = arena.buffers.get(&id) else {
                    log::error!("Index {} is not registered with the device", id);
                    return None;
                };
                Some(buffer.native.handle)
            }
            None => None,
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let set = Arc::new(VertexBindingSet {
            key,
            streams: bound,
            index_buffer: index_handle,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
        });
        log::debug!("Object cache miss: new binding set {} for {}", set.serial, set.key.pipeline);
        maps.insert(set.clone());
        Some(set)
    }

    /// Remove every entry whose key references `buffer`.
    pub fn on_destroy_buffer(&self, buffer: BufferId) {
        let mut maps = self.maps.lock();
        let Some(keys) = maps.by_buffer.remove(&buffer) else {
            return;
        };
        for key in keys.iter() {
            maps.remove(key, false, Some(buffer));
        }
    }

    /// Remove every entry built for `pipeline`.
    pub fn on_destroy_pipeline(&self, pipeline: PipelineId) {
        let mut maps = self.maps.lock();
        let Some(keys) = maps.by_pipeline.remove(&pipeline) else {
            return;
        };
        for key in keys.iter() {
            maps.remove(key, true, None);
        }
    }

    pub fn contains(&self, key: &ObjectCacheKey) -> bool {
        self.maps.lock().entries.contains_key(key)
    }

    /// Number of live entries whose key mentions `buffer`.
    pub fn entries_referencing_buffer(&self, buffer: BufferId) -> usize {
        self.maps
            .lock()
            .entries
            .keys()
            .filter(|key| key.buffers().any(|b| b == buffer))
            .count()
    }

    pub fn entries_referencing_pipeline(&self, pipeline: PipelineId) -> usize {
        self.maps.lock().entries.keys().filter(|key| key.pipeline == pipeline).count()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().entries.len()
    }

    /// True when the forward map and both reverse maps are empty.
    pub fn is_empty(&self) -> bool {
        self.maps.lock().is_empty()
    }

    pub fn stats(&self) -> ObjectCacheStats {
        ObjectCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        let maps = self.maps.get_mut();
        if maps.is_empty() {
            return;
        }
        log::error!(
            "Object cache destroyed with {} entries, {} pipeline and {} buffer back-references. \
             An object outlived the device or was never destroyed.",
            maps.entries.len(),
            maps.by_pipeline.len(),
            maps.by_buffer.len()
        );
        if !std::thread::panicking() {
            verify!(false, "Object cache is not empty at destruction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeBuffer;
    use crate::resource::{BufferDesc, BufferEntry, LayoutElement, PipelineDesc, PipelineEntry};
    use crate::state::ResourceState;
    use ash::vk::Handle;

    fn arena_with(buffers: &[u64], pipelines: &[(u64, &[u32])]) -> ResourceArena {
        let mut arena = ResourceArena::default();
        for &id in buffers {
            arena.buffers.insert(
                BufferId(id),
                BufferEntry {
                    desc: BufferDesc::vertex("vb", 64).with_additional_bind_flags(vk::BufferUsageFlags::INDEX_BUFFER),
                    native: NativeBuffer {
                        handle: vk::Buffer::from_raw(0x100 + id),
                        memory: vk::DeviceMemory::null(),
                    },
                    state: ResourceState::UNDEFINED,
                },
            );
        }
        for &(id, slots) in pipelines {
            let mut desc = PipelineDesc::graphics("p", vk::PipelineLayout::null());
            for (i, &slot) in slots.iter().enumerate() {
                desc = desc
                    .with_input_layout([LayoutElement {
                        input_index: i as u32,
                        buffer_slot: slot,
                        format: vk::Format::R32G32B32_SFLOAT,
                        offset: 0,
                    }])
                    .with_stride(slot, 12);
            }
            arena.pipelines.insert(
                PipelineId(id),
                PipelineEntry {
                    desc,
                    handle: vk::Pipeline::from_raw(0x900 + id),
                },
            );
        }
        arena
    }

    fn streams(ids: &[u64]) -> Vec<VertexStream> {
        ids.iter().map(|&id| VertexStream::new(BufferId(id), 0)).collect()
    }

    #[test]
    fn unreferenced_slots_stay_out_of_the_key() {
        let arena = arena_with(&[1, 2, 3, 9], &[(10, &[0])]);
        let cache = ObjectCache::new();

        let first = cache
            .get_or_create(&arena, PipelineId(10), Some(BufferId(9)), &streams(&[1, 2]))
            .unwrap();
        assert_eq!(first.key.streams.len(), 1);
        assert_eq!(first.key.streams[0].buffer, BufferId(1));

        let second = cache
            .get_or_create(&arena, PipelineId(10), Some(BufferId(9)), &streams(&[1, 3]))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), ObjectCacheStats { entries: 1, hits: 1, misses: 1 });

        cache.on_destroy_pipeline(PipelineId(10));
        assert!(cache.is_empty());
    }

    #[test]
    fn destroying_a_buffer_drops_only_its_entries() {
        let arena = arena_with(&[1, 2, 9], &[(10, &[0])]);
        let cache = ObjectCache::new();
        let a = cache.get_or_create(&arena, PipelineId(10), None, &streams(&[1])).unwrap();
        let b = cache.get_or_create(&arena, PipelineId(10), None, &streams(&[2])).unwrap();
        let c = cache.get_or_create(&arena, PipelineId(10), Some(BufferId(9)), &streams(&[2])).unwrap();
        assert_eq!(cache.len(), 3);

        cache.on_destroy_buffer(BufferId(1));
        assert!(!cache.contains(&a.key));
        assert!(cache.contains(&b.key));

        // The index buffer is tracked too.
        cache.on_destroy_buffer(BufferId(9));
        assert!(!cache.contains(&c.key));
        assert_eq!(cache.entries_referencing_buffer(BufferId(9)), 0);

        cache.on_destroy_buffer(BufferId(2));
        assert!(cache.is_empty());
    }

    #[test]
    fn unbound_referenced_slot_is_rejected() {
        let arena = arena_with(&[1], &[(10, &[0, 1])]);
        let cache = ObjectCache::new();
        assert!(cache.get_or_create(&arena, PipelineId(10), None, &streams(&[1])).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn offsets_and_strides_are_part_of_the_key() {
        let arena = arena_with(&[1], &[(10, &[0])]);
        let cache = ObjectCache::new();
        let a = cache
            .get_or_create(&arena, PipelineId(10), None, &[VertexStream::new(BufferId(1), 0)])
            .unwrap();
        let b = cache
            .get_or_create(&arena, PipelineId(10), None, &[VertexStream::new(BufferId(1), 48)])
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.streams[0].offset, 48);
        assert_eq!(a.key.streams[0].stride, 12);
        cache.on_destroy_buffer(BufferId(1));
        assert!(cache.is_empty());
    }
}
