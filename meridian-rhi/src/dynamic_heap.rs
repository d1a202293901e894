//! Per-frame transient memory.
//!
//! One host-visible buffer per device is split into master blocks by [`DynamicMemoryManager`].
//! Every context owns a [`DynamicHeap`] that carves its allocations linearly out of master blocks
//! and gives the blocks back, through the release queue, when its frame ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use ash::vk;
use parking_lot::Mutex;
use crate::backend::{GpuBackend, NativeBuffer, NativeObject};
use crate::device::RenderDevice;
use crate::error::{verify, RhiError};
use crate::resource::{BufferDesc, Usage};

/// Granularity of master block offsets and sizes.
pub const MASTER_BLOCK_ALIGNMENT: vk::DeviceSize = 1024;

#[inline]
pub(crate) fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A contiguous range of the shared dynamic buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterBlock {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// First-fit free list over `[0, size)` that merges neighbouring free ranges.
#[derive(Debug)]
struct FreeList {
    /// offset -> size
    free: BTreeMap<vk::DeviceSize, vk::DeviceSize>,
    size: vk::DeviceSize,
    used: vk::DeviceSize,
    peak: vk::DeviceSize,
}

impl FreeList {
    fn new(size: vk::DeviceSize) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self { free, size, used: 0, peak: 0 }
    }

    fn allocate(&mut self, size: vk::DeviceSize) -> Option<MasterBlock> {
        let size = align_up(size.max(1), MASTER_BLOCK_ALIGNMENT);
        let (&offset, &block_size) = self.free.iter().find(|&(_, &block_size)| block_size >= size)?;
        self.free.remove(&offset);
        if block_size > size {
            self.free.insert(offset + size, block_size - size);
        }
        self.used += size;
        self.peak = self.peak.max(self.used);
        Some(MasterBlock { offset, size })
    }

    fn release(&mut self, block: MasterBlock) {
        verify!(
            block.offset + block.size <= self.size,
            "Master block {:?} is outside the heap",
            block
        );
        let mut offset = block.offset;
        let mut size = block.size;

        if let Some((&prev_offset, &prev_size)) = self.free.range(..offset).next_back() {
            verify!(prev_offset + prev_size <= offset, "Master block {:?} is released twice", block);
            if prev_offset + prev_size == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(block.offset + block.size)) {
            self.free.remove(&(block.offset + block.size));
            size += next_size;
        }

        self.free.insert(offset, size);
        self.used -= block.size;
    }

    fn free_ranges(&self) -> usize {
        self.free.len()
    }
}

/// Owner of the device-wide dynamic buffer.
pub struct DynamicMemoryManager {
    backend: Arc<dyn GpuBackend>,
    buffer: NativeBuffer,
    size: vk::DeviceSize,
    free_list: Mutex<FreeList>,
}

impl DynamicMemoryManager {
    pub fn new(backend: Arc<dyn GpuBackend>, size: vk::DeviceSize) -> Result<Self, RhiError> {
        let size = align_up(size, MASTER_BLOCK_ALIGNMENT);
        let desc = BufferDesc::new("dynamic heap", size)
            .with_bind_flags(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER,
            )
            .with_usage(Usage::Staging);
        let buffer = backend.create_buffer(&desc, true)?;
        log::info!("Dynamic heap created: {} KiB", size >> 10);

        Ok(Self {
            backend,
            buffer,
            size,
            free_list: Mutex::new(FreeList::new(size)),
        })
    }

    pub fn allocate_master_block(&self, size: vk::DeviceSize) -> Option<MasterBlock> {
        if size > self.size {
            log::error!(
                "Requested dynamic allocation of {} bytes exceeds the dynamic heap size of {} bytes",
                size,
                self.size
            );
            return None;
        }
        self.free_list.lock().allocate(size)
    }

    pub fn release_master_block(&self, block: MasterBlock) {
        self.free_list.lock().release(block);
    }

    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), RhiError> {
        self.backend.write_buffer(&self.buffer, offset, data)
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn used_size(&self) -> vk::DeviceSize {
        self.free_list.lock().used
    }
}

impl Drop for DynamicMemoryManager {
    fn drop(&mut self) {
        let free_list = self.free_list.get_mut();
        log::info!(
            "Dynamic heap usage: peak {} KiB of {} KiB ({:.1}%)",
            free_list.peak >> 10,
            self.size >> 10,
            free_list.peak as f64 / self.size.max(1) as f64 * 100.0
        );
        if free_list.used != 0 {
            log::warn!("{} bytes of the dynamic heap are still allocated", free_list.used);
        }
        self.backend.destroy(NativeObject::Buffer(self.buffer));
    }
}

/// A sub-allocation valid only during the frame it was made in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicAllocation {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub frame: u64,
}

/// Linear per-context allocator over master blocks.
pub struct DynamicHeap {
    name: String,
    page_size: vk::DeviceSize,
    master_blocks: Vec<MasterBlock>,
    /// Next free offset and bytes left in the current master block.
    cursor: Option<(vk::DeviceSize, vk::DeviceSize)>,
    frame: u64,
    curr_used: vk::DeviceSize,
    peak_used: vk::DeviceSize,
    curr_allocated: vk::DeviceSize,
    peak_allocated: vk::DeviceSize,
}

impl DynamicHeap {
    pub fn new(name: impl Into<String>, page_size: vk::DeviceSize) -> Self {
        Self {
            name: name.into(),
            page_size: align_up(page_size.max(MASTER_BLOCK_ALIGNMENT), MASTER_BLOCK_ALIGNMENT),
            master_blocks: Vec::new(),
            cursor: None,
            frame: 0,
            curr_used: 0,
            peak_used: 0,
            curr_allocated: 0,
            peak_allocated: 0,
        }
    }

    #[profiling::function]
    pub fn allocate(
        &mut self,
        device: &RenderDevice,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<DynamicAllocation> {
        verify!(alignment.is_power_of_two(), "Alignment {} is not a power of two", alignment);
        let buffer = device.dynamic_memory().buffer();

        let offset = if size > self.page_size / 2 {
            // Large requests get a master block of their own.
            let block = device.allocate_master_block(size + alignment)?;
            self.curr_allocated += block.size;
            self.master_blocks.push(block);
            align_up(block.offset, alignment)
        } else {
            let fits = |cursor: Option<(vk::DeviceSize, vk::DeviceSize)>| {
                cursor.is_some_and(|(offset, available)| size + (align_up(offset, alignment) - offset) <= available)
            };
            if !fits(self.cursor) {
                let block = device.allocate_master_block(self.page_size)?;
                self.curr_allocated += block.size;
                self.master_blocks.push(block);
                self.cursor = Some((block.offset, block.size));
            }
            let (offset, available) = self.cursor?;
            let aligned = align_up(offset, alignment);
            let consumed = size + (aligned - offset);
            self.cursor = Some((offset + consumed, available - consumed));
            aligned
        };

        self.curr_used += size;
        self.peak_used = self.peak_used.max(self.curr_used);
        self.peak_allocated = self.peak_allocated.max(self.curr_allocated);

        Some(DynamicAllocation {
            buffer,
            offset,
            size,
            frame: self.frame,
        })
    }

    /// Debug check that `allocation` belongs to the current frame.
    #[inline]
    pub fn verify_allocation(&self, allocation: &DynamicAllocation) {
        verify!(
            allocation.frame == self.frame,
            "Dynamic allocation from frame {} used in frame {} of heap '{}'; map the buffer again",
            allocation.frame,
            self.frame,
            self.name
        );
    }

    /// End the frame: hand back every master block and invalidate all allocations.
    pub fn release_master_blocks(&mut self) -> Vec<MasterBlock> {
        self.cursor = None;
        self.curr_used = 0;
        self.curr_allocated = 0;
        self.frame += 1;
        std::mem::take(&mut self.master_blocks)
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn allocated_size(&self) -> vk::DeviceSize {
        self.curr_allocated
    }
}

impl Drop for DynamicHeap {
    fn drop(&mut self) {
        verify!(
            self.master_blocks.is_empty(),
            "Dynamic heap '{}' dropped with {} master blocks still held",
            self.name,
            self.master_blocks.len()
        );
        log::debug!(
            "Dynamic heap '{}' peak usage: {} bytes used, {} bytes allocated",
            self.name,
            self.peak_used,
            self.peak_allocated
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_coalesces_neighbours() {
        let mut list = FreeList::new(8 * MASTER_BLOCK_ALIGNMENT);
        let a = list.allocate(MASTER_BLOCK_ALIGNMENT).unwrap();
        let b = list.allocate(2 * MASTER_BLOCK_ALIGNMENT).unwrap();
        let c = list.allocate(MASTER_BLOCK_ALIGNMENT).unwrap();
        assert_eq!(b.offset, MASTER_BLOCK_ALIGNMENT);
        assert_eq!(list.used, 4 * MASTER_BLOCK_ALIGNMENT);

        list.release(a);
        list.release(c);
        assert_eq!(list.free_ranges(), 2);
        list.release(b);
        assert_eq!(list.free_ranges(), 1);
        assert_eq!(list.used, 0);
        assert_eq!(list.peak, 4 * MASTER_BLOCK_ALIGNMENT);
    }

    #[test]
    fn free_list_is_first_fit() {
        let mut list = FreeList::new(4 * MASTER_BLOCK_ALIGNMENT);
        let a = list.allocate(MASTER_BLOCK_ALIGNMENT).unwrap();
        let _b = list.allocate(MASTER_BLOCK_ALIGNMENT).unwrap();
        list.release(a);
        // The hole at the front is reused before the tail.
        assert_eq!(list.allocate(10).unwrap().offset, 0);
        assert!(list.allocate(3 * MASTER_BLOCK_ALIGNMENT).is_none());
    }

    #[test]
    fn sizes_round_to_block_alignment() {
        let mut list = FreeList::new(4 * MASTER_BLOCK_ALIGNMENT);
        let block = list.allocate(1).unwrap();
        assert_eq!(block.size, MASTER_BLOCK_ALIGNMENT);
    }
}
