use super::{align_down, align_up, chunk::MemoryChunk, BlockRun};
use crate::{device::RawDevice, DeviceSize, VulkanError};
use ash::vk;
use std::{ffi::c_void, ptr::NonNull};

/// The chunks of one memory type.
#[derive(Debug)]
pub(super) struct HeapAllocator {
    memory_type_index: u32,
    heap_index: u32,
    chunk_size: DeviceSize,
    linear: ChunkCollection,
    optimal: ChunkCollection,
}

#[derive(Debug)]
struct ChunkCollection {
    alignment: DeviceSize,
    chunks: Vec<MemoryChunk>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CollectionKind {
    Linear,
    Optimal,
}

/// Where a heap allocation landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct HeapAllocation {
    pub(super) memory: vk::DeviceMemory,
    pub(super) offset: DeviceSize,
    pub(super) size: DeviceSize,
    pub(super) run: BlockRun,
}

impl HeapAllocation {
    fn new(chunk: &MemoryChunk, run: BlockRun) -> Self {
        HeapAllocation {
            memory: chunk.memory(),
            offset: chunk.block_offset(run.start),
            size: DeviceSize::from(run.count) * chunk.alignment(),
            run,
        }
    }
}

impl ChunkCollection {
    fn new(alignment: DeviceSize) -> Self {
        ChunkCollection {
            alignment,
            chunks: Vec::new(),
        }
    }

    /// How many bytes an allocation in this collection wastes at worst: the rounding of `size`
    /// up to whole blocks, plus the blocks that may be skipped to reach an offset that is a
    /// multiple of `offset_alignment`.
    fn waste(&self, size: DeviceSize, offset_alignment: DeviceSize) -> DeviceSize {
        let rounding = align_up(size.max(1), self.alignment) - size;
        let padding = offset_alignment.saturating_sub(self.alignment);

        rounding + padding
    }

    /// Tries the chunks from newest to oldest.
    fn allocate(
        &mut self,
        size: DeviceSize,
        offset_alignment: DeviceSize,
    ) -> Option<HeapAllocation> {
        self.chunks.iter_mut().rev().find_map(|chunk| {
            chunk
                .allocate(size, offset_alignment)
                .map(|run| HeapAllocation::new(chunk, run))
        })
    }

    fn chunk_mut(&mut self, memory: vk::DeviceMemory) -> Option<&mut MemoryChunk> {
        self.chunks.iter_mut().find(|chunk| chunk.memory() == memory)
    }
}

impl HeapAllocator {
    pub(super) fn new(
        memory_type_index: u32,
        heap_index: u32,
        chunk_size: DeviceSize,
        linear_alignment: DeviceSize,
        optimal_alignment: DeviceSize,
    ) -> Self {
        HeapAllocator {
            memory_type_index,
            heap_index,
            chunk_size,
            linear: ChunkCollection::new(linear_alignment),
            optimal: ChunkCollection::new(optimal_alignment),
        }
    }

    fn collection_mut(&mut self, kind: CollectionKind) -> &mut ChunkCollection {
        match kind {
            CollectionKind::Linear => &mut self.linear,
            CollectionKind::Optimal => &mut self.optimal,
        }
    }

    /// Suballocates `size` bytes at an offset that is a multiple of `offset_alignment`.
    ///
    /// Existing chunks of the collection that wastes less are tried first, then those of the
    /// other collection. Only then is a new chunk allocated. Returns
    /// [`VulkanError::OutOfDeviceMemory`] when the heap has no room left for a chunk large
    /// enough.
    pub(super) fn allocate(
        &mut self,
        device: &dyn RawDevice,
        size: DeviceSize,
        offset_alignment: DeviceSize,
    ) -> Result<HeapAllocation, VulkanError> {
        let (cheaper, other) = if self.linear.waste(size, offset_alignment)
            <= self.optimal.waste(size, offset_alignment)
        {
            (CollectionKind::Linear, CollectionKind::Optimal)
        } else {
            (CollectionKind::Optimal, CollectionKind::Linear)
        };

        for kind in [cheaper, other] {
            if let Some(allocation) = self.collection_mut(kind).allocate(size, offset_alignment) {
                return Ok(allocation);
            }
        }

        self.grow(device, cheaper, size, offset_alignment)
    }

    fn grow(
        &mut self,
        device: &dyn RawDevice,
        kind: CollectionKind,
        size: DeviceSize,
        offset_alignment: DeviceSize,
    ) -> Result<HeapAllocation, VulkanError> {
        let memory_type_index = self.memory_type_index;
        let heap_index = self.heap_index;
        let default_chunk_size = self.chunk_size;
        let heap_usage = device.heap_usage(heap_index);
        let collection = self.collection_mut(kind);
        let alignment = collection.alignment;

        let request = align_up(size.max(1), alignment);
        let room = heap_usage.available().saturating_sub(alignment);
        let chunk_size = align_down(default_chunk_size.max(request).min(room), alignment);

        if chunk_size == 0 || chunk_size < request {
            log::debug!(
                "heap {} has {} bytes left, which cannot fit a chunk of {} bytes",
                heap_index,
                heap_usage.available(),
                request,
            );

            return Err(VulkanError::OutOfDeviceMemory);
        }

        let memory = device.allocate_memory(memory_type_index, chunk_size)?;

        log::trace!(
            "allocated a chunk of {} bytes with {}-byte blocks from memory type {}",
            chunk_size,
            alignment,
            memory_type_index,
        );

        let mut chunk = MemoryChunk::new(memory, chunk_size, alignment);

        // The first block of a fresh chunk is at offset 0, which satisfies any alignment.
        let allocation = chunk
            .allocate(size, offset_alignment)
            .map(|run| HeapAllocation::new(&chunk, run));
        collection.chunks.push(chunk);

        allocation.ok_or(VulkanError::OutOfDeviceMemory)
    }

    fn chunk_mut(&mut self, memory: vk::DeviceMemory) -> Option<&mut MemoryChunk> {
        let Self {
            linear, optimal, ..
        } = self;

        linear
            .chunk_mut(memory)
            .or_else(|| optimal.chunk_mut(memory))
    }

    /// Returns `run` to the chunk that owns `memory`.
    ///
    /// # Panics
    ///
    /// - Panics if `memory` isn't a chunk of this heap allocator.
    pub(super) fn free(&mut self, memory: vk::DeviceMemory, run: BlockRun) {
        let memory_type_index = self.memory_type_index;

        match self.chunk_mut(memory) {
            Some(chunk) => chunk.free(run),
            None => panic!(
                "the allocation was not made from memory type {}",
                memory_type_index,
            ),
        }
    }

    pub(super) fn map(
        &mut self,
        device: &dyn RawDevice,
        memory: vk::DeviceMemory,
    ) -> Result<NonNull<c_void>, VulkanError> {
        match self.chunk_mut(memory) {
            Some(chunk) => chunk.map(device),
            None => panic!("the allocation does not belong to this allocator"),
        }
    }

    pub(super) fn unmap(&mut self, device: &dyn RawDevice, memory: vk::DeviceMemory) {
        if let Some(chunk) = self.chunk_mut(memory) {
            chunk.unmap(device);
        }
    }

    pub(super) fn chunks(&self) -> impl Iterator<Item = &MemoryChunk> {
        self.linear.chunks.iter().chain(&self.optimal.chunks)
    }

    #[cfg(test)]
    pub(super) fn chunk(&self, memory: vk::DeviceMemory) -> Option<&MemoryChunk> {
        self.chunks().find(|chunk| chunk.memory() == memory)
    }

    /// Frees every chunk.
    ///
    /// # Safety
    ///
    /// - No memory of this heap allocator may be in use by the device.
    pub(super) unsafe fn destroy(&mut self, device: &dyn RawDevice) {
        for mut chunk in self.linear.chunks.drain(..).chain(self.optimal.chunks.drain(..)) {
            // SAFETY: The caller must ensure that the memory is not in use.
            unsafe { chunk.destroy(device) };
        }
    }
}
