use super::BlockRun;
use crate::{device::RawDevice, DeviceSize, VulkanError};
use ash::vk;
use std::{ffi::c_void, ptr::NonNull};

/// Index that terminates the free list. Block 0 is never handed out.
const NIL: u32 = 0;

#[derive(Clone, Copy, Debug, Default)]
struct MemoryBlock {
    next_free: u32,
}

#[derive(Debug)]
struct ChunkMapping {
    ptr: NonNull<c_void>,
    count: u32,
}

// SAFETY: The pointer is a view into device memory that the chunk owns. It is only handed out
// through allocations, and the chunk itself never reads or writes through it.
unsafe impl Send for ChunkMapping {}

// SAFETY: See the `Send` impl.
unsafe impl Sync for ChunkMapping {}

/// One device memory allocation sliced into blocks of `alignment` bytes.
///
/// Free blocks form a singly linked list threaded through `blocks`, kept sorted by index so that
/// adjacent free blocks are also adjacent in the list.
#[derive(Debug)]
pub(super) struct MemoryChunk {
    memory: vk::DeviceMemory,
    size: DeviceSize,
    alignment: DeviceSize,
    blocks: Vec<MemoryBlock>,
    free_head: u32,
    mapping: Option<ChunkMapping>,
}

impl MemoryChunk {
    pub(super) fn new(memory: vk::DeviceMemory, size: DeviceSize, alignment: DeviceSize) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(size != 0 && size % alignment == 0);

        let block_count = u32::try_from(size / alignment)
            .expect("the chunk holds more blocks than can be indexed");

        let mut blocks = vec![MemoryBlock::default(); block_count as usize + 1];

        for index in 1..block_count {
            blocks[index as usize].next_free = index + 1;
        }

        MemoryChunk {
            memory,
            size,
            alignment,
            blocks,
            free_head: 1,
            mapping: None,
        }
    }

    #[inline]
    pub(super) fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub(super) fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub(super) fn alignment(&self) -> DeviceSize {
        self.alignment
    }

    #[inline]
    pub(super) fn block_count(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    #[inline]
    pub(super) fn block_offset(&self, index: u32) -> DeviceSize {
        DeviceSize::from(index - 1) * self.alignment
    }

    /// The number of blocks a request of `size` bytes occupies. Zero-sized requests still take a
    /// block.
    #[inline]
    pub(super) fn blocks_for(&self, size: DeviceSize) -> DeviceSize {
        size.div_ceil(self.alignment).max(1)
    }

    /// Finds the first run of free blocks that is long enough for `size` bytes and whose offset
    /// is a multiple of `offset_alignment`, and takes it out of the free list.
    pub(super) fn allocate(
        &mut self,
        size: DeviceSize,
        offset_alignment: DeviceSize,
    ) -> Option<BlockRun> {
        let needed = self.blocks_for(size);

        if needed > DeviceSize::from(self.block_count()) {
            return None;
        }

        let needed = needed as u32;
        let offset_alignment = offset_alignment.max(1);

        // The free node that precedes the current run, or `NIL` if the run starts at the head.
        let mut before_run = NIL;
        let mut run_start = NIL;
        let mut run_len = 0;
        let mut previous = NIL;
        let mut current = self.free_head;

        while current != NIL {
            if run_len != 0 && current == run_start + run_len {
                run_len += 1;
            } else if self.block_offset(current) % offset_alignment == 0 {
                before_run = previous;
                run_start = current;
                run_len = 1;
            } else {
                run_len = 0;
            }

            if run_len == needed {
                let after_run = self.blocks[current as usize].next_free;

                if before_run == NIL {
                    self.free_head = after_run;
                } else {
                    self.blocks[before_run as usize].next_free = after_run;
                }

                for block in &mut self.blocks[run_start as usize..=current as usize] {
                    block.next_free = NIL;
                }

                return Some(BlockRun {
                    start: run_start,
                    count: needed,
                });
            }

            previous = current;
            current = self.blocks[current as usize].next_free;
        }

        None
    }

    /// Puts the blocks of `run` back into the free list.
    pub(super) fn free(&mut self, run: BlockRun) {
        assert!(run.start != NIL && run.end() <= self.blocks.len() as u32);

        let mut previous = NIL;
        let mut current = self.free_head;

        while current != NIL && current < run.start {
            previous = current;
            current = self.blocks[current as usize].next_free;
        }

        debug_assert!(
            current == NIL || current >= run.end(),
            "block {} was freed twice",
            current,
        );

        let last = run.end() - 1;

        for index in run.start..last {
            self.blocks[index as usize].next_free = index + 1;
        }

        self.blocks[last as usize].next_free = current;

        if previous == NIL {
            self.free_head = run.start;
        } else {
            self.blocks[previous as usize].next_free = run.start;
        }
    }

    /// Maps the chunk if it isn't mapped yet, and returns the pointer to its start.
    pub(super) fn map(&mut self, device: &dyn RawDevice) -> Result<NonNull<c_void>, VulkanError> {
        if let Some(mapping) = &mut self.mapping {
            mapping.count += 1;

            return Ok(mapping.ptr);
        }

        // SAFETY: The chunk is not mapped and its memory is host-visible, which the allocator
        // checks before calling.
        let ptr = unsafe { device.map_memory(self.memory) }?;
        self.mapping = Some(ChunkMapping { ptr, count: 1 });

        Ok(ptr)
    }

    /// Drops one reference to the mapping. Returns `true` if the chunk was actually unmapped.
    pub(super) fn unmap(&mut self, device: &dyn RawDevice) -> bool {
        let Some(mapping) = &mut self.mapping else {
            return false;
        };

        mapping.count -= 1;

        if mapping.count != 0 {
            return false;
        }

        self.mapping = None;

        // SAFETY: The chunk is mapped and no allocation holds a pointer into it anymore.
        unsafe { device.unmap_memory(self.memory) };

        true
    }

    /// Unmaps and frees the device memory.
    ///
    /// # Safety
    ///
    /// - The memory must not be in use by the device.
    pub(super) unsafe fn destroy(&mut self, device: &dyn RawDevice) {
        if self.mapping.take().is_some() {
            // SAFETY: The chunk is mapped.
            unsafe { device.unmap_memory(self.memory) };
        }

        // SAFETY: The caller must ensure that the memory is not in use.
        unsafe { device.free_memory(self.memory) };
    }

    pub(super) fn free_block_count(&self) -> u32 {
        self.free_blocks().count() as u32
    }

    pub(super) fn free_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        let mut current = self.free_head;

        std::iter::from_fn(move || {
            if current == NIL {
                return None;
            }

            let index = current;
            current = self.blocks[index as usize].next_free;

            Some(index)
        })
    }

    #[cfg(test)]
    pub(super) fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}
