use super::{heap::HeapAllocator, MemoryAllocation, MemoryRequirements, MemoryUsage};
use crate::{device::RawDevice, DeviceSize, NonExhaustive, VulkanError};
use ash::vk;
use std::{ffi::c_void, fmt, ptr::NonNull, sync::Arc};

/// Parameters to create a [`BlockAllocator`].
#[derive(Clone, Debug)]
pub struct BlockAllocatorCreateInfo {
    /// The size of newly allocated chunks. Larger requests get a chunk of their own size, and
    /// chunks are shrunk to fit the remaining budget of their heap.
    ///
    /// The default value is 64 MiB.
    pub chunk_size: DeviceSize,

    /// The block size of the chunks used for linear resources. Must be a power of two.
    ///
    /// The default value is `256`.
    pub linear_alignment: DeviceSize,

    /// The block size of the chunks used for optimal-tiling resources, as a multiple of
    /// `linear_alignment`. Must be a power of two.
    ///
    /// The default value is `16`.
    pub optimal_alignment_multiplier: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for BlockAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        BlockAllocatorCreateInfo {
            chunk_size: 64 * 1024 * 1024,
            linear_alignment: 256,
            optimal_alignment_multiplier: 16,
            _ne: NonExhaustive(()),
        }
    }
}

/// Suballocates device memory out of large chunks.
///
/// There is one set of chunks per memory type. See the [module-level documentation] for how
/// chunks are sliced.
///
/// Running out of device memory is treated as unrecoverable: [`allocate`] panics when no chunk
/// can fit the request and the heap's budget doesn't allow growing.
///
/// [module-level documentation]: super
/// [`allocate`]: Self::allocate
pub struct BlockAllocator {
    device: Arc<dyn RawDevice>,
    heaps: Vec<HeapAllocator>,
}

impl BlockAllocator {
    /// Creates a new `BlockAllocator`. No memory is allocated until the first request.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.linear_alignment` or
    ///   `create_info.optimal_alignment_multiplier` is not a power of two.
    /// - Panics if `create_info.chunk_size` is not a multiple of the optimal alignment.
    pub fn new(device: Arc<dyn RawDevice>, create_info: BlockAllocatorCreateInfo) -> Self {
        let BlockAllocatorCreateInfo {
            chunk_size,
            linear_alignment,
            optimal_alignment_multiplier,
            _ne: _,
        } = create_info;

        assert!(linear_alignment.is_power_of_two());
        assert!(optimal_alignment_multiplier.is_power_of_two());

        let optimal_alignment = linear_alignment * optimal_alignment_multiplier;

        assert!(chunk_size != 0 && chunk_size % optimal_alignment == 0);

        let heaps = device
            .memory_properties()
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                HeapAllocator::new(
                    index as u32,
                    memory_type.heap_index,
                    chunk_size,
                    linear_alignment,
                    optimal_alignment,
                )
            })
            .collect();

        BlockAllocator { device, heaps }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Finds the memory type best suited to `usage` out of those allowed by `memory_type_bits`.
    ///
    /// For [`MemoryUsage::GpuOnly`], device-local types come first. For
    /// [`MemoryUsage::CpuAccessible`], host-visible types come first, and among them host-cached
    /// ones. Ties are broken by the lower index.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        usage: MemoryUsage,
    ) -> Option<u32> {
        self.device
            .memory_properties()
            .memory_types
            .iter()
            .enumerate()
            .filter(|&(index, _)| index < 32 && memory_type_bits & (1 << index) != 0)
            .min_by_key(|(_, memory_type)| {
                let flags = memory_type.property_flags;

                match usage {
                    MemoryUsage::GpuOnly => {
                        (!flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL), false)
                    }
                    MemoryUsage::CpuAccessible => (
                        !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                        !flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
                    ),
                }
            })
            .map(|(index, _)| index as u32)
    }

    /// Allocates memory for a resource with the given `requirements`.
    ///
    /// # Panics
    ///
    /// - Panics if no memory type satisfies `requirements.memory_type_bits`.
    /// - Panics if the device is out of memory for the chosen memory type.
    pub fn allocate(
        &mut self,
        requirements: &MemoryRequirements,
        usage: MemoryUsage,
    ) -> MemoryAllocation {
        let MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        } = *requirements;

        let Some(memory_type_index) = self.find_memory_type_index(memory_type_bits, usage) else {
            log::error!(
                "no memory type matches the memory type bits {:#b}",
                memory_type_bits,
            );
            panic!("no memory type is suitable for the allocation");
        };

        if alignment > 1 && !alignment.is_power_of_two() {
            log::warn!(
                "the offset alignment {} is not a power of two, the allocation may waste memory",
                alignment,
            );
        }

        let heap = &mut self.heaps[memory_type_index as usize];

        match heap.allocate(&*self.device, size, alignment) {
            Ok(allocation) => MemoryAllocation {
                memory: allocation.memory,
                memory_type_index,
                offset: allocation.offset,
                size: allocation.size,
                run: allocation.run,
                mapped_ptr: None,
            },
            Err(err) => {
                log::error!(
                    "failed to allocate {} bytes from memory type {}: {}",
                    size,
                    memory_type_index,
                    err,
                );
                panic!("out of device memory");
            }
        }
    }

    /// Returns `allocation` to the allocator, unmapping it first if needed.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` was not allocated by `self`.
    pub fn free(&mut self, mut allocation: MemoryAllocation) {
        self.unmap_memory(&mut allocation);

        let heap = &mut self.heaps[allocation.memory_type_index as usize];
        heap.free(allocation.memory, allocation.run());
    }

    /// Maps `allocation` into host memory and returns a pointer to its start.
    ///
    /// Returns `Ok(None)` if the memory type of the allocation is not host-visible. Mapping an
    /// allocation that is already mapped returns the same pointer again.
    pub fn map_memory(
        &mut self,
        allocation: &mut MemoryAllocation,
    ) -> Result<Option<NonNull<c_void>>, VulkanError> {
        if let Some(ptr) = allocation.mapped_ptr {
            return Ok(Some(ptr));
        }

        let property_flags = self.device.memory_properties().memory_types
            [allocation.memory_type_index as usize]
            .property_flags;

        if !property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Ok(None);
        }

        let heap = &mut self.heaps[allocation.memory_type_index as usize];
        let base = heap.map(&*self.device, allocation.memory)?;

        // SAFETY: The chunk is mapped as a whole and the allocation lies within it.
        let ptr = unsafe { base.byte_add(allocation.offset as usize) };
        allocation.mapped_ptr = Some(ptr);

        Ok(Some(ptr))
    }

    /// Releases the mapping of `allocation`. The chunk is unmapped once no allocation in it is
    /// mapped anymore. Does nothing if `allocation` is not mapped.
    pub fn unmap_memory(&mut self, allocation: &mut MemoryAllocation) {
        if allocation.mapped_ptr.take().is_none() {
            return;
        }

        let heap = &mut self.heaps[allocation.memory_type_index as usize];
        heap.unmap(&*self.device, allocation.memory);
    }

    /// Returns the number of chunks allocated for the memory type.
    pub fn chunk_count(&self, memory_type_index: u32) -> usize {
        self.heaps
            .get(memory_type_index as usize)
            .map_or(0, |heap| heap.chunks().count())
    }

    /// Returns the total size of the chunks allocated for the memory type.
    pub fn chunk_size(&self, memory_type_index: u32) -> DeviceSize {
        self.heaps
            .get(memory_type_index as usize)
            .map_or(0, |heap| heap.chunks().map(|chunk| chunk.size()).sum())
    }

    /// Returns the number of free bytes in the chunks of the memory type.
    pub fn free_size(&self, memory_type_index: u32) -> DeviceSize {
        self.heaps
            .get(memory_type_index as usize)
            .map_or(0, |heap| {
                heap.chunks()
                    .map(|chunk| DeviceSize::from(chunk.free_block_count()) * chunk.alignment())
                    .sum()
            })
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        for heap in &mut self.heaps {
            // SAFETY: Resources using the memory must be destroyed before the allocator.
            unsafe { heap.destroy(&*self.device) };
        }
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("heaps", &self.heaps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockDevice;

    const KIB: DeviceSize = 1024;

    fn create_info(chunk_size: DeviceSize) -> BlockAllocatorCreateInfo {
        BlockAllocatorCreateInfo {
            chunk_size,
            ..Default::default()
        }
    }

    fn requirements(size: DeviceSize, alignment: DeviceSize) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment,
            memory_type_bits: !0,
        }
    }

    #[test]
    fn memory_type_ranking() {
        let device = Arc::new(MockDevice::new());
        let allocator = BlockAllocator::new(device, create_info(64 * KIB));

        // Type 0 is device-local, 1 host-visible, 2 host-visible and host-cached.
        assert_eq!(
            allocator.find_memory_type_index(!0, MemoryUsage::GpuOnly),
            Some(0),
        );
        assert_eq!(
            allocator.find_memory_type_index(!0, MemoryUsage::CpuAccessible),
            Some(2),
        );
        assert_eq!(
            allocator.find_memory_type_index(0b011, MemoryUsage::CpuAccessible),
            Some(1),
        );
        assert_eq!(
            allocator.find_memory_type_index(0b110, MemoryUsage::GpuOnly),
            Some(1),
        );
        assert_eq!(
            allocator.find_memory_type_index(0, MemoryUsage::GpuOnly),
            None,
        );
    }

    #[test]
    fn allocations_share_chunks() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let a = allocator.allocate(&requirements(1000, 4), MemoryUsage::GpuOnly);
        let b = allocator.allocate(&requirements(300, 4), MemoryUsage::GpuOnly);

        assert_eq!(a.memory(), b.memory());
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 1024);
        assert_eq!(b.offset(), 1024);
        assert_eq!(b.size(), 512);
        assert_eq!(allocator.chunk_count(0), 1);
        assert_eq!(device.live_memory_count(), 1);

        allocator.free(a);
        allocator.free(b);
        assert_eq!(allocator.free_size(0), allocator.chunk_size(0));
    }

    #[test]
    fn free_then_allocate_reuses_offset() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device, create_info(64 * KIB));

        let first = allocator.allocate(&requirements(5000, 256), MemoryUsage::GpuOnly);
        let (memory, offset) = (first.memory(), first.offset());
        allocator.free(first);

        let second = allocator.allocate(&requirements(5000, 256), MemoryUsage::GpuOnly);
        assert_eq!((second.memory(), second.offset()), (memory, offset));
    }

    #[test]
    fn large_offset_alignment_prefers_optimal_chunks() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device, create_info(64 * KIB));

        let image = allocator.allocate(&requirements(5000, 4096), MemoryUsage::GpuOnly);
        assert_eq!(image.offset(), 0);
        assert_eq!(image.size(), 8192);

        // The linear collection has no chunk yet, so the buffer goes into the optimal one
        // instead of growing.
        let buffer = allocator.allocate(&requirements(256, 256), MemoryUsage::GpuOnly);
        assert_eq!(buffer.memory(), image.memory());
        assert_eq!(buffer.offset(), 8192);
        assert_eq!(buffer.size(), 4096);
        assert_eq!(allocator.chunk_count(0), 1);
    }

    #[test]
    fn oversized_request_gets_own_chunk() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let allocation = allocator.allocate(&requirements(100 * KIB, 256), MemoryUsage::GpuOnly);

        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocator.chunk_size(0), 100 * KIB);
    }

    #[test]
    fn chunk_is_clamped_to_budget() {
        let device = Arc::new(MockDevice::with_heap_sizes(&[256 * KIB, 256 * KIB]));
        let mut allocator = BlockAllocator::new(device.clone(), create_info(1024 * KIB));

        let allocation = allocator.allocate(&requirements(64 * KIB, 256), MemoryUsage::GpuOnly);

        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocator.chunk_size(0), 256 * KIB - 256);
    }

    #[test]
    #[should_panic(expected = "out of device memory")]
    fn heap_exhaustion_is_fatal() {
        let device = Arc::new(MockDevice::with_heap_sizes(&[256 * KIB, 256 * KIB]));
        let mut allocator = BlockAllocator::new(device, create_info(64 * KIB));

        let _a = allocator.allocate(&requirements(200 * KIB, 256), MemoryUsage::GpuOnly);
        let _b = allocator.allocate(&requirements(200 * KIB, 256), MemoryUsage::GpuOnly);
    }

    #[test]
    #[should_panic(expected = "no memory type is suitable")]
    fn no_memory_type_is_fatal() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device, create_info(64 * KIB));

        let _ = allocator.allocate(
            &MemoryRequirements {
                size: 16,
                alignment: 16,
                memory_type_bits: 0,
            },
            MemoryUsage::GpuOnly,
        );
    }

    #[test]
    fn mapping_is_reference_counted() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let mut a = allocator.allocate(&requirements(256, 256), MemoryUsage::CpuAccessible);
        let mut b = allocator.allocate(&requirements(256, 256), MemoryUsage::CpuAccessible);
        assert_eq!(a.memory(), b.memory());

        let ptr_a = allocator.map_memory(&mut a).unwrap().unwrap();
        let ptr_b = allocator.map_memory(&mut b).unwrap().unwrap();
        assert_eq!(device.map_count(a.memory()), 1);
        assert_eq!(ptr_b.as_ptr() as usize - ptr_a.as_ptr() as usize, 256);

        // Mapping again doesn't take another reference.
        assert_eq!(allocator.map_memory(&mut a).unwrap(), Some(ptr_a));

        allocator.unmap_memory(&mut a);
        assert!(device.is_mapped(b.memory()));
        assert!(a.mapped_ptr().is_none());

        allocator.unmap_memory(&mut b);
        assert!(!device.is_mapped(b.memory()));

        let memory_type_index = b.memory_type_index();
        let heap = &allocator.heaps[memory_type_index as usize];
        assert!(!heap.chunk(b.memory()).unwrap().is_mapped());

        allocator.free(a);
        allocator.free(b);
    }

    #[test]
    fn mapping_device_local_memory() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let mut allocation = allocator.allocate(&requirements(256, 256), MemoryUsage::GpuOnly);

        assert_eq!(allocator.map_memory(&mut allocation).unwrap(), None);
        assert!(!device.is_mapped(allocation.memory()));
    }

    #[test]
    fn free_unmaps() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let mut allocation =
            allocator.allocate(&requirements(256, 256), MemoryUsage::CpuAccessible);
        let memory = allocation.memory();
        allocator.map_memory(&mut allocation).unwrap();
        allocator.free(allocation);

        assert!(!device.is_mapped(memory));
    }

    #[test]
    fn drop_frees_chunks() {
        let device = Arc::new(MockDevice::new());
        let mut allocator = BlockAllocator::new(device.clone(), create_info(64 * KIB));

        let _ = allocator.allocate(&requirements(256, 256), MemoryUsage::GpuOnly);
        let _ = allocator.allocate(&requirements(256, 256), MemoryUsage::CpuAccessible);
        assert_eq!(device.live_memory_count(), 2);

        drop(allocator);
        assert_eq!(device.live_memory_count(), 0);
    }
}
