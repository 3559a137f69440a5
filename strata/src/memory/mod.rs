//! Device memory sub-allocation.
//!
//! Device memory allocations are expensive and their number is limited, so resources don't get
//! one each. Instead the [`BlockAllocator`] allocates large *chunks* of device memory and slices
//! each chunk into equal-size *blocks*. A resource receives a run of contiguous blocks inside a
//! chunk, described by a [`MemoryAllocation`].
//!
//! Chunks are grouped per memory type. Each memory type has two collections of chunks with
//! different block sizes: a fine-grained one for linear resources such as buffers, and a coarse
//! one for tiled resources such as optimal-tiling images. A request goes to whichever collection
//! wastes fewer bytes.
//!
//! # Mapping
//!
//! Host-visible chunks are mapped lazily and as a whole. Mapping is reference counted, so every
//! allocation of a chunk can be mapped at the same time and the chunk stays mapped until the last
//! one is unmapped.

pub use self::allocator::{BlockAllocator, BlockAllocatorCreateInfo};
use crate::DeviceSize;
use ash::vk;
use std::{ffi::c_void, ptr::NonNull};

mod allocator;
mod chunk;
mod heap;

/// Describes what an allocation is going to be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// The memory is only accessed by the device. Device-local memory types are preferred.
    GpuOnly,

    /// The memory is written or read by the host. Host-visible memory types are preferred, and
    /// among those host-cached ones.
    CpuAccessible,
}

/// Memory requirements of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: DeviceSize,

    /// Required alignment of the offset of the allocation. Must be a power of two.
    pub alignment: DeviceSize,

    /// Bit `i` is set if memory type `i` can back the resource.
    pub memory_type_bits: u32,
}

impl From<vk::MemoryRequirements> for MemoryRequirements {
    #[inline]
    fn from(val: vk::MemoryRequirements) -> Self {
        MemoryRequirements {
            size: val.size,
            alignment: val.alignment,
            memory_type_bits: val.memory_type_bits,
        }
    }
}

/// A run of contiguous blocks inside a chunk.
///
/// Block indices start at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockRun {
    pub(crate) start: u32,
    pub(crate) count: u32,
}

impl BlockRun {
    #[inline]
    pub(crate) fn end(self) -> u32 {
        self.start + self.count
    }
}

/// A suballocation returned by [`BlockAllocator::allocate`].
///
/// It must be given back with [`BlockAllocator::free`].
#[derive(Debug)]
pub struct MemoryAllocation {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    offset: DeviceSize,
    size: DeviceSize,
    run: BlockRun,
    mapped_ptr: Option<NonNull<c_void>>,
}

// SAFETY: The mapped pointer is only a view into the chunk mapping, which the allocator owns.
unsafe impl Send for MemoryAllocation {}

// SAFETY: See the `Send` impl.
unsafe impl Sync for MemoryAllocation {}

impl MemoryAllocation {
    /// The device memory this allocation lives in. Shared with other allocations.
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The offset of the allocation within [`memory`](Self::memory).
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// The size of the allocation, rounded up to a whole number of blocks.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// The host pointer to the start of the allocation, if it is currently mapped.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapped_ptr
    }

    #[inline]
    pub(crate) fn run(&self) -> BlockRun {
        self.run
    }
}

#[inline(always)]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    align_down(val + alignment - 1, alignment)
}

#[inline(always)]
pub(crate) const fn align_down(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    val & !(alignment - 1)
}
