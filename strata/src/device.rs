//! The device collaborator.
//!
//! Everything in this crate talks to the GPU through the [`RawDevice`] trait. It exposes the
//! handful of entry points that memory sub-allocation, command pools and queue submission need,
//! together with the queue table and the memory properties of the physical device.
//!
//! [`AshDevice`] implements the trait over an `ash` instance and device that the caller created
//! and keeps ownership of.

use crate::{DeviceSize, NonExhaustive, VulkanError};
use ash::vk;
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    ffi::c_void,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

/// The kind of work a queue is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueFunction {
    Graphics,
    Compute,
    Transfer,
    Present,
    /// A queue that may be used for any kind of work.
    Generic,
}

impl QueueFunction {
    /// All queue functions, in table order.
    pub const ALL: [QueueFunction; 5] = [
        QueueFunction::Graphics,
        QueueFunction::Compute,
        QueueFunction::Transfer,
        QueueFunction::Present,
        QueueFunction::Generic,
    ];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// A native queue along with the family it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueInfo {
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

/// The queue to use for each [`QueueFunction`].
///
/// Several functions may resolve to the same queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueTable {
    queues: [Option<QueueInfo>; 5],
}

impl QueueTable {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue for `function`, returning `self` for chaining.
    #[inline]
    #[must_use]
    pub fn with(mut self, function: QueueFunction, queue: QueueInfo) -> Self {
        self.queues[function.index()] = Some(queue);
        self
    }

    #[inline]
    pub fn get(&self, function: QueueFunction) -> Option<QueueInfo> {
        self.queues[function.index()]
    }

    /// Returns every distinct queue in the table.
    pub fn distinct_queues(&self) -> SmallVec<[QueueInfo; 5]> {
        let mut queues = SmallVec::<[QueueInfo; 5]>::new();

        for queue in self.queues.iter().flatten() {
            if !queues.contains(queue) {
                queues.push(*queue);
            }
        }

        queues
    }
}

/// Properties of a memory type, with the index of the heap that backs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: DeviceSize,
    pub flags: vk::MemoryHeapFlags,
}

/// The memory types and heaps of a physical device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl From<&vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(val: &vk::PhysicalDeviceMemoryProperties) -> Self {
        MemoryProperties {
            memory_types: val.memory_types[..val.memory_type_count as usize]
                .iter()
                .map(|ty| MemoryType {
                    property_flags: ty.property_flags,
                    heap_index: ty.heap_index,
                })
                .collect(),
            memory_heaps: val.memory_heaps[..val.memory_heap_count as usize]
                .iter()
                .map(|heap| MemoryHeap {
                    size: heap.size,
                    flags: heap.flags,
                })
                .collect(),
        }
    }
}

/// How much of a memory heap the process may use and how much it currently uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub budget: DeviceSize,
    pub usage: DeviceSize,
}

impl HeapUsage {
    /// Bytes that can still be allocated before reaching the budget.
    #[inline]
    pub fn available(&self) -> DeviceSize {
        self.budget.saturating_sub(self.usage)
    }
}

/// One batch of a queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitBatch<'a> {
    pub wait_semaphores: &'a [vk::SemaphoreSubmitInfo<'static>],
    pub command_buffers: &'a [vk::CommandBufferSubmitInfo<'static>],
    pub signal_semaphores: &'a [vk::SemaphoreSubmitInfo<'static>],
}

/// The device entry points used by this crate.
///
/// Functions that take native handles are unsafe: the handles must have been created by the same
/// implementation and must not have been destroyed yet.
pub trait RawDevice: Send + Sync {
    fn memory_properties(&self) -> &MemoryProperties;

    /// Queries the live budget and usage of the memory heap `heap_index`.
    fn heap_usage(&self, heap_index: u32) -> HeapUsage;

    fn queue(&self, function: QueueFunction) -> Option<QueueInfo>;

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps the whole of `memory`.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, VulkanError>;

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool, VulkanError>;

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocates one primary command buffer from `pool`.
    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, VulkanError>;

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), VulkanError>;

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer)
        -> Result<(), VulkanError>;

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Returns whether `fence` is signaled, without blocking.
    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError>;

    /// Blocks until `fence` is signaled.
    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> Result<(), VulkanError>;

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, VulkanError>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submits `batches` to `queue` in a single call. `fence` may be null.
    ///
    /// Implementations must serialize access to `queue`.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError>;
}

/// Parameters to create an [`AshDevice`].
#[derive(Clone, Debug)]
pub struct AshDeviceCreateInfo {
    /// The queues the device was created with, by function.
    ///
    /// The default value is an empty table.
    pub queues: QueueTable,

    /// Whether `VK_EXT_memory_budget` was enabled on the device.
    ///
    /// When it is not, the budget of a heap is its size and the usage is the number of bytes
    /// allocated through this object.
    ///
    /// The default value is `false`.
    pub memory_budget: bool,

    pub _ne: NonExhaustive,
}

impl Default for AshDeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        AshDeviceCreateInfo {
            queues: QueueTable::new(),
            memory_budget: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// A [`RawDevice`] implemented with `ash`.
pub struct AshDevice {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    memory_properties: MemoryProperties,
    queues: QueueTable,
    queue_locks: HashMap<vk::Queue, Mutex<()>>,
    memory_budget: bool,
    heap_allocated: Vec<AtomicU64>,
    allocations: Mutex<HashMap<vk::DeviceMemory, (u32, DeviceSize)>>,
}

impl AshDevice {
    /// Wraps an existing device.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to `instance`.
    /// - The device must support Vulkan 1.3 with the `synchronization2` and `timelineSemaphore`
    ///   features enabled.
    /// - Every queue in `create_info.queues` must belong to `device`, and must not be submitted to
    ///   by anything other than this object.
    /// - `instance` and `device` must outlive the returned object and every object created from
    ///   it.
    pub unsafe fn from_handle(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        create_info: AshDeviceCreateInfo,
    ) -> Self {
        let AshDeviceCreateInfo {
            queues,
            memory_budget,
            _ne: _,
        } = create_info;

        // SAFETY: The caller must ensure that `physical_device` belongs to `instance`.
        let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_properties = MemoryProperties::from(&properties);
        let heap_allocated = (0..memory_properties.memory_heaps.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        let queue_locks = queues
            .distinct_queues()
            .into_iter()
            .map(|info| (info.queue, Mutex::new(())))
            .collect();

        AshDevice {
            instance,
            device,
            physical_device,
            memory_properties,
            queues,
            queue_locks,
            memory_budget,
            heap_allocated,
            allocations: Mutex::new(HashMap::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("physical_device", &self.physical_device)
            .field("queues", &self.queues)
            .field("memory_budget", &self.memory_budget)
            .finish_non_exhaustive()
    }
}

impl RawDevice for AshDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn heap_usage(&self, heap_index: u32) -> HeapUsage {
        let heap_index = heap_index as usize;

        if self.memory_budget {
            let mut budget_properties = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();

            {
                let mut properties =
                    vk::PhysicalDeviceMemoryProperties2::default().push_next(&mut budget_properties);

                // SAFETY: `physical_device` belongs to `instance` and the extension is enabled.
                unsafe {
                    self.instance
                        .get_physical_device_memory_properties2(self.physical_device, &mut properties)
                };
            }

            HeapUsage {
                budget: budget_properties.heap_budget[heap_index],
                usage: budget_properties.heap_usage[heap_index],
            }
        } else {
            HeapUsage {
                budget: self.memory_properties.memory_heaps[heap_index].size,
                usage: self.heap_allocated[heap_index].load(Ordering::Relaxed),
            }
        }
    }

    fn queue(&self, function: QueueFunction) -> Option<QueueInfo> {
        self.queues.get(function)
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let heap_index = self.memory_properties.memory_types[memory_type_index as usize].heap_index;
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        // SAFETY: The allocate info is valid.
        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }?;

        self.heap_allocated[heap_index as usize].fetch_add(size, Ordering::Relaxed);
        self.allocations.lock().insert(memory, (heap_index, size));

        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        if let Some((heap_index, size)) = self.allocations.lock().remove(&memory) {
            self.heap_allocated[heap_index as usize].fetch_sub(size, Ordering::Relaxed);
        }

        // SAFETY: The caller must ensure that `memory` is a live allocation of this device.
        unsafe { self.device.free_memory(memory, None) };
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, VulkanError> {
        // SAFETY: The caller must ensure that `memory` is host-visible and not already mapped.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr).ok_or(VulkanError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: The caller must ensure that `memory` is currently mapped.
        unsafe { self.device.unmap_memory(memory) };
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool, VulkanError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);

        // SAFETY: The create info is valid.
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }?;

        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: The caller must ensure that no command buffer of `pool` is pending execution.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, VulkanError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: The caller must ensure that `pool` is a live pool of this device.
        let command_buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;

        command_buffers
            .into_iter()
            .next()
            .ok_or(VulkanError::Unknown)
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        // SAFETY: The caller must ensure that `command_buffer` was allocated from `pool`.
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), VulkanError> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);

        // SAFETY: The caller must ensure that `command_buffer` is not pending execution.
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }?;

        Ok(())
    }

    unsafe fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        // SAFETY: The caller must ensure that `command_buffer` is in the recording state.
        unsafe { self.device.end_command_buffer(command_buffer) }?;

        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: The create info is valid.
        let fence = unsafe { self.device.create_fence(&create_info, None) }?;

        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: The caller must ensure that `fence` is not in use by a pending submission.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError> {
        // SAFETY: The caller must ensure that `fence` is a live fence of this device.
        let signaled = unsafe { self.device.get_fence_status(fence) }?;

        Ok(signaled)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        // SAFETY: The caller must ensure that `fence` is a live fence of this device.
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }?;

        Ok(())
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, VulkanError> {
        let mut type_create_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_create_info);

        // SAFETY: The create info is valid.
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }?;

        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: The caller must ensure that `semaphore` is not in use by a pending submission.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let submit_infos = batches
            .iter()
            .map(|batch| {
                vk::SubmitInfo2::default()
                    .wait_semaphore_infos(batch.wait_semaphores)
                    .command_buffer_infos(batch.command_buffers)
                    .signal_semaphore_infos(batch.signal_semaphores)
            })
            .collect::<SmallVec<[_; 4]>>();

        let _guard = self.queue_locks.get(&queue).map(Mutex::lock);

        // SAFETY: The caller must ensure that every handle in `batches` is valid. Access to the
        // queue is synchronized by the lock above.
        unsafe { self.device.queue_submit2(queue, &submit_infos, fence) }?;

        Ok(())
    }
}
