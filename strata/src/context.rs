use crate::{
    command_buffer::{CommandBufferManager, CommandSubmitInfo, SubmitError},
    device::RawDevice,
    memory::{BlockAllocator, BlockAllocatorCreateInfo},
    sync::ResourceTracker,
    VulkanError,
};
use ash::vk;
use std::{fmt, sync::Arc};

/// The memory allocator, command buffer manager and resource tracker of one device.
///
/// The manager and the tracker are used together for submissions and completions, which is what
/// this type wires up. When it is dropped, every submitted command buffer is waited on before
/// the command pools and the memory are released.
pub struct RenderContext {
    // Dropped first, so that every submission is finished before memory is freed.
    manager: CommandBufferManager,
    tracker: ResourceTracker,
    allocator: BlockAllocator,
    device: Arc<dyn RawDevice>,
}

impl RenderContext {
    pub fn new(
        device: Arc<dyn RawDevice>,
        allocator_create_info: BlockAllocatorCreateInfo,
    ) -> Result<Self, VulkanError> {
        let manager = CommandBufferManager::new(device.clone())?;
        let allocator = BlockAllocator::new(device.clone(), allocator_create_info);

        Ok(RenderContext {
            manager,
            tracker: ResourceTracker::new(),
            allocator,
            device,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline]
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    #[inline]
    pub fn allocator_mut(&mut self) -> &mut BlockAllocator {
        &mut self.allocator
    }

    #[inline]
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    #[inline]
    pub fn tracker_mut(&mut self) -> &mut ResourceTracker {
        &mut self.tracker
    }

    #[inline]
    pub fn manager(&self) -> &CommandBufferManager {
        &self.manager
    }

    #[inline]
    pub fn manager_mut(&mut self) -> &mut CommandBufferManager {
        &mut self.manager
    }

    /// Borrows the manager, the tracker and the allocator at the same time, for recording.
    #[inline]
    pub fn parts_mut(
        &mut self,
    ) -> (
        &mut CommandBufferManager,
        &mut ResourceTracker,
        &mut BlockAllocator,
    ) {
        (&mut self.manager, &mut self.tracker, &mut self.allocator)
    }

    /// Submits `infos`, waiting on whatever the tracker says their command buffers depend on.
    pub fn submit_cmds(
        &mut self,
        infos: &[CommandSubmitInfo],
        fence: Option<vk::Fence>,
    ) -> Result<(), SubmitError> {
        self.manager.submit_cmds(infos, fence, Some(&self.tracker))
    }

    /// Waits for the named command buffer `name` and for everything it depended on, then
    /// forgets their accesses.
    pub fn cmd_finished(&mut self, name: &str) -> Result<(), VulkanError> {
        self.manager.cmd_finished(name, Some(&mut self.tracker))
    }

    /// Waits for every submitted command buffer and drops the tracker state nothing refers to
    /// anymore.
    pub fn finish_all_submitted(&mut self) -> Result<(), VulkanError> {
        self.manager.finish_all_submitted(Some(&mut self.tracker))?;
        self.tracker.clear_unwanted();

        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.finish_all_submitted() {
            log::error!("failed to finish the submitted command buffers: {}", err);
        }
    }
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("manager", &self.manager)
            .field("tracker", &self.tracker)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::QueueFunction,
        memory::{MemoryRequirements, MemoryUsage},
        tests::MockDevice,
    };
    use ash::vk::PipelineStageFlags2 as Stages;

    #[test]
    fn upload_then_draw() {
        let device = Arc::new(MockDevice::new());
        let mut context =
            RenderContext::new(device.clone(), BlockAllocatorCreateInfo::default()).unwrap();

        let requirements = MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: u32::MAX,
        };
        let allocation = context
            .allocator_mut()
            .allocate(&requirements, MemoryUsage::GpuOnly);
        let buffer = Arc::new(allocation);

        let (manager, tracker, _) = context.parts_mut();
        let upload = manager
            .begin_record_once("upload", QueueFunction::Transfer)
            .unwrap();
        assert!(tracker
            .write_buffers(&upload, &buffer, Stages::COPY)
            .is_none());
        manager.end_cmd_buffer(&upload).unwrap();
        context
            .submit_cmds(&[CommandSubmitInfo::new(vec![upload])], None)
            .unwrap();

        let (manager, tracker, _) = context.parts_mut();
        let draw = manager.begin_reuse("draw", QueueFunction::Graphics).unwrap();
        let barrier = tracker
            .read_only_buffers(&draw, &buffer, Stages::VERTEX_INPUT)
            .unwrap();
        assert_eq!(barrier.accessor_stages, Stages::COPY);
        manager.end_cmd_buffer(&draw).unwrap();
        context
            .submit_cmds(&[CommandSubmitInfo::new(vec![draw])], None)
            .unwrap();

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[1].batches[0].waits.len(), 1);

        context.cmd_finished("draw").unwrap();
        assert!(!context.tracker().is_tracked(&buffer));
        assert_eq!(device.live_semaphore_count(), 0);

        let allocation = Arc::into_inner(buffer).unwrap();
        context.allocator_mut().free(allocation);

        drop(context);
        assert_eq!(device.live_memory_count(), 0);
        assert_eq!(device.live_pool_count(), 0);
    }

    #[test]
    fn render_context_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<RenderContext>();
        assert_send_sync::<BlockAllocator>();
    }

    #[test]
    fn drop_waits_for_submissions() {
        let device = Arc::new(MockDevice::new());
        let mut context =
            RenderContext::new(device.clone(), BlockAllocatorCreateInfo::default()).unwrap();

        let cmd = context
            .manager_mut()
            .begin_reuse("frame", QueueFunction::Compute)
            .unwrap();
        context.manager_mut().end_cmd_buffer(&cmd).unwrap();
        context
            .submit_cmds(&[CommandSubmitInfo::new(vec![cmd])], None)
            .unwrap();

        drop(context);

        assert_eq!(device.fence_wait_count(), 1);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_cmd_buffer_count(), 0);
    }
}
