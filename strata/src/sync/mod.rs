//! Resource access tracking.
//!
//! The [`ResourceTracker`] remembers, for every resource it has seen, which command buffer wrote
//! it last and which command buffers have read it since. Each access query compares the new
//! access against that history and answers two questions:
//!
//! - Does the caller need to record a pipeline barrier, and against which earlier access? This
//!   is the returned [`ResourceBarrierInfo`], if any.
//! - Which earlier command buffers must finish before the accessing one may execute? These are
//!   appended to the accessing command buffer's wait list, which the [`CommandBufferManager`]
//!   turns into semaphore waits when submitting.
//!
//! The tracker never records commands itself.
//!
//! [`CommandBufferManager`]: crate::command_buffer::CommandBufferManager

pub use self::tracker::ResourceTracker;
use crate::command_buffer::CommandBuffer;
use ash::vk;
use std::{any::Any, sync::Arc};

mod tracker;

/// A pending queue family ownership transfer, or a staged release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueTransfer {
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,

    /// The layout the image must be in, or `None` for buffers.
    pub image_layout: Option<vk::ImageLayout>,
}

impl QueueTransfer {
    pub const NONE: QueueTransfer = QueueTransfer {
        stage_mask: vk::PipelineStageFlags2::NONE,
        access_mask: vk::AccessFlags2::NONE,
        image_layout: None,
    };

    /// Combines the masks of `other` into `self`. The layout of `other` wins if it has one.
    #[inline]
    pub fn merge(&mut self, other: &QueueTransfer) {
        self.stage_mask |= other.stage_mask;
        self.access_mask |= other.access_mask;
        self.image_layout = other.image_layout.or(self.image_layout);
    }
}

/// What a caller needs to know to record a barrier before an access.
#[derive(Clone, Debug)]
pub struct ResourceBarrierInfo {
    /// The command buffer whose access the barrier must order against. `None` if the resource
    /// had no previous accessor.
    pub accessor: Option<Arc<CommandBuffer>>,

    /// The stages of the previous access, to use as the source stage mask.
    pub accessor_stages: vk::PipelineStageFlags2,

    /// The queue transfer that was pending for the resource and is consumed by this access.
    pub queue_transfer: Option<QueueTransfer>,
}

/// A command buffer that another one waits on.
#[derive(Clone, Debug)]
pub struct CommandBufferWait {
    pub cmd_buffer: Arc<CommandBuffer>,

    /// The stages of the waiting command buffer that must not start before `cmd_buffer` is
    /// done.
    pub stages: vk::PipelineStageFlags2,
}

/// A release staged with [`ResourceTracker::release_resource_at`].
#[derive(Clone, Debug)]
pub struct QueueRelease {
    pub resource: Arc<dyn Any + Send + Sync>,
    pub release: QueueTransfer,
}
