//! Command buffers, the pools they come from and their submission.
//!
//! Command buffers are created through the [`CommandBufferManager`] in one of three flavors:
//!
//! - *Temporary* buffers from [`begin_temp`] are recorded and submitted once. The manager only
//!   tracks them while their submission is in flight.
//! - *Record-once* buffers from [`begin_record_once`] are recorded a single time and may then be
//!   submitted any number of times.
//! - *Reusable* buffers from [`begin_reuse`] may be re-recorded whenever they are not in flight.
//!
//! Record-once and reusable buffers are named, and the manager keeps track of their
//! [`CommandBufferState`].
//!
//! [`begin_temp`]: CommandBufferManager::begin_temp
//! [`begin_record_once`]: CommandBufferManager::begin_record_once
//! [`begin_reuse`]: CommandBufferManager::begin_reuse

pub use self::manager::{CommandBufferManager, CommandSubmitInfo, SemaphoreWait, SubmitError};
use crate::{device::QueueFunction, macros::impl_id_counter};
use ash::vk;
use std::{fmt, num::NonZero};

mod manager;
mod pool;

/// A primary command buffer allocated by the [`CommandBufferManager`].
///
/// Two `CommandBuffer`s are equal if they are the same object.
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    id: NonZero<u64>,
    name: Option<String>,
    usage: QueueFunction,
    kind: CommandPoolKind,
    queue: vk::Queue,
    queue_family_index: u32,
}

impl CommandBuffer {
    pub(crate) fn new(
        handle: vk::CommandBuffer,
        pool: vk::CommandPool,
        name: Option<String>,
        usage: QueueFunction,
        kind: CommandPoolKind,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> Self {
        CommandBuffer {
            handle,
            pool,
            id: Self::next_id(),
            name,
            usage,
            kind,
            queue,
            queue_family_index,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the name of the command buffer, or `None` if it is temporary.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the kind of work the command buffer was created for.
    #[inline]
    pub fn usage(&self) -> QueueFunction {
        self.usage
    }

    /// Returns the queue the command buffer must be submitted to.
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn is_temp(&self) -> bool {
        self.kind == CommandPoolKind::Transient
    }

    #[inline]
    pub fn is_resettable(&self) -> bool {
        self.kind == CommandPoolKind::Resettable
    }

    #[inline]
    pub(crate) fn kind(&self) -> CommandPoolKind {
        self.kind
    }
}

impl_id_counter!(CommandBuffer);

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("usage", &self.usage)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

/// The pool a command buffer is allocated from, which determines how it may be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CommandPoolKind {
    /// Buffers recorded once and submitted any number of times.
    OneTime,
    /// Short-lived buffers submitted a single time.
    Transient,
    /// Buffers that may be reset and recorded again.
    Resettable,
}

impl CommandPoolKind {
    pub(crate) const ALL: [CommandPoolKind; 3] = [
        CommandPoolKind::OneTime,
        CommandPoolKind::Transient,
        CommandPoolKind::Resettable,
    ];

    pub(crate) fn pool_flags(self) -> vk::CommandPoolCreateFlags {
        match self {
            CommandPoolKind::OneTime => vk::CommandPoolCreateFlags::empty(),
            CommandPoolKind::Transient => vk::CommandPoolCreateFlags::TRANSIENT,
            CommandPoolKind::Resettable => vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        }
    }

    pub(crate) fn usage_flags(self) -> vk::CommandBufferUsageFlags {
        match self {
            CommandPoolKind::Transient => vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            CommandPoolKind::OneTime | CommandPoolKind::Resettable => {
                vk::CommandBufferUsageFlags::empty()
            }
        }
    }
}

/// The lifecycle state of a named command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Allocated but never recorded.
    Idle,
    Recording,
    /// Recording, inside a render pass.
    RenderPass,
    /// Recording has ended; the buffer can be submitted.
    Recorded,
    /// Submitted and possibly still executing.
    Submitted,
}

impl CommandBufferState {
    /// Returns whether the lifecycle allows going from `self` to `next`.
    pub const fn can_transition_to(self, next: CommandBufferState) -> bool {
        use CommandBufferState::*;

        matches!(
            (self, next),
            (Idle, Recording)
                | (Recording, RenderPass)
                | (Recording, Recorded)
                | (RenderPass, Recording)
                | (Recorded, Recording)
                | (Recorded, Submitted)
                | (Submitted, Recorded)
        )
    }
}
