use super::CommandPoolKind;
use crate::{
    device::{QueueFunction, QueueInfo, RawDevice},
    VulkanError,
};
use ash::vk;
use foldhash::HashMap;

/// A native command pool along with the queue its command buffers are submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct CommandPool {
    pub(super) handle: vk::CommandPool,
    pub(super) kind: CommandPoolKind,
    pub(super) queue: QueueInfo,
}

/// Three pools per queue function, one for each [`CommandPoolKind`].
#[derive(Debug, Default)]
pub(super) struct CommandPools {
    pools: HashMap<(QueueFunction, CommandPoolKind), CommandPool>,
}

impl CommandPools {
    /// Creates the pools of every queue function the device has a queue for.
    pub(super) fn new(device: &dyn RawDevice) -> Result<Self, VulkanError> {
        let mut pools = CommandPools::default();

        for function in QueueFunction::ALL {
            let Some(queue) = device.queue(function) else {
                continue;
            };

            for kind in CommandPoolKind::ALL {
                let handle = match device
                    .create_command_pool(queue.queue_family_index, kind.pool_flags())
                {
                    Ok(handle) => handle,
                    Err(err) => {
                        // SAFETY: None of the pools has been used yet.
                        unsafe { pools.destroy(device) };

                        return Err(err);
                    }
                };

                pools
                    .pools
                    .insert((function, kind), CommandPool { handle, kind, queue });
            }
        }

        Ok(pools)
    }

    #[inline]
    pub(super) fn get(&self, function: QueueFunction, kind: CommandPoolKind) -> Option<CommandPool> {
        self.pools.get(&(function, kind)).copied()
    }

    /// Destroys every pool, which frees the command buffers allocated from them.
    ///
    /// # Safety
    ///
    /// - No command buffer allocated from the pools may be pending execution.
    pub(super) unsafe fn destroy(&mut self, device: &dyn RawDevice) {
        for (_, pool) in self.pools.drain() {
            // SAFETY: The caller must ensure that no command buffer of the pool is in use.
            unsafe { device.destroy_command_pool(pool.handle) };
        }
    }
}
