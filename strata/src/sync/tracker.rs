use super::{CommandBufferWait, QueueRelease, QueueTransfer, ResourceBarrierInfo};
use crate::{command_buffer::CommandBuffer, device::QueueFunction};
use ash::vk;
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{
    any::Any,
    num::NonZero,
    sync::{Arc, Weak},
};

type AnyResource = dyn Any + Send + Sync;

/// Tracks resource accesses across command buffers and queues.
///
/// Resources are identified by the address of their `Arc` allocation, so any `Arc`-shared object
/// can be tracked: buffers, images, or the caller's own wrappers around them. The tracker keeps a
/// strong reference to every resource it has seen until [`clear_unwanted`] finds that nobody else
/// does.
///
/// There are three families of access queries, one per resource flavor: buffers, texel buffers
/// and images. Texel buffers follow the buffer rules. Images additionally carry a layout, so a
/// read or write that follows a read by another command buffer needs a barrier even when both
/// run on the same queue family.
///
/// Every query consumes the queue transfer staged for the resource and the accessing command
/// buffer's queue function, if any, and returns it in the barrier info.
///
/// [`clear_unwanted`]: Self::clear_unwanted
#[derive(Debug, Default)]
pub struct ResourceTracker {
    accessors: HashMap<usize, ResourceAccessors>,
    transfers: HashMap<(usize, QueueFunction), PendingTransfer>,
    releases: HashMap<QueueFunction, HashMap<usize, PendingTransfer>>,
    cmd_waits: HashMap<NonZero<u64>, SmallVec<[CommandBufferWait; 4]>>,
}

#[derive(Debug)]
struct ResourceAccessors {
    resource: Arc<AnyResource>,
    last_write: Option<Arc<CommandBuffer>>,
    last_write_stage: vk::PipelineStageFlags2,
    last_reads_in: SmallVec<[Arc<CommandBuffer>; 4]>,
    all_read_stages: vk::PipelineStageFlags2,
    last_read_stages: vk::PipelineStageFlags2,
}

#[derive(Debug)]
struct PendingTransfer {
    // Keeps the allocation, and therefore the key, from being reused while the record exists.
    resource: Weak<AnyResource>,
    transfer: QueueTransfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceKind {
    Buffer,
    TexelBuffer,
    Image,
}

impl ResourceKind {
    fn has_layout(self) -> bool {
        match self {
            ResourceKind::Buffer | ResourceKind::TexelBuffer => false,
            ResourceKind::Image => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadKind {
    ReadOnly,
    /// A read of a resource that is also written to, such as a storage buffer.
    FromWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Normal,
    /// A write to a resource that is otherwise only read, such as an upload to a sampled image.
    ReadOnly,
    ColorAttachment,
}

type Barrier = Option<(Arc<CommandBuffer>, vk::PipelineStageFlags2)>;

impl ResourceAccessors {
    fn new(resource: Arc<AnyResource>) -> Self {
        ResourceAccessors {
            resource,
            last_write: None,
            last_write_stage: vk::PipelineStageFlags2::NONE,
            last_reads_in: SmallVec::new(),
            all_read_stages: vk::PipelineStageFlags2::NONE,
            last_read_stages: vk::PipelineStageFlags2::NONE,
        }
    }

    fn last_reader(&self) -> Option<&Arc<CommandBuffer>> {
        self.last_reads_in.last()
    }

    fn add_reader(&mut self, cmd: &Arc<CommandBuffer>, stages: vk::PipelineStageFlags2) {
        if self.last_reads_in.is_empty() {
            self.all_read_stages = stages;
            self.last_read_stages = stages;
        } else if self.last_reader() == Some(cmd) {
            self.all_read_stages |= stages;
            self.last_read_stages |= stages;

            return;
        } else {
            self.all_read_stages |= stages;
            self.last_read_stages = stages;
        }

        self.last_reads_in.push(cmd.clone());
    }

    fn set_writer(&mut self, cmd: &Arc<CommandBuffer>, stages: vk::PipelineStageFlags2) {
        self.last_write = Some(cmd.clone());
        self.last_write_stage = stages;
        self.last_reads_in.clear();
        self.all_read_stages = vk::PipelineStageFlags2::NONE;
        self.last_read_stages = vk::PipelineStageFlags2::NONE;
    }

    fn is_empty(&self) -> bool {
        self.last_write.is_none() && self.last_reads_in.is_empty()
    }
}

fn resource_key<R: ?Sized>(resource: &Arc<R>) -> usize {
    Arc::as_ptr(resource).cast::<()>() as usize
}

fn erase<R: Any + Send + Sync>(resource: &Arc<R>) -> Arc<AnyResource> {
    resource.clone()
}

fn barrier_info(
    barrier: Barrier,
    queue_transfer: Option<QueueTransfer>,
) -> Option<ResourceBarrierInfo> {
    if barrier.is_none() && queue_transfer.is_none() {
        return None;
    }

    let (accessor, accessor_stages) = match barrier {
        Some((accessor, stages)) => (Some(accessor), stages),
        None => (None, vk::PipelineStageFlags2::NONE),
    };

    Some(ResourceBarrierInfo {
        accessor,
        accessor_stages,
        queue_transfer,
    })
}

fn add_wait(
    cmd_waits: &mut HashMap<NonZero<u64>, SmallVec<[CommandBufferWait; 4]>>,
    cmd: &Arc<CommandBuffer>,
    dependency: Arc<CommandBuffer>,
    stages: vk::PipelineStageFlags2,
) {
    if dependency == *cmd {
        return;
    }

    let waits = cmd_waits.entry(cmd.id()).or_default();

    match waits.iter_mut().find(|wait| wait.cmd_buffer == dependency) {
        Some(wait) => wait.stages |= stages,
        None => waits.push(CommandBufferWait {
            cmd_buffer: dependency,
            stages,
        }),
    }
}

impl ResourceTracker {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    fn take_transfer(&mut self, key: usize, destination: QueueFunction) -> Option<QueueTransfer> {
        self.transfers
            .remove(&(key, destination))
            .map(|pending| pending.transfer)
    }

    fn read<R: Any + Send + Sync>(
        &mut self,
        kind: ResourceKind,
        read_kind: ReadKind,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        let key = resource_key(resource);
        let queue_transfer = self.take_transfer(key, cmd.usage());
        let accessors = self
            .accessors
            .entry(key)
            .or_insert_with(|| ResourceAccessors::new(erase(resource)));

        let mut barrier: Barrier = None;
        let mut waits = SmallVec::<[Arc<CommandBuffer>; 2]>::new();
        let last_reader_elsewhere = accessors
            .last_reader()
            .filter(|reader| reader.queue_family_index() != cmd.queue_family_index())
            .cloned();

        match accessors.last_write.clone() {
            None => {
                if let Some(reader) = last_reader_elsewhere {
                    barrier = Some((reader.clone(), accessors.last_read_stages));
                    waits.push(reader);
                }
            }
            Some(writer) => {
                if writer != *cmd {
                    waits.push(writer.clone());
                }

                if accessors.last_reads_in.is_empty() {
                    // First read since the write.
                    barrier = Some((writer, accessors.last_write_stage));
                } else if let Some(reader) = last_reader_elsewhere {
                    barrier = Some((reader.clone(), accessors.last_read_stages));
                    waits.push(reader);
                } else {
                    let new_reader_needs_barrier = match read_kind {
                        ReadKind::FromWrite => true,
                        ReadKind::ReadOnly => kind.has_layout() && writer != *cmd,
                    };

                    if new_reader_needs_barrier && !accessors.last_reads_in.contains(cmd) {
                        barrier = Some((writer, accessors.last_write_stage));
                    }
                }
            }
        }

        accessors.add_reader(cmd, stages);

        for dependency in waits {
            add_wait(&mut self.cmd_waits, cmd, dependency, stages);
        }

        barrier_info(barrier, queue_transfer)
    }

    fn write<R: Any + Send + Sync>(
        &mut self,
        kind: ResourceKind,
        write_kind: WriteKind,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        assert!(
            stage.as_raw().count_ones() == 1,
            "a write access must be made from exactly one pipeline stage, but {:?} was given",
            stage,
        );

        let key = resource_key(resource);
        let queue_transfer = self.take_transfer(key, cmd.usage());
        let accessors = self
            .accessors
            .entry(key)
            .or_insert_with(|| ResourceAccessors::new(erase(resource)));

        let mut barrier: Barrier = None;
        let mut waits = SmallVec::<[Arc<CommandBuffer>; 4]>::new();

        if let Some(last_reader) = accessors.last_reader() {
            let mut crosses_queues = false;

            for reader in &accessors.last_reads_in {
                crosses_queues |= reader.queue_family_index() != cmd.queue_family_index();

                if reader != cmd && !waits.contains(reader) {
                    waits.push(reader.clone());
                }
            }

            let needs_barrier = crosses_queues
                || match write_kind {
                    WriteKind::Normal => kind.has_layout(),
                    WriteKind::ReadOnly => true,
                    WriteKind::ColorAttachment => false,
                };

            if needs_barrier {
                barrier = Some((last_reader.clone(), accessors.all_read_stages));
            }
        } else if let Some(writer) = &accessors.last_write {
            if writer != cmd {
                waits.push(writer.clone());

                if writer.queue_family_index() != cmd.queue_family_index() {
                    barrier = Some((writer.clone(), accessors.last_write_stage));
                }
            }
        }

        accessors.set_writer(cmd, stage);

        for dependency in waits {
            add_wait(&mut self.cmd_waits, cmd, dependency, stage);
        }

        barrier_info(barrier, queue_transfer)
    }

    /// Registers a read of a buffer that is never written to while in use, such as a vertex or
    /// uniform buffer.
    pub fn read_only_buffers<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::Buffer, ReadKind::ReadOnly, cmd, resource, stages)
    }

    pub fn read_only_texels<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::TexelBuffer, ReadKind::ReadOnly, cmd, resource, stages)
    }

    /// Registers a read of a sampled or input image.
    pub fn read_only_images<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::Image, ReadKind::ReadOnly, cmd, resource, stages)
    }

    /// Registers a read of a buffer that is also written to, such as a storage buffer.
    ///
    /// Unlike [`read_only_buffers`], every command buffer that starts reading after a write needs
    /// a barrier against that write.
    ///
    /// [`read_only_buffers`]: Self::read_only_buffers
    pub fn read_from_write_buffers<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::Buffer, ReadKind::FromWrite, cmd, resource, stages)
    }

    pub fn read_from_write_texels<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::TexelBuffer, ReadKind::FromWrite, cmd, resource, stages)
    }

    pub fn read_from_write_images<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.read(ResourceKind::Image, ReadKind::FromWrite, cmd, resource, stages)
    }

    /// Registers a write to a buffer.
    ///
    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_buffers<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::Buffer, WriteKind::Normal, cmd, resource, stage)
    }

    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_texels<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::TexelBuffer, WriteKind::Normal, cmd, resource, stage)
    }

    /// Registers a write to an image. A write that follows reads always needs a barrier, since
    /// the image has to change layout.
    ///
    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_images<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::Image, WriteKind::Normal, cmd, resource, stage)
    }

    /// Registers a write to a buffer that is otherwise only read. The reads recorded since the
    /// last write must complete before it is overwritten, so a barrier is needed whenever there
    /// are any.
    ///
    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_read_only_buffers<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::Buffer, WriteKind::ReadOnly, cmd, resource, stage)
    }

    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_read_only_texels<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::TexelBuffer, WriteKind::ReadOnly, cmd, resource, stage)
    }

    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn write_read_only_images<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::Image, WriteKind::ReadOnly, cmd, resource, stage)
    }

    /// Registers a write to a color attachment. The render pass load operation takes care of the
    /// layout, so only a queue change produces a barrier. Waits are registered as for any other
    /// write.
    ///
    /// # Panics
    ///
    /// - Panics if `stage` doesn't have exactly one bit set.
    pub fn color_attachment_write<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stage: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        self.write(ResourceKind::Image, WriteKind::ColorAttachment, cmd, resource, stage)
    }

    /// Forgets the access history of an image that `cmd` transitions to a layout of the caller's
    /// choosing, typically `GENERAL`.
    ///
    /// `cmd` waits on every previous accessor and becomes the only recorded writer. The returned
    /// barrier covers the stages of the previous write and every read since; it is always
    /// returned, even for an image that was never accessed.
    pub fn image_to_general_layout<R: Any + Send + Sync>(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        resource: &Arc<R>,
        stages: vk::PipelineStageFlags2,
    ) -> Option<ResourceBarrierInfo> {
        let key = resource_key(resource);
        let queue_transfer = self.take_transfer(key, cmd.usage());
        let mut accessor = None;
        let mut accessor_stages = vk::PipelineStageFlags2::NONE;

        let accessors = match self.accessors.remove(&key) {
            Some(previous) => {
                let ResourceAccessors {
                    resource,
                    last_write,
                    last_write_stage,
                    last_reads_in,
                    all_read_stages,
                    ..
                } = previous;

                if let Some(writer) = last_write {
                    accessor_stages |= last_write_stage;
                    accessor = Some(writer.clone());
                    add_wait(&mut self.cmd_waits, cmd, writer, stages);
                }

                if let Some(reader) = last_reads_in.last() {
                    accessor_stages |= all_read_stages;
                    accessor = Some(reader.clone());
                }

                for reader in last_reads_in {
                    add_wait(&mut self.cmd_waits, cmd, reader, stages);
                }

                ResourceAccessors::new(resource)
            }
            None => ResourceAccessors::new(erase(resource)),
        };

        let accessors = self.accessors.entry(key).or_insert(accessors);
        accessors.set_writer(cmd, stages);

        Some(ResourceBarrierInfo {
            accessor,
            accessor_stages,
            queue_transfer,
        })
    }

    /// Stages a transfer of `resource` to the queue with `destination` function. It is handed out
    /// by the next access from a command buffer created for that function. Transfers staged
    /// before then are merged.
    pub fn add_resource_to_qtransfer<R: Any + Send + Sync>(
        &mut self,
        destination: QueueFunction,
        resource: &Arc<R>,
        transfer: QueueTransfer,
    ) {
        let key = resource_key(resource);

        self.transfers
            .entry((key, destination))
            .and_modify(|pending| pending.transfer.merge(&transfer))
            .or_insert_with(|| PendingTransfer {
                resource: Arc::downgrade(&erase(resource)),
                transfer,
            });
    }

    /// Returns the transfer currently staged for `resource` and `destination`, if any.
    pub fn pending_transfer<R: Any + Send + Sync>(
        &self,
        destination: QueueFunction,
        resource: &Arc<R>,
    ) -> Option<QueueTransfer> {
        self.transfers
            .get(&(resource_key(resource), destination))
            .map(|pending| pending.transfer)
    }

    /// Stages a release of `resource` from the queue with `source` function, merging it with any
    /// release already staged.
    pub fn release_resource_at<R: Any + Send + Sync>(
        &mut self,
        source: QueueFunction,
        resource: &Arc<R>,
        release: QueueTransfer,
    ) {
        let key = resource_key(resource);

        self.releases
            .entry(source)
            .or_default()
            .entry(key)
            .and_modify(|pending| pending.transfer.merge(&release))
            .or_insert_with(|| PendingTransfer {
                resource: Arc::downgrade(&erase(resource)),
                transfer: release,
            });
    }

    /// Removes and returns every release staged for the queue with `source` function. Releases of
    /// resources that no longer exist are dropped.
    pub fn get_releases_from_queue(&mut self, source: QueueFunction) -> Vec<QueueRelease> {
        let Some(releases) = self.releases.remove(&source) else {
            return Vec::new();
        };

        releases
            .into_values()
            .filter_map(|pending| {
                pending.resource.upgrade().map(|resource| QueueRelease {
                    resource,
                    release: pending.transfer,
                })
            })
            .collect()
    }

    /// Returns the command buffers `cmd` must wait on, as registered by the access queries.
    pub fn get_cmd_buffer_deps(&self, cmd: &CommandBuffer) -> &[CommandBufferWait] {
        self.cmd_waits
            .get(&cmd.id())
            .map(|waits| waits.as_slice())
            .unwrap_or_default()
    }

    /// Forgets everything about `cmd`, which has finished executing.
    ///
    /// Resources whose only accessor was `cmd` stop being tracked.
    pub fn clear_finished_cmd(&mut self, cmd: &CommandBuffer) {
        self.accessors.retain(|_, accessors| {
            if accessors.last_write.as_deref() == Some(cmd) {
                accessors.last_write = None;
                accessors.last_write_stage = vk::PipelineStageFlags2::NONE;
            }

            let read_count = accessors.last_reads_in.len();
            accessors.last_reads_in.retain(|reader| **reader != *cmd);

            if accessors.last_reads_in.is_empty() {
                accessors.all_read_stages = vk::PipelineStageFlags2::NONE;
                accessors.last_read_stages = vk::PipelineStageFlags2::NONE;
            } else if accessors.last_reads_in.len() != read_count {
                // The stages of the remaining readers aren't known individually.
                accessors.last_read_stages = accessors.all_read_stages;
            }

            !accessors.is_empty()
        });

        self.cmd_waits.remove(&cmd.id());
        self.cmd_waits.retain(|_, waits| {
            waits.retain(|wait| *wait.cmd_buffer != *cmd);

            !waits.is_empty()
        });
    }

    /// Sweeps state that is no longer needed.
    ///
    /// - Resources that only the tracker still holds stop being tracked.
    /// - Consecutive duplicates in the reader lists are collapsed, keeping the first.
    /// - Staged transfers and releases of resources that no longer exist are dropped.
    pub fn clear_unwanted(&mut self) {
        self.accessors
            .retain(|_, accessors| Arc::strong_count(&accessors.resource) > 1);

        for accessors in self.accessors.values_mut() {
            accessors.last_reads_in.dedup();
        }

        self.transfers
            .retain(|_, pending| pending.resource.strong_count() != 0);

        for releases in self.releases.values_mut() {
            releases.retain(|_, pending| pending.resource.strong_count() != 0);
        }

        self.releases.retain(|_, releases| !releases.is_empty());
    }

    /// Returns whether the tracker has any access recorded for `resource`.
    pub fn is_tracked<R: Any + Send + Sync>(&self, resource: &Arc<R>) -> bool {
        self.accessors.contains_key(&resource_key(resource))
    }

    /// Returns the number of resources with recorded accesses.
    pub fn tracked_resource_count(&self) -> usize {
        self.accessors.len()
    }

    #[cfg(test)]
    fn readers<R: Any + Send + Sync>(&self, resource: &Arc<R>) -> Vec<NonZero<u64>> {
        self.accessors
            .get(&resource_key(resource))
            .map_or(Vec::new(), |accessors| {
                accessors.last_reads_in.iter().map(|cmd| cmd.id()).collect()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::command_buffer;
    use ash::vk::PipelineStageFlags2 as Stages;

    struct Resource;

    fn resource() -> Arc<Resource> {
        Arc::new(Resource)
    }

    fn dep_ids(tracker: &ResourceTracker, cmd: &CommandBuffer) -> Vec<NonZero<u64>> {
        tracker
            .get_cmd_buffer_deps(cmd)
            .iter()
            .map(|wait| wait.cmd_buffer.id())
            .collect()
    }

    fn accessor_id(info: &ResourceBarrierInfo) -> Option<NonZero<u64>> {
        info.accessor.as_ref().map(|cmd| cmd.id())
    }

    #[test]
    fn write_read_write() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);
        let c = command_buffer(0, QueueFunction::Graphics);

        assert!(tracker.write_buffers(&a, &buffer, Stages::COPY).is_none());
        assert!(dep_ids(&tracker, &a).is_empty());

        let info = tracker
            .read_only_buffers(&b, &buffer, Stages::VERTEX_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(a.id()));
        assert_eq!(info.accessor_stages, Stages::COPY);
        assert_eq!(dep_ids(&tracker, &b), [a.id()]);
        assert_eq!(
            tracker.get_cmd_buffer_deps(&b)[0].stages,
            Stages::VERTEX_SHADER,
        );

        assert!(tracker.write_buffers(&c, &buffer, Stages::COPY).is_none());
        assert_eq!(dep_ids(&tracker, &c), [b.id()]);
    }

    #[test]
    fn write_after_read_on_other_queue() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);
        let c = command_buffer(1, QueueFunction::Compute);

        tracker.write_buffers(&a, &buffer, Stages::COPY);
        tracker.read_only_buffers(&b, &buffer, Stages::VERTEX_SHADER);

        let info = tracker
            .write_buffers(&c, &buffer, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(b.id()));
        assert_eq!(info.accessor_stages, Stages::VERTEX_SHADER);
        assert_eq!(dep_ids(&tracker, &c), [b.id()]);
    }

    #[test]
    fn read_after_read() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let image = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);

        assert!(tracker
            .read_only_buffers(&a, &buffer, Stages::VERTEX_SHADER)
            .is_none());
        assert!(tracker
            .read_only_buffers(&b, &buffer, Stages::VERTEX_SHADER)
            .is_none());
        assert!(tracker
            .read_only_images(&a, &image, Stages::FRAGMENT_SHADER)
            .is_none());
        assert!(tracker
            .read_only_images(&b, &image, Stages::FRAGMENT_SHADER)
            .is_none());

        assert!(dep_ids(&tracker, &a).is_empty());
        assert!(dep_ids(&tracker, &b).is_empty());
    }

    #[test]
    fn read_after_read_on_other_queue() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(1, QueueFunction::Compute);

        tracker.read_only_buffers(&a, &buffer, Stages::VERTEX_SHADER);
        let info = tracker
            .read_only_buffers(&b, &buffer, Stages::COMPUTE_SHADER)
            .unwrap();

        assert_eq!(accessor_id(&info), Some(a.id()));
        assert_eq!(info.accessor_stages, Stages::VERTEX_SHADER);
        assert_eq!(dep_ids(&tracker, &b), [a.id()]);
    }

    #[test]
    fn second_reader_after_write() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let image = resource();
        let writer = command_buffer(0, QueueFunction::Graphics);
        let first = command_buffer(0, QueueFunction::Graphics);
        let second = command_buffer(0, QueueFunction::Graphics);

        tracker.write_buffers(&writer, &buffer, Stages::COPY);
        tracker.write_images(&writer, &image, Stages::COPY);
        assert!(tracker
            .read_only_buffers(&first, &buffer, Stages::VERTEX_SHADER)
            .is_some());
        assert!(tracker
            .read_only_images(&first, &image, Stages::FRAGMENT_SHADER)
            .is_some());

        // A buffer needs no further barrier, but the second reader still waits on the writer.
        assert!(tracker
            .read_only_buffers(&second, &buffer, Stages::VERTEX_SHADER)
            .is_none());

        // An image read by a new command buffer needs a layout transition.
        let info = tracker
            .read_only_images(&second, &image, Stages::FRAGMENT_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));
        assert_eq!(info.accessor_stages, Stages::COPY);

        assert_eq!(dep_ids(&tracker, &second), [writer.id()]);
    }

    #[test]
    fn reading_own_write() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let a = command_buffer(0, QueueFunction::Graphics);

        tracker.write_images(&a, &image, Stages::COPY);
        let info = tracker
            .read_only_images(&a, &image, Stages::FRAGMENT_SHADER)
            .unwrap();

        assert_eq!(accessor_id(&info), Some(a.id()));
        assert!(dep_ids(&tracker, &a).is_empty());

        // Reading again from the same command buffer is already covered.
        assert!(tracker
            .read_only_images(&a, &image, Stages::FRAGMENT_SHADER)
            .is_none());
    }

    #[test]
    fn read_from_write_needs_barrier_per_reader() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let writer = command_buffer(0, QueueFunction::Compute);
        let first = command_buffer(0, QueueFunction::Compute);
        let second = command_buffer(0, QueueFunction::Compute);

        tracker.write_buffers(&writer, &buffer, Stages::COMPUTE_SHADER);
        assert!(tracker
            .read_from_write_buffers(&first, &buffer, Stages::COMPUTE_SHADER)
            .is_some());

        let info = tracker
            .read_from_write_buffers(&second, &buffer, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));

        assert!(tracker
            .read_from_write_buffers(&second, &buffer, Stages::COMPUTE_SHADER)
            .is_none());
    }

    #[test]
    fn read_from_write_images_per_reader() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let writer = command_buffer(0, QueueFunction::Graphics);
        let first = command_buffer(0, QueueFunction::Graphics);
        let second = command_buffer(0, QueueFunction::Graphics);

        tracker.write_images(&writer, &image, Stages::COPY);

        let info = tracker
            .read_from_write_images(&first, &image, Stages::FRAGMENT_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));
        assert_eq!(info.accessor_stages, Stages::COPY);

        // Readers on the same queue family don't cover each other.
        let info = tracker
            .read_from_write_images(&second, &image, Stages::FRAGMENT_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));
        assert_eq!(info.accessor_stages, Stages::COPY);
        assert_eq!(dep_ids(&tracker, &second), [writer.id()]);

        assert!(tracker
            .read_from_write_images(&second, &image, Stages::FRAGMENT_SHADER)
            .is_none());
        assert_eq!(tracker.readers(&image), [first.id(), second.id()]);
    }

    #[test]
    fn texel_buffers() {
        let mut tracker = ResourceTracker::new();
        let texels = resource();
        let uniform_texels = resource();
        let writer = command_buffer(1, QueueFunction::Compute);
        let first = command_buffer(1, QueueFunction::Compute);
        let second = command_buffer(1, QueueFunction::Compute);
        let third = command_buffer(1, QueueFunction::Compute);
        let overwriter = command_buffer(1, QueueFunction::Compute);

        assert!(tracker
            .write_texels(&writer, &texels, Stages::COMPUTE_SHADER)
            .is_none());

        let info = tracker
            .read_only_texels(&first, &texels, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));
        assert_eq!(info.accessor_stages, Stages::COMPUTE_SHADER);

        // Texel buffers have no layout, so a second read-only reader is already covered.
        assert!(tracker
            .read_only_texels(&second, &texels, Stages::COMPUTE_SHADER)
            .is_none());

        let info = tracker
            .read_from_write_texels(&third, &texels, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(writer.id()));

        assert!(tracker
            .write_texels(&overwriter, &texels, Stages::COMPUTE_SHADER)
            .is_none());
        assert_eq!(
            dep_ids(&tracker, &overwriter),
            [first.id(), second.id(), third.id()],
        );

        assert!(tracker
            .read_only_texels(&first, &uniform_texels, Stages::VERTEX_SHADER)
            .is_none());
        let info = tracker
            .write_read_only_texels(&writer, &uniform_texels, Stages::COPY)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(first.id()));
        assert_eq!(info.accessor_stages, Stages::VERTEX_SHADER);
    }

    #[test]
    fn image_write_after_read() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let attachment = resource();
        let reader = command_buffer(0, QueueFunction::Graphics);
        let writer = command_buffer(0, QueueFunction::Graphics);

        tracker.read_only_images(&reader, &image, Stages::FRAGMENT_SHADER);
        let info = tracker.write_images(&writer, &image, Stages::COPY).unwrap();
        assert_eq!(accessor_id(&info), Some(reader.id()));
        assert_eq!(info.accessor_stages, Stages::FRAGMENT_SHADER);

        tracker.read_only_images(&reader, &attachment, Stages::FRAGMENT_SHADER);
        assert!(tracker
            .color_attachment_write(&writer, &attachment, Stages::COLOR_ATTACHMENT_OUTPUT)
            .is_none());

        assert_eq!(dep_ids(&tracker, &writer), [reader.id()]);
    }

    #[test]
    fn write_after_write() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);
        let c = command_buffer(2, QueueFunction::Transfer);

        tracker.write_buffers(&a, &buffer, Stages::COPY);
        assert!(tracker.write_buffers(&a, &buffer, Stages::COPY).is_none());
        assert!(tracker.write_buffers(&b, &buffer, Stages::COPY).is_none());
        assert_eq!(dep_ids(&tracker, &b), [a.id()]);

        let info = tracker.write_buffers(&c, &buffer, Stages::COPY).unwrap();
        assert_eq!(accessor_id(&info), Some(b.id()));
        assert_eq!(dep_ids(&tracker, &c), [b.id()]);
    }

    #[test]
    fn write_read_only() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let image = resource();
        let reader = command_buffer(0, QueueFunction::Graphics);
        let writer = command_buffer(0, QueueFunction::Graphics);

        assert!(tracker
            .write_read_only_images(&writer, &image, Stages::COPY)
            .is_none());

        tracker.read_only_buffers(&reader, &buffer, Stages::VERTEX_SHADER);
        let info = tracker
            .write_read_only_buffers(&writer, &buffer, Stages::COPY)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(reader.id()));
        assert_eq!(dep_ids(&tracker, &writer), [reader.id()]);
    }

    #[test]
    #[should_panic(expected = "exactly one pipeline stage")]
    fn multi_stage_write() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let cmd = command_buffer(0, QueueFunction::Graphics);

        tracker.write_buffers(&cmd, &buffer, Stages::COPY | Stages::COMPUTE_SHADER);
    }

    #[test]
    fn queue_transfer_is_consumed_once() {
        let mut tracker = ResourceTracker::new();
        let buffer = resource();
        let graphics = command_buffer(0, QueueFunction::Graphics);
        let compute = command_buffer(1, QueueFunction::Compute);
        let transfer = QueueTransfer {
            stage_mask: Stages::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_STORAGE_READ,
            image_layout: None,
        };

        tracker.add_resource_to_qtransfer(QueueFunction::Compute, &buffer, transfer);
        tracker.add_resource_to_qtransfer(
            QueueFunction::Compute,
            &buffer,
            QueueTransfer {
                access_mask: vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ..QueueTransfer::NONE
            },
        );

        assert!(tracker
            .read_only_buffers(&graphics, &buffer, Stages::VERTEX_SHADER)
            .is_none());

        let info = tracker
            .write_buffers(&compute, &buffer, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(
            info.queue_transfer,
            Some(QueueTransfer {
                stage_mask: Stages::COMPUTE_SHADER,
                access_mask: vk::AccessFlags2::SHADER_STORAGE_READ
                    | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                image_layout: None,
            }),
        );
        assert!(tracker
            .pending_transfer(QueueFunction::Compute, &buffer)
            .is_none());

        let info = tracker
            .read_only_buffers(&compute, &buffer, Stages::COMPUTE_SHADER)
            .unwrap();
        assert!(info.queue_transfer.is_none());
    }

    #[test]
    fn first_write_with_transfer() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let cmd = command_buffer(0, QueueFunction::Graphics);
        let transfer = QueueTransfer {
            stage_mask: Stages::COPY,
            access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            image_layout: Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        };

        tracker.add_resource_to_qtransfer(QueueFunction::Graphics, &image, transfer);
        let info = tracker.write_images(&cmd, &image, Stages::COPY).unwrap();

        assert!(info.accessor.is_none());
        assert_eq!(info.queue_transfer, Some(transfer));
    }

    #[test]
    fn releases_are_drained() {
        let mut tracker = ResourceTracker::new();
        let kept = resource();
        let dropped = resource();
        let release = QueueTransfer {
            stage_mask: Stages::COPY,
            access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            image_layout: None,
        };

        tracker.release_resource_at(QueueFunction::Transfer, &kept, release);
        tracker.release_resource_at(QueueFunction::Transfer, &dropped, release);
        drop(dropped);

        assert!(tracker
            .get_releases_from_queue(QueueFunction::Graphics)
            .is_empty());

        let releases = tracker.get_releases_from_queue(QueueFunction::Transfer);
        assert_eq!(releases.len(), 1);
        assert_eq!(
            Arc::as_ptr(&releases[0].resource).cast::<()>(),
            Arc::as_ptr(&kept).cast::<()>(),
        );
        assert_eq!(releases[0].release, release);

        assert!(tracker
            .get_releases_from_queue(QueueFunction::Transfer)
            .is_empty());
    }

    #[test]
    fn general_layout_resets_history() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let writer = command_buffer(0, QueueFunction::Graphics);
        let reader = command_buffer(0, QueueFunction::Graphics);
        let transition = command_buffer(0, QueueFunction::Graphics);
        let next = command_buffer(0, QueueFunction::Graphics);

        tracker.write_images(&writer, &image, Stages::COPY);
        tracker.read_only_images(&reader, &image, Stages::FRAGMENT_SHADER);

        let info = tracker
            .image_to_general_layout(&transition, &image, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(reader.id()));
        assert_eq!(info.accessor_stages, Stages::COPY | Stages::FRAGMENT_SHADER);
        assert_eq!(dep_ids(&tracker, &transition), [writer.id(), reader.id()]);
        assert!(tracker.readers(&image).is_empty());

        let info = tracker
            .read_only_images(&next, &image, Stages::COMPUTE_SHADER)
            .unwrap();
        assert_eq!(accessor_id(&info), Some(transition.id()));
        assert_eq!(dep_ids(&tracker, &next), [transition.id()]);
    }

    #[test]
    fn general_layout_on_untouched_image() {
        let mut tracker = ResourceTracker::new();
        let image = resource();
        let cmd = command_buffer(0, QueueFunction::Graphics);

        let info = tracker
            .image_to_general_layout(&cmd, &image, Stages::ALL_COMMANDS)
            .unwrap();

        assert!(info.accessor.is_none());
        assert_eq!(info.accessor_stages, Stages::NONE);
        assert!(tracker.is_tracked(&image));
    }

    #[test]
    fn clear_finished_cmd() {
        let mut tracker = ResourceTracker::new();
        let shared = resource();
        let private = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);

        tracker.write_buffers(&a, &shared, Stages::COPY);
        tracker.write_buffers(&a, &private, Stages::COPY);
        tracker.read_only_buffers(&b, &shared, Stages::VERTEX_SHADER);
        assert_eq!(dep_ids(&tracker, &b), [a.id()]);

        tracker.clear_finished_cmd(&a);

        assert!(tracker.get_cmd_buffer_deps(&a).is_empty());
        assert!(tracker.get_cmd_buffer_deps(&b).is_empty());
        assert!(!tracker.is_tracked(&private));
        assert!(tracker.is_tracked(&shared));
        assert_eq!(tracker.readers(&shared), [b.id()]);

        tracker.clear_finished_cmd(&b);
        assert_eq!(tracker.tracked_resource_count(), 0);
    }

    #[test]
    fn clear_unwanted() {
        let mut tracker = ResourceTracker::new();
        let kept = resource();
        let dropped = resource();
        let a = command_buffer(0, QueueFunction::Graphics);
        let b = command_buffer(0, QueueFunction::Graphics);

        tracker.read_only_buffers(&a, &kept, Stages::VERTEX_SHADER);
        tracker.read_only_buffers(&b, &kept, Stages::VERTEX_SHADER);
        tracker.read_only_buffers(&a, &kept, Stages::VERTEX_SHADER);
        tracker.read_only_buffers(&a, &dropped, Stages::VERTEX_SHADER);
        tracker.add_resource_to_qtransfer(QueueFunction::Compute, &dropped, QueueTransfer::NONE);
        drop(dropped);

        tracker.clear_finished_cmd(&b);
        assert_eq!(tracker.readers(&kept), [a.id(), a.id()]);

        tracker.clear_unwanted();

        assert_eq!(tracker.tracked_resource_count(), 1);
        assert_eq!(tracker.readers(&kept), [a.id()]);
        assert!(tracker.transfers.is_empty());
    }
}
