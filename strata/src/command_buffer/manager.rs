use super::{pool::CommandPools, CommandBuffer, CommandBufferState, CommandPoolKind};
use crate::{
    device::{QueueFunction, RawDevice, SubmitBatch},
    sync::ResourceTracker,
    NonExhaustive, VulkanError,
};
use ash::vk;
use foldhash::HashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::{
    collections::hash_map::Entry,
    error::Error,
    fmt,
    num::NonZero,
    sync::Arc,
};

new_key_type! {
    struct SyncInfoKey;
}

/// Completion tracking shared by the command buffers of one submission.
#[derive(Debug)]
struct SubmissionSyncInfo {
    semaphore: vk::Semaphore,
    /// The value `semaphore` reaches once every batch of the submission is done.
    signal_value: u64,
    fence: vk::Fence,
    owns_fence: bool,
    ref_count: u32,
}

/// A temporary command buffer that was submitted and hasn't been finished yet.
#[derive(Debug)]
struct InFlightTemp {
    cmd_buffer: Arc<CommandBuffer>,
    sync_info: SyncInfoKey,
}

#[derive(Debug)]
struct NamedCommandBuffer {
    cmd_buffer: Arc<CommandBuffer>,
    state: CommandBufferState,
    sync_info: Option<SyncInfoKey>,
}

/// A semaphore a submission waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,

    /// The value to wait for. Ignored for binary semaphores.
    pub value: u64,

    pub stage_mask: vk::PipelineStageFlags2,
}

impl SemaphoreWait {
    #[inline]
    pub fn binary(semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2) -> Self {
        SemaphoreWait {
            semaphore,
            value: 0,
            stage_mask,
        }
    }

    #[inline]
    pub fn timeline(
        semaphore: vk::Semaphore,
        value: u64,
        stage_mask: vk::PipelineStageFlags2,
    ) -> Self {
        SemaphoreWait {
            semaphore,
            value,
            stage_mask,
        }
    }
}

/// One batch of command buffers to submit.
#[derive(Clone, Debug)]
pub struct CommandSubmitInfo {
    /// Semaphores to wait on before the command buffers execute, in addition to the waits
    /// registered with the resource tracker.
    ///
    /// The default value is empty.
    pub wait_semaphores: Vec<SemaphoreWait>,

    /// The command buffers to execute. All of them must belong to the same queue.
    ///
    /// The default value is empty.
    pub cmd_buffers: Vec<Arc<CommandBuffer>>,

    /// Binary semaphores to signal once the command buffers are done.
    ///
    /// The default value is empty.
    pub signal_semaphores: Vec<vk::Semaphore>,

    pub _ne: NonExhaustive,
}

impl Default for CommandSubmitInfo {
    #[inline]
    fn default() -> Self {
        CommandSubmitInfo {
            wait_semaphores: Vec::new(),
            cmd_buffers: Vec::new(),
            signal_semaphores: Vec::new(),
            _ne: NonExhaustive(()),
        }
    }
}

impl CommandSubmitInfo {
    /// Returns a `CommandSubmitInfo` with the specified `cmd_buffers`.
    #[inline]
    pub fn new(cmd_buffers: Vec<Arc<CommandBuffer>>) -> Self {
        CommandSubmitInfo {
            cmd_buffers,
            ..Default::default()
        }
    }
}

/// Error that can happen when submitting command buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The command buffers don't all belong to the same queue.
    QueueMismatch {
        expected: vk::Queue,
        found: vk::Queue,
    },

    /// There is no command buffer to take the queue from.
    NoQueue,

    /// A named command buffer is not in the [`Recorded`] state, or is not known to the manager.
    ///
    /// [`Recorded`]: CommandBufferState::Recorded
    InvalidState {
        name: String,
        state: Option<CommandBufferState>,
    },

    /// Creating a synchronization object or submitting failed.
    Vulkan(VulkanError),
}

impl Error for SubmitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueMismatch { expected, found } => write!(
                f,
                "the command buffers belong to different queues ({:?} and {:?})",
                expected, found,
            ),
            Self::NoQueue => write!(f, "there is no queue to submit to"),
            Self::InvalidState { name, state } => match state {
                Some(state) => write!(
                    f,
                    "command buffer `{}` is in the {:?} state, but must be recorded",
                    name, state,
                ),
                None => write!(f, "command buffer `{}` is not known to the manager", name),
            },
            Self::Vulkan(_) => write!(f, "a runtime error occurred"),
        }
    }
}

impl From<VulkanError> for SubmitError {
    fn from(err: VulkanError) -> Self {
        Self::Vulkan(err)
    }
}

/// Owns the command pools of a device and the lifecycle of the command buffers allocated from
/// them.
///
/// Three pools are created for every queue function the device has a queue for: one for
/// record-once buffers, one for temporary buffers and one for reusable buffers.
///
/// Named buffers are tracked through [`CommandBufferState`]. Every submission signals a
/// timeline semaphore created for it and is given a fence. Later submissions that depend on its
/// command buffers, according to the [`ResourceTracker`], wait on that semaphore, and
/// [`cmd_finished_handle`] waits on the fence. Temporary buffers stay in flight until they are
/// finished or freed.
///
/// [`cmd_finished_handle`]: Self::cmd_finished_handle
pub struct CommandBufferManager {
    device: Arc<dyn RawDevice>,
    pools: CommandPools,
    named: HashMap<String, NamedCommandBuffer>,
    temps_in_flight: HashMap<NonZero<u64>, InFlightTemp>,
    sync_infos: SlotMap<SyncInfoKey, SubmissionSyncInfo>,
}

impl CommandBufferManager {
    /// Creates the command pools of every queue function `device` has a queue for.
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Self, VulkanError> {
        let pools = CommandPools::new(&*device)?;

        Ok(CommandBufferManager {
            device,
            pools,
            named: HashMap::default(),
            temps_in_flight: HashMap::default(),
            sync_infos: SlotMap::with_key(),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Returns the named command buffer `name`.
    pub fn cmd_buffer(&self, name: &str) -> Option<&Arc<CommandBuffer>> {
        self.named.get(name).map(|entry| &entry.cmd_buffer)
    }

    /// Returns the state of the named command buffer `name`.
    pub fn state(&self, name: &str) -> Option<CommandBufferState> {
        self.named.get(name).map(|entry| entry.state)
    }

    /// Returns the entry of the named buffer `name`, allocating it in the [`Idle`] state if it
    /// doesn't exist yet.
    ///
    /// [`Idle`]: CommandBufferState::Idle
    fn named_entry(
        &mut self,
        name: &str,
        usage: QueueFunction,
        kind: CommandPoolKind,
    ) -> Result<&mut NamedCommandBuffer, VulkanError> {
        match self.named.entry(name.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let cmd_buffer =
                    allocate(&*self.device, &self.pools, Some(name.to_owned()), usage, kind)?;

                log::trace!("allocated command buffer `{}` for {:?} work", name, usage);

                Ok(entry.insert(NamedCommandBuffer {
                    cmd_buffer,
                    state: CommandBufferState::Idle,
                    sync_info: None,
                }))
            }
        }
    }

    /// Allocates a temporary command buffer and begins recording it.
    ///
    /// Temporary buffers have no state in the manager, but their submissions are tracked until
    /// [`cmd_finished_handle`] or [`free_cmd_buffer`] is called for them. Free them once they
    /// are finished.
    ///
    /// # Panics
    ///
    /// - Panics if the device has no queue for `usage`.
    ///
    /// [`cmd_finished_handle`]: Self::cmd_finished_handle
    /// [`free_cmd_buffer`]: Self::free_cmd_buffer
    pub fn begin_temp(&mut self, usage: QueueFunction) -> Result<Arc<CommandBuffer>, VulkanError> {
        let cmd_buffer = allocate(
            &*self.device,
            &self.pools,
            None,
            usage,
            CommandPoolKind::Transient,
        )?;

        // SAFETY: The command buffer was just allocated.
        let result = unsafe {
            self.device
                .begin_command_buffer(cmd_buffer.handle(), cmd_buffer.kind().usage_flags())
        };

        if let Err(err) = result {
            // SAFETY: The command buffer is not in use.
            unsafe {
                self.device
                    .free_command_buffer(cmd_buffer.pool(), cmd_buffer.handle())
            };

            return Err(err);
        }

        Ok(cmd_buffer)
    }

    /// Begins recording the record-once command buffer `name`, allocating it the first time.
    ///
    /// If the buffer is already recording, a warning is logged and it is returned as is.
    ///
    /// # Panics
    ///
    /// - Panics if the buffer has already been recorded.
    /// - Panics if the device has no queue for `usage`.
    pub fn begin_record_once(
        &mut self,
        name: &str,
        usage: QueueFunction,
    ) -> Result<Arc<CommandBuffer>, VulkanError> {
        let device = self.device.clone();
        let entry = self.named_entry(name, usage, CommandPoolKind::OneTime)?;

        match entry.state {
            CommandBufferState::Recording | CommandBufferState::RenderPass => {
                log::warn!("command buffer `{}` is already recording", name);
            }
            CommandBufferState::Recorded | CommandBufferState::Submitted => {
                panic!(
                    "command buffer `{}` can only be recorded once and has already been recorded",
                    name,
                );
            }
            CommandBufferState::Idle => {
                let cmd_buffer = &entry.cmd_buffer;

                // SAFETY: The command buffer has never been recorded.
                unsafe {
                    device
                        .begin_command_buffer(cmd_buffer.handle(), cmd_buffer.kind().usage_flags())
                }?;

                entry.state = CommandBufferState::Recording;
            }
        }

        Ok(entry.cmd_buffer.clone())
    }

    /// Begins recording the reusable command buffer `name`, allocating it the first time.
    ///
    /// A buffer that was recorded before is reset and recorded anew. If the buffer is already
    /// recording, a warning is logged and it is returned as is.
    ///
    /// # Panics
    ///
    /// - Panics if the buffer is submitted.
    /// - Panics if the buffer was allocated by [`begin_record_once`].
    /// - Panics if the device has no queue for `usage`.
    ///
    /// [`begin_record_once`]: Self::begin_record_once
    pub fn begin_reuse(
        &mut self,
        name: &str,
        usage: QueueFunction,
    ) -> Result<Arc<CommandBuffer>, VulkanError> {
        let device = self.device.clone();
        let entry = self.named_entry(name, usage, CommandPoolKind::Resettable)?;

        match entry.state {
            CommandBufferState::Recording | CommandBufferState::RenderPass => {
                log::warn!("command buffer `{}` is already recording", name);
            }
            CommandBufferState::Submitted => {
                panic!(
                    "command buffer `{}` must not be recorded again while it is submitted",
                    name,
                );
            }
            CommandBufferState::Idle | CommandBufferState::Recorded => {
                let cmd_buffer = &entry.cmd_buffer;

                assert!(
                    entry.state == CommandBufferState::Idle || cmd_buffer.is_resettable(),
                    "command buffer `{}` was not allocated as reusable and cannot be reset",
                    name,
                );

                // SAFETY: The command buffer is not pending execution, and its pool allows
                // resetting it implicitly.
                unsafe {
                    device
                        .begin_command_buffer(cmd_buffer.handle(), cmd_buffer.kind().usage_flags())
                }?;

                entry.state = CommandBufferState::Recording;
            }
        }

        Ok(entry.cmd_buffer.clone())
    }

    fn transition(&mut self, cmd: &CommandBuffer, next: CommandBufferState) {
        let Some(name) = cmd.name() else {
            return;
        };

        let Some(entry) = self.named.get_mut(name) else {
            log::warn!("command buffer `{}` is not known to the manager", name);
            return;
        };

        if entry.state.can_transition_to(next) {
            entry.state = next;
        } else {
            log::warn!(
                "command buffer `{}` cannot go from the {:?} to the {:?} state",
                name,
                entry.state,
                next,
            );
        }
    }

    /// Marks `cmd` as being inside a render pass. Does nothing for temporary buffers.
    pub fn start_render_pass(&mut self, cmd: &CommandBuffer) {
        self.transition(cmd, CommandBufferState::RenderPass);
    }

    /// Marks `cmd` as no longer being inside a render pass. Does nothing for temporary buffers.
    pub fn end_render_pass(&mut self, cmd: &CommandBuffer) {
        self.transition(cmd, CommandBufferState::Recording);
    }

    /// Ends the recording of `cmd`. Named buffers become ready for submission.
    pub fn end_cmd_buffer(&mut self, cmd: &CommandBuffer) -> Result<(), VulkanError> {
        if let Some(entry) = cmd.name().and_then(|name| self.named.get_mut(name)) {
            match entry.state {
                CommandBufferState::Recording => {}
                CommandBufferState::RenderPass => {
                    log::warn!(
                        "command buffer `{}` was ended inside a render pass",
                        cmd.name().unwrap_or_default(),
                    );
                }
                state => {
                    log::warn!(
                        "command buffer `{}` is not recording but in the {:?} state",
                        cmd.name().unwrap_or_default(),
                        state,
                    );

                    return Ok(());
                }
            }

            // SAFETY: The command buffer is recording.
            unsafe { self.device.end_command_buffer(cmd.handle()) }?;
            entry.state = CommandBufferState::Recorded;

            return Ok(());
        }

        // SAFETY: The caller must ensure that the temporary buffer is recording.
        unsafe { self.device.end_command_buffer(cmd.handle()) }?;

        Ok(())
    }

    fn validate_submission(&self, infos: &[CommandSubmitInfo]) -> Result<vk::Queue, SubmitError> {
        let mut queue = None;

        for cmd in infos.iter().flat_map(|info| &info.cmd_buffers) {
            match queue {
                None => queue = Some(cmd.queue()),
                Some(expected) if expected != cmd.queue() => {
                    return Err(SubmitError::QueueMismatch {
                        expected,
                        found: cmd.queue(),
                    });
                }
                Some(_) => {}
            }

            if let Some(name) = cmd.name() {
                let state = self
                    .named
                    .get(name)
                    .filter(|entry| entry.cmd_buffer == *cmd)
                    .map(|entry| entry.state);

                if state != Some(CommandBufferState::Recorded) {
                    return Err(SubmitError::InvalidState {
                        name: name.to_owned(),
                        state,
                    });
                }
            } else if self.temps_in_flight.contains_key(&cmd.id()) {
                return Err(SubmitError::InvalidState {
                    name: format!("temporary command buffer {}", cmd.id()),
                    state: Some(CommandBufferState::Submitted),
                });
            }
        }

        queue
            .filter(|queue| *queue != vk::Queue::null())
            .ok_or(SubmitError::NoQueue)
    }

    fn in_flight_sync_info(&self, cmd: &CommandBuffer) -> Option<&SubmissionSyncInfo> {
        let key = match cmd.name() {
            Some(name) => {
                let entry = self.named.get(name)?;

                if *entry.cmd_buffer != *cmd || entry.state != CommandBufferState::Submitted {
                    return None;
                }

                entry.sync_info?
            }
            None => self.temps_in_flight.get(&cmd.id())?.sync_info,
        };

        self.sync_infos.get(key)
    }

    /// Submits `infos` to their queue in a single call.
    ///
    /// All command buffers must belong to the same queue, and named command buffers must be in
    /// the [`Recorded`] state. Nothing is changed if that's not the case.
    ///
    /// A temporary command buffer must not be submitted again before it is finished.
    ///
    /// If `tracker` is given, every batch also waits on the submissions of the command buffers
    /// its command buffers depend on, as long as those are still in flight.
    ///
    /// Every batch signals a timeline semaphore used to track the completion of the submission,
    /// and `fence` is created if not given. The caller must keep a given `fence` alive until
    /// every command buffer of the submission is finished.
    ///
    /// [`Recorded`]: CommandBufferState::Recorded
    pub fn submit_cmds(
        &mut self,
        infos: &[CommandSubmitInfo],
        fence: Option<vk::Fence>,
        tracker: Option<&ResourceTracker>,
    ) -> Result<(), SubmitError> {
        let queue = self.validate_submission(infos).inspect_err(|err| {
            log::error!("submission aborted: {}", err);
        })?;

        let mut submitted = SmallVec::<[&Arc<CommandBuffer>; 8]>::new();

        for cmd in infos.iter().flat_map(|info| &info.cmd_buffers) {
            if !submitted.iter().any(|seen| seen.id() == cmd.id()) {
                submitted.push(cmd);
            }
        }

        let semaphore = self.device.create_timeline_semaphore(0)?;

        let (fence, owns_fence) = match fence {
            Some(fence) => (fence, false),
            None => match self.device.create_fence(false) {
                Ok(fence) => (fence, true),
                Err(err) => {
                    // SAFETY: The semaphore was never used.
                    unsafe { self.device.destroy_semaphore(semaphore) };

                    return Err(err.into());
                }
            },
        };

        let mut per_batch = SmallVec::<[PerBatch; 4]>::with_capacity(infos.len());

        for (index, info) in infos.iter().enumerate() {
            let mut waits = info
                .wait_semaphores
                .iter()
                .map(|wait| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(wait.semaphore)
                        .value(wait.value)
                        .stage_mask(wait.stage_mask)
                })
                .collect::<SmallVec<[_; 8]>>();
            let mut tracked_waits = SmallVec::<[vk::SemaphoreSubmitInfo<'static>; 8]>::new();

            for dependency in tracker
                .into_iter()
                .flat_map(|tracker| {
                    info.cmd_buffers
                        .iter()
                        .flat_map(move |cmd| tracker.get_cmd_buffer_deps(cmd))
                })
                .filter(|dependency| {
                    !submitted
                        .iter()
                        .any(|cmd| cmd.id() == dependency.cmd_buffer.id())
                })
            {
                let Some(sync_info) = self.in_flight_sync_info(&dependency.cmd_buffer) else {
                    continue;
                };

                match tracked_waits
                    .iter_mut()
                    .find(|wait| wait.semaphore == sync_info.semaphore)
                {
                    Some(wait) => wait.stage_mask |= dependency.stages,
                    None => tracked_waits.push(
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(sync_info.semaphore)
                            .value(sync_info.signal_value)
                            .stage_mask(dependency.stages),
                    ),
                }
            }

            waits.extend(tracked_waits);

            let command_buffers = info
                .cmd_buffers
                .iter()
                .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd.handle()))
                .collect();

            let mut signals = info
                .signal_semaphores
                .iter()
                .map(|&semaphore| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(semaphore)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                })
                .collect::<SmallVec<[_; 4]>>();

            // Signal operations on one queue happen in submission order, so every batch can
            // signal the next value.
            signals.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .value(index as u64 + 1)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );

            per_batch.push(PerBatch {
                waits,
                command_buffers,
                signals,
            });
        }

        let batches = per_batch
            .iter()
            .map(|batch| SubmitBatch {
                wait_semaphores: &batch.waits,
                command_buffers: &batch.command_buffers,
                signal_semaphores: &batch.signals,
            })
            .collect::<SmallVec<[_; 4]>>();

        // SAFETY: Every command buffer is recorded and belongs to `queue`, and every semaphore
        // and fence is alive.
        if let Err(err) = unsafe { self.device.queue_submit(queue, &batches, fence) } {
            log::error!("submission to queue {:?} failed: {}", queue, err);

            // SAFETY: The submission failed, so the semaphore is not in use.
            unsafe { self.device.destroy_semaphore(semaphore) };

            if owns_fence {
                // SAFETY: Same as above.
                unsafe { self.device.destroy_fence(fence) };
            }

            return Err(err.into());
        }

        let key = self.sync_infos.insert(SubmissionSyncInfo {
            semaphore,
            signal_value: infos.len() as u64,
            fence,
            owns_fence,
            ref_count: submitted.len() as u32,
        });

        for cmd in submitted {
            match cmd.name() {
                Some(name) => {
                    if let Some(entry) = self.named.get_mut(name) {
                        entry.state = CommandBufferState::Submitted;
                        entry.sync_info = Some(key);
                    }
                }
                None => {
                    self.temps_in_flight.insert(
                        cmd.id(),
                        InFlightTemp {
                            cmd_buffer: cmd.clone(),
                            sync_info: key,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Submits a single batch. See [`submit_cmds`](Self::submit_cmds).
    pub fn submit_cmd(
        &mut self,
        info: &CommandSubmitInfo,
        fence: Option<vk::Fence>,
        tracker: Option<&ResourceTracker>,
    ) -> Result<(), SubmitError> {
        self.submit_cmds(std::slice::from_ref(info), fence, tracker)
    }

    /// Returns whether the named command buffer `name` has finished executing, without
    /// blocking. Buffers that are not submitted count as finished.
    pub fn is_cmd_finished(&self, name: &str) -> Result<bool, VulkanError> {
        let Some(sync_info) = self
            .named
            .get(name)
            .and_then(|entry| self.in_flight_sync_info(&entry.cmd_buffer))
        else {
            return Ok(true);
        };

        // SAFETY: The fence is alive as long as the sync info is.
        unsafe { self.device.fence_status(sync_info.fence) }
    }

    /// Waits for the named command buffer `name` to finish executing. See
    /// [`cmd_finished_handle`](Self::cmd_finished_handle).
    pub fn cmd_finished(
        &mut self,
        name: &str,
        tracker: Option<&mut ResourceTracker>,
    ) -> Result<(), VulkanError> {
        let Some(cmd) = self.named.get(name).map(|entry| entry.cmd_buffer.clone()) else {
            log::debug!("command buffer `{}` is not known to the manager", name);
            return Ok(());
        };

        self.cmd_finished_handle(&cmd, tracker)
    }

    /// Waits for `cmd` to finish executing. Named buffers go back to the [`Recorded`] state.
    ///
    /// Does nothing for a named buffer that is not submitted. The synchronization objects of the
    /// submission are destroyed once every command buffer in it is finished.
    ///
    /// If `tracker` is given, everything the tracker knows about `cmd` is forgotten. If `cmd`
    /// was in flight, the command buffers it depends on are finished as well.
    ///
    /// [`Recorded`]: CommandBufferState::Recorded
    pub fn cmd_finished_handle(
        &mut self,
        cmd: &Arc<CommandBuffer>,
        tracker: Option<&mut ResourceTracker>,
    ) -> Result<(), VulkanError> {
        let was_in_flight;

        if let Some(name) = cmd.name() {
            let Some(entry) = self
                .named
                .get_mut(name)
                .filter(|entry| entry.cmd_buffer == *cmd)
            else {
                log::debug!("command buffer `{}` is not known to the manager", name);
                return Ok(());
            };

            if entry.state != CommandBufferState::Submitted {
                log::debug!(
                    "command buffer `{}` is in the {:?} state, there is nothing to finish",
                    name,
                    entry.state,
                );
                return Ok(());
            }

            if let Some(key) = entry.sync_info {
                release_sync_info(&*self.device, &mut self.sync_infos, key)?;
            }

            entry.sync_info = None;
            entry.state = CommandBufferState::Recorded;
            was_in_flight = true;
        } else if let Some(in_flight) = self.temps_in_flight.get(&cmd.id()) {
            release_sync_info(&*self.device, &mut self.sync_infos, in_flight.sync_info)?;
            self.temps_in_flight.remove(&cmd.id());
            was_in_flight = true;
        } else {
            was_in_flight = false;
        }

        if let Some(tracker) = tracker {
            if was_in_flight {
                let dependencies = tracker
                    .get_cmd_buffer_deps(cmd)
                    .iter()
                    .map(|wait| wait.cmd_buffer.clone())
                    .collect::<SmallVec<[_; 4]>>();

                for dependency in &dependencies {
                    self.cmd_finished_handle(dependency, Some(&mut *tracker))?;
                }
            }

            tracker.clear_finished_cmd(cmd);
        }

        Ok(())
    }

    /// Finishes every submitted command buffer.
    pub fn finish_all_submitted(
        &mut self,
        mut tracker: Option<&mut ResourceTracker>,
    ) -> Result<(), VulkanError> {
        let submitted = self
            .named
            .values()
            .filter(|entry| entry.state == CommandBufferState::Submitted)
            .map(|entry| entry.cmd_buffer.clone())
            .chain(
                self.temps_in_flight
                    .values()
                    .map(|in_flight| in_flight.cmd_buffer.clone()),
            )
            .collect::<SmallVec<[_; 8]>>();

        for cmd in &submitted {
            self.cmd_finished_handle(cmd, tracker.as_deref_mut())?;
        }

        Ok(())
    }

    /// Returns `cmd` to its pool and forgets about it.
    ///
    /// The state of the buffer is not checked. If it is still in flight, a warning is logged and
    /// its submission is waited on first.
    ///
    /// # Safety
    ///
    /// - `cmd` must not be pending execution, unless it was submitted through this manager.
    /// - `cmd` must not be used afterwards, including through the resource tracker.
    pub unsafe fn free_cmd_buffer(&mut self, cmd: &Arc<CommandBuffer>) -> Result<(), VulkanError> {
        if let Some(name) = cmd.name() {
            if self
                .named
                .get(name)
                .is_some_and(|entry| entry.cmd_buffer == *cmd)
            {
                if let Some(entry) = self.named.remove(name) {
                    if entry.state == CommandBufferState::Submitted {
                        log::warn!("command buffer `{}` is freed while submitted", name);
                    }

                    if let Some(key) = entry.sync_info {
                        release_sync_info(&*self.device, &mut self.sync_infos, key)?;
                    }
                }
            }
        } else if let Some(in_flight) = self.temps_in_flight.remove(&cmd.id()) {
            log::warn!("temporary command buffer {} is freed while submitted", cmd.id());
            release_sync_info(&*self.device, &mut self.sync_infos, in_flight.sync_info)?;
        }

        // SAFETY: The caller must ensure that the command buffer is not in use.
        unsafe { self.device.free_command_buffer(cmd.pool(), cmd.handle()) };

        Ok(())
    }
}

/// Allocates a command buffer from the pool of `kind` for `usage` work, without beginning it.
fn allocate(
    device: &dyn RawDevice,
    pools: &CommandPools,
    name: Option<String>,
    usage: QueueFunction,
    kind: CommandPoolKind,
) -> Result<Arc<CommandBuffer>, VulkanError> {
    let pool = pools
        .get(usage, kind)
        .unwrap_or_else(|| panic!("the device has no queue for {:?} work", usage));

    // SAFETY: The pool belongs to `device`, and buffers are only allocated from it while the
    // manager is borrowed mutably.
    let handle = unsafe { device.allocate_command_buffer(pool.handle) }?;

    Ok(Arc::new(CommandBuffer::new(
        handle,
        pool.handle,
        name,
        usage,
        kind,
        pool.queue.queue,
        pool.queue.queue_family_index,
    )))
}

/// Waits for the submission if needed and drops one reference to its sync info, destroying the
/// synchronization objects with the last one.
fn release_sync_info(
    device: &dyn RawDevice,
    sync_infos: &mut SlotMap<SyncInfoKey, SubmissionSyncInfo>,
    key: SyncInfoKey,
) -> Result<(), VulkanError> {
    let Some(sync_info) = sync_infos.get_mut(key) else {
        return Ok(());
    };

    // SAFETY: The fence is alive as long as the sync info is.
    if !unsafe { device.fence_status(sync_info.fence) }? {
        // SAFETY: Same as above.
        unsafe { device.wait_for_fence(sync_info.fence) }?;
    }

    sync_info.ref_count -= 1;

    if sync_info.ref_count == 0 {
        if let Some(sync_info) = sync_infos.remove(key) {
            destroy_sync_info(device, sync_info);
        }
    }

    Ok(())
}

fn destroy_sync_info(device: &dyn RawDevice, sync_info: SubmissionSyncInfo) {
    // SAFETY: The submission has completed.
    unsafe { device.destroy_semaphore(sync_info.semaphore) };

    if sync_info.owns_fence {
        // SAFETY: Same as above.
        unsafe { device.destroy_fence(sync_info.fence) };
    }
}

struct PerBatch {
    waits: SmallVec<[vk::SemaphoreSubmitInfo<'static>; 8]>,
    command_buffers: SmallVec<[vk::CommandBufferSubmitInfo<'static>; 8]>,
    signals: SmallVec<[vk::SemaphoreSubmitInfo<'static>; 4]>,
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        for (_, sync_info) in self.sync_infos.drain() {
            // SAFETY: The fence is alive as long as the sync info is.
            if let Err(err) = unsafe { self.device.wait_for_fence(sync_info.fence) } {
                log::error!("failed to wait for a submission to finish: {}", err);
            }

            destroy_sync_info(&*self.device, sync_info);
        }

        self.temps_in_flight.clear();

        for (_, entry) in self.named.drain() {
            let cmd_buffer = entry.cmd_buffer;

            // SAFETY: Every submission has completed.
            unsafe {
                self.device
                    .free_command_buffer(cmd_buffer.pool(), cmd_buffer.handle())
            };
        }

        // SAFETY: Same as above. Temporary buffers are freed along with their pool.
        unsafe { self.pools.destroy(&*self.device) };
    }
}

impl fmt::Debug for CommandBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferManager")
            .field("pools", &self.pools)
            .field("named", &self.named)
            .field("temps_in_flight", &self.temps_in_flight)
            .field("sync_infos", &self.sync_infos)
            .finish_non_exhaustive()
    }
}
