//! GPU resource lifetime and synchronization core for Vulkan renderers.
//!
//! The crate is made of three cooperating parts:
//!
//! - The [`memory`] module sub-allocates large device memory allocations into fixed-size blocks.
//! - The [`sync`] module tracks which command buffers last read and wrote each resource, and
//!   decides whether an access needs a barrier, a queue ownership transfer or a wait.
//! - The [`command_buffer`] module owns command pools and the lifecycle of command buffers, and
//!   turns the tracker's wait lists into semaphore waits at submission time.
//!
//! Every device call goes through the [`RawDevice`] trait. [`AshDevice`] implements it on top of
//! `ash`. A [`RenderContext`] bundles one of each part for a single device.
//!
//! None of the types in this crate lock internally. Mutating operations take `&mut self`, so
//! sharing them across threads requires external synchronization.
//!
//! [`RawDevice`]: device::RawDevice
//! [`AshDevice`]: device::AshDevice

use ash::vk;
use std::{error::Error, fmt};

pub use ash;
pub use context::RenderContext;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

pub mod command_buffer;
mod context;
pub mod device;
mod macros;
pub mod memory;
pub mod sync;

/// Error that can be returned by a Vulkan entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VulkanError {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    TooManyObjects,
    FragmentedPool,
    OutOfPoolMemory,
    Unknown,
    /// The error is not one of the above. The raw result value is carried along.
    Unnamed(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(val: vk::Result) -> Self {
        match val {
            vk::Result::NOT_READY => Self::NotReady,
            vk::Result::TIMEOUT => Self::Timeout,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::FragmentedPool,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_UNKNOWN => Self::Unknown,
            result => Self::Unnamed(result),
        }
    }
}

impl Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::NotReady => write!(f, "A fence or query has not yet completed."),
            VulkanError::Timeout => {
                write!(f, "A wait operation has not completed in the specified time.")
            }
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            VulkanError::DeviceLost => write!(f, "The logical or physical device has been lost."),
            VulkanError::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            VulkanError::TooManyObjects => write!(
                f,
                "Too many objects of the type have already been created.",
            ),
            VulkanError::FragmentedPool => write!(
                f,
                "A pool allocation has failed due to fragmentation of the pool's memory.",
            ),
            VulkanError::OutOfPoolMemory => write!(f, "A pool memory allocation has failed."),
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred.",
            ),
            VulkanError::Unnamed(result) => {
                write!(f, "Unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
