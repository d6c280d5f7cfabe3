//! Errors reported by the device layer.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    /// A native call failed. Exhausted descriptor pools surface here as
    /// `ERROR_OUT_OF_POOL_MEMORY` on every backend.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A write or copy touched bytes outside the resource.
    #[error("Range {offset}..{end} out of bounds for {what} of size {size}")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        end: u64,
        size: u64,
    },

    /// A handle that this device never created, or already destroyed.
    #[error("Unknown resource: {0}")]
    ResourceNotFound(String),

    /// The call is not valid for the object's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, GpuError>;
