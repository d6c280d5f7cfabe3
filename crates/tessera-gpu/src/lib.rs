//! Device layer for the Tessera frame scheduler.
//!
//! This crate provides:
//! - The `GpuDevice` / `CommandRecorder` interfaces the scheduler records through
//! - Reference-counted buffer and texture handles with deferred destruction
//! - A Vulkan backend using ash and gpu-allocator
//! - A headless backend that simulates the device on the CPU

pub mod barrier;
pub mod command;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod headless;
pub mod memory;
pub mod resource;
pub mod vulkan;

pub use barrier::{ImageBarrier, PipelineBarrier};
pub use deferred::{DeferredDeletionQueue, RetiredResource};
pub use descriptors::{DescriptorBinding, DescriptorSetInfo, DescriptorSetLayoutBuilder};
pub use device::{CommandRecorder, GpuDevice, RecordFn};
pub use error::{GpuError, Result};
pub use headless::{
    HeadlessDevice, HeadlessStats, RecordedBarrier, RecordedCommand, RecordedImageBarrier,
    Submission, SubmissionKind, SUBMISSION_LOG_LEN,
};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use resource::{aspect_for_format, Buffer, BufferDesc, Texture, TextureDesc};
pub use vulkan::{VulkanDevice, VulkanRecorder};

pub use gpu_allocator::MemoryLocation;
