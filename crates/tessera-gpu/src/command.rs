//! Transient command recording for the Vulkan backend.

use ash::vk;

use crate::error::{GpuError, Result};

/// A transient command pool bound to one queue.
///
/// Command buffers are begun, recorded by the caller, submitted once, and
/// recycled in bulk by [`CommandRecording::wait_and_recycle`].
pub struct CommandRecording {
    pool: vk::CommandPool,
    queue: vk::Queue,
}

impl CommandRecording {
    /// # Safety
    /// `queue` must belong to `queue_family` on `device`.
    pub unsafe fn new(device: &ash::Device, queue_family: u32, queue: vk::Queue) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&info, None)? };
        Ok(Self { pool, queue })
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Allocate a primary command buffer and begin recording it.
    ///
    /// Only allocation happens here. Recording into the buffer does not touch
    /// the pool, so callers may release their lock while they record.
    ///
    /// # Safety
    /// `device` must be the device the recording was created on.
    pub unsafe fn begin(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("command pool returned no buffer".into()))?;

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin)? };
        Ok(cmd)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn push(&self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe {
            device.end_command_buffer(cmd)?;
            device.queue_submit(self.queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    /// End and submit `cmd`, then block until the queue is idle and free it.
    ///
    /// # Safety
    /// `cmd` must come from [`Self::begin`] on the same device.
    pub unsafe fn submit_blocking(&self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.push(device, cmd)?;
            device.queue_wait_idle(self.queue)?;
            device.free_command_buffers(self.pool, &[cmd]);
        }
        Ok(())
    }

    /// End and submit `cmd` without waiting.
    ///
    /// The buffer stays allocated until the next [`Self::wait_and_recycle`].
    ///
    /// # Safety
    /// `cmd` must come from [`Self::begin`] on the same device.
    pub unsafe fn submit_queued(&self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.push(device, cmd) }
    }

    /// Wait for the queue and recycle every command buffer of the pool.
    ///
    /// # Safety
    /// `device` must be the device the recording was created on.
    pub unsafe fn wait_and_recycle(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.queue_wait_idle(self.queue)?;
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    /// # Safety
    /// No command buffer of the pool may still be executing.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}
