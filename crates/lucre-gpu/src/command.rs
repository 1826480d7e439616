//! Command buffer management.

use crate::device::GpuDevice;
use crate::error::Result;
use ash::vk;

/// Command pool for allocating command buffers.
///
/// Pools are externally synchronized; allocation and reset go through the device lock.
#[derive(Debug)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a transient pool whose buffers are reset together with the pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The pool must belong to `gpu`.
    pub unsafe fn allocate(
        &self,
        gpu: &GpuDevice,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let _guard = gpu.lock();
        let buffers = gpu.device().allocate_command_buffers(&alloc_info)?;
        Ok(buffers[0])
    }

    /// Return a command buffer to the pool.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn free(&self, gpu: &GpuDevice, cmd: vk::CommandBuffer) {
        let _guard = gpu.lock();
        gpu.device().free_command_buffers(self.pool, &[cmd]);
    }

    /// Reset the command pool.
    ///
    /// # Safety
    /// All command buffers from this pool must not be in use.
    pub unsafe fn reset(&self, gpu: &GpuDevice) -> Result<()> {
        let _guard = gpu.lock();
        gpu.device()
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Record, submit, and wait for a one-shot command buffer.
///
/// # Safety
/// The pool must belong to the calling thread and to `gpu`.
pub unsafe fn execute_single_time_commands<F>(gpu: &GpuDevice, pool: &CommandPool, f: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let device = gpu.device();
    let cmd = pool.allocate(gpu, vk::CommandBufferLevel::PRIMARY)?;

    begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    f(cmd);
    end_command_buffer(device, cmd)?;

    let fence = crate::sync::create_fence(device, false)?;
    let cmd_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
    let submitted = gpu.submit(&[submit_info], fence);
    if submitted.is_ok() {
        crate::sync::wait_for_fence(device, fence, u64::MAX)?;
    }
    device.destroy_fence(fence, None);
    pool.free(gpu, cmd);

    submitted
}
