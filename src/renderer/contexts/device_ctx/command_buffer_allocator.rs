use std::sync::Arc;

use ash::vk;

use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::RenderHal;

/// Command buffers for one worker and one queue role within one frame.
///
/// Buffers are never reset one by one. The whole pool is reset when its frame
/// comes around again, after that frame's work has finished.
pub struct CommandPool {
    raw: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_free: usize,
    hal: Arc<dyn RenderHal>,
}

impl CommandPool {
    pub fn new(hal: Arc<dyn RenderHal>, queue_family_index: u32) -> Result<Self, RenderError> {
        let raw = hal
            .create_command_pool(queue_family_index)
            .hal_context("vkCreateCommandPool")?;

        Ok(Self {
            raw,
            buffers: Vec::new(),
            next_free: 0,
            hal,
        })
    }

    /// Hands out the next unused buffer in the recording state.
    pub fn request(&mut self) -> Result<vk::CommandBuffer, RenderError> {
        if self.next_free == self.buffers.len() {
            let allocated = self
                .hal
                .allocate_command_buffers(self.raw, 1)
                .hal_context("vkAllocateCommandBuffers")?;
            self.buffers.extend(allocated);
        }

        let command_buffer = *self
            .buffers
            .get(self.next_free)
            .ok_or(RenderError::Hardware {
                operation: "vkAllocateCommandBuffers",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })?;
        self.hal
            .begin_command_buffer(command_buffer)
            .hal_context("vkBeginCommandBuffer")?;
        self.next_free += 1;
        Ok(command_buffer)
    }

    /// Resets every buffer at once. The caller guarantees none of them is still executing.
    pub fn reset(&mut self) -> Result<(), RenderError> {
        if self.next_free == 0 {
            return Ok(());
        }
        self.hal
            .reset_command_pool(self.raw)
            .hal_context("vkResetCommandPool")?;
        self.next_free = 0;
        Ok(())
    }

    /// Buffers handed out since the last reset.
    pub fn used(&self) -> usize {
        self.next_free
    }

    pub fn allocated(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.hal.destroy_command_pool(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::hal::headless::HeadlessDevice;

    #[test]
    fn buffers_are_reused_after_reset() {
        let device = Arc::new(HeadlessDevice::default());
        let mut pool = CommandPool::new(device.clone(), 0).unwrap();

        let first = pool.request().unwrap();
        let second = pool.request().unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.used(), 2);

        pool.reset().unwrap();
        assert_eq!(pool.request().unwrap(), first);
        assert_eq!(pool.allocated(), 2);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn idle_pools_skip_the_reset() {
        let device = Arc::new(HeadlessDevice::default());
        let mut pool = CommandPool::new(device.clone(), 0).unwrap();
        pool.reset().unwrap();
        assert!(!device
            .journal()
            .iter()
            .any(|event| matches!(event, crate::renderer::hal::headless::HalEvent::ResetCommandPool(_))));

        drop(pool);
        assert_eq!(device.live_command_pools(), 0);
    }
}
