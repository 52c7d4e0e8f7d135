// Per-frame GPU synchronization for the presenting consumer
//
// Semaphores order acquire -> blit -> present on the GPU; the fence tells
// the CPU when a frame slot may be reused. These are unrelated to the keyed
// mutex, which orders the two devices.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Synchronization objects of one frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First wait returns immediately

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };
            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Ring of `FrameSync` slots
pub struct FramesInFlight {
    frames: Vec<FrameSync>,
    current: usize,
    device: Arc<VulkanDevice>,
}

impl FramesInFlight {
    pub fn new(device: Arc<VulkanDevice>, count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            match FrameSync::new(&device.device) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in &frames {
                        frame.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("Created {} frame sync slots", count);
        Ok(Self {
            frames,
            current: 0,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    /// Block until the current slot's previous submission has finished
    pub fn wait_current(&self) -> Result<()> {
        let fence = self.current().in_flight_fence;
        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("Failed waiting for in-flight fence")
        }
    }

    pub fn reset_current(&self) -> Result<()> {
        let fence = self.current().in_flight_fence;
        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .context("Failed to reset in-flight fence")
        }
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }
}

impl Drop for FramesInFlight {
    fn drop(&mut self) {
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
    }
}
