// One-shot command submission
//
// Used for setup work that runs exactly once per resource (the layout
// transition of an imported image). Pool, command buffer and fence all live
// only for the duration of the call.

use super::guard::Scoped;
use super::keyed_mutex::{classify_submit, KeyedMutexSubmit};
use super::VulkanDevice;
use crate::interop::AcquireStatus;
use anyhow::{Context, Result};
use ash::vk;

/// Upper bound for one setup submission
const ONE_SHOT_TIMEOUT_NS: u64 = 1_000_000_000;

/// Record with `record`, submit to the graphics queue and wait for completion
pub fn submit_one_shot<F>(device: &VulkanDevice, record: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    run_one_shot(device, None, record).map(|_| ())
}

/// Like `submit_one_shot`, holding the keyed mutex for the submission.
///
/// Returns `false` when the acquire timed out and nothing ran.
pub fn submit_one_shot_keyed<F>(
    device: &VulkanDevice,
    keyed_mutex: &KeyedMutexSubmit,
    record: F,
) -> Result<bool>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    run_one_shot(device, Some(keyed_mutex), record)
}

fn run_one_shot<F>(
    device: &VulkanDevice,
    keyed_mutex: Option<&KeyedMutexSubmit>,
    record: F,
) -> Result<bool>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let vk_device = &device.device;

    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { vk_device.create_command_pool(&pool_info, None) }
        .context("Failed to create one-shot command pool")?;
    // Destroying the pool frees its command buffers as well
    let pool = Scoped::new(pool, |pool| unsafe {
        vk_device.destroy_command_pool(pool, None)
    });

    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool.get())
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = unsafe { vk_device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate one-shot command buffer")?
        .first()
        .copied()
        .context("No command buffer returned from allocation")?;

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin one-shot command buffer")?;

        record(vk_device, cmd);

        vk_device
            .end_command_buffer(cmd)
            .context("Failed to end one-shot command buffer")?;
    }

    let fence = unsafe { vk_device.create_fence(&vk::FenceCreateInfo::builder(), None) }
        .context("Failed to create one-shot fence")?;
    let fence = Scoped::new(fence, |fence| unsafe { vk_device.destroy_fence(fence, None) });

    let command_buffers = [cmd];
    let mut keyed_info = keyed_mutex.map(KeyedMutexSubmit::info);
    let mut submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
    if let Some(info) = keyed_info.as_mut() {
        submit_info = submit_info.push_next(info);
    }

    unsafe {
        let submitted =
            vk_device.queue_submit(device.graphics_queue, &[submit_info.build()], fence.get());
        if keyed_mutex.is_some() {
            // Mutex failures stay SyncFatal inside the anyhow chain
            if classify_submit(submitted)? == AcquireStatus::TimedOut {
                return Ok(false);
            }
        } else {
            submitted.context("Failed to submit one-shot command buffer")?;
        }

        if let Err(e) = vk_device.wait_for_fences(&[fence.get()], true, ONE_SHOT_TIMEOUT_NS) {
            // The guards must not free the pool while the GPU still uses it
            let _ = vk_device.device_wait_idle();
            return Err(e).context("Timed out waiting for one-shot submission");
        }
    }

    Ok(true)
}
