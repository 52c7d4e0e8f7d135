// Blit presenter - shows the imported image in a window
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence, acquire a swapchain image
// 2. Submit the pre-recorded blit (imported image -> swapchain image) with
//    the keyed mutex acquire/release chained into the submission
// 3. Acquire timed out: submit the pre-recorded fallback clear instead, so
//    the semaphores and the fence of the slot are still consumed
// 4. Present, advance the slot
//
// The imported image stays in TRANSFER_SRC_OPTIMAL for its whole lifetime;
// only swapchain images get per-frame barriers.

use super::import::{ImportedImage, COLOR_RANGE};
use super::keyed_mutex::classify_submit;
use super::swapchain::Swapchain;
use super::sync::FramesInFlight;
use super::VulkanDevice;
use crate::frame::FrameStats;
use crate::interop::{AcquireStatus, PresentationPipeline, SyncProtocol};
use crate::texture::ImageLayout;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Layout the imported image is kept in while presenting
pub const REQUIRED_LAYOUT: ImageLayout = ImageLayout::TransferSrc;

#[derive(Debug, Clone, Copy)]
pub struct PresenterOptions {
    pub present_mode: vk::PresentModeKHR,
    /// Shown for frames whose acquire timed out
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    /// 0 = run until the window closes
    pub max_frames: u64,
}

pub struct BlitPresenter {
    // Swapchain-dependent, rebuilt on resize
    swapchain: Option<Swapchain>,
    blit_buffers: Vec<vk::CommandBuffer>,
    fallback_buffers: Vec<vk::CommandBuffer>,
    command_pool: vk::CommandPool,

    frames: FramesInFlight,
    image: ImportedImage,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,

    protocol: SyncProtocol,
    options: PresenterOptions,
    stats: FrameStats,
    wait_stages: [vk::PipelineStageFlags; 1],

    size: (u32, u32),
    needs_resize: bool,
    is_minimized: bool,
    rendered: u64,

    device: Arc<VulkanDevice>,
}

impl BlitPresenter {
    /// Takes ownership of `surface`; it is destroyed with the presenter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<VulkanDevice>,
        mut image: ImportedImage,
        surface: vk::SurfaceKHR,
        surface_loader: ash::extensions::khr::Surface,
        protocol: SyncProtocol,
        options: PresenterOptions,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        image.prepare(REQUIRED_LAYOUT)?;

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .context("Failed to query surface support")?;
        if !supported {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create presenter command pool")?;

        let frames = match FramesInFlight::new(device.clone(), options.frames_in_flight) {
            Ok(frames) => frames,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        let mut presenter = Self {
            swapchain: None,
            blit_buffers: Vec::new(),
            fallback_buffers: Vec::new(),
            command_pool,
            frames,
            image,
            surface,
            surface_loader,
            protocol,
            options,
            stats: FrameStats::default(),
            wait_stages: [vk::PipelineStageFlags::TRANSFER],
            size: (width, height),
            needs_resize: false,
            is_minimized: width == 0 || height == 0,
            rendered: 0,
            device,
        };
        if !presenter.is_minimized {
            presenter.create_swapchain_resources()?;
        }
        Ok(presenter)
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn image(&self) -> &ImportedImage {
        &self.image
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        if width == 0 || height == 0 {
            self.is_minimized = true;
        } else {
            self.is_minimized = false;
            self.needs_resize = true;
        }
    }

    fn create_swapchain_resources(&mut self) -> Result<()> {
        let device = self.device.clone();
        device.wait_idle()?;

        self.free_command_buffers();
        // The surface can only have one swapchain at a time
        self.swapchain = None;

        let (width, height) = self.size;
        let swapchain = Swapchain::new(
            device.clone(),
            self.surface,
            &self.surface_loader,
            width,
            height,
            self.options.present_mode,
        )?;

        let count = swapchain.images.len() as u32;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let blit_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate blit command buffers")?;
        let fallback = unsafe { device.device.allocate_command_buffers(&alloc_info) };
        let fallback_buffers = match fallback {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.free_command_buffers(self.command_pool, &blit_buffers) };
                return Err(e).context("Failed to allocate fallback command buffers");
            }
        };
        self.blit_buffers = blit_buffers;
        self.fallback_buffers = fallback_buffers;

        self.record_command_buffers(&swapchain)?;
        log::info!(
            "Recorded blit + fallback command buffers for {} swapchain images ({} frames in flight)",
            count,
            self.frames.len()
        );

        self.swapchain = Some(swapchain);
        self.needs_resize = false;
        Ok(())
    }

    fn free_command_buffers(&mut self) {
        unsafe {
            if !self.blit_buffers.is_empty() {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.blit_buffers);
            }
            if !self.fallback_buffers.is_empty() {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.fallback_buffers);
            }
        }
        self.blit_buffers.clear();
        self.fallback_buffers.clear();
    }

    fn record_command_buffers(&self, swapchain: &Swapchain) -> Result<()> {
        let device = &self.device.device;
        let desc = self.image.desc();
        let src_corner = vk::Offset3D {
            x: desc.width as i32,
            y: desc.height as i32,
            z: 1,
        };
        let dst_corner = vk::Offset3D {
            x: swapchain.extent.width as i32,
            y: swapchain.extent.height as i32,
            z: 1,
        };
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let blit = vk::ImageBlit::builder()
            .src_subresource(layers)
            .src_offsets([vk::Offset3D::default(), src_corner])
            .dst_subresource(layers)
            .dst_offsets([vk::Offset3D::default(), dst_corner])
            .build();
        let clear_color = vk::ClearColorValue {
            float32: self.options.clear_color,
        };

        for (i, &target) in swapchain.images.iter().enumerate() {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target)
                .subresource_range(COLOR_RANGE)
                .build();
            let to_present = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target)
                .subresource_range(COLOR_RANGE)
                .build();

            let begin_info = vk::CommandBufferBeginInfo::builder();
            unsafe {
                // Blit: the only commands that touch the shared memory
                let cmd = self.blit_buffers[i];
                device.begin_command_buffer(cmd, &begin_info)?;
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                device.cmd_blit_image(
                    cmd,
                    self.image.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    target,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_present],
                );
                device.end_command_buffer(cmd)?;

                // Fallback: never reads the imported image
                let cmd = self.fallback_buffers[i];
                device.begin_command_buffer(cmd, &begin_info)?;
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                device.cmd_clear_color_image(
                    cmd,
                    target,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear_color,
                    &[COLOR_RANGE],
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_present],
                );
                device.end_command_buffer(cmd)?;
            }
        }
        Ok(())
    }

    /// Submit `cmd` for the current slot, optionally holding the keyed mutex
    fn submit(&self, cmd: vk::CommandBuffer, keyed: bool) -> std::result::Result<(), vk::Result> {
        let sync = self.frames.current();
        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let keyed_mutex = self
            .image
            .keyed_mutex(self.protocol.consumer, self.protocol.timeout_ms());
        let mut keyed_info = keyed_mutex.info();

        let mut submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        if keyed {
            submit_info = submit_info.push_next(&mut keyed_info);
        }

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )
        }
    }

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        if self.needs_resize || self.swapchain.is_none() {
            self.create_swapchain_resources()?;
        }
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;

        self.frames.wait_current()?;
        let image_available = self.frames.current().image_available;
        let acquired = swapchain.acquire_next_image(u64::MAX, image_available)?;
        let Some((image_index, suboptimal)) = acquired else {
            self.needs_resize = true;
            return Ok(false);
        };
        if suboptimal {
            self.needs_resize = true;
        }
        self.frames.reset_current()?;

        let index = image_index as usize;
        self.stats.frames += 1;
        if self.protocol.is_synchronized() {
            match classify_submit(self.submit(self.blit_buffers[index], true))? {
                AcquireStatus::Acquired => {
                    // Release travels with the same submission
                    self.stats.acquired += 1;
                    self.stats.released += 1;
                }
                AcquireStatus::TimedOut => {
                    self.stats.timed_out += 1;
                    log::debug!(
                        "consumer acquire (key {}) timed out, presenting fallback",
                        self.protocol.consumer.acquire
                    );
                    self.submit(self.fallback_buffers[index], false)
                        .context("Failed to submit fallback frame")?;
                }
            }
        } else {
            self.submit(self.blit_buffers[index], false)
                .context("Failed to submit blit")?;
        }

        let render_finished = self.frames.current().render_finished;
        match swapchain.present(self.device.graphics_queue, image_index, &[render_finished]) {
            Ok(true) => self.needs_resize = true,
            Ok(false) => {}
            Err(e) => {
                log::warn!("Present failed: {:#}", e);
                self.needs_resize = true;
            }
        }

        self.frames.advance();
        self.rendered += 1;
        Ok(true)
    }
}

impl PresentationPipeline for BlitPresenter {
    fn render(&mut self) -> Result<bool> {
        self.render_frame()?;
        Ok(self.options.max_frames == 0 || self.rendered < self.options.max_frames)
    }
}

impl Drop for BlitPresenter {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.free_command_buffers();
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
        // Swapchain before its surface
        self.swapchain = None;
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        log::debug!("Blit presenter destroyed after {} frames", self.rendered);
    }
}
