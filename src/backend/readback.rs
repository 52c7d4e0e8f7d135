// Readback of imported texels
//
// Copies a single texel of an imported image into a host-visible buffer
// (gpu-allocator, GpuToCpu) under the keyed mutex, to check that the
// consumer sees what the producer wrote.

use super::commands::submit_one_shot_keyed;
use super::import::ImportedImage;
use super::VulkanDevice;
use crate::interop::KeyPair;
use crate::texture::{ImageLayout, TextureDesc};
use anyhow::{bail, Context, Result};
use ash::vk;
use glam::Vec4;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

const TEXEL_BYTES: vk::DeviceSize = 4;

/// Readback copies one texel out of an image already in `TransferSrc`
fn check_texel_request(desc: &TextureDesc, layout: ImageLayout, x: u32, y: u32) -> Result<()> {
    if x >= desc.width || y >= desc.height {
        bail!(
            "texel ({}, {}) outside {}x{} image",
            x,
            y,
            desc.width,
            desc.height
        );
    }
    if layout != ImageLayout::TransferSrc {
        bail!("readback needs TransferSrc, image is in {:?}", layout);
    }
    Ok(())
}

pub struct TexelReadback {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl TexelReadback {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(TEXEL_BYTES)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create readback buffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "texel readback",
            requirements,
            location: MemoryLocation::GpuToCpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate readback memory");
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = device.allocator().lock().free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to bind readback memory");
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            device,
        })
    }

    /// Color of the texel at (x, y), or `None` when the keyed-mutex acquire
    /// timed out.
    ///
    /// `image` must already be in `TransferSrc`. A failing keyed mutex
    /// surfaces as `InteropError::SyncFatal` within the returned error.
    pub fn read_texel(
        &self,
        image: &ImportedImage,
        x: u32,
        y: u32,
        keys: KeyPair,
        timeout_ms: u32,
    ) -> Result<Option<Vec4>> {
        let desc = image.desc();
        check_texel_request(&desc, image.layout().current(), x, y)?;

        let keyed_mutex = image.keyed_mutex(keys, timeout_ms);
        let buffer = self.buffer;
        let source = image.image;

        let executed = submit_one_shot_keyed(&self.device, &keyed_mutex, |device, cmd| {
            let region = vk::BufferImageCopy::builder()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D {
                    x: x as i32,
                    y: y as i32,
                    z: 0,
                })
                .image_extent(vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                })
                .build();

            let to_host = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(TEXEL_BYTES)
                .build();

            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    source,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    buffer,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[to_host],
                    &[],
                );
            }
        })
        .context("Texel readback copy failed")?;

        if !executed {
            log::trace!("Readback skipped: keyed mutex acquire timed out");
            return Ok(None);
        }

        let bytes = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .and_then(|slice| slice.get(..TEXEL_BYTES as usize))
            .context("Readback memory is not host mapped")?;
        let texel = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Some(desc.format.unpack(texel)))
    }

    pub fn read_center(
        &self,
        image: &ImportedImage,
        keys: KeyPair,
        timeout_ms: u32,
    ) -> Result<Option<Vec4>> {
        let desc = image.desc();
        self.read_texel(image, desc.width / 2, desc.height / 2, keys, timeout_ms)
    }
}

impl Drop for TexelReadback {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free readback memory: {}", e);
            }
        }
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureFormat;

    #[test]
    fn texel_request_must_be_inside_a_transfer_source() {
        let desc = TextureDesc::new(4, 2, TextureFormat::Rgba8Unorm);
        assert!(check_texel_request(&desc, ImageLayout::TransferSrc, 3, 1).is_ok());

        let err = check_texel_request(&desc, ImageLayout::TransferSrc, 4, 0).unwrap_err();
        assert!(err.to_string().contains("outside 4x2"));
        assert!(err.downcast_ref::<crate::error::InteropError>().is_none());

        let err = check_texel_request(&desc, ImageLayout::ShaderReadOnly, 0, 0).unwrap_err();
        assert!(err.to_string().contains("needs TransferSrc"));
    }
}
