// Handle importer - D3D11 texture -> Vulkan image
//
// IMPORT SEQUENCE:
// 1. Check the format can be imported from a D3D11 texture handle
// 2. Declare a local image with the agreed extent/format + external memory info
// 3. Query requirements, pick a device-local memory type the handle accepts
// 4. Allocate by importing the handle (dedicated allocation), bind at offset 0
//
// Every intermediate handle sits in a Scoped guard until the whole sequence
// has succeeded, so a failure at any step leaves nothing behind.

use super::commands::submit_one_shot;
use super::guard::Scoped;
use super::keyed_mutex::KeyedMutexSubmit;
use super::memory::find_import_memory_type;
use super::VulkanDevice;
use crate::error::{InteropError, InteropResult};
use crate::frame::LayoutState;
use crate::interop::{check_descriptor, KeyPair, RawSharedHandle, SharedHandle, SharedImageImporter};
use crate::texture::{ImageLayout, TextureDesc};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

const HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE;

/// Sampled by shaders, copied from by blits and readbacks
const IMPORT_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::SAMPLED.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
);

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Consumer-side image bound to the producer's memory
pub struct ImportedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    desc: TextureDesc,
    memory_type_index: u32,
    layout: LayoutState,
    device: Arc<VulkanDevice>,
}

impl ImportedImage {
    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn layout(&self) -> LayoutState {
        self.layout
    }

    /// Keyed-mutex parameters to chain into a submission touching this image
    pub fn keyed_mutex(&self, keys: KeyPair, timeout_ms: u32) -> KeyedMutexSubmit {
        KeyedMutexSubmit::new(self.memory, keys, timeout_ms)
    }

    /// One-time transition from `Undefined` to `target`.
    ///
    /// The first barrier also acquires queue-family ownership from
    /// `QUEUE_FAMILY_EXTERNAL`. Returns `false` when already in `target`.
    pub fn prepare(&mut self, target: ImageLayout) -> InteropResult<bool> {
        let Some((old, new)) = self.layout.plan(target) else {
            return Ok(false);
        };

        let (src_family, dst_family) = if old == ImageLayout::Undefined {
            (vk::QUEUE_FAMILY_EXTERNAL, self.device.graphics_queue_family)
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        };
        let (src_access, src_stage) = old.first_use();
        let (dst_access, dst_stage) = new.first_use();
        let image = self.image;

        submit_one_shot(&self.device, |device, cmd| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .old_layout(old.to_vk())
                .new_layout(new.to_vk())
                .src_queue_family_index(src_family)
                .dst_queue_family_index(dst_family)
                .image(image)
                .subresource_range(COLOR_RANGE)
                .build();

            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        })
        .with_context(|| format!("Layout transition {:?} -> {:?} of imported image", old, new))
        .map_err(InteropError::Import)?;

        log::info!("Imported image transitioned {:?} -> {:?}", old, new);
        self.layout.commit(new);
        Ok(true)
    }
}

impl Drop for ImportedImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Vulkan implementation of the importing contract
pub struct VulkanImporter {
    device: Arc<VulkanDevice>,
}

impl VulkanImporter {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self { device }
    }

    /// Whether a D3D11 texture of `format` can be imported, and if it needs
    /// a dedicated allocation
    fn check_import_support(&self, format: vk::Format) -> Result<bool> {
        let mut external_info =
            vk::PhysicalDeviceExternalImageFormatInfo::builder().handle_type(HANDLE_TYPE);
        let format_info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(IMPORT_USAGE)
            .push_next(&mut external_info);

        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut props = vk::ImageFormatProperties2::builder().push_next(&mut external_props);

        unsafe {
            self.device
                .instance
                .get_physical_device_image_format_properties2(
                    self.device.physical_device,
                    &format_info,
                    &mut props,
                )
        }
        .with_context(|| format!("{:?} cannot be imported from a D3D11 texture", format))?;

        let features = external_props
            .external_memory_properties
            .external_memory_features;
        if !features.contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE) {
            anyhow::bail!("D3D11 texture handles are not importable as {:?}", format);
        }
        Ok(features.contains(vk::ExternalMemoryFeatureFlags::DEDICATED_ONLY))
    }

    fn import(&self, handle: vk::HANDLE, desc: TextureDesc) -> Result<ImportedImage> {
        let device = &self.device.device;
        let format = desc.format.to_vk();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Capability check
        // ─────────────────────────────────────────────────────────────────────
        let dedicated_only = self.check_import_support(format)?;
        log::debug!(
            "D3D11 texture import of {:?} supported (dedicated only: {})",
            format,
            dedicated_only
        );

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Local image declaring the external handle type
        // ─────────────────────────────────────────────────────────────────────
        let mut external_memory_info =
            vk::ExternalMemoryImageCreateInfo::builder().handle_types(HANDLE_TYPE);
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(desc.extent())
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(IMPORT_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_memory_info);

        let image = unsafe { device.create_image(&image_info, None) }
            .context("Failed to create image for import")?;
        let image = Scoped::new(image, |image| unsafe { device.destroy_image(image, None) });

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Requirements + memory type
        // ─────────────────────────────────────────────────────────────────────
        let requirements = unsafe { device.get_image_memory_requirements(image.get()) };
        let import_bits = self.device.win32_handle_memory_bits(HANDLE_TYPE, handle);
        let memory_type_index = find_import_memory_type(
            &self.device.memory_properties,
            requirements.memory_type_bits,
            import_bits,
        )
        .with_context(|| {
            format!(
                "No device-local memory type accepts the import (image bits {:#b}, handle bits {:?})",
                requirements.memory_type_bits, import_bits
            )
        })?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Allocate by importing the handle, bind at offset 0
        // ─────────────────────────────────────────────────────────────────────
        let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::builder()
            .handle_type(HANDLE_TYPE)
            .handle(handle);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image.get());
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info)
            .push_next(&mut dedicated_info);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .context("vkAllocateMemory failed importing the D3D11 texture handle")?;
        let memory = Scoped::new(memory, |memory| unsafe { device.free_memory(memory, None) });

        unsafe { device.bind_image_memory(image.get(), memory.get(), 0) }
            .context("Failed to bind imported memory")?;

        log::info!(
            "Imported D3D11 texture {}x{} {:?} (memory type {}, {} bytes)",
            desc.width,
            desc.height,
            format,
            memory_type_index,
            requirements.size
        );

        Ok(ImportedImage {
            image: image.into_inner(),
            memory: memory.into_inner(),
            desc,
            memory_type_index,
            layout: LayoutState::new(),
            device: self.device.clone(),
        })
    }
}

impl SharedImageImporter for VulkanImporter {
    type Image = ImportedImage;

    fn import_shared_image(
        &self,
        handle: &SharedHandle,
        desc: TextureDesc,
    ) -> InteropResult<ImportedImage> {
        check_descriptor(handle, &desc)?;
        let raw = match handle.raw() {
            RawSharedHandle::NtHandle(raw) => raw as vk::HANDLE,
            RawSharedHandle::Simulated { .. } => {
                return Err(InteropError::import(format!(
                    "cannot import a {} handle into Vulkan",
                    handle.kind()
                )))
            }
        };
        self.import(raw, desc).map_err(InteropError::Import)
    }
}
