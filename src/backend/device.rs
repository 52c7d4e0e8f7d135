// Vulkan Device - Consumer-side device context
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (same adapter as the producer, else prefer discrete)
// - Logical device + queue creation with the D3D11 interop extensions
// - Memory allocator setup for host-visible helper buffers

use super::guard::Scoped;
use crate::error::{InteropError, InteropResult};
use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::os::raw::c_char;
use std::sync::Arc;

/// Device extensions the import path cannot work without
fn interop_extensions() -> [&'static CStr; 5] {
    [
        vk::KhrExternalMemoryFn::name(),
        vk::KhrExternalMemoryWin32Fn::name(),
        vk::KhrWin32KeyedMutexFn::name(),
        vk::KhrDedicatedAllocationFn::name(),
        vk::KhrGetMemoryRequirements2Fn::name(),
    ]
}

/// How the consumer device should be created
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
    /// Enable surface + swapchain extensions
    pub presentation: bool,
    /// LUID of the producer's adapter; interop needs the very same GPU
    pub adapter_luid: Option<[u8; vk::LUID_SIZE]>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device in `Drop`
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_luid: Option<[u8; vk::LUID_SIZE]>,
    pub presentation: bool,
    external_memory_win32: vk::KhrExternalMemoryWin32Fn,
}

struct Candidate {
    device: vk::PhysicalDevice,
    graphics_family: u32,
    score: u32,
}

impl VulkanDevice {
    /// Create the consumer device, mapping every failure to `DeviceCreation`
    pub fn new(options: &DeviceOptions) -> InteropResult<Arc<Self>> {
        Self::create(options)
            .map(Arc::new)
            .map_err(InteropError::DeviceCreation)
    }

    fn create(options: &DeviceOptions) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", options.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, options)?;
        let instance_guard =
            Scoped::new(instance.handle(), |_| unsafe { instance.destroy_instance(None) });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if options.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };
        let messenger_guard = debug_utils.as_ref().map(|(utils, messenger)| {
            Scoped::new(*messenger, move |m| unsafe {
                utils.destroy_debug_utils_messenger(m, None)
            })
        });

        // Step 4: Pick physical device (GPU)
        let candidate = Self::pick_physical_device(&instance, options)?;
        let physical_device = candidate.device;
        let graphics_queue_family = candidate.graphics_family;

        // Step 5: Create logical device
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            options.presentation,
        )?;
        let device_guard =
            Scoped::new(device.handle(), |_| unsafe { device.destroy_device(None) });

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_luid = Self::query_luid(&instance, physical_device);

        log::info!(
            "Selected GPU: {} (score {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            candidate.score
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let external_memory_win32 = vk::KhrExternalMemoryWin32Fn::load(|name| unsafe {
            std::mem::transmute(instance.get_device_proc_addr(device.handle(), name.as_ptr()))
        });

        // Step 7: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        // Fully built; Drop takes over teardown from here
        device_guard.into_inner();
        let _ = messenger_guard.map(Scoped::into_inner);
        instance_guard.into_inner();

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            memory_properties,
            device_luid,
            presentation: options.presentation,
            external_memory_win32,
        })
    }

    fn create_instance(entry: &Entry, options: &DeviceOptions) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(options.app_name.as_str())?;
        let engine_name = CString::new("shared-texture")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const c_char> = vec![];
        if options.enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        // Platform-specific surface extensions
        #[cfg(target_os = "windows")]
        if options.presentation {
            extensions.push(ash::extensions::khr::Surface::name().as_ptr());
            extensions.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        }

        // Validation layers
        let layer_names = if options.enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn required_device_extensions(presentation: bool) -> Vec<&'static CStr> {
        let mut extensions = interop_extensions().to_vec();
        if presentation {
            extensions.push(ash::extensions::khr::Swapchain::name());
        }
        extensions
    }

    fn supports_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        required: &[&CStr],
    ) -> Result<Vec<String>> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let missing = required
            .iter()
            .filter(|name| {
                !available.iter().any(|ext| {
                    let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                    ext_name == **name
                })
            })
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        Ok(missing)
    }

    fn query_luid(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Option<[u8; vk::LUID_SIZE]> {
        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut id_props);
        unsafe { instance.get_physical_device_properties2(device, &mut props2) };
        (id_props.device_luid_valid == vk::TRUE).then_some(id_props.device_luid)
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        options: &DeviceOptions,
    ) -> Result<Candidate> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let required = Self::required_device_extensions(options.presentation);
        let mut best: Option<Candidate> = None;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            let missing = Self::supports_extensions(instance, device, &required)?;
            if !missing.is_empty() {
                log::info!("Skipping {}: missing {}", name, missing.join(", "));
                continue;
            }

            if let Some(wanted) = options.adapter_luid {
                if Self::query_luid(instance, device) != Some(wanted) {
                    log::info!("Skipping {}: not the producer's adapter", name);
                    continue;
                }
            }

            // Graphics queues always accept transfer work
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            let Some(graphics_family) = graphics_family else {
                log::info!("Skipping {}: no graphics queue family", name);
                continue;
            };

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    device,
                    graphics_family,
                    score,
                });
            }
        }

        best.ok_or_else(|| {
            anyhow::anyhow!(
                "No GPU offers a graphics queue with {}",
                required
                    .iter()
                    .map(|n| n.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        presentation: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions: Vec<*const c_char> = Self::required_device_extensions(presentation)
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Memory types a D3D11 texture handle may be imported into, if the
    /// driver answers the query for that handle type
    pub fn win32_handle_memory_bits(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        handle: vk::HANDLE,
    ) -> Option<u32> {
        let mut props = vk::MemoryWin32HandlePropertiesKHR::default();
        let result = unsafe {
            (self
                .external_memory_win32
                .get_memory_win32_handle_properties_khr)(
                self.device.handle(),
                handle_type,
                handle,
                &mut props,
            )
        };
        (result == vk::Result::SUCCESS && props.memory_type_bits != 0)
            .then_some(props.memory_type_bits)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // Allocator before device
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
