// Backend module - Vulkan consumer of the shared texture
//
// Design: Thin wrapper around ash. The device context is created with the
// external-memory and keyed-mutex extensions; everything else (import,
// one-shot commands, presentation) borrows it through an Arc.

pub mod commands;
pub mod device;
pub mod guard;
pub mod import;
pub mod keyed_mutex;
pub mod memory;
pub mod present;
pub mod readback;
pub mod swapchain;
pub mod sync;

pub use device::{DeviceOptions, VulkanDevice};
pub use import::{ImportedImage, VulkanImporter};
pub use keyed_mutex::KeyedMutexSubmit;
pub use present::{BlitPresenter, PresenterOptions};
pub use readback::TexelReadback;
pub use swapchain::Swapchain;
