// In-process software devices implementing both sides of the interop
//
// Runs anywhere and carries the same contracts as the D3D11 -> Vulkan pair:
// a shared handle table, physical memory owned by the exporting device, a
// keyed mutex that really blocks, and one-shot command submission.

mod image;
mod memory;
mod platform;
mod presenter;
mod session;

pub use image::{SimImportedImage, SimKeyedMutex, SimSharedImage};
pub use platform::{SimAdapterInfo, SimDevice, SimMemoryType, SimPlatform};
pub use presenter::HeadlessPresenter;
pub use session::{RunSummary, SimSession};
