//! Cross-API GPU texture sharing.
//!
//! A producer device allocates a render target whose memory can be exported
//! as an OS handle and is guarded by a keyed mutex. A consumer device imports
//! the handle, binds the same physical memory to an image of its own, and both
//! sides take turns through the mutex every frame.
//!
//! - [`interop`]: the contracts (handles, keyed mutex, producer/importer traits)
//! - [`frame`]: the per-frame protocol driving either side
//! - [`backend`]: the Vulkan consumer
//! - `d3d11` (Windows only): the Direct3D 11 producer
//! - [`sim`]: software devices implementing both sides, for headless runs

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod interop;
pub mod sim;
pub mod texture;

#[cfg(windows)]
pub mod app;
#[cfg(windows)]
pub mod d3d11;

pub use error::{InteropError, InteropResult};
