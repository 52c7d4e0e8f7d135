// Interop contracts between the two device contexts
//
// The producer and consumer never see each other's object model. They meet
// through three narrow seams:
// - SharedImageProducer: owns the physical memory and exports a handle
// - SharedImageImporter: turns a handle into a locally bound image
// - KeyedMutex: the only ordering guarantee between the two queues

pub mod protocol;

pub use protocol::{KeyPair, SyncMode, SyncProtocol};

use crate::error::InteropResult;
use crate::texture::TextureDesc;
use glam::Vec4;
use std::time::Duration;

/// Platform-defined value behind a shared handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RawSharedHandle {
    /// NT handle from `IDXGIResource1::CreateSharedHandle`
    NtHandle(usize),
    /// Entry in a simulated platform's handle table
    Simulated { platform: u64, slot: u64 },
}

/// Opaque OS-level reference to a shared allocation.
///
/// The raw value is never exposed; it only travels between an exporter and an
/// importer of the same platform. The descriptor of the allocation travels
/// with it so the importer can check the out-of-band format agreement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedHandle {
    raw: RawSharedHandle,
    desc: TextureDesc,
}

impl SharedHandle {
    pub(crate) fn new(raw: RawSharedHandle, desc: TextureDesc) -> Self {
        Self { raw, desc }
    }

    pub(crate) fn raw(&self) -> RawSharedHandle {
        self.raw
    }

    /// Descriptor of the allocation this handle denotes
    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    /// Platform family this handle can be imported on
    pub fn kind(&self) -> &'static str {
        match self.raw {
            RawSharedHandle::NtHandle(_) => "d3d11-nt-handle",
            RawSharedHandle::Simulated { .. } => "simulated",
        }
    }
}

/// Result of `KeyedMutex::acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired,
    /// Not an error: skip the protected work and try again next frame
    TimedOut,
}

/// Result of `KeyedMutex::release`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Released,
    /// Release attempted without holding the mutex (heartbeat after a timeout)
    NotHeld,
}

/// Mutual-exclusion token attached 1:1 to the shared physical memory.
///
/// `acquire(key)` succeeds once the memory is free and was last released
/// with `key`. Both calls fail only with `InteropError::SyncFatal`.
pub trait KeyedMutex {
    fn acquire(&self, key: u64, timeout: Duration) -> InteropResult<AcquireStatus>;
    fn release(&self, key: u64) -> InteropResult<ReleaseStatus>;
}

/// Handle-exporting side: owns the shared allocation and writes into it
pub trait SharedImageProducer {
    type Mutex: KeyedMutex;

    fn desc(&self) -> TextureDesc;

    /// Cached handle; every call denotes the same physical memory
    fn shared_handle(&self) -> SharedHandle;

    fn keyed_mutex(&self) -> &Self::Mutex;

    /// Render-target write filling the whole image with `color`
    fn clear(&mut self, color: Vec4) -> InteropResult<()>;
}

/// Handle-importing side: binds foreign memory to a local image
pub trait SharedImageImporter {
    type Image;

    fn import_shared_image(
        &self,
        handle: &SharedHandle,
        desc: TextureDesc,
    ) -> InteropResult<Self::Image>;
}

/// Black-box consumer of the imported image, driven once per tick.
///
/// Returns `Ok(false)` when the pipeline wants to shut down.
pub trait PresentationPipeline {
    fn render(&mut self) -> anyhow::Result<bool>;
}

/// Reject an import whose declared image disagrees with the allocation
pub(crate) fn check_descriptor(handle: &SharedHandle, desc: &TextureDesc) -> InteropResult<()> {
    use crate::error::InteropError;

    if desc.is_empty() {
        return Err(InteropError::import(format!(
            "cannot declare an empty image ({}x{})",
            desc.width, desc.height
        )));
    }
    let exported = handle.desc();
    if exported.width != desc.width || exported.height != desc.height {
        return Err(InteropError::import(format!(
            "extent mismatch: handle denotes {}x{}, local image declared {}x{}",
            exported.width, exported.height, desc.width, desc.height
        )));
    }
    if exported.format != desc.format {
        return Err(InteropError::import(format!(
            "format mismatch: handle denotes {:?}, local image declared {:?}",
            exported.format, desc.format
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InteropError;
    use crate::texture::TextureFormat;

    fn handle(desc: TextureDesc) -> SharedHandle {
        SharedHandle::new(RawSharedHandle::Simulated { platform: 1, slot: 1 }, desc)
    }

    #[test]
    fn matching_descriptor_passes() {
        let desc = TextureDesc::default();
        assert!(check_descriptor(&handle(desc), &desc).is_ok());
    }

    #[test]
    fn extent_and_format_mismatches_are_import_errors() {
        let h = handle(TextureDesc::default());

        let wrong_extent = TextureDesc::new(128, 256, TextureFormat::Rgba8Unorm);
        let err = check_descriptor(&h, &wrong_extent).unwrap_err();
        assert!(matches!(err, InteropError::Import(_)));
        assert!(err.to_string().contains("extent mismatch"));

        let wrong_format = TextureDesc::new(256, 256, TextureFormat::Bgra8Unorm);
        let err = check_descriptor(&h, &wrong_format).unwrap_err();
        assert!(err.to_string().contains("format mismatch"));
    }

    #[test]
    fn handle_kind_names_its_platform() {
        let nt = SharedHandle::new(RawSharedHandle::NtHandle(0x40), TextureDesc::default());
        assert_eq!(nt.kind(), "d3d11-nt-handle");
        assert_eq!(handle(TextureDesc::default()).kind(), "simulated");
    }
}
