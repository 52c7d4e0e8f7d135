// Simulated platform: adapters, devices and the OS handle table
//
// Devices created from one platform can exchange shared handles the way two
// device contexts on one machine exchange NT handles. The handle table holds
// weak references only; physical memory lives as long as some image (on
// either device) still binds it.

use super::image::{SimImportedImage, SimKeyedMutex, SimSharedImage};
use super::memory::PhysicalImageMemory;
use crate::error::{InteropError, InteropResult};
use crate::interop::{check_descriptor, RawSharedHandle, SharedHandle, SharedImageImporter};
use crate::texture::{gradient_texels, TextureDesc, MAX_TEXTURE_DIMENSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_PLATFORM: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimMemoryType {
    pub device_local: bool,
    /// Can back an import of an external D3D11 texture
    pub importable: bool,
}

/// What one simulated adapter supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimAdapterInfo {
    pub name: String,
    pub graphics_queue: bool,
    /// Can create shared + keyed-mutex render targets
    pub shared_resources: bool,
    pub memory_types: Vec<SimMemoryType>,
}

impl SimAdapterInfo {
    /// Fully capable discrete GPU
    pub fn discrete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graphics_queue: true,
            shared_resources: true,
            memory_types: vec![
                SimMemoryType {
                    device_local: true,
                    importable: false,
                },
                SimMemoryType {
                    device_local: true,
                    importable: true,
                },
                SimMemoryType {
                    device_local: false,
                    importable: true,
                },
            ],
        }
    }

    pub fn without_graphics_queue(mut self) -> Self {
        self.graphics_queue = false;
        self
    }

    pub fn without_shared_resources(mut self) -> Self {
        self.shared_resources = false;
        self
    }

    pub fn with_memory_types(mut self, memory_types: Vec<SimMemoryType>) -> Self {
        self.memory_types = memory_types;
        self
    }
}

struct PlatformInner {
    id: u64,
    adapters: Vec<SimAdapterInfo>,
    handles: Mutex<HashMap<u64, Weak<PhysicalImageMemory>>>,
    next_slot: AtomicU64,
    next_device: AtomicU64,
}

/// One machine: a set of adapters sharing one handle namespace
#[derive(Clone)]
pub struct SimPlatform {
    inner: Arc<PlatformInner>,
}

impl SimPlatform {
    pub fn new(adapters: Vec<SimAdapterInfo>) -> Self {
        Self {
            inner: Arc::new(PlatformInner {
                id: NEXT_PLATFORM.fetch_add(1, Ordering::Relaxed),
                adapters,
                handles: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(1),
                next_device: AtomicU64::new(1),
            }),
        }
    }

    pub fn adapters(&self) -> &[SimAdapterInfo] {
        &self.inner.adapters
    }

    /// Create a device on the first adapter with a graphics queue
    pub fn create_device(&self, label: &str) -> InteropResult<SimDevice> {
        let adapter = self
            .inner
            .adapters
            .iter()
            .find(|a| a.graphics_queue)
            .cloned()
            .ok_or_else(|| {
                InteropError::device(format!(
                    "none of the {} adapter(s) provides a graphics queue",
                    self.inner.adapters.len()
                ))
            })?;

        let id = self.inner.next_device.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Simulated device '{}' (#{}) created on adapter '{}'",
            label,
            id,
            adapter.name
        );

        Ok(SimDevice {
            id,
            label: label.to_string(),
            adapter,
            platform: self.clone(),
            lost: Arc::new(AtomicBool::new(false)),
            command_buffers: Arc::new(CommandBufferCounters::default()),
        })
    }

    /// Number of handle table entries that still denote live memory
    pub fn open_handles(&self) -> usize {
        self.inner
            .handles
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Close a handle. Memory already bound on either device stays alive.
    ///
    /// Returns `false` when the handle was not open on this platform.
    pub fn close_handle(&self, handle: &SharedHandle) -> bool {
        match handle.raw() {
            RawSharedHandle::Simulated { platform, slot } if platform == self.inner.id => {
                self.inner.handles.lock().remove(&slot).is_some()
            }
            _ => false,
        }
    }

    pub(crate) fn register(&self, memory: &Arc<PhysicalImageMemory>) -> SharedHandle {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handles
            .lock()
            .insert(slot, Arc::downgrade(memory));
        SharedHandle::new(
            RawSharedHandle::Simulated {
                platform: self.inner.id,
                slot,
            },
            memory.desc(),
        )
    }

    fn resolve(&self, handle: &SharedHandle) -> InteropResult<Arc<PhysicalImageMemory>> {
        let slot = match handle.raw() {
            RawSharedHandle::Simulated { platform, slot } if platform == self.inner.id => slot,
            RawSharedHandle::Simulated { .. } => {
                return Err(InteropError::import(
                    "handle was exported on a different platform",
                ))
            }
            RawSharedHandle::NtHandle(_) => {
                return Err(InteropError::import(format!(
                    "cannot import a {} handle on the simulated platform",
                    handle.kind()
                )))
            }
        };

        let mut handles = self.inner.handles.lock();
        match handles.get(&slot).map(Weak::upgrade) {
            Some(Some(memory)) => Ok(memory),
            Some(None) => {
                handles.remove(&slot);
                Err(InteropError::import(format!(
                    "handle slot {} is stale: its allocation was destroyed",
                    slot
                )))
            }
            None => Err(InteropError::import(format!(
                "handle slot {} is not open",
                slot
            ))),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new(vec![SimAdapterInfo::discrete("Simulated Discrete GPU")])
    }
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPlatform")
            .field("id", &self.inner.id)
            .field("adapters", &self.inner.adapters.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct CommandBufferCounters {
    live: AtomicU64,
    submitted: AtomicU64,
}

/// Transient command buffer; returned to the pool on drop
pub(crate) struct OneShotCommands<'a> {
    counters: &'a CommandBufferCounters,
}

impl<'a> OneShotCommands<'a> {
    pub(crate) fn begin(counters: &'a CommandBufferCounters) -> Self {
        counters.live.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }

    /// Submit and wait for completion
    pub(crate) fn submit_and_wait(self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for OneShotCommands<'_> {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One logical device context on a simulated adapter
pub struct SimDevice {
    id: u64,
    label: String,
    adapter: SimAdapterInfo,
    platform: SimPlatform,
    lost: Arc<AtomicBool>,
    command_buffers: Arc<CommandBufferCounters>,
}

impl SimDevice {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn adapter(&self) -> &SimAdapterInfo {
        &self.adapter
    }

    pub fn platform(&self) -> &SimPlatform {
        &self.platform
    }

    /// Simulate device removal; every later keyed-mutex call fails fatally
    pub fn lose(&self) {
        log::warn!("Simulated device '{}' removed", self.label);
        self.lost.store(true, Ordering::SeqCst);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Command buffers allocated and not yet freed
    pub fn live_command_buffers(&self) -> u64 {
        self.command_buffers.live.load(Ordering::Relaxed)
    }

    /// One-shot submissions made over the device lifetime
    pub fn one_shot_submissions(&self) -> u64 {
        self.command_buffers.submitted.load(Ordering::Relaxed)
    }

    /// Create a renderable, shareable, keyed-mutex-protected image.
    ///
    /// The image starts with the gradient pattern and its handle is exported
    /// once here; `SharedImageProducer::shared_handle` returns that same value.
    pub fn create_shared_image(&self, desc: TextureDesc) -> InteropResult<SimSharedImage> {
        if self.is_lost() {
            return Err(InteropError::allocation("device was removed"));
        }
        if !self.adapter.shared_resources {
            return Err(InteropError::allocation(format!(
                "adapter '{}' cannot create shared keyed-mutex resources",
                self.adapter.name
            )));
        }
        if desc.is_empty() {
            return Err(InteropError::allocation(format!(
                "invalid extent {}x{}",
                desc.width, desc.height
            )));
        }
        if desc.exceeds_limit() {
            return Err(InteropError::allocation(format!(
                "extent {}x{} exceeds the {} texel limit",
                desc.width, desc.height, MAX_TEXTURE_DIMENSION
            )));
        }

        let memory = Arc::new(PhysicalImageMemory::new(
            desc,
            self.id,
            &gradient_texels(&desc),
        ));
        let handle = self.platform.register(&memory);
        log::info!(
            "Shared image {}x{} {:?} created on '{}'",
            desc.width,
            desc.height,
            desc.format,
            self.label
        );

        let mutex = SimKeyedMutex::new(memory.clone(), self.lost.clone());
        Ok(SimSharedImage::new(
            memory,
            handle,
            mutex,
            self.platform.clone(),
            self.lost.clone(),
        ))
    }

    /// Image memory requirements: `(size, memory type bits)`
    fn memory_requirements(&self, desc: &TextureDesc) -> (u64, u32) {
        let type_bits = self
            .adapter
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.device_local)
            .fold(0u32, |bits, (i, _)| bits | (1 << i));
        (desc.byte_size(), type_bits)
    }

    fn find_import_memory_type(&self, type_bits: u32) -> Option<u32> {
        self.adapter
            .memory_types
            .iter()
            .enumerate()
            .find(|(i, t)| type_bits & (1 << i) != 0 && t.device_local && t.importable)
            .map(|(i, _)| i as u32)
    }
}

impl SharedImageImporter for SimDevice {
    type Image = SimImportedImage;

    fn import_shared_image(
        &self,
        handle: &SharedHandle,
        desc: TextureDesc,
    ) -> InteropResult<SimImportedImage> {
        if self.is_lost() {
            return Err(InteropError::import("device was removed"));
        }

        // ─── 1. Declare the local image with the agreed descriptor ───
        check_descriptor(handle, &desc)?;

        // ─── 2. Query requirements and pick memory ───
        let (size, type_bits) = self.memory_requirements(&desc);
        let memory_type_index = self.find_import_memory_type(type_bits).ok_or_else(|| {
            InteropError::import(format!(
                "adapter '{}' has no device-local memory type that can import external memory",
                self.adapter.name
            ))
        })?;

        // ─── 3. Allocate by importing the handle ───
        let memory = self.platform.resolve(handle)?;
        if memory.desc() != desc || memory.byte_size() < size {
            return Err(InteropError::import(format!(
                "allocation behind the handle ({} bytes) cannot back a {}x{} {:?} image",
                memory.byte_size(),
                desc.width,
                desc.height,
                desc.format
            )));
        }

        // ─── 4. Bind at offset 0 ───
        log::info!(
            "Imported shared image into '{}' (memory type {}, {} bytes, exported by device #{})",
            self.label,
            memory_type_index,
            size,
            memory.owner()
        );
        let mutex = SimKeyedMutex::new(memory.clone(), self.lost.clone());
        Ok(SimImportedImage::new(
            memory,
            memory_type_index,
            mutex,
            self.command_buffers.clone(),
        ))
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("adapter", &self.adapter.name)
            .field("platform", &self.platform.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::SharedImageProducer;
    use crate::texture::TextureFormat;

    #[test]
    fn device_creation_needs_a_graphics_queue() {
        let platform = SimPlatform::new(vec![
            SimAdapterInfo::discrete("compute only").without_graphics_queue()
        ]);
        let err = platform.create_device("producer").unwrap_err();
        assert!(matches!(err, InteropError::DeviceCreation(_)));
    }

    #[test]
    fn allocation_fails_without_shared_resources() {
        let platform = SimPlatform::new(vec![
            SimAdapterInfo::discrete("basic").without_shared_resources()
        ]);
        let device = platform.create_device("producer").unwrap();
        let err = device.create_shared_image(TextureDesc::default()).unwrap_err();
        assert!(matches!(err, InteropError::Allocation(_)));
    }

    #[test]
    fn allocation_rejects_bad_extents() {
        let device = SimPlatform::default().create_device("producer").unwrap();
        for desc in [
            TextureDesc::new(0, 16, TextureFormat::Rgba8Unorm),
            TextureDesc::new(MAX_TEXTURE_DIMENSION + 1, 16, TextureFormat::Rgba8Unorm),
        ] {
            assert!(matches!(
                device.create_shared_image(desc),
                Err(InteropError::Allocation(_))
            ));
        }
    }

    #[test]
    fn import_picks_the_device_local_importable_type() {
        let platform = SimPlatform::default();
        let producer = platform.create_device("producer").unwrap();
        let consumer = platform.create_device("consumer").unwrap();
        let image = producer.create_shared_image(TextureDesc::default()).unwrap();

        let imported = consumer
            .import_shared_image(&image.shared_handle(), TextureDesc::default())
            .unwrap();
        assert_eq!(imported.memory_type_index(), 1);
    }

    #[test]
    fn import_fails_without_importable_device_local_memory() {
        let platform = SimPlatform::new(vec![SimAdapterInfo::discrete("gpu").with_memory_types(
            vec![
                SimMemoryType {
                    device_local: true,
                    importable: false,
                },
                SimMemoryType {
                    device_local: false,
                    importable: true,
                },
            ],
        )]);
        let producer = platform.create_device("producer").unwrap();
        let consumer = platform.create_device("consumer").unwrap();
        let image = producer.create_shared_image(TextureDesc::default()).unwrap();

        let err = consumer
            .import_shared_image(&image.shared_handle(), TextureDesc::default())
            .unwrap_err();
        assert!(matches!(err, InteropError::Import(_)));
        assert!(err.to_string().contains("no device-local memory type"));
    }

    #[test]
    fn handles_do_not_cross_platforms() {
        let a = SimPlatform::default();
        let b = SimPlatform::default();
        let image = a
            .create_device("producer")
            .unwrap()
            .create_shared_image(TextureDesc::default())
            .unwrap();
        let foreign = b.create_device("consumer").unwrap();

        let err = foreign
            .import_shared_image(&image.shared_handle(), TextureDesc::default())
            .unwrap_err();
        assert!(err.to_string().contains("different platform"));
        assert!(!b.close_handle(&image.shared_handle()));
    }

    #[test]
    fn one_shot_commands_are_returned_on_drop() {
        let counters = CommandBufferCounters::default();
        {
            let cmd = OneShotCommands::begin(&counters);
            assert_eq!(counters.live.load(Ordering::Relaxed), 1);
            cmd.submit_and_wait();
        }
        {
            // Abandoned before submission, e.g. on an error path
            let _cmd = OneShotCommands::begin(&counters);
        }
        assert_eq!(counters.live.load(Ordering::Relaxed), 0);
        assert_eq!(counters.submitted.load(Ordering::Relaxed), 1);
    }
}
