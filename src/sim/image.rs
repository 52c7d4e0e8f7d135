// Producer and consumer views of one simulated shared image

use super::memory::PhysicalImageMemory;
use super::platform::{CommandBufferCounters, OneShotCommands, SimPlatform};
use crate::error::{InteropError, InteropResult};
use crate::frame::LayoutState;
use crate::interop::{AcquireStatus, KeyedMutex, ReleaseStatus, SharedHandle, SharedImageProducer};
use crate::texture::{ImageLayout, TextureDesc};
use glam::Vec4;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_SIDE: AtomicU64 = AtomicU64::new(1);

/// One side's interface to the keyed mutex of a shared allocation
#[derive(Debug)]
pub struct SimKeyedMutex {
    memory: Arc<PhysicalImageMemory>,
    side: u64,
    device_lost: Arc<AtomicBool>,
}

impl SimKeyedMutex {
    pub(crate) fn new(memory: Arc<PhysicalImageMemory>, device_lost: Arc<AtomicBool>) -> Self {
        Self {
            memory,
            side: NEXT_SIDE.fetch_add(1, Ordering::Relaxed),
            device_lost,
        }
    }

    fn check_device(&self, operation: &'static str) -> InteropResult<()> {
        if self.device_lost.load(Ordering::SeqCst) {
            return Err(InteropError::sync_fatal(operation, "device was removed"));
        }
        Ok(())
    }

    /// Whether this side currently holds the mutex
    pub fn is_held(&self) -> bool {
        self.memory.keyed_mutex().holder() == Some(self.side)
    }
}

impl KeyedMutex for SimKeyedMutex {
    fn acquire(&self, key: u64, timeout: Duration) -> InteropResult<AcquireStatus> {
        self.check_device("acquire")?;
        self.memory
            .keyed_mutex()
            .acquire(self.side, key, timeout)
            .map_err(|fault| InteropError::sync_fatal("acquire", fault.reason()))
    }

    fn release(&self, key: u64) -> InteropResult<ReleaseStatus> {
        self.check_device("release")?;
        Ok(self.memory.keyed_mutex().release(self.side, key))
    }
}

impl Drop for SimKeyedMutex {
    fn drop(&mut self) {
        if self.is_held() {
            log::warn!("keyed mutex dropped while held; marking it abandoned");
        }
        self.memory.keyed_mutex().abandon(self.side);
    }
}

/// Producer-side shared render target
#[derive(Debug)]
pub struct SimSharedImage {
    memory: Arc<PhysicalImageMemory>,
    handle: SharedHandle,
    reissued: Mutex<Vec<SharedHandle>>,
    mutex: SimKeyedMutex,
    platform: SimPlatform,
    device_lost: Arc<AtomicBool>,
}

impl SimSharedImage {
    pub(crate) fn new(
        memory: Arc<PhysicalImageMemory>,
        handle: SharedHandle,
        mutex: SimKeyedMutex,
        platform: SimPlatform,
        device_lost: Arc<AtomicBool>,
    ) -> Self {
        Self {
            memory,
            handle,
            reissued: Mutex::new(Vec::new()),
            mutex,
            platform,
            device_lost,
        }
    }

    /// Export an additional handle to the same allocation.
    ///
    /// The value differs from `shared_handle()` but imports alias the same
    /// physical memory. Closed together with the image.
    pub fn issue_handle(&self) -> SharedHandle {
        let handle = self.platform.register(&self.memory);
        self.reissued.lock().push(handle.clone());
        handle
    }

    /// Producer-side read of the current contents, bypassing the mutex
    pub fn read_texels(&self) -> Vec<u32> {
        self.memory.snapshot()
    }
}

impl SharedImageProducer for SimSharedImage {
    type Mutex = SimKeyedMutex;

    fn desc(&self) -> TextureDesc {
        self.memory.desc()
    }

    fn shared_handle(&self) -> SharedHandle {
        self.handle.clone()
    }

    fn keyed_mutex(&self) -> &SimKeyedMutex {
        &self.mutex
    }

    fn clear(&mut self, color: Vec4) -> InteropResult<()> {
        if self.device_lost.load(Ordering::SeqCst) {
            return Err(InteropError::sync_fatal(
                "render-target write",
                "device was removed",
            ));
        }
        let texel = self.memory.desc().format.pack(color);
        self.memory.fill(texel);
        Ok(())
    }
}

impl Drop for SimSharedImage {
    fn drop(&mut self) {
        self.platform.close_handle(&self.handle);
        for handle in self.reissued.get_mut().drain(..) {
            self.platform.close_handle(&handle);
        }
    }
}

/// Consumer-side image bound to imported memory at offset 0
#[derive(Debug)]
pub struct SimImportedImage {
    memory: Arc<PhysicalImageMemory>,
    memory_type_index: u32,
    mutex: SimKeyedMutex,
    layout: LayoutState,
    command_buffers: Arc<CommandBufferCounters>,
}

impl SimImportedImage {
    pub(crate) fn new(
        memory: Arc<PhysicalImageMemory>,
        memory_type_index: u32,
        mutex: SimKeyedMutex,
        command_buffers: Arc<CommandBufferCounters>,
    ) -> Self {
        Self {
            memory,
            memory_type_index,
            mutex,
            layout: LayoutState::new(),
            command_buffers,
        }
    }

    pub fn desc(&self) -> TextureDesc {
        self.memory.desc()
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn layout(&self) -> LayoutState {
        self.layout
    }

    pub fn keyed_mutex(&self) -> &SimKeyedMutex {
        &self.mutex
    }

    /// Move the image to `target` with a one-shot command buffer.
    ///
    /// Returns `false` when the image is already there. The command buffer is
    /// returned to the pool whether or not the submission went through.
    pub fn prepare(&mut self, target: ImageLayout) -> InteropResult<bool> {
        let Some((old, new)) = self.layout.plan(target) else {
            return Ok(false);
        };

        let commands = OneShotCommands::begin(&self.command_buffers);
        if self.mutex.device_lost.load(Ordering::SeqCst) {
            return Err(InteropError::sync_fatal(
                "layout transition",
                "device was removed",
            ));
        }
        commands.submit_and_wait();

        log::debug!("one-shot layout transition {:?} -> {:?}", old, new);
        self.layout.commit(new);
        Ok(true)
    }

    /// Full read of the bound memory
    pub fn sample(&self) -> Vec<u32> {
        self.memory.snapshot()
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<u32> {
        let desc = self.memory.desc();
        if x >= desc.width || y >= desc.height {
            return None;
        }
        self.memory
            .texel(y as usize * desc.width as usize + x as usize)
    }

    /// Color at the image center, as the fragment shader would see it
    pub fn center_color(&self) -> Vec4 {
        let desc = self.memory.desc();
        let texel = self.texel(desc.width / 2, desc.height / 2).unwrap_or(0);
        desc.format.unpack(texel)
    }

    /// Both images are bound to the same physical allocation
    pub fn aliases(&self, other: &SimImportedImage) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    pub fn is_backed_by(&self, producer: &SimSharedImage) -> bool {
        Arc::ptr_eq(&self.memory, &producer.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::SharedImageImporter;
    use crate::sim::SimDevice;
    use crate::texture::{gradient_texels, TextureFormat};

    fn pair() -> (SimSharedImage, SimImportedImage, SimDevice) {
        let platform = SimPlatform::default();
        let producer = platform.create_device("producer").unwrap();
        let consumer = platform.create_device("consumer").unwrap();
        let desc = TextureDesc::new(8, 8, TextureFormat::Bgra8Unorm);
        let image = producer.create_shared_image(desc).unwrap();
        let imported = consumer
            .import_shared_image(&image.shared_handle(), desc)
            .unwrap();
        (image, imported, consumer)
    }

    #[test]
    fn debug_output_skips_texel_contents() {
        let (image, imported, consumer) = pair();
        let text = format!("{:?}", image);
        assert!(text.starts_with("SimSharedImage"));
        assert!(text.contains("PhysicalImageMemory"));
        assert!(text.len() < 2048, "{} bytes of debug output", text.len());
        assert!(format!("{:?}", imported).starts_with("SimImportedImage"));
        assert!(format!("{:?}", consumer).contains("consumer"));
    }

    #[test]
    fn imported_image_sees_initial_gradient() {
        let (image, imported, _) = pair();
        assert_eq!(imported.sample(), gradient_texels(&image.desc()));
        assert!(imported.is_backed_by(&image));
    }

    #[test]
    fn clear_is_visible_through_the_import() {
        let (mut image, imported, _) = pair();
        image.clear(Vec4::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(imported.center_color(), Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert!(imported.sample().iter().all(|&t| t == imported.sample()[0]));
    }

    #[test]
    fn prepare_transitions_once() {
        let (_image, mut imported, consumer) = pair();
        assert!(imported.prepare(ImageLayout::ShaderReadOnly).unwrap());
        assert!(!imported.prepare(ImageLayout::ShaderReadOnly).unwrap());
        assert_eq!(imported.layout().transitions(), 1);
        assert_eq!(consumer.one_shot_submissions(), 1);
        assert_eq!(consumer.live_command_buffers(), 0);
    }

    #[test]
    fn mutex_is_exclusive_across_sides() {
        let (image, imported, _) = pair();
        let zero = Duration::ZERO;
        assert_eq!(image.keyed_mutex().acquire(0, zero).unwrap(), AcquireStatus::Acquired);
        assert_eq!(imported.keyed_mutex().acquire(0, zero).unwrap(), AcquireStatus::TimedOut);
        assert_eq!(imported.keyed_mutex().release(0).unwrap(), ReleaseStatus::NotHeld);
        assert_eq!(image.keyed_mutex().release(0).unwrap(), ReleaseStatus::Released);
        assert_eq!(imported.keyed_mutex().acquire(0, zero).unwrap(), AcquireStatus::Acquired);
    }

    #[test]
    fn lost_device_makes_mutex_calls_fatal() {
        let (_image, imported, consumer) = pair();
        consumer.lose();
        let err = imported
            .keyed_mutex()
            .acquire(0, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, InteropError::SyncFatal { operation: "acquire", .. }));
    }

    #[test]
    fn texel_lookup_is_bounds_checked() {
        let (_image, imported, _) = pair();
        assert!(imported.texel(7, 7).is_some());
        assert!(imported.texel(8, 0).is_none());
    }
}
