// =============================================================================
// WINDOWED DEMO - D3D11 producer, Vulkan consumer, one shared texture
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  D3D11 device (producer)                                        │
// │    └── Shared texture (NT handle + keyed mutex)                 │
// │          │  handle                                              │
// │          ▼                                                      │
// │  Vulkan device (consumer, same adapter LUID)                    │
// │    └── Imported image (TRANSFER_SRC) ── blit ──> Swapchain      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (one redraw):
// 1. Producer acquires, clears with the animated blue value, releases
// 2. Consumer blits under the keyed mutex (or presents the fallback)
// 3. Present, update the FPS title
//
// =============================================================================

use crate::backend::{
    BlitPresenter, DeviceOptions, PresenterOptions, TexelReadback, VulkanDevice, VulkanImporter,
};
use crate::config::Config;
use crate::d3d11::{D3d11Device, SharedTexture};
use crate::frame::ProducerFrameSync;
use crate::interop::{PresentationPipeline, SharedImageImporter, SharedImageProducer};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    window::{Fullscreen, Window, WindowAttributes},
};

/// Application state.
///
/// Field order matters for Drop: the consumer's objects go first, the
/// producer's texture and device last.
pub struct App {
    config: Config,

    // Consumer
    readback: Option<TexelReadback>,
    presenter: Option<BlitPresenter>,
    device: Option<Arc<VulkanDevice>>,

    // Producer
    producer_sync: Option<ProducerFrameSync>,
    texture: Option<SharedTexture>,
    producer: Option<D3d11Device>,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// First unrecoverable error; the event loop exits once it is set
    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            readback: None,
            presenter: None,
            device: None,
            producer_sync: None,
            texture: None,
            producer: None,
            window: None,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    pub fn take_fatal(&mut self) -> Option<anyhow::Error> {
        self.fatal.take()
    }

    /// Frames presented so far
    pub fn rendered(&self) -> u64 {
        self.presenter.as_ref().map_or(0, BlitPresenter::rendered)
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init(&mut self, window: &Window) -> Result<()> {
        let desc = self.config.texture_desc();
        let protocol = self.config.protocol();
        let debug = cfg!(debug_assertions) && self.config.debug.validation_layers;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Producer device + shared texture
        // ─────────────────────────────────────────────────────────────────────
        let producer = D3d11Device::create(debug)?;
        let texture = producer.create_shared_texture(desc)?;
        let producer_sync = ProducerFrameSync::new(protocol, self.config.animation())?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Consumer device on the same adapter
        // ─────────────────────────────────────────────────────────────────────
        let device = VulkanDevice::new(&DeviceOptions {
            app_name: self.config.window.title.clone(),
            enable_validation: debug,
            presentation: true,
            adapter_luid: Some(producer.adapter_luid()),
        })?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Import the handle
        // ─────────────────────────────────────────────────────────────────────
        let imported = VulkanImporter::new(device.clone())
            .import_shared_image(&texture.shared_handle(), desc)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Surface + presenter
        // ─────────────────────────────────────────────────────────────────────
        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let surface = create_surface(&device, window)?;

        let size = window.inner_size();
        let presenter = BlitPresenter::new(
            device.clone(),
            imported,
            surface,
            surface_loader,
            protocol,
            PresenterOptions {
                present_mode: self.config.get_present_mode(),
                clear_color: self.config.graphics.clear_color,
                frames_in_flight: self.config.graphics.max_frames_in_flight,
                max_frames: self.config.run.max_frames,
            },
            size.width,
            size.height,
        )?;
        let readback = TexelReadback::new(device.clone())?;

        log::info!(
            "Producer on {}, consumer on {}",
            producer.adapter_name(),
            device.device_name()
        );

        self.readback = Some(readback);
        self.presenter = Some(presenter);
        self.device = Some(device);
        self.producer_sync = Some(producer_sync);
        self.texture = Some(texture);
        self.producer = Some(producer);

        log::info!("Shared texture pipeline initialized");
        Ok(())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Producer tick then consumer frame; `false` once done
    fn frame(&mut self) -> Result<bool> {
        let (Some(sync), Some(texture), Some(presenter)) = (
            self.producer_sync.as_mut(),
            self.texture.as_mut(),
            self.presenter.as_mut(),
        ) else {
            return Ok(true);
        };

        sync.tick(texture)?;
        let keep_going = presenter.render()?;

        let interval = self.config.run.stats_interval;
        let rendered = presenter.rendered();
        if interval > 0 && rendered > 0 && rendered % interval == 0 {
            let produced = sync.stats();
            let consumed = presenter.stats();
            log::info!(
                "frame {}: blue = {:.4} | producer {} written / {} timed out | consumer {} blitted / {} timed out",
                rendered,
                sync.animation().value(),
                produced.acquired,
                produced.timed_out,
                consumed.acquired,
                consumed.timed_out
            );

            if let Some(readback) = self.readback.as_ref() {
                let protocol = sync.protocol();
                let sampled = readback.read_center(
                    presenter.image(),
                    protocol.consumer,
                    protocol.timeout_ms(),
                )?;
                match sampled {
                    Some(color) => log::info!("consumer readback: blue = {:.4}", color.z),
                    None => log::debug!("consumer readback skipped: keyed mutex busy"),
                }
            }
        }
        Ok(keep_going)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let blue = self
                .producer_sync
                .as_ref()
                .map_or(0.0, |sync| sync.animation().value());
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) blue {:.3}",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    blue
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        log::error!("{:#}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        event_loop.exit();
    }
}

/// Win32 surface for the window
fn create_surface(device: &VulkanDevice, window: &Window) -> Result<vk::SurfaceKHR> {
    use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

    let window_handle = window
        .window_handle()
        .context("Failed to get window handle")?
        .as_raw();
    let display_handle = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map_or(0, |h| h.get()) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(&device.entry, &device.instance);
            unsafe { loader.create_win32_surface(&create_info, None) }
                .context("Failed to create Win32 surface")
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init(&window) {
            self.fail(event_loop, e);
            return;
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut presenter) = self.presenter {
                    presenter.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {
                    log::info!("Frame limit reached after {} frames", self.rendered());
                    event_loop.exit();
                }
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");
        if let Some(ref device) = self.device {
            let _ = device.wait_idle();
        }
        // Consumer before producer
        self.readback = None;
        self.presenter = None;
        self.device = None;
        self.producer_sync = None;
        self.texture = None;
        self.producer = None;
        log::info!("Cleanup complete");
    }
}
