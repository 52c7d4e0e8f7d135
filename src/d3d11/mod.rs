// D3D11 producer - owns the shared texture and writes into it
//
// CREATION:
// 1. Hardware device on the default adapter (its LUID picks the Vulkan GPU)
// 2. Render-target texture with SHARED_NTHANDLE | SHARED_KEYEDMUTEX,
//    initialized with the gradient pattern
// 3. NT handle via IDXGIResource1::CreateSharedHandle, cached for the
//    texture's lifetime
// 4. IDXGIKeyedMutex queried from the same texture
//
// AcquireSync reports a timeout as the success code WAIT_TIMEOUT, which the
// `windows` crate's Result folds into Ok. The keyed mutex is therefore called
// through its vtable to see the raw HRESULT.

use crate::error::{InteropError, InteropResult};
use crate::interop::{
    AcquireStatus, KeyedMutex, RawSharedHandle, ReleaseStatus, SharedHandle, SharedImageProducer,
};
use crate::texture::{gradient_texels, TextureDesc, TextureFormat, MAX_TEXTURE_DIMENSION};
use anyhow::{Context, Result};
use glam::Vec4;
use std::time::Duration;
use windows::core::{Interface, HRESULT, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

const WAIT_OBJECT_0: HRESULT = HRESULT(0x0000_0000);
const WAIT_ABANDONED: HRESULT = HRESULT(0x0000_0080);
const WAIT_TIMEOUT: HRESULT = HRESULT(0x0000_0102);

fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
    }
}

/// NT handle closed on drop
#[derive(Debug)]
pub struct OwnedNtHandle(HANDLE);

impl OwnedNtHandle {
    pub fn raw(&self) -> usize {
        self.0 .0 as usize
    }
}

impl Drop for OwnedNtHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                if let Err(e) = CloseHandle(self.0) {
                    log::warn!("CloseHandle on shared texture handle failed: {}", e);
                }
            }
        }
    }
}

/// Producer device context
pub struct D3d11Device {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    adapter_name: String,
    adapter_luid: [u8; 8],
}

impl D3d11Device {
    pub fn create(debug: bool) -> InteropResult<Self> {
        Self::create_inner(debug).map_err(InteropError::DeviceCreation)
    }

    fn create_inner(debug: bool) -> Result<Self> {
        let flags = if debug {
            D3D11_CREATE_DEVICE_DEBUG
        } else {
            D3D11_CREATE_DEVICE_FLAG(0)
        };

        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                flags,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .context("D3D11CreateDevice failed (hardware driver)")?;
        let device = device.context("D3D11CreateDevice returned no device")?;
        let context = context.context("D3D11CreateDevice returned no immediate context")?;

        let (adapter_name, adapter_luid) = unsafe {
            let dxgi_device: IDXGIDevice = device.cast().context("Device is not a DXGI device")?;
            let adapter = dxgi_device.GetAdapter().context("Failed to get DXGI adapter")?;
            let desc = adapter.GetDesc().context("Failed to describe DXGI adapter")?;
            let len = desc
                .Description
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(desc.Description.len());
            let name = String::from_utf16_lossy(&desc.Description[..len]);

            let mut luid = [0u8; 8];
            luid[..4].copy_from_slice(&desc.AdapterLuid.LowPart.to_le_bytes());
            luid[4..].copy_from_slice(&desc.AdapterLuid.HighPart.to_le_bytes());
            (name, luid)
        };

        log::info!("D3D11 producer device on {}", adapter_name);
        Ok(Self {
            device,
            context,
            adapter_name,
            adapter_luid,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Locally unique id of the adapter, as Vulkan reports it in `deviceLUID`
    pub fn adapter_luid(&self) -> [u8; 8] {
        self.adapter_luid
    }

    pub fn create_shared_texture(&self, desc: TextureDesc) -> InteropResult<SharedTexture> {
        if desc.is_empty() {
            return Err(InteropError::allocation(format!(
                "cannot allocate an empty image ({}x{})",
                desc.width, desc.height
            )));
        }
        if desc.exceeds_limit() {
            return Err(InteropError::allocation(format!(
                "extent {}x{} exceeds the {} texel limit",
                desc.width, desc.height, MAX_TEXTURE_DIMENSION
            )));
        }
        SharedTexture::create(self, desc).map_err(InteropError::Allocation)
    }
}

/// Keyed mutex of a shared D3D11 texture
pub struct DxgiKeyedMutex {
    mutex: IDXGIKeyedMutex,
}

impl KeyedMutex for DxgiKeyedMutex {
    fn acquire(&self, key: u64, timeout: Duration) -> InteropResult<AcquireStatus> {
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let vtable = Interface::vtable(&self.mutex);
        let hr = unsafe { (vtable.AcquireSync)(Interface::as_raw(&self.mutex), key, ms) };
        match hr {
            WAIT_OBJECT_0 => Ok(AcquireStatus::Acquired),
            WAIT_TIMEOUT => Ok(AcquireStatus::TimedOut),
            WAIT_ABANDONED => Err(InteropError::sync_fatal(
                "AcquireSync",
                "mutex abandoned by its previous owner",
            )),
            hr => Err(InteropError::sync_fatal(
                "AcquireSync",
                format!("{}", windows::core::Error::from(hr)),
            )),
        }
    }

    fn release(&self, key: u64) -> InteropResult<ReleaseStatus> {
        let vtable = Interface::vtable(&self.mutex);
        let hr = unsafe { (vtable.ReleaseSync)(Interface::as_raw(&self.mutex), key) };
        if hr.is_ok() {
            Ok(ReleaseStatus::Released)
        } else if hr == DXGI_ERROR_INVALID_CALL {
            // Released without holding it
            Ok(ReleaseStatus::NotHeld)
        } else {
            Err(InteropError::sync_fatal(
                "ReleaseSync",
                format!("{}", windows::core::Error::from(hr)),
            ))
        }
    }
}

/// Shared render target plus its cached NT handle
pub struct SharedTexture {
    texture: ID3D11Texture2D,
    render_target: ID3D11RenderTargetView,
    context: ID3D11DeviceContext,
    device: ID3D11Device,
    keyed_mutex: DxgiKeyedMutex,
    desc: TextureDesc,
    handle: OwnedNtHandle,
    reissued: Vec<OwnedNtHandle>,
}

impl SharedTexture {
    fn create(owner: &D3d11Device, desc: TextureDesc) -> Result<Self> {
        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: (D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0
                | D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0) as u32,
        };

        let pixels: Vec<u8> = gradient_texels(&desc)
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect();
        let initial_data = D3D11_SUBRESOURCE_DATA {
            pSysMem: pixels.as_ptr().cast(),
            // Bounded by MAX_TEXTURE_DIMENSION, fits in u32
            SysMemPitch: desc.row_pitch() as u32,
            SysMemSlicePitch: desc.byte_size() as u32,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe {
            owner
                .device
                .CreateTexture2D(&texture_desc, Some(&initial_data), Some(&mut texture))
        }
        .context("CreateTexture2D rejected the shared keyed-mutex texture")?;
        let texture = texture.context("CreateTexture2D returned no texture")?;

        let mut render_target: Option<ID3D11RenderTargetView> = None;
        unsafe {
            owner
                .device
                .CreateRenderTargetView(&texture, None, Some(&mut render_target))
        }
        .context("Failed to create render target view")?;
        let render_target = render_target.context("CreateRenderTargetView returned no view")?;

        let handle = Self::create_handle(&texture)?;
        let mutex: IDXGIKeyedMutex = texture
            .cast()
            .context("Shared texture exposes no IDXGIKeyedMutex")?;

        log::info!(
            "Created shared texture {}x{} {:?} (handle {:#x})",
            desc.width,
            desc.height,
            desc.format,
            handle.raw()
        );

        Ok(Self {
            texture,
            render_target,
            context: owner.context.clone(),
            device: owner.device.clone(),
            keyed_mutex: DxgiKeyedMutex { mutex },
            desc,
            handle,
            reissued: Vec::new(),
        })
    }

    fn create_handle(texture: &ID3D11Texture2D) -> Result<OwnedNtHandle> {
        let resource: IDXGIResource1 = texture
            .cast()
            .context("Shared texture exposes no IDXGIResource1")?;
        let handle = unsafe {
            resource.CreateSharedHandle(
                None,
                DXGI_SHARED_RESOURCE_READ | DXGI_SHARED_RESOURCE_WRITE,
                PCWSTR::null(),
            )
        }
        .context("CreateSharedHandle failed")?;
        Ok(OwnedNtHandle(handle))
    }

    /// A fresh NT handle for the same texture, closed with the texture
    pub fn issue_handle(&mut self) -> InteropResult<SharedHandle> {
        let handle = Self::create_handle(&self.texture).map_err(InteropError::Allocation)?;
        let shared = SharedHandle::new(RawSharedHandle::NtHandle(handle.raw()), self.desc);
        self.reissued.push(handle);
        Ok(shared)
    }

    fn check_device(&self) -> InteropResult<()> {
        unsafe { self.device.GetDeviceRemovedReason() }.map_err(|e| {
            InteropError::sync_fatal("render-target write", format!("device removed: {}", e))
        })
    }
}

impl SharedImageProducer for SharedTexture {
    type Mutex = DxgiKeyedMutex;

    fn desc(&self) -> TextureDesc {
        self.desc
    }

    fn shared_handle(&self) -> SharedHandle {
        SharedHandle::new(RawSharedHandle::NtHandle(self.handle.raw()), self.desc)
    }

    fn keyed_mutex(&self) -> &DxgiKeyedMutex {
        &self.keyed_mutex
    }

    fn clear(&mut self, color: Vec4) -> InteropResult<()> {
        self.check_device()?;
        let rgba = color.to_array();
        unsafe {
            self.context.ClearRenderTargetView(&self.render_target, &rgba);
            // Submit before the release hands the memory to the consumer
            self.context.Flush();
        }
        Ok(())
    }
}
