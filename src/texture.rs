// Texture description shared by both device contexts
//
// Producer and consumer agree on this table out of band: the same descriptor
// must be used to create the shared allocation and to declare the imported
// image, otherwise the import is rejected.

use ash::vk;
use glam::Vec4;
use serde::Deserialize;

/// Pixel formats both APIs can address identically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }

    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        }
    }

    /// Pack a normalized color into one little-endian texel
    pub fn pack(self, color: Vec4) -> u32 {
        let c = (color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
        let [r, g, b, a] = [c.x as u8, c.y as u8, c.z as u8, c.w as u8];
        match self {
            Self::Rgba8Unorm => u32::from_le_bytes([r, g, b, a]),
            Self::Bgra8Unorm => u32::from_le_bytes([b, g, r, a]),
        }
    }

    pub fn unpack(self, texel: u32) -> Vec4 {
        let [x, y, z, w] = texel.to_le_bytes();
        let (r, g, b) = match self {
            Self::Rgba8Unorm => (x, y, z),
            Self::Bgra8Unorm => (z, y, x),
        };
        Vec4::new(r as f32, g as f32, b as f32, w as f32) / 255.0
    }
}

/// Largest extent either device accepts (D3D11 feature level 11)
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;

/// Extent + format of a single-mip, single-layer 2D image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn row_pitch(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.row_pitch() * self.height as u64
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn exceeds_limit(&self) -> bool {
        self.width > MAX_TEXTURE_DIMENSION || self.height > MAX_TEXTURE_DIMENSION
    }
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self::new(256, 256, TextureFormat::Rgba8Unorm)
    }
}

/// How the hardware may currently access an image, tracked per device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }

    /// Access mask and pipeline stage of the first use in this layout
    pub fn first_use(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            Self::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
            Self::ColorAttachment => (
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
            Self::ShaderReadOnly => (
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            Self::TransferSrc => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
            Self::TransferDst => {
                (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
            }
        }
    }
}

/// Initial contents of a freshly created shared image (RGBA byte order)
pub fn gradient_pattern(desc: &TextureDesc) -> Vec<u8> {
    let size = desc.byte_size() as usize;
    let mut data = vec![0u8; size];
    for (texel, i) in data.chunks_exact_mut(4).zip((0..size).step_by(4)) {
        texel[0] = (i % 200 + 20) as u8;
        texel[1] = (255 - i % 255) as u8;
        texel[2] = (128 + i % 127) as u8;
        texel[3] = 255;
    }
    data
}

/// The same pattern as texels in the descriptor's format
pub fn gradient_texels(desc: &TextureDesc) -> Vec<u32> {
    gradient_pattern(desc)
        .chunks_exact(4)
        .map(|px| {
            let rgba = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
            match desc.format {
                TextureFormat::Rgba8Unorm => rgba,
                TextureFormat::Bgra8Unorm => u32::from_le_bytes([px[2], px[1], px[0], px[3]]),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_desc_is_256_square_rgba8() {
        let desc = TextureDesc::default();
        assert_eq!(desc.row_pitch(), 1024);
        assert_eq!(desc.byte_size(), 256 * 256 * 4);
        assert_eq!(desc.texel_count(), 65536);
    }

    #[test]
    fn huge_extents_size_without_overflow() {
        let desc = TextureDesc::new(1 << 30, 1, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.row_pitch(), 1 << 32);
        assert_eq!(desc.byte_size(), 1 << 32);
        assert!(desc.exceeds_limit());
        assert!(!TextureDesc::default().exceeds_limit());
    }

    #[test]
    fn pack_orders_channels_per_format() {
        let color = Vec4::new(1.0, 0.0, 0.5, 1.0);
        let rgba = TextureFormat::Rgba8Unorm.pack(color);
        let bgra = TextureFormat::Bgra8Unorm.pack(color);
        assert_eq!(rgba.to_le_bytes(), [255, 0, 128, 255]);
        assert_eq!(bgra.to_le_bytes(), [128, 0, 255, 255]);
        assert_eq!(
            TextureFormat::Bgra8Unorm.unpack(bgra),
            TextureFormat::Rgba8Unorm.unpack(rgba)
        );
    }

    #[test]
    fn pack_clamps_out_of_range_channels() {
        let texel = TextureFormat::Rgba8Unorm.pack(Vec4::new(-0.25, 2.0, 0.0, 1.0));
        assert_eq!(texel.to_le_bytes(), [0, 255, 0, 255]);
    }

    #[test]
    fn gradient_matches_the_documented_formula() {
        let desc = TextureDesc::new(4, 2, TextureFormat::Rgba8Unorm);
        let data = gradient_pattern(&desc);
        assert_eq!(data.len(), 32);
        // third texel starts at byte 8
        assert_eq!(&data[8..12], &[28, 247, 136, 255]);
        let texels = gradient_texels(&desc);
        assert_eq!(texels[2].to_le_bytes(), [28, 247, 136, 255]);
    }
}
