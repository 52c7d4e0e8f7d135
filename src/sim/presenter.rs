use super::image::SimImportedImage;
use crate::error::InteropResult;
use crate::frame::{ConsumerFrameSync, FrameStats};
use crate::interop::{PresentationPipeline, SyncProtocol};
use crate::texture::ImageLayout;
use glam::Vec4;

/// Presentation pipeline without a window: samples the shared image under
/// the consumer keys and remembers what it saw
pub struct HeadlessPresenter {
    image: SimImportedImage,
    sync: ConsumerFrameSync,
    max_frames: u64,
    rendered: u64,
    last_color: Option<Vec4>,
}

impl HeadlessPresenter {
    /// Layout the sampling pass reads the image in
    pub const REQUIRED_LAYOUT: ImageLayout = ImageLayout::ShaderReadOnly;

    /// Takes the imported image and transitions it once. `max_frames == 0`
    /// never asks for shutdown.
    pub fn new(
        mut image: SimImportedImage,
        protocol: SyncProtocol,
        max_frames: u64,
    ) -> InteropResult<Self> {
        let sync = ConsumerFrameSync::new(protocol)?;
        image.prepare(Self::REQUIRED_LAYOUT)?;
        Ok(Self {
            image,
            sync,
            max_frames,
            rendered: 0,
            last_color: None,
        })
    }

    pub fn image(&self) -> &SimImportedImage {
        &self.image
    }

    pub fn stats(&self) -> FrameStats {
        self.sync.stats()
    }

    /// Center color of the last frame sampled under the mutex
    pub fn last_color(&self) -> Option<Vec4> {
        self.last_color
    }
}

impl PresentationPipeline for HeadlessPresenter {
    fn render(&mut self) -> anyhow::Result<bool> {
        let image = &self.image;
        if let Some(color) = self.sync.frame(image.keyed_mutex(), || image.center_color())? {
            self.last_color = Some(color);
        }
        self.rendered += 1;
        Ok(self.max_frames == 0 || self.rendered < self.max_frames)
    }
}
