// Producer + consumer wired together on one simulated platform
//
// Setup order: producer device -> shared image -> consumer device -> import
// -> one-shot transition. Fields are declared in reverse so the consumer's
// imported objects drop before the producer's memory.

use super::image::SimSharedImage;
use super::platform::{SimDevice, SimPlatform};
use super::presenter::HeadlessPresenter;
use crate::config::Config;
use crate::error::InteropResult;
use crate::frame::{ChannelAnimation, FrameStats, ProducerFrameSync};
use crate::interop::{PresentationPipeline, SharedImageImporter, SharedImageProducer, SyncProtocol};
use crate::texture::TextureDesc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub producer: FrameStats,
    pub consumer: FrameStats,
    pub wraps: u32,
    pub final_value: f32,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames | producer: {} written, {} timed out, {} heartbeats | \
             consumer: {} sampled, {} timed out | blue = {:.4} after {} wraps",
            self.frames,
            self.producer.acquired,
            self.producer.timed_out,
            self.producer.heartbeats,
            self.consumer.acquired,
            self.consumer.timed_out,
            self.final_value,
            self.wraps
        )
    }
}

pub struct SimSession {
    presenter: HeadlessPresenter,
    consumer: SimDevice,
    producer_sync: ProducerFrameSync,
    image: SimSharedImage,
    producer: SimDevice,
    platform: SimPlatform,
    frames: u64,
    stats_interval: u64,
}

impl SimSession {
    pub fn new(
        platform: SimPlatform,
        desc: TextureDesc,
        protocol: SyncProtocol,
        animation: ChannelAnimation,
        max_frames: u64,
    ) -> InteropResult<Self> {
        let producer = platform.create_device("producer")?;
        let image = producer.create_shared_image(desc)?;
        let producer_sync = ProducerFrameSync::new(protocol, animation)?;

        let consumer = platform.create_device("consumer")?;
        let imported = consumer.import_shared_image(&image.shared_handle(), desc)?;
        let presenter = HeadlessPresenter::new(imported, protocol, max_frames)?;

        Ok(Self {
            presenter,
            consumer,
            producer_sync,
            image,
            producer,
            platform,
            frames: 0,
            stats_interval: 0,
        })
    }

    pub fn from_config(config: &Config, max_frames: u64) -> InteropResult<Self> {
        let mut session = Self::new(
            SimPlatform::default(),
            config.texture_desc(),
            config.protocol(),
            config.animation(),
            max_frames,
        )?;
        session.stats_interval = config.run.stats_interval;
        Ok(session)
    }

    /// One producer tick followed by one consumer frame
    pub fn step(&mut self) -> anyhow::Result<bool> {
        self.producer_sync.tick(&mut self.image)?;
        let keep_going = self.presenter.render()?;
        self.frames += 1;

        if self.stats_interval > 0 && self.frames % self.stats_interval == 0 {
            let stats = self.producer_sync.stats();
            log::info!(
                "frame {}: blue = {:.4}, {} written, {} timed out",
                self.frames,
                self.producer_sync.animation().value(),
                stats.acquired,
                stats.timed_out
            );
        }
        Ok(keep_going)
    }

    /// Step until the presenter asks to stop
    pub fn run(&mut self) -> anyhow::Result<RunSummary> {
        while self.step()? {}
        Ok(self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            frames: self.frames,
            producer: self.producer_sync.stats(),
            consumer: self.presenter.stats(),
            wraps: self.producer_sync.animation().wraps(),
            final_value: self.producer_sync.animation().value(),
        }
    }

    pub fn presenter(&self) -> &HeadlessPresenter {
        &self.presenter
    }

    pub fn animation(&self) -> &ChannelAnimation {
        self.producer_sync.animation()
    }

    pub fn producer_image(&self) -> &SimSharedImage {
        &self.image
    }

    pub fn producer_device(&self) -> &SimDevice {
        &self.producer
    }

    pub fn consumer_device(&self) -> &SimDevice {
        &self.consumer
    }

    pub fn platform(&self) -> &SimPlatform {
        &self.platform
    }
}
