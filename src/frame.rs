// Frame synchronizer
//
// Producer, per frame:   acquire -> advance + clear -> release
// Consumer, per frame:   acquire -> sample -> release
// Consumer, once:        Undefined -> pipeline layout (one-shot barrier)
//
// Layout transitions are paid once per side at setup. Ownership of the bytes
// moves every frame through the keyed mutex only.

use crate::error::{InteropError, InteropResult};
use crate::interop::{AcquireStatus, KeyedMutex, ReleaseStatus, SharedImageProducer, SyncProtocol};
use crate::texture::ImageLayout;
use glam::Vec4;

/// Animated blue channel written by the producer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelAnimation {
    value: f32,
    step: f32,
    wraps: u32,
}

impl ChannelAnimation {
    pub const DEFAULT_STEP: f32 = 0.0003;

    /// A NaN `initial` starts from the top of the range
    pub fn new(initial: f32, step: f32) -> Self {
        let value = if initial.is_nan() { 1.0 } else { initial.clamp(0.0, 1.0) };
        Self {
            value,
            step,
            wraps: 0,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn wraps(&self) -> u32 {
        self.wraps
    }

    /// Decrement by one step, wrapping modularly back into [0, 1)
    pub fn advance(&mut self) -> f32 {
        let next = self.value - self.step;
        if next < 0.0 {
            // Steps above 1.0 cross zero more than once
            self.wraps += (-next.div_euclid(1.0)) as u32;
        }
        // f32 rounding of (1.0 - tiny) can land exactly on 1.0
        self.value = next.rem_euclid(1.0).clamp(0.0, 1.0);
        self.value
    }

    pub fn color(&self) -> Vec4 {
        Vec4::new(0.0, 0.0, self.value, 1.0)
    }
}

impl Default for ChannelAnimation {
    fn default() -> Self {
        Self::new(1.0, Self::DEFAULT_STEP)
    }
}

/// Per-side counters of the keyed-mutex protocol
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub acquired: u64,
    pub timed_out: u64,
    /// Releases that followed a successful acquire
    pub released: u64,
    /// Releases attempted after a timeout
    pub heartbeats: u64,
    /// Heartbeats the mutex answered with `NotHeld`
    pub not_held: u64,
}

impl FrameStats {
    /// Every successful acquire was followed by exactly one release
    pub fn is_balanced(&self) -> bool {
        self.acquired == self.released
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// Mutex held, image written with this channel value
    Written { value: f32 },
    /// Acquire timed out; nothing touched this frame
    Skipped,
    /// Unsynchronized mode: no per-frame work
    Static,
}

fn release_after_acquire<M: KeyedMutex + ?Sized>(
    mutex: &M,
    key: u64,
    stats: &mut FrameStats,
) -> InteropResult<()> {
    match mutex.release(key)? {
        ReleaseStatus::Released => {
            stats.released += 1;
            Ok(())
        }
        ReleaseStatus::NotHeld => Err(InteropError::sync_fatal(
            "release",
            "mutex reported not held right after a successful acquire",
        )),
    }
}

fn heartbeat<M: KeyedMutex + ?Sized>(
    mutex: &M,
    key: u64,
    stats: &mut FrameStats,
) -> InteropResult<()> {
    stats.heartbeats += 1;
    if mutex.release(key)? == ReleaseStatus::NotHeld {
        log::trace!("heartbeat release with key {} found the mutex not held", key);
        stats.not_held += 1;
    }
    Ok(())
}

fn warn_if_unsynchronized(protocol: &SyncProtocol, side: &str) {
    if !protocol.is_synchronized() {
        log::warn!(
            "{} running without per-frame keyed-mutex synchronization (static texture)",
            side
        );
    }
}

/// Producer half of the frame protocol; owns the animated clear value
#[derive(Debug)]
pub struct ProducerFrameSync {
    protocol: SyncProtocol,
    animation: ChannelAnimation,
    stats: FrameStats,
}

impl ProducerFrameSync {
    pub fn new(protocol: SyncProtocol, animation: ChannelAnimation) -> InteropResult<Self> {
        protocol.validate()?;
        warn_if_unsynchronized(&protocol, "producer");
        Ok(Self {
            protocol,
            animation,
            stats: FrameStats::default(),
        })
    }

    pub fn protocol(&self) -> &SyncProtocol {
        &self.protocol
    }

    pub fn animation(&self) -> &ChannelAnimation {
        &self.animation
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn tick<P: SharedImageProducer + ?Sized>(
        &mut self,
        producer: &mut P,
    ) -> InteropResult<FrameOutcome> {
        self.stats.frames += 1;
        if !self.protocol.is_synchronized() {
            return Ok(FrameOutcome::Static);
        }

        let keys = self.protocol.producer;
        match producer
            .keyed_mutex()
            .acquire(keys.acquire, self.protocol.timeout)?
        {
            AcquireStatus::Acquired => {
                self.stats.acquired += 1;
                let value = self.animation.advance();

                // Release even when the write failed, then report the write
                let written = producer.clear(self.animation.color());
                let released =
                    release_after_acquire(producer.keyed_mutex(), keys.release, &mut self.stats);
                written?;
                released?;

                Ok(FrameOutcome::Written { value })
            }
            AcquireStatus::TimedOut => {
                self.stats.timed_out += 1;
                log::debug!(
                    "producer acquire (key {}) timed out after {:?}, skipping frame {}",
                    keys.acquire,
                    self.protocol.timeout,
                    self.stats.frames
                );
                if self.protocol.release_on_timeout {
                    heartbeat(producer.keyed_mutex(), keys.release, &mut self.stats)?;
                }
                Ok(FrameOutcome::Skipped)
            }
        }
    }
}

/// Consumer half of the frame protocol
#[derive(Debug)]
pub struct ConsumerFrameSync {
    protocol: SyncProtocol,
    stats: FrameStats,
}

impl ConsumerFrameSync {
    pub fn new(protocol: SyncProtocol) -> InteropResult<Self> {
        protocol.validate()?;
        warn_if_unsynchronized(&protocol, "consumer");
        Ok(Self {
            protocol,
            stats: FrameStats::default(),
        })
    }

    pub fn protocol(&self) -> &SyncProtocol {
        &self.protocol
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Run `sample` while holding the mutex.
    ///
    /// Returns `None` when the acquire timed out and nothing was sampled.
    pub fn frame<M, T, F>(&mut self, mutex: &M, sample: F) -> InteropResult<Option<T>>
    where
        M: KeyedMutex + ?Sized,
        F: FnOnce() -> T,
    {
        self.stats.frames += 1;
        if !self.protocol.is_synchronized() {
            return Ok(Some(sample()));
        }

        let keys = self.protocol.consumer;
        match mutex.acquire(keys.acquire, self.protocol.timeout)? {
            AcquireStatus::Acquired => {
                self.stats.acquired += 1;
                let sampled = sample();
                release_after_acquire(mutex, keys.release, &mut self.stats)?;
                Ok(Some(sampled))
            }
            AcquireStatus::TimedOut => {
                self.stats.timed_out += 1;
                log::debug!(
                    "consumer acquire (key {}) timed out, keeping previous frame",
                    keys.acquire
                );
                if self.protocol.release_on_timeout {
                    heartbeat(mutex, keys.release, &mut self.stats)?;
                }
                Ok(None)
            }
        }
    }
}

/// One side's view of an image's layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutState {
    current: ImageLayout,
    transitions: u32,
}

impl LayoutState {
    pub fn new() -> Self {
        Self {
            current: ImageLayout::Undefined,
            transitions: 0,
        }
    }

    pub fn current(&self) -> ImageLayout {
        self.current
    }

    /// Number of barriers recorded over the resource lifetime
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// The (old, new) barrier needed to reach `target`, if any
    pub fn plan(&self, target: ImageLayout) -> Option<(ImageLayout, ImageLayout)> {
        (self.current != target).then_some((self.current, target))
    }

    /// Record that the barrier to `target` completed
    pub fn commit(&mut self, target: ImageLayout) {
        self.current = target;
        self.transitions += 1;
    }
}

impl Default for LayoutState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::SyncMode;
    use crate::texture::TextureDesc;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    /// Scripted mutex: answers acquires from a queue, records every call
    struct ScriptedMutex {
        acquires: RefCell<Vec<AcquireStatus>>,
        held: Cell<bool>,
        log: RefCell<Vec<String>>,
    }

    impl ScriptedMutex {
        fn new(mut script: Vec<AcquireStatus>) -> Self {
            script.reverse();
            Self {
                acquires: RefCell::new(script),
                held: Cell::new(false),
                log: RefCell::new(Vec::new()),
            }
        }
    }

    impl KeyedMutex for ScriptedMutex {
        fn acquire(&self, key: u64, _timeout: Duration) -> InteropResult<AcquireStatus> {
            let status = self
                .acquires
                .borrow_mut()
                .pop()
                .unwrap_or(AcquireStatus::Acquired);
            if status == AcquireStatus::Acquired {
                self.held.set(true);
            }
            self.log.borrow_mut().push(format!("acquire({key})"));
            Ok(status)
        }

        fn release(&self, key: u64) -> InteropResult<ReleaseStatus> {
            self.log.borrow_mut().push(format!("release({key})"));
            if self.held.replace(false) {
                Ok(ReleaseStatus::Released)
            } else {
                Ok(ReleaseStatus::NotHeld)
            }
        }
    }

    struct FakeProducer {
        mutex: ScriptedMutex,
        clears: Vec<Vec4>,
        fail_clear: bool,
    }

    impl FakeProducer {
        fn new(script: Vec<AcquireStatus>) -> Self {
            Self {
                mutex: ScriptedMutex::new(script),
                clears: Vec::new(),
                fail_clear: false,
            }
        }
    }

    impl SharedImageProducer for FakeProducer {
        type Mutex = ScriptedMutex;

        fn desc(&self) -> TextureDesc {
            TextureDesc::default()
        }

        fn shared_handle(&self) -> crate::interop::SharedHandle {
            unimplemented!("not needed by the frame protocol")
        }

        fn keyed_mutex(&self) -> &ScriptedMutex {
            &self.mutex
        }

        fn clear(&mut self, color: Vec4) -> InteropResult<()> {
            if self.fail_clear {
                return Err(InteropError::sync_fatal("clear", "device removed"));
            }
            self.clears.push(color);
            Ok(())
        }
    }

    #[test]
    fn animation_wraps_into_unit_range() {
        let mut anim = ChannelAnimation::new(0.0005, 0.0003);
        assert!((anim.advance() - 0.0002).abs() < 1e-6);
        let wrapped = anim.advance();
        assert!(wrapped > 0.99 && wrapped < 1.0);
        assert_eq!(anim.wraps(), 1);
    }

    #[test]
    fn animation_clamps_initial_value() {
        assert_eq!(ChannelAnimation::new(1.7, 0.1).value(), 1.0);
        assert_eq!(ChannelAnimation::new(-3.0, 0.1).value(), 0.0);
    }

    #[test]
    fn nan_initial_value_starts_at_the_top() {
        let mut anim = ChannelAnimation::new(f32::NAN, 0.25);
        assert_eq!(anim.value(), 1.0);
        assert_eq!(anim.advance(), 0.75);
    }

    #[test]
    fn steps_larger_than_the_range_wrap_repeatedly() {
        let mut anim = ChannelAnimation::new(0.5, 2.25);
        assert_eq!(anim.advance(), 0.25);
        assert_eq!(anim.wraps(), 2);
        assert!((0.0..=1.0).contains(&anim.value()));
    }

    #[test]
    fn acquired_frame_writes_then_releases() {
        let mut producer = FakeProducer::new(vec![AcquireStatus::Acquired]);
        let mut sync =
            ProducerFrameSync::new(SyncProtocol::shared_zero(), ChannelAnimation::default())
                .unwrap();

        let outcome = sync.tick(&mut producer).unwrap();
        assert!(
            matches!(outcome, FrameOutcome::Written { value } if (value - 0.9997).abs() < 1e-6)
        );
        assert_eq!(producer.clears.len(), 1);
        assert_eq!(*producer.mutex.log.borrow(), vec!["acquire(0)", "release(0)"]);
        assert!(sync.stats().is_balanced());
    }

    #[test]
    fn timed_out_frame_skips_the_write_and_sends_heartbeat() {
        let mut producer = FakeProducer::new(vec![AcquireStatus::TimedOut]);
        let mut sync =
            ProducerFrameSync::new(SyncProtocol::alternating(), ChannelAnimation::default())
                .unwrap();

        assert_eq!(sync.tick(&mut producer).unwrap(), FrameOutcome::Skipped);
        assert!(producer.clears.is_empty());
        assert_eq!(*producer.mutex.log.borrow(), vec!["acquire(0)", "release(1)"]);

        let stats = sync.stats();
        assert_eq!((stats.timed_out, stats.heartbeats, stats.not_held), (1, 1, 1));
        assert_eq!(sync.animation().value(), 1.0);
    }

    #[test]
    fn timed_out_frame_without_heartbeat_touches_nothing() {
        let mut producer = FakeProducer::new(vec![AcquireStatus::TimedOut]);
        let protocol = SyncProtocol::shared_zero().with_release_on_timeout(false);
        let mut sync = ProducerFrameSync::new(protocol, ChannelAnimation::default()).unwrap();

        sync.tick(&mut producer).unwrap();
        assert_eq!(*producer.mutex.log.borrow(), vec!["acquire(0)"]);
    }

    #[test]
    fn failed_write_still_releases() {
        let mut producer = FakeProducer::new(vec![AcquireStatus::Acquired]);
        producer.fail_clear = true;
        let mut sync =
            ProducerFrameSync::new(SyncProtocol::shared_zero(), ChannelAnimation::default())
                .unwrap();

        let err = sync.tick(&mut producer).unwrap_err();
        assert!(matches!(err, InteropError::SyncFatal { .. }));
        assert_eq!(*producer.mutex.log.borrow(), vec!["acquire(0)", "release(0)"]);
    }

    #[test]
    fn unsynchronized_mode_does_nothing_per_frame() {
        let mut producer = FakeProducer::new(vec![]);
        let protocol = SyncProtocol::shared_zero().with_mode(SyncMode::Unsynchronized);
        let mut sync = ProducerFrameSync::new(protocol, ChannelAnimation::default()).unwrap();

        assert_eq!(sync.tick(&mut producer).unwrap(), FrameOutcome::Static);
        assert!(producer.mutex.log.borrow().is_empty());
        assert_eq!(sync.stats().frames, 1);
    }

    #[test]
    fn consumer_samples_only_while_holding() {
        let mutex = ScriptedMutex::new(vec![AcquireStatus::Acquired, AcquireStatus::TimedOut]);
        let mut sync = ConsumerFrameSync::new(SyncProtocol::alternating()).unwrap();

        assert_eq!(sync.frame(&mutex, || 7).unwrap(), Some(7));
        assert_eq!(sync.frame(&mutex, || 8).unwrap(), None);
        assert_eq!(
            *mutex.log.borrow(),
            vec!["acquire(1)", "release(0)", "acquire(1)", "release(0)"]
        );
        assert!(sync.stats().is_balanced());
    }

    #[test]
    fn layout_plan_is_empty_once_reached() {
        let mut state = LayoutState::new();
        assert_eq!(
            state.plan(ImageLayout::ShaderReadOnly),
            Some((ImageLayout::Undefined, ImageLayout::ShaderReadOnly))
        );
        state.commit(ImageLayout::ShaderReadOnly);
        assert_eq!(state.plan(ImageLayout::ShaderReadOnly), None);
        assert_eq!(state.transitions(), 1);
    }
}
