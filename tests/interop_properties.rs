// Cross-device properties of the shared texture, on the simulated platform

use glam::Vec4;
use proptest::prelude::*;
use shared_texture::frame::{ChannelAnimation, ConsumerFrameSync, ProducerFrameSync};
use shared_texture::interop::{
    KeyedMutex, SharedImageImporter, SharedImageProducer, SyncProtocol,
};
use shared_texture::sim::{RunSummary, SimAdapterInfo, SimMemoryType, SimPlatform, SimSession};
use shared_texture::texture::{ImageLayout, TextureDesc, TextureFormat};
use shared_texture::InteropError;
use std::thread;
use std::time::Duration;

fn small_desc() -> TextureDesc {
    TextureDesc::new(64, 64, TextureFormat::Rgba8Unorm)
}

#[test]
fn consumer_never_observes_a_partial_write() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();

    let mut image = producer.create_shared_image(desc).unwrap();
    let mut imported = consumer
        .import_shared_image(&image.shared_handle(), desc)
        .unwrap();
    imported.prepare(ImageLayout::ShaderReadOnly).unwrap();

    let protocol = SyncProtocol::shared_zero().with_timeout(Duration::from_millis(50));
    let mut producer_sync =
        ProducerFrameSync::new(protocol, ChannelAnimation::new(1.0, 0.0003)).unwrap();
    // Replace the gradient before the consumer starts looking
    producer_sync.tick(&mut image).unwrap();

    let writer = thread::spawn(move || {
        for _ in 0..2000 {
            producer_sync.tick(&mut image).unwrap();
            thread::yield_now();
        }
        (producer_sync.stats(), image)
    });

    let mut consumer_sync = ConsumerFrameSync::new(protocol).unwrap();
    let mut last_blue = 1.0f32;
    let mut sampled = 0;
    for _ in 0..500 {
        let Some(texels) = consumer_sync
            .frame(imported.keyed_mutex(), || imported.sample())
            .unwrap()
        else {
            continue;
        };
        let first = texels[0];
        assert!(texels.iter().all(|&t| t == first), "torn frame observed");

        let blue = desc.format.unpack(first).z;
        assert!(blue <= last_blue, "blue went back from {} to {}", last_blue, blue);
        last_blue = blue;
        sampled += 1;
    }

    let (producer_stats, _image) = writer.join().unwrap();
    assert!(sampled > 0);
    assert!(producer_stats.is_balanced());
    assert!(consumer_sync.stats().is_balanced());
}

#[test]
fn every_handle_of_an_image_aliases_the_same_memory() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();
    let mut image = producer.create_shared_image(desc).unwrap();

    assert_eq!(image.shared_handle(), image.shared_handle());
    let extra = image.issue_handle();
    assert_ne!(extra, image.shared_handle());

    let a = consumer.import_shared_image(&image.shared_handle(), desc).unwrap();
    let b = consumer.import_shared_image(&extra, desc).unwrap();
    assert!(a.aliases(&b));
    assert!(a.is_backed_by(&image));

    let color = Vec4::new(0.0, 0.0, 0.5, 1.0);
    image.clear(color).unwrap();
    let expected = desc.format.pack(color);
    assert_eq!(a.texel(3, 7), Some(expected));
    assert_eq!(b.texel(3, 7), Some(expected));
}

#[test]
fn rejected_import_leaves_the_allocation_untouched() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();
    let image = producer.create_shared_image(desc).unwrap();
    let before = image.read_texels();

    let wrong = TextureDesc::new(32, 64, TextureFormat::Rgba8Unorm);
    let err = consumer
        .import_shared_image(&image.shared_handle(), wrong)
        .unwrap_err();
    assert!(matches!(err, InteropError::Import(_)));
    assert_eq!(err.stage(), "handle import");
    assert_eq!(image.read_texels(), before);

    let imported = consumer
        .import_shared_image(&image.shared_handle(), desc)
        .unwrap();
    assert_eq!(imported.sample(), before);
}

#[test]
fn repeated_setup_leaks_no_command_buffers() {
    let platform = SimPlatform::default();
    let desc = TextureDesc::new(8, 8, TextureFormat::Bgra8Unorm);

    for _ in 0..100 {
        let mut session = SimSession::new(
            platform.clone(),
            desc,
            SyncProtocol::shared_zero(),
            ChannelAnimation::default(),
            10,
        )
        .unwrap();
        assert!(session.step().unwrap());
        assert!(session.step().unwrap());

        let consumer = session.consumer_device();
        assert_eq!(consumer.one_shot_submissions(), 1);
        assert_eq!(consumer.live_command_buffers(), 0);
        assert_eq!(session.producer_device().live_command_buffers(), 0);
    }
}

fn run_default_scenario(initial: f32) -> (SimSession, RunSummary) {
    let mut session = SimSession::new(
        SimPlatform::default(),
        TextureDesc::default(),
        SyncProtocol::shared_zero(),
        ChannelAnimation::new(initial, ChannelAnimation::DEFAULT_STEP),
        10_000,
    )
    .unwrap();
    let summary = session.run().unwrap();
    (session, summary)
}

#[test]
fn long_run_from_mid_range_wraps_three_times() {
    let (session, summary) = run_default_scenario(0.5);
    assert_eq!(summary.frames, 10_000);
    assert_eq!(summary.wraps, 3);
    assert!((0.0..=1.0).contains(&summary.final_value));
    assert_eq!(summary.producer.acquired, 10_000);
    assert!(summary.producer.is_balanced() && summary.consumer.is_balanced());

    let desc = TextureDesc::default();
    let seen = session.presenter().last_color().unwrap();
    assert_eq!(
        desc.format.pack(seen),
        desc.format.pack(session.animation().color())
    );
}

#[test]
fn long_run_from_the_default_start_wraps_twice() {
    let (_session, summary) = run_default_scenario(1.0);
    assert_eq!(summary.wraps, 2);
    assert!((0.0..=1.0).contains(&summary.final_value));
    assert!(summary.producer.is_balanced() && summary.consumer.is_balanced());
}

#[test]
fn closing_a_handle_keeps_bound_memory_alive() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();
    let mut image = producer.create_shared_image(desc).unwrap();
    let handle = image.shared_handle();

    let imported = consumer.import_shared_image(&handle, desc).unwrap();
    assert!(platform.close_handle(&handle));
    assert!(!platform.close_handle(&handle));

    let color = Vec4::new(0.0, 0.0, 0.25, 1.0);
    image.clear(color).unwrap();
    assert_eq!(imported.texel(0, 0), Some(desc.format.pack(color)));

    let err = consumer.import_shared_image(&handle, desc).unwrap_err();
    assert!(err.to_string().contains("not open"));
}

#[test]
fn destroyed_allocation_makes_its_handles_stale() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();
    let image = producer.create_shared_image(desc).unwrap();
    let handle = image.shared_handle();
    let open = platform.open_handles();
    drop(image);

    assert_eq!(platform.open_handles(), open - 1);
    assert!(consumer.import_shared_image(&handle, desc).is_err());
}

#[test]
fn device_loss_is_fatal_for_both_sides() {
    let platform = SimPlatform::default();
    let producer = platform.create_device("producer").unwrap();
    let consumer = platform.create_device("consumer").unwrap();
    let desc = small_desc();
    let mut image = producer.create_shared_image(desc).unwrap();
    let imported = consumer.import_shared_image(&image.shared_handle(), desc).unwrap();

    consumer.lose();
    let err = imported
        .keyed_mutex()
        .acquire(0, Duration::from_millis(1))
        .unwrap_err();
    assert!(matches!(err, InteropError::SyncFatal { .. }));

    producer.lose();
    let err = image.clear(Vec4::ONE).unwrap_err();
    assert_eq!(err.stage(), "keyed synchronization");
}

#[test]
fn platforms_without_interop_fail_at_the_right_stage() {
    let no_queue =
        SimPlatform::new(vec![SimAdapterInfo::discrete("headless").without_graphics_queue()]);
    let err = no_queue.create_device("producer").unwrap_err();
    assert!(matches!(err, InteropError::DeviceCreation(_)));

    let no_sharing =
        SimPlatform::new(vec![SimAdapterInfo::discrete("basic").without_shared_resources()]);
    let device = no_sharing.create_device("producer").unwrap();
    let err = device.create_shared_image(small_desc()).unwrap_err();
    assert!(matches!(err, InteropError::Allocation(_)));

    let host_only = SimPlatform::new(vec![SimAdapterInfo::discrete("host").with_memory_types(vec![
        SimMemoryType {
            device_local: false,
            importable: true,
        },
    ])]);
    let producer = host_only.create_device("producer").unwrap();
    let consumer = host_only.create_device("consumer").unwrap();
    let image = producer.create_shared_image(small_desc()).unwrap();
    let err = consumer
        .import_shared_image(&image.shared_handle(), small_desc())
        .unwrap_err();
    assert!(matches!(err, InteropError::Import(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_timing_keeps_both_sides_balanced(
        alternating in any::<bool>(),
        timeout_ms in 0u64..3,
        producer_pause_us in 0u64..300,
        consumer_pause_us in 0u64..300,
        release_on_timeout in any::<bool>(),
    ) {
        const FRAMES: u64 = 60;

        let platform = SimPlatform::default();
        let producer = platform.create_device("producer").unwrap();
        let consumer = platform.create_device("consumer").unwrap();
        let desc = TextureDesc::new(16, 16, TextureFormat::Rgba8Unorm);
        let mut image = producer.create_shared_image(desc).unwrap();
        let imported = consumer.import_shared_image(&image.shared_handle(), desc).unwrap();

        let base = if alternating {
            SyncProtocol::alternating()
        } else {
            SyncProtocol::shared_zero()
        };
        let protocol = base
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_release_on_timeout(release_on_timeout);

        let mut producer_sync =
            ProducerFrameSync::new(protocol, ChannelAnimation::default()).unwrap();
        let writer = thread::spawn(move || {
            for _ in 0..FRAMES {
                producer_sync.tick(&mut image).unwrap();
                thread::sleep(Duration::from_micros(producer_pause_us));
            }
            (producer_sync.stats(), image)
        });

        let mut consumer_sync = ConsumerFrameSync::new(protocol).unwrap();
        for _ in 0..FRAMES {
            consumer_sync.frame(imported.keyed_mutex(), || imported.center_color()).unwrap();
            thread::sleep(Duration::from_micros(consumer_pause_us));
        }

        let (producer_stats, _image) = writer.join().unwrap();
        let consumer_stats = consumer_sync.stats();

        prop_assert_eq!(producer_stats.frames, FRAMES);
        prop_assert_eq!(consumer_stats.frames, FRAMES);
        prop_assert!(producer_stats.is_balanced());
        prop_assert!(consumer_stats.is_balanced());
        prop_assert_eq!(producer_stats.acquired + producer_stats.timed_out, FRAMES);
        prop_assert_eq!(consumer_stats.acquired + consumer_stats.timed_out, FRAMES);
        prop_assert!(!imported.keyed_mutex().is_held());
    }
}
