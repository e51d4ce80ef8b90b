use proptest::prelude::*;

use sluice_core::test_stubs::{AckMode, RecordingConsumer, VecProducer};
use sluice_core::{ObjectMode, PipeOptions, Readable, TickQueue, Transform, Writable};

type Numbers = ObjectMode<u32>;

proptest! {
    #[test]
    fn writes_reach_the_consumer_in_order(
        chunks in proptest::collection::vec(any::<u32>(), 0..64),
        cork_every in 0usize..5,
        deferred in any::<bool>(),
    ) {
        let queue = TickQueue::new();
        let mode = if deferred { AckMode::Deferred(queue.handle()) } else { AckMode::Immediate };
        let (consumer, probe) = RecordingConsumer::<Numbers>::new(mode);
        let sink = Writable::<Numbers>::new(queue.handle(), consumer);

        for (index, chunk) in chunks.iter().enumerate() {
            let cork = cork_every > 0 && index % cork_every == 0;
            if cork {
                sink.cork();
            }
            sink.write(*chunk).unwrap();
            if cork {
                sink.uncork();
            }
        }
        sink.end(None).unwrap();
        queue.run_until_idle();

        prop_assert_eq!(probe.received(), chunks);
        prop_assert!(sink.is_finished());
    }

    #[test]
    fn write_reports_backpressure_exactly_at_the_threshold(
        count in 1usize..40,
        high_water_mark in 1usize..20,
    ) {
        let queue = TickQueue::new();
        let (consumer, _probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
        let sink = Writable::<Numbers>::builder(queue.handle())
            .high_water_mark(high_water_mark)
            .build(consumer);

        for written in 1..=count {
            let below = sink.write(written as u32).unwrap();
            prop_assert_eq!(below, written < high_water_mark);
        }
    }

    #[test]
    fn piped_transform_preserves_order(
        chunks in proptest::collection::vec(0u32..1000, 0..48),
        sink_threshold in 1usize..5,
        output_threshold in 1usize..5,
    ) {
        let queue = TickQueue::new();
        let source = Readable::<Numbers>::new(queue.handle(), VecProducer::new(chunks.clone()));
        let identity = Transform::<Numbers, Numbers>::builder(queue.handle())
            .readable_high_water_mark(output_threshold)
            .build(|n: u32, output: sluice_core::TransformOutput<Numbers>| {
                match output.push(n) {
                    Ok(_) => output.done(),
                    Err(err) => output.fail(err),
                }
            });
        let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Deferred(queue.handle()));
        let sink = Writable::<Numbers>::builder(queue.handle())
            .high_water_mark(sink_threshold)
            .build(consumer);

        source.pipe(identity.writable(), PipeOptions::default());
        identity.readable().pipe(&sink, PipeOptions::default());
        queue.run_until_idle();

        prop_assert_eq!(probe.received(), chunks);
        prop_assert!(sink.is_finished());
        prop_assert!(identity.is_closed());
    }
}
