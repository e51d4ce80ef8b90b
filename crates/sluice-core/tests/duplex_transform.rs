mod common;

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::test_stubs::{AckMode, EventLog, RecordingConsumer, VecProducer};
use sluice_core::{
    Duplex, Mapper, ObjectMode, Readable, StreamError, TickQueue, Transform, TransformOutput,
};

type Words = ObjectMode<String>;
type Numbers = ObjectMode<u32>;

fn upper_case(queue: &TickQueue) -> Transform<Words, Words> {
    Transform::new(
        queue.handle(),
        |chunk: String, output: TransformOutput<Words>| match output.push(chunk.to_uppercase()) {
            Ok(_) => output.done(),
            Err(err) => output.fail(err),
        },
    )
}

fn collect<M: sluice_core::ChunkMode>(source: &Readable<M>) -> Rc<RefCell<Vec<M::Chunk>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    source.on_data(move |chunk| sink.borrow_mut().push(chunk.clone()));
    seen
}

#[test]
fn transform_maps_in_order_and_closes_both_sides() {
    common::init_tracing();
    let queue = TickQueue::new();
    let upper = upper_case(&queue);
    let out = collect(upper.readable());

    for word in ["a", "b", "c"] {
        upper.write(word.to_owned()).unwrap();
    }
    upper.end(None).unwrap();
    queue.run_until_idle();

    assert_eq!(*out.borrow(), vec!["A", "B", "C"]);
    assert!(upper.writable().is_finished());
    assert!(upper.readable().is_end_emitted());
    assert!(upper.is_closed());
}

#[test]
fn mapping_is_single_flight() {
    let queue = TickQueue::new();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let parked: Rc<RefCell<Vec<TransformOutput<Numbers>>>> = Rc::new(RefCell::new(Vec::new()));
    let transform = {
        let calls = Rc::clone(&calls);
        let parked = Rc::clone(&parked);
        Transform::<Numbers, Numbers>::new(
            queue.handle(),
            move |chunk: u32, output: TransformOutput<Numbers>| {
                calls.borrow_mut().push(chunk);
                parked.borrow_mut().push(output);
            },
        )
    };

    transform.write(1).unwrap();
    transform.write(2).unwrap();
    queue.run_until_idle();
    assert_eq!(*calls.borrow(), vec![1], "second input waits for the first");

    let first = parked.borrow_mut().pop().expect("first mapping is parked");
    first.push(10).unwrap();
    first.done();
    queue.run_until_idle();
    assert_eq!(*calls.borrow(), vec![1, 2]);
    assert_eq!(transform.read(None), Some(10));
}

#[test]
fn saturated_output_holds_back_input() {
    let queue = TickQueue::new();
    let doubler = Transform::<Numbers, Numbers>::builder(queue.handle())
        .readable_high_water_mark(2)
        .build(|chunk: u32, output: TransformOutput<Numbers>| {
            match output.push(chunk * 2) {
                Ok(_) => output.done(),
                Err(err) => output.fail(err),
            }
        });

    for n in 1..=5 {
        doubler.write(n).unwrap();
    }
    queue.run_until_idle();
    assert_eq!(doubler.readable().readable_length(), 2);
    assert_eq!(doubler.writable().writable_length(), 4);

    assert_eq!(doubler.read(None), Some(2));
    queue.run_until_idle();
    assert_eq!(doubler.readable().readable_length(), 2);
    assert_eq!(doubler.writable().writable_length(), 3);
}

/// 统计字节总数，在 flush 时输出。
struct Counter {
    total: usize,
}

impl Mapper<Words, Numbers> for Counter {
    fn map(&mut self, chunk: String, output: TransformOutput<Numbers>) {
        self.total += chunk.len();
        output.done();
    }

    fn flush(&mut self, output: TransformOutput<Numbers>) {
        match output.push(self.total as u32) {
            Ok(_) => output.done(),
            Err(err) => output.fail(err),
        }
    }
}

#[test]
fn flush_runs_after_last_input_and_before_end() {
    let queue = TickQueue::new();
    let counter = Transform::<Words, Numbers>::new(queue.handle(), Counter { total: 0 });
    let out = collect(counter.readable());
    let log = EventLog::new();
    log.attach_source(counter.readable(), "out");
    log.attach_sink(counter.writable(), "in");

    counter.write("abc".to_owned()).unwrap();
    counter.end(Some("de".to_owned())).unwrap();
    queue.run_until_idle();

    assert_eq!(*out.borrow(), vec![5]);
    let entries = log.entries();
    let prefinish = entries.iter().position(|e| e == "in:prefinish");
    let end = entries.iter().position(|e| e == "out:end");
    assert!(prefinish.is_some() && end.is_some());
    assert!(prefinish < end, "flush completes before the output ends: {entries:?}");
}

#[test]
fn mapping_failure_destroys_the_transform() {
    let queue = TickQueue::new();
    let failing = Transform::<Numbers, Numbers>::new(
        queue.handle(),
        |_: u32, output: TransformOutput<Numbers>| output.fail(StreamError::consumer("bad input")),
    );
    let log = EventLog::new();
    log.attach_source(failing.readable(), "out");
    log.attach_sink(failing.writable(), "in");

    assert_eq!(failing.write(1), Ok(false));
    queue.run_until_idle();

    assert!(failing.is_destroyed());
    assert_eq!(log.count("in:error"), 1);
    assert_eq!(log.count("out:error"), 1);
    assert_eq!(log.count("in:close"), 1);
    assert_eq!(log.count("out:close"), 1);
}

#[test]
fn pass_through_forwards_unchanged() {
    let queue = TickQueue::new();
    let identity = Transform::<Numbers, Numbers>::pass_through(queue.handle());
    let out = collect(identity.readable());
    for n in [3, 1, 2] {
        identity.write(n).unwrap();
    }
    identity.end(None).unwrap();
    queue.run_until_idle();
    assert_eq!(*out.borrow(), vec![3, 1, 2]);
}

#[test]
fn half_open_duplex_keeps_writing_after_read_side_ends() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Immediate);
    let duplex = Duplex::<Numbers, Numbers>::new(queue.handle(), VecProducer::new([1, 2]), consumer);
    let out = collect(duplex.readable());
    queue.run_until_idle();

    assert_eq!(*out.borrow(), vec![1, 2]);
    assert!(duplex.readable().is_end_emitted());
    assert!(!duplex.writable().is_ending());
    assert!(!duplex.is_destroyed());

    duplex.write(9).unwrap();
    duplex.end(None).unwrap();
    queue.run_until_idle();
    assert_eq!(probe.received(), vec![9]);
    assert!(duplex.is_destroyed());
    assert!(duplex.is_closed());
}

#[test]
fn closed_duplex_ends_write_side_with_read_side() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Immediate);
    let duplex = Duplex::<Numbers, Numbers>::builder(queue.handle())
        .allow_half_open(false)
        .build(VecProducer::new([4]), consumer);
    let log = EventLog::new();
    log.attach_sink(duplex.writable(), "w");
    duplex.write(8).unwrap();
    let _out = collect(duplex.readable());
    queue.run_until_idle();

    assert_eq!(probe.received(), vec![8]);
    assert!(duplex.writable().is_finished());
    assert_eq!(log.count("w:finish"), 1);
    assert!(duplex.is_closed());
}
