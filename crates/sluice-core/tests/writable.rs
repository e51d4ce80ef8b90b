mod common;

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::test_stubs::{AckMode, EventLog, RecordingConsumer};
use sluice_core::{ObjectMode, SinkState, StreamError, TickQueue, Writable};

type Words = ObjectMode<&'static str>;
type Numbers = ObjectMode<u32>;

#[test]
fn acknowledges_in_order_and_drains_below_threshold() {
    common::init_tracing();
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Words>::new(AckMode::Deferred(queue.handle()));
    let sink = Writable::<Words>::builder(queue.handle())
        .high_water_mark(2)
        .build(consumer);
    let log = EventLog::new();
    log.attach_sink(&sink, "sink");

    assert_eq!(sink.write("a"), Ok(true));
    assert_eq!(sink.write("b"), Ok(false));
    assert_eq!(sink.write("c"), Ok(false));
    assert_eq!(sink.state(), SinkState::Draining);
    assert_eq!(sink.writable_length(), 3);

    queue.run_until_idle();
    assert_eq!(probe.received(), vec!["a", "b", "c"]);
    assert_eq!(log.count("sink:drain"), 1);
    assert_eq!(sink.writable_length(), 0);
    assert_eq!(sink.state(), SinkState::Writable);

    sink.end(None).unwrap();
    queue.run_until_idle();
    assert!(probe.is_finalized());
    assert_eq!(
        log.entries(),
        vec!["sink:drain", "sink:prefinish", "sink:finish", "sink:close"]
    );
}

#[test]
fn drain_still_fires_after_end_is_called() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
    let sink = Writable::<Numbers>::builder(queue.handle())
        .high_water_mark(1)
        .build(consumer);
    let log = EventLog::new();
    log.attach_sink(&sink, "s");

    assert_eq!(sink.write(1), Ok(false));
    sink.end(None).unwrap();
    queue.run_until_idle();
    assert!(log.entries().is_empty());

    assert!(probe.release_one());
    queue.run_until_idle();
    assert_eq!(
        log.entries(),
        vec!["s:drain", "s:prefinish", "s:finish", "s:close"]
    );
}

#[test]
fn write_after_end_is_rejected_without_state_change() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Words>::new(AckMode::Manual);
    let sink = Writable::<Words>::new(queue.handle(), consumer);

    sink.write("first").unwrap();
    sink.end(Some("last")).unwrap();
    assert_eq!(sink.state(), SinkState::Finishing);

    assert_eq!(sink.write("late"), Err(StreamError::WriteAfterEnd));
    assert_eq!(sink.end(None), Err(StreamError::EndAfterEnd));
    assert_eq!(sink.state(), SinkState::Finishing);
    assert_eq!(sink.writable_length(), 2);

    probe.release_all();
    queue.run_until_idle();
    assert_eq!(probe.received(), vec!["first", "last"]);
    assert!(sink.is_finished());
    assert_eq!(sink.end(None), Err(StreamError::AlreadyFinished));
    assert_eq!(sink.write("later"), Err(StreamError::WriteAfterEnd));
}

#[test]
fn finish_waits_for_every_acknowledgement() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
    let sink = Writable::<Numbers>::new(queue.handle(), consumer);
    let log = EventLog::new();
    log.attach_sink(&sink, "sink");

    sink.write(1).unwrap();
    sink.write(2).unwrap();
    sink.end(None).unwrap();
    queue.run_until_idle();
    assert!(!sink.is_finished());
    assert_eq!(probe.pending(), 1);

    assert!(probe.release_one());
    queue.run_until_idle();
    assert!(!sink.is_finished(), "second write is still in flight");

    assert!(probe.release_one());
    queue.run_until_idle();
    assert!(sink.is_finished());
    assert_eq!(log.count("sink:finish"), 1);
}

#[test]
fn completion_callbacks_run_after_the_current_turn() {
    let queue = TickQueue::new();
    let (consumer, _probe) = RecordingConsumer::<Words>::new(AckMode::Immediate);
    let sink = Writable::<Words>::new(queue.handle(), consumer);
    let results = Rc::new(RefCell::new(Vec::new()));

    for word in ["x", "y"] {
        let results = Rc::clone(&results);
        sink.write_with(word, move |result| {
            results.borrow_mut().push((word, result.is_ok()))
        })
        .unwrap();
    }
    assert!(results.borrow().is_empty());

    queue.run_until_idle();
    assert_eq!(*results.borrow(), vec![("x", true), ("y", true)]);
}

#[test]
fn uncork_flushes_as_one_batch_when_supported() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Immediate);
    let sink = Writable::<Numbers>::new(queue.handle(), consumer.with_batching());

    sink.cork();
    sink.cork();
    for n in 1..=4 {
        sink.write(n).unwrap();
    }
    assert_eq!(sink.state(), SinkState::Corked);
    sink.uncork();
    assert_eq!(probe.received_len(), 0, "still corked once");
    sink.uncork();

    assert_eq!(probe.received(), vec![1, 2, 3, 4]);
    assert_eq!(probe.batches(), vec![4]);
    queue.run_until_idle();
    assert_eq!(sink.writable_length(), 0);
}

#[test]
fn consumer_failure_destroys_sink_once() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Immediate);
    let sink = Writable::<Numbers>::new(queue.handle(), consumer);
    let log = EventLog::new();
    log.attach_sink(&sink, "sink");

    probe.fail_next(StreamError::consumer("disk full"));
    assert_eq!(sink.write(1), Ok(false));
    queue.run_until_idle();

    assert_eq!(log.entries(), vec!["sink:error", "sink:close"]);
    assert_eq!(sink.state(), SinkState::Errored);
    assert!(sink.is_destroyed());
    assert_eq!(
        sink.write(2),
        Err(StreamError::Destroyed { op: "write" }),
        "destroyed sink rejects writes"
    );
}

#[test]
fn destroy_settles_buffered_writes_with_destroyed() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
    let sink = Writable::<Numbers>::new(queue.handle(), consumer);
    let results = Rc::new(RefCell::new(Vec::new()));
    for n in [1, 2] {
        let results = Rc::clone(&results);
        sink.write_with(n, move |result| results.borrow_mut().push((n, result)))
            .unwrap();
    }

    assert!(sink.destroy(None));
    queue.run_until_idle();
    assert!(sink.is_closed());

    probe.release_all();
    queue.run_until_idle();
    let destroyed = Err(StreamError::Destroyed { op: "write" });
    assert_eq!(
        *results.borrow(),
        vec![(2, destroyed.clone()), (1, destroyed)]
    );
}

#[test]
fn dropped_acknowledgement_fails_the_write() {
    let queue = TickQueue::new();
    let sink = Writable::<Numbers>::builder(queue.handle())
        .auto_destroy(false)
        .build(|_chunk: u32, ack: sluice_core::Ack| drop(ack));
    let errors = Rc::new(RefCell::new(Vec::new()));
    {
        let errors = Rc::clone(&errors);
        sink.on_error(move |err| errors.borrow_mut().push(err.code()));
    }

    sink.write(7).unwrap();
    queue.run_until_idle();
    assert_eq!(*errors.borrow(), vec!["stream.ack_dropped"]);
    assert_eq!(sink.state(), SinkState::Errored);
    assert!(!sink.is_destroyed());
}
