mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use sluice_core::test_stubs::{AckMode, EventLog, RecordingConsumer};
use sluice_core::{Ack, Duplex, ObjectMode, Readable, StreamError, TickQueue, Writable};

type Numbers = ObjectMode<u32>;

#[test]
fn duplex_destroyed_from_both_sides_closes_each_side_once() {
    common::init_tracing();
    let queue = TickQueue::new();
    let teardowns = Rc::new(Cell::new(0));
    let (consumer, _probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
    let duplex = {
        let teardowns = Rc::clone(&teardowns);
        Duplex::<Numbers, Numbers>::builder(queue.handle())
            .teardown(move |_: Option<&StreamError>, ack: Ack| {
                teardowns.set(teardowns.get() + 1);
                ack.success();
            })
            .build(|_: usize, _: &Readable<Numbers>| {}, consumer)
    };
    let log = EventLog::new();
    log.attach_source(duplex.readable(), "r");
    log.attach_sink(duplex.writable(), "w");

    assert!(duplex.readable().destroy(Some(StreamError::producer("reset"))));
    assert!(!duplex.writable().destroy(None));
    assert!(!duplex.destroy(None));
    assert_eq!(teardowns.get(), 0, "teardown never runs synchronously");

    queue.run_until_idle();
    assert_eq!(teardowns.get(), 1);
    for entry in ["r:error", "r:close", "w:error", "w:close"] {
        assert_eq!(log.count(entry), 1, "{entry} in {:?}", log.entries());
    }
    assert!(duplex.is_closed());
}

#[test]
fn close_waits_for_a_late_teardown_acknowledgement() {
    let queue = TickQueue::new();
    let pending: Rc<RefCell<Option<Ack>>> = Rc::new(RefCell::new(None));
    let sink = {
        let pending = Rc::clone(&pending);
        Writable::<Numbers>::builder(queue.handle())
            .teardown(move |_: Option<&StreamError>, ack: Ack| {
                *pending.borrow_mut() = Some(ack);
            })
            .build(|_: u32, ack: Ack| ack.success())
    };

    sink.destroy(None);
    queue.run_until_idle();
    assert!(sink.is_destroyed());
    assert!(!sink.is_closed());

    let ack = pending.borrow_mut().take().expect("teardown hook was called");
    ack.success();
    assert!(sink.is_closed());
}

#[test]
fn destroy_during_consumption_drops_later_writes() {
    let queue = TickQueue::new();
    let (consumer, probe) = RecordingConsumer::<Numbers>::new(AckMode::Manual);
    let sink = Writable::<Numbers>::new(queue.handle(), consumer);
    sink.write(1).unwrap();
    sink.write(2).unwrap();
    sink.destroy(Some(StreamError::consumer("cancelled")));
    probe.release_all();
    queue.run_until_idle();

    assert_eq!(probe.received(), vec![1]);
    assert_eq!(sink.writable_length(), 0);
    assert!(sink.is_closed());
}
