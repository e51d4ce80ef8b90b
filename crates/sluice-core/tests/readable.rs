mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use sluice_core::test_stubs::{EventLog, VecProducer};
use sluice_core::{ByteMode, ObjectMode, Readable, SourceState, StreamError, TickQueue};

type Numbers = ObjectMode<u32>;

fn idle_source<M: sluice_core::ChunkMode>(queue: &TickQueue, high_water_mark: usize) -> Readable<M> {
    Readable::<M>::builder(queue.handle())
        .high_water_mark(high_water_mark)
        .build(|_: usize, _: &Readable<M>| {})
}

#[test]
fn flowing_mode_delivers_in_order_then_ends_once() {
    common::init_tracing();
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::new(queue.handle(), VecProducer::new([1, 2, 3]));

    let seen = Rc::new(RefCell::new(Vec::new()));
    let ends = Rc::new(Cell::new(0));
    {
        let seen = Rc::clone(&seen);
        source.on_data(move |chunk| seen.borrow_mut().push(*chunk));
    }
    {
        let ends = Rc::clone(&ends);
        source.on_end(move || ends.set(ends.get() + 1));
    }

    assert!(seen.borrow().is_empty(), "delivery never starts synchronously");
    queue.run_until_idle();

    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert_eq!(ends.get(), 1);
    assert!(source.is_end_emitted());
    assert!(source.is_destroyed(), "auto destroy follows end");
    assert!(source.is_closed());
}

#[test]
fn push_reports_threshold_crossing() {
    let queue = TickQueue::new();
    let source = idle_source::<Numbers>(&queue, 2);

    assert_eq!(source.push(Some(1)), Ok(true));
    assert_eq!(source.push(Some(2)), Ok(false));
    assert_eq!(source.readable_length(), 2);
    assert_eq!(source.read(None), Some(1));
    assert_eq!(source.push(Some(3)), Ok(false));
}

#[test]
fn byte_reads_concatenate_and_split() {
    let queue = TickQueue::new();
    let source = idle_source::<ByteMode>(&queue, 16);

    source.push(Some(Bytes::from_static(b"abc"))).unwrap();
    source.push(Some(Bytes::from_static(b"def"))).unwrap();

    assert_eq!(source.read(Some(4)), Some(Bytes::from_static(b"abcd")));
    assert_eq!(source.read(Some(4)), None, "not enough data and not ended");
    assert_eq!(source.readable_length(), 2);

    source.push(None).unwrap();
    assert_eq!(source.read(Some(4)), Some(Bytes::from_static(b"ef")));
    assert_eq!(source.read(None), None);
}

#[test]
fn unshift_puts_chunk_back_at_the_head() {
    let queue = TickQueue::new();
    let source = idle_source::<Numbers>(&queue, 16);

    source.push(Some(1)).unwrap();
    source.push(Some(2)).unwrap();
    assert_eq!(source.read(None), Some(1));
    source.unshift(9).unwrap();
    assert_eq!(source.read(None), Some(9));
    assert_eq!(source.read(None), Some(2));
}

#[test]
fn unshift_after_end_is_rejected() {
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::builder(queue.handle())
        .auto_destroy(false)
        .build(VecProducer::new([1]));
    source.on_data(|_| {});
    queue.run_until_idle();

    assert!(source.is_end_emitted());
    assert_eq!(source.unshift(5), Err(StreamError::UnshiftAfterEnd));
    assert!(!source.is_destroyed());
}

#[test]
fn readable_notification_drives_paused_consumption() {
    let queue = TickQueue::new();
    let source = idle_source::<ByteMode>(&queue, 64);
    source.push(Some(Bytes::from_static(b"hello"))).unwrap();
    source.push(Some(Bytes::from_static(b"world"))).unwrap();

    let collected = Rc::new(RefCell::new(Vec::new()));
    let notifications = Rc::new(Cell::new(0));
    {
        let collected = Rc::clone(&collected);
        let notifications = Rc::clone(&notifications);
        let handle = source.clone();
        source.on_readable(move || {
            notifications.set(notifications.get() + 1);
            while let Some(chunk) = handle.read(None) {
                collected.borrow_mut().push(chunk);
            }
        });
    }
    assert_eq!(source.flowing(), Some(false));
    queue.run_until_idle();

    assert_eq!(*collected.borrow(), vec![Bytes::from_static(b"helloworld")]);
    assert_eq!(notifications.get(), 1);

    let ended = Rc::new(Cell::new(false));
    {
        let ended = Rc::clone(&ended);
        source.on_end(move || ended.set(true));
    }
    source.push(None).unwrap();
    queue.run_until_idle();
    assert!(ended.get());
}

#[test]
fn pause_holds_data_until_resume() {
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::new(queue.handle(), VecProducer::new([1, 2, 3]));
    let log = EventLog::new();
    log.attach_source(&source, "src");

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        source.on_data(move |chunk| seen.borrow_mut().push(*chunk));
    }
    source.pause();
    assert!(source.is_paused());
    queue.run_until_idle();

    assert!(seen.borrow().is_empty());
    assert_eq!(source.readable_length(), 3);
    assert_eq!(source.state(), SourceState::Ended);

    source.resume();
    queue.run_until_idle();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert_eq!(log.count("src:pause"), 1);
    assert_eq!(log.count("src:end"), 1);
    assert_eq!(log.count("src:close"), 1);
}

#[test]
fn from_chunks_streams_an_iterator() {
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::from_chunks(queue.handle(), 1..=5);
    let sum = Rc::new(Cell::new(0));
    {
        let sum = Rc::clone(&sum);
        source.on_data(move |chunk| sum.set(sum.get() + *chunk));
    }
    queue.run_until_idle();
    assert_eq!(sum.get(), 15);
    assert!(source.is_end_emitted());
}

#[test]
fn destroy_with_error_emits_error_then_close() {
    let queue = TickQueue::new();
    let source = idle_source::<Numbers>(&queue, 4);
    source.push(Some(1)).unwrap();
    let log = EventLog::new();
    log.attach_source(&source, "src");

    assert!(source.destroy(Some(StreamError::producer("socket reset"))));
    assert!(!source.destroy(None));
    assert_eq!(source.readable_length(), 0, "buffer is discarded immediately");
    assert!(!source.is_closed(), "close waits for the teardown round");

    queue.run_until_idle();
    assert_eq!(log.entries(), vec!["src:error", "src:close"]);
    assert_eq!(source.state(), SourceState::Errored);
    assert_eq!(source.push(Some(2)), Ok(false), "push after destroy is ignored");
}

#[test]
fn failure_without_auto_destroy_keeps_stream_open() {
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::builder(queue.handle())
        .auto_destroy(false)
        .build(|_: usize, _: &Readable<Numbers>| {});
    let log = EventLog::new();
    log.attach_source(&source, "src");

    source.fail(StreamError::producer("bad frame"));
    source.fail(StreamError::producer("second"));
    queue.run_until_idle();

    assert_eq!(log.entries(), vec!["src:error"]);
    assert_eq!(source.errored(), Some(StreamError::producer("bad frame")));
    assert!(!source.is_closed());

    source.destroy(None);
    queue.run_until_idle();
    assert_eq!(log.entries(), vec!["src:error", "src:close"]);
}

#[test]
fn teardown_error_is_reported_on_close() {
    let queue = TickQueue::new();
    let source = Readable::<Numbers>::builder(queue.handle())
        .teardown(|_: Option<&StreamError>, ack: sluice_core::Ack| {
            ack.fail(StreamError::teardown("fd already closed"))
        })
        .build(|_: usize, _: &Readable<Numbers>| {});
    let info = Rc::new(RefCell::new(None));
    {
        let info = Rc::clone(&info);
        source.on_close(move |close| *info.borrow_mut() = Some(close.clone()));
    }
    let errors = Rc::new(Cell::new(0));
    {
        let errors = Rc::clone(&errors);
        source.on_error(move |_| errors.set(errors.get() + 1));
    }

    source.destroy(None);
    queue.run_until_idle();

    let info = info.borrow().clone().expect("close must fire");
    assert_eq!(info.reason, None);
    assert_eq!(info.teardown_error, Some(StreamError::teardown("fd already closed")));
    assert_eq!(errors.get(), 0);
}
