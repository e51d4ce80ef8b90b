use sluice_core::{
    DuplexOptions, ObjectMode, PipeOptions, Readable, ReadableOptions, StreamError, TickQueue,
    WritableOptions,
};

#[test]
fn options_load_from_partial_toml() {
    let options: DuplexOptions = toml::from_str(
        r#"
        allow_half_open = false

        [readable]
        high_water_mark = 32

        [writable]
        auto_destroy = false
        "#,
    )
    .expect("valid options");

    assert!(!options.allow_half_open);
    assert_eq!(options.readable.high_water_mark, Some(32));
    assert!(options.readable.auto_destroy);
    assert_eq!(options.writable.high_water_mark, None);
    assert!(!options.writable.auto_destroy);
}

#[test]
fn unknown_keys_are_rejected() {
    let parsed: Result<ReadableOptions, _> = toml::from_str("highwater = 3");
    assert!(parsed.is_err());
}

#[test]
fn options_survive_serialization() {
    let options = WritableOptions {
        high_water_mark: Some(1024),
        auto_destroy: false,
    };
    let text = toml::to_string(&options).expect("serializable");
    let back: WritableOptions = toml::from_str(&text).expect("parsable");
    assert_eq!(back, options);

    let pipe: PipeOptions = toml::from_str("end = false").expect("parsable");
    assert!(!pipe.end);
    assert!(PipeOptions::default().end);
}

#[test]
fn oversized_threshold_is_rejected_and_clamped() {
    let options = ReadableOptions {
        high_water_mark: Some(usize::MAX),
        ..ReadableOptions::default()
    };
    assert!(matches!(
        options.validate(),
        Err(StreamError::InvalidArgument { name: "high_water_mark", .. })
    ));

    let queue = TickQueue::new();
    let source = Readable::<ObjectMode<u8>>::builder(queue.handle())
        .options(options)
        .build(|_: usize, _: &Readable<ObjectMode<u8>>| {});
    assert_eq!(source.high_water_mark(), sluice_core::MAX_HIGH_WATER_MARK);
}

#[test]
fn defaults_follow_the_chunk_mode() {
    let queue = TickQueue::new();
    let objects = Readable::<ObjectMode<u8>>::new(queue.handle(), |_: usize, _: &Readable<ObjectMode<u8>>| {});
    let bytes = Readable::<sluice_core::ByteMode>::new(
        queue.handle(),
        |_: usize, _: &Readable<sluice_core::ByteMode>| {},
    );
    assert_eq!(objects.high_water_mark(), 16);
    assert_eq!(bytes.high_water_mark(), 64 * 1024);
}
