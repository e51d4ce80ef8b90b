//! Transform：写侧输入经映射后推送到读侧。
//!
//! # 设计定位（Why）
//! - 变换是最常见的双工实体：压缩、分帧、编解码。写侧的消费者就是映射函数，读侧的生产者只负责
//!   在下游取数时“放行”被挂起的确认，背压因此自然地从读侧传回写侧。
//!
//! # 契约说明（What）
//! - 同一时刻至多一次映射在途（由写侧“一次一块”的契约保证），输出顺序与输入顺序一致；
//! - 映射结束时若读侧缓冲仍在阈值之上且本次确有输出，确认被挂起，直到下游 `read` 触发补货；
//! - 写侧结束后调用 [`Mapper::flush`]，随后读侧推送结束标记。

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::ack::Ack;
use crate::chunk::ChunkMode;
use crate::config::DuplexOptions;
use crate::destroy::{DestroyToken, Teardown};
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::readable::{Producer, Readable};
use crate::scheduler::Scheduler;
use crate::writable::{Consumer, Writable, WritableInner};

/// 映射函数。
///
/// `map` 通过 [`TransformOutput`] 推送任意多块输出，最后必须调用 `done` 或 `fail`；
/// 丢弃 `output` 而不结算视为失败（[`StreamError::AckDropped`]）。
pub trait Mapper<I: ChunkMode, O: ChunkMode> {
    fn map(&mut self, chunk: I::Chunk, output: TransformOutput<O>);

    /// 写侧结束后调用一次，可以推送尾部数据。
    fn flush(&mut self, output: TransformOutput<O>) {
        output.done();
    }
}

impl<I, O, F> Mapper<I, O> for F
where
    I: ChunkMode,
    O: ChunkMode,
    F: FnMut(I::Chunk, TransformOutput<O>),
{
    fn map(&mut self, chunk: I::Chunk, output: TransformOutput<O>) {
        self(chunk, output)
    }
}

/// 读写两侧之间的放行闸门。
struct TransformGate {
    parked: RefCell<Option<Ack>>,
    writable_ending: RefCell<Option<Box<dyn Fn() -> bool>>>,
}

impl TransformGate {
    fn park(&self, ack: Ack) {
        *self.parked.borrow_mut() = Some(ack);
    }

    fn release(&self) {
        let parked = self.parked.borrow_mut().take();
        if let Some(ack) = parked {
            trace!("releasing parked transform acknowledgement");
            ack.success();
        }
    }

    fn writable_ending(&self) -> bool {
        self.writable_ending
            .borrow()
            .as_ref()
            .is_some_and(|probe| probe())
    }
}

enum Phase {
    Map { length_before: usize },
    Flush,
}

/// 单次映射（或 flush）的输出句柄。
pub struct TransformOutput<O: ChunkMode> {
    readable: Readable<O>,
    ack: Option<Ack>,
    gate: Rc<TransformGate>,
    phase: Phase,
}

impl<O: ChunkMode> TransformOutput<O> {
    /// 向读侧推送一块输出。
    pub fn push(&self, chunk: O::Chunk) -> Result<bool, StreamError> {
        self.readable.push(Some(chunk))
    }

    /// 本次映射完成。
    pub fn done(mut self) {
        let Some(ack) = self.ack.take() else {
            return;
        };
        match self.phase {
            Phase::Flush => {
                let _ = self.readable.push(None);
                ack.success();
            }
            Phase::Map { length_before } => {
                let length = self.readable.readable_length();
                let release = self.gate.writable_ending()
                    || length == length_before
                    || length < self.readable.high_water_mark();
                if release {
                    ack.success();
                } else {
                    trace!(length, "readable side saturated, parking acknowledgement");
                    self.gate.park(ack);
                }
            }
        }
    }

    /// 本次映射失败；整个变换随之出错。
    pub fn fail(mut self, err: StreamError) {
        if let Some(ack) = self.ack.take() {
            ack.fail(err);
        }
    }
}

impl<O: ChunkMode> fmt::Debug for TransformOutput<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOutput")
            .field("settled", &self.ack.is_none())
            .field("flush", &matches!(self.phase, Phase::Flush))
            .finish()
    }
}

/// 读侧生产者：下游取数即放行挂起的确认。
struct GateProducer {
    gate: Rc<TransformGate>,
}

impl<O: ChunkMode> Producer<O> for GateProducer {
    fn produce(&mut self, _size: usize, _source: &Readable<O>) {
        self.gate.release();
    }
}

/// 写侧消费者：把输入交给映射函数。
struct MapConsumer<I: ChunkMode, O: ChunkMode> {
    mapper: Box<dyn Mapper<I, O>>,
    readable: Readable<O>,
    gate: Rc<TransformGate>,
}

impl<I: ChunkMode, O: ChunkMode> MapConsumer<I, O> {
    fn output(&self, ack: Ack, phase: Phase) -> TransformOutput<O> {
        TransformOutput {
            readable: self.readable.clone(),
            ack: Some(ack),
            gate: Rc::clone(&self.gate),
            phase,
        }
    }
}

impl<I: ChunkMode, O: ChunkMode> Consumer<I> for MapConsumer<I, O> {
    fn consume(&mut self, chunk: I::Chunk, ack: Ack) {
        let length_before = self.readable.readable_length();
        let output = self.output(ack, Phase::Map { length_before });
        self.mapper.map(chunk, output);
    }

    fn finalize(&mut self, ack: Ack) {
        let output = self.output(ack, Phase::Flush);
        self.mapper.flush(output);
    }
}

/// 变换流：写侧接收 `I`，读侧产出 `O`。
pub struct Transform<I: ChunkMode, O: ChunkMode> {
    duplex: Duplex<O, I>,
}

impl<I: ChunkMode, O: ChunkMode> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        Self {
            duplex: self.duplex.clone(),
        }
    }
}

/// [`Transform`] 构造器。
pub struct TransformBuilder<I: ChunkMode, O: ChunkMode> {
    scheduler: Rc<dyn Scheduler>,
    options: DuplexOptions,
    teardown: Option<Box<dyn Teardown>>,
    _modes: PhantomData<(I, O)>,
}

impl<I: ChunkMode, O: ChunkMode> TransformBuilder<I, O> {
    pub fn options(mut self, options: DuplexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn readable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.options.readable.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn writable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.options.writable.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.options.allow_half_open = allow;
        self
    }

    pub fn teardown(mut self, teardown: impl Teardown + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn build(self, mapper: impl Mapper<I, O> + 'static) -> Transform<I, O> {
        let gate = Rc::new(TransformGate {
            parked: RefCell::new(None),
            writable_ending: RefCell::new(None),
        });
        let token = DestroyToken::new(self.scheduler, self.teardown);
        let readable = Readable::assemble(
            Box::new(GateProducer {
                gate: Rc::clone(&gate),
            }),
            &self.options.readable,
            Rc::clone(&token),
            self.options.allow_half_open,
        );
        let consumer = MapConsumer {
            mapper: Box::new(mapper),
            readable: readable.clone(),
            gate: Rc::clone(&gate),
        };
        let writable = Writable::assemble(
            Box::new(consumer),
            &self.options.writable,
            Rc::clone(&token),
            self.options.allow_half_open,
        );

        let weak: Weak<WritableInner<I>> = Rc::downgrade(&writable.inner);
        *gate.writable_ending.borrow_mut() = Some(Box::new(move || {
            weak.upgrade().is_some_and(|inner| inner.state().ending)
        }));

        Transform {
            duplex: Duplex::link(readable, writable, token),
        }
    }
}

impl<I: ChunkMode, O: ChunkMode> Transform<I, O> {
    pub fn builder(scheduler: Rc<dyn Scheduler>) -> TransformBuilder<I, O> {
        TransformBuilder {
            scheduler,
            options: DuplexOptions::default(),
            teardown: None,
            _modes: PhantomData,
        }
    }

    pub fn new(scheduler: Rc<dyn Scheduler>, mapper: impl Mapper<I, O> + 'static) -> Self {
        Self::builder(scheduler).build(mapper)
    }

    /// 写侧句柄（输入）。
    pub fn writable(&self) -> &Writable<I> {
        self.duplex.writable()
    }

    /// 读侧句柄（输出）。
    pub fn readable(&self) -> &Readable<O> {
        self.duplex.readable()
    }

    pub fn duplex(&self) -> &Duplex<O, I> {
        &self.duplex
    }

    pub fn write(&self, chunk: I::Chunk) -> Result<bool, StreamError> {
        self.duplex.write(chunk)
    }

    pub fn end(&self, chunk: Option<I::Chunk>) -> Result<(), StreamError> {
        self.duplex.end(chunk)
    }

    pub fn read(&self, size: Option<usize>) -> Option<O::Chunk> {
        self.duplex.read(size)
    }

    pub fn destroy(&self, err: Option<StreamError>) -> bool {
        self.duplex.destroy(err)
    }

    pub fn is_destroyed(&self) -> bool {
        self.duplex.is_destroyed()
    }

    pub fn is_closed(&self) -> bool {
        self.duplex.is_closed()
    }
}

impl<M: ChunkMode> Transform<M, M> {
    /// 原样转发的变换。
    pub fn pass_through(scheduler: Rc<dyn Scheduler>) -> Self {
        Self::new(scheduler, |chunk: M::Chunk, output: TransformOutput<M>| {
            match output.push(chunk) {
                Ok(_) => output.done(),
                Err(err) => output.fail(err),
            }
        })
    }
}

impl<I: ChunkMode, O: ChunkMode> fmt::Debug for Transform<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("duplex", &self.duplex)
            .finish()
    }
}
