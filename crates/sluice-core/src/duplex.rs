//! Duplex：共享销毁令牌的一对 Source/Sink。
//!
//! # 设计定位（Why）
//! - 双工实体（套接字、变换器）的两侧各自独立流动，但生命周期绑定：任何一侧销毁都会拆除整体，
//!   且两侧各发一次 `close`。
//! - 半开策略决定一侧结束是否带动另一侧结束；默认允许半开。
//!
//! # 执行逻辑（How）
//! - 两侧在构造时登记到同一个 [`DestroyToken`]，并互相持有对方的 `Weak<dyn Companion>`；
//! - Source 发出 `end` 后：若不允许半开则结束 Sink，否则在 Sink 已完成时自动销毁；
//!   Sink 完成后对称处理。

use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use crate::chunk::ChunkMode;
use crate::config::DuplexOptions;
use crate::destroy::{DestroyToken, Teardown};
use crate::error::StreamError;
use crate::readable::{Producer, Readable, ReadableInner};
use crate::scheduler::Scheduler;
use crate::status::{SinkState, SourceState};
use crate::writable::{Consumer, Writable, WritableInner};

/// 双工实体中“另一侧”的视图。
pub(crate) trait Companion {
    /// 该侧是否已完成（Source：`end` 已发；Sink：`finish` 已发）。
    fn side_settled(&self) -> bool;

    /// 该侧是否仍可被结束。
    fn is_open(&self) -> bool;

    /// 结束该侧（Source 推送结束标记，Sink 调用 `end`）。
    fn half_close(self: Rc<Self>);

    /// 记录另一侧的错误。
    fn record_error(&self, err: &StreamError);
}

/// 双工流。
pub struct Duplex<R: ChunkMode, W: ChunkMode> {
    readable: Readable<R>,
    writable: Writable<W>,
    token: Rc<DestroyToken>,
}

impl<R: ChunkMode, W: ChunkMode> Clone for Duplex<R, W> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
            token: Rc::clone(&self.token),
        }
    }
}

/// [`Duplex`] 构造器。
pub struct DuplexBuilder<R: ChunkMode, W: ChunkMode> {
    scheduler: Rc<dyn Scheduler>,
    options: DuplexOptions,
    teardown: Option<Box<dyn Teardown>>,
    _modes: PhantomData<(R, W)>,
}

impl<R: ChunkMode, W: ChunkMode> DuplexBuilder<R, W> {
    pub fn options(mut self, options: DuplexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.options.allow_half_open = allow;
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

    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.options.readable.auto_destroy = auto_destroy;
        self.options.writable.auto_destroy = auto_destroy;
        self
    }

    pub fn teardown(mut self, teardown: impl Teardown + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn build(
        self,
        producer: impl Producer<R> + 'static,
        consumer: impl Consumer<W> + 'static,
    ) -> Duplex<R, W> {
        Duplex::assemble(
            self.scheduler,
            Box::new(producer),
            Box::new(consumer),
            &self.options,
            self.teardown,
        )
    }
}

impl<R: ChunkMode, W: ChunkMode> Duplex<R, W> {
    pub fn builder(scheduler: Rc<dyn Scheduler>) -> DuplexBuilder<R, W> {
        DuplexBuilder {
            scheduler,
            options: DuplexOptions::default(),
            teardown: None,
            _modes: PhantomData,
        }
    }

    pub fn new(
        scheduler: Rc<dyn Scheduler>,
        producer: impl Producer<R> + 'static,
        consumer: impl Consumer<W> + 'static,
    ) -> Self {
        Self::builder(scheduler).build(producer, consumer)
    }

    pub(crate) fn assemble(
        scheduler: Rc<dyn Scheduler>,
        producer: Box<dyn Producer<R>>,
        consumer: Box<dyn Consumer<W>>,
        options: &DuplexOptions,
        teardown: Option<Box<dyn Teardown>>,
    ) -> Self {
        let token = DestroyToken::new(scheduler, teardown);
        let readable = Readable::assemble(
            producer,
            &options.readable,
            Rc::clone(&token),
            options.allow_half_open,
        );
        let writable = Writable::assemble(
            consumer,
            &options.writable,
            Rc::clone(&token),
            options.allow_half_open,
        );
        Self::link(readable, writable, token)
    }

    /// 把共享同一令牌的两侧互相登记为对方的伙伴。
    pub(crate) fn link(
        readable: Readable<R>,
        writable: Writable<W>,
        token: Rc<DestroyToken>,
    ) -> Self {
        let writable_side: Weak<WritableInner<W>> = Rc::downgrade(&writable.inner);
        let readable_side: Weak<ReadableInner<R>> = Rc::downgrade(&readable.inner);
        readable.set_companion(writable_side);
        writable.set_companion(readable_side);

        Self {
            readable,
            writable,
            token,
        }
    }

    /// 读侧句柄。
    pub fn readable(&self) -> &Readable<R> {
        &self.readable
    }

    /// 写侧句柄。
    pub fn writable(&self) -> &Writable<W> {
        &self.writable
    }

    pub fn push(&self, chunk: Option<R::Chunk>) -> Result<bool, StreamError> {
        self.readable.push(chunk)
    }

    pub fn read(&self, size: Option<usize>) -> Option<R::Chunk> {
        self.readable.read(size)
    }

    pub fn write(&self, chunk: W::Chunk) -> Result<bool, StreamError> {
        self.writable.write(chunk)
    }

    pub fn end(&self, chunk: Option<W::Chunk>) -> Result<(), StreamError> {
        self.writable.end(chunk)
    }

    /// 销毁两侧；任一侧句柄上的 `destroy` 等价。
    pub fn destroy(&self, err: Option<StreamError>) -> bool {
        self.token.destroy(err)
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_destroyed()
    }

    /// 两侧是否都已发出 `close`。
    pub fn is_closed(&self) -> bool {
        self.readable.is_closed() && self.writable.is_closed()
    }

    pub fn state(&self) -> (SourceState, SinkState) {
        (self.readable.state(), self.writable.state())
    }
}

impl<R: ChunkMode, W: ChunkMode> fmt::Debug for Duplex<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
