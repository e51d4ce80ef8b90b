//! Sink 状态机。
//!
//! # 设计定位（Why）
//! - 调用方以 [`Writable::write`] 投递数据，消费者（[`Consumer`]）一次只处理一块并通过 [`Ack`] 确认；
//!   在确认之前，后续数据只进入缓冲区，消费者看到的顺序严格等于写入顺序。
//! - 消费者可能在 `consume` 内同步确认，确认又会触发下一块的投递；若直接递归调用，深度与缓冲量成正比。
//!   这里用“任务队列 + 驱动标志”的蹦床结构：驱动中的再次投递只入队，由最外层循环依次执行。
//!
//! # 契约说明（What）
//! - `write` 返回 `Ok(false)` 当且仅当调用结束时缓冲量达到阈值；此后缓冲量回落到阈值以下时发一次 `drain`，
//!   即便此时已经调用了 `end`；
//! - `end` 之后的写入返回 [`StreamError::WriteAfterEnd`]，重复 `end` 返回
//!   [`StreamError::EndAfterEnd`] 或 [`StreamError::AlreadyFinished`]；
//! - 所有在途确认完成后调用 [`Consumer::finalize`]，其确认之后才发 `finish`；
//! - 确认失败使 Sink 进入 `Errored`，只发一次 `error`，后续写入被拒绝。
//!
//! # 风险与权衡（Trade-offs）
//! - `cork` 期间写入全部缓冲；支持批量的消费者在 `uncork` 时一次收到全部数据，否则逐块投递。

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::ack::Ack;
use crate::chunk::ChunkMode;
use crate::config::WritableOptions;
use crate::destroy::{DestroyToken, Endpoint, Teardown};
use crate::duplex::Companion;
use crate::error::StreamError;
use crate::event::{CloseInfo, EventHub, ListenerId, SinkEvent, SinkEventKind};
use crate::scheduler::Scheduler;
use crate::status::SinkState;

/// 单次写入的完成回调。
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>) + 'static>;

/// 数据消费者。
///
/// # 契约说明（What）
/// - 每次调用只交付一块（或一批），必须恰好确认一次；确认之前不会收到下一块；
/// - `supports_batch` 返回 `true` 时，`uncork` 积压的多块会合并为一次 `consume_batch`；
/// - `finalize` 在全部写入确认后调用一次，默认立即确认。
pub trait Consumer<M: ChunkMode> {
    fn consume(&mut self, chunk: M::Chunk, ack: Ack);

    fn supports_batch(&self) -> bool {
        false
    }

    fn consume_batch(&mut self, chunks: Vec<M::Chunk>, ack: Ack) {
        let _ = chunks;
        ack.fail(StreamError::consumer("batched consumption is not supported"));
    }

    fn finalize(&mut self, ack: Ack) {
        ack.success();
    }
}

impl<M, F> Consumer<M> for F
where
    M: ChunkMode,
    F: FnMut(M::Chunk, Ack),
{
    fn consume(&mut self, chunk: M::Chunk, ack: Ack) {
        self(chunk, ack)
    }
}

struct PendingWrite<C> {
    chunk: C,
    callback: Option<WriteCallback>,
}

enum Job<C> {
    Write(C),
    Batch(Vec<C>),
    Finalize,
}

pub(crate) struct WritableState<M: ChunkMode> {
    buffered: VecDeque<PendingWrite<M::Chunk>>,
    length: usize,
    high_water_mark: usize,
    auto_destroy: bool,
    allow_half_open: bool,
    corked: u32,
    writing: bool,
    sync: bool,
    need_drain: bool,
    pub(crate) ending: bool,
    ended: bool,
    pub(crate) finished: bool,
    final_called: bool,
    prefinished: bool,
    buffer_processing: bool,
    after_write_pending: bool,
    pending_cb: usize,
    write_len: usize,
    write_cb: Option<WriteCallback>,
    pub(crate) errored: Option<StreamError>,
    pub(crate) error_emitted: bool,
    pub(crate) close_emitted: bool,
    batching: bool,
}

impl<M: ChunkMode> WritableState<M> {
    fn drain_due(&self) -> bool {
        self.need_drain && (self.length < self.high_water_mark || self.length == 0)
    }
}

pub(crate) struct WritableInner<M: ChunkMode> {
    state: RefCell<WritableState<M>>,
    pub(crate) events: EventHub<SinkEvent>,
    consumer: RefCell<Option<Box<dyn Consumer<M>>>>,
    jobs: RefCell<VecDeque<Job<M::Chunk>>>,
    driving: Cell<bool>,
    pub(crate) token: Rc<DestroyToken>,
    companion: RefCell<Option<Weak<dyn Companion>>>,
}

impl<M: ChunkMode> WritableInner<M> {
    pub(crate) fn state(&self) -> Ref<'_, WritableState<M>> {
        self.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, WritableState<M>> {
        self.state.borrow_mut()
    }
}

/// Sink 句柄；克隆得到的句柄指向同一个状态机。
pub struct Writable<M: ChunkMode> {
    pub(crate) inner: Rc<WritableInner<M>>,
}

impl<M: ChunkMode> Clone for Writable<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// [`Writable`] 构造器。
pub struct WritableBuilder<M: ChunkMode> {
    scheduler: Rc<dyn Scheduler>,
    options: WritableOptions,
    teardown: Option<Box<dyn Teardown>>,
    _mode: PhantomData<M>,
}

impl<M: ChunkMode> WritableBuilder<M> {
    pub fn options(mut self, options: WritableOptions) -> Self {
        self.options = options;
        self
    }

    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.options.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.options.auto_destroy = auto_destroy;
        self
    }

    pub fn teardown(mut self, teardown: impl Teardown + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn build(self, consumer: impl Consumer<M> + 'static) -> Writable<M> {
        let token = DestroyToken::new(self.scheduler, self.teardown);
        Writable::assemble(Box::new(consumer), &self.options, token, true)
    }
}

impl<M: ChunkMode> Writable<M> {
    pub fn builder(scheduler: Rc<dyn Scheduler>) -> WritableBuilder<M> {
        WritableBuilder {
            scheduler,
            options: WritableOptions::default(),
            teardown: None,
            _mode: PhantomData,
        }
    }

    pub fn new(scheduler: Rc<dyn Scheduler>, consumer: impl Consumer<M> + 'static) -> Self {
        Self::builder(scheduler).build(consumer)
    }

    pub(crate) fn assemble(
        consumer: Box<dyn Consumer<M>>,
        options: &WritableOptions,
        token: Rc<DestroyToken>,
        allow_half_open: bool,
    ) -> Self {
        if let Err(err) = options.validate() {
            warn!(code = err.code(), "writable options rejected, clamping threshold");
        }
        let state = WritableState {
            buffered: VecDeque::new(),
            length: 0,
            high_water_mark: options.resolved_high_water_mark::<M>(),
            auto_destroy: options.auto_destroy,
            allow_half_open,
            corked: 0,
            writing: false,
            sync: true,
            need_drain: false,
            ending: false,
            ended: false,
            finished: false,
            final_called: false,
            prefinished: false,
            buffer_processing: false,
            after_write_pending: false,
            pending_cb: 0,
            write_len: 0,
            write_cb: None,
            errored: None,
            error_emitted: false,
            close_emitted: false,
            batching: consumer.supports_batch(),
        };
        let inner = Rc::new(WritableInner {
            state: RefCell::new(state),
            events: EventHub::new(),
            consumer: RefCell::new(Some(consumer)),
            jobs: RefCell::new(VecDeque::new()),
            driving: Cell::new(false),
            token,
            companion: RefCell::new(None),
        });
        let endpoint: Weak<WritableInner<M>> = Rc::downgrade(&inner);
        inner.token.attach(endpoint);
        Self { inner }
    }

    pub(crate) fn set_companion(&self, companion: Weak<dyn Companion>) {
        *self.inner.companion.borrow_mut() = Some(companion);
    }

    fn companion(&self) -> Option<Rc<dyn Companion>> {
        self.inner.companion.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn id(&self) -> u64 {
        self.inner.token.id()
    }

    fn defer(&self, task: impl FnOnce(&Self) + 'static) {
        let this = self.clone();
        self.inner
            .token
            .scheduler()
            .defer(Box::new(move || task(&this)));
    }

    fn is_destroyed_now(&self) -> bool {
        self.inner.token.is_destroyed()
    }

    // ---- 写入 ----

    /// 写入一块数据。
    pub fn write(&self, chunk: M::Chunk) -> Result<bool, StreamError> {
        self.write_chunk(chunk, None)
    }

    /// 写入一块数据，并在其确认（或被丢弃）时调用 `callback`。
    ///
    /// 同步拒绝的写入只返回 `Err`，不会调用回调。
    pub fn write_with(
        &self,
        chunk: M::Chunk,
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<bool, StreamError> {
        self.write_chunk(chunk, Some(Box::new(callback)))
    }

    fn check_accepts(&self, op: &'static str) -> Result<(), StreamError> {
        let st = self.inner.state();
        if st.ending {
            warn!(stream = self.id(), op, "write after end");
            return Err(StreamError::WriteAfterEnd);
        }
        if self.is_destroyed_now() {
            return Err(StreamError::Destroyed { op });
        }
        match &st.errored {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn write_chunk(
        &self,
        chunk: M::Chunk,
        callback: Option<WriteCallback>,
    ) -> Result<bool, StreamError> {
        self.check_accepts("write")?;

        let len = M::weight(&chunk);
        let (below, dispatch) = {
            let mut st = self.inner.state_mut();
            st.length += len;
            st.pending_cb += 1;
            let below = st.length < st.high_water_mark || st.length == 0;
            if !below {
                st.need_drain = true;
            }
            if st.writing || st.corked > 0 || st.errored.is_some() {
                st.buffered.push_back(PendingWrite { chunk, callback });
                (below, None)
            } else {
                (below, Some((chunk, callback)))
            }
        };
        if let Some((chunk, callback)) = dispatch {
            self.do_write(Job::Write(chunk), len, callback);
        }

        let errored = self.inner.state().errored.is_some();
        Ok(below && !errored && !self.is_destroyed_now())
    }

    fn do_write(&self, job: Job<M::Chunk>, len: usize, callback: Option<WriteCallback>) {
        {
            let mut st = self.inner.state_mut();
            st.write_len = len;
            st.write_cb = callback;
            st.writing = true;
        }
        if self.is_destroyed_now() {
            self.on_write_complete(Err(StreamError::Destroyed { op: "write" }));
            return;
        }
        self.inner.jobs.borrow_mut().push_back(job);
        self.drive_consumer();
    }

    /// 依次执行排队的消费任务；重入调用只入队，由最外层循环执行。
    fn drive_consumer(&self) {
        if self.inner.driving.replace(true) {
            return;
        }
        loop {
            let job = self.inner.jobs.borrow_mut().pop_front();
            let Some(job) = job else {
                break;
            };
            let consumer = self.inner.consumer.borrow_mut().take();
            let Some(mut consumer) = consumer else {
                self.abandon(job);
                continue;
            };

            self.inner.state_mut().sync = true;
            match job {
                Job::Write(chunk) => consumer.consume(chunk, self.write_ack()),
                Job::Batch(chunks) => consumer.consume_batch(chunks, self.write_ack()),
                Job::Finalize => consumer.finalize(self.final_ack()),
            }
            self.inner.state_mut().sync = false;

            if self.is_destroyed_now() {
                drop(consumer);
            } else {
                *self.inner.consumer.borrow_mut() = Some(consumer);
            }
        }
        self.inner.driving.set(false);
    }

    fn abandon(&self, job: Job<M::Chunk>) {
        match job {
            Job::Write(_) | Job::Batch(_) => {
                self.on_write_complete(Err(StreamError::Destroyed { op: "write" }))
            }
            Job::Finalize => self.on_final(Err(StreamError::Destroyed { op: "end" })),
        }
    }

    fn write_ack(&self) -> Ack {
        let weak = Rc::downgrade(&self.inner);
        Ack::new("write", move |result| {
            if let Some(inner) = weak.upgrade() {
                Writable { inner }.on_write_complete(result);
            }
        })
    }

    fn final_ack(&self) -> Ack {
        let weak = Rc::downgrade(&self.inner);
        Ack::new("final", move |result| {
            if let Some(inner) = weak.upgrade() {
                Writable { inner }.on_final(result);
            }
        })
    }

    fn on_write_complete(&self, result: Result<(), StreamError>) {
        let (sync, callback) = {
            let mut st = self.inner.state_mut();
            if !st.writing {
                warn!(stream = self.id(), "write acknowledged with no write in flight");
                return;
            }
            st.writing = false;
            st.length = st.length.saturating_sub(st.write_len);
            st.write_len = 0;
            (st.sync, st.write_cb.take())
        };

        if self.is_destroyed_now() {
            {
                let mut st = self.inner.state_mut();
                st.pending_cb = st.pending_cb.saturating_sub(1);
            }
            if let Some(callback) = callback {
                self.defer(move |_| callback(Err(StreamError::Destroyed { op: "write" })));
            }
            self.error_buffer();
            return;
        }

        match result {
            Err(err) => {
                warn!(stream = self.id(), code = err.code(), "consumer rejected write");
                {
                    let mut st = self.inner.state_mut();
                    if st.errored.is_none() {
                        st.errored = Some(err.clone());
                    }
                }
                if let Some(companion) = self.companion() {
                    companion.record_error(&err);
                }
                if sync {
                    self.defer(move |this| this.on_write_error(err, callback));
                } else {
                    self.on_write_error(err, callback);
                }
            }
            Ok(()) => {
                let has_buffered = !self.inner.state().buffered.is_empty();
                if has_buffered {
                    self.clear_buffer();
                }
                if !sync {
                    self.after_write(callback);
                    return;
                }
                match callback {
                    Some(callback) => self.defer(move |this| this.after_write(Some(callback))),
                    None => {
                        let (schedule, ending) = {
                            let mut st = self.inner.state_mut();
                            if !st.after_write_pending && st.drain_due() {
                                st.after_write_pending = true;
                                (true, st.ending)
                            } else {
                                st.pending_cb = st.pending_cb.saturating_sub(1);
                                (false, st.ending)
                            }
                        };
                        if schedule {
                            self.defer(|this| this.after_write(None));
                        } else if ending {
                            self.finish_maybe(true);
                        }
                    }
                }
            }
        }
    }

    fn after_write(&self, callback: Option<WriteCallback>) {
        let drain = {
            let mut st = self.inner.state_mut();
            st.after_write_pending = false;
            if st.drain_due() && !self.is_destroyed_now() {
                st.need_drain = false;
                true
            } else {
                false
            }
        };
        if drain {
            trace!(stream = self.id(), "sink drained");
            self.inner.events.emit(&SinkEvent::Drain);
        }
        {
            let mut st = self.inner.state_mut();
            st.pending_cb = st.pending_cb.saturating_sub(1);
        }
        if let Some(callback) = callback {
            callback(Ok(()));
        }
        if self.is_destroyed_now() {
            self.error_buffer();
        }
        self.finish_maybe(false);
    }

    fn on_write_error(&self, err: StreamError, callback: Option<WriteCallback>) {
        {
            let mut st = self.inner.state_mut();
            st.pending_cb = st.pending_cb.saturating_sub(1);
        }
        if let Some(callback) = callback {
            callback(Err(err.clone()));
        }
        self.error_buffer();
        self.fail(err);
    }

    /// 以错误结算全部缓冲写入（在途写入除外）。
    fn error_buffer(&self) {
        let (drained, err) = {
            let mut st = self.inner.state_mut();
            if st.writing {
                return;
            }
            let drained: Vec<PendingWrite<M::Chunk>> = st.buffered.drain(..).collect();
            let discarded: usize = drained.iter().map(|p| M::weight(&p.chunk)).sum();
            st.length = st.length.saturating_sub(discarded);
            st.pending_cb = st.pending_cb.saturating_sub(drained.len());
            let err = if self.is_destroyed_now() {
                StreamError::Destroyed { op: "write" }
            } else {
                st.errored
                    .clone()
                    .unwrap_or(StreamError::Destroyed { op: "write" })
            };
            (drained, err)
        };
        if !drained.is_empty() {
            trace!(stream = self.id(), discarded = drained.len(), "buffered writes discarded");
        }
        for pending in drained {
            if let Some(callback) = pending.callback {
                callback(Err(err.clone()));
            }
        }
    }

    fn clear_buffer(&self) {
        let batch = {
            let mut st = self.inner.state_mut();
            if st.corked > 0
                || st.buffer_processing
                || st.buffered.is_empty()
                || self.is_destroyed_now()
            {
                return;
            }
            st.buffer_processing = true;
            st.buffered.len() > 1 && st.batching
        };

        if batch {
            let (chunks, callbacks, len) = {
                let mut st = self.inner.state_mut();
                let pending: Vec<PendingWrite<M::Chunk>> = st.buffered.drain(..).collect();
                st.pending_cb = st.pending_cb.saturating_sub(pending.len() - 1);
                let len = st.length;
                let mut chunks = Vec::with_capacity(pending.len());
                let mut callbacks = Vec::new();
                for write in pending {
                    chunks.push(write.chunk);
                    callbacks.extend(write.callback);
                }
                (chunks, callbacks, len)
            };
            let callback: Option<WriteCallback> = if callbacks.is_empty() {
                None
            } else {
                Some(Box::new(move |result: Result<(), StreamError>| {
                    for callback in callbacks {
                        callback(result.clone());
                    }
                }))
            };
            trace!(stream = self.id(), chunks = chunks.len(), "flushing buffered writes as one batch");
            self.do_write(Job::Batch(chunks), len, callback);
        } else {
            loop {
                let next = {
                    let mut st = self.inner.state_mut();
                    if st.writing || st.corked > 0 {
                        None
                    } else {
                        st.buffered.pop_front()
                    }
                };
                let Some(write) = next else {
                    break;
                };
                let len = M::weight(&write.chunk);
                self.do_write(Job::Write(write.chunk), len, write.callback);
            }
        }
        self.inner.state_mut().buffer_processing = false;
    }

    // ---- cork ----

    /// 暂存后续写入，可嵌套。
    pub fn cork(&self) {
        self.inner.state_mut().corked += 1;
    }

    /// 解除一层 `cork`；计数归零时把积压数据作为一个周期投递。
    pub fn uncork(&self) {
        let flush = {
            let mut st = self.inner.state_mut();
            if st.corked == 0 {
                return;
            }
            st.corked -= 1;
            st.corked == 0 && !st.writing
        };
        if flush {
            self.clear_buffer();
        }
    }

    pub fn corked(&self) -> u32 {
        self.inner.state().corked
    }

    // ---- 结束 ----

    /// 结束写入；`chunk` 为可选的最后一块。
    pub fn end(&self, chunk: Option<M::Chunk>) -> Result<(), StreamError> {
        if let Some(chunk) = chunk {
            self.write(chunk)?;
        }

        let uncork = {
            let mut st = self.inner.state_mut();
            if st.corked > 0 {
                st.corked = 1;
                true
            } else {
                false
            }
        };
        if uncork {
            self.uncork();
        }

        {
            let st = self.inner.state();
            if st.finished {
                warn!(stream = self.id(), "end after finish");
                return Err(StreamError::AlreadyFinished);
            }
            if st.ending {
                warn!(stream = self.id(), "end called twice");
                return Err(StreamError::EndAfterEnd);
            }
            if self.is_destroyed_now() {
                return Err(StreamError::Destroyed { op: "end" });
            }
            if let Some(err) = &st.errored {
                return Err(err.clone());
            }
        }

        self.inner.state_mut().ending = true;
        debug!(stream = self.id(), "sink ending");
        self.finish_maybe(true);
        self.inner.state_mut().ended = true;
        Ok(())
    }

    fn need_finish(&self) -> bool {
        let st = self.inner.state();
        st.ending
            && !self.is_destroyed_now()
            && !st.finished
            && !st.writing
            && st.errored.is_none()
            && !st.error_emitted
            && !st.close_emitted
            && st.buffered.is_empty()
            && st.length == 0
    }

    fn finish_maybe(&self, sync: bool) {
        if !self.need_finish() {
            return;
        }
        self.prefinish();
        {
            let mut st = self.inner.state_mut();
            if st.pending_cb != 0 {
                return;
            }
            st.pending_cb += 1;
        }
        if sync {
            self.defer(|this| {
                if this.need_finish() {
                    this.finish();
                } else {
                    let mut st = this.inner.state_mut();
                    st.pending_cb = st.pending_cb.saturating_sub(1);
                }
            });
        } else if self.need_finish() {
            self.finish();
        } else {
            let mut st = self.inner.state_mut();
            st.pending_cb = st.pending_cb.saturating_sub(1);
        }
    }

    fn prefinish(&self) {
        let run_final = {
            let mut st = self.inner.state_mut();
            if st.prefinished || st.final_called {
                false
            } else {
                st.final_called = true;
                st.pending_cb += 1;
                true
            }
        };
        if run_final {
            trace!(stream = self.id(), "running finalizer");
            self.inner.jobs.borrow_mut().push_back(Job::Finalize);
            self.drive_consumer();
        }
    }

    fn on_final(&self, result: Result<(), StreamError>) {
        {
            let mut st = self.inner.state_mut();
            st.pending_cb = st.pending_cb.saturating_sub(1);
        }
        match result {
            Err(err) => {
                warn!(stream = self.id(), code = err.code(), "finalizer failed");
                self.fail(err);
            }
            Ok(()) => {
                if !self.need_finish() {
                    return;
                }
                {
                    let mut st = self.inner.state_mut();
                    st.prefinished = true;
                    st.pending_cb += 1;
                }
                self.inner.events.emit(&SinkEvent::Prefinish);
                self.defer(|this| this.finish());
            }
        }
    }

    fn finish(&self) {
        let proceed = {
            let mut st = self.inner.state_mut();
            st.pending_cb = st.pending_cb.saturating_sub(1);
            if st.errored.is_some() || st.finished || self.is_destroyed_now() {
                false
            } else {
                st.finished = true;
                true
            }
        };
        if !proceed {
            return;
        }
        debug!(stream = self.id(), "sink finished");
        self.inner.events.emit(&SinkEvent::Finish);

        let (auto_destroy, allow_half_open) = {
            let st = self.inner.state();
            (st.auto_destroy, st.allow_half_open)
        };
        let companion = self.companion();
        if let Some(readable) = &companion
            && !allow_half_open
            && readable.is_open()
        {
            Rc::clone(readable).half_close();
        }
        if auto_destroy && companion.is_none_or(|c| c.side_settled()) {
            self.destroy(None);
        }
    }

    // ---- 订阅 ----

    pub fn on(&self, kind: SinkEventKind, listener: impl Fn(&SinkEvent) + 'static) -> ListenerId {
        self.inner.events.on(kind, listener)
    }

    pub fn once(
        &self,
        kind: SinkEventKind,
        listener: impl Fn(&SinkEvent) + 'static,
    ) -> ListenerId {
        self.inner.events.once(kind, listener)
    }

    pub fn on_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.events.on(SinkEventKind::Drain, move |_| listener())
    }

    pub fn on_prefinish(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.events.on(SinkEventKind::Prefinish, move |_| listener())
    }

    pub fn on_finish(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.events.on(SinkEventKind::Finish, move |_| listener())
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.inner.events.on(SinkEventKind::Error, move |event| {
            if let SinkEvent::Error(err) = event {
                listener(err);
            }
        })
    }

    pub fn on_close(&self, listener: impl Fn(&CloseInfo) + 'static) -> ListenerId {
        self.inner.events.on(SinkEventKind::Close, move |event| {
            if let SinkEvent::Close(info) = event {
                listener(info);
            }
        })
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id).is_some()
    }

    // ---- 销毁与错误 ----

    pub fn destroy(&self, err: Option<StreamError>) -> bool {
        self.inner.token.destroy(err)
    }

    /// 以错误终止：启用自动销毁时等价于 `destroy(Some(err))`，否则进入 `Errored` 并发一次 `error`。
    pub fn fail(&self, err: StreamError) {
        if self.is_destroyed_now() {
            return;
        }
        let auto_destroy = self.inner.state().auto_destroy;
        if auto_destroy {
            self.destroy(Some(err));
            return;
        }
        let first = {
            let mut st = self.inner.state_mut();
            if st.error_emitted {
                false
            } else {
                if st.errored.is_none() {
                    st.errored = Some(err.clone());
                }
                true
            }
        };
        if let Some(companion) = self.companion() {
            companion.record_error(&err);
        }
        if first {
            self.defer(move |this| this.emit_error_once(err));
        }
    }

    fn emit_error_once(&self, err: StreamError) {
        let emit = {
            let mut st = self.inner.state_mut();
            !std::mem::replace(&mut st.error_emitted, true)
        };
        if emit {
            self.inner.events.emit(&SinkEvent::Error(err));
        }
    }

    // ---- 查询 ----

    pub fn state(&self) -> SinkState {
        let st = self.inner.state();
        if st.errored.is_some() {
            SinkState::Errored
        } else if st.finished {
            SinkState::Finished
        } else if self.is_destroyed_now() {
            SinkState::Destroyed
        } else if st.ending {
            SinkState::Finishing
        } else if st.corked > 0 {
            SinkState::Corked
        } else if st.need_drain {
            SinkState::Draining
        } else {
            SinkState::Writable
        }
    }

    /// 缓冲计量（含在途写入）。
    pub fn writable_length(&self) -> usize {
        self.inner.state().length
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.state().high_water_mark
    }

    /// 上一次写入返回了 `false` 且尚未 `drain`。
    pub fn need_drain(&self) -> bool {
        self.inner.state().need_drain
    }

    pub fn is_ending(&self) -> bool {
        self.inner.state().ending
    }

    /// `end` 已经处理完毕（结束标记已登记）。
    pub fn is_ended(&self) -> bool {
        self.inner.state().ended
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state().finished
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.inner.state().errored.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.is_destroyed_now()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().close_emitted
    }
}

impl<M: ChunkMode> Endpoint for WritableInner<M> {
    fn begin_destroy(self: Rc<Self>, reason: Option<&StreamError>) {
        {
            let mut st = self.state_mut();
            if let Some(err) = reason
                && st.errored.is_none()
            {
                st.errored = Some(err.clone());
            }
        }
        let consumer = self.consumer.borrow_mut().take();
        let writable = Writable {
            inner: Rc::clone(&self),
        };
        writable.defer(|this| this.error_buffer());
        // 丢弃消费者会以 `AckDropped` 结算其持有的在途确认。
        drop(consumer);
        trace!(stream = self.token.id(), "sink consumer released");
    }

    fn complete_destroy(self: Rc<Self>, info: &CloseInfo) {
        let emit_error = {
            let mut st = self.state_mut();
            info.reason.is_some() && !std::mem::replace(&mut st.error_emitted, true)
        };
        if emit_error && let Some(err) = &info.reason {
            self.events.emit(&SinkEvent::Error(err.clone()));
        }
        let emit_close = {
            let mut st = self.state_mut();
            !std::mem::replace(&mut st.close_emitted, true)
        };
        if emit_close {
            self.events.emit(&SinkEvent::Close(info.clone()));
            self.events.clear();
        }
    }
}

impl<M: ChunkMode> Companion for WritableInner<M> {
    fn side_settled(&self) -> bool {
        self.state().finished
    }

    fn is_open(&self) -> bool {
        !self.state().ending && !self.token.is_destroyed()
    }

    fn half_close(self: Rc<Self>) {
        let writable = Writable { inner: self };
        if let Err(err) = writable.end(None) {
            trace!(stream = writable.id(), code = err.code(), "half close skipped");
        }
    }

    fn record_error(&self, err: &StreamError) {
        let mut st = self.state_mut();
        if st.errored.is_none() {
            st.errored = Some(err.clone());
        }
    }
}

impl<M: ChunkMode> fmt::Debug for Writable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state();
        f.debug_struct("Writable")
            .field("id", &self.inner.token.id())
            .field("length", &st.length)
            .field("high_water_mark", &st.high_water_mark)
            .field("corked", &st.corked)
            .field("ending", &st.ending)
            .field("finished", &st.finished)
            .field("destroyed", &self.inner.token.is_destroyed())
            .finish()
    }
}
