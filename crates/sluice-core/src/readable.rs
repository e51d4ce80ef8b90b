//! Source 状态机。
//!
//! # 设计定位（Why）
//! - 生产者以“推”的方式交付数据（[`Readable::push`]），消费者既可以“拉”（[`Readable::read`]），
//!   也可以订阅 `data` 通知进入流动模式；二者共享同一个缓冲区与背压阈值。
//! - 补货请求（[`Producer::produce`]）一律经调度器延迟执行，`read` 永远不会在调用栈内同步触发补货，
//!   因而消费者在 `data` 回调里再次 `read` 也不会形成递归补货。
//!
//! # 契约说明（What）
//! - `push(Some(chunk))` 返回 `Ok(false)` 表示已达阈值，生产者应放缓；它从不阻塞；
//! - `push(None)` 为结束标记，之后再推送数据返回 [`StreamError::PushAfterEnd`]，状态不变；
//! - 销毁或出错之后的推送被静默忽略；
//! - `end` 通知在缓冲区被完全消费之后发出，且只发一次。
//!
//! # 执行逻辑（How）
//! - 内部状态是一组布尔标志（流动、补货中、需要 `readable`、已发 `end` 等），对外折叠为
//!   [`SourceState`]；
//! - 所有 `RefCell` 借用都在触发通知、调用生产者之前释放，通知回调可以任意重入本对象。

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::chunk::{ChunkBuffer, ChunkMode, grown_high_water_mark};
use crate::config::ReadableOptions;
use crate::destroy::{DestroyToken, Endpoint, Teardown};
use crate::duplex::Companion;
use crate::error::StreamError;
use crate::event::{CloseInfo, EventHub, ListenerId, SourceEvent, SourceEventKind};
use crate::pipe::PipeConnection;
use crate::scheduler::Scheduler;
use crate::status::SourceState;

/// 数据生产者。
///
/// # 契约说明（What）
/// - `size` 为建议补货量（当前阈值），可忽略；
/// - 在一次调用内可以推送任意多块，推送结果为 `Ok(false)` 时应停止，等待下一次调用；
/// - 也可以先返回、稍后再推送，状态机在收到推送或结束标记前不会重复请求。
pub trait Producer<M: ChunkMode> {
    fn produce(&mut self, size: usize, source: &Readable<M>);
}

impl<M, F> Producer<M> for F
where
    M: ChunkMode,
    F: FnMut(usize, &Readable<M>),
{
    fn produce(&mut self, size: usize, source: &Readable<M>) {
        self(size, source)
    }
}

/// 逐项推送迭代器内容，耗尽后推送结束标记。
struct IterProducer<I> {
    iter: I,
}

impl<M, I> Producer<M> for IterProducer<I>
where
    M: ChunkMode,
    I: Iterator<Item = M::Chunk>,
{
    fn produce(&mut self, _size: usize, source: &Readable<M>) {
        loop {
            let Some(chunk) = self.iter.next() else {
                let _ = source.push(None);
                return;
            };
            match source.push(Some(chunk)) {
                Ok(true) => continue,
                Ok(false) => return,
                Err(err) => {
                    source.destroy(Some(err));
                    return;
                }
            }
        }
    }
}

pub(crate) struct ReadableState<M: ChunkMode> {
    pub(crate) buffer: ChunkBuffer<M>,
    pub(crate) high_water_mark: usize,
    auto_destroy: bool,
    allow_half_open: bool,
    /// `None`：尚未选择模式；`Some(true)`：流动；`Some(false)`：暂停。
    pub(crate) flowing: Option<bool>,
    paused: bool,
    pub(crate) ended: bool,
    pub(crate) end_emitted: bool,
    reading: bool,
    sync: bool,
    need_readable: bool,
    emitted_readable: bool,
    readable_listening: bool,
    resume_scheduled: bool,
    reading_more: bool,
    pub(crate) errored: Option<StreamError>,
    pub(crate) error_emitted: bool,
    pub(crate) close_emitted: bool,
    pub(crate) pipes: Vec<Rc<PipeConnection>>,
    /// 仍在等待 `drain` 的管道编号。
    pub(crate) await_drain: BTreeSet<u64>,
}

pub(crate) struct ReadableInner<M: ChunkMode> {
    state: RefCell<ReadableState<M>>,
    pub(crate) events: EventHub<SourceEvent<M::Chunk>>,
    producer: RefCell<Option<Box<dyn Producer<M>>>>,
    pub(crate) token: Rc<DestroyToken>,
    companion: RefCell<Option<Weak<dyn Companion>>>,
}

impl<M: ChunkMode> ReadableInner<M> {
    pub(crate) fn state(&self) -> Ref<'_, ReadableState<M>> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, ReadableState<M>> {
        self.state.borrow_mut()
    }
}

/// Source 句柄；克隆得到的句柄指向同一个状态机。
pub struct Readable<M: ChunkMode> {
    pub(crate) inner: Rc<ReadableInner<M>>,
}

impl<M: ChunkMode> Clone for Readable<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// [`Readable`] 构造器。
pub struct ReadableBuilder<M: ChunkMode> {
    scheduler: Rc<dyn Scheduler>,
    options: ReadableOptions,
    teardown: Option<Box<dyn Teardown>>,
    _mode: PhantomData<M>,
}

impl<M: ChunkMode> ReadableBuilder<M> {
    pub fn options(mut self, options: ReadableOptions) -> Self {
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

    /// 注册拆除钩子，销毁时调用一次。
    pub fn teardown(mut self, teardown: impl Teardown + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn build(self, producer: impl Producer<M> + 'static) -> Readable<M> {
        let token = DestroyToken::new(self.scheduler, self.teardown);
        Readable::assemble(Box::new(producer), &self.options, token, true)
    }
}

impl<M: ChunkMode> Readable<M> {
    pub fn builder(scheduler: Rc<dyn Scheduler>) -> ReadableBuilder<M> {
        ReadableBuilder {
            scheduler,
            options: ReadableOptions::default(),
            teardown: None,
            _mode: PhantomData,
        }
    }

    /// 以默认选项创建。
    pub fn new(scheduler: Rc<dyn Scheduler>, producer: impl Producer<M> + 'static) -> Self {
        Self::builder(scheduler).build(producer)
    }

    /// 以迭代器为数据源创建，迭代器耗尽即结束。
    pub fn from_chunks<I>(scheduler: Rc<dyn Scheduler>, chunks: I) -> Self
    where
        I: IntoIterator<Item = M::Chunk>,
        I::IntoIter: 'static,
    {
        Self::new(
            scheduler,
            IterProducer {
                iter: chunks.into_iter(),
            },
        )
    }

    pub(crate) fn assemble(
        producer: Box<dyn Producer<M>>,
        options: &ReadableOptions,
        token: Rc<DestroyToken>,
        allow_half_open: bool,
    ) -> Self {
        if let Err(err) = options.validate() {
            warn!(code = err.code(), "readable options rejected, clamping threshold");
        }
        let state = ReadableState {
            buffer: ChunkBuffer::new(),
            high_water_mark: options.resolved_high_water_mark::<M>(),
            auto_destroy: options.auto_destroy,
            allow_half_open,
            flowing: None,
            paused: false,
            ended: false,
            end_emitted: false,
            reading: false,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            reading_more: false,
            errored: None,
            error_emitted: false,
            close_emitted: false,
            pipes: Vec::new(),
            await_drain: BTreeSet::new(),
        };
        let inner = Rc::new(ReadableInner {
            state: RefCell::new(state),
            events: EventHub::new(),
            producer: RefCell::new(Some(producer)),
            token,
            companion: RefCell::new(None),
        });
        let endpoint: Weak<ReadableInner<M>> = Rc::downgrade(&inner);
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

    fn scheduler(&self) -> &Rc<dyn Scheduler> {
        self.inner.token.scheduler()
    }

    fn defer(&self, task: impl FnOnce(&Self) + 'static) {
        let this = self.clone();
        self.scheduler().defer(Box::new(move || task(&this)));
    }

    // ---- 生产侧 ----

    /// 推送一块数据；`None` 表示数据结束。
    pub fn push(&self, chunk: Option<M::Chunk>) -> Result<bool, StreamError> {
        self.add_chunk(chunk, false)
    }

    /// 把数据放回缓冲区头部，供下一次 `read` 优先取出。
    pub fn unshift(&self, chunk: M::Chunk) -> Result<bool, StreamError> {
        self.add_chunk(Some(chunk), true)
    }

    fn add_chunk(&self, chunk: Option<M::Chunk>, front: bool) -> Result<bool, StreamError> {
        if self.inner.token.is_destroyed() {
            trace!(stream = self.id(), "push ignored after destroy");
            return Ok(false);
        }
        let Some(chunk) = chunk else {
            self.on_eof();
            return Ok(false);
        };

        {
            let mut st = self.inner.state_mut();
            if front && st.end_emitted {
                warn!(stream = self.id(), "unshift after end");
                return Err(StreamError::UnshiftAfterEnd);
            }
            if !front && st.ended {
                warn!(stream = self.id(), "push after end of stream");
                return Err(StreamError::PushAfterEnd);
            }
            if st.errored.is_some() {
                return Ok(false);
            }
            if !front {
                st.reading = false;
            }
        }

        if M::weight(&chunk) == 0 {
            self.maybe_read_more();
            return Ok(self.can_push_more());
        }

        self.deliver_or_buffer(chunk, front);
        Ok(self.can_push_more())
    }

    fn deliver_or_buffer(&self, chunk: M::Chunk, front: bool) {
        let direct = {
            let st = self.inner.state();
            st.flowing == Some(true)
                && !st.sync
                && st.buffer.is_empty()
                && self.inner.events.has(SourceEventKind::Data)
        };

        if direct {
            self.inner.state_mut().await_drain.clear();
            self.inner.events.emit(&SourceEvent::Data(chunk));
        } else {
            let need_readable = {
                let mut st = self.inner.state_mut();
                if front {
                    st.buffer.push_front(chunk);
                } else {
                    st.buffer.push_back(chunk);
                }
                st.need_readable
            };
            if need_readable {
                self.emit_readable();
            }
        }
        self.maybe_read_more();
    }

    fn can_push_more(&self) -> bool {
        let st = self.inner.state();
        !st.ended && (st.buffer.len() < st.high_water_mark || st.buffer.is_empty())
    }

    fn on_eof(&self) {
        let sync = {
            let mut st = self.inner.state_mut();
            st.reading = false;
            if st.ended {
                return;
            }
            st.ended = true;
            st.sync
        };
        debug!(stream = self.id(), "end of data pushed");

        if sync {
            self.emit_readable();
        } else {
            {
                let mut st = self.inner.state_mut();
                st.need_readable = false;
                st.emitted_readable = true;
            }
            self.emit_readable_now();
        }
    }

    // ---- 消费侧 ----

    /// 拉取至多 `size` 单位数据；`None` 表示按模式取“自然大小”。
    ///
    /// 返回 `None` 时等待 `readable` 通知（或 `end` 通知）。`read(Some(0))` 只触发补货与通知。
    pub fn read(&self, size: Option<usize>) -> Option<M::Chunk> {
        let mut st = self.inner.state_mut();
        st.sync = false;

        if let Some(n) = size
            && n > st.high_water_mark
        {
            st.high_water_mark = grown_high_water_mark(n);
            trace!(stream = self.id(), high_water_mark = st.high_water_mark, "threshold raised");
        }
        if size != Some(0) {
            st.emitted_readable = false;
        }

        if size == Some(0) && st.need_readable {
            let saturated = if st.high_water_mark != 0 {
                st.buffer.len() >= st.high_water_mark
            } else {
                !st.buffer.is_empty()
            };
            if saturated || st.ended {
                let end = st.buffer.is_empty() && st.ended;
                drop(st);
                if end {
                    self.end_readable();
                } else {
                    self.emit_readable();
                }
                return None;
            }
        }

        let mut n = how_much_to_read(&st, size);
        if n == 0 && st.ended {
            let empty = st.buffer.is_empty();
            drop(st);
            if empty {
                self.end_readable();
            }
            return None;
        }

        let mut request_refill = st.need_readable
            || st.buffer.is_empty()
            || st.buffer.len().saturating_sub(n) < st.high_water_mark;
        if st.reading || st.ended || st.errored.is_some() || self.inner.token.is_destroyed() {
            request_refill = false;
        } else if request_refill {
            st.reading = true;
            if st.buffer.is_empty() {
                st.need_readable = true;
            }
        }

        let chunk = if n > 0 { st.buffer.take(n) } else { None };
        if chunk.is_none() {
            if st.buffer.len() <= st.high_water_mark {
                st.need_readable = true;
            }
            n = 0;
        } else {
            st.await_drain.clear();
        }

        let mut end_now = false;
        if st.buffer.is_empty() {
            if !st.ended {
                st.need_readable = true;
            }
            end_now = size != Some(n) && st.ended;
        }

        let emit_data = chunk.is_some()
            && !st.error_emitted
            && !st.close_emitted
            && self.inner.events.has(SourceEventKind::Data);
        drop(st);

        if request_refill {
            self.defer(|this| this.invoke_producer());
        }
        if end_now {
            self.end_readable();
        }
        if emit_data && let Some(chunk) = &chunk {
            self.inner.events.emit(&SourceEvent::Data(chunk.clone()));
        }
        chunk
    }

    fn invoke_producer(&self) {
        let size = {
            let mut st = self.inner.state_mut();
            if st.ended || st.errored.is_some() || self.inner.token.is_destroyed() {
                st.reading = false;
                return;
            }
            st.sync = false;
            st.high_water_mark
        };
        let producer = self.inner.producer.borrow_mut().take();
        let Some(mut producer) = producer else {
            return;
        };
        trace!(stream = self.id(), size, "requesting refill");
        producer.produce(size, self);
        if !self.inner.token.is_destroyed() {
            *self.inner.producer.borrow_mut() = Some(producer);
        }
    }

    fn emit_readable(&self) {
        let schedule = {
            let mut st = self.inner.state_mut();
            st.need_readable = false;
            if st.emitted_readable {
                false
            } else {
                st.emitted_readable = true;
                true
            }
        };
        if schedule {
            self.defer(|this| this.emit_readable_now());
        }
    }

    fn emit_readable_now(&self) {
        let fire = {
            let st = self.inner.state();
            !self.inner.token.is_destroyed()
                && st.errored.is_none()
                && (!st.buffer.is_empty() || st.ended)
        };
        if fire {
            self.inner.events.emit(&SourceEvent::Readable);
            self.inner.state_mut().emitted_readable = false;
        }
        {
            let mut st = self.inner.state_mut();
            if st.flowing != Some(true) && !st.ended && st.buffer.len() <= st.high_water_mark {
                st.need_readable = true;
            }
        }
        self.flow();
    }

    fn maybe_read_more(&self) {
        let schedule = {
            let mut st = self.inner.state_mut();
            if st.reading_more {
                false
            } else {
                st.reading_more = true;
                true
            }
        };
        if schedule {
            self.defer(|this| this.maybe_read_more_now());
        }
    }

    fn maybe_read_more_now(&self) {
        let wanted = {
            let st = self.inner.state();
            !st.reading
                && !st.ended
                && (st.buffer.len() < st.high_water_mark
                    || (st.flowing == Some(true) && st.buffer.is_empty()))
        };
        if wanted {
            self.read(Some(0));
        }
        self.inner.state_mut().reading_more = false;
    }

    fn is_flowing_now(&self) -> bool {
        self.inner.state().flowing == Some(true)
    }

    fn flow(&self) {
        while self.is_flowing_now() && self.read(None).is_some() {}
    }

    pub(crate) fn end_readable(&self) {
        let schedule = {
            let mut st = self.inner.state_mut();
            if st.end_emitted {
                false
            } else {
                st.ended = true;
                true
            }
        };
        if schedule {
            self.defer(|this| this.end_readable_now());
        }
    }

    fn end_readable_now(&self) {
        let fire = {
            let mut st = self.inner.state_mut();
            if st.errored.is_none()
                && !st.close_emitted
                && !st.end_emitted
                && st.buffer.is_empty()
            {
                st.end_emitted = true;
                true
            } else {
                false
            }
        };
        if !fire {
            return;
        }
        debug!(stream = self.id(), "source end emitted");
        self.inner.events.emit(&SourceEvent::End);

        let (auto_destroy, allow_half_open) = {
            let st = self.inner.state();
            (st.auto_destroy, st.allow_half_open)
        };
        match self.companion() {
            Some(writable) if !allow_half_open && writable.is_open() => {
                self.scheduler()
                    .defer(Box::new(move || writable.half_close()));
            }
            companion => {
                if auto_destroy && companion.is_none_or(|c| c.side_settled()) {
                    self.destroy(None);
                }
            }
        }
    }

    // ---- 模式切换 ----

    /// 进入（或保持）流动模式。
    pub fn resume(&self) {
        let schedule = {
            let mut st = self.inner.state_mut();
            let mut schedule = false;
            if st.flowing != Some(true) {
                st.flowing = Some(!st.readable_listening);
                if !st.resume_scheduled {
                    st.resume_scheduled = true;
                    schedule = true;
                }
            }
            st.paused = false;
            schedule
        };
        if schedule {
            trace!(stream = self.id(), "resume scheduled");
            self.defer(|this| this.resume_now());
        }
    }

    fn resume_now(&self) {
        let reading = self.inner.state().reading;
        if !reading {
            self.read(Some(0));
        }
        self.inner.state_mut().resume_scheduled = false;
        self.inner.events.emit(&SourceEvent::Resume);
        self.flow();
        let refill = {
            let st = self.inner.state();
            st.flowing == Some(true) && !st.reading
        };
        if refill {
            self.read(Some(0));
        }
    }

    /// 停止主动推送；已交付的数据不受影响。
    pub fn pause(&self) {
        let emit = {
            let mut st = self.inner.state_mut();
            let emit = st.flowing != Some(false);
            if emit {
                st.flowing = Some(false);
            }
            st.paused = true;
            emit
        };
        if emit {
            debug!(stream = self.id(), "source paused");
            self.inner.events.emit(&SourceEvent::Pause);
        }
    }

    pub fn is_paused(&self) -> bool {
        let st = self.inner.state();
        st.paused || st.flowing == Some(false)
    }

    /// 当前流动标志：`None` 表示尚未选择模式。
    pub fn flowing(&self) -> Option<bool> {
        self.inner.state().flowing
    }

    // ---- 订阅 ----

    /// 订阅任意通知。订阅 `data` 不会自动切换模式，需要时请使用 [`Readable::on_data`]。
    pub fn on(
        &self,
        kind: SourceEventKind,
        listener: impl Fn(&SourceEvent<M::Chunk>) + 'static,
    ) -> ListenerId {
        self.inner.events.on(kind, listener)
    }

    /// 订阅一次性通知。
    pub fn once(
        &self,
        kind: SourceEventKind,
        listener: impl Fn(&SourceEvent<M::Chunk>) + 'static,
    ) -> ListenerId {
        self.inner.events.once(kind, listener)
    }

    /// 订阅 `data`；除非此前被显式暂停，否则切换到流动模式。
    pub fn on_data(&self, listener: impl Fn(&M::Chunk) + 'static) -> ListenerId {
        let id = self.inner.events.on(SourceEventKind::Data, move |event| {
            if let SourceEvent::Data(chunk) = event {
                listener(chunk);
            }
        });
        let flowing = self.flowing();
        if flowing != Some(false) {
            self.resume();
        }
        id
    }

    /// 订阅 `readable`，进入暂停模式由调用方主动 `read`。
    pub fn on_readable(&self, listener: impl Fn() + 'static) -> ListenerId {
        let id = self.inner.events.on(SourceEventKind::Readable, move |_| listener());
        enum Next {
            Nothing,
            EmitReadable,
            Refill,
        }
        let next = {
            let mut st = self.inner.state_mut();
            if st.end_emitted || st.readable_listening {
                Next::Nothing
            } else {
                st.readable_listening = true;
                st.need_readable = true;
                st.flowing = Some(false);
                st.emitted_readable = false;
                if !st.buffer.is_empty() {
                    Next::EmitReadable
                } else if !st.reading {
                    Next::Refill
                } else {
                    Next::Nothing
                }
            }
        };
        match next {
            Next::EmitReadable => self.emit_readable(),
            Next::Refill => self.defer(|this| {
                this.read(Some(0));
            }),
            Next::Nothing => {}
        }
        id
    }

    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.events.on(SourceEventKind::End, move |_| listener())
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.inner.events.on(SourceEventKind::Error, move |event| {
            if let SourceEvent::Error(err) = event {
                listener(err);
            }
        })
    }

    pub fn on_close(&self, listener: impl Fn(&CloseInfo) + 'static) -> ListenerId {
        self.inner.events.on(SourceEventKind::Close, move |event| {
            if let SourceEvent::Close(info) = event {
                listener(info);
            }
        })
    }

    /// 移除监听器。移除最后一个 `readable` 监听器时，若仍有 `data` 订阅者则恢复流动。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let Some(kind) = self.inner.events.remove(id) else {
            return false;
        };
        if kind == SourceEventKind::Readable && !self.inner.events.has(SourceEventKind::Readable)
        {
            let has_data = self.inner.events.has(SourceEventKind::Data);
            {
                let mut st = self.inner.state_mut();
                st.readable_listening = false;
                if !has_data && !st.paused {
                    st.flowing = None;
                }
            }
            if has_data {
                self.resume();
            }
        }
        true
    }

    // ---- 销毁与错误 ----

    /// 销毁；首次调用返回 `true`，重复调用无副作用。
    pub fn destroy(&self, err: Option<StreamError>) -> bool {
        self.inner.token.destroy(err)
    }

    /// 以错误终止：启用自动销毁时等价于 `destroy(Some(err))`，否则进入 `Errored` 并发一次 `error`。
    pub fn fail(&self, err: StreamError) {
        if self.inner.token.is_destroyed() {
            return;
        }
        let auto_destroy = self.inner.state().auto_destroy;
        if auto_destroy {
            self.destroy(Some(err));
            return;
        }
        let first = {
            let mut st = self.inner.state_mut();
            if st.errored.is_some() {
                false
            } else {
                st.errored = Some(err.clone());
                st.reading = false;
                st.buffer.clear();
                true
            }
        };
        if let Some(companion) = self.companion() {
            companion.record_error(&err);
        }
        if first {
            warn!(stream = self.id(), code = err.code(), "source errored");
            self.defer(move |this| this.emit_error_once(err));
        }
    }

    fn emit_error_once(&self, err: StreamError) {
        let emit = {
            let mut st = self.inner.state_mut();
            !std::mem::replace(&mut st.error_emitted, true)
        };
        if emit {
            self.inner.events.emit(&SourceEvent::Error(err));
        }
    }

    // ---- 查询 ----

    pub fn state(&self) -> SourceState {
        let st = self.inner.state();
        if st.errored.is_some() {
            SourceState::Errored
        } else if st.ended {
            SourceState::Ended
        } else if self.inner.token.is_destroyed() {
            SourceState::Destroyed
        } else if st.reading {
            SourceState::Reading
        } else {
            match st.flowing {
                Some(true) => SourceState::Flowing,
                Some(false) => SourceState::Paused,
                None => SourceState::Initial,
            }
        }
    }

    /// 缓冲区当前计量。
    pub fn readable_length(&self) -> usize {
        self.inner.state().buffer.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.state().high_water_mark
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state().ended
    }

    /// `end` 通知是否已发出。
    pub fn is_end_emitted(&self) -> bool {
        self.inner.state().end_emitted
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.inner.state().errored.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.token.is_destroyed()
    }

    /// `close` 通知是否已发出。
    pub fn is_closed(&self) -> bool {
        self.inner.state().close_emitted
    }
}

fn how_much_to_read<M: ChunkMode>(st: &ReadableState<M>, size: Option<usize>) -> usize {
    if size == Some(0) || (st.buffer.is_empty() && st.ended) {
        return 0;
    }
    if M::OBJECT_MODE {
        return 1;
    }
    match size {
        None if st.flowing == Some(true) => st.buffer.front_weight().unwrap_or(0),
        None => st.buffer.len(),
        Some(n) if n <= st.buffer.len() => n,
        Some(_) if st.ended => st.buffer.len(),
        Some(_) => 0,
    }
}

impl<M: ChunkMode> Endpoint for ReadableInner<M> {
    fn begin_destroy(self: Rc<Self>, reason: Option<&StreamError>) {
        let discarded = {
            let mut st = self.state_mut();
            if let Some(err) = reason
                && st.errored.is_none()
            {
                st.errored = Some(err.clone());
            }
            st.reading = false;
            st.buffer.clear()
        };
        let producer = self.producer.borrow_mut().take();
        drop(producer);
        trace!(stream = self.token.id(), discarded, "source buffer discarded");
    }

    fn complete_destroy(self: Rc<Self>, info: &CloseInfo) {
        let emit_error = {
            let mut st = self.state_mut();
            info.reason.is_some() && !std::mem::replace(&mut st.error_emitted, true)
        };
        if emit_error && let Some(err) = &info.reason {
            self.events.emit(&SourceEvent::Error(err.clone()));
        }
        let emit_close = {
            let mut st = self.state_mut();
            !std::mem::replace(&mut st.close_emitted, true)
        };
        if emit_close {
            self.events.emit(&SourceEvent::Close(info.clone()));
            self.events.clear();
        }
    }
}

impl<M: ChunkMode> Companion for ReadableInner<M> {
    fn side_settled(&self) -> bool {
        self.state().end_emitted
    }

    fn is_open(&self) -> bool {
        !self.state().ended && !self.token.is_destroyed()
    }

    fn half_close(self: Rc<Self>) {
        let readable = Readable { inner: self };
        if readable.is_open_for_push() {
            let _ = readable.push(None);
        }
    }

    fn record_error(&self, err: &StreamError) {
        let mut st = self.state_mut();
        if st.errored.is_none() {
            st.errored = Some(err.clone());
        }
    }
}

impl<M: ChunkMode> Readable<M> {
    fn is_open_for_push(&self) -> bool {
        !self.inner.state().ended
    }
}

impl<M: ChunkMode> fmt::Debug for Readable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state();
        f.debug_struct("Readable")
            .field("id", &self.inner.token.id())
            .field("length", &st.buffer.len())
            .field("high_water_mark", &st.high_water_mark)
            .field("flowing", &st.flowing)
            .field("ended", &st.ended)
            .field("destroyed", &self.inner.token.is_destroyed())
            .finish()
    }
}
