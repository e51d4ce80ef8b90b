//! 流水线：带双向错误传播的管道链，以及结束观察器。
//!
//! # 设计定位（Why）
//! - 普通 [`pipe`](crate::pipe::pipe) 保留了“Source 出错不销毁 Sink”的非对称行为；
//!   流水线在其之上补齐对称语义：任何一级失败或提前关闭都会以同一个错误销毁所有参与者，
//!   并在所有参与者都进入终态后结算一个 [`Completion`]。
//!
//! # 契约说明（What）
//! - [`finished`] 对每一级只回调一次：Source 发出 `end`、Sink 发出 `finish` 为成功；
//!   `error` 为失败；先于结束发生的 `close` 报告 [`StreamError::PrematureClose`]；
//! - 双工级需要两侧都结束才算成功，任一侧失败立即失败；
//! - [`Completion`] 结算后清空内部持有的各级句柄，释放引用。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use tracing::{debug, warn};

use crate::chunk::ChunkMode;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::event::{SinkEvent, SinkEventKind, SourceEvent, SourceEventKind};
use crate::pipe::{PipeOptions, pipe};
use crate::readable::{Readable, ReadableInner};
use crate::transform::Transform;
use crate::writable::{Writable, WritableInner};

/// 结束回调。
pub type StageCallback = Box<dyn FnOnce(Result<(), StreamError>) + 'static>;

/// 可以被观察结束、也可以被整体销毁的一级。
pub trait StreamStage {
    /// 注册结束回调；回调至多执行一次，已处于终态时延迟到下一轮执行。
    fn watch(&self, callback: StageCallback);

    /// 销毁这一级。
    fn destroy_stage(&self, err: Option<StreamError>);
}

/// 观察一级的结束。
pub fn finished(stage: &dyn StreamStage, callback: impl FnOnce(Result<(), StreamError>) + 'static) {
    stage.watch(Box::new(callback));
}

/// 只允许结算一次的回调槽。
#[derive(Clone)]
struct SettleOnce {
    slot: Rc<RefCell<Option<StageCallback>>>,
}

impl SettleOnce {
    fn new(callback: StageCallback) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(callback))),
        }
    }

    fn settle(&self, result: Result<(), StreamError>) {
        let callback = self.slot.borrow_mut().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

impl<M: ChunkMode> StreamStage for Readable<M> {
    fn watch(&self, callback: StageCallback) {
        let once = SettleOnce::new(callback);
        let settled = {
            let st = self.inner.state();
            if st.end_emitted {
                Some(Ok(()))
            } else if st.error_emitted || st.close_emitted {
                Some(Err(st.errored.clone().unwrap_or(StreamError::PrematureClose)))
            } else {
                None
            }
        };
        if let Some(result) = settled {
            self.inner
                .token
                .scheduler()
                .defer(Box::new(move || once.settle(result)));
            return;
        }

        {
            let once = once.clone();
            self.once(SourceEventKind::End, move |_| once.settle(Ok(())));
        }
        {
            let once = once.clone();
            self.once(SourceEventKind::Error, move |event| {
                if let SourceEvent::Error(err) = event {
                    once.settle(Err(err.clone()));
                }
            });
        }
        let weak: Weak<ReadableInner<M>> = Rc::downgrade(&self.inner);
        self.once(SourceEventKind::Close, move |_| {
            let result = match weak.upgrade() {
                Some(inner) => {
                    let st = inner.state();
                    if st.end_emitted {
                        Ok(())
                    } else {
                        Err(st.errored.clone().unwrap_or(StreamError::PrematureClose))
                    }
                }
                None => Err(StreamError::PrematureClose),
            };
            once.settle(result);
        });
    }

    fn destroy_stage(&self, err: Option<StreamError>) {
        self.destroy(err);
    }
}

impl<M: ChunkMode> StreamStage for Writable<M> {
    fn watch(&self, callback: StageCallback) {
        let once = SettleOnce::new(callback);
        let settled = {
            let st = self.inner.state();
            if st.finished {
                Some(Ok(()))
            } else if st.error_emitted || st.close_emitted {
                Some(Err(st.errored.clone().unwrap_or(StreamError::PrematureClose)))
            } else {
                None
            }
        };
        if let Some(result) = settled {
            self.inner
                .token
                .scheduler()
                .defer(Box::new(move || once.settle(result)));
            return;
        }

        {
            let once = once.clone();
            self.once(SinkEventKind::Finish, move |_| once.settle(Ok(())));
        }
        {
            let once = once.clone();
            self.once(SinkEventKind::Error, move |event| {
                if let SinkEvent::Error(err) = event {
                    once.settle(Err(err.clone()));
                }
            });
        }
        let weak: Weak<WritableInner<M>> = Rc::downgrade(&self.inner);
        self.once(SinkEventKind::Close, move |_| {
            let result = match weak.upgrade() {
                Some(inner) => {
                    let st = inner.state();
                    if st.finished {
                        Ok(())
                    } else {
                        Err(st.errored.clone().unwrap_or(StreamError::PrematureClose))
                    }
                }
                None => Err(StreamError::PrematureClose),
            };
            once.settle(result);
        });
    }

    fn destroy_stage(&self, err: Option<StreamError>) {
        self.destroy(err);
    }
}

/// 合并两侧的结束：都成功才成功，任一侧失败立即失败。
fn watch_both(readable: &dyn StreamStage, writable: &dyn StreamStage, callback: StageCallback) {
    let once = SettleOnce::new(callback);
    let pending = Rc::new(Cell::new(2_u8));
    for side in [readable, writable] {
        let once = once.clone();
        let pending = Rc::clone(&pending);
        side.watch(Box::new(move |result| match result {
            Err(err) => once.settle(Err(err)),
            Ok(()) => {
                pending.set(pending.get().saturating_sub(1));
                if pending.get() == 0 {
                    once.settle(Ok(()));
                }
            }
        }));
    }
}

impl<R: ChunkMode, W: ChunkMode> StreamStage for Duplex<R, W> {
    fn watch(&self, callback: StageCallback) {
        watch_both(self.readable(), self.writable(), callback);
    }

    fn destroy_stage(&self, err: Option<StreamError>) {
        self.destroy(err);
    }
}

impl<I: ChunkMode, O: ChunkMode> StreamStage for Transform<I, O> {
    fn watch(&self, callback: StageCallback) {
        watch_both(self.readable(), self.writable(), callback);
    }

    fn destroy_stage(&self, err: Option<StreamError>) {
        self.destroy(err);
    }
}

/// 可以作为流水线中间级的双工实体。
pub trait DuplexStage: StreamStage + Clone + 'static {
    type Input: ChunkMode;
    type Output: ChunkMode;

    fn input(&self) -> &Writable<Self::Input>;
    fn output(&self) -> &Readable<Self::Output>;
}

impl<I: ChunkMode, O: ChunkMode> DuplexStage for Transform<I, O> {
    type Input = I;
    type Output = O;

    fn input(&self) -> &Writable<I> {
        self.writable()
    }

    fn output(&self) -> &Readable<O> {
        self.readable()
    }
}

impl<R: ChunkMode, W: ChunkMode> DuplexStage for Duplex<R, W> {
    type Input = W;
    type Output = R;

    fn input(&self) -> &Writable<W> {
        self.writable()
    }

    fn output(&self) -> &Readable<R> {
        self.readable()
    }
}

/// 流水线构造器：`from_source` → 若干 `through` → `into_sink`。
pub struct Pipeline<M: ChunkMode> {
    tail: Readable<M>,
    stages: Vec<Box<dyn StreamStage>>,
}

impl<M: ChunkMode> Pipeline<M> {
    pub fn from_source(source: &Readable<M>) -> Self {
        Self {
            tail: source.clone(),
            stages: vec![Box::new(source.clone())],
        }
    }

    /// 接入一个中间级。
    pub fn through<S>(mut self, stage: &S) -> Pipeline<S::Output>
    where
        S: DuplexStage<Input = M>,
    {
        pipe(&self.tail, stage.input(), PipeOptions::default());
        self.stages.push(Box::new(stage.clone()));
        Pipeline {
            tail: stage.output().clone(),
            stages: self.stages,
        }
    }

    /// 接入终点并开始观察；返回的 [`Completion`] 在所有级进入终态后结算。
    pub fn into_sink(mut self, sink: &Writable<M>) -> Completion {
        pipe(&self.tail, sink, PipeOptions::default());
        self.stages.push(Box::new(sink.clone()));

        let completion = Completion::default();
        let run = Rc::new(PipelineRun {
            remaining: Cell::new(self.stages.len()),
            error: RefCell::new(None),
            stages: RefCell::new(Vec::new()),
            completion: completion.clone(),
        });
        debug!(stages = self.stages.len(), "pipeline started");

        for (index, stage) in self.stages.iter().enumerate() {
            let run = Rc::clone(&run);
            stage.watch(Box::new(move |result| run.on_stage_done(index, result)));
        }
        *run.stages.borrow_mut() = self.stages;
        completion
    }
}

impl<M: ChunkMode> fmt::Debug for Pipeline<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// 源与终点之间没有中间级时的快捷方式。
pub fn pipeline<M: ChunkMode>(source: &Readable<M>, sink: &Writable<M>) -> Completion {
    Pipeline::from_source(source).into_sink(sink)
}

struct PipelineRun {
    remaining: Cell<usize>,
    error: RefCell<Option<StreamError>>,
    stages: RefCell<Vec<Box<dyn StreamStage>>>,
    completion: Completion,
}

impl PipelineRun {
    fn on_stage_done(&self, index: usize, result: Result<(), StreamError>) {
        self.remaining.set(self.remaining.get().saturating_sub(1));

        if let Err(err) = result {
            let first = {
                let mut slot = self.error.borrow_mut();
                if slot.is_none() {
                    *slot = Some(err.clone());
                    true
                } else {
                    false
                }
            };
            if first {
                warn!(stage = index, code = err.code(), "pipeline stage failed, destroying all stages");
                let stages = std::mem::take(&mut *self.stages.borrow_mut());
                for stage in &stages {
                    stage.destroy_stage(Some(err.clone()));
                }
                *self.stages.borrow_mut() = stages;
            }
        }

        if self.remaining.get() == 0 {
            let result = match self.error.borrow_mut().take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            self.stages.borrow_mut().clear();
            debug!(ok = result.is_ok(), "pipeline settled");
            self.completion.settle(result);
        }
    }
}

#[derive(Default)]
struct CompletionInner {
    result: RefCell<Option<Result<(), StreamError>>>,
    waker: RefCell<Option<Waker>>,
    callbacks: RefCell<Vec<StageCallback>>,
}

/// 流水线的结算信号；也可以作为 `Future` 等待。
#[derive(Clone, Default)]
pub struct Completion {
    inner: Rc<CompletionInner>,
}

impl Completion {
    fn settle(&self, result: Result<(), StreamError>) {
        {
            let mut slot = self.inner.result.borrow_mut();
            if slot.is_some() {
                return;
            }
            *slot = Some(result.clone());
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        for callback in callbacks {
            callback(result.clone());
        }
        let waker = self.inner.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// 结算结果；尚未结算时返回 `None`。
    pub fn result(&self) -> Option<Result<(), StreamError>> {
        self.inner.result.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.result.borrow().is_some()
    }

    /// 结算时回调；已经结算则立即回调。
    pub fn on_settled(&self, callback: impl FnOnce(Result<(), StreamError>) + 'static) {
        let settled = self.result();
        match settled {
            Some(result) => callback(result),
            None => self.inner.callbacks.borrow_mut().push(Box::new(callback)),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let settled = self.inner.result.borrow().clone();
        match settled {
            Some(result) => Poll::Ready(result),
            None => {
                *self.inner.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &*self.inner.result.borrow())
            .finish()
    }
}
