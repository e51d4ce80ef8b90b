//! 测试桩：可复用的生产者、消费者与通知记录器。
//!
//! # 设计定位（Why）
//! - 状态机测试几乎都需要“按顺序推送一串数据的生产者”和“记录收到内容、可控确认时机的消费者”；
//!   集中在这里可以避免每个测试文件各写一份，接口调整时也只需改一处。
//!
//! # 使用方式（How）
//! - [`VecProducer`]：每次补货尽量推送，直到 `push` 返回 `false`，数据耗尽后推送结束标记；
//! - [`RecordingConsumer`] + [`ConsumerProbe`]：消费者交给 Sink，探针留在测试里断言与手动确认；
//! - [`EventLog`]：按 `标签:通知` 的格式记录两端的通知顺序。
//!
//! # 风险与权衡（Trade-offs）
//! - 桩对象只服务测试与示例，不做任何性能考虑。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::ack::Ack;
use crate::chunk::ChunkMode;
use crate::error::StreamError;
use crate::event::{SinkEvent, SinkEventKind, SourceEventKind};
use crate::readable::{Producer, Readable};
use crate::scheduler::Scheduler;
use crate::writable::{Consumer, Writable};

/// 按顺序推送固定数据的生产者。
pub struct VecProducer<C> {
    chunks: VecDeque<C>,
    ended: bool,
}

impl<C> VecProducer<C> {
    pub fn new(chunks: impl IntoIterator<Item = C>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
            ended: false,
        }
    }
}

impl<M: ChunkMode> Producer<M> for VecProducer<M::Chunk> {
    fn produce(&mut self, _size: usize, source: &Readable<M>) {
        while let Some(chunk) = self.chunks.pop_front() {
            match source.push(Some(chunk)) {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
        }
        if !self.ended {
            self.ended = true;
            let _ = source.push(None);
        }
    }
}

/// 消费者的确认方式。
#[derive(Clone)]
pub enum AckMode {
    /// 在 `consume` 内同步确认。
    Immediate,
    /// 延迟到调度器的下一轮确认。
    Deferred(Rc<dyn Scheduler>),
    /// 由测试通过 [`ConsumerProbe::release_one`] 手动确认。
    Manual,
}

impl fmt::Debug for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

struct ProbeState<C> {
    received: Vec<C>,
    batches: Vec<usize>,
    pending: VecDeque<Ack>,
    fail_next: Option<StreamError>,
    finalized: bool,
}

/// 测试侧持有的消费者探针。
pub struct ConsumerProbe<C> {
    state: Rc<RefCell<ProbeState<C>>>,
}

impl<C> Clone for ConsumerProbe<C> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<C: Clone> ConsumerProbe<C> {
    /// 已交付给消费者的全部数据（按交付顺序）。
    pub fn received(&self) -> Vec<C> {
        self.state.borrow().received.clone()
    }
}

impl<C> ConsumerProbe<C> {
    pub fn received_len(&self) -> usize {
        self.state.borrow().received.len()
    }

    /// 每次批量交付的块数。
    pub fn batches(&self) -> Vec<usize> {
        self.state.borrow().batches.clone()
    }

    /// 等待手动确认的交付数。
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.borrow().finalized
    }

    /// 确认最早一次未确认的交付。
    pub fn release_one(&self) -> bool {
        let ack = self.state.borrow_mut().pending.pop_front();
        match ack {
            Some(ack) => {
                ack.success();
                true
            }
            None => false,
        }
    }

    /// 持续确认直到没有未确认的交付；确认过程中新到达的交付也会被确认。
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_one() {
            released += 1;
        }
        released
    }

    /// 让下一次交付以 `err` 失败。
    pub fn fail_next(&self, err: StreamError) {
        self.state.borrow_mut().fail_next = Some(err);
    }
}

/// 记录收到内容的消费者。
pub struct RecordingConsumer<M: ChunkMode> {
    probe: ConsumerProbe<M::Chunk>,
    mode: AckMode,
    batching: bool,
}

impl<M: ChunkMode> RecordingConsumer<M> {
    pub fn new(mode: AckMode) -> (Self, ConsumerProbe<M::Chunk>) {
        let probe = ConsumerProbe {
            state: Rc::new(RefCell::new(ProbeState {
                received: Vec::new(),
                batches: Vec::new(),
                pending: VecDeque::new(),
                fail_next: None,
                finalized: false,
            })),
        };
        let consumer = Self {
            probe: probe.clone(),
            mode,
            batching: false,
        };
        (consumer, probe)
    }

    /// 启用批量消费。
    pub fn with_batching(mut self) -> Self {
        self.batching = true;
        self
    }

    fn settle(&self, ack: Ack) {
        let failure = self.probe.state.borrow_mut().fail_next.take();
        if let Some(err) = failure {
            ack.fail(err);
            return;
        }
        match &self.mode {
            AckMode::Immediate => ack.success(),
            AckMode::Deferred(scheduler) => scheduler.defer(Box::new(move || ack.success())),
            AckMode::Manual => self.probe.state.borrow_mut().pending.push_back(ack),
        }
    }
}

impl<M: ChunkMode> Consumer<M> for RecordingConsumer<M> {
    fn consume(&mut self, chunk: M::Chunk, ack: Ack) {
        self.probe.state.borrow_mut().received.push(chunk);
        self.settle(ack);
    }

    fn supports_batch(&self) -> bool {
        self.batching
    }

    fn consume_batch(&mut self, chunks: Vec<M::Chunk>, ack: Ack) {
        {
            let mut state = self.probe.state.borrow_mut();
            state.batches.push(chunks.len());
            state.received.extend(chunks);
        }
        self.settle(ack);
    }

    fn finalize(&mut self, ack: Ack) {
        self.probe.state.borrow_mut().finalized = true;
        ack.success();
    }
}

/// 通知顺序记录器。
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录 Source 的 `end`/`pause`/`resume`/`error`/`close`；不订阅 `data`，不改变流动模式。
    pub fn attach_source<M: ChunkMode>(&self, source: &Readable<M>, label: &str) {
        for kind in [
            SourceEventKind::End,
            SourceEventKind::Pause,
            SourceEventKind::Resume,
            SourceEventKind::Error,
            SourceEventKind::Close,
        ] {
            let entries = Rc::clone(&self.entries);
            let entry = format!("{label}:{}", format!("{kind:?}").to_lowercase());
            source.on(kind, move |_| entries.borrow_mut().push(entry.clone()));
        }
    }

    /// 记录 Sink 的全部通知。
    pub fn attach_sink<M: ChunkMode>(&self, sink: &Writable<M>, label: &str) {
        for kind in [
            SinkEventKind::Drain,
            SinkEventKind::Prefinish,
            SinkEventKind::Finish,
            SinkEventKind::Error,
            SinkEventKind::Close,
        ] {
            let entries = Rc::clone(&self.entries);
            let label = label.to_owned();
            sink.on(kind, move |event| {
                let name = match event {
                    SinkEvent::Drain => "drain",
                    SinkEvent::Prefinish => "prefinish",
                    SinkEvent::Finish => "finish",
                    SinkEvent::Error(_) => "error",
                    SinkEvent::Close(_) => "close",
                };
                entries.borrow_mut().push(format!("{label}:{name}"));
            });
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    /// 某条记录出现的次数。
    pub fn count(&self, entry: &str) -> usize {
        self.entries.borrow().iter().filter(|e| *e == entry).count()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.borrow().iter()).finish()
    }
}
