//! 管道编排：把一个 Source 的数据转发到一个或多个 Sink。
//!
//! # 设计定位（Why）
//! - 管道本身不持有数据，只订阅两端的通知并转发：Source 的 `data` 写入 Sink，Sink 的 `drain`
//!   恢复 Source，Source 的 `end` 结束 Sink。
//! - 一个 Source 可以连接多个 Sink，任何一个 Sink 报告背压都会暂停 Source，最慢的 Sink 决定节奏。
//!
//! # 契约说明（What）
//! - Source 出错时**不会**销毁 Sink；需要双向传播时使用 [`crate::pipeline::Pipeline`]；
//! - Sink 出错、关闭或完成时移除对应连接，其余连接继续流动；
//! - 向 Sink 写入被同步拒绝时移除连接；协作方错误交给该 Sink，调用顺序违规只记日志，Sink 状态不变。
//!
//! # 风险与权衡（Trade-offs）
//! - Source 的 `data` 监听器强引用 Sink，其余回调只持有弱引用，连接不会让两端互相续命。

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::chunk::ChunkMode;
use crate::event::{ListenerId, SinkEventKind, SourceEvent, SourceEventKind};
use crate::readable::{Readable, ReadableInner};
use crate::writable::{Writable, WritableInner};

/// 管道选项。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeOptions {
    /// Source 结束时是否结束 Sink。
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// Source 状态中登记的一条连接。
pub(crate) struct PipeConnection {
    id: u64,
    detach: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl PipeConnection {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn is_attached(&self) -> bool {
        self.detach.borrow().is_some()
    }

    /// 拆除连接；只有第一次调用生效。
    fn detach(&self) -> bool {
        let detach = self.detach.borrow_mut().take();
        match detach {
            Some(detach) => {
                detach();
                true
            }
            None => false,
        }
    }
}

/// [`pipe`] 返回的连接句柄。
pub struct PipeLink {
    connection: Rc<PipeConnection>,
}

impl PipeLink {
    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    /// 断开这条连接；Source 不再有连接时会被暂停。
    pub fn unpipe(&self) -> bool {
        self.connection.detach()
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_attached()
    }
}

impl fmt::Debug for PipeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeLink")
            .field("id", &self.connection.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// 把 `source` 接到 `sink`。
///
/// # 执行逻辑（How）
/// 1. 在 Source 上登记连接并订阅 `data` 与 `end`；
/// 2. 在 Sink 上订阅 `drain`，以及一次性的 `error`/`close`/`finish`（任一触发即断开）；
/// 3. Sink 已处于背压时先暂停 Source，否则让 Source 进入流动模式（延迟到下一轮）。
pub fn pipe<M: ChunkMode>(source: &Readable<M>, sink: &Writable<M>, options: PipeOptions) -> PipeLink {
    let connection = Rc::new(PipeConnection {
        id: crate::next_id(),
        detach: RefCell::new(None),
    });
    let id = connection.id();
    let source_id = source.inner.token.id();
    source.inner.state_mut().pipes.push(Rc::clone(&connection));
    debug!(stream = source_id, pipe = id, end = options.end, "pipe attached");

    let source_weak: Weak<ReadableInner<M>> = Rc::downgrade(&source.inner);
    let sink_weak: Weak<WritableInner<M>> = Rc::downgrade(&sink.inner);
    let link_weak = Rc::downgrade(&connection);

    let data_id = {
        let sink = sink.clone();
        let source_weak = source_weak.clone();
        let link_weak = link_weak.clone();
        source.on(SourceEventKind::Data, move |event| {
            let SourceEvent::Data(chunk) = event else {
                return;
            };
            match sink.write(chunk.clone()) {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(inner) = source_weak.upgrade() {
                        await_drain(&Readable { inner }, id);
                    }
                }
                Err(err) => {
                    warn!(pipe = id, code = err.code(), "pipe write rejected, unpiping");
                    if let Some(link) = link_weak.upgrade() {
                        link.detach();
                    }
                    // 调用顺序违规不改变 Sink 状态，只断开本连接。
                    if !err.is_protocol_violation() {
                        sink.fail(err);
                    }
                }
            }
        })
    };

    let on_end = {
        let sink_weak = sink_weak.clone();
        let link_weak = link_weak.clone();
        move || {
            if options.end
                && let Some(inner) = sink_weak.upgrade()
            {
                trace!(pipe = id, "source ended, ending sink");
                if let Err(err) = (Writable { inner }).end(None) {
                    trace!(pipe = id, code = err.code(), "sink already ending, end skipped");
                }
            }
            if let Some(link) = link_weak.upgrade() {
                link.detach();
            }
        }
    };
    let end_emitted = source.is_end_emitted();
    let end_id = if end_emitted {
        source.inner.token.scheduler().defer(Box::new(on_end));
        None
    } else {
        let on_end = RefCell::new(Some(on_end));
        Some(source.once(SourceEventKind::End, move |_| {
            let on_end = on_end.borrow_mut().take();
            if let Some(on_end) = on_end {
                on_end();
            }
        }))
    };

    let source_close_id = {
        let link_weak = link_weak.clone();
        source.once(SourceEventKind::Close, move |_| {
            if let Some(link) = link_weak.upgrade() {
                link.detach();
            }
        })
    };

    let drain_id = {
        let source_weak = source_weak.clone();
        sink.on(SinkEventKind::Drain, move |_| {
            if let Some(inner) = source_weak.upgrade() {
                on_sink_drain(&Readable { inner }, id);
            }
        })
    };

    let unpipe_on = |kind: SinkEventKind| {
        let link_weak = link_weak.clone();
        sink.once(kind, move |_| {
            if let Some(link) = link_weak.upgrade() {
                link.detach();
            }
        })
    };
    let sink_ids = vec![
        drain_id,
        unpipe_on(SinkEventKind::Error),
        unpipe_on(SinkEventKind::Close),
        unpipe_on(SinkEventKind::Finish),
    ];
    let mut source_ids = vec![data_id, source_close_id];
    source_ids.extend(end_id);

    *connection.detach.borrow_mut() = Some(Box::new(move || {
        detach(&source_weak, &sink_weak, id, &source_ids, &sink_ids);
    }));

    if sink.need_drain() {
        trace!(pipe = id, "sink already saturated, pausing source");
        await_drain(source, id);
    } else if source.flowing() != Some(true) {
        source.resume();
    }

    PipeLink { connection }
}

fn await_drain<M: ChunkMode>(source: &Readable<M>, id: u64) {
    let attached = {
        let mut st = source.inner.state_mut();
        let attached = st.pipes.iter().any(|link| link.id() == id);
        if attached {
            st.await_drain.insert(id);
        }
        attached
    };
    if attached {
        trace!(stream = source.inner.token.id(), pipe = id, "sink saturated, pausing source");
        source.pause();
    }
}

fn on_sink_drain<M: ChunkMode>(source: &Readable<M>, id: u64) {
    let resume = {
        let mut st = source.inner.state_mut();
        st.await_drain.remove(&id);
        st.await_drain.is_empty()
    };
    if resume && source.inner.events.has(SourceEventKind::Data) {
        trace!(stream = source.inner.token.id(), pipe = id, "sink drained, resuming source");
        source.resume();
    }
}

fn detach<M: ChunkMode>(
    source: &Weak<ReadableInner<M>>,
    sink: &Weak<WritableInner<M>>,
    id: u64,
    source_ids: &[ListenerId],
    sink_ids: &[ListenerId],
) {
    if let Some(inner) = sink.upgrade() {
        for listener in sink_ids {
            inner.events.remove(*listener);
        }
    }
    let Some(inner) = source.upgrade() else {
        return;
    };
    for listener in source_ids {
        inner.events.remove(*listener);
    }
    let pause = {
        let mut st = inner.state_mut();
        st.pipes.retain(|link| link.id() != id);
        st.await_drain.remove(&id);
        st.pipes.is_empty() && !st.end_emitted && !inner.token.is_destroyed()
    };
    debug!(stream = inner.token.id(), pipe = id, "pipe detached");
    if pause {
        Readable { inner }.pause();
    }
}

impl<M: ChunkMode> Readable<M> {
    /// 等价于 [`pipe(self, sink, options)`](pipe)。
    pub fn pipe(&self, sink: &Writable<M>, options: PipeOptions) -> PipeLink {
        pipe(self, sink, options)
    }

    /// 断开全部连接，返回断开的数量。
    pub fn unpipe_all(&self) -> usize {
        let links: Vec<Rc<PipeConnection>> = self.inner.state().pipes.clone();
        links.iter().filter(|link| link.detach()).count()
    }

    /// 当前连接数。
    pub fn pipe_count(&self) -> usize {
        self.inner.state().pipes.len()
    }
}
