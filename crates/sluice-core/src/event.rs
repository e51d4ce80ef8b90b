//! 通知枚举与监听器注册表。
//!
//! # 设计定位（Why）
//! - Source 与 Sink 通过通知（`data`、`drain`、`end`、`close` 等）与外界协作；管道编排器本身也只是
//!   这些通知的订阅者。
//! - 监听器在触发期间可能注册/移除其他监听器，甚至再次触发同一通知；注册表必须容忍这种重入。
//!
//! # 执行逻辑（How）
//! - 监听器以 `Rc<dyn Fn(&E)>` 保存：触发前先拍下目标快照并释放借用，逐个调用前再确认其仍然注册；
//!   因此重入触发与回调内移除都不会触发 `RefCell` 冲突。
//! - `once` 监听器在调用前即被摘除，保证至多执行一次。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::StreamError;

/// 监听器标识，用于移除。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// `close` 通知携带的结算信息。
///
/// - `reason`：触发销毁的错误（若有）；
/// - `teardown_error`：拆除钩子以失败确认时的错误，只在这里出现，不会另行触发 `error`。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub reason: Option<StreamError>,
    pub teardown_error: Option<StreamError>,
}

/// Source 侧通知。
#[derive(Clone, Debug)]
pub enum SourceEvent<C> {
    Data(C),
    Readable,
    End,
    Pause,
    Resume,
    Error(StreamError),
    Close(CloseInfo),
}

/// Source 侧通知的种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceEventKind {
    Data,
    Readable,
    End,
    Pause,
    Resume,
    Error,
    Close,
}

/// Sink 侧通知。
#[derive(Clone, Debug)]
pub enum SinkEvent {
    Drain,
    Prefinish,
    Finish,
    Error(StreamError),
    Close(CloseInfo),
}

/// Sink 侧通知的种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkEventKind {
    Drain,
    Prefinish,
    Finish,
    Error,
    Close,
}

/// 能按种类分派的通知。
pub trait Notification {
    type Kind: Copy + Eq + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

impl<C> Notification for SourceEvent<C> {
    type Kind = SourceEventKind;

    fn kind(&self) -> SourceEventKind {
        match self {
            Self::Data(_) => SourceEventKind::Data,
            Self::Readable => SourceEventKind::Readable,
            Self::End => SourceEventKind::End,
            Self::Pause => SourceEventKind::Pause,
            Self::Resume => SourceEventKind::Resume,
            Self::Error(_) => SourceEventKind::Error,
            Self::Close(_) => SourceEventKind::Close,
        }
    }
}

impl Notification for SinkEvent {
    type Kind = SinkEventKind;

    fn kind(&self) -> SinkEventKind {
        match self {
            Self::Drain => SinkEventKind::Drain,
            Self::Prefinish => SinkEventKind::Prefinish,
            Self::Finish => SinkEventKind::Finish,
            Self::Error(_) => SinkEventKind::Error,
            Self::Close(_) => SinkEventKind::Close,
        }
    }
}

struct Listener<E: Notification> {
    id: u64,
    kind: E::Kind,
    once: bool,
    handler: Rc<dyn Fn(&E)>,
}

/// 监听器注册表。
pub(crate) struct EventHub<E: Notification> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Listener<E>>>,
}

impl<E: Notification> EventHub<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
        }
    }

    fn register(&self, kind: E::Kind, once: bool, handler: Rc<dyn Fn(&E)>) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners.borrow_mut().push(Listener {
            id,
            kind,
            once,
            handler,
        });
        ListenerId(id)
    }

    pub(crate) fn on(&self, kind: E::Kind, handler: impl Fn(&E) + 'static) -> ListenerId {
        self.register(kind, false, Rc::new(handler))
    }

    pub(crate) fn once(&self, kind: E::Kind, handler: impl Fn(&E) + 'static) -> ListenerId {
        self.register(kind, true, Rc::new(handler))
    }

    /// 移除监听器，返回其种类；已不存在时返回 `None`。
    pub(crate) fn remove(&self, id: ListenerId) -> Option<E::Kind> {
        let mut listeners = self.listeners.borrow_mut();
        let index = listeners.iter().position(|l| l.id == id.0)?;
        Some(listeners.remove(index).kind)
    }

    #[cfg(test)]
    pub(crate) fn count(&self, kind: E::Kind) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.kind == kind)
            .count()
    }

    pub(crate) fn has(&self, kind: E::Kind) -> bool {
        self.listeners.borrow().iter().any(|l| l.kind == kind)
    }

    /// 触发通知，返回是否存在监听器。
    pub(crate) fn emit(&self, event: &E) -> bool {
        let kind = event.kind();
        let targets: Vec<(u64, bool, Rc<dyn Fn(&E)>)> = self
            .listeners
            .borrow()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| (l.id, l.once, Rc::clone(&l.handler)))
            .collect();
        if targets.is_empty() {
            return false;
        }

        for (id, once, handler) in targets {
            let alive = {
                let mut listeners = self.listeners.borrow_mut();
                match listeners.iter().position(|l| l.id == id) {
                    Some(index) => {
                        if once {
                            listeners.remove(index);
                        }
                        true
                    }
                    None => false,
                }
            };
            if alive {
                handler(event);
            }
        }
        true
    }

    /// 清空全部监听器；`close` 之后调用以断开闭包持有的引用环。
    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.listeners.borrow_mut());
        drop(drained);
    }
}
