//! 销毁与收尾协调器。
//!
//! # 设计定位（Why）
//! - 销毁可能从任意状态、任意一端发起：生产者失败、消费者失败、调用方主动 `destroy`、管道传播，
//!   Duplex 的两侧甚至可能在同一轮内先后发起。协调器把这些入口收敛到同一个令牌上，
//!   保证拆除钩子只运行一次、`close` 每侧只发一次。
//!
//! # 契约说明（What）
//! - [`DestroyToken::destroy`] 幂等：首次调用返回 `true`，之后的调用只返回 `false`；
//! - 步骤顺序固定：翻转令牌并记录原因 → 各端点同步丢弃缓冲 → 延迟运行拆除钩子 →
//!   钩子确认后，各端点先发 `error`（若有原因且尚未发过）再发 `close`；
//! - 拆除钩子失败不会再触发 `error`，而是写入 [`CloseInfo::teardown_error`]。
//!
//! # 风险与权衡（Trade-offs）
//! - 端点以 `Weak` 登记：流句柄全部释放后，协调器不会替它们续命，`close` 也就无人可收。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::ack::Ack;
use crate::error::StreamError;
use crate::event::CloseInfo;
use crate::scheduler::Scheduler;

/// 拆除钩子：释放底层资源，完成后确认。
///
/// 钩子至多被调用一次，调用发生在 `destroy` 之后的下一轮调度。
pub trait Teardown {
    fn teardown(&mut self, reason: Option<&StreamError>, ack: Ack);
}

impl<F> Teardown for F
where
    F: FnMut(Option<&StreamError>, Ack),
{
    fn teardown(&mut self, reason: Option<&StreamError>, ack: Ack) {
        self(reason, ack)
    }
}

/// 参与销毁的一端（Source 或 Sink）。
pub(crate) trait Endpoint {
    /// 销毁开始：同步丢弃缓冲、记录错误、释放生产者/消费者。
    fn begin_destroy(self: Rc<Self>, reason: Option<&StreamError>);

    /// 拆除钩子确认后：发出 `error`（按需）与 `close`。
    fn complete_destroy(self: Rc<Self>, info: &CloseInfo);
}

/// 同一实体（单个流，或 Duplex 的两侧）共享的销毁令牌。
pub(crate) struct DestroyToken {
    id: u64,
    destroyed: Cell<bool>,
    closed: Cell<bool>,
    reason: RefCell<Option<StreamError>>,
    teardown: RefCell<Option<Box<dyn Teardown>>>,
    endpoints: RefCell<Vec<Weak<dyn Endpoint>>>,
    scheduler: Rc<dyn Scheduler>,
}

impl DestroyToken {
    pub(crate) fn new(
        scheduler: Rc<dyn Scheduler>,
        teardown: Option<Box<dyn Teardown>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: crate::next_id(),
            destroyed: Cell::new(false),
            closed: Cell::new(false),
            reason: RefCell::new(None),
            teardown: RefCell::new(teardown),
            endpoints: RefCell::new(Vec::new()),
            scheduler,
        })
    }

    /// 日志使用的实体编号。
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn attach(&self, endpoint: Weak<dyn Endpoint>) {
        self.endpoints.borrow_mut().push(endpoint);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn live_endpoints(&self) -> Vec<Rc<dyn Endpoint>> {
        self.endpoints
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// 发起销毁；重复调用返回 `false` 且没有任何副作用。
    pub(crate) fn destroy(self: &Rc<Self>, reason: Option<StreamError>) -> bool {
        if self.destroyed.replace(true) {
            debug!(stream = self.id, "destroy ignored, already destroyed");
            return false;
        }
        debug!(
            stream = self.id,
            error = reason.as_ref().map(StreamError::code),
            "destroying stream"
        );
        *self.reason.borrow_mut() = reason.clone();

        for endpoint in self.live_endpoints() {
            endpoint.begin_destroy(reason.as_ref());
        }

        let token = Rc::clone(self);
        self.scheduler
            .defer(Box::new(move || token.run_teardown()));
        true
    }

    fn run_teardown(self: Rc<Self>) {
        let hook = self.teardown.borrow_mut().take();
        let Some(mut hook) = hook else {
            self.finalize(None);
            return;
        };

        let weak = Rc::downgrade(&self);
        let ack = Ack::new("teardown", move |result| {
            if let Some(token) = weak.upgrade() {
                token.finalize(result.err());
            }
        });
        let reason = self.reason.borrow().clone();
        hook.teardown(reason.as_ref(), ack);
        // 钩子可能把确认留到之后，自身状态需随令牌存活。
        *self.teardown.borrow_mut() = Some(hook);
    }

    fn finalize(&self, teardown_error: Option<StreamError>) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(err) = &teardown_error {
            warn!(stream = self.id, code = err.code(), "teardown failed");
        }
        let info = CloseInfo {
            reason: self.reason.borrow().clone(),
            teardown_error,
        };
        for endpoint in self.live_endpoints() {
            endpoint.complete_destroy(&info);
        }
        debug!(stream = self.id, "stream closed");
    }
}

impl fmt::Debug for DestroyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyToken")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed.get())
            .field("closed", &self.closed.get())
            .finish()
    }
}
