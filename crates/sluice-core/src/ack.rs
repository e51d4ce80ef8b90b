//! 一次性确认句柄。
//!
//! # 设计定位（Why）
//! - 消费者、拆除钩子、变换映射都以“回调确认”的方式告诉状态机一次异步操作已经结束；
//!   把回调封装为按值消费的 [`Ack`]，“确认恰好一次”由所有权保证，而不是靠运行期计数。
//! - 协作方如果忘记确认就丢弃句柄，状态机会永远等待；[`Drop`] 兜底以
//!   [`StreamError::AckDropped`] 结算，并打一条 `warn` 日志。
//!
//! # 契约说明（What）
//! - `success` / `fail` / `settle` 均消费 `self`，编译期即杜绝重复确认；
//! - 确认可以在协作方调用栈内同步发生，也可以之后任意时刻发生。

use std::fmt;

use tracing::warn;

use crate::error::StreamError;

type Settle = Box<dyn FnOnce(Result<(), StreamError>) + 'static>;

/// 一次性确认句柄。
pub struct Ack {
    callback: Option<Settle>,
    op: &'static str,
}

impl Ack {
    pub(crate) fn new(
        op: &'static str,
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            op,
        }
    }

    /// 确认成功。
    pub fn success(self) {
        self.settle(Ok(()));
    }

    /// 以错误结算。
    pub fn fail(self, err: StreamError) {
        self.settle(Err(err));
    }

    /// 以给定结果结算。
    pub fn settle(mut self, result: Result<(), StreamError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// 该确认所属的操作名（`write`、`final`、`teardown` 等）。
    pub fn op(&self) -> &'static str {
        self.op
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(op = self.op, "acknowledgement dropped without being settled");
            callback(Err(StreamError::AckDropped { op: self.op }));
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("op", &self.op)
            .field("settled", &self.callback.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tracing_test::traced_test;

    fn recording(op: &'static str) -> (Ack, Rc<RefCell<Vec<Result<(), StreamError>>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let ack = Ack::new(op, move |result| sink.borrow_mut().push(result));
        (ack, seen)
    }

    #[test]
    fn settles_exactly_once() {
        let (ack, seen) = recording("write");
        ack.fail(StreamError::consumer("boom"));
        assert_eq!(*seen.borrow(), vec![Err(StreamError::consumer("boom"))]);
    }

    #[traced_test]
    #[test]
    fn dropping_unsettled_ack_reports_error() {
        let (ack, seen) = recording("final");
        drop(ack);
        assert_eq!(
            *seen.borrow(),
            vec![Err(StreamError::AckDropped { op: "final" })]
        );
        assert!(logs_contain("acknowledgement dropped"));
    }
}
