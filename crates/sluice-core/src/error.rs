//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 Source/Sink 状态机对外暴露的错误语义提供集中定义；
//! - 区分生产者、消费者、协议违规与拆除钩子四类来源，方便调用方决定是告警、重建链路还是修正调用顺序。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，并保持 `Clone + PartialEq`，以便同一个错误同时递交给
//!   `error` 通知、写回调与管道完成句柄；
//! - 每个变体都映射到稳定错误码（见 [`codes`]），日志与断言以错误码为准，不依赖消息文本。
//!
//! ## 扩展建议（How）
//! - 新增变体时同步补充 [`StreamError::code`] 与 [`StreamError::category`]；
//! - 协议违规一律以同步 `Err` 返回，不得修改状态机。

use std::borrow::Cow;

use thiserror::Error;

/// 稳定错误码常量表。
pub mod codes {
    pub const PRODUCER_FAILED: &str = "stream.producer.failed";
    pub const CONSUMER_FAILED: &str = "stream.consumer.failed";
    pub const TEARDOWN_FAILED: &str = "stream.teardown.failed";
    pub const WRITE_AFTER_END: &str = "stream.write_after_end";
    pub const END_AFTER_END: &str = "stream.end_after_end";
    pub const ALREADY_FINISHED: &str = "stream.already_finished";
    pub const PUSH_AFTER_END: &str = "stream.push_after_end";
    pub const UNSHIFT_AFTER_END: &str = "stream.unshift_after_end";
    pub const DESTROYED: &str = "stream.destroyed";
    pub const PREMATURE_CLOSE: &str = "stream.premature_close";
    pub const ACK_DROPPED: &str = "stream.ack_dropped";
    pub const INVALID_ARGUMENT: &str = "stream.invalid_argument";
}

/// 错误来源分类。
///
/// - `Producer`：数据源在产出阶段失败；
/// - `Consumer`：消费者确认失败或批量写失败；
/// - `Protocol`：调用顺序违规（结束后写入、重复结束等），以同步 `Err` 返回；
/// - `Teardown`：拆除钩子失败，只附着在 `close` 通知上。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Producer,
    Consumer,
    Protocol,
    Teardown,
}

/// 流状态机错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“协作方失败”和“调用方违规”放进同一枚举，调用方只需处理一种错误类型；
///   借助 [`ErrorCategory`] 再做粗粒度分流。
/// - **契约 (What)**：
///   - 协作方失败（`Producer`/`Consumer`/`Teardown`）携带人类可读消息；
///   - 协议违规变体不携带负载，出现即意味着调用顺序错误，状态机本身未被修改；
///   - `Destroyed { op }` 与 `AckDropped { op }` 记录触发的操作名，便于定位。
/// - **设计权衡 (Trade-offs)**：消息使用 `Cow<'static, str>`，静态文案零分配，动态上下文才分配堆内存。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// 数据源产出失败。
    #[error("producer failed: {message}")]
    Producer { message: Cow<'static, str> },

    /// 消费者确认失败。
    #[error("consumer failed: {message}")]
    Consumer { message: Cow<'static, str> },

    /// 拆除钩子确认失败。
    #[error("teardown failed: {message}")]
    Teardown { message: Cow<'static, str> },

    /// 调用 `end` 之后继续写入。
    #[error("write after end")]
    WriteAfterEnd,

    /// 重复调用 `end`。
    #[error("end called more than once")]
    EndAfterEnd,

    /// Sink 已经完成，又收到 `end`。
    #[error("stream already finished")]
    AlreadyFinished,

    /// 推送结束标记之后继续推送数据。
    #[error("push after end of stream")]
    PushAfterEnd,

    /// `end` 通知已经发出之后回填数据。
    #[error("unshift after end event")]
    UnshiftAfterEnd,

    /// 在销毁之后调用了会改变状态的操作。
    #[error("cannot call `{op}` after stream was destroyed")]
    Destroyed { op: &'static str },

    /// 管道中的某一段在结束/完成之前被关闭。
    #[error("premature close")]
    PrematureClose,

    /// 协作方丢弃了确认句柄而没有调用它。
    #[error("acknowledgement for `{op}` dropped without being settled")]
    AckDropped { op: &'static str },

    /// 配置或参数越界。
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: Cow<'static, str>,
    },
}

impl StreamError {
    /// 构造数据源失败错误。
    pub fn producer(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Producer {
            message: message.into(),
        }
    }

    /// 构造消费者失败错误。
    pub fn consumer(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Consumer {
            message: message.into(),
        }
    }

    /// 构造拆除钩子失败错误。
    pub fn teardown(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Teardown {
            message: message.into(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Producer { .. } => codes::PRODUCER_FAILED,
            Self::Consumer { .. } => codes::CONSUMER_FAILED,
            Self::Teardown { .. } => codes::TEARDOWN_FAILED,
            Self::WriteAfterEnd => codes::WRITE_AFTER_END,
            Self::EndAfterEnd => codes::END_AFTER_END,
            Self::AlreadyFinished => codes::ALREADY_FINISHED,
            Self::PushAfterEnd => codes::PUSH_AFTER_END,
            Self::UnshiftAfterEnd => codes::UNSHIFT_AFTER_END,
            Self::Destroyed { .. } => codes::DESTROYED,
            Self::PrematureClose => codes::PREMATURE_CLOSE,
            Self::AckDropped { .. } => codes::ACK_DROPPED,
            Self::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
        }
    }

    /// 返回错误分类。
    ///
    /// `AckDropped` 按丢失的确认归属判定：拆除钩子的确认归入 `Teardown`，其余视为消费者失败。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Producer { .. } => ErrorCategory::Producer,
            Self::Consumer { .. } | Self::PrematureClose => ErrorCategory::Consumer,
            Self::Teardown { .. } => ErrorCategory::Teardown,
            Self::AckDropped { op } if *op == "teardown" => ErrorCategory::Teardown,
            Self::AckDropped { .. } => ErrorCategory::Consumer,
            Self::WriteAfterEnd
            | Self::EndAfterEnd
            | Self::AlreadyFinished
            | Self::PushAfterEnd
            | Self::UnshiftAfterEnd
            | Self::Destroyed { .. }
            | Self::InvalidArgument { .. } => ErrorCategory::Protocol,
        }
    }

    /// 是否属于调用顺序违规。
    pub fn is_protocol_violation(&self) -> bool {
        self.category() == ErrorCategory::Protocol
    }
}

/// 流操作的统一返回类型。
pub type Result<T, E = StreamError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_categorised() {
        assert_eq!(StreamError::WriteAfterEnd.code(), "stream.write_after_end");
        assert!(StreamError::EndAfterEnd.is_protocol_violation());
        assert_eq!(
            StreamError::producer("disk gone").category(),
            ErrorCategory::Producer
        );
        assert_eq!(
            StreamError::AckDropped { op: "teardown" }.category(),
            ErrorCategory::Teardown
        );
        assert_eq!(
            StreamError::AckDropped { op: "write" }.category(),
            ErrorCategory::Consumer
        );
    }

    #[test]
    fn display_carries_context() {
        let err = StreamError::Destroyed { op: "write" };
        assert_eq!(
            err.to_string(),
            "cannot call `write` after stream was destroyed"
        );
        assert_eq!(
            StreamError::consumer("socket reset").to_string(),
            "consumer failed: socket reset"
        );
    }
}
