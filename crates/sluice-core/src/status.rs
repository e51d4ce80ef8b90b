//! Source/Sink 对外可见的状态枚举。
//!
//! 内部状态由若干布尔标志组合而成，这里把它们折叠成调用方能理解的离散状态，
//! 优先级固定：错误 > 结束/完成 > 销毁 > 其余运行态。

use std::fmt;

/// Source 状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceState {
    /// 尚未选择消费模式。
    Initial,
    /// 主动推送 `data` 通知。
    Flowing,
    /// 等待调用方 `read`。
    Paused,
    /// 补货请求在途。
    Reading,
    /// 已收到结束标记。
    Ended,
    Errored,
    Destroyed,
}

impl SourceState {
    /// 是否不再接收新数据。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored | Self::Destroyed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Flowing => "flowing",
            Self::Paused => "paused",
            Self::Reading => "reading",
            Self::Ended => "ended",
            Self::Errored => "errored",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink 状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkState {
    Writable,
    /// 缓冲量已达阈值，写入仍被接受但返回 `false`。
    Draining,
    Corked,
    /// 已调用 `end`，等待在途确认与收尾钩子。
    Finishing,
    Finished,
    Errored,
    Destroyed,
}

impl SinkState {
    /// 是否仍接受写入。
    pub fn accepts_writes(self) -> bool {
        matches!(self, Self::Writable | Self::Draining | Self::Corked)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Destroyed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Writable => "writable",
            Self::Draining => "draining",
            Self::Corked => "corked",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
