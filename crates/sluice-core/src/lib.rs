#![allow(clippy::result_large_err)]
#![doc = "sluice-core: 单线程、事件驱动的流式数据传输内核。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. Source（[`Readable`]）：缓冲生产者推送的数据，以拉取（`read`）或推送（`data`）两种模式交付；"]
#![doc = "2. Sink（[`Writable`]）：串行调用消费者，一次一块，按阈值报告背压并在清空后发出 `drain`；"]
#![doc = "3. 组合：[`Duplex`] 共享销毁令牌，[`Transform`] 把写侧输入映射到读侧输出；"]
#![doc = "4. 编排：[`pipe`] 转发数据与背压，[`Pipeline`] 在其上提供对称的错误传播与结算信号。"]
#![doc = ""]
#![doc = "== 调度模型 =="]
#![doc = "所有状态机运行在同一逻辑线程上，延迟动作交给调用方提供的 [`Scheduler`]；"]
#![doc = "测试与简单宿主可直接使用自带的 FIFO 实现 [`TickQueue`]。"]

use std::sync::atomic::{AtomicU64, Ordering};

pub mod ack;
pub mod chunk;
pub mod config;
pub mod destroy;
pub mod duplex;
pub mod error;
pub mod event;
pub mod pipe;
pub mod pipeline;
pub mod readable;
pub mod scheduler;
pub mod status;
pub mod test_stubs;
pub mod transform;
pub mod writable;

pub use ack::Ack;
pub use chunk::{ByteMode, ChunkBuffer, ChunkMode, MAX_HIGH_WATER_MARK, ObjectMode};
pub use config::{DuplexOptions, ReadableOptions, WritableOptions};
pub use destroy::Teardown;
pub use duplex::{Duplex, DuplexBuilder};
pub use error::{ErrorCategory, Result, StreamError};
pub use event::{CloseInfo, ListenerId, SinkEvent, SinkEventKind, SourceEvent, SourceEventKind};
pub use pipe::{PipeLink, PipeOptions, pipe};
pub use pipeline::{
    Completion, DuplexStage, Pipeline, StageCallback, StreamStage, finished, pipeline,
};
pub use readable::{Producer, Readable, ReadableBuilder};
pub use scheduler::{Deferred, Scheduler, TickQueue};
pub use status::{SinkState, SourceState};
pub use transform::{Mapper, Transform, TransformBuilder, TransformOutput};
pub use writable::{Consumer, Writable, WritableBuilder, WriteCallback};

/// 进程内唯一的实体编号，用于日志关联。
pub(crate) fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
