//! 数据块模式与块缓冲区。
//!
//! # 设计定位（Why）
//! - 一个流要么只搬运字节，要么只搬运对象，两者永不混用；把模式提升为类型参数后，
//!   混用在编译期就会被拒绝，缓冲区也不必在运行期判断计量方式。
//! - 背压判定依赖缓冲区长度在任意同步时刻都精确，因此长度与块队列在同一结构中维护。
//!
//! # 契约说明（What）
//! - [`ByteMode`]：块类型为 [`Bytes`]，长度按字节计；`take(n)` 可以跨块拼接或切分。
//! - [`ObjectMode`]：块类型为任意 `T: Clone`，每个块计 1；`take` 总是返回整块。
//! - [`ChunkBuffer::len`] 返回当前计量总量，而非块个数。
//!
//! # 风险与权衡（Trade-offs）
//! - 字节模式跨块读取需要一次拷贝（[`BytesMut`] 拼接）；恰好按块读取时零拷贝。

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};

/// 单个阈值允许的上限（1 GiB），与自动扩容上限一致。
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// 流的块模式。
///
/// # 教案式说明
/// - **意图 (Why)**：以零尺寸类型在编译期固定“如何计量、如何切分”。
/// - **契约 (What)**：
///   - `weight` 必须是纯函数，同一块多次调用结果一致；
///   - `take(queue, n)` 的前置条件是 `0 < n <= 队列总量`，返回的块计量恰为 `n`
///     （对象模式下为队首整块，计量 1）。
/// - **执行逻辑 (How)**：[`ChunkBuffer`] 在入队、出队时调用 `weight` 维护精确长度。
pub trait ChunkMode: 'static {
    /// 该模式搬运的块类型。
    type Chunk: Clone + 'static;

    /// 默认背压阈值。
    const DEFAULT_HIGH_WATER_MARK: usize;

    /// 是否按对象计量。
    const OBJECT_MODE: bool;

    /// 单块计量。
    fn weight(chunk: &Self::Chunk) -> usize;

    /// 从队首取出计量为 `n` 的数据。
    fn take(queue: &mut VecDeque<Self::Chunk>, n: usize) -> Option<Self::Chunk>;
}

/// 字节模式：块为 [`Bytes`]。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteMode;

impl ChunkMode for ByteMode {
    type Chunk = Bytes;

    const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
    const OBJECT_MODE: bool = false;

    fn weight(chunk: &Bytes) -> usize {
        chunk.len()
    }

    fn take(queue: &mut VecDeque<Bytes>, n: usize) -> Option<Bytes> {
        let front_len = queue.front()?.len();
        if n == front_len {
            return queue.pop_front();
        }
        if n < front_len {
            return queue.front_mut().map(|front| front.split_to(n));
        }

        // 跨块读取：拼接到恰好 n 字节，剩余部分放回队首。
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(mut chunk) = queue.pop_front() else {
                break;
            };
            let need = n - out.len();
            if chunk.len() > need {
                out.put_slice(&chunk.split_to(need));
                queue.push_front(chunk);
            } else {
                out.put_slice(&chunk);
            }
        }
        Some(out.freeze())
    }
}

/// 对象模式：块为任意 `T`，每块计 1。
pub struct ObjectMode<T>(PhantomData<fn() -> T>);

impl<T> fmt::Debug for ObjectMode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObjectMode")
    }
}

impl<T: Clone + 'static> ChunkMode for ObjectMode<T> {
    type Chunk = T;

    const DEFAULT_HIGH_WATER_MARK: usize = 16;
    const OBJECT_MODE: bool = true;

    fn weight(_chunk: &T) -> usize {
        1
    }

    fn take(queue: &mut VecDeque<T>, _n: usize) -> Option<T> {
        queue.pop_front()
    }
}

/// 有序块队列与精确计量。
pub struct ChunkBuffer<M: ChunkMode> {
    chunks: VecDeque<M::Chunk>,
    length: usize,
}

impl<M: ChunkMode> ChunkBuffer<M> {
    /// 创建空缓冲区。
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            length: 0,
        }
    }

    /// 当前计量总量（字节数或块数）。
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 队首块的计量；流动模式下每次只交付一个块。
    pub fn front_weight(&self) -> Option<usize> {
        self.chunks.front().map(M::weight)
    }

    pub fn push_back(&mut self, chunk: M::Chunk) {
        self.length += M::weight(&chunk);
        self.chunks.push_back(chunk);
    }

    pub fn push_front(&mut self, chunk: M::Chunk) {
        self.length += M::weight(&chunk);
        self.chunks.push_front(chunk);
    }

    /// 取出计量至多为 `n` 的数据；`n == 0` 或缓冲为空时返回 `None`。
    pub fn take(&mut self, n: usize) -> Option<M::Chunk> {
        if n == 0 || self.chunks.is_empty() {
            return None;
        }
        let n = n.min(self.length);
        let chunk = M::take(&mut self.chunks, n)?;
        self.length -= M::weight(&chunk);
        Some(chunk)
    }

    /// 丢弃全部内容，返回被丢弃的计量。
    pub fn clear(&mut self) -> usize {
        let discarded = self.length;
        self.chunks.clear();
        self.length = 0;
        discarded
    }
}

impl<M: ChunkMode> Default for ChunkBuffer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ChunkMode> fmt::Debug for ChunkBuffer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("chunks", &self.chunks.len())
            .field("length", &self.length)
            .finish()
    }
}

/// 按 `read(n)` 请求计算新的阈值：向上取到 2 的幂，封顶 [`MAX_HIGH_WATER_MARK`]。
pub(crate) fn grown_high_water_mark(requested: usize) -> usize {
    if requested >= MAX_HIGH_WATER_MARK {
        MAX_HIGH_WATER_MARK
    } else {
        requested.next_power_of_two()
    }
}
