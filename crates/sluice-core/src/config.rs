//! 流选项。
//!
//! # 设计定位（Why）
//! - 阈值、自动销毁、半开策略是宿主需要在配置文件中调节的全部旋钮；选项结构只承载数据，
//!   派生 `serde`，可以直接从 TOML/JSON 反序列化。
//! - 缺省字段一律取默认值（`#[serde(default)]`），配置文件只需写出需要覆盖的键。
//!
//! # 契约说明（What）
//! - `high_water_mark = None` 表示使用块模式的默认阈值（字节 64 KiB / 对象 16 个）；
//! - 阈值上限为 [`MAX_HIGH_WATER_MARK`]，超出时 [`validate`](ReadableOptions::validate) 返回
//!   [`StreamError::InvalidArgument`]；构造器在校验失败时回退为上限值。

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkMode, MAX_HIGH_WATER_MARK};
use crate::error::StreamError;

fn check_high_water_mark(value: Option<usize>) -> Result<(), StreamError> {
    match value {
        Some(hwm) if hwm > MAX_HIGH_WATER_MARK => Err(StreamError::InvalidArgument {
            name: "high_water_mark",
            reason: format!("{hwm} exceeds the 1 GiB ceiling").into(),
        }),
        _ => Ok(()),
    }
}

fn resolve<M: ChunkMode>(value: Option<usize>) -> usize {
    value
        .unwrap_or(M::DEFAULT_HIGH_WATER_MARK)
        .min(MAX_HIGH_WATER_MARK)
}

/// Source 选项。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadableOptions {
    /// 背压阈值。
    pub high_water_mark: Option<usize>,
    /// 结束通知发出后自动销毁。
    pub auto_destroy: bool,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            auto_destroy: true,
        }
    }
}

impl ReadableOptions {
    pub fn validate(&self) -> Result<(), StreamError> {
        check_high_water_mark(self.high_water_mark)
    }

    pub(crate) fn resolved_high_water_mark<M: ChunkMode>(&self) -> usize {
        resolve::<M>(self.high_water_mark)
    }
}

/// Sink 选项。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritableOptions {
    /// 背压阈值。
    pub high_water_mark: Option<usize>,
    /// 完成通知发出后自动销毁。
    pub auto_destroy: bool,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            auto_destroy: true,
        }
    }
}

impl WritableOptions {
    pub fn validate(&self) -> Result<(), StreamError> {
        check_high_water_mark(self.high_water_mark)
    }

    pub(crate) fn resolved_high_water_mark<M: ChunkMode>(&self) -> usize {
        resolve::<M>(self.high_water_mark)
    }
}

/// Duplex/Transform 选项。
///
/// `allow_half_open = false` 时，任一侧结束都会带动另一侧结束。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    pub allow_half_open: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            readable: ReadableOptions::default(),
            writable: WritableOptions::default(),
            allow_half_open: true,
        }
    }
}

impl DuplexOptions {
    pub fn validate(&self) -> Result<(), StreamError> {
        self.readable.validate()?;
        self.writable.validate()
    }
}
