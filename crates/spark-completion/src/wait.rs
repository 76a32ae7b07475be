//! 阻塞等待的退避策略。
//!
//! # 设计背景（Why）
//! - `get_result` 采用协作式等待：先短暂自旋，再让出时间片，而不是直接陷入操作系统级阻塞；
//! - 不同部署对延迟与 CPU 占用的取舍不同，因此把阈值做成可由 TOML 配置的 [`WaitStrategy`]。
//!
//! # 契约说明（What）
//! - 三段式退避：`spin_iterations` 次 `spin_loop`，随后 `yield_iterations` 次 `yield_now`；
//!   之后若 `park_interval_micros > 0` 则每轮睡眠该时长，否则继续让出时间片；
//! - 默认值不睡眠，保持纯协作式语义。

use std::{hint, thread, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// 等待完成时使用的退避参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WaitStrategy {
    spin_iterations: u32,
    yield_iterations: u32,
    park_interval_micros: u64,
}

impl WaitStrategy {
    /// 构造自定义策略。`park_interval` 为零表示永不睡眠。
    pub fn new(spin_iterations: u32, yield_iterations: u32, park_interval: Duration) -> Self {
        Self {
            spin_iterations,
            yield_iterations,
            park_interval_micros: u64::try_from(park_interval.as_micros()).unwrap_or(u64::MAX),
        }
    }

    /// 只让出时间片、从不自旋也不睡眠的策略，适合单核或测试环境。
    pub fn yield_only() -> Self {
        Self::new(0, u32::MAX, Duration::ZERO)
    }

    /// 自旋阶段的轮数。
    pub const fn spin_iterations(&self) -> u32 {
        self.spin_iterations
    }

    /// 让出时间片阶段的轮数。
    pub const fn yield_iterations(&self) -> u32 {
        self.yield_iterations
    }

    /// 让出阶段结束后每轮睡眠的时长；为零表示永不睡眠。
    pub const fn park_interval(&self) -> Duration {
        Duration::from_micros(self.park_interval_micros)
    }

    /// 从 TOML 文本解析策略，缺省字段取默认值。
    ///
    /// ```
    /// use spark_completion::WaitStrategy;
    ///
    /// let strategy = WaitStrategy::from_toml_str("spin_iterations = 8").unwrap();
    /// assert_eq!(strategy.spin_iterations(), 8);
    /// assert_eq!(strategy.yield_iterations(), WaitStrategy::default().yield_iterations());
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, WaitConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub(crate) fn backoff(&self) -> Backoff<'_> {
        Backoff {
            strategy: self,
            step: 0,
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            spin_iterations: 64,
            yield_iterations: 1024,
            park_interval_micros: 0,
        }
    }
}

/// 解析 [`WaitStrategy`] 失败。
#[derive(Debug, Error)]
pub enum WaitConfigError {
    /// TOML 文本无法解析为策略结构。
    #[error("invalid wait strategy TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 单次等待过程中的退避游标。
pub(crate) struct Backoff<'a> {
    strategy: &'a WaitStrategy,
    step: u64,
}

impl Backoff<'_> {
    /// 执行一次退避并推进游标。
    pub(crate) fn snooze(&mut self) {
        let spin = u64::from(self.strategy.spin_iterations);
        let yield_until = spin.saturating_add(u64::from(self.strategy.yield_iterations));
        if self.step < spin {
            hint::spin_loop();
        } else if self.step < yield_until || self.strategy.park_interval_micros == 0 {
            thread::yield_now();
        } else {
            thread::sleep(self.strategy.park_interval());
        }
        self.step = self.step.saturating_add(1);
    }
}
