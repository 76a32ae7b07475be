//! 注册表锁获取参数。
//!
//! # 设计背景（Why）
//! - 读写锁以“限时尝试 + 无限重试”的方式获取：每次尝试最多等待一个切片，失败后记录竞争并重来，
//!   调用方永远不会看到超时错误，但运维可以从日志里看到竞争；
//! - 切片长度与告警阈值因部署而异，因此与 `WaitStrategy` 一样支持从 TOML 加载。
//!
//! # 契约说明（What）
//! - 缺省字段取默认值（10ms 切片，连续 100 次失败后告警）；
//! - `lock_slice_millis = 0` 被视为配置错误。

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 上下文注册表的锁获取配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    lock_slice_millis: u64,
    contention_warn_after: u32,
}

impl RegistryConfig {
    /// 构造并校验配置。
    pub fn new(lock_slice: Duration, contention_warn_after: u32) -> Result<Self, ConfigError> {
        let config = Self {
            lock_slice_millis: u64::try_from(lock_slice.as_millis()).unwrap_or(u64::MAX),
            contention_warn_after,
        };
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文本解析配置，并执行与 [`new`](Self::new) 相同的校验。
    ///
    /// ```
    /// use std::time::Duration;
    /// use spark_context::RegistryConfig;
    ///
    /// let config = RegistryConfig::from_toml_str("lock_slice_millis = 25").unwrap();
    /// assert_eq!(config.lock_slice(), Duration::from_millis(25));
    /// assert_eq!(config.contention_warn_after(), 100);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 单次限时尝试的等待上限。
    pub const fn lock_slice(&self) -> Duration {
        Duration::from_millis(self.lock_slice_millis)
    }

    /// 连续失败多少次后把竞争日志从 `trace` 提升为 `warn`。
    pub const fn contention_warn_after(&self) -> u32 {
        self.contention_warn_after
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_slice_millis == 0 {
            return Err(ConfigError::ZeroSlice);
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_slice_millis: 10,
            contention_warn_after: 100,
        }
    }
}
