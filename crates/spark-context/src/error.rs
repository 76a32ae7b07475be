//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义注册表对调用方可见的失败；锁竞争始终在内部重试，因此不在这里出现；
//! - 构造失败统一包装为 [`AggregatedError`]，与完成信号单元共用同一套“多原因”错误形态。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接以 `?` 传播；
//! - 变体携带可读上下文（逻辑线程标识），便于日志定位。

use spark_completion::AggregatedError;
use thiserror::Error;

use crate::identity::ThreadIdentity;

/// 上下文注册表错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“注册表已销毁”这一使用错误与“工厂构造失败”这一运行期失败，
///   让调用方分别决定终止还是重试；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨线程传播；
/// - **设计权衡 (Trade-offs)**：构造失败只保留聚合错误而非原始类型，调用方需要通过
///   [`AggregatedError::causes`] 做向下转型。
#[derive(Clone, Debug, Error)]
pub enum ContextError {
    /// 注册表已执行过批量销毁，不再分配上下文。
    #[error("context registry has been disposed")]
    RegistryDisposed,

    /// 惰性构造上下文时工厂返回失败。
    ///
    /// - **契约 (What)**：`owner` 为请求的逻辑线程，`source` 至少包含一个原因；
    /// - **风险 (Trade-offs)**：注册表不会回退到默认上下文，失败原样交还调用方。
    #[error("failed to construct execution context for {owner}")]
    Construction {
        /// 请求上下文的逻辑线程。
        owner: ThreadIdentity,
        /// 工厂返回的失败原因。
        #[source]
        source: AggregatedError,
    },
}

/// 注册表配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 锁获取切片必须大于零，否则重试循环退化为忙等。
    #[error("lock_slice_millis must be greater than zero")]
    ZeroSlice,

    /// TOML 文本无法解析为配置结构。
    #[error("invalid registry configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
