//! 上下文构造工厂。
//!
//! 注册表在首次查找或替换失效上下文时调用工厂；工厂返回的错误会被包装为
//! [`ContextError::Construction`](crate::ContextError::Construction) 交还调用方。

use spark_completion::BoxError;

use crate::{context::ExecutionContext, identity::ThreadIdentity};

/// 为逻辑线程构造新的执行上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：上层可能需要在上下文创建时预置槽位或挂载清理钩子，工厂把这一步从注册表中解耦；
/// - **契约 (What)**：
///   - 返回的上下文必须处于 `Active` 状态，且 `owner()` 等于入参；
///   - 调用发生在注册表写锁内，实现不得访问同一注册表，也不应执行阻塞 I/O；
/// - **扩展 (How)**：任何 `Fn(ThreadIdentity) -> Result<ExecutionContext, BoxError>` 闭包都自动实现本 trait。
pub trait ContextFactory: Send + Sync {
    /// 为 `owner` 构造一个 `Active` 上下文。
    fn create(&self, owner: ThreadIdentity) -> Result<ExecutionContext, BoxError>;
}

impl<F> ContextFactory for F
where
    F: Fn(ThreadIdentity) -> Result<ExecutionContext, BoxError> + Send + Sync,
{
    fn create(&self, owner: ThreadIdentity) -> Result<ExecutionContext, BoxError> {
        self(owner)
    }
}

/// 构造空上下文的默认工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultContextFactory;

impl ContextFactory for DefaultContextFactory {
    fn create(&self, owner: ThreadIdentity) -> Result<ExecutionContext, BoxError> {
        Ok(ExecutionContext::new(owner))
    }
}
