#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "spark-context: 按逻辑线程分配、替换并批量回收执行上下文的进程级注册表。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "- [`ThreadIdentity`]：永不复用的逻辑线程标识；"]
#![doc = "- [`ExecutionContext`]：带类型槽位与清理钩子的可销毁上下文；"]
#![doc = "- [`ContextRegistry`]：读写锁保护的映射，限时尝试加无限重试获取锁；"]
#![doc = "- [`RegistryConfig`]：锁获取切片与竞争告警阈值，可从 TOML 加载。"]
#![doc = ""]
#![doc = "== 生命周期 =="]
#![doc = "上下文状态 `Active → Disposing → Disposed` 单调推进；注册表查找遇到非 `Active` 上下文时"]
#![doc = "在写锁内分配替代品；注册表自身的同步或异步批量销毁只执行一次。"]
#![doc = "OS 线程以自身标识创建的条目在线程退出时自动摘除并销毁。"]

/// 上下文状态机、槽位与清理钩子。
pub mod context;
/// 锁获取配置。
pub mod config;
/// 注册表错误域。
pub mod error;
/// 上下文构造工厂。
pub mod factory;
/// 逻辑线程标识。
pub mod identity;
/// 注册表本体。
pub mod registry;

pub use config::RegistryConfig;
pub use context::{AsyncDispose, ContextId, ContextState, ExecutionContext};
pub use error::{ConfigError, ContextError};
pub use factory::{ContextFactory, DefaultContextFactory};
pub use identity::ThreadIdentity;
pub use registry::{ContextRegistry, RegistryStats};
