#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "spark-completion: 单次赋值的完成信号单元，支持阻塞等待、延续链与聚合失败。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "- [`CompletionCell`]：一个生产者、多个消费者之间的一次性结果槽；"]
#![doc = "- [`ContinuationChain`]：线程安全、只追加、恰好触发一次的回调链，可独立使用；"]
#![doc = "- [`AggregatedError`]：按折叠顺序保存全部失败原因的不可变错误值；"]
#![doc = "- [`WaitStrategy`]：阻塞等待的协作式退避参数，可从 TOML 加载。"]
#![doc = ""]
#![doc = "== 并发纪律 =="]
#![doc = "所有可变字段只经由比较交换或一次性发布修改，不持有任何阻塞锁完成状态推进；"]
#![doc = "失败原因与延续的并发写入均采用“读取-计算-比较交换-让出后重试”，保证不丢失。"]

/// `Future` 视图与 `IntoFuture` 适配。
pub mod awaitable;
/// 完成信号单元本体。
pub mod cell;
/// 只追加、一次性触发的延续链。
pub mod chain;
/// 聚合失败、重复完成与有界等待错误。
pub mod error;
/// 阻塞等待的退避策略与配置。
pub mod wait;

pub use awaitable::ConfiguredCompletion;
pub use cell::CompletionCell;
pub use chain::{ContinuationChain, Registration};
pub use error::{AggregatedError, AlreadyCompleted, BoxError, Cause, WaitError};
pub use wait::{WaitConfigError, WaitStrategy};
