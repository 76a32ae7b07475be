//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 完成信号单元的失败路径只有一种对外形态：[`AggregatedError`]。无论生产者记录了一个还是多个原因，
//!   消费者都走同一条分支处理，避免“单错/多错”两套代码路径；
//! - 误用（重复完成）与有界等待超时属于调用约定层面的问题，分别由 [`AlreadyCompleted`] 与 [`WaitError`] 表达。
//!
//! ## 设计要求（What）
//! - 所有错误均满足 `Send + Sync + 'static`（[`AlreadyCompleted`] 取决于 `T`），可跨线程传播；
//! - `AggregatedError` 为不可变值，追加原因会生成新值，便于在比较交换循环中整体替换。

use std::{error::Error, fmt, sync::Arc, time::Duration};

use thiserror::Error;

/// 装箱形式的任意错误，作为 `set_exception` 等入口的通用输入。
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// 聚合失败中的单个原因，使用 `Arc` 以便多个消费者共享同一份原因对象。
pub type Cause = Arc<dyn Error + Send + Sync + 'static>;

/// 有序的多原因失败集合。
///
/// # 教案式说明
/// - **意图 (Why)**：生产者在契约上只应失败一次，但并发误用时可能多次调用 `set_exception`；
///   聚合错误保证所有原因都被保留并一并暴露，而不是静默覆盖。
/// - **契约 (What)**：
///   - 集合永不为空，`first()` 总能返回一个原因；
///   - 原因按折叠顺序排列，并发折叠时顺序由比较交换的成功顺序决定；
///   - 克隆仅增加引用计数。
/// - **执行 (How)**：内部以 `Arc<Vec<Cause>>` 存储，[`with_cause`](Self::with_cause) 复制后追加，
///   原值保持不变，可作为 `ArcSwap` 中的不可变快照。
#[derive(Clone)]
pub struct AggregatedError {
    causes: Arc<Vec<Cause>>,
}

impl AggregatedError {
    /// 以单个原因构造聚合错误。
    pub fn single<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::from_cause(Arc::from(error.into()))
    }

    /// 以已共享的原因构造聚合错误。
    pub fn from_cause(cause: Cause) -> Self {
        Self {
            causes: Arc::new(vec![cause]),
        }
    }

    /// 以一组原因构造聚合错误；若迭代器为空则返回 `None`，保持“永不为空”的不变量。
    pub fn from_causes<I>(causes: I) -> Option<Self>
    where
        I: IntoIterator<Item = Cause>,
    {
        let causes: Vec<Cause> = causes.into_iter().collect();
        if causes.is_empty() {
            None
        } else {
            Some(Self {
                causes: Arc::new(causes),
            })
        }
    }

    /// 返回追加了 `cause` 的新聚合错误，原值不受影响。
    ///
    /// - **契约 (What)**：新值长度为 `self.len() + 1`，末尾即为 `cause`；
    /// - **风险 (Trade-offs)**：每次追加复制一次原因指针数组，原因数量在正常使用下只有一个，复制成本可忽略。
    #[must_use]
    pub fn with_cause(&self, cause: Cause) -> Self {
        let mut causes = Vec::with_capacity(self.causes.len() + 1);
        causes.extend(self.causes.iter().cloned());
        causes.push(cause);
        Self {
            causes: Arc::new(causes),
        }
    }

    /// 全部原因的只读切片。
    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    /// 最早折叠进来的原因。
    pub fn first(&self) -> &Cause {
        // 构造路径保证至少存在一个原因。
        &self.causes[0]
    }

    /// 原因数量，至少为 1。
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// 按折叠顺序遍历原因。
    pub fn iter(&self) -> impl Iterator<Item = &Cause> {
        self.causes.iter()
    }
}

impl fmt::Debug for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.causes.iter().map(|cause| cause.to_string()))
            .finish()
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes.as_slice() {
            [only] => write!(f, "completion failed: {only}"),
            causes => {
                write!(f, "completion failed with {} causes", causes.len())?;
                for (index, cause) in causes.iter().enumerate() {
                    write!(f, "; [{index}] {cause}")?;
                }
                Ok(())
            }
        }
    }
}

impl Error for AggregatedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let first: &(dyn Error + 'static) = self.first().as_ref();
        Some(first)
    }
}

/// 对已完成的单元再次调用 `set_result` 时返回，携带被拒绝的值。
///
/// - **意图 (Why)**：重复完成属于调用约定违规，但值本身可能持有资源，交还给调用方比静默丢弃更安全；
/// - **契约 (What)**：通过 [`into_inner`](Self::into_inner) 取回原值。
#[derive(Error)]
#[error("completion cell already completed; the rejected value is handed back to the caller")]
pub struct AlreadyCompleted<T> {
    value: T,
}

impl<T> AlreadyCompleted<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }

    /// 取回被拒绝的值。
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for AlreadyCompleted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlreadyCompleted").finish_non_exhaustive()
    }
}

/// 有界等待（`get_result_timeout`）的失败形态。
#[derive(Clone, Debug, Error)]
pub enum WaitError {
    /// 在给定时长内单元未完成。单元状态不受影响，之后仍可继续等待。
    #[error("completion cell did not complete within {waited:?}")]
    TimedOut {
        /// 本次等待的时长上限。
        waited: Duration,
    },

    /// 单元以失败完成。
    #[error(transparent)]
    Faulted(#[from] AggregatedError),
}
