//! # CompletionCell：单次赋值的完成信号单元
//!
//! ## 核心意图（Why）
//! - 一个生产者、任意多个消费者之间传递“一次性结果”：生产者恰好调用一次 `set_result` 或
//!   `set_exception`，消费者可以阻塞等待、注册延续，或以 `Future` 方式等待；
//! - 失败路径对并发误用保持宽容：多次 `set_exception` 的原因全部折叠进同一个 [`AggregatedError`]。
//!
//! ## 状态机约束（What）
//! - `PENDING → COMPLETING → {SUCCEEDED | FAULTED}`，单调推进，终态不可回退；
//! - 只有赢得 `PENDING → COMPLETING` 比较交换的线程可以写入结果，并由它决定最终结局；
//! - 写入结果（或折叠原因）先于以 `Release` 发布终态，消费者以 `Acquire` 读取终态后才读取结果，
//!   因此不存在“看到已完成却读到半写结果”的窗口；
//! - 发布终态之后才触发延续链，延续执行时单元必然已处于终态。
//!
//! ## 风险提示（Trade-offs）
//! - `get_result` 没有内建超时，生产者永不完成时会一直等待；需要上限时使用
//!   [`get_result_timeout`](CompletionCell::get_result_timeout)；
//! - 结果以 `OnceLock<T>` 保存，`get_result` 需要 `T: Clone`，只需借用时使用 [`wait`](CompletionCell::wait)。

use std::{
    any::Any,
    fmt,
    sync::{Arc, OnceLock, atomic::AtomicBool},
    thread,
    time::{Duration, Instant},
};

// 教案级说明：状态字是完成协议唯一的同步点，`--cfg loom` 下换成 Loom 的原子类型，
// 让模型检查穷举“抢占-发布-触发”的全部交错；其余字段只在赢得状态字之后写入。
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwapOption;
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

use crate::{
    awaitable::ConfiguredCompletion,
    chain::{ContinuationChain, Registration},
    error::{AggregatedError, AlreadyCompleted, BoxError, Cause, WaitError},
    wait::WaitStrategy,
};

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAULTED: u8 = 3;

struct CellInner<T> {
    state: AtomicU8,
    result: OnceLock<T>,
    failure: ArcSwapOption<AggregatedError>,
    completed_synchronously: AtomicBool,
    continuations: ContinuationChain,
    strategy: WaitStrategy,
    state_object: Option<Box<dyn Any + Send + Sync>>,
}

/// 单生产者、多消费者的完成信号单元。
///
/// 克隆得到的是指向同一单元的另一个句柄。
///
/// ```
/// use std::thread;
/// use spark_completion::CompletionCell;
///
/// let cell = CompletionCell::new();
/// let producer = cell.clone();
/// thread::spawn(move || {
///     producer.set_result(42).unwrap();
/// });
/// assert_eq!(cell.get_result().unwrap(), 42);
/// ```
pub struct CompletionCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> CompletionCell<T> {
    /// 创建未完成的单元，使用默认退避策略。
    pub fn new() -> Self {
        Self::with_strategy(WaitStrategy::default())
    }

    /// 创建未完成的单元，并指定阻塞等待时的退避策略。
    pub fn with_strategy(strategy: WaitStrategy) -> Self {
        Self::build(strategy, None)
    }

    /// 创建未完成的单元，并携带调用方提供的状态对象。
    ///
    /// - **意图 (Why)**：发起异步操作的一方常需要把请求上下文随结果一起交给消费者，
    ///   状态对象在单元的整个生命周期内不变，与结果无关；
    /// - **契约 (What)**：通过 [`async_state`](Self::async_state) 取回，再以 `downcast_ref` 还原类型。
    pub fn with_state<S>(state: S) -> Self
    where
        S: Any + Send + Sync,
    {
        Self::build(WaitStrategy::default(), Some(Box::new(state)))
    }

    fn build(strategy: WaitStrategy, state_object: Option<Box<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(CellInner {
                state: AtomicU8::new(PENDING),
                result: OnceLock::new(),
                failure: ArcSwapOption::empty(),
                completed_synchronously: AtomicBool::new(false),
                continuations: ContinuationChain::new(),
                strategy,
                state_object,
            }),
        }
    }

    /// 创建已成功完成的单元，`completed_synchronously()` 为 `true`。
    pub fn completed(value: T) -> Self {
        let cell = Self::new();
        // 新建单元没有其他生产者，完成转换必然成功。
        let _ = cell.complete_with_value(value, true);
        cell
    }

    /// 创建已失败完成的单元，`completed_synchronously()` 为 `true`。
    pub fn faulted<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        let cell = Self::new();
        cell.complete_with_cause(Arc::from(error.into()), true);
        cell
    }

    /// 记录成功结果并完成单元。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：生产者唯一的成功出口；
    /// - **契约 (What)**：
    ///   - 首次终态调用生效，返回 `Ok(())`，随后触发全部延续；
    ///   - 单元已完成时属于调用约定违规：记录 `warn` 日志，并通过 [`AlreadyCompleted`] 交还 `value`；
    /// - **风险 (Trade-offs)**：延续在调用线程上同步执行，耗时延续会拖慢生产者。
    pub fn set_result(&self, value: T) -> Result<(), AlreadyCompleted<T>> {
        self.complete_with_value(value, false)
    }

    /// 记录失败原因，并在单元尚未完成时以失败完成它。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：并发的失败生产者不应丢失任何原因；
    /// - **执行 (How)**：
    ///   1. 读取当前失败快照，计算合并值（空 → 单原因；已有 → 追加），比较交换，冲突则让出后重试；
    ///   2. 尝试 `PENDING → COMPLETING`，成功者发布 `FAULTED` 并触发延续；
    /// - **契约 (What)**：无论是否赢得完成权，原因都会被折叠保留；返回 `true` 表示本次调用完成了单元。
    pub fn set_exception<E>(&self, error: E) -> bool
    where
        E: Into<BoxError>,
    {
        self.complete_with_cause(Arc::from(error.into()), false)
    }

    /// 阻塞直至完成，返回结果的借用或聚合失败。
    pub fn wait(&self) -> Result<&T, AggregatedError> {
        let mut backoff = self.inner.strategy.backoff();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            backoff.snooze();
        }
    }

    /// 阻塞直至完成，最多等待 `timeout`。超时不改变单元状态。
    pub fn wait_timeout(&self, timeout: Duration) -> Result<&T, WaitError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut backoff = self.inner.strategy.backoff();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome.map_err(WaitError::Faulted);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(WaitError::TimedOut { waited: timeout });
            }
            backoff.snooze();
        }
    }

    /// 以延续方式等待完成。
    ///
    /// 单元已完成时回调在当前线程立即执行，返回 [`Registration::Inline`]。
    pub fn on_completed<F>(&self, continuation: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.continuations.register(continuation)
    }

    /// 与 [`on_completed`](Self::on_completed) 等价；不捕获也不恢复任何调用方执行环境。
    pub fn unsafe_on_completed<F>(&self, continuation: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_completed(continuation)
    }

    /// 返回可 `await` 的视图。`continue_on_captured_context` 只是建议值，不影响完成顺序。
    pub fn configure_await(&self, continue_on_captured_context: bool) -> ConfiguredCompletion<T> {
        ConfiguredCompletion::new(self.clone(), continue_on_captured_context)
    }

    /// 是否已进入终态（成功或失败）。
    pub fn is_completed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= SUCCEEDED
    }

    /// 是否以成功结果完成。
    pub fn is_completed_successfully(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == SUCCEEDED
    }

    /// 是否以失败完成。
    pub fn is_faulted(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FAULTED
    }

    /// 完成是否发生在创建路径上（`completed` / `faulted`），仅供诊断。
    pub fn completed_synchronously(&self) -> bool {
        self.is_completed() && self.inner.completed_synchronously.load(Ordering::Acquire)
    }

    /// 当前已折叠的全部失败原因。
    ///
    /// 成功完成后迟到的 `set_exception` 也会出现在这里，但不会改变 `wait`/`get_result` 的结局。
    pub fn exception(&self) -> Option<AggregatedError> {
        self.inner
            .failure
            .load_full()
            .map(|failure| failure.as_ref().clone())
    }

    /// 尚未触发的延续数量。
    pub fn pending_continuations(&self) -> usize {
        self.inner.continuations.pending()
    }

    /// 创建时附带的状态对象；未通过 [`with_state`](Self::with_state) 创建时为 `None`。
    pub fn async_state(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.state_object.as_deref()
    }

    pub(crate) fn outcome(&self) -> Option<Result<&T, AggregatedError>> {
        match self.inner.state.load(Ordering::Acquire) {
            SUCCEEDED => self.inner.result.get().map(Ok),
            FAULTED => self.exception().map(Err),
            _ => None,
        }
    }

    fn begin_completion(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self, terminal: u8, synchronously: bool) {
        self.inner
            .completed_synchronously
            .store(synchronously, Ordering::Release);
        self.inner.state.store(terminal, Ordering::Release);
        let fired = self.inner.continuations.fire();
        tracing::trace!(
            outcome = if terminal == SUCCEEDED { "succeeded" } else { "faulted" },
            continuations = fired,
            "completion cell completed"
        );
    }

    fn complete_with_value(&self, value: T, synchronously: bool) -> Result<(), AlreadyCompleted<T>> {
        if !self.begin_completion() {
            tracing::warn!("set_result called on a completion cell that already completed");
            return Err(AlreadyCompleted::new(value));
        }
        let stored = self.inner.result.set(value);
        debug_assert!(stored.is_ok(), "only the completion winner writes the result");
        self.finish(SUCCEEDED, synchronously);
        Ok(())
    }

    fn complete_with_cause(&self, cause: Cause, synchronously: bool) -> bool {
        self.fold_failure(cause);
        if self.begin_completion() {
            self.finish(FAULTED, synchronously);
            true
        } else {
            tracing::warn!("failure folded into a completion cell that already completed");
            false
        }
    }

    fn fold_failure(&self, cause: Cause) {
        loop {
            let current = self.inner.failure.load_full();
            let merged = match &current {
                None => AggregatedError::from_cause(Arc::clone(&cause)),
                Some(existing) => existing.with_cause(Arc::clone(&cause)),
            };
            let previous = self
                .inner
                .failure
                .compare_and_swap(&current, Some(Arc::new(merged)));
            if same_snapshot(&*previous, &current) {
                return;
            }
            thread::yield_now();
        }
    }
}

impl<T: Clone> CompletionCell<T> {
    /// 阻塞直至完成，返回结果副本或聚合失败。
    pub fn get_result(&self) -> Result<T, AggregatedError> {
        self.wait().cloned()
    }

    /// 有界版本的 [`get_result`](Self::get_result)。
    pub fn get_result_timeout(&self, timeout: Duration) -> Result<T, WaitError> {
        self.wait_timeout(timeout).cloned()
    }

    /// 非阻塞探测：未完成时返回 `None`。
    pub fn try_get_result(&self) -> Option<Result<T, AggregatedError>> {
        self.outcome().map(|outcome| outcome.cloned())
    }
}

impl<T> Clone for CompletionCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CompletionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING => "pending",
            COMPLETING => "completing",
            SUCCEEDED => "succeeded",
            _ => "faulted",
        };
        f.debug_struct("CompletionCell")
            .field("state", &state)
            .field("pending_continuations", &self.pending_continuations())
            .field("has_async_state", &self.inner.state_object.is_some())
            .finish()
    }
}

fn same_snapshot(
    left: &Option<Arc<AggregatedError>>,
    right: &Option<Arc<AggregatedError>>,
) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        _ => false,
    }
}
