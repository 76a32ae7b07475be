//! 完成信号单元的 `Future` 视图。
//!
//! # 设计背景（Why）
//! - 异步调用方不应阻塞线程等待结果；视图在首次 `poll` 时向单元登记一个唤醒延续，
//!   完成时由延续链唤醒任务；
//! - `continue_on_captured_context` 保留调用方意图，供上层调度器参考，本 crate 不据此改变任何顺序。
//!
//! # 契约说明（What）
//! - 每个视图最多登记一次延续，之后只刷新 `AtomicWaker` 中的唤醒器；
//! - 单元已完成时 `poll` 直接返回 `Ready`，不登记延续；
//! - 反方向的桥接 [`CompletionCell::from_future`] 把已有的 `Future` 包装为单元，
//!   驱动 future 的执行器由调用方选择。

use std::{
    fmt,
    future::{Future, IntoFuture},
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{FutureExt, task::AtomicWaker};

use crate::{
    cell::CompletionCell,
    chain::panic_message,
    error::{AggregatedError, BoxError},
};

/// [`CompletionCell::configure_await`] 返回的可等待视图。
pub struct ConfiguredCompletion<T> {
    cell: CompletionCell<T>,
    continue_on_captured_context: bool,
    waker: Arc<AtomicWaker>,
    registered: bool,
}

impl<T> ConfiguredCompletion<T> {
    pub(crate) fn new(cell: CompletionCell<T>, continue_on_captured_context: bool) -> Self {
        Self {
            cell,
            continue_on_captured_context,
            waker: Arc::new(AtomicWaker::new()),
            registered: false,
        }
    }

    /// 调用方是否希望在捕获的执行环境上继续。
    pub fn continue_on_captured_context(&self) -> bool {
        self.continue_on_captured_context
    }

    /// 底层单元。
    pub fn cell(&self) -> &CompletionCell<T> {
        &self.cell
    }
}

impl<T> Future for ConfiguredCompletion<T>
where
    T: Clone,
{
    type Output = Result<T, AggregatedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.cell.try_get_result() {
            return Poll::Ready(outcome);
        }

        this.waker.register(cx.waker());
        if !this.registered {
            this.registered = true;
            let waker = Arc::clone(&this.waker);
            this.cell.on_completed(move || waker.wake());
        }

        // 登记与完成可能交错，登记后再检查一次，避免错过唤醒。
        match this.cell.try_get_result() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> CompletionCell<T> {
    /// 把一个产出 `Result` 的 `Future` 包装为完成信号单元。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：已有异步代码只暴露 `Future`，而消费者希望以阻塞等待或延续的方式取结果；
    /// - **执行 (How)**：返回 `(cell, driver)`，`driver` 完成时依据 future 的产出调用
    ///   `set_result` 或 `set_exception`；future 内部 panic 被捕获并折叠为失败原因；
    /// - **契约 (What)**：
    ///   - 单元只由 `driver` 完成，调用方负责把它交给某个执行器（或 `block_on`）；
    ///   - `driver` 被丢弃而未跑完时单元永远不会完成。
    pub fn from_future<F, E>(future: F) -> (Self, impl Future<Output = ()>)
    where
        F: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let cell = Self::new();
        let producer = cell.clone();
        let driver = async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => {
                    let _ = producer.set_result(value);
                }
                Ok(Err(error)) => {
                    producer.set_exception(error);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = %message, "wrapped future panicked");
                    producer.set_exception(format!("wrapped future panicked: {message}"));
                }
            }
        };
        (cell, driver)
    }
}

impl<T> IntoFuture for CompletionCell<T>
where
    T: Clone,
{
    type Output = Result<T, AggregatedError>;
    type IntoFuture = ConfiguredCompletion<T>;

    fn into_future(self) -> Self::IntoFuture {
        ConfiguredCompletion::new(self, true)
    }
}

impl<T> fmt::Debug for ConfiguredCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredCompletion")
            .field("cell", &self.cell)
            .field(
                "continue_on_captured_context",
                &self.continue_on_captured_context,
            )
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn await_resolves_after_cross_thread_completion() {
        let cell = CompletionCell::new();
        let producer = cell.clone();
        let handle = thread::spawn(move || {
            producer.set_result(String::from("done")).expect("首次完成必须成功");
        });
        let value = block_on(cell.configure_await(false)).expect("应返回结果");
        handle.join().expect("生产者线程不应 panic");
        assert_eq!(value, "done");
    }

    #[test]
    fn into_future_surfaces_failure() {
        let cell: CompletionCell<u32> = CompletionCell::faulted("broken pipe");
        let error = block_on(cell.into_future()).expect_err("应以失败完成");
        assert_eq!(error.first().to_string(), "broken pipe");
    }

    #[test]
    fn from_future_completes_on_another_thread() {
        let (cell, driver) = CompletionCell::from_future(async { Ok::<_, BoxError>(11_u32) });
        assert!(!cell.is_completed(), "driver 未运行前单元保持未完成");
        let handle = thread::spawn(move || block_on(driver));
        assert_eq!(cell.get_result().expect("应返回 future 的结果"), 11);
        handle.join().expect("驱动线程不应 panic");
    }

    #[test]
    fn from_future_maps_error_and_panic_to_failure() {
        let (failed, driver) =
            CompletionCell::<u8>::from_future(async { Err::<u8, _>("upstream closed") });
        block_on(driver);
        let error = failed.get_result().expect_err("错误应转为失败");
        assert_eq!(error.first().to_string(), "upstream closed");

        let (panicked, driver) = CompletionCell::<u8>::from_future(async {
            if true {
                panic!("decoder bug");
            }
            Ok::<u8, BoxError>(0)
        });
        block_on(driver);
        let error = panicked.get_result().expect_err("panic 应转为失败");
        assert!(error.first().to_string().contains("decoder bug"));
    }

    #[test]
    fn advisory_flag_is_preserved() {
        let cell: CompletionCell<()> = CompletionCell::new();
        assert!(cell.configure_await(true).continue_on_captured_context());
        assert!(!cell.configure_await(false).continue_on_captured_context());
    }
}
