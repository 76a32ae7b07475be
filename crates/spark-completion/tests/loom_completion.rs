#![cfg(any(loom, spark_loom))]

//! 完成协议的 Loom 模型检查。
//!
//! 以 `RUSTFLAGS="--cfg loom"` 编译时，[`CompletionCell`] 的状态字是 Loom 原子类型，
//! 这里直接驱动真实单元，让 Loom 穷举“抢占 `PENDING → COMPLETING`、发布终态、封口延续链”
//! 与登记、观测之间的交错。结果槽、失败快照与延续链本身不感知 Loom 调度器，
//! 它们的写入都发生在赢得状态字之后，由状态字的 `Release/Acquire` 对负责发布。
//!
//! 模型内只使用非阻塞观测（`try_get_result`、`is_completed`），阻塞等待依赖真实线程让出。

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use spark_completion::CompletionCell;

#[test]
fn registration_racing_completion_fires_once() {
    //
    // 教案级说明：
    // - **Why**：登记与完成交错是“延续丢失”最常见的来源；
    // - **How**：一个线程 `set_result`，另一个线程登记回调，回调内部读取单元结果；
    // - **What**：无论顺序如何，回调恰好执行一次，且执行时结果已经可见。
    model(|| {
        let cell: CompletionCell<u32> = CompletionCell::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let producer = {
            let cell = cell.clone();
            thread::spawn(move || {
                assert!(cell.set_result(7).is_ok());
            })
        };

        let registrant = {
            let cell = cell.clone();
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                let observer = cell.clone();
                let _registration = cell.on_completed(move || {
                    assert!(matches!(observer.try_get_result(), Some(Ok(7))));
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            })
        };

        producer.join().expect("完成线程不应 panic");
        registrant.join().expect("登记线程不应 panic");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(cell.is_completed_successfully());
        assert_eq!(cell.pending_continuations(), 0);
    });
}

#[test]
fn racing_producers_elect_single_winner() {
    //
    // 教案级说明：两个生产者同时 `set_result`，状态字的比较交换只让一个通过；
    // 落败者拿回自己的值，单元最终保存胜者的值。
    model(|| {
        let cell: CompletionCell<u32> = CompletionCell::new();

        let handles: Vec<_> = [1_u32, 2]
            .into_iter()
            .map(|value| {
                let cell = cell.clone();
                thread::spawn(move || cell.set_result(value).map(|()| value))
            })
            .collect();
        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("生产者线程不应 panic"))
            .collect();

        let winners: Vec<u32> = outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().ok().copied())
            .collect();
        assert_eq!(winners.len(), 1);
        let losers: Vec<u32> = outcomes
            .into_iter()
            .filter_map(|outcome| outcome.err().map(|rejected| rejected.into_inner()))
            .collect();
        assert_eq!(losers.len(), 1);
        assert_ne!(losers[0], winners[0]);
        assert!(matches!(cell.try_get_result(), Some(Ok(value)) if value == winners[0]));
    });
}

#[test]
fn result_racing_exception_settles_on_one_outcome() {
    //
    // 教案级说明：`set_result` 与 `set_exception` 竞争时，先抢到状态字的一方决定结局；
    // 落败的失败原因仍被折叠记录，但不改变已发布的成功终态。
    model(|| {
        let cell: CompletionCell<u32> = CompletionCell::new();

        let succeed = {
            let cell = cell.clone();
            thread::spawn(move || cell.set_result(3).is_ok())
        };
        let fail = {
            let cell = cell.clone();
            thread::spawn(move || cell.set_exception("producer aborted"))
        };

        let value_won = succeed.join().expect("成功方不应 panic");
        let failure_won = fail.join().expect("失败方不应 panic");
        assert!(value_won ^ failure_won, "恰好一方赢得完成权");
        assert!(cell.is_completed());
        if value_won {
            assert!(cell.is_completed_successfully());
            assert!(matches!(cell.try_get_result(), Some(Ok(3))));
            assert!(cell.exception().is_some(), "落败的原因仍被记录");
        } else {
            assert!(cell.is_faulted());
            assert!(matches!(cell.try_get_result(), Some(Err(_))));
        }
    });
}
