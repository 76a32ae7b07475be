//! 注册表并发测试。
//!
//! # 教案级导览
//! - **Why**：读锁命中、写锁复查与批量销毁在多线程下交错，最容易出现“重复替换”或“销毁后仍分配”；
//! - **How**：`Barrier` 同步起跑的线程竞争同一个键，随后比较返回实例的指针与统计计数；
//!   proptest 随机生成“查找 / 销毁上下文”序列，与一个简单模型对照；
//! - **What**：同一失效键上的并发查找恰好产生一次替换，且所有线程拿到同一实例。

use std::{
    collections::HashMap,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use proptest::prelude::*;
use spark_context::{ContextError, ContextRegistry, ContextState, RegistryConfig, ThreadIdentity};

fn racing_lookups(
    registry: &Arc<ContextRegistry>,
    identity: ThreadIdentity,
    threads: usize,
) -> Vec<Arc<spark_context::ExecutionContext>> {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.get_context(identity).expect("查找不应失败")
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("查找线程不应 panic"))
        .collect()
}

#[test]
fn racing_first_lookups_create_once() {
    let registry = Arc::new(ContextRegistry::new());
    let identity = ThreadIdentity::detached();
    let contexts = racing_lookups(&registry, identity, 16);
    assert!(contexts.iter().all(|context| Arc::ptr_eq(context, &contexts[0])));
    assert_eq!(registry.stats().created, 1);
}

#[test]
fn racing_lookups_on_dead_key_replace_once() {
    let registry = Arc::new(ContextRegistry::new());
    let identity = ThreadIdentity::detached();
    let original = registry.get_context(identity).expect("应创建上下文");
    assert!(original.dispose());

    let contexts = racing_lookups(&registry, identity, 16);
    let winner = &contexts[0];
    assert!(!Arc::ptr_eq(winner, &original));
    assert!(contexts.iter().all(|context| Arc::ptr_eq(context, winner)));
    assert_eq!(winner.state(), ContextState::Active);

    let stats = registry.stats();
    assert_eq!(stats.replaced, 1, "失效键只允许一次替换");
    assert_eq!(stats.created, 2);
}

#[test]
fn per_thread_contexts_are_distinct() {
    let registry = Arc::new(ContextRegistry::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let context = registry.get_caller_context().expect("应创建上下文");
                assert_eq!(context.owner(), ThreadIdentity::current());
                context.id()
            })
        })
        .collect();
    let mut ids: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("线程不应 panic"))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(registry.len(), 0, "退出线程的条目应被回收");
    assert_eq!(registry.stats().reclaimed, 8);
}

/// 大量短命线程各自取一次调用方上下文：全部退出后映射应为空，且每个上下文都已执行清理。
#[test]
fn short_lived_threads_do_not_grow_the_map() {
    const THREADS: usize = 200;
    let registry = Arc::new(ContextRegistry::new());
    let hook_runs = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let hook_runs = Arc::clone(&hook_runs);
            thread::spawn(move || {
                let context = registry.get_caller_context().expect("应创建上下文");
                assert!(context.on_dispose(move || {
                    hook_runs.fetch_add(1, Ordering::SeqCst);
                }));
                context
            })
        })
        .collect();
    let contexts: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("线程不应 panic"))
        .collect();

    assert_eq!(registry.len(), 0);
    assert!(registry.is_empty());
    let stats = registry.stats();
    assert_eq!(stats.created, THREADS as u64);
    assert_eq!(stats.reclaimed, THREADS as u64);
    assert_eq!(hook_runs.load(Ordering::SeqCst), THREADS);
    assert!(
        contexts
            .iter()
            .all(|context| context.state() == ContextState::Disposed)
    );
}

/// 销毁与查找竞争：每次查找要么拿到随后被销毁的上下文，要么得到 `RegistryDisposed`，
/// 销毁完成后不存在仍为 `Active` 的已分配上下文。
#[test]
fn dispose_racing_lookups_leaves_nothing_active() {
    let config = RegistryConfig::new(Duration::from_millis(1), 1_000).expect("切片非零");
    let registry = Arc::new(ContextRegistry::with_config(config));
    let barrier = Arc::new(Barrier::new(9));

    let lookups: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut handed_out = Vec::new();
                for _ in 0..32 {
                    match registry.get_context(ThreadIdentity::detached()) {
                        Ok(context) => handed_out.push(context),
                        Err(ContextError::RegistryDisposed) => break,
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                }
                handed_out
            })
        })
        .collect();

    barrier.wait();
    assert!(registry.dispose());

    for lookup in lookups {
        for context in lookup.join().expect("查找线程不应 panic") {
            assert_eq!(
                context.state(),
                ContextState::Disposed,
                "销毁前分配的上下文必须被批量销毁覆盖"
            );
        }
    }
    assert!(registry.is_empty());
}

#[derive(Clone, Debug)]
enum Op {
    Lookup(usize),
    DisposeContext(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..4).prop_map(Op::Lookup),
        1 => (0usize..4).prop_map(Op::DisposeContext),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// 顺序操作序列下，注册表的替换计数与“失效后再查找”的次数一致，
    /// 且每次查找得到的上下文都处于 `Active`。
    #[test]
    fn prop_replacements_match_model(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let registry = ContextRegistry::new();
        let identities: Vec<_> = (0..4).map(|_| ThreadIdentity::detached()).collect();
        let mut live: HashMap<usize, Arc<spark_context::ExecutionContext>> = HashMap::new();
        let mut stale = [false; 4];
        let mut expected_created = 0_u64;
        let mut expected_replaced = 0_u64;

        for op in ops {
            match op {
                Op::Lookup(slot) => {
                    let context = registry.get_context(identities[slot]).expect("查找不应失败");
                    prop_assert!(context.is_active());
                    match live.get(&slot) {
                        Some(previous) if previous.is_active() => {
                            prop_assert!(Arc::ptr_eq(previous, &context));
                        }
                        _ => {
                            expected_created += 1;
                            if stale[slot] {
                                expected_replaced += 1;
                                stale[slot] = false;
                            }
                            live.insert(slot, context);
                        }
                    }
                }
                Op::DisposeContext(slot) => {
                    if let Some(context) = live.get(&slot) {
                        if context.dispose() {
                            stale[slot] = true;
                        }
                    }
                }
            }
        }

        let stats = registry.stats();
        prop_assert_eq!(stats.created, expected_created);
        prop_assert_eq!(stats.replaced, expected_replaced);
    }
}
