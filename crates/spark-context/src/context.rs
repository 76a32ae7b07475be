//! # ExecutionContext：每个逻辑线程一份的可销毁状态
//!
//! ## 核心意图（Why）
//! - 为逻辑线程提供一个长生命周期、可携带任意类型数据的容器，并在销毁时按登记顺序执行清理；
//! - 注册表依据上下文的生命周期状态判断是否需要分配替代品，因此状态必须单调、可无锁读取。
//!
//! ## 行为契约（What）
//! - 状态机 `Active → Disposing → Disposed`，只能前进；只有赢得 `Active → Disposing` 比较交换的
//!   调用者执行清理，其余调用者得到 `false`；
//! - 清理钩子恰好执行一次，顺序与登记顺序一致；同步销毁以 `block_on` 驱动异步钩子，
//!   异步销毁逐个 `await`；
//! - 钩子 panic 被捕获并记录，不阻断后续钩子，也不阻止状态推进到 `Disposed`。
//!
//! ## 风险提示（Trade-offs）
//! - 钩子在注册表写锁内执行（批量销毁时），钩子内部不得再访问同一注册表；
//! - 槽位以 `TypeId` 为键，同一类型只能存放一个值。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, atomic::AtomicU64},
};

// 教案级说明：生命周期状态字在 `--cfg loom` 下切换为 Loom 原子类型，
// 让模型检查覆盖并发销毁时 `Active → Disposing` 的抢占；编号计数器是静态量，保持标准实现。
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};
use parking_lot::Mutex;

use crate::identity::ThreadIdentity;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// 上下文生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// 可正常使用。
    Active,
    /// 清理进行中；注册表视其为不存在。
    Disposing,
    /// 清理已完成。
    Disposed,
}

impl ContextState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACTIVE => ContextState::Active,
            DISPOSING => ContextState::Disposing,
            _ => ContextState::Disposed,
        }
    }
}

/// 进程内唯一的上下文编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn allocate() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 原始数值，仅用于日志与诊断。
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// 支持异步清理的资源。
///
/// # 教案式说明
/// - **意图 (Why)**：让上下文、注册表以及调用方自有资源以同一接口参与异步销毁链；
/// - **契约 (What)**：实现必须幂等，重复调用不得重复释放；
/// - **执行 (How)**：通过 [`ExecutionContext::attach`] 挂到上下文上，上下文销毁时依次等待。
#[async_trait]
pub trait AsyncDispose: Send + Sync {
    /// 异步释放资源。
    async fn dispose_async(&self);
}

type Slot = Arc<dyn Any + Send + Sync>;

enum Hook {
    Blocking(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
}

/// 逻辑线程的执行上下文。
pub struct ExecutionContext {
    id: ContextId,
    owner: ThreadIdentity,
    state: AtomicU8,
    slots: Mutex<HashMap<TypeId, Slot>>,
    hooks: Mutex<Vec<Hook>>,
}

impl ExecutionContext {
    /// 为 `owner` 创建一个处于 `Active` 状态的空上下文。
    pub fn new(owner: ThreadIdentity) -> Self {
        Self {
            id: ContextId::allocate(),
            owner,
            state: AtomicU8::new(ACTIVE),
            slots: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// 上下文编号。
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// 上下文所属的逻辑线程。
    pub fn owner(&self) -> ThreadIdentity {
        self.owner
    }

    /// 当前生命周期状态。
    pub fn state(&self) -> ContextState {
        ContextState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// 是否仍处于 `Active`。
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// 存入类型为 `T` 的值，返回被替换的旧值。
    pub fn insert<T>(&self, value: T) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.slots
            .lock()
            .insert(TypeId::of::<T>(), Arc::new(value))
            .and_then(downcast_slot)
    }

    /// 读取类型为 `T` 的值。
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.slots
            .lock()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(downcast_slot)
    }

    /// 取出类型为 `T` 的值。
    pub fn remove<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.slots
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(downcast_slot)
    }

    /// 是否存放了类型为 `T` 的值。
    pub fn contains<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.slots.lock().contains_key(&TypeId::of::<T>())
    }

    /// 登记同步清理钩子。
    ///
    /// - **契约 (What)**：返回 `false` 表示上下文已离开 `Active`，钩子被丢弃且不会执行；
    /// - **执行 (How)**：状态检查与入队在同一把互斥锁内完成，销毁方先推进状态再取走钩子，
    ///   因此“检查通过却错过清理”的交错不存在。
    #[must_use]
    pub fn on_dispose<F>(&self, hook: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_hook(Hook::Blocking(Box::new(hook)))
    }

    /// 登记异步清理钩子，语义同 [`on_dispose`](Self::on_dispose)。
    #[must_use]
    pub fn on_dispose_async<F, Fut>(&self, hook: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_hook(Hook::Async(Box::new(move || hook().boxed())))
    }

    /// 把资源的异步清理挂到本上下文的销毁流程上。
    #[must_use]
    pub fn attach<R>(&self, resource: Arc<R>) -> bool
    where
        R: AsyncDispose + ?Sized + 'static,
    {
        self.on_dispose_async(move || async move { resource.dispose_async().await })
    }

    /// 同步销毁。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：同步调用方（包括注册表的同步批量销毁）无法 `await`，
    ///   因此异步钩子在当前线程上以 `futures::executor::block_on` 驱动完成；
    /// - **执行 (How)**：
    ///   1. 比较交换 `Active → Disposing`，失败直接返回 `false`；
    ///   2. 取走全部钩子并按登记顺序执行；
    ///   3. 清空槽位，发布 `Disposed`。
    /// - **风险 (Trade-offs)**：在异步运行时的工作线程上调用会阻塞该线程，异步场景应改用
    ///   [`dispose_async`](Self::dispose_async)。
    pub fn dispose(&self) -> bool {
        let Some(hooks) = self.begin_dispose() else {
            return false;
        };
        for hook in hooks {
            match hook {
                Hook::Blocking(callback) => run_guarded(self.id, callback),
                Hook::Async(factory) => {
                    futures::executor::block_on(await_guarded(self.id, factory));
                }
            }
        }
        self.finish_dispose();
        true
    }

    /// 异步销毁：与 [`dispose`](Self::dispose) 相同的状态推进，钩子逐个 `await`。
    pub async fn dispose_async(&self) -> bool {
        let Some(hooks) = self.begin_dispose() else {
            return false;
        };
        for hook in hooks {
            match hook {
                Hook::Blocking(callback) => run_guarded(self.id, callback),
                Hook::Async(factory) => await_guarded(self.id, factory).await,
            }
        }
        self.finish_dispose();
        true
    }

    fn push_hook(&self, hook: Hook) -> bool {
        let mut hooks = self.hooks.lock();
        if !self.is_active() {
            tracing::debug!(context = %self.id, "dispose hook rejected; context is no longer active");
            return false;
        }
        hooks.push(hook);
        true
    }

    fn begin_dispose(&self) -> Option<Vec<Hook>> {
        if self
            .state
            .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        tracing::trace!(context = %self.id, owner = %self.owner, hooks = hooks.len(), "disposing execution context");
        Some(hooks)
    }

    fn finish_dispose(&self) {
        self.slots.lock().clear();
        self.state.store(DISPOSED, Ordering::Release);
        tracing::debug!(context = %self.id, owner = %self.owner, "execution context disposed");
    }
}

#[async_trait]
impl AsyncDispose for ExecutionContext {
    async fn dispose_async(&self) {
        ExecutionContext::dispose_async(self).await;
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

fn downcast_slot<T>(slot: Slot) -> Option<Arc<T>>
where
    T: Any + Send + Sync,
{
    slot.downcast::<T>().ok()
}

fn run_guarded(context: ContextId, callback: Box<dyn FnOnce() + Send>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(%context, panic = %panic_message(payload.as_ref()), "dispose hook panicked");
    }
}

async fn await_guarded(
    context: ContextId,
    factory: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
) {
    let future = match panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(future) => future,
        Err(payload) => {
            tracing::error!(%context, panic = %panic_message(payload.as_ref()), "async dispose hook panicked");
            return;
        }
    };
    if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
        tracing::error!(%context, panic = %panic_message(payload.as_ref()), "async dispose hook panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("<non-string panic payload>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn slots_are_typed() {
        let context = ExecutionContext::new(ThreadIdentity::detached());
        assert!(context.insert(7_u32).is_none());
        assert!(context.insert(String::from("name")).is_none());
        assert_eq!(context.insert(9_u32).as_deref(), Some(&7));
        assert_eq!(context.get::<u32>().as_deref(), Some(&9));
        assert!(context.contains::<String>());
        assert_eq!(context.remove::<String>().as_deref().map(String::as_str), Some("name"));
        assert!(!context.contains::<String>());
    }

    #[test]
    fn dispose_runs_hooks_in_order_once() {
        let context = ExecutionContext::new(ThreadIdentity::detached());
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let order = Arc::clone(&order);
            if index == 1 {
                assert!(context.on_dispose_async(move || async move { order.lock().push(index) }));
            } else {
                assert!(context.on_dispose(move || order.lock().push(index)));
            }
        }
        context.insert(1_u8);

        assert!(context.dispose());
        assert!(!context.dispose(), "重复销毁必须返回 false");
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(context.state(), ContextState::Disposed);
        assert!(!context.contains::<u8>(), "销毁后槽位应被清空");
    }

    #[test]
    fn hooks_registered_after_dispose_are_rejected() {
        let context = ExecutionContext::new(ThreadIdentity::detached());
        assert!(context.dispose());
        assert!(!context.on_dispose(|| panic!("不应执行")));
    }

    #[test]
    fn panicking_hook_does_not_stop_disposal() {
        let context = ExecutionContext::new(ThreadIdentity::detached());
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(context.on_dispose(|| panic!("boom")));
        assert!(context.on_dispose_async(|| async { panic!("async boom") }));
        let observed = Arc::clone(&hits);
        assert!(context.on_dispose(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(block_on(context.dispose_async()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(context.state(), ContextState::Disposed);
    }

    #[test]
    fn attached_contexts_dispose_transitively() {
        let parent = ExecutionContext::new(ThreadIdentity::detached());
        let child = Arc::new(ExecutionContext::new(parent.owner()));
        assert!(parent.attach(Arc::clone(&child)));
        assert!(parent.dispose());
        assert_eq!(child.state(), ContextState::Disposed);
    }
}
