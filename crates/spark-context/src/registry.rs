//! # ContextRegistry：逻辑线程到执行上下文的进程级映射
//!
//! ## 核心意图（Why）
//! - 每个逻辑线程在任意时刻至多拥有一个 `Active` 上下文；上下文失效后，下一次查找必须分配替代品，
//!   而不是复用失效对象；
//! - 绝大多数查找命中已存在的上下文，因此热路径只持有共享读锁，未命中时才升级为独占写锁。
//!
//! ## 架构定位（Where）
//! - 依赖 [`ContextFactory`] 构造上下文，依赖 [`RegistryConfig`] 决定锁获取切片；
//! - 构造失败复用 `spark-completion` 的 [`AggregatedError`] 形态，与完成信号单元保持一致。
//!
//! ## 行为契约（What）
//! - 锁获取以 `try_read_for` / `try_write_for` 限时尝试并无限重试，竞争只进入日志与统计，不向调用方报错；
//! - 同一失效键上的并发查找在写锁内复查，恰好一个线程完成替换，其余线程拿到同一个新上下文；
//! - 批量销毁（同步或异步）在整个遍历期间持有写锁，且只执行一次，之后的查找返回
//!   [`ContextError::RegistryDisposed`]；
//! - OS 线程为自身标识创建（或替换）上下文后，线程退出时由线程局部守卫摘除并销毁该条目，
//!   映射规模因此随存活线程数而非历史线程数增长；也可用
//!   [`release_caller_context`](ContextRegistry::release_caller_context) 提前释放。
//!
//! ## 风险提示（Trade-offs）
//! - 工厂与批量销毁的清理钩子都在写锁内执行，若它们反过来访问同一注册表会永久重试；
//! - 线程退出回收在该线程的线程局部存储析构阶段执行清理钩子，钩子内不应再依赖线程局部状态
//!   （例如 [`ThreadIdentity::current`]）；异步钩子经 `block_on` 驱动同样依赖线程局部状态，
//!   带异步钩子的上下文应在线程结束前调用 [`release_caller_context`](ContextRegistry::release_caller_context)；
//! - 为分离标识（[`ThreadIdentity::detached`]）或其他线程标识创建的条目不会自动回收，
//!   需要调用方 [`remove`](ContextRegistry::remove) 或等待批量销毁；
//! - 被替换的失效上下文只从映射中移除，不会再次销毁，销毁责任属于最初发起销毁的一方；
//! - 经 [`remove`](ContextRegistry::remove) 摘下的上下文同样脱离注册表管理，之后的批量销毁不会触及它，
//!   销毁责任随所有权一起转移给调用方。

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt, ptr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use spark_completion::AggregatedError;

use crate::{
    config::RegistryConfig,
    context::{AsyncDispose, ExecutionContext},
    error::ContextError,
    factory::{ContextFactory, DefaultContextFactory},
    identity::ThreadIdentity,
};

type Entries = HashMap<ThreadIdentity, Arc<ExecutionContext>>;

thread_local! {
    static EXIT_GUARD: RefCell<ExitGuard> = RefCell::new(ExitGuard::default());
}

/// 注册表运行统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// 工厂成功构造的上下文总数（含替换）。
    pub created: u64,
    /// 其中替换失效上下文的次数。
    pub replaced: u64,
    /// 限时锁获取失败、进入重试的累计次数。
    pub contended: u64,
    /// 因线程退出或显式释放而摘除并销毁的条目数。
    pub reclaimed: u64,
}

/// 逻辑线程到执行上下文的注册表。
///
/// 共享状态放在 `Arc` 中，线程退出守卫只持有 `Weak`，注册表先于线程被丢弃时守卫自动失效。
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: RwLock<Entries>,
    factory: Box<dyn ContextFactory>,
    config: RegistryConfig,
    disposed: AtomicBool,
    created: AtomicU64,
    replaced: AtomicU64,
    contended: AtomicU64,
    reclaimed: AtomicU64,
}

impl ContextRegistry {
    /// 使用默认配置与默认工厂创建注册表。
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// 使用给定配置与默认工厂创建注册表。
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_factory(config, DefaultContextFactory)
    }

    /// 使用自定义工厂创建注册表。
    pub fn with_factory<F>(config: RegistryConfig, factory: F) -> Self
    where
        F: ContextFactory + 'static,
    {
        Self {
            inner: Arc::new(RegistryInner {
                entries: RwLock::new(HashMap::new()),
                factory: Box::new(factory),
                config,
                disposed: AtomicBool::new(false),
                created: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
                contended: AtomicU64::new(0),
                reclaimed: AtomicU64::new(0),
            }),
        }
    }

    /// 锁获取配置。
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// 查找或惰性创建 `identity` 的执行上下文。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：命中路径只需共享读锁，避免在高频查找上串行化；
    /// - **执行 (How)**：
    ///   1. 重试获取读锁，确认注册表未销毁，命中 `Active` 上下文则直接返回；
    ///   2. 未命中或命中失效上下文时释放读锁，转入写锁内的复查与构造；
    /// - **契约 (What)**：
    ///   - 同一存活标识的连续两次查找返回同一实例（`Arc::ptr_eq`）；
    ///   - 工厂失败时返回 [`ContextError::Construction`]，映射保持不变；
    ///   - 注册表销毁后返回 [`ContextError::RegistryDisposed`]。
    pub fn get_context(
        &self,
        identity: ThreadIdentity,
    ) -> Result<Arc<ExecutionContext>, ContextError> {
        {
            let entries = self.inner.read();
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(ContextError::RegistryDisposed);
            }
            if let Some(context) = entries.get(&identity).filter(|context| context.is_active()) {
                return Ok(Arc::clone(context));
            }
        }
        self.create_or_replace(identity)
    }

    /// 调用线程自身的执行上下文。
    ///
    /// 首次创建时登记线程退出守卫，线程结束后条目被摘除并销毁。
    pub fn get_caller_context(&self) -> Result<Arc<ExecutionContext>, ContextError> {
        self.get_context(ThreadIdentity::current())
    }

    /// 立即摘除并销毁调用线程的条目，效果等同于线程退出时的自动回收。
    ///
    /// 返回 `false` 表示调用线程在本注册表中没有条目。
    pub fn release_caller_context(&self) -> bool {
        self.inner.reclaim(ThreadIdentity::current())
    }

    /// `identity` 当前是否登记了 `Active` 上下文。
    pub fn contains(&self, identity: ThreadIdentity) -> bool {
        self.inner
            .read()
            .get(&identity)
            .is_some_and(|context| context.is_active())
    }

    /// 映射中的条目数，包含尚未被替换的失效上下文。
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// 映射是否为空。
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// 把上下文从注册表摘下并交给调用方，不执行销毁。
    ///
    /// 摘下的上下文不再受 [`dispose`](Self::dispose) 覆盖，调用方负责在合适时机销毁它。
    pub fn remove(&self, identity: ThreadIdentity) -> Option<Arc<ExecutionContext>> {
        let removed = self.inner.write().remove(&identity);
        if let Some(context) = &removed {
            tracing::debug!(owner = %identity, context = %context.id(), "execution context detached from registry");
        }
        removed
    }

    /// 是否已执行过批量销毁。
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// 当前统计快照；各计数独立读取，不保证彼此一致。
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.inner.created.load(Ordering::Relaxed),
            replaced: self.inner.replaced.load(Ordering::Relaxed),
            contended: self.inner.contended.load(Ordering::Relaxed),
            reclaimed: self.inner.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// 同步批量销毁。
    ///
    /// - **契约 (What)**：返回 `true` 表示本次调用执行了销毁；已销毁时为无操作并返回 `false`；
    ///   覆盖范围是此刻仍登记在映射中的上下文，先前经 [`remove`](Self::remove) 摘下的上下文不在其中；
    /// - **执行 (How)**：持写锁发布 `disposed` 标记，取出全部上下文并按创建顺序逐个
    ///   [`ExecutionContext::dispose`]，遍历结束后才释放写锁。
    pub fn dispose(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut entries = self.inner.write();
        let Some(contexts) = self.inner.seal(&mut entries) else {
            return false;
        };
        let mut disposed = 0_usize;
        for context in &contexts {
            if context.dispose() {
                disposed += 1;
            }
        }
        drop(entries);
        tracing::info!(
            tracked = contexts.len(),
            disposed,
            "context registry disposed"
        );
        true
    }

    /// 异步批量销毁，语义与覆盖范围同 [`dispose`](Self::dispose)。
    ///
    /// 写锁守卫跨越每个上下文的 `await`，保证任何上下文的异步清理都不会与注册表的并发修改重叠。
    pub async fn dispose_async(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut entries = self.inner.write();
        let Some(contexts) = self.inner.seal(&mut entries) else {
            return false;
        };
        let mut disposed = 0_usize;
        for context in &contexts {
            if context.dispose_async().await {
                disposed += 1;
            }
        }
        drop(entries);
        tracing::info!(
            tracked = contexts.len(),
            disposed,
            "context registry disposed asynchronously"
        );
        true
    }

    /// 写锁内的复查与构造。
    ///
    /// - **意图 (Why)**：读锁释放到写锁获得之间，其他线程可能已经完成替换；复查保证同一失效键
    ///   只被替换一次；
    /// - **风险 (Trade-offs)**：工厂在写锁内运行，慢工厂会阻塞所有查找，这是换取“恰好一次替换”的代价。
    fn create_or_replace(
        &self,
        identity: ThreadIdentity,
    ) -> Result<Arc<ExecutionContext>, ContextError> {
        let mut entries = self.inner.write();
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(ContextError::RegistryDisposed);
        }
        if let Some(context) = entries.get(&identity).filter(|context| context.is_active()) {
            return Ok(Arc::clone(context));
        }

        let context = self.inner.factory.create(identity).map_err(|error| {
            tracing::warn!(owner = %identity, error = %error, "execution context construction failed");
            ContextError::Construction {
                owner: identity,
                source: AggregatedError::single(error),
            }
        })?;
        let context = Arc::new(context);
        self.inner.created.fetch_add(1, Ordering::Relaxed);

        match entries.insert(identity, Arc::clone(&context)) {
            Some(stale) => {
                self.inner.replaced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    owner = %identity,
                    stale = %stale.id(),
                    stale_state = ?stale.state(),
                    context = %context.id(),
                    "replaced inactive execution context"
                );
            }
            None => {
                tracing::debug!(owner = %identity, context = %context.id(), "execution context created");
            }
        }
        drop(entries);

        if ThreadIdentity::try_current() == Some(identity) {
            ExitGuard::track(identity, &self.inner);
        }
        Ok(context)
    }
}

impl RegistryInner {
    /// 在写锁内发布销毁标记并取出全部上下文；已被其他调用者销毁时返回 `None`。
    fn seal(&self, entries: &mut Entries) -> Option<Vec<Arc<ExecutionContext>>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut contexts: Vec<_> = entries.drain().map(|(_, context)| context).collect();
        contexts.sort_by_key(|context| context.id());
        Some(contexts)
    }

    /// 摘除 `identity` 的条目并销毁；清理钩子在写锁释放后执行。
    fn reclaim(&self, identity: ThreadIdentity) -> bool {
        let Some(context) = self.write().remove(&identity) else {
            return false;
        };
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        let disposed = context.dispose();
        tracing::debug!(owner = %identity, context = %context.id(), disposed, "execution context reclaimed");
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        let mut attempts = 0_u32;
        loop {
            if let Some(guard) = self.entries.try_read_for(self.config.lock_slice()) {
                return guard;
            }
            attempts = attempts.saturating_add(1);
            self.note_contention("read", attempts);
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        let mut attempts = 0_u32;
        loop {
            if let Some(guard) = self.entries.try_write_for(self.config.lock_slice()) {
                return guard;
            }
            attempts = attempts.saturating_add(1);
            self.note_contention("write", attempts);
        }
    }

    fn note_contention(&self, mode: &'static str, attempts: u32) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        let threshold = self.config.contention_warn_after();
        if threshold > 0 && attempts % threshold == 0 {
            tracing::warn!(mode, attempts, slice = ?self.config.lock_slice(), "context registry lock is heavily contended");
        } else {
            tracing::trace!(mode, attempts, "context registry lock contended; retrying");
        }
    }
}

/// 线程退出守卫：记录本线程在哪些注册表中以自身标识登记过条目。
///
/// # 教案式说明
/// - **意图 (Why)**：OS 线程退出后其标识永不复用，条目若不回收会永久滞留在映射中；
/// - **执行 (How)**：守卫存放在线程局部存储中，线程退出时析构，逐个升级 `Weak` 并回收条目；
///   标识在登记时保存，析构阶段不再读取线程局部的 [`ThreadIdentity::current`]；
/// - **契约 (What)**：只持有 `Weak`，不延长注册表寿命；已丢弃的注册表在登记新条目时顺带清理。
#[derive(Default)]
struct ExitGuard {
    identity: Option<ThreadIdentity>,
    registries: Vec<Weak<RegistryInner>>,
}

impl ExitGuard {
    fn track(identity: ThreadIdentity, registry: &Arc<RegistryInner>) {
        // 线程正在析构线程局部存储时无法登记，条目留待批量销毁。
        let _ = EXIT_GUARD.try_with(|guard| {
            if let Ok(mut guard) = guard.try_borrow_mut() {
                guard.register(identity, registry);
            }
        });
    }

    fn register(&mut self, identity: ThreadIdentity, registry: &Arc<RegistryInner>) {
        self.identity = Some(identity);
        self.registries.retain(|tracked| tracked.strong_count() > 0);
        let target = Arc::as_ptr(registry);
        if !self
            .registries
            .iter()
            .any(|tracked| ptr::eq(tracked.as_ptr(), target))
        {
            self.registries.push(Arc::downgrade(registry));
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let Some(identity) = self.identity else {
            return;
        };
        for registry in self.registries.drain(..).filter_map(|tracked| tracked.upgrade()) {
            registry.reclaim(identity);
        }
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncDispose for ContextRegistry {
    async fn dispose_async(&self) {
        ContextRegistry::dispose_async(self).await;
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("config", &self.inner.config)
            .field("disposed", &self.is_disposed())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
