//! # ContinuationChain：只追加的延续集合
//!
//! ## 核心意图（Why）
//! - 完成信号单元需要在“完成”那一刻一次性触发所有已登记的回调，同时允许任意线程在任意时刻继续登记；
//! - 迟到的登记（完成之后才到达）不能被静默丢弃，必须在登记线程上立即执行一次。
//!
//! ## 实现逻辑（How）
//! - 以 `ArcSwap<ChainState>` 保存不可变的持久化链表：登记 = 读取当前快照、构造“旧链 + 新节点”、
//!   比较交换，失败则让出时间片后重试；
//! - 触发 = 一次 `swap` 把状态换成 `Sealed`，拿到的旧快照中每个节点恰好被执行一次；
//! - 登记线程若读到 `Sealed`，说明触发已发生，直接在本线程执行回调。
//!
//! ## 契约（What）
//! - 每个回调恰好执行一次：要么进入旧快照由触发方执行，要么观测到 `Sealed` 由登记方执行，两者互斥；
//! - 触发方按登记顺序（先登记先执行）调用；
//! - 回调 panic 会被捕获并记录 `error` 日志，不影响其余回调。

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

type Continuation = Box<dyn FnOnce() + Send + 'static>;

struct Node {
    callback: Mutex<Option<Continuation>>,
    next: Option<Arc<Node>>,
}

impl Drop for Node {
    // 长链递归析构可能耗尽栈，这里改为迭代释放独占的后继节点。
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}

enum ChainState {
    Open { head: Option<Arc<Node>>, len: usize },
    Sealed,
}

/// 登记结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// 已加入链表，将在触发时执行。
    Deferred,
    /// 链已封口，回调已在登记线程上执行完毕。
    Inline,
}

impl Registration {
    /// 回调是否已在登记线程上就地执行。
    pub fn is_inline(self) -> bool {
        matches!(self, Registration::Inline)
    }
}

/// 线程安全、只追加、一次性触发的回调链。
pub struct ContinuationChain {
    state: ArcSwap<ChainState>,
}

impl ContinuationChain {
    /// 创建空的、尚未封口的延续链。
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(ChainState::Open { head: None, len: 0 }),
        }
    }

    /// 登记回调。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：与 `set_exception` 共享同一套“读取-计算-比较交换-重试”纪律，保证并发登记不丢失；
    /// - **执行 (How)**：
    ///   1. 读取当前快照；若已封口则就地执行并返回 [`Registration::Inline`]；
    ///   2. 否则构造以新节点为头的新快照并尝试 `compare_and_swap`；
    ///   3. 失败说明有其他线程抢先写入，从未发布的节点中取回回调，让出时间片后回到第 1 步。
    /// - **契约 (What)**：返回时回调要么已执行，要么必将由 [`fire`](Self::fire) 执行，恰好一次。
    pub fn register<F>(&self, continuation: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending: Option<Continuation> = Some(Box::new(continuation));
        loop {
            let current = self.state.load_full();
            match &*current {
                ChainState::Sealed => {
                    if let Some(callback) = pending.take() {
                        invoke_guarded(callback);
                    }
                    return Registration::Inline;
                }
                ChainState::Open { head, len } => {
                    let node = Arc::new(Node {
                        callback: Mutex::new(pending.take()),
                        next: head.clone(),
                    });
                    let next = Arc::new(ChainState::Open {
                        head: Some(Arc::clone(&node)),
                        len: len + 1,
                    });
                    let previous = self.state.compare_and_swap(&current, next);
                    if Arc::ptr_eq(&*previous, &current) {
                        return Registration::Deferred;
                    }
                    // 节点未发布，任何其他线程都看不到它。
                    pending = node.callback.lock().take();
                    tracing::trace!("continuation registration raced, retrying");
                    thread::yield_now();
                }
            }
        }
    }

    /// 封口并执行全部已登记回调，返回本次执行的数量；重复调用返回 0。
    pub fn fire(&self) -> usize {
        let previous = self.state.swap(Arc::new(ChainState::Sealed));
        let ChainState::Open { head, .. } = &*previous else {
            return 0;
        };

        let mut callbacks = Vec::new();
        let mut cursor = head.clone();
        while let Some(node) = cursor {
            if let Some(callback) = node.callback.lock().take() {
                callbacks.push(callback);
            }
            cursor = node.next.clone();
        }
        // 链表头是最新登记的节点，反转后得到登记顺序。
        callbacks.reverse();

        let fired = callbacks.len();
        for callback in callbacks {
            invoke_guarded(callback);
        }
        fired
    }

    /// 是否已经触发（封口）。
    pub fn is_sealed(&self) -> bool {
        matches!(&**self.state.load(), ChainState::Sealed)
    }

    /// 尚未触发的回调数量；封口后恒为 0。
    pub fn pending(&self) -> usize {
        match &**self.state.load() {
            ChainState::Open { len, .. } => *len,
            ChainState::Sealed => 0,
        }
    }
}

impl Default for ContinuationChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContinuationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationChain")
            .field("sealed", &self.is_sealed())
            .field("pending", &self.pending())
            .finish()
    }
}

fn invoke_guarded(callback: Continuation) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic_message(payload.as_ref());
        tracing::error!(panic = %message, "continuation panicked; remaining continuations still run");
    }
}

/// 把 panic 载荷还原为可读文本。
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("<non-string panic payload>"))
}
