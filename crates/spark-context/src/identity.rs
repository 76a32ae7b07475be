//! # ThreadIdentity：逻辑线程的不透明标识
//!
//! ## 核心意图（Why）
//! - 操作系统线程号会在线程退出后被复用，若直接作为注册表键，新线程可能“继承”旧线程的上下文；
//! - 因此以进程级单调计数器分配标识，任何两个逻辑线程都不会拿到同一个值。
//!
//! ## 行为契约（What）
//! - [`ThreadIdentity::current`]：同一 OS 线程多次调用返回同一值，首次调用时惰性分配；
//! - [`ThreadIdentity::detached`]：为不绑定 OS 线程的逻辑执行流（任务、协程）分配新值；
//! - 两种来源共享同一计数器，永不冲突。

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadIdentity = ThreadIdentity::allocate();
}

/// 逻辑线程标识，进程内永不复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdentity(u64);

impl ThreadIdentity {
    /// 调用线程的标识。
    pub fn current() -> Self {
        CURRENT.with(|identity| *identity)
    }

    /// 与 [`current`](Self::current) 相同，但在线程局部存储已销毁（线程退出阶段）时返回 `None`。
    pub fn try_current() -> Option<Self> {
        CURRENT.try_with(|identity| *identity).ok()
    }

    /// 分配一个不与任何 OS 线程绑定的新标识。
    pub fn detached() -> Self {
        Self::allocate()
    }

    /// 原始数值，仅用于日志与诊断。
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    fn allocate() -> Self {
        Self(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}
