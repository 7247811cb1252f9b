//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 同步原语 (Synchronization Primitives)
//!
//! 两类锁，对应 xv6/Linux 的 spinlock 与 sleeplock：
//! - [`SpinLock`]: 不可睡眠，持有期间关本地中断，只保护短小的元数据临界区
//! - [`SleepLock`]: 可睡眠，等待者让出 CPU，可以跨越磁盘 I/O 持有
//!
//! 持有 `SpinLock` 时不得获取 `SleepLock`，也不得等待 I/O。

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
