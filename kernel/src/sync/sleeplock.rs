//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 睡眠锁
//!
//! 用于可能跨越磁盘 I/O 的长临界区（缓冲区内容）。
//! 拿不到锁的上下文让出 CPU 而不是关中断空转；锁记录持有者的上下文标识，
//! 以便 `holding()` 检查"当前上下文是否持有"。
//!
//! 没有超时和取消：等待者一直等到锁被释放。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::Platform;

const NOBODY: usize = usize::MAX;

pub struct SleepLock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    /// 持有者的上下文标识
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NOBODY),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取锁，必要时让出 CPU 等待
    ///
    /// 调用者不得持有任何 [`SpinLock`](super::SpinLock)。
    pub fn lock<P: Platform + ?Sized>(&self, platform: &P) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock(platform) {
                return guard;
            }
            platform.yield_now();
        }
    }

    pub fn try_lock<P: Platform + ?Sized>(&self, platform: &P) -> Option<SleepLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.holder.store(platform.context_id(), Ordering::Release);
            Some(SleepLockGuard { lock: self })
        } else {
            None
        }
    }

    /// 当前上下文是否持有此锁
    pub fn holding<P: Platform + ?Sized>(&self, platform: &P) -> bool {
        self.locked.load(Ordering::Acquire)
            && self.holder.load(Ordering::Acquire) == platform.context_id()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 守卫所属的锁
    pub fn lock(&self) -> &'a SleepLock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.store(NOBODY, Ordering::Release);
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Uniprocessor;

    #[test]
    fn holding_tracks_guard() {
        let up = Uniprocessor::new();
        let lock = SleepLock::new([0u8; 4], "buffer");
        assert!(!lock.holding(&up));
        {
            let mut g = lock.lock(&up);
            g[0] = 9;
            assert!(lock.holding(&up));
            assert!(lock.try_lock(&up).is_none());
        }
        assert!(!lock.holding(&up));
        assert!(!lock.is_locked());
        assert_eq!(lock.lock(&up)[0], 9);
    }

    #[test]
    fn sleeping_lock_does_not_disable_interrupts() {
        let up = Uniprocessor::new();
        let lock = SleepLock::new((), "buffer");
        let _g = lock.lock(&up);
        assert_eq!(up.intr_depth(), 0);
    }
}
