//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 自旋锁
//!
//! 在 `spin::Mutex` 外面加一层关中断：获取前 `push_off`，守卫释放锁之后 `pop_off`。
//! 这样中断处理程序不会在同一 CPU 上重入同一把锁而死锁。

use core::ops::{Deref, DerefMut};

use crate::arch::Platform;

pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 关中断并获取锁
    pub fn lock<'a, P: Platform + ?Sized>(&'a self, platform: &'a P) -> SpinLockGuard<'a, T, P> {
        let irq = IrqGuard::new(platform);
        let guard = self.inner.lock();
        SpinLockGuard { guard, _irq: irq }
    }

    /// 锁当前是否被持有（任何 CPU）
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 关中断守卫，释放时撤销一次 `push_off`
struct IrqGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
}

impl<'a, P: Platform + ?Sized> IrqGuard<'a, P> {
    fn new(platform: &'a P) -> Self {
        platform.push_off();
        Self { platform }
    }
}

impl<P: Platform + ?Sized> Drop for IrqGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.pop_off();
    }
}

/// 自旋锁守卫
///
/// 字段按声明顺序析构：先解锁，再恢复中断。
pub struct SpinLockGuard<'a, T: ?Sized, P: Platform + ?Sized> {
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqGuard<'a, P>,
}

impl<T: ?Sized, P: Platform + ?Sized> Deref for SpinLockGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized, P: Platform + ?Sized> DerefMut for SpinLockGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Uniprocessor;

    #[test]
    fn lock_disables_interrupts_for_guard_lifetime() {
        let up = Uniprocessor::new();
        let lock = SpinLock::new(7usize, "test");
        {
            let mut g = lock.lock(&up);
            assert_eq!(up.intr_depth(), 1);
            assert!(lock.is_locked());
            *g += 1;
        }
        assert_eq!(up.intr_depth(), 0);
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(&up), 8);
    }

    #[test]
    fn nested_locks_nest_interrupt_depth() {
        let up = Uniprocessor::new();
        let a = SpinLock::new((), "a");
        let b = SpinLock::new((), "b");
        let ga = a.lock(&up);
        let gb = b.lock(&up);
        assert_eq!(up.intr_depth(), 2);
        drop(gb);
        assert_eq!(up.intr_depth(), 1);
        drop(ga);
        assert_eq!(up.intr_depth(), 0);
        assert_eq!(a.name(), "a");
    }
}
