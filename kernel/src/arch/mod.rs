//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 架构相关接口
//!
//! 资源核心不直接访问 CSR 或调度器，而是通过 [`Platform`] 取得：
//! - 当前 CPU 编号（每 CPU 空闲页链表的下标）
//! - 关/开本地中断（自旋锁持有期间必须关中断）
//! - 当前执行上下文标识与让出 CPU（睡眠锁的持有者记录与等待）

use core::sync::atomic::{AtomicUsize, Ordering};

/// 执行环境
///
/// `push_off`/`pop_off` 按 xv6 语义嵌套：最外层 `push_off` 记录中断原状态并关中断，
/// 匹配的最后一次 `pop_off` 才恢复。
pub trait Platform: Sync {
    /// 当前 CPU 编号，范围 `0..ncpu()`
    fn cpu_id(&self) -> usize;

    /// CPU 数量
    fn ncpu(&self) -> usize;

    /// 关闭本地中断（可嵌套）
    fn push_off(&self);

    /// 撤销一次 `push_off`
    fn pop_off(&self);

    /// 当前执行上下文（进程/内核线程）标识，用于睡眠锁的持有者检查
    fn context_id(&self) -> usize;

    /// 让出 CPU，等待被再次调度
    fn yield_now(&self);
}

impl<P: Platform + ?Sized> Platform for &P {
    fn cpu_id(&self) -> usize {
        (**self).cpu_id()
    }

    fn ncpu(&self) -> usize {
        (**self).ncpu()
    }

    fn push_off(&self) {
        (**self).push_off()
    }

    fn pop_off(&self) {
        (**self).pop_off()
    }

    fn context_id(&self) -> usize {
        (**self).context_id()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}

/// 单处理器环境
///
/// 启动早期（调度器就绪之前）或单核配置下使用：只有 CPU 0、只有一个上下文，
/// 中断开关只记录嵌套深度。
#[derive(Debug, Default)]
pub struct Uniprocessor {
    noff: AtomicUsize,
}

impl Uniprocessor {
    pub const fn new() -> Self {
        Self {
            noff: AtomicUsize::new(0),
        }
    }

    /// 当前 `push_off` 嵌套深度
    pub fn intr_depth(&self) -> usize {
        self.noff.load(Ordering::Acquire)
    }
}

impl Platform for Uniprocessor {
    fn cpu_id(&self) -> usize {
        0
    }

    fn ncpu(&self) -> usize {
        1
    }

    fn push_off(&self) {
        self.noff.fetch_add(1, Ordering::AcqRel);
    }

    fn pop_off(&self) {
        let prev = self.noff.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("pop_off: unbalanced");
        }
    }

    fn context_id(&self) -> usize {
        0
    }

    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}
