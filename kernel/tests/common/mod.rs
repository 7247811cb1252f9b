//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 集成测试公共设施：宿主机上的 `Platform` 与页对齐内存区

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use kcore::config::PAGE_SIZE;
use kcore::Platform;

const UNASSIGNED: usize = usize::MAX;

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
    static CONTEXT: Cell<usize> = const { Cell::new(UNASSIGNED) };
    static NOFF: Cell<usize> = const { Cell::new(0) };
}

/// 把当前线程绑定到 `cpu`
pub fn bind_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// 让当前线程冒充另一个执行上下文
pub fn set_context(id: usize) {
    CONTEXT.with(|c| c.set(id));
}

/// 当前线程的 `push_off` 嵌套深度
pub fn intr_depth() -> usize {
    NOFF.with(|n| n.get())
}

/// 每个线程是一个上下文，线程自己声明所在的 CPU
#[derive(Debug)]
pub struct HostPlatform {
    ncpu: usize,
}

impl HostPlatform {
    pub fn new(ncpu: usize) -> Self {
        Self { ncpu }
    }
}

impl Platform for HostPlatform {
    fn cpu_id(&self) -> usize {
        CPU.with(|c| c.get())
    }

    fn ncpu(&self) -> usize {
        self.ncpu
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| {
            let depth = n.get();
            assert!(depth > 0, "pop_off: unbalanced");
            n.set(depth - 1);
        });
    }

    fn context_id(&self) -> usize {
        CONTEXT.with(|c| {
            if c.get() == UNASSIGNED {
                c.set(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            }
            c.get()
        })
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// 宿主机上的一段页对齐、清零的内存
pub struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "arena allocation failed");
        Self { ptr, layout }
    }

    pub fn start(&self) -> usize {
        self.ptr as usize
    }

    pub fn end(&self) -> usize {
        self.start() + self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}
