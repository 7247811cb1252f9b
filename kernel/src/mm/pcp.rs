//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Per-CPU Pages (PCP) - 每 CPU 空闲页链表
//!
//! 整页（`PAGE_SIZE`）物理内存分配器，服务于进程内存、内核栈、页表页和管道缓冲区。
//!
//! # 设计
//! - 每个 CPU 一条空闲页链表，各自一把自旋锁，常见路径只碰本地锁
//! - 本地链表为空时"窃取"：逐个加锁/解锁读出其他 CPU 的链表长度，选最长的，
//!   再重新锁住它弹出一页；任何时刻最多持有一把远端锁
//! - 释放总是压入*释放者*所在 CPU 的链表，不论页最初来自哪里，
//!   空闲页会向释放频繁的 CPU 漂移
//! - 链表的"下一页"存放在页描述符表中（按页帧下标索引），而不是写进空闲页本身
//! - 释放时用 `JUNK_ON_FREE` 填满整页（捕获悬垂引用），
//!   分配时用 `JUNK_ON_ALLOC` 填满（捕获未初始化读取）

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::page::{PhysAddr, PAGE_SIZE};
use crate::arch::Platform;
use crate::config::{JUNK_ON_ALLOC, JUNK_ON_FREE, MAX_CPUS};
use crate::sync::SpinLock;

/// 链表结束标记
const NIL: usize = usize::MAX;

bitflags! {
    /// 页帧状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// 页在某条空闲链表上
        const FREE = 1 << 0;
    }
}

/// 页描述符
///
/// `next` 只在持有该页所在链表的锁时读写。
struct FrameDesc {
    next: AtomicUsize,
    flags: AtomicU8,
}

impl FrameDesc {
    const fn new() -> Self {
        Self {
            next: AtomicUsize::new(NIL),
            flags: AtomicU8::new(0),
        }
    }
}

/// 一个 CPU 的空闲页链表
struct FreeArea {
    /// 链表头（页帧下标）
    head: usize,
    /// 链表长度
    len: usize,
}

/// 每 CPU 空闲页分配器
pub struct PageAllocator<P: Platform> {
    platform: P,
    /// 管理范围 `[start, end)`，页对齐
    start: usize,
    end: usize,
    frames: Box<[FrameDesc]>,
    cpus: Box<[SpinLock<FreeArea>]>,
    steals: AtomicUsize,
}

impl<P: Platform> PageAllocator<P> {
    /// 接管 `[start, end)` 中的所有整页，全部放入调用者所在 CPU 的链表
    ///
    /// # Safety
    /// 该范围必须是可读写、已映射、且此后只由本分配器管理的物理内存。
    pub unsafe fn new(platform: P, start: PhysAddr, end: PhysAddr) -> Self {
        let ncpu = platform.ncpu();
        assert!(
            ncpu >= 1 && ncpu <= MAX_CPUS,
            "kinit: {} cpus, MAX_CPUS is {}",
            ncpu,
            MAX_CPUS
        );

        let start = start.ceil().as_usize();
        let end = end.floor().as_usize().max(start);
        let nframes = (end - start) / PAGE_SIZE;

        let frames: Box<[FrameDesc]> = (0..nframes).map(|_| FrameDesc::new()).collect();
        let cpus: Box<[SpinLock<FreeArea>]> = (0..ncpu)
            .map(|_| SpinLock::new(FreeArea { head: NIL, len: 0 }, "kmem"))
            .collect();

        let allocator = Self {
            platform,
            start,
            end,
            frames,
            cpus,
            steals: AtomicUsize::new(0),
        };

        log::info!(
            "kinit: managing [{:#x}, {:#x}), {} pages on {} cpus",
            start,
            end,
            nframes,
            ncpu
        );

        // 启动时的 freerange：每一页都走一遍正常的释放路径
        for pa in (start..end).step_by(PAGE_SIZE) {
            allocator.free_page(PhysAddr::new(pa));
        }

        allocator
    }

    /// 分配一页
    ///
    /// 本地链表为空时从其他 CPU 窃取；所有链表都为空时返回 `None`。
    pub fn alloc_page(&self) -> Option<PhysAddr> {
        let cpu = self.current_cpu();

        let local = {
            let mut area = self.cpus[cpu].lock(&self.platform);
            self.pop(&mut area)
        };
        // 本地锁已释放后才去窃取
        let idx = match local {
            Some(idx) => idx,
            None => self.steal(cpu)?,
        };

        let prev = FrameFlags::from_bits_retain(
            self.frames[idx]
                .flags
                .fetch_and(!FrameFlags::FREE.bits(), Ordering::AcqRel),
        );
        if !prev.contains(FrameFlags::FREE) {
            log::error!("kalloc: frame {} on a free list is not marked free", idx);
            panic!("kalloc: corrupt free list");
        }

        let pa = self.frame_addr(idx);
        unsafe {
            ptr::write_bytes(pa as *mut u8, JUNK_ON_ALLOC, PAGE_SIZE);
        }

        #[cfg(feature = "debug_log")]
        log::trace!("kalloc: cpu {} -> {:#x}", cpu, pa);

        Some(PhysAddr::new(pa))
    }

    /// 释放一页到当前 CPU 的链表
    ///
    /// 空地址、未对齐、超出管理范围或重复释放都是致命错误。
    pub fn free_page(&self, pa: PhysAddr) {
        let addr = pa.as_usize();
        if pa.is_null() || !pa.is_aligned() || addr < self.start || addr >= self.end {
            log::error!(
                "kfree: {:#x} is null, misaligned or outside [{:#x}, {:#x})",
                addr,
                self.start,
                self.end
            );
            panic!("kfree: bad address {:#x}", addr);
        }

        let idx = (addr - self.start) / PAGE_SIZE;
        let prev = FrameFlags::from_bits_retain(
            self.frames[idx]
                .flags
                .fetch_or(FrameFlags::FREE.bits(), Ordering::AcqRel),
        );
        if prev.contains(FrameFlags::FREE) {
            log::error!("kfree: {:#x} is already free", addr);
            panic!("kfree: double free {:#x}", addr);
        }

        unsafe {
            ptr::write_bytes(addr as *mut u8, JUNK_ON_FREE, PAGE_SIZE);
        }

        let cpu = self.current_cpu();
        let mut area = self.cpus[cpu].lock(&self.platform);
        self.push(&mut area, idx);

        #[cfg(feature = "debug_log")]
        log::trace!("kfree: cpu {} <- {:#x}", cpu, addr);
    }

    /// 从其他 CPU 窃取一页
    ///
    /// 先逐个加锁读取长度（每次只持有一把锁），选出最长的链表，
    /// 再重新加锁弹出。扫描与弹出之间链表可能被取空，此时重新扫描。
    fn steal(&self, me: usize) -> Option<usize> {
        loop {
            let mut victim = None;
            let mut max_len = 0;
            for (id, area) in self.cpus.iter().enumerate() {
                if id == me {
                    continue;
                }
                let len = area.lock(&self.platform).len;
                if len > max_len {
                    max_len = len;
                    victim = Some(id);
                }
            }

            let Some(victim) = victim else {
                log::warn!("kalloc: cpu {} found no free page on any cpu", me);
                return None;
            };

            let mut area = self.cpus[victim].lock(&self.platform);
            if let Some(idx) = self.pop(&mut area) {
                self.steals.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "debug_log")]
                log::trace!("kalloc: cpu {} stole frame {} from cpu {}", me, idx, victim);
                return Some(idx);
            }
        }
    }

    fn pop(&self, area: &mut FreeArea) -> Option<usize> {
        if area.head == NIL {
            return None;
        }
        let idx = area.head;
        area.head = self.frames[idx].next.load(Ordering::Relaxed);
        self.frames[idx].next.store(NIL, Ordering::Relaxed);
        area.len -= 1;
        Some(idx)
    }

    fn push(&self, area: &mut FreeArea, idx: usize) {
        self.frames[idx].next.store(area.head, Ordering::Relaxed);
        area.head = idx;
        area.len += 1;
    }

    /// 当前 CPU 编号（关中断读取，避免读到一半被迁移）
    fn current_cpu(&self) -> usize {
        self.platform.push_off();
        let cpu = self.platform.cpu_id();
        self.platform.pop_off();
        if cpu >= self.cpus.len() {
            panic!("kalloc: cpu id {} out of range", cpu);
        }
        cpu
    }

    fn frame_addr(&self, idx: usize) -> usize {
        self.start + idx * PAGE_SIZE
    }

    /// 管理范围 `[start, end)`
    pub fn range(&self) -> (PhysAddr, PhysAddr) {
        (PhysAddr::new(self.start), PhysAddr::new(self.end))
    }

    /// 管理的总页数
    pub fn total_pages(&self) -> usize {
        self.frames.len()
    }

    /// 所有 CPU 链表上的空闲页总数
    pub fn free_pages(&self) -> usize {
        self.cpus
            .iter()
            .map(|area| area.lock(&self.platform).len)
            .sum()
    }

    /// 各 CPU 链表长度快照（逐个加锁，不是全局一致快照）
    pub fn stats(&self) -> PcpStats {
        let mut stats = PcpStats {
            ncpu: self.cpus.len(),
            steals: self.steals.load(Ordering::Relaxed),
            ..PcpStats::default()
        };
        for (id, area) in self.cpus.iter().enumerate() {
            stats.free[id] = area.lock(&self.platform).len;
        }
        stats
    }

    /// 某个 CPU 链表上的页地址（从头到尾）
    pub fn free_list(&self, cpu: usize) -> Vec<PhysAddr> {
        let area = self.cpus[cpu].lock(&self.platform);
        let mut pages = Vec::with_capacity(area.len);
        let mut idx = area.head;
        while idx != NIL {
            pages.push(PhysAddr::new(self.frame_addr(idx)));
            idx = self.frames[idx].next.load(Ordering::Relaxed);
        }
        pages
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

/// 每 CPU 空闲页统计
#[derive(Debug, Clone, Copy)]
pub struct PcpStats {
    /// 实际 CPU 数量
    pub ncpu: usize,
    /// 各 CPU 链表长度，只有前 `ncpu` 项有效
    pub free: [usize; MAX_CPUS],
    /// 成功窃取的次数
    pub steals: usize,
}

impl Default for PcpStats {
    fn default() -> Self {
        Self {
            ncpu: 0,
            free: [0; MAX_CPUS],
            steals: 0,
        }
    }
}

impl PcpStats {
    pub fn total_free(&self) -> usize {
        self.free[..self.ncpu].iter().sum()
    }
}
