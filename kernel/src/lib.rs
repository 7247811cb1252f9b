//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux 内核资源管理核心
//!
//! 物理内存分配与块缓存：
//! - [`mm::pcp::PageAllocator`]: 每 CPU 空闲页链表，本地为空时从最忙的 CPU 窃取
//! - [`mm::buddy_allocator::BuddyAllocator`]: 基于位图的二进制伙伴分配器
//! - [`fs::bio::BufCache`]: 分桶的磁盘块缓冲区缓存（MRU 链表 + 睡眠锁）
//!
//! 磁盘 I/O、调度器与中断控制通过 [`drivers::blkdev::BlockDevice`] 和
//! [`arch::Platform`] 两个窄接口接入。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate log;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod errno;
pub mod fs;
pub mod list;
pub mod mm;
pub mod sync;

pub use arch::{Platform, Uniprocessor};
pub use drivers::blkdev::{BlockDevice, RamDisk};
pub use errno::Errno;
pub use fs::bio::{Buf, BufCache, BufId};
pub use mm::buddy_allocator::{BuddyAllocator, BuddyStats, PairState};
pub use mm::pcp::{PageAllocator, PcpStats};
pub use mm::page::PhysAddr;
