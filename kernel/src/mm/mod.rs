//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块
//!
//! 两个互不依赖的分配器，服务不同粒度：
//! - `pcp`: 整页分配（每 CPU 空闲链表 + 窃取）
//! - `buddy_allocator`: 任意大小（伙伴系统，最小块 `LEAF_SIZE`）

pub mod bitmap;
pub mod buddy_allocator;
pub mod page;
pub mod pcp;

pub use page::{round_down, round_up, PhysAddr, PAGE_SIZE};
