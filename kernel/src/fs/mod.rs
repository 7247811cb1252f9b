//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 文件系统底层
//!
//! 只包含块缓存；磁盘布局由上层文件系统决定。

pub mod bio;

pub use bio::{Buf, BufCache, BufId};
