//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 块设备驱动层
//!
//! 块缓存只通过 [`BlockDevice::transfer`] 访问磁盘：一次同步传输一整块。
//! 真正的驱动（virtio-blk 等）在别处实现这个 trait；这里提供内存盘 [`RamDisk`]，
//! 供启动早期和测试使用。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::BSIZE;
use crate::errno::Errno;

/// 块设备
pub trait BlockDevice: Sync {
    /// 同步传输 `(dev, blockno)` 一整块
    ///
    /// `write` 为真时把 `buf` 写入磁盘，否则把磁盘内容读入 `buf`。
    /// `buf.len()` 等于块大小。
    fn transfer(&self, dev: u32, blockno: u32, buf: &mut [u8], write: bool) -> Result<(), Errno>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn transfer(&self, dev: u32, blockno: u32, buf: &mut [u8], write: bool) -> Result<(), Errno> {
        (**self).transfer(dev, blockno, buf, write)
    }
}

/// 内存盘
pub struct RamDisk {
    /// 设备号
    dev: u32,
    /// 块数
    nblocks: u32,
    data: Mutex<Vec<u8>>,
    /// 读次数
    reads: AtomicU32,
    /// 写次数
    writes: AtomicU32,
    /// 置位后所有传输返回 EIO
    faulty: AtomicBool,
}

impl RamDisk {
    /// 创建设备号为 `dev`、共 `nblocks` 块的内存盘，内容全 0
    pub fn new(dev: u32, nblocks: u32) -> Self {
        Self {
            dev,
            nblocks,
            data: Mutex::new(vec![0u8; nblocks as usize * BSIZE]),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            faulty: AtomicBool::new(false),
        }
    }

    /// 每块的初始内容由 `fill(blockno, block)` 决定
    pub fn with_contents<F>(dev: u32, nblocks: u32, mut fill: F) -> Self
    where
        F: FnMut(u32, &mut [u8]),
    {
        let disk = Self::new(dev, nblocks);
        {
            let mut data = disk.data.lock();
            for (blockno, block) in data.chunks_mut(BSIZE).enumerate() {
                fill(blockno as u32, block);
            }
        }
        disk
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// 已完成的读传输次数
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Acquire)
    }

    /// 已完成的写传输次数
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::Acquire)
    }

    /// 模拟介质故障
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::Release);
    }

    /// 直接读出磁盘上的一块（绕过缓存，不计数）
    pub fn peek(&self, blockno: u32) -> Option<Vec<u8>> {
        if blockno >= self.nblocks {
            return None;
        }
        let start = blockno as usize * BSIZE;
        Some(self.data.lock()[start..start + BSIZE].to_vec())
    }
}

impl BlockDevice for RamDisk {
    fn transfer(&self, dev: u32, blockno: u32, buf: &mut [u8], write: bool) -> Result<(), Errno> {
        if dev != self.dev {
            return Err(Errno::NoSuchDeviceOrAddress);
        }
        if blockno >= self.nblocks || buf.len() != BSIZE {
            return Err(Errno::InvalidArgument);
        }
        if self.faulty.load(Ordering::Acquire) {
            return Err(Errno::IOError);
        }

        let start = blockno as usize * BSIZE;
        let mut data = self.data.lock();
        let block = &mut data[start..start + BSIZE];
        if write {
            block.copy_from_slice(buf);
            self.writes.fetch_add(1, Ordering::AcqRel);
        } else {
            buf.copy_from_slice(block);
            self.reads.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}
