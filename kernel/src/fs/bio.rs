//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Buffer I/O 层 - 块缓存
//!
//! 固定数量的缓冲区（`NBUF` 个，每个 `BSIZE` 字节）按*下标*分到 `NBUCKET` 个结构桶：
//! 缓冲区 i 永远属于桶 `i % NBUCKET`，与它当前缓存的是哪一块无关。每个桶一把自旋锁，
//! 桶内是一条双向循环链表，表头一侧最近使用（MRU），另一侧最久未用（LRU）。
//!
//! 每个缓冲区另有一把睡眠锁保护内容，可以跨越磁盘 I/O 持有。
//!
//! # 查找
//! 从 `(dev, blockno)` 的哈希得到起始桶，按轮转顺序探测所有桶，任何时刻只持有
//! 一个桶锁：
//! 1. 命中：引用计数加一，放开桶锁，再去拿内容锁
//! 2. 未命中：按同样顺序从每个桶的 LRU 一端找引用计数为 0 的缓冲区，改绑到新块、
//!    清除有效位，引用计数置 1
//!
//! 绑定只在回收锁 `evict` 内发生，并在锁内重新查找一遍，所以同一块不会同时绑定到
//! 两个缓冲区。命中路径不碰回收锁。
//!
//! 代价是所有未命中在全局串行：即使两个未命中落在不同的桶，也要排队经过 `evict`。
//! 桶锁只让命中路径可以并行扩展；未命中多的负载（冷启动、顺序扫描大文件）
//! 仍受限于这一把锁。
//!
//! # 接口
//! - [`BufCache::read`] 返回持有内容锁、内容有效的 [`Buf`]
//! - [`BufCache::write`] 把内容写回磁盘，调用者必须持有内容锁
//! - [`BufCache::release`] 或直接 drop [`Buf`]：放开内容锁，引用计数减一，
//!   归零时移到所在桶的 MRU 一端
//! - [`BufCache::pin`] / [`BufCache::unpin`]：只调整引用计数（例如日志层钉住
//!   尚未提交的块），不碰链表位置和内容锁

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::arch::Platform;
use crate::config::{BSIZE, NBUCKET, NBUF};
use crate::drivers::blkdev::BlockDevice;
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};

/// 链表表头（哨兵）
const HEAD: usize = usize::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BufFlags: u8 {
        /// 内容与磁盘一致（已读入）
        const VALID = 1 << 0;
    }
}

/// 缓冲区编号（在池中的下标），生命周期内不变
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufId(usize);

impl BufId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// 桶内的缓冲区元数据，只在持有桶锁时访问
struct Node {
    /// 当前绑定的 `(dev, blockno)`
    key: Option<(u32, u32)>,
    refcnt: u32,
    prev: usize,
    next: usize,
}

/// 结构桶：一条 MRU 链表，链接的是桶内下标
struct Bucket {
    head_next: usize,
    head_prev: usize,
    nodes: Box<[Node]>,
}

impl Bucket {
    fn new(n: usize) -> Self {
        let nodes = (0..n)
            .map(|_| Node {
                key: None,
                refcnt: 0,
                prev: HEAD,
                next: HEAD,
            })
            .collect();
        let mut bucket = Self {
            head_next: HEAD,
            head_prev: HEAD,
            nodes,
        };
        // 依次插到表头：下标最小的缓冲区在 LRU 一端
        for i in 0..n {
            bucket.push_front(i);
        }
        bucket
    }

    fn set_next(&mut self, i: usize, next: usize) {
        if i == HEAD {
            self.head_next = next;
        } else {
            self.nodes[i].next = next;
        }
    }

    fn set_prev(&mut self, i: usize, prev: usize) {
        if i == HEAD {
            self.head_prev = prev;
        } else {
            self.nodes[i].prev = prev;
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.nodes[i].prev, self.nodes[i].next);
        self.set_next(prev, next);
        self.set_prev(next, prev);
    }

    fn push_front(&mut self, i: usize) {
        let first = self.head_next;
        self.nodes[i].prev = HEAD;
        self.nodes[i].next = first;
        self.set_prev(first, i);
        self.head_next = i;
    }

    /// 从 MRU 一端查找绑定到 `key` 的缓冲区
    fn find(&self, key: (u32, u32)) -> Option<usize> {
        let mut i = self.head_next;
        while i != HEAD {
            if self.nodes[i].key == Some(key) {
                return Some(i);
            }
            i = self.nodes[i].next;
        }
        None
    }

    /// 从 LRU 一端查找引用计数为 0 的缓冲区
    fn find_unused(&self) -> Option<usize> {
        let mut i = self.head_prev;
        while i != HEAD {
            if self.nodes[i].refcnt == 0 {
                return Some(i);
            }
            i = self.nodes[i].prev;
        }
        None
    }

    /// 从 LRU 到 MRU 的桶内下标
    fn lru_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut i = self.head_prev;
        while i != HEAD {
            order.push(i);
            i = self.nodes[i].prev;
        }
        order
    }
}

struct BufSlot {
    flags: AtomicU8,
    data: SleepLock<Box<[u8]>>,
}

impl BufSlot {
    fn is_valid(&self) -> bool {
        BufFlags::from_bits_retain(self.flags.load(Ordering::Acquire)).contains(BufFlags::VALID)
    }
}

/// 块缓存
pub struct BufCache<P: Platform, D: BlockDevice> {
    platform: P,
    disk: D,
    buckets: Box<[SpinLock<Bucket>]>,
    /// 串行化未命中时的绑定
    evict: SpinLock<()>,
    bufs: Box<[BufSlot]>,
}

impl<P: Platform, D: BlockDevice> BufCache<P, D> {
    /// `NBUF` 个缓冲区、`NBUCKET` 个桶
    pub fn new(platform: P, disk: D) -> Self {
        Self::with_geometry(platform, disk, NBUF, NBUCKET)
    }

    pub fn with_geometry(platform: P, disk: D, nbuf: usize, nbucket: usize) -> Self {
        assert!(
            nbucket >= 1 && nbuf >= nbucket,
            "binit: {} buffers in {} buckets",
            nbuf,
            nbucket
        );

        let buckets: Box<[SpinLock<Bucket>]> = (0..nbucket)
            .map(|b| SpinLock::new(Bucket::new((nbuf - b).div_ceil(nbucket)), "bcache.bucket"))
            .collect();
        let bufs: Box<[BufSlot]> = (0..nbuf)
            .map(|_| BufSlot {
                flags: AtomicU8::new(0),
                data: SleepLock::new(vec![0u8; BSIZE].into_boxed_slice(), "buffer"),
            })
            .collect();

        log::info!(
            "binit: {} buffers of {} bytes in {} buckets",
            nbuf,
            BSIZE,
            nbucket
        );

        Self {
            platform,
            disk,
            buckets,
            evict: SpinLock::new((), "bcache.evict"),
            bufs,
        }
    }

    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 查找的起始桶
    pub fn bucket_of(&self, dev: u32, blockno: u32) -> usize {
        ((dev ^ blockno ^ (blockno >> 4)) as usize) % self.nbucket()
    }

    /// 缓冲区所在的结构桶及桶内下标
    fn locate(&self, id: BufId) -> (usize, usize) {
        (id.0 % self.nbucket(), id.0 / self.nbucket())
    }

    fn id_of(&self, bucket: usize, local: usize) -> BufId {
        BufId(local * self.nbucket() + bucket)
    }

    fn probe(&self, start: usize) -> impl Iterator<Item = usize> {
        let n = self.nbucket();
        (0..n).map(move |step| (start + step) % n)
    }

    fn lookup(&self, key: (u32, u32)) -> Option<BufId> {
        for b in self.probe(self.bucket_of(key.0, key.1)) {
            let mut bucket = self.buckets[b].lock(&self.platform);
            if let Some(i) = bucket.find(key) {
                bucket.nodes[i].refcnt += 1;
                return Some(self.id_of(b, i));
            }
        }
        None
    }

    /// 找到或分配 `(dev, blockno)` 的缓冲区，引用计数已加一，内容锁未持有
    fn bget(&self, dev: u32, blockno: u32) -> BufId {
        let key = (dev, blockno);
        if let Some(id) = self.lookup(key) {
            return id;
        }

        let _evict = self.evict.lock(&self.platform);
        // 拿回收锁之前可能已有别人绑定了这一块
        if let Some(id) = self.lookup(key) {
            return id;
        }

        for b in self.probe(self.bucket_of(dev, blockno)) {
            let mut bucket = self.buckets[b].lock(&self.platform);
            if let Some(i) = bucket.find_unused() {
                let node = &mut bucket.nodes[i];
                node.key = Some(key);
                node.refcnt = 1;
                let id = self.id_of(b, i);
                self.bufs[id.0]
                    .flags
                    .fetch_and(!BufFlags::VALID.bits(), Ordering::AcqRel);
                #[cfg(feature = "debug_log")]
                log::trace!("bget: dev {} block {} -> {} (bucket {})", dev, blockno, id, b);
                return id;
            }
        }

        log::error!("bget: all {} buffers are referenced", self.nbuf());
        panic!("bget: no buffers");
    }

    /// 返回持有内容锁、内容有效的缓冲区
    ///
    /// 未缓存的块会同步读盘；读盘失败是致命错误。
    pub fn read(&self, dev: u32, blockno: u32) -> Buf<'_, P, D> {
        let id = self.bget(dev, blockno);
        let slot = &self.bufs[id.0];
        let mut guard = slot.data.lock(&self.platform);

        if !slot.is_valid() {
            if let Err(e) = self.disk.transfer(dev, blockno, &mut guard[..], false) {
                log::error!("bread: dev {} block {}: {}", dev, blockno, e);
                panic!("bread: transfer failed: {}", e);
            }
            slot.flags.fetch_or(BufFlags::VALID.bits(), Ordering::AcqRel);
        }

        Buf {
            cache: self,
            id,
            dev,
            blockno,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// 把缓冲区内容写回磁盘
    ///
    /// 当前上下文必须持有该缓冲区的内容锁。
    pub fn write(&self, buf: &mut Buf<'_, P, D>) {
        if !ptr::eq(buf.cache, self) || !buf.guard.lock().holding(&self.platform) {
            log::error!("bwrite: {} is not locked by the calling context", buf.id);
            panic!("bwrite: {} not locked", buf.id);
        }
        if let Err(e) = self.disk.transfer(buf.dev, buf.blockno, &mut buf.guard[..], true) {
            log::error!("bwrite: dev {} block {}: {}", buf.dev, buf.blockno, e);
            panic!("bwrite: transfer failed: {}", e);
        }
    }

    /// 释放缓冲区
    ///
    /// 当前上下文必须持有内容锁。等价于 drop，只是多一次持有者检查。
    pub fn release(&self, buf: Buf<'_, P, D>) {
        if !ptr::eq(buf.cache, self) || !buf.guard.lock().holding(&self.platform) {
            log::error!("brelse: {} is not locked by the calling context", buf.id);
            panic!("brelse: {} not locked", buf.id);
        }
        drop(buf);
    }

    /// 引用计数减一，归零时移到 MRU 一端
    fn unref(&self, id: BufId) {
        let (b, i) = self.locate(id);
        let mut bucket = self.buckets[b].lock(&self.platform);
        let node = &mut bucket.nodes[i];
        if node.refcnt == 0 {
            log::error!("brelse: {} has no references", id);
            panic!("brelse: {} refcnt underflow", id);
        }
        node.refcnt -= 1;
        if node.refcnt == 0 {
            bucket.unlink(i);
            bucket.push_front(i);
        }
    }

    fn check_id(&self, id: BufId, op: &str) {
        if id.0 >= self.nbuf() {
            log::error!("{}: {} outside pool of {}", op, id, self.nbuf());
            panic!("{}: unknown buffer {}", op, id);
        }
    }

    /// 钉住缓冲区：引用计数加一，使其不会被回收
    pub fn pin(&self, id: BufId) {
        self.check_id(id, "bpin");
        let (b, i) = self.locate(id);
        self.buckets[b].lock(&self.platform).nodes[i].refcnt += 1;
    }

    /// 撤销一次 [`BufCache::pin`]
    pub fn unpin(&self, id: BufId) {
        self.check_id(id, "bunpin");
        let (b, i) = self.locate(id);
        let mut bucket = self.buckets[b].lock(&self.platform);
        let node = &mut bucket.nodes[i];
        if node.refcnt == 0 {
            log::error!("bunpin: {} is not referenced", id);
            panic!("bunpin: {} refcnt is zero", id);
        }
        node.refcnt -= 1;
    }

    /// 当前引用计数
    pub fn refcnt(&self, id: BufId) -> u32 {
        self.check_id(id, "brefcnt");
        let (b, i) = self.locate(id);
        self.buckets[b].lock(&self.platform).nodes[i].refcnt
    }

    /// 当前绑定的 `(dev, blockno)`
    pub fn key(&self, id: BufId) -> Option<(u32, u32)> {
        self.check_id(id, "bkey");
        let (b, i) = self.locate(id);
        self.buckets[b].lock(&self.platform).nodes[i].key
    }

    pub fn is_valid(&self, id: BufId) -> bool {
        self.check_id(id, "bvalid");
        self.bufs[id.0].is_valid()
    }

    /// 结构桶 `bucket` 中的缓冲区，从 LRU 到 MRU
    pub fn lru_order(&self, bucket: usize) -> Vec<BufId> {
        let order = self.buckets[bucket].lock(&self.platform).lru_order();
        order.into_iter().map(|i| self.id_of(bucket, i)).collect()
    }
}

/// 持有内容锁的缓冲区
///
/// drop 时放开内容锁并减少引用计数。
pub struct Buf<'a, P: Platform, D: BlockDevice> {
    cache: &'a BufCache<P, D>,
    id: BufId,
    dev: u32,
    blockno: u32,
    guard: ManuallyDrop<SleepLockGuard<'a, Box<[u8]>>>,
}

impl<P: Platform, D: BlockDevice> Buf<'_, P, D> {
    pub fn id(&self) -> BufId {
        self.id
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

impl<P: Platform, D: BlockDevice> Drop for Buf<'_, P, D> {
    fn drop(&mut self) {
        // 先放开内容锁，再拿桶锁
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cache.unref(self.id);
    }
}
