//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Buddy System (伙伴系统) 内存分配器
//!
//! 管理任意区间 `[base, end)`，最小块为 `LEAF_SIZE`，第 k 级块大小为 `LEAF_SIZE << k`。
//!
//! 每个大小等级 k 维护：
//! - 一条空闲块链表（侵入式，节点写在空闲块里）
//! - 分配位图：每块 1 位，块"正在使用"（已分配、已分裂或被保留）时为 1
//! - 分裂位图（k > 0）：每块 1 位，块已被拆成两个 k-1 级块时为 1
//!
//! 一对伙伴的状态 [`PairState`] 由两个成员的分配位直接得出。每次分配/释放恰好改变
//! 一个成员的分配位，所以"恰好一个成员在用"这一奇偶性每次翻转一次。
//!
//! 元数据（等级表和位图）从被管理区间的头部切出来，随后把这段前缀和区间末尾
//! 凑不满 2 的幂的部分标记为已使用；空闲链表只需检查每一级靠近可用区间两端的
//! 两对伙伴即可建立。
//!
//! 一把全局锁串行化所有操作：分裂/合并同时修改相邻两级，分级加锁得不偿失。
//! 持锁期间不打日志也不分配内存：作为全局分配器时，日志后端可能回头调用本分配器。

use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::{align_of, size_of};
use core::ptr;
use core::slice;

use super::bitmap::{bit_clear, bit_isset, bit_set, bytes_for, set_ranges};
use super::page::{round_down, round_up};
use crate::arch::Platform;
use crate::config::LEAF_SIZE;
use crate::list::ListHead;
use crate::sync::SpinLock;

/// 一对伙伴块的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// 两块都空闲（或都已并入上一级）
    BothFree,
    /// 低地址块在用，高地址块空闲
    LeftUsed,
    /// 高地址块在用，低地址块空闲
    RightUsed,
    /// 两块都在用
    BothUsed,
}

impl PairState {
    fn from_bits(left: bool, right: bool) -> Self {
        match (left, right) {
            (false, false) => PairState::BothFree,
            (true, false) => PairState::LeftUsed,
            (false, true) => PairState::RightUsed,
            (true, true) => PairState::BothUsed,
        }
    }

    /// 恰好一个成员在用
    pub fn parity(self) -> bool {
        matches!(self, PairState::LeftUsed | PairState::RightUsed)
    }
}

/// 一个大小等级的元数据
#[repr(C)]
struct SizeClass {
    free: ListHead,
    alloc: *mut u8,
    /// k = 0 时为空指针
    split: *mut u8,
}

struct BuddyInner {
    /// 对齐到 `LEAF_SIZE` 的起始地址
    base: usize,
    /// 等级数，最大等级为 `nsizes - 1`
    nsizes: usize,
    classes: *mut SizeClass,
    /// 可分配区间 `[left, right)`，之外是元数据或末尾不可用区
    left: usize,
    right: usize,
    meta: usize,
    unavailable: usize,
    free_bytes: usize,
}

// 裸指针只指向分配器独占的元数据区，所有访问都在全局锁内
unsafe impl Send for BuddyInner {}

#[inline]
const fn blk_size(k: usize) -> usize {
    LEAF_SIZE << k
}

/// 满足 `LEAF_SIZE << k >= n` 的最小 k
fn firstk(n: usize) -> usize {
    let mut k = 0;
    let mut size = LEAF_SIZE;
    while size < n {
        k += 1;
        size *= 2;
    }
    k
}

fn log2(mut n: usize) -> usize {
    let mut k = 0;
    while n > 1 {
        k += 1;
        n >>= 1;
    }
    k
}

/// 管理 `len` 字节需要的等级数（向上取整到 2 的幂）
fn nsizes_for(len: usize) -> usize {
    let mut nsizes = log2(len / LEAF_SIZE) + 1;
    if len > blk_size(nsizes - 1) {
        nsizes += 1;
    }
    nsizes
}

/// 第 k 级的块数
#[inline]
fn nblk(nsizes: usize, k: usize) -> usize {
    1 << (nsizes - 1 - k)
}

/// `nsizes` 个等级的元数据字节数（含对齐）
fn metadata_size(nsizes: usize) -> usize {
    let mut sz = size_of::<SizeClass>() * nsizes;
    for k in 0..nsizes {
        sz += bytes_for(nblk(nsizes, k));
        if k > 0 {
            sz += bytes_for(nblk(nsizes, k));
        }
    }
    round_up(sz, LEAF_SIZE)
}

impl BuddyInner {
    const fn empty() -> Self {
        Self {
            base: 0,
            nsizes: 0,
            classes: ptr::null_mut(),
            left: 0,
            right: 0,
            meta: 0,
            unavailable: 0,
            free_bytes: 0,
        }
    }

    fn initialized(&self) -> bool {
        !self.classes.is_null()
    }

    fn max_size(&self) -> usize {
        self.nsizes - 1
    }

    fn heap_size(&self) -> usize {
        blk_size(self.max_size())
    }

    fn nblk(&self, k: usize) -> usize {
        nblk(self.nsizes, k)
    }

    /// 地址 p 在第 k 级的块下标
    fn blk_index(&self, k: usize, p: usize) -> usize {
        (p - self.base) / blk_size(k)
    }

    /// 第 k 级中第一个不含 p 之前内容的块下标（向上取整）
    fn blk_index_next(&self, k: usize, p: usize) -> usize {
        (p - self.base).div_ceil(blk_size(k))
    }

    fn addr(&self, k: usize, bi: usize) -> usize {
        self.base + bi * blk_size(k)
    }

    fn class(&self, k: usize) -> *mut SizeClass {
        assert!(k < self.nsizes);
        unsafe { self.classes.add(k) }
    }

    fn free_head(&self, k: usize) -> *mut ListHead {
        unsafe { ptr::addr_of_mut!((*self.class(k)).free) }
    }

    fn alloc_bits(&self, k: usize) -> &[u8] {
        unsafe { slice::from_raw_parts((*self.class(k)).alloc, bytes_for(self.nblk(k))) }
    }

    fn alloc_bits_mut(&mut self, k: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut((*self.class(k)).alloc, bytes_for(self.nblk(k))) }
    }

    fn split_bits(&self, k: usize) -> &[u8] {
        assert!(k > 0);
        unsafe { slice::from_raw_parts((*self.class(k)).split, bytes_for(self.nblk(k))) }
    }

    fn split_bits_mut(&mut self, k: usize) -> &mut [u8] {
        assert!(k > 0);
        unsafe { slice::from_raw_parts_mut((*self.class(k)).split, bytes_for(self.nblk(k))) }
    }

    fn is_used(&self, k: usize, bi: usize) -> bool {
        bit_isset(self.alloc_bits(k), bi)
    }

    fn set_used(&mut self, k: usize, bi: usize) {
        bit_set(self.alloc_bits_mut(k), bi);
    }

    fn clear_used(&mut self, k: usize, bi: usize) {
        bit_clear(self.alloc_bits_mut(k), bi);
    }

    fn is_split(&self, k: usize, bi: usize) -> bool {
        bit_isset(self.split_bits(k), bi)
    }

    fn set_split(&mut self, k: usize, bi: usize) {
        bit_set(self.split_bits_mut(k), bi);
    }

    fn clear_split(&mut self, k: usize, bi: usize) {
        bit_clear(self.split_bits_mut(k), bi);
    }

    fn check_initialized(&self, op: &str) {
        if !self.initialized() {
            panic!("{}: allocator not initialized", op);
        }
    }

    fn pair_state(&self, k: usize, pair: usize) -> PairState {
        PairState::from_bits(self.is_used(k, 2 * pair), self.is_used(k, 2 * pair + 1))
    }

    fn push(&mut self, k: usize, p: usize) {
        unsafe { ListHead::push(self.free_head(k), p as *mut u8) }
    }

    fn pop(&mut self, k: usize) -> Option<usize> {
        unsafe { ListHead::pop(self.free_head(k)).map(|p| p as usize) }
    }

    fn remove(&mut self, p: usize) {
        unsafe { ListHead::remove(p as *mut u8) }
    }

    fn list_empty(&self, k: usize) -> bool {
        unsafe { (*self.free_head(k)).is_empty() }
    }

    fn list_len(&self, k: usize) -> usize {
        unsafe { ListHead::len(self.free_head(k)) }
    }

    /// 在地址 `at` 处布置等级表和位图，返回元数据末尾（对齐到 `LEAF_SIZE`）
    ///
    /// # Safety
    /// `[at, at + metadata_size(nsizes))` 必须可写且归分配器所有
    unsafe fn layout_metadata(&mut self, at: usize) -> usize {
        assert_eq!(at % align_of::<SizeClass>(), 0, "bd_init: metadata misaligned");
        self.classes = at as *mut SizeClass;
        let mut p = at + size_of::<SizeClass>() * self.nsizes;

        for k in 0..self.nsizes {
            let class = self.classes.add(k);
            class.write(SizeClass {
                free: ListHead::new(),
                alloc: ptr::null_mut(),
                split: ptr::null_mut(),
            });
            (*class).free.init();

            let sz = bytes_for(self.nblk(k));
            (*class).alloc = p as *mut u8;
            ptr::write_bytes(p as *mut u8, 0, sz);
            p += sz;
        }

        // 最小等级不会再分裂，不需要分裂位图
        for k in 1..self.nsizes {
            let sz = bytes_for(self.nblk(k));
            (*self.classes.add(k)).split = p as *mut u8;
            ptr::write_bytes(p as *mut u8, 0, sz);
            p += sz;
        }

        round_up(p, LEAF_SIZE)
    }

    /// 把 `[start, stop)` 在每一级都标记为在用（k > 0 时同时标记为已分裂）
    fn mark(&mut self, start: usize, stop: usize) {
        if (start - self.base) % LEAF_SIZE != 0 || (stop - self.base) % LEAF_SIZE != 0 {
            panic!("bd_mark: [{:#x}, {:#x}) not leaf aligned", start, stop);
        }

        for k in 0..self.nsizes {
            let bi = self.blk_index(k, start);
            let bj = self.blk_index_next(k, stop);
            for b in bi..bj {
                self.set_used(k, b);
                if k > 0 {
                    self.set_split(k, b);
                }
            }
        }
    }

    /// 伙伴对中恰好一块在用时，把空闲的那块放入第 k 级空闲链表
    fn initfree_pair(&mut self, k: usize, bi: usize) -> usize {
        let buddy = bi ^ 1;
        let pair = self.pair_state(k, bi >> 1);
        if !pair.parity() {
            return 0;
        }
        let free = if self.is_used(k, bi) { buddy } else { bi };
        self.push(k, self.addr(k, free));
        blk_size(k)
    }

    /// 建立空闲链表：每一级只有包含 `left` 与 `right` 边界的两对伙伴可能一半空闲
    fn initfree(&mut self, left: usize, right: usize) -> usize {
        let mut free = 0;

        for k in 0..self.max_size() {
            let l = self.blk_index_next(k, left);
            let r = self.blk_index(k, right);
            if l < self.nblk(k) {
                free += self.initfree_pair(k, l);
            }
            // 两个边界落在同一对伙伴里时只处理一次
            if r <= l || r >> 1 == l >> 1 || r >= self.nblk(k) {
                continue;
            }
            free += self.initfree_pair(k, r);
        }

        // 没有任何保留区时整个堆就是一个最大块
        let top = self.max_size();
        if !self.is_used(top, 0) {
            self.push(top, self.base);
            free += self.heap_size();
        }
        free
    }

    /// 标记末尾不可用区并建立空闲链表
    ///
    /// `usable` 为元数据之后的第一个可用地址，`end` 为调用者给出的区间末尾。
    fn finish_init(&mut self, usable: usize, end: usize) {
        let bd_end = self.base + round_down(end - self.base, LEAF_SIZE);
        let heap_end = self.base + self.heap_size();
        self.unavailable = heap_end - bd_end;
        if bd_end < heap_end {
            self.mark(bd_end, heap_end);
        }

        self.left = usable;
        self.right = bd_end;
        let free = self.initfree(usable, bd_end);
        let expected = self.heap_size() - self.meta - self.unavailable;
        if free != expected {
            log::error!("bd_init: free {} expected {}", free, expected);
            panic!("bd_init: free mem");
        }
        self.free_bytes = free;
    }

    /// 地址 p 所在块的等级：第一个"父块已分裂"的等级
    fn size(&self, p: usize) -> usize {
        for k in 0..self.max_size() {
            if self.is_split(k + 1, self.blk_index(k + 1, p)) {
                return k;
            }
        }
        self.max_size()
    }

    fn alloc(&mut self, nbytes: usize) -> Option<usize> {
        if !self.initialized() || nbytes > self.heap_size() {
            return None;
        }

        // 从能容纳 nbytes 的最小等级开始向上找空闲块
        let fk = firstk(nbytes);
        let mut k = (fk..self.nsizes).find(|&k| !self.list_empty(k))?;

        let p = self.pop(k)?;
        let bi = self.blk_index(k, p);
        self.set_used(k, bi);

        // 逐级分裂：低半块继续向下，高半块放入下一级空闲链表
        while k > fk {
            let bi = self.blk_index(k, p);
            self.set_split(k, bi);
            let q = p + blk_size(k - 1);
            let lo = self.blk_index(k - 1, p);
            self.set_used(k - 1, lo);
            self.push(k - 1, q);
            k -= 1;
        }

        self.free_bytes -= blk_size(fk);
        Some(p)
    }

    fn free(&mut self, mut p: usize) {
        self.check_initialized("bd_free");
        if p < self.left || p >= self.right || (p - self.base) % LEAF_SIZE != 0 {
            log::error!(
                "bd_free: {:#x} outside [{:#x}, {:#x}) or misaligned",
                p,
                self.left,
                self.right
            );
            panic!("bd_free: bad address {:#x}", p);
        }

        let mut k = self.size(p);
        let bi = self.blk_index(k, p);
        let is_block = self.addr(k, bi) == p;
        if !is_block || !self.is_used(k, bi) || (k > 0 && self.is_split(k, bi)) {
            log::error!("bd_free: {:#x} is not an allocated block (size {})", p, k);
            panic!("bd_free: {:#x} is not allocated", p);
        }
        self.free_bytes += blk_size(k);

        loop {
            let bi = self.blk_index(k, p);
            self.clear_used(k, bi);
            if k == self.max_size() {
                break;
            }
            let buddy = bi ^ 1;
            if self.is_used(k, buddy) {
                break;
            }

            // 伙伴空闲：从链表摘下并合并，p 取两者中的低地址
            let q = self.addr(k, buddy);
            self.remove(q);
            if buddy % 2 == 0 {
                p = q;
            }
            let parent = self.blk_index(k + 1, p);
            self.clear_split(k + 1, parent);
            k += 1;
        }

        self.push(k, p);
    }
}

/// 伙伴分配器统计
#[derive(Debug, Clone, Default)]
pub struct BuddyStats {
    /// 向上取整到 2 的幂后的堆大小
    pub heap_size: usize,
    /// 元数据占用（在堆内切出时计入）
    pub meta_bytes: usize,
    /// 末尾不可用字节
    pub unavailable_bytes: usize,
    /// 空闲字节
    pub free_bytes: usize,
    /// 每一级空闲链表长度
    pub free_blocks: Vec<usize>,
}

/// 伙伴分配器
///
/// 创建后需调用 [`BuddyAllocator::init`] 或 [`BuddyAllocator::init_with_metadata`]。
/// 也可作为全局分配器：
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: BuddyAllocator<Uniprocessor> = BuddyAllocator::new(Uniprocessor::new());
/// ```
pub struct BuddyAllocator<P: Platform> {
    platform: P,
    inner: SpinLock<BuddyInner>,
}

impl<P: Platform> BuddyAllocator<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            inner: SpinLock::new(BuddyInner::empty(), "buddy"),
        }
    }

    /// 管理 `[base, end)`，元数据从区间头部切出
    ///
    /// # Safety
    /// 该区间必须可读写，且此后只由本分配器管理。只能初始化一次。
    pub unsafe fn init(&self, base: usize, end: usize) {
        let mut bd = self.inner.lock(&self.platform);
        assert!(!bd.initialized(), "bd_init: already initialized");

        let p = round_up(base, LEAF_SIZE);
        assert!(end > p, "bd_init: empty range [{:#x}, {:#x})", base, end);
        bd.base = p;
        bd.nsizes = nsizes_for(end - p);

        if p + metadata_size(bd.nsizes) + LEAF_SIZE > end {
            panic!("bd_init: range [{:#x}, {:#x}) too small for metadata", base, end);
        }
        let usable = bd.layout_metadata(p);
        bd.meta = usable - p;
        bd.mark(p, usable);
        bd.finish_init(usable, end);

        let (nsizes, meta, heap, unavailable) = (bd.nsizes, bd.meta, bd.heap_size(), bd.unavailable);
        drop(bd);

        log::info!(
            "bd: memory sz is {} bytes; allocate an size array of length {}",
            end - p,
            nsizes
        );
        log::info!("bd: {} meta bytes for managing {} bytes of memory", meta, heap);
        log::info!("bd: {:#x} bytes unavailable", unavailable);
    }

    /// 管理 `[base, end)`，元数据放在单独的 `[meta_base, meta_end)` 中
    ///
    /// # Safety
    /// 两个区间都必须可读写、互不重叠，且此后只由本分配器使用。只能初始化一次。
    pub unsafe fn init_with_metadata(&self, meta_base: usize, meta_end: usize, base: usize, end: usize) {
        let mut bd = self.inner.lock(&self.platform);
        assert!(!bd.initialized(), "bd_init: already initialized");

        let p = round_up(base, LEAF_SIZE);
        assert!(end > p, "bd_init: empty range [{:#x}, {:#x})", base, end);
        bd.base = p;
        bd.nsizes = nsizes_for(end - p);

        let at = round_up(meta_base, align_of::<SizeClass>());
        let need = metadata_size(bd.nsizes);
        if at + need > meta_end {
            panic!(
                "bd_init: metadata needs {} bytes, [{:#x}, {:#x}) too small",
                need, meta_base, meta_end
            );
        }
        bd.layout_metadata(at);
        bd.meta = 0;
        bd.finish_init(p, end);

        let (nsizes, heap, unavailable) = (bd.nsizes, bd.heap_size(), bd.unavailable);
        drop(bd);

        log::info!(
            "bd: managing {} bytes with {} size classes, {} meta bytes kept outside",
            heap,
            nsizes,
            need
        );
        log::info!("bd: {:#x} bytes unavailable", unavailable);
    }

    /// 分配至少 `nbytes` 字节，返回块地址；没有足够大的空闲块时返回 `None`
    pub fn alloc(&self, nbytes: usize) -> Option<usize> {
        let (p, initialized) = {
            let mut bd = self.inner.lock(&self.platform);
            (bd.alloc(nbytes), bd.initialized())
        };
        if p.is_none() && initialized {
            log::warn!("bd_malloc: no free block for {} bytes", nbytes);
        }
        #[cfg(feature = "debug_log")]
        log::trace!("bd_malloc: {} -> {:?}", nbytes, p);
        p
    }

    /// 释放 `alloc` 返回的块
    ///
    /// 堆外、未对齐或当前未分配的地址是致命错误。
    pub fn free(&self, p: usize) {
        self.inner.lock(&self.platform).free(p);
        #[cfg(feature = "debug_log")]
        log::trace!("bd_free: {:#x}", p);
    }

    /// 已分配块 `p` 的大小
    ///
    /// `p` 必须落在可分配区间内。
    pub fn block_size(&self, p: usize) -> usize {
        let bd = self.inner.lock(&self.platform);
        bd.check_initialized("bd_size");
        if p < bd.left || p >= bd.right {
            panic!("bd_size: {:#x} outside [{:#x}, {:#x})", p, bd.left, bd.right);
        }
        blk_size(bd.size(p))
    }

    /// 第 k 级第 `pair` 对伙伴的状态
    pub fn pair_state(&self, k: usize, pair: usize) -> PairState {
        let bd = self.inner.lock(&self.platform);
        bd.check_initialized("bd_pair_state");
        // 最大等级只有一块，没有伙伴
        if k >= bd.max_size() || pair >= bd.nblk(k) / 2 {
            panic!("bd_pair_state: no pair {} at size {}", pair, k);
        }
        bd.pair_state(k, pair)
    }

    /// 等级数（最大等级为 `nsizes() - 1`），未初始化时为 0
    pub fn nsizes(&self) -> usize {
        self.inner.lock(&self.platform).nsizes
    }

    /// 对齐后的堆起始地址
    pub fn base(&self) -> usize {
        self.inner.lock(&self.platform).base
    }

    /// 第 k 级空闲链表长度
    pub fn free_list_len(&self, k: usize) -> usize {
        let bd = self.inner.lock(&self.platform);
        bd.check_initialized("bd_free_list_len");
        if k >= bd.nsizes {
            panic!("bd_free_list_len: no size {}", k);
        }
        bd.list_len(k)
    }

    pub fn stats(&self) -> BuddyStats {
        // 链表长度先抄到栈上，放锁之后再建 Vec
        let mut lens = [0usize; usize::BITS as usize];
        let mut stats = BuddyStats::default();
        let nsizes = {
            let bd = self.inner.lock(&self.platform);
            if !bd.initialized() {
                return stats;
            }
            stats.heap_size = bd.heap_size();
            stats.meta_bytes = bd.meta;
            stats.unavailable_bytes = bd.unavailable;
            stats.free_bytes = bd.free_bytes;
            for (k, len) in lens.iter_mut().enumerate().take(bd.nsizes) {
                *len = bd.list_len(k);
            }
            bd.nsizes
        };
        stats.free_blocks = lens[..nsizes].to_vec();
        stats
    }

    /// 以 debug 级别打印每一级的空闲链表长度和位图中连续为 1 的区间
    ///
    /// 每行单独取一次锁，并发修改时各行之间不保证一致。
    pub fn dump(&self) {
        for k in 0..self.nsizes() {
            let (nblk, free) = {
                let bd = self.inner.lock(&self.platform);
                (bd.nblk(k), bd.list_len(k))
            };
            log::debug!(
                "size {} (blksz {} nblk {}): free list: {}",
                k,
                blk_size(k),
                nblk,
                free
            );
            self.dump_bits(k, false);
            if k > 0 {
                self.dump_bits(k, true);
            }
        }
    }

    fn dump_bits(&self, k: usize, split: bool) {
        let which = if split { "split" } else { "alloc" };
        let mut pos = 0;
        loop {
            let range = {
                let bd = self.inner.lock(&self.platform);
                let bits = if split { bd.split_bits(k) } else { bd.alloc_bits(k) };
                let next = set_ranges(bits, bd.nblk(k)).find(|r| r.start >= pos);
                next
            };
            match range {
                Some(r) => {
                    log::debug!("  {}: [{}, {})", which, r.start, r.end);
                    pos = r.end;
                }
                None => break,
            }
        }
    }
}

unsafe impl<P: Platform> GlobalAlloc for BuddyAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // 块只相对堆基址按自身大小对齐，绝对对齐不足时放弃
        let size = layout.size().max(layout.align());
        match BuddyAllocator::alloc(self, size) {
            Some(p) if p % layout.align() == 0 => p as *mut u8,
            Some(p) => {
                self.free(p);
                ptr::null_mut()
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr as usize);
    }
}
