//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 侵入式双向循环链表
//!
//! 参考 Linux: include/linux/list.h
//!
//! 用途：
//! - 伙伴分配器每个大小等级的空闲块链表：链表节点就写在空闲块自己的前 16 字节里，
//!   块被分配出去后节点随之失效，不需要额外元数据。
//!
//! 设计特点：
//! - 表头是哨兵节点，空表时 next/prev 指向自己
//! - 插入/删除 O(1)，删除任意已知节点不需要遍历

use core::ptr;

#[repr(C)]
pub struct ListHead {
    /// 下一个节点
    pub next: *mut ListHead,
    /// 前一个节点
    pub prev: *mut ListHead,
}

impl ListHead {
    /// 创建一个未初始化的链表节点
    ///
    /// 表头放到最终地址后必须调用 [`ListHead::init`]
    pub const fn new() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    /// 初始化链表节点，使节点指向自己，形成一个空链表
    pub fn init(&mut self) {
        self.next = self;
        self.prev = self;
    }

    /// 检查链表是否为空
    pub fn is_empty(&self) -> bool {
        ptr::eq(self.next, self)
    }

    /// 在 `head` 之后插入当前节点
    ///
    /// # Safety
    /// `head` 必须是已初始化链表中的有效节点
    pub unsafe fn add(&mut self, head: *mut ListHead) {
        let next = (*head).next;

        self.next = next;
        self.prev = head;
        (*head).next = self;
        (*next).prev = self;
    }

    /// 从链表中删除当前节点
    ///
    /// # Safety
    /// 调用者必须确保节点在链表中
    pub unsafe fn del(&mut self) {
        let next = self.next;
        let prev = self.prev;

        (*next).prev = prev;
        (*prev).next = next;

        self.next = self as *mut _;
        self.prev = self as *mut _;
    }

    /// 把地址 `p` 处的内存当作节点压入链表头部
    ///
    /// # Safety
    /// `p` 必须指向至少 `size_of::<ListHead>()` 字节、按指针对齐、归调用者所有的内存
    pub unsafe fn push(head: *mut ListHead, p: *mut u8) {
        let node = p as *mut ListHead;
        node.write(ListHead::new());
        (*node).add(head);
    }

    /// 弹出链表头部节点，返回其地址
    ///
    /// # Safety
    /// `head` 必须是已初始化的链表头
    pub unsafe fn pop(head: *mut ListHead) -> Option<*mut u8> {
        if (*head).is_empty() {
            return None;
        }
        let node = (*head).next;
        (*node).del();
        Some(node as *mut u8)
    }

    /// 删除地址 `p` 处的节点
    ///
    /// # Safety
    /// `p` 必须是某个链表中的节点
    pub unsafe fn remove(p: *mut u8) {
        (*(p as *mut ListHead)).del();
    }

    /// 遍历链表，对每个节点地址调用 `f`
    ///
    /// # Safety
    /// `head` 必须有效，且遍历期间不得修改链表
    pub unsafe fn for_each<F>(head: *const ListHead, mut f: F)
    where
        F: FnMut(*mut u8),
    {
        let mut pos = (*head).next;
        while !ptr::eq(pos, head) {
            let next = (*pos).next;
            f(pos as *mut u8);
            pos = next;
        }
    }

    /// 节点个数（需要遍历）
    ///
    /// # Safety
    /// 同 [`ListHead::for_each`]
    pub unsafe fn len(head: *const ListHead) -> usize {
        let mut n = 0;
        Self::for_each(head, |_| n += 1);
        n
    }
}
