//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 物理地址

use core::fmt;

pub use crate::config::PAGE_SIZE;

pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 物理地址
///
/// 不做隐式对齐：`free_page` 需要看到调用者传入的原始地址才能检查对齐。
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    pub const fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    pub const fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// 向上取整到 `align` 的倍数（`align` 为 2 的幂）
pub const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// 向下取整到 `align` 的倍数（`align` 为 2 的幂）
pub const fn round_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_addr_alignment() {
        let addr = PhysAddr::new(PAGE_SIZE);
        assert!(addr.is_aligned());
        assert_eq!(addr.floor(), addr);

        let odd = PhysAddr::new(PAGE_SIZE + 0x234);
        assert!(!odd.is_aligned());
        assert_eq!(odd.as_usize(), PAGE_SIZE + 0x234, "new() must not align");
        assert_eq!(odd.floor().as_usize(), PAGE_SIZE);
        assert_eq!(odd.ceil().as_usize(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(round_up(32, 16), 32);
        assert_eq!(round_down(47, 16), 32);
        assert!(PhysAddr::new(0).is_null());
    }
}
