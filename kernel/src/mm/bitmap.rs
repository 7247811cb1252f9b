//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 字节数组上的位操作
//!
//! 伙伴分配器的分配位图和分裂位图都是裸字节数组（从被管理内存的头部切出来），
//! 第 `index` 位在 `array[index / 8]` 的第 `index % 8` 位。

use core::ops::Range;

#[inline]
fn locate(index: usize) -> (usize, u8) {
    (index / 8, 1 << (index % 8))
}

/// 第 `index` 位是否为 1
#[inline]
pub fn bit_isset(array: &[u8], index: usize) -> bool {
    let (byte, mask) = locate(index);
    array[byte] & mask == mask
}

/// 第 `index` 位置 1
#[inline]
pub fn bit_set(array: &mut [u8], index: usize) {
    let (byte, mask) = locate(index);
    array[byte] |= mask;
}

/// 第 `index` 位清 0
#[inline]
pub fn bit_clear(array: &mut [u8], index: usize) {
    let (byte, mask) = locate(index);
    array[byte] &= !mask;
}

/// 存放 `nbits` 位需要的字节数
#[inline]
pub const fn bytes_for(nbits: usize) -> usize {
    nbits.div_ceil(8)
}

/// 前 `len` 位中连续为 1 的区间
pub fn set_ranges(array: &[u8], len: usize) -> SetRanges<'_> {
    SetRanges {
        array,
        len,
        pos: 0,
    }
}

pub struct SetRanges<'a> {
    array: &'a [u8],
    len: usize,
    pos: usize,
}

impl Iterator for SetRanges<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        while self.pos < self.len && !bit_isset(self.array, self.pos) {
            self.pos += 1;
        }
        if self.pos >= self.len {
            return None;
        }
        let start = self.pos;
        while self.pos < self.len && bit_isset(self.array, self.pos) {
            self.pos += 1;
        }
        Some(start..self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn set_and_clear() {
        let mut bits = [0u8; 2];
        bit_set(&mut bits, 0);
        bit_set(&mut bits, 9);
        assert!(bit_isset(&bits, 0));
        assert!(bit_isset(&bits, 9));
        assert!(!bit_isset(&bits, 8));
        assert_eq!(bits, [0b0000_0001, 0b0000_0010]);

        bit_clear(&mut bits, 0);
        assert!(!bit_isset(&bits, 0));

        bit_clear(&mut bits, 0);
        assert_eq!(bits, [0, 0b0000_0010], "clearing a clear bit is a no-op");
    }

    #[test]
    fn ranges_of_set_bits() {
        let mut bits = [0u8; 2];
        for i in [1, 2, 3, 7, 8, 15] {
            bit_set(&mut bits, i);
        }
        let ranges: Vec<_> = set_ranges(&bits, 16).collect();
        assert_eq!(ranges, [1..4, 7..9, 15..16]);

        // len 截断
        let ranges: Vec<_> = set_ranges(&bits, 8).collect();
        assert_eq!(ranges, [1..4, 7..8]);
    }

    #[test]
    fn byte_count() {
        assert_eq!(bytes_for(0), 0);
        assert_eq!(bytes_for(1), 1);
        assert_eq!(bytes_for(8), 1);
        assert_eq!(bytes_for(9), 2);
    }
}
