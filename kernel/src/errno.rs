//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 错误代码
//!
//! 资源核心只向外报告块设备传输失败，其余错误（资源耗尽、接口误用）
//! 都直接 panic。数值与 include/uapi/asm-generic/errno.h 一致。

use core::fmt;

/// 块设备协作方可能返回的错误代码
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// I/O error (EIO, 5)
    IOError = 5,

    /// No such device or address (ENXIO, 6)
    NoSuchDeviceOrAddress = 6,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,
}

impl Errno {
    /// 获取错误代码的正数值（用于比较）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 错误名称
    pub const fn name(self) -> &'static str {
        match self {
            Errno::IOError => "EIO",
            Errno::NoSuchDeviceOrAddress => "ENXIO",
            Errno::InvalidArgument => "EINVAL",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}
