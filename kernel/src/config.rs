//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内核配置
//!
//! 常量由 build.rs 根据 Kernel.toml 生成到 OUT_DIR

include!(concat!(env!("OUT_DIR"), "/config.rs"));
