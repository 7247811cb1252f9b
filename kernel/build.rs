//! kcore 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml 配置文件（或 menuconfig 生成的 build/.config）
//! 2. 校验内存与缓存几何参数
//! 3. 在 OUT_DIR 中生成 config.rs

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// 解析 build/.config 文件（简单 key=value 格式）
fn parse_dot_config(content: &str) -> toml::Value {
    // 存储各 section 的配置
    let mut sections: HashMap<String, HashMap<String, toml::Value>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // 跳过注释和空行
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // 解析 section_key=value 格式
        if let Some(eq_pos) = line.find('=') {
            let key = &line[..eq_pos];
            let value = line[eq_pos + 1..].trim();

            // 分割 section_key（使用第一个下划线分割）
            if let Some(underscore_pos) = key.find('_') {
                let section = &key[..underscore_pos];
                let config_key = &key[underscore_pos + 1..];

                let parsed_value = if value == "true" {
                    toml::Value::Boolean(true)
                } else if value == "false" {
                    toml::Value::Boolean(false)
                } else if let Ok(int_val) = value.parse::<i64>() {
                    toml::Value::Integer(int_val)
                } else {
                    toml::Value::String(value.to_string())
                };

                sections
                    .entry(section.to_string())
                    .or_default()
                    .insert(config_key.to_string(), parsed_value);
            }
        }
    }

    let mut root_map = toml::map::Map::new();
    for (section_name, section_data) in sections {
        let mut toml_map = toml::map::Map::new();
        for (k, v) in section_data {
            toml_map.insert(k, v);
        }
        root_map.insert(section_name, toml::Value::Table(toml_map));
    }

    toml::Value::Table(root_map)
}

/// 读取 `section.key` 整数配置，缺省时使用 `default`
fn int(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let workspace_dir = manifest_dir.join("..");
    let kernel_toml = workspace_dir.join("Kernel.toml");
    let dot_config = workspace_dir.join("build/.config");

    println!("cargo:rerun-if-changed={}", kernel_toml.display());
    println!("cargo:rerun-if-changed={}", dot_config.display());

    // 优先使用 build/.config，其次 Kernel.toml，都没有时全部取默认值
    let config = if let Ok(content) = fs::read_to_string(&dot_config) {
        println!("cargo:warning=Using build/.config configuration");
        parse_dot_config(&content)
    } else if let Ok(content) = fs::read_to_string(&kernel_toml) {
        toml::from_str(&content).expect("Kernel.toml 解析失败")
    } else {
        println!("cargo:warning=Kernel.toml not found, using built-in defaults");
        toml::Value::Table(toml::map::Map::new())
    };

    generate_config_code(&config);
}

fn generate_config_code(config: &toml::Value) {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let page_size = int(config, "memory", "page_size", 4096);
    let leaf_size = int(config, "memory", "leaf_size", 16);
    let junk_on_free = int(config, "memory", "junk_on_free", 1);
    let junk_on_alloc = int(config, "memory", "junk_on_alloc", 5);
    let max_cpus = int(config, "smp", "max_cpus", 8);
    let nbuf = int(config, "bcache", "nbuf", 30);
    let nbucket = int(config, "bcache", "nbucket", 8);
    let block_size = int(config, "bcache", "block_size", 1024);

    assert!(
        page_size > 0 && (page_size & (page_size - 1)) == 0,
        "memory.page_size 必须是 2 的幂: {}",
        page_size
    );
    assert!(
        leaf_size > 0 && (leaf_size & (leaf_size - 1)) == 0,
        "memory.leaf_size 必须是 2 的幂: {}",
        leaf_size
    );
    // 空闲块内要放下 prev/next 两个指针
    assert!(leaf_size >= 16, "memory.leaf_size 至少为 16: {}", leaf_size);
    assert!(max_cpus >= 1, "smp.max_cpus 至少为 1");
    assert!(nbucket >= 1 && nbuf >= nbucket, "bcache: 需要 nbuf >= nbucket >= 1");
    assert!((0..=255).contains(&junk_on_free) && (0..=255).contains(&junk_on_alloc));

    let config_code = format!(
        r#"// kcore 配置（自动生成，请勿手动修改）

/// 页大小（字节）
pub const PAGE_SIZE: usize = {page_size};

/// 伙伴分配器最小块大小（字节）
pub const LEAF_SIZE: usize = {leaf_size};

/// 释放页时填充的字节
pub const JUNK_ON_FREE: u8 = {junk_on_free};

/// 分配页时填充的字节
pub const JUNK_ON_ALLOC: u8 = {junk_on_alloc};

/// 最大 CPU 数量
pub const MAX_CPUS: usize = {max_cpus};

/// 缓冲区缓存槽数量
pub const NBUF: usize = {nbuf};

/// 缓冲区缓存结构桶数量
pub const NBUCKET: usize = {nbucket};

/// 磁盘块大小（字节）
pub const BSIZE: usize = {block_size};
"#
    );

    let config_file = out_dir.join("config.rs");

    // 只有内容变化时才写入，避免每次编译都更新文件时间戳
    let existing_content = fs::read_to_string(&config_file).unwrap_or_default();
    if existing_content != config_code {
        fs::write(&config_file, &config_code).expect("写入配置文件失败");
    }
}
