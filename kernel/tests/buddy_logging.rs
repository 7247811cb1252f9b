//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

// 测试：日志后端从同一个伙伴分配器分配内存
//
// 全局 logger 每个进程只能装一次，所以单独放一个测试二进制。

mod common;

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use common::Arena;
use kcore::{BuddyAllocator, Uniprocessor};
use log::{LevelFilter, Log, Metadata, Record};

static HEAP: BuddyAllocator<Uniprocessor> = BuddyAllocator::new(Uniprocessor::new());
static LINES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static IN_LOG: Cell<bool> = const { Cell::new(false) };
}

/// 每条记录都先从 `HEAP` 借一块缓冲区，像把 `HEAP` 当全局分配器时的日志后端一样
struct HeapLogger;

impl Log for HeapLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        // 缓冲区分配失败会再打一条 warn
        if IN_LOG.with(|f| f.replace(true)) {
            return;
        }
        if let Some(p) = HEAP.alloc(64 + record.args().to_string().len()) {
            HEAP.free(p);
        }
        LINES.fetch_add(1, Ordering::Relaxed);
        IN_LOG.with(|f| f.set(false));
    }

    fn flush(&self) {}
}

static LOGGER: HeapLogger = HeapLogger;

fn finishes<F: FnOnce() + Send + 'static>(what: &str, f: F) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(()) => {}
        Err(RecvTimeoutError::Timeout) => panic!("{} hung: allocator lock held while logging", what),
        Err(RecvTimeoutError::Disconnected) => panic!("{} panicked", what),
    }
}

#[test]
fn logger_may_allocate_from_the_same_heap() {
    // 可能已被同进程里的其他测试装过
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);

    let arena = Arena::new(64 * 1024);
    let (start, end) = (arena.start(), arena.end());
    // HEAP 是 static，区间在进程结束前都要有效
    std::mem::forget(arena);

    finishes("init", move || unsafe { HEAP.init(start, end) });
    assert!(LINES.load(Ordering::Relaxed) >= 3, "init reports its layout");

    finishes("alloc until exhausted", || {
        let mut held = Vec::new();
        while let Some(p) = HEAP.alloc(1024) {
            held.push(p);
        }
        assert!(!held.is_empty());
        for p in held {
            HEAP.free(p);
        }
    });

    let before = LINES.load(Ordering::Relaxed);
    finishes("dump", || HEAP.dump());
    assert!(LINES.load(Ordering::Relaxed) > before, "dump goes through the logger");

    finishes("stats", || {
        let stats = HEAP.stats();
        assert_eq!(stats.free_blocks.len(), HEAP.nsizes());
        assert_eq!(stats.free_bytes, stats.heap_size - stats.meta_bytes);
    });
}
