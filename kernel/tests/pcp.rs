//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

// 测试：每 CPU 页分配器

mod common;

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use common::{bind_cpu, intr_depth, Arena, HostPlatform};
use kcore::config::{JUNK_ON_ALLOC, JUNK_ON_FREE, PAGE_SIZE};
use kcore::{PageAllocator, PhysAddr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn allocator<'a>(platform: &'a HostPlatform, arena: &Arena) -> PageAllocator<&'a HostPlatform> {
    bind_cpu(0);
    unsafe {
        PageAllocator::new(
            platform,
            PhysAddr::new(arena.start()),
            PhysAddr::new(arena.end()),
        )
    }
}

fn page_filled_with(pa: PhysAddr, byte: u8) -> bool {
    let page = unsafe { std::slice::from_raw_parts(pa.as_usize() as *const u8, PAGE_SIZE) };
    page.iter().all(|&b| b == byte)
}

#[test]
fn init_seeds_calling_cpu() {
    let platform = HostPlatform::new(4);
    let arena = Arena::new(16 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    let stats = kmem.stats();
    assert_eq!(stats.ncpu, 4);
    assert_eq!(stats.free[0], 16, "all pages start on the booting cpu");
    assert_eq!(stats.free[1..4], [0, 0, 0]);
    assert_eq!(kmem.total_pages(), 16);
    assert_eq!(intr_depth(), 0, "interrupts restored after init");
}

#[test]
fn junk_patterns() {
    let platform = HostPlatform::new(1);
    let arena = Arena::new(4 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    let pa = kmem.alloc_page().expect("page");
    assert!(page_filled_with(pa, JUNK_ON_ALLOC), "fresh page carries alloc junk");

    unsafe { std::ptr::write_bytes(pa.as_mut_ptr(), 0x42, PAGE_SIZE) };
    kmem.free_page(pa);
    assert!(page_filled_with(pa, JUNK_ON_FREE), "freed page carries free junk");
}

#[test]
fn steal_from_remote_cpu() {
    let platform = HostPlatform::new(2);
    let arena = Arena::new(4 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    // cpu 1 的链表为空，只能从 cpu 0 窃取
    bind_cpu(1);
    let pa = kmem.alloc_page().expect("steal");
    let stats = kmem.stats();
    assert_eq!(stats.steals, 1);
    assert_eq!(stats.free[0], 3);
    assert_eq!(stats.free[1], 0);

    // 释放进入释放者的链表
    kmem.free_page(pa);
    let stats = kmem.stats();
    assert_eq!(stats.free[0], 3);
    assert_eq!(stats.free[1], 1);
    assert_eq!(kmem.free_list(1), [pa]);
}

#[test]
fn steal_picks_longest_list() {
    let platform = HostPlatform::new(4);
    let arena = Arena::new(10 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    let pages: Vec<_> = (0..10).map(|_| kmem.alloc_page().expect("page")).collect();
    assert_eq!(kmem.free_pages(), 0);

    bind_cpu(2);
    for &pa in &pages[..3] {
        kmem.free_page(pa);
    }
    bind_cpu(3);
    for &pa in &pages[3..] {
        kmem.free_page(pa);
    }

    bind_cpu(1);
    kmem.alloc_page().expect("steal");
    let stats = kmem.stats();
    assert_eq!(stats.free[2], 3, "shorter list untouched");
    assert_eq!(stats.free[3], 6, "victim is the longest list");
}

#[test]
fn exhaustion_across_cpus() {
    let platform = HostPlatform::new(2);
    let arena = Arena::new(3 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    bind_cpu(1);
    let mut got = Vec::new();
    while let Some(pa) = kmem.alloc_page() {
        got.push(pa);
    }
    assert_eq!(got.len(), 3);
    assert_eq!(kmem.alloc_page(), None);

    bind_cpu(0);
    assert_eq!(kmem.alloc_page(), None);
}

#[test]
fn parallel_alloc_no_duplicates() {
    const NCPU: usize = 4;
    const PER_CPU: usize = 16;

    let platform = HostPlatform::new(NCPU);
    let arena = Arena::new(NCPU * PER_CPU * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);
    let barrier = Barrier::new(NCPU);

    let per_cpu: Vec<Vec<PhysAddr>> = thread::scope(|s| {
        let handles: Vec<_> = (0..NCPU)
            .map(|cpu| {
                let kmem = &kmem;
                let barrier = &barrier;
                s.spawn(move || {
                    bind_cpu(cpu);
                    barrier.wait();
                    let mut mine = Vec::new();
                    for _ in 0..PER_CPU {
                        let pa = kmem.alloc_page().expect("enough pages for everyone");
                        // 每页写上自己的标记，之后检查没有被别人踩
                        unsafe { std::ptr::write_bytes(pa.as_mut_ptr(), cpu as u8 + 0x10, PAGE_SIZE) };
                        mine.push(pa);
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for (cpu, pages) in per_cpu.iter().enumerate() {
        for &pa in pages {
            assert!(seen.insert(pa), "{:?} handed out twice", pa);
            assert!(page_filled_with(pa, cpu as u8 + 0x10), "{:?} was overwritten", pa);
        }
    }
    assert_eq!(seen.len(), NCPU * PER_CPU);
    assert_eq!(kmem.free_pages(), 0);

    // 每个 CPU 释放自己拿到的页：空闲页漂移到释放者
    thread::scope(|s| {
        for (cpu, pages) in per_cpu.iter().enumerate() {
            let kmem = &kmem;
            s.spawn(move || {
                bind_cpu(cpu);
                for &pa in pages {
                    kmem.free_page(pa);
                }
            });
        }
    });

    let stats = kmem.stats();
    assert_eq!(stats.free[..NCPU], [PER_CPU; NCPU]);
    assert_eq!(stats.total_free(), NCPU * PER_CPU);
}

#[test]
fn parallel_churn_conserves_pages() {
    const NCPU: usize = 4;
    const PAGES: usize = 32;

    let platform = HostPlatform::new(NCPU);
    let arena = Arena::new(PAGES * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);

    thread::scope(|s| {
        for cpu in 0..NCPU {
            let kmem = &kmem;
            s.spawn(move || {
                bind_cpu(cpu);
                let mut rng = StdRng::seed_from_u64(cpu as u64);
                let mut held = Vec::new();
                for _ in 0..2000 {
                    if held.is_empty() || (held.len() < 12 && rng.gen_bool(0.5)) {
                        // 其他 CPU 可能暂时拿走了所有页
                        if let Some(pa) = kmem.alloc_page() {
                            held.push(pa);
                        }
                    } else {
                        let i = rng.gen_range(0..held.len());
                        kmem.free_page(held.swap_remove(i));
                    }
                }
                for pa in held {
                    kmem.free_page(pa);
                }
            });
        }
    });

    assert_eq!(kmem.free_pages(), PAGES, "no page lost or duplicated");
    let all: HashSet<_> = (0..NCPU).flat_map(|cpu| kmem.free_list(cpu)).collect();
    assert_eq!(all.len(), PAGES);
}

#[test]
#[should_panic(expected = "kfree: bad address")]
fn free_out_of_range_is_fatal() {
    let platform = HostPlatform::new(1);
    let arena = Arena::new(2 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);
    kmem.free_page(PhysAddr::new(arena.end()));
}

#[test]
#[should_panic(expected = "kfree: double free")]
fn double_free_on_another_cpu_is_fatal() {
    let platform = HostPlatform::new(2);
    let arena = Arena::new(2 * PAGE_SIZE);
    let kmem = allocator(&platform, &arena);
    let pa = kmem.alloc_page().unwrap();
    kmem.free_page(pa);
    bind_cpu(1);
    kmem.free_page(pa);
}
