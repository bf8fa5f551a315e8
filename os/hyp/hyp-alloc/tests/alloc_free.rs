mod common;

use common::*;
use core::alloc::{GlobalAlloc, Layout};
use hyp_alloc::{AllocFailure, HypAllocError, HypAllocator, MemRequest, MemRequestDest, VmMemStat};
use hyp_mm::MapError;
use std::ptr::NonNull;

#[test]
fn payloads_are_aligned_in_range_and_zeroed() {
    let alloc = allocator(64);
    let start = alloc.platform().va_start();
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for round in 0..600 {
        if live.len() > 24 || (!live.is_empty() && rng.next() % 3 == 0) {
            let (ptr, _) = live.swap_remove((rng.next() as usize) % live.len());
            unsafe { alloc.free(ptr) };
        } else {
            let len = 1 + (rng.next() % 700) as usize;
            let ptr = alloc_donating(&alloc, len);
            let addr = ptr.as_ptr() as u64;
            assert_eq!(addr % 8, 0);
            assert!(addr >= start && addr + len as u64 <= start + 64 * PAGE);
            assert!(is_zeroed(ptr, len), "round {round}: alloc({len}) not zeroed");
            // Dirty it so a later reuse has to scrub it.
            unsafe { ptr.as_ptr().write_bytes(0xff, len) };
            live.push((ptr, len));
        }
        check_heap(&alloc);
    }

    for (ptr, _) in live {
        unsafe { alloc.free(ptr) };
    }
    check_heap(&alloc);
    assert_eq!(shape(&alloc).len(), 1, "everything coalesces back");
}

#[test]
fn recycled_chunks_are_scrubbed() {
    let alloc = allocator(4);
    donate(&alloc, 1);

    let p = alloc.alloc(512).unwrap();
    unsafe { p.as_ptr().write_bytes(0xee, 512) };
    let guard = alloc.alloc(8).unwrap();
    unsafe { alloc.free(p) };

    let q = alloc.alloc(256).unwrap();
    assert_eq!(q, p, "best fit reuses the hole");
    assert!(is_zeroed(q, 256));
    unsafe {
        alloc.free(q);
        alloc.free(guard);
    }
    check_heap(&alloc);
}

#[test]
fn best_fit_prefers_the_tightest_hole() {
    let alloc = allocator(8);
    donate(&alloc, 4);

    let big = alloc.alloc(2000).unwrap();
    let sep1 = alloc.alloc(8).unwrap();
    let small = alloc.alloc(200).unwrap();
    let sep2 = alloc.alloc(8).unwrap();
    unsafe {
        alloc.free(big);
        alloc.free(small);
    }

    let p = alloc.alloc(150).unwrap();
    assert_eq!(p, small);
    let p2 = alloc.alloc(1000).unwrap();
    assert_eq!(p2, big);
    unsafe {
        for ptr in [p, p2, sep1, sep2] {
            alloc.free(ptr);
        }
    }
    check_heap(&alloc);
}

#[test]
fn a_hole_is_split_when_the_rest_is_useful() {
    let alloc = allocator(4);
    donate(&alloc, 1);

    let big = alloc.alloc(1000).unwrap();
    let tail = alloc.alloc(8).unwrap();
    unsafe { alloc.free(big) };
    assert_eq!(shape(&alloc), [(0, 1024), (8, 3072)]);

    let p = alloc.alloc(100).unwrap();
    assert_eq!(p, big);
    // 24 + 104 = 128 bytes taken, the rest stays free in between.
    assert_eq!(shape(&alloc), [(104, 128), (0, 896), (8, 3072)]);
    check_heap(&alloc);

    unsafe {
        alloc.free(p);
        alloc.free(tail);
    }
    assert_eq!(shape(&alloc), [(0, 4096)]);
}

#[test]
fn missing_donations_is_the_exact_shortfall() {
    let alloc = allocator(1024);
    donate(&alloc, 2);

    // 5 pages needed, 2 cached.
    assert!(alloc.alloc(5 * PAGE as usize - 100).is_none());
    assert_eq!(alloc.errno(), -12);
    assert_eq!(alloc.missing_donations(), 3);
    assert_eq!(alloc.memcache_pages(0), 2, "nothing mapped partially");
    assert_eq!(alloc.mapped_pages(), 0);

    // Shortfalls past 255 pages saturate.
    assert!(alloc.alloc(400 * PAGE as usize).is_none());
    assert_eq!(alloc.missing_donations(), u8::MAX);
}

#[test]
fn alloc_or_request_describes_the_donation() {
    let alloc = allocator(8);

    let err = alloc.alloc_or_request(3 * PAGE as usize).unwrap_err();
    assert_eq!(
        err,
        AllocFailure::NeedPages(MemRequest {
            dest: MemRequestDest::HypAlloc,
            nr_pages: 4,
            sz_alloc: PAGE,
        })
    );

    donate(&alloc, 4);
    assert!(alloc.alloc_or_request(3 * PAGE as usize).is_ok());

    assert_eq!(
        alloc.alloc_or_request(0).unwrap_err(),
        AllocFailure::Fatal(HypAllocError::Invalid)
    );
}

#[test]
fn bad_requests() {
    let alloc = allocator(2);
    donate(&alloc, 2);

    assert_eq!(alloc.try_alloc(0), Err(HypAllocError::Invalid));
    assert_eq!(alloc.errno(), -22);
    assert_eq!(alloc.try_alloc(usize::MAX), Err(HypAllocError::TooBig));
    assert_eq!(alloc.errno(), -7);

    // Larger than the heap: the first chunk cannot be mapped.
    assert_eq!(alloc.try_alloc(3 * PAGE as usize), Err(HypAllocError::TooBig));

    // The heap fills up; growing past its end is refused.
    let p = alloc.alloc(PAGE as usize).unwrap();
    assert_eq!(alloc.try_alloc(PAGE as usize), Err(HypAllocError::Invalid));
    unsafe { alloc.free(p) };
    check_heap(&alloc);
}

#[test]
fn init_validates_the_size() {
    let make = || HypAllocator::<FakePlatform, 4>::new(FakePlatform::new(4, 4, 1));

    assert_eq!(make().init(0), Err(HypAllocError::Invalid));
    assert_eq!(make().init(u64::from(u32::MAX)), Err(HypAllocError::Invalid));
    // The VA reservation fails.
    assert_eq!(make().init(8 * PAGE), Err(HypAllocError::NoMemory));

    let alloc = make();
    alloc.init(100).unwrap();
    assert_eq!(alloc.init(PAGE), Err(HypAllocError::Invalid), "only once");

    // Nothing is mapped before the first allocation.
    assert_eq!(alloc.mapped_pages(), 0);
    assert_eq!(alloc.platform().nr_mappings(), 0);
}

#[test]
fn uninitialized_heap_refuses_allocations() {
    let alloc = HypAllocator::<FakePlatform, 4>::new(FakePlatform::new(4, 4, 1));
    assert_eq!(alloc.try_alloc(8), Err(HypAllocError::Invalid));
    assert_eq!(alloc.reclaimable(), 0);
}

#[test]
fn failed_mapping_rolls_back() {
    let alloc = allocator(8);
    donate(&alloc, 3);

    // Second page of three fails.
    alloc.platform().fail_map_after(1, MapError::Invalid);
    assert_eq!(
        alloc.try_alloc(2 * PAGE as usize + 100),
        Err(HypAllocError::Map(MapError::Invalid))
    );
    assert_eq!(alloc.errno(), -22);
    assert_eq!(alloc.memcache_pages(0), 3);
    assert_eq!(alloc.platform().nr_mappings(), 0);
    assert!(shape(&alloc).is_empty());
    check_heap(&alloc);

    // A later attempt goes through.
    let p = alloc.alloc(2 * PAGE as usize + 100).unwrap();
    assert_eq!(shape(&alloc), [(2 * PAGE as u32 + 104, 3 * PAGE as u32)]);
    unsafe { alloc.free(p) };
    check_heap(&alloc);
}

#[test]
fn accounting_follows_alloc_size() {
    let alloc = allocator(4);
    donate(&alloc, 1);
    let stat = VmMemStat::new();

    let a = alloc.alloc_account(10, &stat).unwrap();
    let b = alloc.alloc_account(100, &stat).unwrap();
    assert_eq!(stat.protected_hyp_mem(), 16 + 104);

    unsafe { alloc.free_account(a, &stat) };
    assert_eq!(stat.protected_hyp_mem(), 104);
    unsafe { alloc.free_account(b, &stat) };
    assert_eq!(stat.protected_hyp_mem(), 0);

    // Failed allocations charge nothing.
    assert!(alloc.alloc_account(4 * PAGE as usize, &stat).is_none());
    assert_eq!(stat.protected_hyp_mem(), 0);
}

#[test]
fn global_alloc_interface() {
    let alloc = allocator(4);
    donate(&alloc, 2);

    let layout = Layout::from_size_align(64, 8).unwrap();
    let p = unsafe { GlobalAlloc::alloc(&alloc, layout) };
    assert!(!p.is_null());
    let z = unsafe { GlobalAlloc::alloc_zeroed(&alloc, layout) };
    assert!(is_zeroed(NonNull::new(z).unwrap(), 64));

    let strict = Layout::from_size_align(64, 64).unwrap();
    assert!(unsafe { GlobalAlloc::alloc(&alloc, strict) }.is_null());

    unsafe {
        GlobalAlloc::dealloc(&alloc, p, layout);
        GlobalAlloc::dealloc(&alloc, z, layout);
        GlobalAlloc::dealloc(&alloc, std::ptr::null_mut(), layout);
    }
    assert_eq!(shape(&alloc), [(0, 4096)]);
}
