//! A hypervisor stand-in: one arena plays the private VA range, another the
//! physical pages the host donates.

#![allow(dead_code)]

use hyp_alloc::{AllocFailure, ChunkInfo, HypAllocator, chunk_size};
use hyp_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use hyp_mm::{CpuId, DonationError, HostDonation, MapError, Memcache, PhysMapper, PrivateMapper};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

pub const PAGE: u64 = 4096;
pub const PHYS_BASE: u64 = 0x8000_0000;

/// Fill pattern of freshly mapped pages.
pub const STALE: u8 = 0xa5;
/// Fill pattern of unmapped VA.
pub const POISON: u8 = 0x5a;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Pin the calling thread to `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

struct Arena {
    base: *mut u8,
    layout: Layout,
}

// The arenas are plain memory; all bookkeeping sits behind `FakePlatform::state`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(pages: u64) -> Self {
        let layout = Layout::from_size_align((pages * PAGE) as usize, PAGE as usize).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    fn start(&self) -> u64 {
        self.base as u64
    }

    fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.start() && addr < self.start() + self.len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub va_reserved: bool,
    /// Page VA → page PA.
    pub mappings: BTreeMap<u64, u64>,
    /// Frames the host currently owns.
    pub host_owned: BTreeSet<u64>,
    /// Index of the next never-used physical page.
    pub next_page: u64,
    /// Pages taken from the host.
    pub admitted: u64,
    /// Frames handed back to the host, in order.
    pub returned: Vec<u64>,
    /// `(va, len)` of every cache flush.
    pub flushed: Vec<(u64, u64)>,
    /// Number of `map_page` calls that succeed before `map_error` is
    /// returned.
    pub fail_map_after: Option<usize>,
    pub map_error: Option<MapError>,
    pub map_calls: usize,
}

pub struct FakePlatform {
    va: Arena,
    phys: Arena,
    nr_cpus: usize,
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new(va_pages: u64, phys_pages: u64, nr_cpus: usize) -> Self {
        Self {
            va: Arena::new(va_pages),
            phys: Arena::new(phys_pages),
            nr_cpus,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn va_start(&self) -> u64 {
        self.va.start()
    }

    /// A host memcache holding `nr` fresh, host-owned pages.
    pub fn host_pages(&self, nr: u64) -> Memcache {
        let mut mc = Memcache::new();
        for _ in 0..nr {
            let pa = {
                let mut state = self.state();
                let idx = state.next_page;
                assert!(idx * PAGE < self.phys.len(), "fake physical memory exhausted");
                state.next_page += 1;
                let pa = PhysicalAddress::new(PHYS_BASE + idx * PAGE);
                state.host_owned.insert(pa.pfn::<Size4K>());
                pa
            };
            // Whatever the host left behind.
            let va = self.phys_to_virt(pa);
            unsafe { std::ptr::write_bytes(va.as_mut_ptr::<u8>(), STALE, PAGE as usize) };
            unsafe { mc.push(self, pa, 0) };
        }
        mc
    }

    /// Frames handed back so far that still hold data past the memcache
    /// link, or were never flushed.
    pub fn dirty_returns(&self) -> Vec<u64> {
        let returned = self.state().returned.clone();
        returned
            .into_iter()
            .filter(|&pfn| {
                let pa = pfn << 12;
                let va = self.phys_to_virt(PhysicalAddress::new(pa)).as_u64();
                let flushed = self.state().flushed.contains(&(va, PAGE));
                !flushed || self.page_bytes(pa)[8..].iter().any(|&b| b != 0)
            })
            .collect()
    }

    /// Make the `(n + 1)`-th `map_page` call from now fail with `err`.
    pub fn fail_map_after(&self, n: usize, err: MapError) {
        let mut state = self.state();
        state.fail_map_after = Some(state.map_calls + n);
        state.map_error = Some(err);
    }

    pub fn nr_mappings(&self) -> u64 {
        self.state().mappings.len() as u64
    }

    pub fn is_mapped(&self, va: u64) -> bool {
        self.state().mappings.contains_key(&(va & !(PAGE - 1)))
    }

    /// Pages the hypervisor holds: admitted minus returned.
    pub fn hyp_owned_pages(&self) -> u64 {
        let state = self.state();
        state.admitted - state.returned.len() as u64
    }

    pub fn nr_returned(&self) -> u64 {
        self.state().returned.len() as u64
    }

    pub fn page_bytes(&self, pa: u64) -> &[u8] {
        let va = self.phys_to_virt(PhysicalAddress::new(pa));
        unsafe { std::slice::from_raw_parts(va.as_mut_ptr::<u8>(), PAGE as usize) }
    }
}

impl PhysMapper for FakePlatform {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let offset = pa.as_u64() - PHYS_BASE;
        assert!(offset < self.phys.len(), "{pa} is not fake physical memory");
        VirtualAddress::new(self.phys.start() + offset)
    }
}

impl PrivateMapper for FakePlatform {
    fn alloc_private_va_range(&self, size: u64) -> Result<VirtualAddress, MapError> {
        let mut state = self.state();
        if state.va_reserved || size > self.va.len() {
            return Err(MapError::NoMemory);
        }
        state.va_reserved = true;
        Ok(VirtualAddress::new(self.va.start()))
    }

    fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress) -> Result<(), MapError> {
        let mut state = self.state();
        let call = state.map_calls;
        state.map_calls += 1;
        if state.fail_map_after == Some(call) {
            return Err(state.map_error.unwrap_or(MapError::NoMemory));
        }

        let va = va.as_u64();
        assert!(va % PAGE == 0 && self.va.contains(va), "bad mapping target {va:#x}");
        assert!(!state.host_owned.contains(&(pa.as_u64() >> 12)), "mapping a host page");
        if state.mappings.contains_key(&va) {
            return Err(MapError::Exists);
        }
        assert!(
            !state.mappings.values().any(|&mapped| mapped == pa.as_u64()),
            "{pa} mapped twice"
        );
        state.mappings.insert(va, pa.as_u64());

        // Donated pages come with whatever the host left in them.
        unsafe { std::ptr::write_bytes(va as *mut u8, STALE, PAGE as usize) };
        Ok(())
    }

    fn unmap_range(&self, start: VirtualAddress, end: VirtualAddress) {
        let mut state = self.state();
        let mut va = start.as_u64();
        while va < end.as_u64() {
            assert!(state.mappings.remove(&va).is_some(), "unmapping unmapped {va:#x}");
            unsafe { std::ptr::write_bytes(va as *mut u8, POISON, PAGE as usize) };
            va += PAGE;
        }
    }

    fn private_range_pa(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.state()
            .mappings
            .get(&va.as_u64())
            .map(|&pa| PhysicalAddress::new(pa))
    }
}

impl HostDonation for FakePlatform {
    fn hyp_donate_host(&self, pfn: u64, nr_pages: u64) -> Result<(), DonationError> {
        let mut state = self.state();
        for pfn in pfn..pfn + nr_pages {
            if !state.host_owned.insert(pfn) {
                return Err(DonationError::NotOwned(pfn));
            }
            state.returned.push(pfn);
        }
        Ok(())
    }

    fn host_donate_hyp(&self, pfn: u64, nr_pages: u64) -> Result<(), DonationError> {
        let mut state = self.state();
        for pfn in pfn..pfn + nr_pages {
            if !state.host_owned.remove(&pfn) {
                return Err(DonationError::NotOwned(pfn));
            }
            state.admitted += 1;
        }
        Ok(())
    }

    fn flush_dcache_to_poc(&self, va: VirtualAddress, len: u64) {
        self.state().flushed.push((va.as_u64(), len));
    }
}

impl CpuId for FakePlatform {
    fn current_cpu(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }
}

pub type Alloc = HypAllocator<FakePlatform, 4>;

/// An initialized single-CPU allocator over `heap_pages` of VA.
pub fn allocator(heap_pages: u64) -> Alloc {
    allocator_smp(heap_pages, 1)
}

pub fn allocator_smp(heap_pages: u64, nr_cpus: usize) -> Alloc {
    let alloc = HypAllocator::new(FakePlatform::new(heap_pages, 1024, nr_cpus));
    alloc.init(heap_pages * PAGE).unwrap();
    alloc
}

/// Hand `nr` fresh host pages to the calling CPU's memcache.
pub fn donate(alloc: &Alloc, nr: u64) {
    let mut host_mc = alloc.platform().host_pages(nr);
    unsafe { alloc.refill(&mut host_mc) }.unwrap();
    assert!(host_mc.is_empty());
}

/// Tiny deterministic generator so failures reproduce.
pub struct XorShift(pub u64);

impl XorShift {
    pub fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

/// Allocate, donating whatever the heap asks for until it succeeds.
pub fn alloc_donating(alloc: &Alloc, size: usize) -> NonNull<u8> {
    loop {
        match alloc.alloc_or_request(size) {
            Ok(ptr) => return ptr,
            Err(AllocFailure::NeedPages(req)) => donate(alloc, u64::from(req.nr_pages)),
            Err(AllocFailure::Fatal(e)) => panic!("alloc({size}) failed: {e}"),
        }
    }
}

pub fn chunks(alloc: &Alloc) -> Vec<ChunkInfo> {
    let mut out = Vec::new();
    alloc.walk(|c| out.push(*c));
    out
}

/// `(alloc_size, mapped_size)` of every chunk, in address order.
pub fn shape(alloc: &Alloc) -> Vec<(u32, u32)> {
    chunks(alloc).iter().map(|c| (c.alloc_size, c.mapped_size)).collect()
}

pub fn offset(alloc: &Alloc, ptr: std::ptr::NonNull<u8>) -> u64 {
    ptr.as_ptr() as u64 - alloc.platform().va_start()
}

pub fn is_zeroed(ptr: std::ptr::NonNull<u8>, len: usize) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == 0)
}

/// Check the heap layout against the page tables and the page accounting.
pub fn check_heap(alloc: &Alloc) {
    let platform = alloc.platform();
    let start = platform.va_start();
    let list = chunks(alloc);

    if let Some(first) = list.first() {
        assert_eq!(first.addr.as_u64(), start, "first chunk moved");
    }

    for (i, c) in list.iter().enumerate() {
        let addr = c.addr.as_u64();
        let mapped_end = addr + u64::from(c.mapped_size);
        let end = c.end().as_u64();

        assert!(addr + chunk_size(u64::from(c.alloc_size)) <= end, "chunk {i} overruns: {c:?}");
        assert!(mapped_end <= end, "chunk {i} mapping overruns: {c:?}");
        assert!(addr % 8 == 0, "chunk {i} misaligned: {c:?}");
        if c.unmapped_size != 0 {
            assert!(mapped_end % PAGE == 0, "chunk {i} mapping ends mid-page: {c:?}");
        }

        let mut page = addr & !(PAGE - 1);
        while page < mapped_end {
            assert!(platform.is_mapped(page), "chunk {i} page {page:#x} not mapped");
            page += PAGE;
        }
        let mut page = mapped_end.next_multiple_of(PAGE);
        while page + PAGE <= end {
            assert!(!platform.is_mapped(page), "chunk {i} hole page {page:#x} mapped");
            page += PAGE;
        }

        if let Some(next) = list.get(i + 1) {
            assert_eq!(end, next.addr.as_u64(), "chunk {i} does not reach its successor");
            assert!(
                !(c.is_free() && next.is_free() && c.unmapped_size == 0),
                "free chunks {i} and {} not coalesced",
                i + 1
            );
        }
    }

    let mapped = platform.nr_mappings();
    assert_eq!(alloc.mapped_pages(), mapped);
    let cached: u64 = (0..4).map(|cpu| alloc.memcache_pages(cpu)).sum();
    assert_eq!(mapped + cached, platform.hyp_owned_pages(), "pages leaked");
}
