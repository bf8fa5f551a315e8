use crate::{HostDonation, MemcacheError, PhysMapper};
use bitfield_struct::bitfield;
use hyp_info::memory::HypPageSize;
use hyp_memory_addresses::PhysicalAddress;
use log::trace;

/// Link word stored at the start of every cached page and in the
/// [`Memcache`] itself.
///
/// Packs the page frame of the next page with its allocation order, the
/// same layout the host uses for the memcaches it hands over.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MemcacheHead {
    /// Allocation order of the page (bits 0..11); the allocator only deals
    /// in order-0 pages.
    #[bits(12)]
    pub order: u16,
    /// Page frame number (bits 12..63).
    #[bits(52)]
    pub pfn: u64,
}

impl MemcacheHead {
    #[inline]
    #[must_use]
    pub fn for_page(pa: PhysicalAddress, order: u16) -> Self {
        Self::new()
            .with_pfn(pa.pfn::<HypPageSize>())
            .with_order(order)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::from_pfn::<HypPageSize>(self.pfn())
    }
}

/// LIFO stack of free pages, linked through the pages themselves.
///
/// # Invariants
/// - `nr_pages` pages are reachable from `head`.
/// - Every reachable page is owned by whoever owns the memcache and is
///   reachable through the [`PhysMapper`] passed to `push`/`pop`.
#[derive(Debug, Default)]
pub struct Memcache {
    head: MemcacheHead,
    nr_pages: u64,
}

impl Memcache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: MemcacheHead::new(),
            nr_pages: 0,
        }
    }

    /// Number of cached pages.
    #[inline]
    #[must_use]
    pub const fn nr_pages(&self) -> u64 {
        self.nr_pages
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }

    /// Push the page at `pa` on top of the stack.
    ///
    /// The first word of the page is overwritten with the link to the
    /// previous top.
    ///
    /// # Safety
    /// - `pa` must be a page-aligned, order-sized page owned by the caller
    ///   and no longer referenced anywhere else.
    /// - `mapper.phys_to_virt(pa)` must be writable.
    pub unsafe fn push<M: PhysMapper + ?Sized>(
        &mut self,
        mapper: &M,
        pa: PhysicalAddress,
        order: u16,
    ) {
        debug_assert!(pa.is_aligned::<HypPageSize>());
        let link = mapper.phys_to_virt(pa).as_mut_ptr::<u64>();
        unsafe {
            link.write_volatile(self.head.into_bits());
        }
        self.head = MemcacheHead::for_page(pa, order);
        self.nr_pages += 1;
    }

    /// Pop the top page, returning it with its order.
    ///
    /// # Safety
    /// The memcache invariants must hold for `mapper`.
    pub unsafe fn pop<M: PhysMapper + ?Sized>(&mut self, mapper: &M) -> Option<(PhysicalAddress, u16)> {
        if self.nr_pages == 0 {
            return None;
        }

        let top = self.head;
        let pa = top.physical_address();
        let link = mapper.phys_to_virt(pa).as_mut_ptr::<u64>();
        self.head = MemcacheHead::from_bits(unsafe { link.read_volatile() });
        self.nr_pages -= 1;
        Some((pa, top.order()))
    }

    /// Frame number of the top page without popping it.
    #[inline]
    #[must_use]
    pub const fn peek_pfn(&self) -> Option<u64> {
        if self.nr_pages == 0 {
            None
        } else {
            Some(self.head.pfn())
        }
    }

    /// Move pages from the host-owned `host_mc` into `self` until `self`
    /// holds at least `min_pages`.
    ///
    /// Each page is first donated from the host to the hypervisor, then
    /// unlinked from `host_mc`. Pages admitted before a failure stay in
    /// `self`.
    ///
    /// # Errors
    /// - [`MemcacheError::Empty`] if `host_mc` runs dry first.
    /// - [`MemcacheError::Donation`] if the host no longer owns a page.
    ///
    /// # Safety
    /// The memcache invariants must hold for both memcaches and `platform`.
    pub unsafe fn topup_from_host<P: PhysMapper + HostDonation + ?Sized>(
        &mut self,
        min_pages: u64,
        host_mc: &mut Self,
        platform: &P,
    ) -> Result<(), MemcacheError> {
        while self.nr_pages < min_pages {
            let pfn = host_mc.peek_pfn().ok_or(MemcacheError::Empty)?;
            platform.host_donate_hyp(pfn, 1)?;

            let (pa, order) = unsafe { host_mc.pop(platform) }.ok_or(MemcacheError::Empty)?;
            unsafe { self.push(platform, pa, order) };
            trace!("admitted host page {pa} into memcache ({} pages)", self.nr_pages);
        }
        Ok(())
    }
}
