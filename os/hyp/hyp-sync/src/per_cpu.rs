use crate::{SpinLock, SpinLockGuard};

/// Names the CPU the caller is running on.
///
/// Implementations must return a stable id for the duration of a call into
/// code that touches per-CPU state, i.e. the caller is pinned (no preemption,
/// no migration).
pub trait CpuId {
    /// Id of the calling CPU, `< nr_cpus()`.
    fn current_cpu(&self) -> usize;

    /// Number of CPUs that may call in.
    fn nr_cpus(&self) -> usize;
}

/// One slot of `T` per CPU.
///
/// Only the owning CPU mutates its slot on the fast path; other CPUs may
/// still walk every slot (e.g. to drain caches under a global lock). Each
/// slot carries its own lock, so such cross-CPU access stays sound and is
/// uncontended in the common case.
pub struct PerCpu<T, const N: usize> {
    slots: [SpinLock<T>; N],
}

impl<T, const N: usize> PerCpu<T, N> {
    /// Build every slot from its CPU id.
    pub fn new(mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(|cpu| SpinLock::new(init(cpu))),
        }
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Lock the slot of `cpu`.
    ///
    /// # Panics
    /// If `cpu` is not below `N`.
    #[inline]
    pub fn get(&self, cpu: usize) -> SpinLockGuard<'_, T> {
        assert!(cpu < N, "cpu {cpu} out of range for {N} per-cpu slots");
        self.slots[cpu].lock()
    }

    /// Run `f` on the slot of `cpu`.
    #[inline]
    pub fn with<R>(&self, cpu: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slot = self.get(cpu);
        f(&mut slot)
    }

    /// Run `f` on the slot of the calling CPU.
    #[inline]
    pub fn with_this_cpu<C: CpuId + ?Sized, R>(&self, cpus: &C, f: impl FnOnce(&mut T) -> R) -> R {
        self.with(cpus.current_cpu(), f)
    }

    /// Iterate over the slots of the first `nr_cpus` CPUs.
    pub fn iter_online(&self, nr_cpus: usize) -> impl Iterator<Item = &SpinLock<T>> {
        self.slots.iter().take(nr_cpus)
    }
}

impl<T: Default, const N: usize> Default for PerCpu<T, N> {
    fn default() -> Self {
        Self::new(|_| T::default())
    }
}
