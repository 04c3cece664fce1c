//! Fixed-block memory pools.
//!
//! The caller-provided storage is carved into `capacity` blocks chained
//! through each free block's first word; allocation pops the head,
//! release pushes it back. When a release finds a blocked allocator, the
//! block is handed to it directly and never re-enters the free chain.

use crate::cell::LockedRefCell;
use crate::error::{Error, Result};
use crate::kernel::fault::{kernel_fault, KernelFault};
use crate::kernel::hal;
use crate::kernel::klock::KernelLock;
use crate::kernel::scheduler;
use crate::kernel::waiter::{WaitList, WakeReason};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};
use aligned::{Aligned, A8};
use core::mem::MaybeUninit;
use static_cell::ConstStaticCell;

/// Static backing store for a [`MemoryPool`].
pub struct PoolStorage<const BLOCKS: usize, const BLOCK_SIZE: usize> {
    data: ConstStaticCell<Aligned<A8, [[MaybeUninit<u8>; BLOCK_SIZE]; BLOCKS]>>,
}

impl<const BLOCKS: usize, const BLOCK_SIZE: usize> PoolStorage<BLOCKS, BLOCK_SIZE> {
    pub const fn new() -> PoolStorage<BLOCKS, BLOCK_SIZE> {
        PoolStorage {
            data: ConstStaticCell::new(Aligned([[MaybeUninit::uninit(); BLOCK_SIZE]; BLOCKS])),
        }
    }

    /// Take the storage as an erased byte slice. Panics on a second call.
    pub fn take(&'static self) -> (&'static mut [MaybeUninit<u8>], usize, usize) {
        let data = self.data.take();
        let data = unsafe {
            core::slice::from_raw_parts_mut(
                data.as_mut_ptr() as *mut MaybeUninit<u8>,
                BLOCKS * BLOCK_SIZE,
            )
        };
        (data, BLOCKS, BLOCK_SIZE)
    }
}

/// Create a `&'static MemoryPool` with static storage:
/// `make_memory_pool!(blocks, block_size)`.
#[macro_export]
macro_rules! make_memory_pool {
    ($blocks:expr, $block_size:expr) => {{
        static STORAGE: $crate::sync::mempool::PoolStorage<{ $blocks }, { $block_size }> =
            $crate::sync::mempool::PoolStorage::new();
        static POOL: $crate::static_cell::StaticCell<$crate::sync::mempool::MemoryPool> =
            $crate::static_cell::StaticCell::new();
        let (data, blocks, block_size) = STORAGE.take();
        &*POOL.init($crate::sync::mempool::MemoryPool::new(data, blocks, block_size))
    }};
}

struct PoolCore {
    base: *mut u8,
    block_size: usize,
    capacity: usize,
    free_head: *mut u8,
    free_count: usize,
}

unsafe impl Send for PoolCore {}

impl PoolCore {
    fn carve(base: *mut u8, capacity: usize, block_size: usize) -> PoolCore {
        let mut core = PoolCore {
            base,
            block_size,
            capacity,
            free_head: core::ptr::null_mut(),
            free_count: 0,
        };
        core.rebuild();
        core
    }

    /// Chain all blocks through their first word, last block first so
    /// the chain starts at the lowest address.
    fn rebuild(&mut self) {
        self.free_head = core::ptr::null_mut();
        self.free_count = 0;
        for index in (0..self.capacity).rev() {
            let block = unsafe { self.base.add(index * self.block_size) };
            unsafe { (block as *mut *mut u8).write(self.free_head) };
            self.free_head = block;
            self.free_count += 1;
        }
    }

    fn pop(&mut self) -> Option<*mut u8> {
        let block = self.free_head;
        if block.is_null() {
            return None;
        }
        self.free_head = unsafe { (block as *mut *mut u8).read() };
        self.free_count -= 1;
        Some(block)
    }

    fn push(&mut self, block: *mut u8) {
        unsafe { (block as *mut *mut u8).write(self.free_head) };
        self.free_head = block;
        self.free_count += 1;
    }

    fn owns(&self, block: *mut u8) -> bool {
        let offset = (block as usize).wrapping_sub(self.base as usize);
        offset < self.capacity * self.block_size && offset % self.block_size == 0
    }
}

pub struct MemoryPool {
    core: LockedRefCell<PoolCore, KernelLock>,
    waiters: WaitList,
}

impl MemoryPool {
    /// Wrap caller-provided storage; see [`make_memory_pool!`].
    pub fn new(data: &'static mut [MaybeUninit<u8>], blocks: usize, block_size: usize) -> MemoryPool {
        if blocks == 0
            || block_size < core::mem::size_of::<*mut u8>()
            || block_size % core::mem::align_of::<*mut u8>() != 0
            || data.len() != blocks * block_size
        {
            kernel_fault(KernelFault::ConfigError("bad memory pool storage"));
        }
        MemoryPool {
            core: LockedRefCell::new(PoolCore::carve(
                data.as_mut_ptr() as *mut u8,
                blocks,
                block_size,
            )),
            waiters: WaitList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        KernelLock::with(|kkey| self.core.borrow(kkey).capacity)
    }

    pub fn block_size(&self) -> usize {
        KernelLock::with(|kkey| self.core.borrow(kkey).block_size)
    }

    /// Number of free blocks.
    pub fn count(&self) -> usize {
        KernelLock::with(|kkey| self.core.borrow(kkey).free_count)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        KernelLock::with(|kkey| {
            let core = self.core.borrow(kkey);
            core.free_count == core.capacity
        })
    }

    pub fn alloc(&self) -> Result<*mut u8> {
        self.alloc_inner(None, false)
    }

    /// Handler-safe allocation that never blocks.
    pub fn try_alloc(&self) -> Result<*mut u8> {
        self.alloc_inner(None, true)
    }

    pub fn alloc_until(&self, deadline: Instant) -> Result<*mut u8> {
        self.alloc_inner(Some(deadline), false)
    }

    pub fn alloc_for(&self, timeout: Duration) -> Result<*mut u8> {
        self.alloc_until(crate::kernel::clock::sysclock().now() + timeout)
    }

    fn alloc_inner(&self, deadline: Option<Instant>, try_only: bool) -> Result<*mut u8> {
        if !try_only && hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| loop {
            if let Some(block) = self.core.borrow_mut(kkey).pop() {
                return Ok(block);
            }
            if try_only {
                return Err(Error::WouldBlock);
            }

            let current = scheduler::current_thread(kkey);
            let reason =
                scheduler::block_current(kkey, Some(&self.waiters), deadline, ThreadState::Blocked);
            match reason {
                // A releasing thread handed us its block directly.
                WakeReason::Transfer => return Ok(current.waiter.take_handoff()),
                WakeReason::Timeout => return Err(Error::TimedOut),
                WakeReason::Interrupted => return Err(Error::Interrupted),
                WakeReason::Notify | WakeReason::Pending => continue,
            }
        })
    }

    /// Return a block. Hands it to the best blocked allocator when one
    /// exists; `Inval` for a pointer the pool does not own.
    pub fn free(&self, block: *mut u8) -> Result<()> {
        KernelLock::with(|kkey| {
            if !self.core.borrow(kkey).owns(block) {
                return Err(Error::Inval);
            }
            match self.waiters.take_one(kkey) {
                Some(waiter) => {
                    waiter.set_handoff(block);
                    crate::kernel::waiter::wake_detached(kkey, waiter, WakeReason::Transfer);
                    scheduler::reschedule(kkey);
                }
                None => {
                    self.core.borrow_mut(kkey).push(block);
                }
            }
            Ok(())
        })
    }

    /// Rebuild the free chain and abort every blocked allocation with
    /// `Interrupted`. Outstanding blocks are considered returned.
    pub fn reset(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            self.core.borrow_mut(kkey).rebuild();
            self.waiters.wake_all(kkey, WakeReason::Interrupted);
            scheduler::reschedule(kkey);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PoolCore;

    fn carved(blocks: usize, block_size: usize) -> PoolCore {
        // Word-backed storage keeps the free-chain pointer writes aligned.
        let words = blocks * block_size / core::mem::size_of::<usize>();
        let data = Box::leak(vec![0usize; words].into_boxed_slice());
        PoolCore::carve(data.as_mut_ptr() as *mut u8, blocks, block_size)
    }

    #[test]
    fn carve_counts_blocks() {
        let pool = carved(4, 16);
        assert_eq!(pool.capacity, 4);
        assert_eq!(pool.free_count, 4);
    }

    #[test]
    fn conservation_over_alloc_free() {
        let mut pool = carved(3, 16);
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        assert_eq!(pool.free_count, 1);
        assert_ne!(a, b);

        pool.push(a);
        assert_eq!(pool.free_count, 2);
        pool.push(b);
        assert_eq!(pool.free_count, 3);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = carved(2, 8);
        assert!(pool.pop().is_some());
        assert!(pool.pop().is_some());
        assert!(pool.pop().is_none());
        assert_eq!(pool.free_count, 0);
    }

    #[test]
    fn lifo_reuse_and_ownership() {
        let mut pool = carved(2, 8);
        let a = pool.pop().unwrap();
        pool.push(a);
        // Most recently freed block is reused first.
        assert_eq!(pool.pop().unwrap(), a);
        assert!(pool.owns(a));
        assert!(!pool.owns((a as usize + 1) as *mut u8));
        assert!(!pool.owns(core::ptr::null_mut()));
    }
}
