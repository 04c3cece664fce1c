//! Memory resources.
//!
//! The kernel itself never allocates, but applications and the queue
//! storage helpers can draw from a pluggable allocator behind this
//! narrow trait. Default instances are constructors, not allocator
//! logic; the registry holds whatever the startup code installed, with
//! the null resource as the fallback.

use crate::cell::RacyCell;
use core::ptr::NonNull;

pub trait MemoryResource {
    /// Allocate `bytes` with at least `align` alignment, or `None` when
    /// exhausted.
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return storage obtained from [`Self::allocate`] with the same
    /// size and alignment.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(bytes, align)` on a resource equal
    /// to this one, and must not have been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize);

    /// Whether storage from `other` can be returned to `self`.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        core::ptr::eq(
            self as *const _ as *const u8,
            other as *const _ as *const u8,
        )
    }

    /// Largest possible single allocation; 0 when unknown.
    fn max_size(&self) -> usize {
        0
    }

    /// Drop all outstanding allocations, where supported.
    fn reset(&self) {}

    /// Merge adjacent free blocks, where supported. Returns whether
    /// anything changed.
    fn coalesce(&self) -> bool {
        false
    }
}

/// The resource that is always out of memory.
pub struct NullResource;

impl MemoryResource for NullResource {
    fn allocate(&self, _bytes: usize, _align: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _bytes: usize, _align: usize) {}
}

static NULL_RESOURCE: NullResource = NullResource;

pub fn null_resource() -> &'static dyn MemoryResource {
    &NULL_RESOURCE
}

static DEFAULT_RESOURCE: RacyCell<Option<&'static dyn MemoryResource>> = RacyCell::new(None);

/// Install the application memory resource. Startup-time only; not
/// thread safe.
pub fn set_default_resource(
    resource: &'static dyn MemoryResource,
) -> Option<&'static dyn MemoryResource> {
    unsafe { (*DEFAULT_RESOURCE.get()).replace(resource) }
}

pub fn default_resource() -> &'static dyn MemoryResource {
    unsafe { (*DEFAULT_RESOURCE.get()).unwrap_or(&NULL_RESOURCE) }
}
