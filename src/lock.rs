//! Home of MicaLock, a mutex-locked wrapper of Mica.
//!
//! The core allocator is single-threaded by construction; this wrapper is
//! the coarse-mutex embedding for multi-threaded hosts, and carries the
//! standard allocator trait impls.

use crate::brk::Brk;
use crate::mica::Mica;
use crate::ptr_utils::ALIGN;

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp::Ordering,
    ptr::{null_mut, NonNull},
};

/// Mica lock, contains a mutex-locked [`Mica`].
///
/// Implements [`GlobalAlloc`] and, with the `allocator` feature,
/// [`allocator_api2::alloc::Allocator`]. Alignment requests above the
/// fixed block alignment of 8 are refused.
///
/// # Example
/// ```rust
/// # use mica::{ArenaBrk, Mica};
/// let arena = Box::leak(vec![0u8; 65536].into_boxed_slice());
/// let mica = Mica::new(ArenaBrk::from(arena)).lock::<spin::Mutex<()>>();
/// ```
#[derive(Debug)]
pub struct MicaLock<R: lock_api::RawMutex, B: Brk> {
    mutex: lock_api::Mutex<R, Mica<B>>,
}

impl<R: lock_api::RawMutex, B: Brk> MicaLock<R, B> {
    /// Create a new `MicaLock`.
    pub const fn new(mica: Mica<B>) -> Self {
        Self { mutex: lock_api::Mutex::new(mica) }
    }

    /// Lock the mutex and access the inner `Mica`.
    pub fn lock(&self) -> lock_api::MutexGuard<R, Mica<B>> {
        self.mutex.lock()
    }

    /// Try to lock the mutex and access the inner `Mica`.
    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<R, Mica<B>>> {
        self.mutex.try_lock()
    }

    /// Retrieve the inner `Mica`.
    pub fn into_inner(self) -> Mica<B> {
        self.mutex.into_inner()
    }
}

impl<B: Brk> Mica<B> {
    /// Wrap in [`MicaLock`], a mutex-locked wrapper struct using
    /// [`lock_api`].
    pub const fn lock<R: lock_api::RawMutex>(self) -> MicaLock<R, B> {
        MicaLock::new(self)
    }
}

unsafe impl<R: lock_api::RawMutex, B: Brk> GlobalAlloc for MicaLock<R, B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }

        self.lock().malloc(layout.size()).map_or(null_mut(), |nn| nn.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.lock().free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if old_layout.align() > ALIGN {
            return null_mut();
        }

        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return self.lock().malloc(new_size).map_or(null_mut(), |nn| nn.as_ptr()),
        };

        match new_size.cmp(&old_layout.size()) {
            Ordering::Equal => ptr.as_ptr(),
            _ => self
                .lock()
                .realloc(ptr, new_size)
                .map_or(null_mut(), |nn| nn.as_ptr()),
        }
    }
}

#[cfg(feature = "allocator")]
mod allocator_impl {
    use super::*;
    use allocator_api2::alloc::{AllocError, Allocator};

    fn slice_of(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(nn, len)
    }

    unsafe impl<R: lock_api::RawMutex, B: Brk> Allocator for MicaLock<R, B> {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            if layout.size() == 0 {
                return Ok(slice_of(NonNull::dangling(), 0));
            }
            if layout.align() > ALIGN {
                return Err(AllocError);
            }

            unsafe { self.lock().malloc(layout.size()) }
                .map(|nn| slice_of(nn, layout.size()))
                .map_err(|_| AllocError)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            if layout.size() != 0 {
                self.lock().free(ptr);
            }
        }

        unsafe fn grow(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Result<NonNull<[u8]>, AllocError> {
            debug_assert!(new_layout.size() >= old_layout.size());

            if old_layout.size() == 0 {
                return self.allocate(new_layout);
            }
            if new_layout.align() > ALIGN {
                return Err(AllocError);
            }

            self.lock()
                .realloc(ptr, new_layout.size())
                .map(|nn| slice_of(nn, new_layout.size()))
                .map_err(|_| AllocError)
        }

        unsafe fn grow_zeroed(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Result<NonNull<[u8]>, AllocError> {
            let res = self.grow(ptr, old_layout, new_layout);

            if let Ok(growed) = res {
                growed
                    .as_ptr()
                    .cast::<u8>()
                    .add(old_layout.size())
                    .write_bytes(0, new_layout.size() - old_layout.size());
            }

            res
        }

        unsafe fn shrink(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Result<NonNull<[u8]>, AllocError> {
            debug_assert!(new_layout.size() <= old_layout.size());

            if new_layout.size() == 0 {
                if old_layout.size() != 0 {
                    self.lock().free(ptr);
                }
                return Ok(slice_of(NonNull::dangling(), 0));
            }
            if new_layout.align() > ALIGN {
                return Err(AllocError);
            }

            self.lock()
                .realloc(ptr, new_layout.size())
                .map(|nn| slice_of(nn, new_layout.size()))
                .map_err(|_| AllocError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brk::ArenaBrk;

    fn locked() -> MicaLock<spin::Mutex<()>, ArenaBrk> {
        let arena = Box::leak(vec![0u8; 1 << 16].into_boxed_slice());
        Mica::new(ArenaBrk::from(arena)).lock()
    }

    #[test]
    fn global_alloc_round_trip() {
        let mica = locked();
        let layout = Layout::from_size_align(1243, 8).unwrap();

        unsafe {
            let a = mica.alloc(layout);
            assert!(!a.is_null());
            a.write_bytes(0xab, layout.size());

            let b = mica.realloc(a, layout, 2000);
            assert!(!b.is_null());
            for i in 0..layout.size() {
                assert_eq!(b.add(i).read(), 0xab);
            }

            mica.dealloc(b, Layout::from_size_align(2000, 8).unwrap());
        }
    }

    #[test]
    fn overaligned_requests_are_refused() {
        let mica = locked();

        unsafe {
            assert!(mica.alloc(Layout::from_size_align(64, 16).unwrap()).is_null());
            assert!(!mica.alloc(Layout::from_size_align(64, 8).unwrap()).is_null());
        }
    }

    #[cfg(feature = "allocator")]
    #[test]
    fn allocator_api_round_trip() {
        use allocator_api2::alloc::Allocator;

        let mica = locked();
        let layout = Layout::from_size_align(100, 4).unwrap();

        let a = mica.allocate(layout).unwrap();
        assert_eq!(a.len(), 100);

        unsafe {
            a.as_ptr().cast::<u8>().write_bytes(0x5a, 100);

            let b = mica
                .grow_zeroed(a.cast(), layout, Layout::from_size_align(300, 4).unwrap())
                .unwrap();
            for i in 0..300 {
                let expected = if i < 100 { 0x5a } else { 0 };
                assert_eq!(b.as_ptr().cast::<u8>().add(i).read(), expected);
            }

            let c = mica
                .shrink(b.cast(), Layout::from_size_align(300, 4).unwrap(), layout)
                .unwrap();
            assert_eq!(c.as_ptr().cast::<u8>(), b.as_ptr().cast::<u8>());

            mica.deallocate(c.cast(), layout);
        }
    }

    #[cfg(feature = "allocator")]
    #[test]
    fn zero_size_allocations_are_dangling() {
        use allocator_api2::alloc::Allocator;

        let mica = locked();
        let layout = Layout::from_size_align(0, 1).unwrap();

        let a = mica.allocate(layout).unwrap();
        assert_eq!(a.len(), 0);
        unsafe { mica.deallocate(a.cast(), layout) };
    }
}
