//! A best-fit boundary-tag allocator for `no_std`, layered over a
//! contiguous region that grows like a program break.
//!
//! Free space is tracked in a 64-slot directory: exact-size lists for
//! small chunks, bitwise-digital size trees for large ones, a catch-all
//! list for huge ones, plus a recently-split victim chunk and the free
//! chunk at the end of the heap. Freeing coalesces eagerly in both
//! directions, and resizing absorbs free neighbours before it ever
//! relocates.
//!
//! Getting started:
//! 1. Pick a [`Brk`] — [`ArenaBrk`] over your own buffer, or `SysBrk`
//!    (feature `system-backed`) over the process break.
//! 2. Construct with [`Mica::new`]. The heap establishes itself on first
//!    allocation, or explicitly via [`Mica::init`].
//! 3. Optionally wrap it with [`Mica::lock`] for a [`GlobalAlloc`]
//!    (and, with the `allocator` feature, an `Allocator`) impl.
//!
//! ```rust
//! # use mica::{ArenaBrk, Mica};
//! let arena = Box::leak(vec![0u8; 65536].into_boxed_slice());
//! let mut mica = Mica::new(ArenaBrk::from(arena));
//!
//! unsafe {
//!     let p = mica.malloc(1000).unwrap();
//!     mica.free(p);
//! }
//! ```
//!
//! The core is single-threaded, never returns memory to its source other
//! than through [`Mica::reset_brk`], does not zero memory, and serves no
//! alignment above 8 bytes.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc

#![cfg_attr(not(test), no_std)]

mod brk;
#[cfg(feature = "lock_api")]
mod lock;
mod mica;
mod ptr_utils;

pub use brk::{ArenaBrk, Brk};
#[cfg(all(unix, feature = "system-backed"))]
pub use brk::SysBrk;
#[cfg(feature = "lock_api")]
pub use lock::MicaLock;
pub use mica::Mica;

pub use mica::bins::{
    EXTENSION_SIZE, HUGE_CUTOFF, INITIAL_CHUNK_SIZE, LARGE_BIN_SEARCH_MAX, LARGE_CUTOFF,
    MIN_ALLOC, MIN_CHUNK, NUM_BINS, SMALL_BIN_SEARCH_MAX,
};
pub use ptr_utils::ALIGN;
