//! The allocator core.

pub(crate) mod bins;
pub(crate) mod chunk;
pub(crate) mod llist;
pub(crate) mod tree;

use crate::brk::Brk;
use crate::ptr_utils::{align_ptr_up, align_up, WORD};
use bins::*;
use chunk::Chunk;
#[cfg(debug_assertions)]
use chunk::Parent;
#[cfg(debug_assertions)]
use crate::ptr_utils::ALIGN;
use core::ptr::{null_mut, NonNull};

/// The boundary-tag allocator over a [`Brk`] region.
///
/// All state lives in the directory of 64 bin slots plus the managed heap
/// itself; the allocator performs no auxiliary allocation. The core is
/// strictly single-threaded and takes `&mut self` everywhere; wrap it in
/// [`lock`](Mica::lock) to share it.
///
/// # Example
/// ```rust
/// # use mica::{ArenaBrk, Mica};
/// let arena = Box::leak(vec![0u8; 65536].into_boxed_slice());
/// let mut mica = Mica::new(ArenaBrk::from(arena));
///
/// unsafe {
///     let p = mica.malloc(100).unwrap();
///     p.as_ptr().write_bytes(0xab, 100);
///     let p = mica.realloc(p, 200).unwrap();
///     mica.free(p);
/// }
/// ```
pub struct Mica<B: Brk> {
    /// The bin directory. Slot 0 holds the end-of-heap chunk, slot 1 the
    /// victim, slot 2 the huge list head; the rest are the exact-size
    /// lists and the tree roots. Null means empty.
    bins: [*mut u8; NUM_BINS],
    brk: B,
}

unsafe impl<B: Brk + Send> Send for Mica<B> {}

impl<B: Brk> core::fmt::Debug for Mica<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut occupancy = 0u64;
        for (i, bin) in self.bins.iter().enumerate() {
            if !bin.is_null() {
                occupancy |= 1 << i;
            }
        }
        f.debug_struct("Mica")
            .field("occupancy", &format_args!("{:#x}", occupancy))
            .field("heap_lo", &self.brk.heap_lo())
            .field("heap_hi", &self.brk.heap_hi())
            .finish()
    }
}

/// Rounds a user request up to [`ALIGN`] and [`MIN_ALLOC`], refusing
/// absurd sizes so later size arithmetic cannot overflow.
#[inline]
fn round_request(size: usize) -> Result<usize, ()> {
    if size > isize::MAX as usize - EXTENSION_SIZE {
        return Err(());
    }
    Ok(align_up(size).max(MIN_ALLOC))
}

impl<B: Brk> Mica<B> {
    /// Creates an allocator over `brk` with an empty directory.
    ///
    /// Nothing is allocated from the region until [`init`](Mica::init),
    /// which the first `malloc` performs on demand.
    pub const fn new(brk: B) -> Self {
        Self { bins: [null_mut(); NUM_BINS], brk }
    }

    /// The bottom of the managed region.
    pub fn heap_lo(&self) -> *mut u8 {
        self.brk.heap_lo()
    }

    /// The top of the managed region (exclusive).
    pub fn heap_hi(&self) -> *mut u8 {
        self.brk.heap_hi()
    }

    /// Rewinds the break and empties the directory. The allocator must be
    /// re-`init`ed (or asked for memory, which does so) before reuse.
    pub fn reset_brk(&mut self) {
        self.brk.reset();
        self.bins = [null_mut(); NUM_BINS];
    }

    #[inline]
    fn terminal(&self) -> Chunk {
        debug_assert!(!self.bins[END_OF_HEAP_BIN].is_null());
        Chunk(self.bins[END_OF_HEAP_BIN])
    }

    /// Establishes the heap: one free chunk of [`INITIAL_CHUNK_SIZE`]
    /// covering the whole region, held in the end-of-heap slot.
    ///
    /// # Safety
    /// The directory must be empty: freshly constructed or reset, with no
    /// live allocations.
    pub unsafe fn init(&mut self) -> Result<(), ()> {
        debug_assert!(self.bins[END_OF_HEAP_BIN].is_null());

        let tail = self.brk.heap_hi();
        let pad = align_ptr_up(tail) as usize - tail as usize;

        let old = self.brk.sbrk(pad + INITIAL_CHUNK_SIZE + 2 * WORD).ok_or(())?;
        debug_assert_eq!(old, tail);

        let chunk = Chunk(align_ptr_up(old));
        // free, and flagged as having no free predecessor to stop
        // coalescing from walking below the heap
        chunk.write_header(INITIAL_CHUNK_SIZE, false, true);
        self.bins[END_OF_HEAP_BIN] = chunk.0;

        self.scan_for_errors();
        Ok(())
    }

    /// Allocates at least `size` writable bytes, aligned to [`ALIGN`].
    ///
    /// Initialises the heap on first use. Fails only when the break region
    /// refuses to grow far enough.
    ///
    /// # Safety
    /// The allocator must not have been corrupted by earlier misuse of
    /// [`free`](Mica::free) or [`realloc`](Mica::realloc).
    pub unsafe fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        if self.bins[END_OF_HEAP_BIN].is_null() {
            self.init()?;
        }
        self.scan_for_errors();

        let request = round_request(size)?;

        let chunk = if is_small(request) {
            self.take_small(request)
        } else if is_huge(request) {
            self.take_huge(request)
        } else {
            self.take_large(request)
        };

        let payload = match chunk {
            Some(chunk) => self.finish_carve(chunk, request),
            None => self.take_end_of_heap(request)?,
        };

        self.scan_for_errors();
        Ok(payload)
    }

    /// Releases an allocation, merging it with any free neighbour.
    ///
    /// # Safety
    /// `ptr` must be live and come from this allocator's
    /// [`malloc`](Mica::malloc) or [`realloc`](Mica::realloc).
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.scan_for_errors();

        let mut chunk = Chunk::from_payload(ptr.as_ptr());
        debug_assert!(chunk.is_in_use());
        chunk.clear_in_use();

        // recombine below
        if !chunk.is_prev_in_use() {
            let below = chunk.prev_heap();
            self.unlink_free(below);
            below.set_size(below.size() + chunk.size() + WORD);
            chunk = below;
        }

        self.free_coalesced(chunk);
        self.scan_for_errors();
    }

    /// Resizes an allocation to at least `new_size` bytes, preserving the
    /// payload prefix. The block is kept in place whenever a neighbour can
    /// soak up the difference; on failure the old block is untouched.
    ///
    /// # Safety
    /// As [`free`](Mica::free).
    pub unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, ()> {
        self.scan_for_errors();

        let request = round_request(new_size)?;
        let chunk = Chunk::from_payload(ptr.as_ptr());
        debug_assert!(chunk.is_in_use());
        let size = chunk.size();

        if request <= size {
            self.shrink_in_place(chunk, request);
            self.scan_for_errors();
            return Ok(ptr);
        }

        let top = self.terminal();
        let above = chunk.next_heap();
        let above_free = above != top && !above.is_in_use();
        let below_free = !chunk.is_prev_in_use();

        // grow over the next chunk
        if above_free && size + above.size() + WORD >= request {
            self.unlink_free(above);
            chunk.set_size(size + above.size() + WORD);
            self.trim_in_use(chunk, request);
            self.scan_for_errors();
            return Ok(ptr);
        }

        // grow over both neighbours, sliding the payload down
        if below_free && above_free {
            let below = chunk.prev_heap();
            let total = below.size() + size + above.size() + 2 * WORD;
            if total >= request {
                self.unlink_free(below);
                self.unlink_free(above);
                below.set_size(total);
                below.set_in_use();
                core::ptr::copy(chunk.payload(), below.payload(), size);
                self.trim_in_use(below, request);
                self.scan_for_errors();
                return Ok(NonNull::new_unchecked(below.payload()));
            }
        }

        // grow over the previous chunk alone
        if below_free && above != top {
            let below = chunk.prev_heap();
            let total = below.size() + size + WORD;
            if total >= request {
                self.unlink_free(below);
                below.set_size(total);
                below.set_in_use();
                core::ptr::copy(chunk.payload(), below.payload(), size);
                self.trim_in_use(below, request);
                self.scan_for_errors();
                return Ok(NonNull::new_unchecked(below.payload()));
            }
        }

        // grow into the end of the heap
        if above == top {
            let mut total = size + above.size() + WORD;
            if total < request + MIN_CHUNK {
                // nothing is committed unless the break moves
                self.brk.sbrk(request + EXTENSION_SIZE - total).ok_or(())?;
                total = request + EXTENSION_SIZE;
            }

            chunk.set_size(request);
            let rest = chunk.next_heap();
            rest.write_header(total - request - WORD, false, true);
            self.bins[END_OF_HEAP_BIN] = rest.0;

            self.scan_for_errors();
            return Ok(ptr);
        }

        // no neighbour suffices; relocate
        let new = self.malloc(new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), size);
        self.free(ptr);
        self.scan_for_errors();
        Ok(new)
    }

    // -- allocation search paths --

    /// Small request: the exact bin, the victim, then the configured
    /// forward walks. Returns a chunk removed from the books, or `None`
    /// to fall through to the end of the heap.
    unsafe fn take_small(&mut self, request: usize) -> Option<Chunk> {
        let bin = small_bin_of(request);
        if let Some(chunk) = llist::pop(&mut self.bins[bin]) {
            return Some(chunk);
        }

        if let Some(chunk) = self.take_victim(request) {
            return Some(chunk);
        }

        let end = (bin + 1 + SMALL_BIN_SEARCH_MAX).min(SMALL_BIN_LAST + 1);
        for i in bin + 1..end {
            if let Some(chunk) = llist::pop(&mut self.bins[i]) {
                return Some(chunk);
            }
        }

        self.scan_large_bins(LARGE_BIN_FIRST, request)
    }

    /// Large request: the victim, a best-fit in the matching tree, then
    /// the forward walk over higher trees.
    unsafe fn take_large(&mut self, request: usize) -> Option<Chunk> {
        if let Some(chunk) = self.take_victim(request) {
            return Some(chunk);
        }

        let bin = large_bin_of(request);
        if let Some(chunk) = tree::best_fit(self.bins[bin], request) {
            tree::remove(&mut self.bins[bin], chunk);
            return Some(chunk);
        }

        self.scan_large_bins(bin + 1, request)
    }

    /// Huge request: linear best-fit over the catch-all list.
    unsafe fn take_huge(&mut self, request: usize) -> Option<Chunk> {
        let mut best: Option<Chunk> = None;
        let mut best_size = usize::MAX;
        for chunk in llist::iter(self.bins[HUGE_BIN]) {
            let size = chunk.size();
            if size >= request && size < best_size {
                best = Some(chunk);
                best_size = size;
            }
        }

        let chunk = best?;
        llist::remove(&mut self.bins[HUGE_BIN], chunk);
        Some(chunk)
    }

    /// Claims the victim if it is big enough, emptying its slot.
    unsafe fn take_victim(&mut self, request: usize) -> Option<Chunk> {
        let victim = Chunk::some(self.bins[VICTIM_BIN])?;
        if victim.size() >= request {
            self.bins[VICTIM_BIN] = null_mut();
            Some(victim)
        } else {
            None
        }
    }

    /// Walks up to [`LARGE_BIN_SEARCH_MAX`] tree bins from `first`,
    /// removing the smallest chunk of the first bin that has any. Higher
    /// bins hold nothing below `request`.
    unsafe fn scan_large_bins(&mut self, first: usize, request: usize) -> Option<Chunk> {
        let end = (first + LARGE_BIN_SEARCH_MAX).min(LARGE_BIN_LAST + 1);
        for i in first..end {
            if let Some(chunk) = tree::smallest(self.bins[i]) {
                debug_assert!(chunk.size() >= request);
                tree::remove(&mut self.bins[i], chunk);
                return Some(chunk);
            }
        }
        None
    }

    // -- carving and recycling --

    /// Marks a chunk (already off the books) in use for `request`,
    /// splitting off the excess when it makes a whole chunk. The remainder
    /// becomes the victim.
    unsafe fn finish_carve(&mut self, chunk: Chunk, request: usize) -> NonNull<u8> {
        let size = chunk.size();
        debug_assert!(size >= request);

        if size >= request + MIN_CHUNK {
            chunk.set_size(request);
            let tail = chunk.next_heap();
            tail.write_header(size - request - WORD, false, true);

            let succ = tail.next_heap();
            debug_assert!(!succ.is_prev_in_use());
            succ.set_prev_size(tail.size());

            self.set_victim(tail);
        } else {
            chunk.next_heap().set_prev_in_use();
        }

        chunk.set_in_use();
        NonNull::new_unchecked(chunk.payload())
    }

    /// Parks `chunk` in the victim slot, recycling any previous occupant
    /// into its bin.
    unsafe fn set_victim(&mut self, chunk: Chunk) {
        let displaced = Chunk::some(self.bins[VICTIM_BIN]);
        self.bins[VICTIM_BIN] = chunk.0;
        if let Some(displaced) = displaced {
            self.insert_free(displaced);
        }
    }

    /// Serves `request` by splitting the end-of-heap chunk, growing the
    /// break first when the chunk couldn't otherwise be split. The
    /// end-of-heap slot always keeps a remainder.
    unsafe fn take_end_of_heap(&mut self, request: usize) -> Result<NonNull<u8>, ()> {
        let top = self.terminal();
        let mut size = top.size();

        if size < request + MIN_CHUNK {
            let delta = request + EXTENSION_SIZE - size;
            let old = self.brk.sbrk(delta).ok_or(())?;
            debug_assert_eq!(old, top.0.wrapping_add(2 * WORD + size));
            size += delta;
        }

        top.set_size(request);
        top.set_in_use();

        let rest = top.next_heap();
        rest.write_header(size - request - WORD, false, true);
        self.bins[END_OF_HEAP_BIN] = rest.0;

        Ok(NonNull::new_unchecked(top.payload()))
    }

    /// Takes a free chunk out of whatever holds it: the victim slot, its
    /// exact list, its tree, or the huge list. Not for the end-of-heap
    /// chunk, which callers handle specially.
    unsafe fn unlink_free(&mut self, chunk: Chunk) {
        debug_assert!(!chunk.is_in_use());
        debug_assert!(chunk != self.terminal());

        if chunk.0 == self.bins[VICTIM_BIN] {
            self.bins[VICTIM_BIN] = null_mut();
            return;
        }

        let size = chunk.size();
        if is_small(size) || is_huge(size) {
            llist::remove(&mut self.bins[bin_of_size(size)], chunk);
        } else {
            // tree nodes carry their slot, saving the recomputation
            let bin = chunk.bin_index() as usize;
            debug_assert_eq!(bin, bin_of_size(size));
            tree::remove(&mut self.bins[bin], chunk);
        }
    }

    /// Files a free chunk in the slot its size routes to.
    unsafe fn insert_free(&mut self, chunk: Chunk) {
        let size = chunk.size();
        let bin = bin_of_size(size);
        if is_small(size) || is_huge(size) {
            llist::push(&mut self.bins[bin], chunk);
        } else {
            tree::insert(&mut self.bins[bin], chunk, bin as u32);
        }
    }

    /// Final leg of freeing: `chunk` is free, unfiled, and already merged
    /// with its lower neighbour. Merges upward, which may promote the
    /// result to the end-of-heap chunk; otherwise restores the boundary
    /// tags and files it.
    unsafe fn free_coalesced(&mut self, chunk: Chunk) {
        let above = chunk.next_heap();

        if above == self.terminal() {
            chunk.set_size(chunk.size() + above.size() + WORD);
            self.bins[END_OF_HEAP_BIN] = chunk.0;
            return;
        }

        if !above.is_in_use() {
            self.unlink_free(above);
            chunk.set_size(chunk.size() + above.size() + WORD);
        }

        let succ = chunk.next_heap();
        succ.clear_prev_in_use();
        succ.set_prev_size(chunk.size());
        self.insert_free(chunk);
    }

    /// Splits an in-use chunk down to `request` where the remainder makes
    /// a whole chunk, freeing the remainder upward. With no split, the
    /// successor's flag is brought up to date (the chunk may just have
    /// absorbed a free neighbour).
    unsafe fn trim_in_use(&mut self, chunk: Chunk, request: usize) {
        let size = chunk.size();
        debug_assert!(size >= request && chunk.is_in_use());

        if size < request + MIN_CHUNK {
            chunk.next_heap().set_prev_in_use();
            return;
        }

        chunk.set_size(request);
        let tail = chunk.next_heap();
        tail.write_header(size - request - WORD, false, true);
        self.free_coalesced(tail);
    }

    /// The shrink half of realloc: split at `request` if possible and
    /// free the remainder upward; otherwise the block is left as is.
    unsafe fn shrink_in_place(&mut self, chunk: Chunk, request: usize) {
        let size = chunk.size();
        debug_assert!(size >= request && chunk.is_in_use());

        if size >= request + MIN_CHUNK {
            chunk.set_size(request);
            let tail = chunk.next_heap();
            tail.write_header(size - request - WORD, false, true);
            self.free_coalesced(tail);
        }
    }

    // -- debug self-check --

    #[cfg(not(debug_assertions))]
    fn scan_for_errors(&self) {}

    /// Walks the whole heap and the whole directory, asserting every
    /// boundary-tag, list, and tree invariant, and that the two agree on
    /// the set of free chunks.
    #[cfg(debug_assertions)]
    fn scan_for_errors(&self) {
        // caps runaway traversal of corrupted cyclic structures
        const SCAN_CAP: usize = 1 << 20;

        if self.bins[END_OF_HEAP_BIN].is_null() {
            for bin in &self.bins {
                assert!(bin.is_null());
            }
            return;
        }

        unsafe {
            let top = self.terminal();
            let victim = self.bins[VICTIM_BIN];

            // heap walk: every chunk between heap_lo and the end-of-heap
            // chunk, checking tags against each successor
            let mut chunk = Chunk(align_ptr_up(self.brk.heap_lo()));
            let mut free_in_heap = 0usize;
            let mut steps = 0usize;

            assert!(chunk.is_prev_in_use(), "first chunk claims a predecessor");

            loop {
                let size = chunk.size();
                assert!(size % ALIGN == 0 && size >= MIN_ALLOC);

                if chunk == top {
                    assert!(!chunk.is_in_use(), "end-of-heap chunk is marked in use");
                    assert_eq!(
                        chunk.0.wrapping_add(2 * WORD + size),
                        self.brk.heap_hi(),
                        "end-of-heap chunk does not reach the break"
                    );
                    free_in_heap += 1;
                    break;
                }

                let next = chunk.next_heap();
                assert_eq!(chunk.is_in_use(), next.is_prev_in_use());
                if !chunk.is_in_use() {
                    assert_eq!(next.prev_size(), size);
                    // the end-of-heap chunk is free too, so this covers
                    // bordering it as well
                    assert!(next.is_in_use(), "two adjacent free chunks");
                    free_in_heap += 1;
                }

                chunk = next;
                steps += 1;
                assert!(steps < SCAN_CAP);
            }

            // directory walk: count what the bins reach and check each
            // chunk is filed where its size says
            let mut reachable = 1usize; // the end-of-heap chunk, slot 0

            if let Some(victim) = Chunk::some(victim) {
                assert!(!victim.is_in_use());
                assert!(victim != top);
                reachable += 1;
            }

            let mut huge_steps = 0usize;
            for chunk in llist::iter(self.bins[HUGE_BIN]) {
                assert!(!chunk.is_in_use());
                assert!(is_huge(chunk.size()));
                reachable += 1;
                huge_steps += 1;
                assert!(huge_steps < SCAN_CAP);
            }

            for bin in SMALL_BIN_FIRST..=SMALL_BIN_LAST {
                let mut list_steps = 0usize;
                for chunk in llist::iter(self.bins[bin]) {
                    assert!(!chunk.is_in_use());
                    assert_eq!(chunk.size(), 8 * bin, "small chunk in the wrong bin");
                    reachable += 1;
                    list_steps += 1;
                    assert!(list_steps < SCAN_CAP);
                }
            }

            for bin in LARGE_BIN_FIRST..=LARGE_BIN_LAST {
                if let Some(root) = Chunk::some(self.bins[bin]) {
                    assert_eq!(root.parent(), Parent::Root);
                    assert_eq!(root.shift(), bins::root_shift(root.size()));
                    reachable += self.check_tree_node(root, bin);
                }
            }

            assert_eq!(
                free_in_heap, reachable,
                "the heap and the directory disagree on the free chunks"
            );
        }
    }

    /// Checks one tree node, its peer ring, and its subtrees; returns how
    /// many chunks they hold.
    #[cfg(debug_assertions)]
    unsafe fn check_tree_node(&self, node: Chunk, bin: usize) -> usize {
        let size = node.size();
        assert!(!node.is_in_use());
        assert!(!is_small(size) && !is_huge(size));
        assert_eq!(node.bin_index() as usize, bin);
        assert_eq!(large_bin_of(size), bin);

        let mut count = 1;
        let mut peer = node.next();
        while peer != node {
            assert_eq!(peer.parent(), Parent::Circle);
            assert_eq!(peer.size(), size);
            assert!(!peer.is_in_use());
            assert_eq!(peer.next().prev(), peer);
            count += 1;
            assert!(count < 1 << 20);
            peer = peer.next();
        }

        for index in 0..2 {
            if let Some(child) = node.child(index) {
                assert_ne!(child, node, "tree node is its own child");
                assert_ne!(node.child(0), node.child(1), "twin children");
                assert_eq!(child.parent(), Parent::Node(node));
                assert_eq!(child.shift(), node.shift().saturating_sub(1));
                count += self.check_tree_node(child, bin);
            }
        }

        count
    }
}
