//! On-heap chunk layout and boundary-tag access.
//!
//! A chunk is addressed by its base pointer, which points at its
//! `prev_size` word. The word after it is `cur_size`, carrying the chunk's
//! size in its high bits and the flags below. The payload of an in-use
//! chunk starts two words in and runs for `size` bytes, its final word
//! physically overlaying the successor's `prev_size` slot; that slot only
//! means anything while this chunk is free.
//!
//! Free chunks repurpose the payload for link fields:
//!
//! ```text
//! base + 0*WORD   prev_size     (valid while the previous chunk is free)
//! base + 1*WORD   cur_size | flags
//! base + 2*WORD   next          \ circular list through the bin,
//! base + 3*WORD   prev          / or the equal-size peer ring
//! base + 4*WORD   children[0]   \
//! base + 5*WORD   children[1]    | tree linkage, large chunks only
//! base + 6*WORD   parent         |
//! base + 7*WORD   bin, shift    /
//! ```

use crate::ptr_utils::{ALIGN, WORD};

const CUR_INUSE: usize = 1 << 0;
const PREV_INUSE: usize = 1 << 1;
const FLAG_MASK: usize = ALIGN - 1;

const PAYLOAD_OFFSET: usize = 2 * WORD;
const NEXT_OFFSET: usize = 2 * WORD;
const PREV_OFFSET: usize = 3 * WORD;
const CHILDREN_OFFSET: usize = 4 * WORD;
const PARENT_OFFSET: usize = 6 * WORD;
const BIN_OFFSET: usize = 7 * WORD;
const SHIFT_OFFSET: usize = 7 * WORD + 4;

/// The `parent` word of a free large chunk, decoded.
///
/// Equal-size peers ring through `next`/`prev`; only one of them, the
/// representative, is wired into the tree. The other peers carry
/// [`Parent::Circle`]. A representative is either the bin root
/// ([`Parent::Root`]) or a child of another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// A peer that is not the representative of its size.
    Circle,
    /// The representative at the root of its bin's tree.
    Root,
    /// A representative whose parent is another tree node.
    Node(Chunk),
}

// chunk bases are ALIGN-aligned, so a small odd constant can never
// collide with a real parent pointer
const ROOT_SENTINEL: usize = 0x1;

/// A chunk base pointer.
///
/// All accessors are unsafe: they read and write the header words and link
/// fields relative to the base, and it is on the caller that the pointer
/// designates a live chunk of the managed heap in the state (free, large)
/// the accessed field requires.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Chunk(pub *mut u8);

impl core::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("Chunk({:p})", self.0))
    }
}

impl Chunk {
    /// `None` for null, `Some` otherwise. Bin slots store null for "empty".
    #[inline]
    pub fn some(ptr: *mut u8) -> Option<Chunk> {
        if ptr.is_null() { None } else { Some(Chunk(ptr)) }
    }

    /// The address handed to the user: two words past the base.
    #[inline]
    pub fn payload(self) -> *mut u8 {
        self.0.wrapping_add(PAYLOAD_OFFSET)
    }

    /// Recovers the chunk base from a user pointer.
    #[inline]
    pub fn from_payload(ptr: *mut u8) -> Chunk {
        Chunk(ptr.wrapping_sub(PAYLOAD_OFFSET))
    }

    #[inline]
    fn cur_word(self) -> *mut usize {
        self.0.wrapping_add(WORD).cast()
    }

    #[inline]
    fn prev_word(self) -> *mut usize {
        self.0.cast()
    }

    /// The chunk's payload capacity in bytes.
    #[inline]
    pub unsafe fn size(self) -> usize {
        self.cur_word().read() & !FLAG_MASK
    }

    /// Rewrites the size, preserving the flag bits.
    #[inline]
    pub unsafe fn set_size(self, size: usize) {
        debug_assert!(size & FLAG_MASK == 0);
        let flags = self.cur_word().read() & FLAG_MASK;
        self.cur_word().write(size | flags);
    }

    /// Initialises the `cur_size` word outright.
    #[inline]
    pub unsafe fn write_header(self, size: usize, in_use: bool, prev_in_use: bool) {
        debug_assert!(size & FLAG_MASK == 0);
        let mut word = size;
        if in_use {
            word |= CUR_INUSE;
        }
        if prev_in_use {
            word |= PREV_INUSE;
        }
        self.cur_word().write(word);
    }

    #[inline]
    pub unsafe fn is_in_use(self) -> bool {
        self.cur_word().read() & CUR_INUSE != 0
    }

    #[inline]
    pub unsafe fn set_in_use(self) {
        self.cur_word().write(self.cur_word().read() | CUR_INUSE);
    }

    #[inline]
    pub unsafe fn clear_in_use(self) {
        self.cur_word().write(self.cur_word().read() & !CUR_INUSE);
    }

    #[inline]
    pub unsafe fn is_prev_in_use(self) -> bool {
        self.cur_word().read() & PREV_INUSE != 0
    }

    #[inline]
    pub unsafe fn set_prev_in_use(self) {
        self.cur_word().write(self.cur_word().read() | PREV_INUSE);
    }

    #[inline]
    pub unsafe fn clear_prev_in_use(self) {
        self.cur_word().write(self.cur_word().read() & !PREV_INUSE);
    }

    /// The size of the preceding chunk. Only meaningful while the
    /// preceding chunk is free.
    #[inline]
    pub unsafe fn prev_size(self) -> usize {
        self.prev_word().read()
    }

    #[inline]
    pub unsafe fn set_prev_size(self, size: usize) {
        debug_assert!(size & FLAG_MASK == 0);
        self.prev_word().write(size);
    }

    /// The chunk directly after this one in the heap.
    #[inline]
    pub unsafe fn next_heap(self) -> Chunk {
        Chunk(self.0.add(self.size() + WORD))
    }

    /// The chunk directly before this one in the heap.
    ///
    /// Only valid while `PREV_INUSE` is clear; otherwise `prev_size` holds
    /// the tail of the previous chunk's payload.
    #[inline]
    pub unsafe fn prev_heap(self) -> Chunk {
        debug_assert!(!self.is_prev_in_use());
        Chunk(self.0.sub(self.prev_size() + WORD))
    }

    // link fields of free chunks

    #[inline]
    pub unsafe fn next(self) -> Chunk {
        Chunk(self.0.add(NEXT_OFFSET).cast::<*mut u8>().read())
    }

    #[inline]
    pub unsafe fn set_next(self, chunk: Chunk) {
        self.0.add(NEXT_OFFSET).cast::<*mut u8>().write(chunk.0);
    }

    #[inline]
    pub unsafe fn prev(self) -> Chunk {
        Chunk(self.0.add(PREV_OFFSET).cast::<*mut u8>().read())
    }

    #[inline]
    pub unsafe fn set_prev(self, chunk: Chunk) {
        self.0.add(PREV_OFFSET).cast::<*mut u8>().write(chunk.0);
    }

    // tree fields of free large chunks

    #[inline]
    pub unsafe fn child(self, index: usize) -> Option<Chunk> {
        debug_assert!(index < 2);
        Chunk::some(self.0.add(CHILDREN_OFFSET + index * WORD).cast::<*mut u8>().read())
    }

    #[inline]
    pub unsafe fn set_child(self, index: usize, child: Option<Chunk>) {
        debug_assert!(index < 2);
        let ptr = child.map_or(core::ptr::null_mut(), |c| c.0);
        self.0.add(CHILDREN_OFFSET + index * WORD).cast::<*mut u8>().write(ptr);
    }

    /// Points `children[0]` or `children[1]`, whichever holds `old`, at `new`.
    #[inline]
    pub unsafe fn replace_child(self, old: Chunk, new: Option<Chunk>) {
        if self.child(0) == Some(old) {
            self.set_child(0, new);
        } else {
            debug_assert_eq!(self.child(1), Some(old));
            self.set_child(1, new);
        }
    }

    #[inline]
    pub unsafe fn parent(self) -> Parent {
        let word = self.0.add(PARENT_OFFSET).cast::<usize>().read();
        match word {
            0 => Parent::Circle,
            ROOT_SENTINEL => Parent::Root,
            _ => Parent::Node(Chunk(word as *mut u8)),
        }
    }

    #[inline]
    pub unsafe fn set_parent(self, parent: Parent) {
        let word = match parent {
            Parent::Circle => 0,
            Parent::Root => ROOT_SENTINEL,
            Parent::Node(chunk) => chunk.0 as usize,
        };
        self.0.add(PARENT_OFFSET).cast::<usize>().write(word);
    }

    /// The directory slot this free large chunk lives in.
    #[inline]
    pub unsafe fn bin_index(self) -> u32 {
        self.0.add(BIN_OFFSET).cast::<u32>().read()
    }

    #[inline]
    pub unsafe fn set_bin_index(self, bin: u32) {
        self.0.add(BIN_OFFSET).cast::<u32>().write(bin);
    }

    /// The bit position deciding left or right below this tree node.
    #[inline]
    pub unsafe fn shift(self) -> u32 {
        self.0.add(SHIFT_OFFSET).cast::<u32>().read()
    }

    #[inline]
    pub unsafe fn set_shift(self, shift: u32) {
        self.0.add(SHIFT_OFFSET).cast::<u32>().write(shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> *mut u8 {
        let mem = Box::leak(vec![0u8; 512].into_boxed_slice());
        crate::ptr_utils::align_ptr_up(mem.as_mut_ptr())
    }

    #[test]
    fn header_round_trip() {
        let chunk = Chunk(buffer());

        unsafe {
            chunk.write_header(96, true, false);
            assert_eq!(chunk.size(), 96);
            assert!(chunk.is_in_use());
            assert!(!chunk.is_prev_in_use());

            chunk.set_prev_in_use();
            chunk.set_size(48);
            assert_eq!(chunk.size(), 48);
            assert!(chunk.is_in_use());
            assert!(chunk.is_prev_in_use());

            chunk.clear_in_use();
            assert!(!chunk.is_in_use());
            assert!(chunk.is_prev_in_use());
        }
    }

    #[test]
    fn payload_round_trip() {
        let chunk = Chunk(buffer());
        assert_eq!(Chunk::from_payload(chunk.payload()), chunk);
    }

    #[test]
    fn heap_traversal() {
        let chunk = Chunk(buffer());

        unsafe {
            chunk.write_header(40, false, true);
            let next = chunk.next_heap();
            assert_eq!(next.0 as usize - chunk.0 as usize, 48);

            next.write_header(64, true, false);
            next.set_prev_size(40);
            assert_eq!(next.prev_heap(), chunk);
        }
    }

    #[test]
    fn parent_encoding() {
        let chunk = Chunk(buffer());
        let other = Chunk(buffer());

        unsafe {
            chunk.set_parent(Parent::Circle);
            assert_eq!(chunk.parent(), Parent::Circle);
            chunk.set_parent(Parent::Root);
            assert_eq!(chunk.parent(), Parent::Root);
            chunk.set_parent(Parent::Node(other));
            assert_eq!(chunk.parent(), Parent::Node(other));
        }
    }

    #[test]
    fn bin_and_shift_are_independent() {
        let chunk = Chunk(buffer());

        unsafe {
            chunk.set_bin_index(33);
            chunk.set_shift(6);
            assert_eq!(chunk.bin_index(), 33);
            assert_eq!(chunk.shift(), 6);
            chunk.set_shift(5);
            assert_eq!(chunk.bin_index(), 33);
        }
    }
}
