//! Circular doubly-linked free-list operations.
//!
//! The exact-size bins and the huge bin are circular lists threaded
//! through the `next`/`prev` words of their free chunks. The directory
//! slot points at the current head, or is null for an empty bin.
//!
//! These operations are inherently unsafe: the links live inside the
//! chunks themselves, so a chunk must never be moved or repurposed while
//! it is on a list.

use super::chunk::Chunk;
use core::ptr::null_mut;

/// Pushes `chunk` as the new head of the list in `slot`.
#[inline]
pub unsafe fn push(slot: &mut *mut u8, chunk: Chunk) {
    match Chunk::some(*slot) {
        None => {
            chunk.set_next(chunk);
            chunk.set_prev(chunk);
        }
        Some(head) => {
            let back = head.prev();
            back.set_next(chunk);
            chunk.set_prev(back);
            chunk.set_next(head);
            head.set_prev(chunk);
        }
    }
    *slot = chunk.0;
}

/// Unlinks `chunk` from the list in `slot`, emptying the slot if it was
/// the last element and rotating the head off `chunk` if it pointed there.
#[inline]
pub unsafe fn remove(slot: &mut *mut u8, chunk: Chunk) {
    let next = chunk.next();

    if next == chunk {
        debug_assert_eq!(*slot, chunk.0);
        *slot = null_mut();
        return;
    }

    let prev = chunk.prev();
    prev.set_next(next);
    next.set_prev(prev);

    if *slot == chunk.0 {
        *slot = next.0;
    }
}

/// Removes and returns the head of the list in `slot`.
#[inline]
pub unsafe fn pop(slot: &mut *mut u8) -> Option<Chunk> {
    let head = Chunk::some(*slot)?;
    remove(slot, head);
    Some(head)
}

/// Iterates the circular list starting at `head`, visiting each chunk
/// once. A null `head` yields nothing.
///
/// # Safety
/// The list must stay intact for the iterator's lifetime; it is fine to
/// mutate chunks already yielded.
pub unsafe fn iter(head: *mut u8) -> Iter {
    Iter { head, cur: head }
}

/// An iterator over a circular free list. Created by [`iter`].
#[derive(Clone, Copy)]
pub struct Iter {
    head: *mut u8,
    cur: *mut u8,
}

impl Iterator for Iter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let cur = Chunk::some(self.cur)?;
        let next = unsafe { cur.next() };
        self.cur = if next.0 == self.head { null_mut() } else { next.0 };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr_utils::align_ptr_up;

    fn chunks<const N: usize>() -> [Chunk; N] {
        core::array::from_fn(|_| {
            let mem = Box::leak(vec![0u8; 128].into_boxed_slice());
            Chunk(align_ptr_up(mem.as_mut_ptr()))
        })
    }

    unsafe fn collect(head: *mut u8) -> Vec<Chunk> {
        iter(head).collect()
    }

    #[test]
    fn push_pop_single() {
        let [a] = chunks();
        let mut slot = null_mut();

        unsafe {
            push(&mut slot, a);
            assert_eq!(slot, a.0);
            assert_eq!(a.next(), a);
            assert_eq!(a.prev(), a);

            assert_eq!(pop(&mut slot), Some(a));
            assert!(slot.is_null());
            assert_eq!(pop(&mut slot), None);
        }
    }

    #[test]
    fn push_orders_like_a_stack() {
        let [a, b, c] = chunks();
        let mut slot = null_mut();

        unsafe {
            push(&mut slot, a);
            push(&mut slot, b);
            push(&mut slot, c);

            assert_eq!(collect(slot), vec![c, b, a]);
            assert_eq!(pop(&mut slot), Some(c));
            assert_eq!(pop(&mut slot), Some(b));
            assert_eq!(pop(&mut slot), Some(a));
            assert!(slot.is_null());
        }
    }

    #[test]
    fn remove_middle_and_head() {
        let [a, b, c] = chunks();
        let mut slot = null_mut();

        unsafe {
            push(&mut slot, a);
            push(&mut slot, b);
            push(&mut slot, c);

            remove(&mut slot, b);
            assert_eq!(collect(slot), vec![c, a]);

            // removing the head rotates the slot to the next element
            remove(&mut slot, c);
            assert_eq!(slot, a.0);
            assert_eq!(collect(slot), vec![a]);

            remove(&mut slot, a);
            assert!(slot.is_null());
        }
    }

    #[test]
    fn iter_of_empty_slot() {
        unsafe {
            assert_eq!(collect(null_mut()), vec![]);
        }
    }
}
