//! Every live guarded block, as an intrusive doubly linked list threaded
//! through the block headers.
//!
//! All links are only ever read or written with the registry lock held. The
//! system allocation itself happens outside the lock; only the O(1) link and
//! unlink (and the diagnostic walks) are serialised.

use std::{
    marker::PhantomData,
    ptr::{self, NonNull},
};

use super::{
    guarded::{BlockRef, GuardedHeader},
    spin::{SpinMutex, SpinMutexGuard},
};
use crate::error::CorruptTags;

struct List {
    first: *mut GuardedHeader,
    last: *mut GuardedHeader,
    len: usize,
}

// SAFETY: the list only holds pointers to headers owned by the allocator, and
//         those are only touched with the registry lock held.
unsafe impl Send for List {}

pub struct BlockRegistry {
    list: SpinMutex<List>,
}

/// Result of looking a header up in the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
    /// The walk ran into a node whose tags are broken before finding the
    /// header. Its links cannot be trusted, so the walk stopped there.
    Corrupt { addr: usize, tags: CorruptTags },
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            list: SpinMutex::new(List {
                first: ptr::null_mut(),
                last: ptr::null_mut(),
                len: 0,
            }),
        }
    }

    /// Append a freshly written header.
    ///
    /// # Safety
    ///
    /// `block` must be a valid header that is not linked yet.
    pub unsafe fn link(&self, block: BlockRef) {
        let mut list = self.list.lock();
        let node = block.as_ptr();
        unsafe {
            ptr::addr_of_mut!((*node).prev).write(list.last);
            ptr::addr_of_mut!((*node).next).write(ptr::null_mut());
            if let Some(last) = NonNull::new(list.last) {
                ptr::addr_of_mut!((*last.as_ptr()).next).write(node);
            } else {
                list.first = node;
            }
        }
        list.last = node;
        list.len += 1;
    }

    /// Remove a header linked by [`link()`](Self::link).
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into this registry.
    pub unsafe fn unlink(&self, block: BlockRef) {
        let mut list = self.list.lock();
        let node = block.as_ptr();
        unsafe {
            let prev = ptr::addr_of!((*node).prev).read();
            let next = ptr::addr_of!((*node).next).read();
            match NonNull::new(prev) {
                Some(prev) => ptr::addr_of_mut!((*prev.as_ptr()).next).write(next),
                None => list.first = next,
            }
            match NonNull::new(next) {
                Some(next) => ptr::addr_of_mut!((*next.as_ptr()).prev).write(prev),
                None => list.last = prev,
            }
            ptr::addr_of_mut!((*node).prev).write(ptr::null_mut());
            ptr::addr_of_mut!((*node).next).write(ptr::null_mut());
        }
        list.len -= 1;
    }

    /// Number of linked blocks
    pub fn len(&self) -> usize {
        self.list.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hold the registry lock for a walk. Nothing can be linked or unlinked
    /// until the guard is dropped, so **do not allocate from this allocator
    /// while holding it**.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            list: self.list.lock(),
        }
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RegistryGuard<'a> {
    list: SpinMutexGuard<'a, List>,
}

impl RegistryGuard<'_> {
    pub fn len(&self) -> usize {
        self.list.len
    }

    pub fn is_empty(&self) -> bool {
        self.list.len == 0
    }

    /// Walk the list front to back. The walk stops early (yielding the
    /// offending node as `Err`) at the first node with broken header tags,
    /// since its links are garbage.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.list.first,
            _guard: PhantomData,
        }
    }

    /// Linear scan for `block`.
    pub fn find(&self, block: BlockRef) -> Lookup {
        for node in self.iter() {
            match node {
                Ok(node) if node == block => return Lookup::Found,
                Ok(_) => {}
                // our own block may well be the broken one
                Err(node) if node == block => return Lookup::Found,
                Err(node) => {
                    return Lookup::Corrupt {
                        addr: node.payload().as_ptr() as usize,
                        tags: node.corrupt_header_tags(),
                    }
                }
            }
        }
        Lookup::NotFound
    }
}

pub struct Iter<'a> {
    next: *mut GuardedHeader,
    _guard: PhantomData<&'a List>,
}

impl Iterator for Iter<'_> {
    type Item = Result<BlockRef, BlockRef>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.next)?;
        // SAFETY: every linked node was a valid header when it was linked and
        //         stays allocated until it is unlinked, which needs the lock
        //         we are holding.
        let node = unsafe { BlockRef::from_header(node) };
        if node.corrupt_header_tags().any() {
            self.next = ptr::null_mut();
            return Some(Err(node));
        }
        self.next = node.next();
        Some(Ok(node))
    }
}
