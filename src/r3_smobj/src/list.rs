//! Doubly-linked list stored in the shared region
//!
//! A list is a two-word header `{head, tail}`. An object placed on a list
//! starts with a two-word node `{next, previous}`, and the object's address
//! doubles as the node's address. All links are [`GlobalAddr`]s in the
//! canonical representation; an absent link is `None` (the word `0`).
//!
//! The list does not provide any locking. Every operation must be called with
//! whatever lock arbitrates the list instance already held by the caller. The
//! operations don't allocate, block, or fail.
//!
//! Mutating operations [observe] before reading links that another CPU might
//! have written and [publish] before returning, so a list operation
//! never leaves a node reachable from the list before the node's own links
//! have reached the bus.
//!
//! [observe]: crate::smem::Shm::observe
//! [publish]: crate::smem::Shm::publish
use core::fmt;

use crate::{
    addr::GlobalAddr,
    port::{PortBus, PortVisibility},
    smem::Shm,
};

/// The offset of a node's `next` field.
pub const NODE_NEXT: u32 = 0;
/// The offset of a node's `previous` field.
pub const NODE_PREV: u32 = 4;
/// The size of a node.
pub const NODE_SIZE: u32 = 8;

const LIST_HEAD: u32 = 0;
const LIST_TAIL: u32 = 4;
/// The size of a list header.
pub const LIST_SIZE: u32 = 8;

/// A list header in the shared region.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedList {
    addr: GlobalAddr,
}

impl fmt::Debug for SharedList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SharedList").field(&self.addr).finish()
    }
}

impl SharedList {
    /// Construct a handle to the list header at `addr`. This does not
    /// initialize the header.
    #[inline]
    pub const fn new(addr: GlobalAddr) -> Self {
        Self { addr }
    }

    #[inline]
    pub const fn addr(&self) -> GlobalAddr {
        self.addr
    }

    #[inline]
    fn head(&self) -> GlobalAddr {
        self.addr.field(LIST_HEAD)
    }

    #[inline]
    fn tail(&self) -> GlobalAddr {
        self.addr.field(LIST_TAIL)
    }

    /// Make the list empty.
    pub fn init<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) {
        shm.store_link(self.head(), None);
        shm.store_link(self.tail(), None);
        shm.publish();
    }

    /// Get the first node.
    #[inline]
    pub fn first<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> Option<GlobalAddr> {
        shm.load_link(self.head())
    }

    /// Get the last node.
    #[inline]
    pub fn last<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> Option<GlobalAddr> {
        shm.load_link(self.tail())
    }

    #[inline]
    pub fn is_empty<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> bool {
        self.first(shm).is_none()
    }

    /// Get the node following `node`.
    #[inline]
    pub fn next<P: PortBus + PortVisibility + ?Sized>(
        shm: Shm<'_, P>,
        node: GlobalAddr,
    ) -> Option<GlobalAddr> {
        shm.load_link(node.field(NODE_NEXT))
    }

    /// Get the node preceding `node`.
    #[inline]
    pub fn previous<P: PortBus + PortVisibility + ?Sized>(
        shm: Shm<'_, P>,
        node: GlobalAddr,
    ) -> Option<GlobalAddr> {
        shm.load_link(node.field(NODE_PREV))
    }

    /// Insert `node` after `after`, or at the head if `after` is `None`.
    ///
    /// `node` must not be linked to any list.
    pub fn insert_after<P: PortBus + PortVisibility + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        after: Option<GlobalAddr>,
        node: GlobalAddr,
    ) {
        // `after`'s successor might have been written by another CPU
        shm.observe();
        let next_link = match after {
            Some(after) => after.field(NODE_NEXT),
            None => self.head(),
        };
        let next = shm.load_link(next_link);

        // The node's own links must be on the bus before the node becomes
        // reachable
        shm.store_link(node.field(NODE_NEXT), next);
        shm.store_link(node.field(NODE_PREV), after);
        shm.publish();

        shm.store_link(next_link, Some(node));
        match next {
            // `node` is the new tail. This includes the case where the list was
            // empty.
            None => shm.store_link(self.tail(), Some(node)),
            Some(next) => shm.store_link(next.field(NODE_PREV), Some(node)),
        }
        shm.publish();
    }

    /// Insert `node` at the tail.
    ///
    /// `node` must not be linked to any list.
    pub fn append<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>, node: GlobalAddr) {
        shm.observe();
        let tail = self.last(shm);
        self.insert_after(shm, tail, node);
    }

    /// Unlink `node`, which must be linked to `self`.
    pub fn remove<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>, node: GlobalAddr) {
        shm.observe();
        let prev = Self::previous(shm, node);
        let next = Self::next(shm, node);

        match prev {
            None => shm.store_link(self.head(), next),
            Some(prev) => shm.store_link(prev.field(NODE_NEXT), next),
        }
        match next {
            None => shm.store_link(self.tail(), prev),
            Some(next) => shm.store_link(next.field(NODE_PREV), prev),
        }
        shm.publish();
    }

    /// Unlink the first node and return it.
    ///
    /// The returned node's own links are left untouched.
    pub fn pop_front<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> Option<GlobalAddr> {
        shm.observe();
        let node = self.first(shm)?;
        let next = Self::next(shm, node);

        shm.store_link(self.head(), next);
        match next {
            None => shm.store_link(self.tail(), None),
            Some(next) => shm.store_link(next.field(NODE_PREV), None),
        }
        shm.publish();

        Some(node)
    }

    /// Detach every node in one step and return the former head.
    ///
    /// The detached nodes remain chained by their `next` fields, and the last
    /// one's `next` is `None`.
    pub fn take_all<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> Option<GlobalAddr> {
        shm.observe();
        let head = self.first(shm);
        if head.is_some() {
            shm.store_link(self.head(), None);
            shm.store_link(self.tail(), None);
            shm.publish();
        }
        head
    }

    /// Move every node of `src` to the end of `self` in O(1). `src` becomes
    /// empty.
    pub fn concat<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>, src: &SharedList) {
        debug_assert_ne!(self, src);
        shm.observe();
        let Some(src_head) = src.first(shm) else {
            return;
        };
        let src_tail = src.last(shm);

        match self.last(shm) {
            None => shm.store_link(self.head(), Some(src_head)),
            Some(tail) => {
                shm.store_link(tail.field(NODE_NEXT), Some(src_head));
                shm.store_link(src_head.field(NODE_PREV), Some(tail));
            }
        }
        shm.store_link(self.tail(), src_tail);

        shm.store_link(src.head(), None);
        shm.store_link(src.tail(), None);
        shm.publish();
    }

    /// Iterate over the nodes from the head to the tail.
    pub fn iter<'a, P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'a, P>) -> Iter<'a, P> {
        shm.observe();
        Iter {
            shm,
            cursor: self.first(shm),
            link: NODE_NEXT,
        }
    }

    /// Iterate over the nodes from the tail to the head.
    pub fn iter_rev<'a, P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'a, P>) -> Iter<'a, P> {
        shm.observe();
        Iter {
            shm,
            cursor: self.last(shm),
            link: NODE_PREV,
        }
    }

    /// Call `f` for each node from the head to the tail until it returns
    /// `false`. Returns the node for which `f` returned `false`.
    pub fn for_each<P: PortBus + PortVisibility + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        mut f: impl FnMut(GlobalAddr) -> bool,
    ) -> Option<GlobalAddr> {
        self.iter(shm).find(|&node| !f(node))
    }

    /// Count the nodes.
    pub fn count<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) -> usize {
        self.iter(shm).count()
    }
}

/// Iterator returned by [`SharedList::iter`] and [`SharedList::iter_rev`].
pub struct Iter<'a, P: ?Sized> {
    shm: Shm<'a, P>,
    cursor: Option<GlobalAddr>,
    link: u32,
}

impl<P: PortBus + PortVisibility + ?Sized> Iterator for Iter<'_, P> {
    type Item = GlobalAddr;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor?;
        self.cursor = self.shm.load_link(node.field(self.link));
        Some(node)
    }
}
