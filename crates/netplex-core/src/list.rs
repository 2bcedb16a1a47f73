//! Intrusive doubly-linked lists over arena indices
//!
//! The reactor's handle table and the timing wheel's timer table are flat
//! arenas. Both need O(1) membership lists on top: the reactor's
//! active-handle list and the wheel's per-tick buckets. Nodes embed their
//! prev/next linkage as u32 indices and a [`ListHead`] carries head/tail,
//! so there are no heap nodes, no pointers and no unsafe.
//!
//! A node's links cannot distinguish "detached" from "sole element" (both
//! read as NIL/NIL), so list membership itself is tracked by the owner
//! (the wheel uses the timer's tick field, the reactor its slot state).
//! `remove` must only be called for a node currently on the list.

/// Index sentinel for "no node"
pub const NIL: u32 = u32::MAX;

/// Embedded linkage, one per node per list it can join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    pub prev: u32,
    pub next: u32,
}

impl Links {
    pub const fn new() -> Self {
        Links {
            prev: NIL,
            next: NIL,
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Links::new()
    }
}

/// Arena nodes expose their linkage through this trait
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Head/tail of one intrusive list
#[derive(Debug, Clone, Copy)]
pub struct ListHead {
    head: u32,
    tail: u32,
    len: u32,
}

impl ListHead {
    pub const fn new() -> Self {
        ListHead {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Front node index, NIL when empty
    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Back node index, NIL when empty
    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Append a detached node
    pub fn push_back<N: Linked>(&mut self, arena: &mut [N], id: u32) {
        debug_assert!(id != NIL);
        let old_tail = self.tail;
        {
            let links = arena[id as usize].links_mut();
            links.prev = old_tail;
            links.next = NIL;
        }
        if old_tail == NIL {
            self.head = id;
        } else {
            arena[old_tail as usize].links_mut().next = id;
        }
        self.tail = id;
        self.len += 1;
    }

    /// Detach and return the front node
    pub fn pop_front<N: Linked>(&mut self, arena: &mut [N]) -> Option<u32> {
        if self.head == NIL {
            return None;
        }
        let id = self.head;
        self.remove(arena, id);
        Some(id)
    }

    /// Detach a node known to be on this list
    pub fn remove<N: Linked>(&mut self, arena: &mut [N], id: u32) {
        debug_assert!(self.len > 0);
        let (prev, next) = {
            let links = arena[id as usize].links();
            (links.prev, links.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            arena[prev as usize].links_mut().next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            arena[next as usize].links_mut().prev = prev;
        }
        let links = arena[id as usize].links_mut();
        links.prev = NIL;
        links.next = NIL;
        self.len -= 1;
    }

    /// Front-to-back index iterator
    ///
    /// The arena must not change while iterating; when the loop body
    /// removes nodes, collect the ids first.
    pub fn iter<'a, N: Linked>(&self, arena: &'a [N]) -> ListIter<'a, N> {
        ListIter {
            arena,
            cur: self.head,
        }
    }
}

impl Default for ListHead {
    fn default() -> Self {
        ListHead::new()
    }
}

pub struct ListIter<'a, N: Linked> {
    arena: &'a [N],
    cur: u32,
}

impl<'a, N: Linked> Iterator for ListIter<'a, N> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            return None;
        }
        let id = self.cur;
        self.cur = self.arena[id as usize].links().next;
        Some(id)
    }
}
