//! Intrusive circular doubly-linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! The link fields live inside the payload records, so linking and unlinking
//! never allocate, and a record can be spliced out of a list in O(1) given
//! only its own links. Lists are operated on through [`ListAccessorCell`],
//! which reads and writes both the header and the per-element links through
//! a [`CellLike`] key. The key is what makes the same splice code usable
//! with plain `Cell`s in tests and with CPU-Lock-guarded cells in the
//! kernel.
//!
//! A header whose `first` field is `None` is an empty list. Since that is
//! also the all-zeroes bit pattern, a statically allocated list is usable
//! from the very first operation, before any initialization code has run.
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
///
/// `INIT` (all zeroes) is the empty list. An element's links always form a
/// full circle: the first element's `prev` is the last element, so both
/// ends are reachable from the header in O(1).
#[derive(Debug, Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to the neighbor elements.
///
/// An element stores `Option<Link<Index>>`; `None` means the element is
/// detached. When the element is linked, both fields refer to elements of
/// the same list (possibly the element itself, if it's alone).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

impl<Index: Init> Init for Link<Index> {
    const INIT: Self = Self {
        prev: Index::INIT,
        next: Index::INIT,
    };
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Print the address, not the pointee. The pointee might contain a
        // cyclic reference to the list, which would make `Debug` recurse
        // forever.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Circular linked list header whose elements are identified by
/// `Ident<&'static Element>`.
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor elements with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// An abstract readable and writable cell, unlocked by a `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    fn modify(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target))
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        f(&mut x);
        self.set(key, x);
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<'a, Element: Clone, Key, Keyhole> CellLike<&'a mut Key>
    for tokenlock::UnsyncTokenLock<Element, Keyhole>
where
    Key: tokenlock::Token<Keyhole> + tokenlock::Unsync,
{
    type Target = Element;

    fn get(&self, key: &&'a mut Key) -> Self::Target {
        self.read(*key).clone()
    }
    fn set(&self, key: &mut &'a mut Key, value: Self::Target) {
        self.replace(*key, value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// `CellLike`-based accessor to a linked list.
///
/// `head` is the cell holding the [`ListHead`], `pool` maps an `Index` to an
/// element, and `map_link` projects an element to the cell holding its
/// [`Link`]s.
#[derive(Debug)]
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|p| {
            (self.map_link)(&self.pool[p])
                .get(&self.cell_key)
                .unwrap()
                .prev
        })
    }

    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    pub fn back_data(&self) -> Option<&Element> {
        self.back().map(|p| &self.pool[p])
    }

    /// Get the element after `item`, or `None` if `item` is the last
    /// element.
    pub fn next(&self, item: Index) -> Option<Index> {
        let next = (self.map_link)(&self.pool[item])
            .get(&self.cell_key)
            .unwrap()
            .next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// Get the element before `item`, or `None` if `item` is the first
    /// element.
    pub fn prev(&self, item: Index) -> Option<Index> {
        if self.head().first.as_ref() == Some(&item) {
            None
        } else {
            Some(
                (self.map_link)(&self.pool[item])
                    .get(&self.cell_key)
                    .unwrap()
                    .prev,
            )
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or at
    /// the list's back (if `at` is `None`).
    ///
    /// `item` must be detached.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(
            (self.map_link)(&self.pool[item.clone()])
                .get(&self.cell_key)
                .is_none(),
            "item is already linked"
        );

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            // Splice `item` between `next.prev` and `next`. The ordering of
            // the writes does not matter here because the key makes them
            // atomic as a whole.
            let prev = (self.map_link)(&self.pool[next.clone()])
                .get(&self.cell_key)
                .unwrap()
                .prev;
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().next = item.clone()
            });
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().prev = item.clone()
            });
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            // The list is empty. `item` becomes the sole element, pointing
            // at itself in both directions.
            let link = (self.map_link)(&self.pool[item.clone()]);
            link.set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at);
    }

    /// Remove `item` from the list. Returns `item`.
    ///
    /// `item` must be linked in this list.
    pub fn remove(&mut self, item: Index) -> Index {
        debug_assert!(
            (self.map_link)(&self.pool[item.clone()])
                .get(&self.cell_key)
                .is_some(),
            "item is not linked"
        );

        let link: Link<Index> = {
            let link_ref = (self.map_link)(&self.pool[item.clone()]);
            let mut head = self.head();
            if head.first.as_ref() == Some(&item) {
                let next = link_ref.get(&self.cell_key).unwrap().next;
                if next == item {
                    // The list just became empty.
                    head.first = None;
                    self.set_head(head);

                    link_ref.set(&mut self.cell_key, None);
                    return item;
                }

                // Move the head pointer.
                head.first = Some(next);
                self.set_head(head);
            }

            link_ref.get(&self.cell_key).unwrap()
        };

        // Make the neighbors point to each other, then nullify the removed
        // element's links so that a later `unlink` is a no-op and reuse on
        // another list has to be an explicit relink.
        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().next = link.next.clone()
        });
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().prev = link.prev.clone()
        });
        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        item
    }

    /// Remove `item` if it is linked. Unlike [`Self::remove`], a detached
    /// `item` is a no-op, so the operation is idempotent.
    pub fn unlink(&mut self, item: Index) -> bool {
        if (self.map_link)(&self.pool[item.clone()])
            .get(&self.cell_key)
            .is_none()
        {
            return false;
        }
        self.remove(item);
        true
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        self.front().map(|item| self.remove(item))
    }

    pub fn pop_back(&mut self) -> Option<Index> {
        self.back().map(|item| self.remove(item))
    }

    pub fn iter(&self) -> Iter<'_, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of [`ListAccessorCell`].
#[derive(Debug)]
pub struct Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
    accessor: &'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>,
    next: Option<Index>,
}

impl<'b, 'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = (Index, &'b Element);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = self.accessor.next(next.clone());
        Some((next.clone(), &self.accessor.pool[next]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::cell::Cell;

    type El = (u32, Cell<Option<Link<usize>>>);

    fn push(pool: &mut Vec<El>, x: u32) -> usize {
        let i = pool.len();
        pool.push((x, Cell::new(None)));
        i
    }

    macro_rules! accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new($head, $pool, |(_, link): &El| link, ())
        };
    }

    #[test]
    fn basic() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptr1 = push(&mut pool, 1);
        accessor!(&head, &pool).push_back(ptr1);

        let ptr2 = push(&mut pool, 2);
        accessor!(&head, &pool).push_back(ptr2);

        let ptr3 = push(&mut pool, 3);
        accessor!(&head, &pool).push_front(ptr3);

        let mut accessor = accessor!(&head, &pool);
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);
        assert_eq!(accessor.back_data().unwrap().0, 2);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.next(ptr3), Some(ptr1));
        assert_eq!(accessor.next(ptr2), None);
        assert_eq!(accessor.prev(ptr1), Some(ptr3));
        assert_eq!(accessor.prev(ptr3), None);

        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);

        assert!(accessor.is_empty());
    }

    #[test]
    fn drain() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptrs = [
            push(&mut pool, 1),
            push(&mut pool, 2),
            push(&mut pool, 3),
        ];

        accessor!(&head, &pool).push_back(ptrs[0]);
        accessor!(&head, &pool).push_back(ptrs[1]);
        accessor!(&head, &pool).push_front(ptrs[2]);

        while accessor!(&head, &pool).pop_front().is_some() {}

        assert_eq!(head.get().first, None);
        for &ptr in &ptrs {
            assert!(pool[ptr].1.get().is_none());
        }
    }

    #[test]
    fn unlink_detached_is_noop() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let a = push(&mut pool, 10);
        let b = push(&mut pool, 20);
        accessor!(&head, &pool).push_back(a);

        // `b` was never linked; unlinking it must not disturb the list.
        assert!(!accessor!(&head, &pool).unlink(b));
        assert_eq!(accessor!(&head, &pool).front(), Some(a));

        // A second unlink of `a` after the first is also a no-op.
        assert!(accessor!(&head, &pool).unlink(a));
        assert!(!accessor!(&head, &pool).unlink(a));
        assert!(accessor!(&head, &pool).is_empty());
    }

    /// A modifying operation on a list.
    #[derive(Debug)]
    enum Cmd {
        PushBack(usize),
        PushFront(usize),
        Unlink(usize),
    }

    /// Map random bytes to operations on a list over `num_elements`
    /// preallocated elements.
    fn interpret(bytecode: &[u8], num_elements: usize) -> Vec<Cmd> {
        bytecode
            .chunks_exact(2)
            .map(|instr| {
                let i = instr[1] as usize % num_elements;
                match instr[0] % 3 {
                    0 => Cmd::PushBack(i),
                    1 => Cmd::PushFront(i),
                    _ => Cmd::Unlink(i),
                }
            })
            .collect()
    }

    /// Check the structural invariants of the list against a reference
    /// model: following `next` from the first element visits every model
    /// element in order and returns to the first in exactly `len` steps;
    /// the same holds backwards via `prev`; every element's neighbor links
    /// are mutually consistent; detached elements have no links.
    fn check_invariants(head: &Cell<ListHead<usize>>, pool: &Vec<El>, model: &Vec<usize>) {
        let accessor = accessor!(head, pool);
        assert_eq!(accessor.is_empty(), model.is_empty());

        let forward: Vec<usize> = accessor.iter().map(|(i, _)| i).collect();
        assert_eq!(&forward, model);

        if let Some(&first) = model.first() {
            // Walk the raw circle in both directions.
            let mut i = first;
            for step in 0..model.len() {
                let link = pool[i].1.get().unwrap();
                assert_eq!(pool[link.next].1.get().unwrap().prev, i);
                assert_eq!(pool[link.prev].1.get().unwrap().next, i);
                assert_eq!(i, model[step]);
                i = link.next;
            }
            assert_eq!(i, first, "forward walk did not close the circle");

            let mut i = pool[first].1.get().unwrap().prev;
            for step in (0..model.len()).rev() {
                assert_eq!(i, model[step]);
                i = pool[i].1.get().unwrap().prev;
            }
        }

        for (i, (_, link)) in pool.iter().enumerate() {
            assert_eq!(link.get().is_some(), model.contains(&i));
        }
    }

    #[quickcheck]
    fn qc_structural_invariants(bytecode: Vec<u8>) {
        let mut pool = Vec::new();
        for i in 0..8 {
            push(&mut pool, i);
        }
        let head = Cell::new(ListHead::new());
        let mut model: Vec<usize> = Vec::new();

        for cmd in interpret(&bytecode, pool.len()) {
            match cmd {
                Cmd::PushBack(i) => {
                    if !model.contains(&i) {
                        accessor!(&head, &pool).push_back(i);
                        model.push(i);
                    }
                }
                Cmd::PushFront(i) => {
                    if !model.contains(&i) {
                        accessor!(&head, &pool).push_front(i);
                        model.insert(0, i);
                    }
                }
                Cmd::Unlink(i) => {
                    let did = accessor!(&head, &pool).unlink(i);
                    assert_eq!(did, model.contains(&i));
                    model.retain(|&x| x != i);
                }
            }
            check_invariants(&head, &pool, &model);
        }
    }

    #[quickcheck]
    fn qc_link_unlink_round_trip(bytecode: Vec<u8>, victim: u8) {
        let mut pool = Vec::new();
        for i in 0..8 {
            push(&mut pool, i);
        }
        let head = Cell::new(ListHead::new());
        let mut model: Vec<usize> = Vec::new();

        // Build an arbitrary list state.
        for cmd in interpret(&bytecode, pool.len()) {
            if let Cmd::PushBack(i) = cmd {
                if !model.contains(&i) {
                    accessor!(&head, &pool).push_back(i);
                    model.push(i);
                }
            }
        }

        // Linking an element and unlinking it again must restore the exact
        // previous order.
        let victim = victim as usize % pool.len();
        if !model.contains(&victim) {
            let before: Vec<usize> = accessor!(&head, &pool).iter().map(|(i, _)| i).collect();
            accessor!(&head, &pool).push_back(victim);
            accessor!(&head, &pool).unlink(victim);
            let after: Vec<usize> = accessor!(&head, &pool).iter().map(|(i, _)| i).collect();
            assert_eq!(before, after);
            assert!(pool[victim].1.get().is_none());
        }
    }
}
