//! The timestamp queue: pending timeouts and software timer expirations in
//! chronological order.
//!
//! Each entry is a [`TimestampNode`] carrying an absolute tick count and a
//! variant-specific effect. The queue is kept in nondecreasing timestamp
//! order by inserting from the tail backward, which keeps the common case —
//! scheduling something slightly further in the future than the current
//! latest entry — O(1), and makes equal timestamps fire in arrival order.
//!
//! The clock tick driver calls [`TimestampQueue::check_timestamp`] with the
//! current tick count; it drains every expired node, taking and releasing
//! the critical section once per node so that a burst of expirations does
//! not hold off other interrupts for its whole duration.
use core::{fmt, marker::PhantomPinned, ops, pin::Pin, ptr::NonNull};

use super::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    thread::{self, ThreadCb, ThreadSt},
    timer, KernelTraits, PortThreading,
};
use crate::utils::{
    intrusive_list::{Link, ListAccessorCell, ListHead},
    ktrace, Init,
};

/// A monotonic clock reading, in ticks.
pub type Ticks = u64;

/// A reference to a [`TimestampNode`].
pub(crate) struct NodeRef<Traits: PortThreading>(pub(super) NonNull<TimestampNode<Traits>>);

// Safety: `TimestampNode` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for NodeRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for NodeRef<Traits> {}

impl<Traits: PortThreading> Clone for NodeRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for NodeRef<Traits> {}

impl<Traits: PortThreading> PartialEq for NodeRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for NodeRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for NodeRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.0).finish()
    }
}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    /// A virtual container of [`TimestampNode`]s indexed by [`NodeRef`].
    pub(super) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed
        /// `UnsafeStatic` must be valid.
        pub(super) const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortThreading> ops::Index<NodeRef<Traits>> for UnsafeStatic {
        type Output = TimestampNode<Traits>;

        fn index(&self, index: NodeRef<Traits>) -> &Self::Output {
            // Safety: See `clock_queue_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessorCell` used to access the timestamp queue.
///
/// # Safety
///
/// All elements of the queue must be extant.
macro_rules! clock_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            UnsafeStatic::new(),
            |node: &TimestampNode<_>| &node.link,
            $key,
        )
    };
}

/// What happens when a [`TimestampNode`]'s time arrives.
///
/// A closed set of two variants suffices here, so the dispatch is a plain
/// `match` rather than a vtable.
pub(crate) enum NodeKind<Traits: PortThreading> {
    /// A timed wait's deadline: resume the thread, unless it's been
    /// destroyed in the meantime.
    WakeThread(&'static ThreadCb<Traits>),

    /// A software timer: run the timer's expiration service routine, which
    /// re-enqueues the node for a periodic timer. The index refers to
    /// [`KernelCfg::timer_cb_pool`].
    ///
    /// [`KernelCfg::timer_cb_pool`]: super::KernelCfg::timer_cb_pool
    Timer(usize),
}

impl<Traits: PortThreading> Clone for NodeKind<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for NodeKind<Traits> {}

/// An entry of the timestamp queue: an absolute tick count paired with the
/// effect to run when that time arrives.
///
/// Once linked, the node must stay in the same memory location until it's
/// unlinked. Dropping a node that is still linked is detected and causes a
/// panic; the owner is responsible for unlinking first (for a stack-resident
/// node, before leaving the scope).
pub(crate) struct TimestampNode<Traits: PortThreading> {
    /// The arrival time, as an absolute monotonic tick count.
    pub(super) at: CpuLockCell<Traits, Ticks>,

    /// Forms the linked list headed by [`TimestampQueue`]. `None` while
    /// detached.
    link: CpuLockCell<Traits, Option<Link<NodeRef<Traits>>>>,

    pub(super) kind: NodeKind<Traits>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

impl<Traits: PortThreading> TimestampNode<Traits> {
    /// Construct a node that wakes `cb` at time `at`.
    pub(crate) fn new_wake(at: Ticks, cb: &'static ThreadCb<Traits>) -> Self {
        Self {
            at: CpuLockCell::new(at),
            link: CpuLockCell::new(None),
            kind: NodeKind::WakeThread(cb),
            _pin: PhantomPinned,
        }
    }

    /// Construct a node that drives the timer at `index` in the timer CB
    /// pool. The expiration time is set when the timer is started.
    pub(crate) const fn new_timer(index: usize) -> Self {
        Self {
            at: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
            kind: NodeKind::Timer(index),
            _pin: PhantomPinned,
        }
    }

    /// Get a flag indicating whether the node is currently linked.
    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.get(&*lock).is_some()
    }
}

impl<Traits: PortThreading> Drop for TimestampNode<Traits> {
    #[inline]
    fn drop(&mut self) {
        if self.link.get_mut().is_some() {
            // Dropping now would leave the queue pointing into freed
            // memory. We can't reliably take CPU Lock from here, so the
            // only course of action is to escalate.
            panic!("timestamp node is still linked");
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TimestampNode<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimestampNode")
            .field("self", &(self as *const _))
            .field("at", &self.at)
            .finish()
    }
}

/// The chronological queue of [`TimestampNode`]s, soonest at the head.
///
/// A kernel instance owns exactly one; it's driven by the clock tick.
pub struct TimestampQueue<Traits: PortThreading> {
    /// All elements of this linked list must be valid; this is upheld by
    /// the owners of the nodes (see [`TimestampNode`]).
    pub(super) queue: CpuLockCell<Traits, ListHead<NodeRef<Traits>>>,
}

impl<Traits: PortThreading> Init for TimestampQueue<Traits> {
    const INIT: Self = Self { queue: Init::INIT };
}

impl<Traits: KernelTraits> TimestampQueue<Traits> {
    /// Insert a node, keeping the nondecreasing timestamp order.
    ///
    /// Inserting from the tail backward stops at the first node whose
    /// timestamp is not later, so a node with an already-present timestamp
    /// lands behind its equals and fires after them.
    pub(crate) fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        node: Pin<&TimestampNode<Traits>>,
    ) {
        let timestamp = node.at.get(&*lock);
        let node_ref = NodeRef(NonNull::from(&*node));

        let insert_before = {
            let mut insert_before = None;
            // Safety: All elements of the queue are extant.
            let mut cursor = unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.back();
            while let Some(at) = cursor {
                // Safety: `at` is in the queue, so the pointee is valid
                let at_timestamp = unsafe { at.0.as_ref() }.at.get(&*lock);
                if timestamp < at_timestamp {
                    insert_before = Some(at);
                    // Safety: ditto
                    cursor =
                        unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.prev(at);
                } else {
                    break;
                }
            }
            insert_before
        };

        ktrace!("clock link() at={}", timestamp);
        // Safety: All elements of the queue are extant.
        unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }
            .insert(node_ref, insert_before);
    }

    /// Remove a node if it is linked; a detached node is a no-op. This is
    /// the cancellation path (e.g. a timed wait satisfied before its
    /// deadline, or a timer being stopped).
    pub(crate) fn unlink(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        node: &TimestampNode<Traits>,
    ) -> bool {
        if node.link.get(&*lock).is_none() {
            return false;
        }
        let node_ref = NodeRef(NonNull::from(node));
        // Safety: All elements of the queue are extant.
        unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.remove(node_ref);
        true
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.queue.get(&*lock).is_empty()
    }

    /// The earliest pending node, if any. This is what a tickless port
    /// would use to program the next timer interrupt.
    #[allow(dead_code)]
    pub(crate) fn front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<NodeRef<Traits>> {
        // Safety: All elements of the queue are extant.
        unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.front()
    }

    /// Process every node whose time has arrived.
    ///
    /// Nodes fire strictly in queue order. The critical section is entered
    /// anew for each node, so a long burst of expirations doesn't keep
    /// interrupts masked throughout. A node's action may re-enqueue (a
    /// periodic timer does); the loop re-reads the head afterwards, so a
    /// re-enqueued node that is still overdue fires again in the same
    /// call.
    ///
    /// A queue that has never been touched is simply empty — there is no
    /// separate "uninitialized" state to guard against, so a tick arriving
    /// before the first node was ever enqueued falls out of the loop
    /// immediately.
    ///
    /// Must be called with CPU Lock inactive.
    pub(crate) fn check_timestamp(&self, now: Ticks) {
        loop {
            // The caller is required to have CPU Lock inactive, so this
            // `unwrap` should succeed
            let mut lock = klock::lock_cpu::<Traits>().unwrap();

            // Safety: All elements of the queue are extant.
            let head = unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.front();
            let head = match head {
                Some(head) => head,
                None => break,
            };

            // Safety: `head` is in the queue, so the pointee is valid
            let head_timestamp = unsafe { head.0.as_ref() }.at.get(&*lock);
            if now < head_timestamp {
                break;
            }

            ktrace!("check_timestamp() firing at={} now={}", head_timestamp, now);
            let lock = self.fire(head, lock);

            // Release the critical section between nodes.
            drop(lock);
        }
    }

    /// Run a node's action: unlink it from the queue, then perform the
    /// variant-specific effect.
    fn fire(
        &self,
        node_ref: NodeRef<Traits>,
        mut lock: CpuLockGuard<Traits>,
    ) -> CpuLockGuard<Traits> {
        // Safety: `node_ref` was in the queue at the start of this call,
        // so the pointee is valid
        let node = unsafe { &*node_ref.0.as_ptr() };

        // Safety: All elements of the queue are extant.
        unsafe { clock_queue_accessor!(&self.queue, lock.borrow_mut()) }.remove(node_ref);

        match node.kind {
            NodeKind::WakeThread(cb) => {
                // Resume the thread — unless it was destroyed in the
                // meantime, or the wake-up raced with another resume path
                // and the thread isn't Waiting anymore.
                if cb.st.get(&*lock) == ThreadSt::Waiting {
                    cb.wait
                        .wait_result
                        .replace(&mut *lock, Err(super::error::WaitError::Timeout));
                    thread::make_ready(lock.borrow_mut(), cb);
                } else {
                    ktrace!("fire() gone {:?}", cb);
                }
                lock
            }
            NodeKind::Timer(index) => timer::expire(index, lock),
        }
    }
}
