//! The ready queue: threads in the Ready state, in priority order.
//!
//! The queue is a single intrusive list kept in nonincreasing priority
//! order, so the scheduler's dispatch decision — [`ReadyQueue::unlink_head`]
//! — is a single O(1) head removal. New arrivals go to the *end* of their
//! priority band, which makes the policy strict priority scheduling with
//! FIFO tie-breaking.
use super::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::{wait_node_accessor, ThreadCb, ThreadPriority, ThreadSt},
    KernelTraits, PortThreading,
};
use crate::utils::{
    intrusive_list::{Ident, StaticListHead},
    ktrace, Init,
};

/// The list of Ready threads, highest priority at the head.
pub struct ReadyQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Insert a thread, keeping the priority order.
    ///
    /// The priority used for ordering is the *cached* [`ThreadCb::
    /// priority`] field — deliberately not the live [`sched_prio`] query
    /// that wait queues use; re-running the admission logic from the
    /// dispatch side would re-enter the scheduler.
    ///
    /// The thread's scheduler state is forced to Ready.
    ///
    /// [`sched_prio`]: ThreadCb::sched_prio
    ///
    /// Must be called with CPU Lock active; the waiting node must be
    /// detached.
    pub(crate) fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cb: &'static ThreadCb<Traits>,
    ) {
        let prio = cb.priority;

        // Search from the tail backward for the insertion point: the new
        // node goes after the last node whose priority is not below
        // `prio`, which places it behind all older equal-priority
        // arrivals. The search is O(1) in the common cases — inserting at
        // the tail or at the head.
        let insert_before = {
            let accessor = wait_node_accessor!(&self.head, lock.borrow_mut());
            let mut insert_before = None;
            let mut cursor = accessor.back();
            while let Some(at) = cursor {
                if at.0.priority < prio {
                    insert_before = Some(at);
                    cursor = accessor.prev(at);
                } else {
                    break;
                }
            }
            insert_before
        };

        ktrace!("ready link() {:?}", cb);
        wait_node_accessor!(&self.head, lock.borrow_mut()).insert(Ident(cb), insert_before);

        cb.st.replace(&mut *lock, ThreadSt::Ready);
    }

    /// Detach the highest-priority thread, force it Running, and return
    /// it. This is the scheduler's dispatch primitive.
    ///
    /// The queue must not be empty. Note the deliberate asymmetry with the
    /// wait queue: no resume path runs here — the caller is the scheduler
    /// itself.
    pub(crate) fn unlink_head(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> &'static ThreadCb<Traits> {
        let mut accessor = wait_node_accessor!(&self.head, lock.borrow_mut());
        assert!(!accessor.is_empty());

        let cb = accessor.pop_front().unwrap().0;

        ktrace!("ready unlink_head() {:?}", cb);
        cb.st.replace(&mut *lock, ThreadSt::Running);
        cb
    }

    /// Detach the given thread (e.g. when it terminates while Ready).
    pub(crate) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cb: &'static ThreadCb<Traits>,
    ) {
        wait_node_accessor!(&self.head, lock.borrow_mut()).remove(Ident(cb));
    }

    /// The cached priority of the thread at the head, or `None` if no
    /// thread is Ready.
    pub(crate) fn front_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadPriority> {
        wait_node_accessor!(&self.head, lock.borrow_mut())
            .front()
            .map(|ident| ident.0.priority)
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).is_empty()
    }
}
