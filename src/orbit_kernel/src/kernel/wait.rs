//! Wait queues: threads parked on a waitable object, in priority order.
//!
//! Keeping the list ordered makes retrieving the top-priority waiter a
//! single head access, at the cost of a partial traversal on insert.
//! Typical wait queues hold one entry — a mutex occasionally two, a
//! condition variable a few — so the traversal is cheap in practice, and
//! in the rare large-queue case the ordered strategy favours wake-up
//! latency, which is the right trade for an RTOS.
use core::{fmt, ptr::NonNull};

use super::{
    clock::{TimestampNode, Ticks},
    error::WaitError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread::{self, wait_node_accessor, ThreadCb, ThreadSt},
    KernelTraits, PortThreading,
};
use crate::utils::{
    intrusive_list::{Ident, StaticListHead},
    ktrace, Init,
};

/// A reference to a [`WaitQueue`], stored in the waiting thread's control
/// block for the duration of the wait so that wake-up paths can detach the
/// thread from the right queue.
pub(crate) struct WaitQueueRef<Traits: PortThreading>(NonNull<WaitQueue<Traits>>);

// Safety: `WaitQueue` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for WaitQueueRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitQueueRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitQueueRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for WaitQueueRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitQueueRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitQueueRef").field(&self.0).finish()
    }
}

/// The wait state of a thread.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The wait queue the thread is currently parked on. `None` iff the
    /// thread is not in the Waiting state.
    ///
    /// The pointee must be valid while this is `Some(_)`, which holds
    /// because a queue with waiters refuses destruction.
    pub(super) current_queue: CpuLockCell<Traits, Option<WaitQueueRef<Traits>>>,

    /// The result of the last wait operation. Set by the wake-upper.
    pub(super) wait_result: CpuLockCell<Traits, Result<(), WaitError>>,
}

impl<Traits: PortThreading> ThreadWait<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            current_queue: CpuLockCell::new(None),
            wait_result: CpuLockCell::new(Ok(())),
        }
    }
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    const INIT: Self = Self {
        current_queue: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

/// A queue of threads waiting on a particular waitable object, in
/// nonincreasing priority order (head = highest). Threads are linked
/// through their waiting nodes.
///
/// A `WaitQueue` is runtime-scoped: it's constructed ready to use and must
/// be empty when dropped.
pub struct WaitQueue<Traits: PortThreading> {
    pub(super) waits: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    pub const fn new() -> Self {
        Self {
            waits: CpuLockCell::new(StaticListHead::new()),
        }
    }
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    const INIT: Self = Self { waits: Init::INIT };
}

impl<Traits: PortThreading> Default for WaitQueue<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> Drop for WaitQueue<Traits> {
    fn drop(&mut self) {
        // A waiter would be left with a dangling queue reference.
        debug_assert!(
            self.waits.get_mut().is_empty(),
            "wait queue dropped while non-empty"
        );
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a thread's waiting node, keeping the priority order.
    ///
    /// Unlike the ready queue, the ordering key is the *live*
    /// [`ThreadCb::sched_prio`] query, so a priority raised by inheritance
    /// is honoured at link time. Equal-priority arrivals end up behind
    /// older ones: the tail-to-head search stops at the first node whose
    /// priority is not below the new one.
    ///
    /// Must be called with CPU Lock active; the waiting node must be
    /// detached.
    pub(crate) fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cb: &'static ThreadCb<Traits>,
    ) {
        let prio = cb.sched_prio(lock.borrow_mut());

        let insert_before = {
            let mut insert_before = None;
            let mut cursor = wait_node_accessor!(&self.waits, lock.borrow_mut()).back();
            while let Some(at) = cursor {
                if at.0.sched_prio(lock.borrow_mut()) < prio {
                    insert_before = Some(at);
                    cursor = wait_node_accessor!(&self.waits, lock.borrow_mut()).prev(at);
                } else {
                    break;
                }
            }
            insert_before
        };

        ktrace!("wait link() {:?}", cb);
        wait_node_accessor!(&self.waits, lock.borrow_mut()).insert(Ident(cb), insert_before);

        cb.wait
            .current_queue
            .replace(&mut *lock, Some(WaitQueueRef(NonNull::from(self))));
    }

    /// Wake up up to one waiting thread. Returns `true` if a node was
    /// unlinked.
    ///
    /// The head capture and unlink happen atomically under CPU Lock; the
    /// `resume` call happens *outside* the critical section, because the
    /// admission path may need to take broader kernel state and must not
    /// run with interrupts masked. A thread observed to be Destroyed is
    /// silently dropped instead of resumed.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn resume_one(&self) -> bool {
        let (cb, st) = {
            // This context is required to have CPU Lock inactive, so this
            // `unwrap` should succeed
            let mut lock = klock::lock_cpu::<Traits>().unwrap();

            let head = wait_node_accessor!(&self.waits, lock.borrow_mut()).pop_front();
            let cb = match head {
                Some(ident) => ident.0,
                None => return false,
            };

            debug_assert!(matches!(
                cb.wait.current_queue.get(&*lock),
                Some(r) if core::ptr::eq(r.0.as_ptr(), self)
            ));
            cb.wait.current_queue.replace(&mut *lock, None);
            cb.wait.wait_result.replace(&mut *lock, Ok(()));

            (cb, cb.st.get(&*lock))
        };

        if st != ThreadSt::Destroyed {
            // `resume` re-enters CPU Lock on its own.
            let _ = cb.resume();
        } else {
            ktrace!("resume_one() gone {:?}", cb);
        }

        true
    }

    /// Wake up all waiting threads by calling [`Self::resume_one`] until
    /// the queue is empty.
    ///
    /// Not atomic as a whole — a caller that needs an atomic broadcast
    /// must provide its own exclusion around the queue.
    pub fn resume_all(&self) {
        while !self.is_empty() {
            self.resume_one();
        }
    }

    /// Return whether the queue currently has no waiters.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn is_empty(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.waits.get(&*lock).is_empty()
    }

    /// Park the currently running thread on this queue until a wake-up
    /// arrives.
    ///
    /// Must be called from a task context with CPU Lock inactive.
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = running_thread::<Traits>(lock.borrow_mut())?;

        self.link(lock.borrow_mut(), cb);
        thread::wait_until_woken_up(lock.borrow_mut());

        debug_assert!(cb.wait.current_queue.get(&*lock).is_none());
        cb.wait.wait_result.get(&*lock)
    }

    /// Park the currently running thread on this queue until a wake-up
    /// arrives or the monotonic tick count reaches `deadline`.
    ///
    /// A timeout node for the deadline lives on this function's stack and
    /// is registered on the timestamp queue for the duration of the wait.
    /// Whichever side fires first unlinks its own node; this function
    /// removes whichever node is left over before returning, so neither
    /// list can observe a stale entry afterwards.
    ///
    /// Must be called from a task context with CPU Lock inactive.
    pub fn wait_until(&self, deadline: Ticks) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = running_thread::<Traits>(lock.borrow_mut())?;

        let timeout = TimestampNode::new_wake(deadline, cb);
        // Safety: `timeout` is unlinked from the timestamp queue before
        // this function returns, and it's neither moved nor dropped while
        // linked.
        let timeout = unsafe { core::pin::Pin::new_unchecked(&timeout) };

        Traits::state().clock.link(lock.borrow_mut(), timeout);
        self.link(lock.borrow_mut(), cb);

        thread::wait_until_woken_up(lock.borrow_mut());

        // Disarm the timeout if the wake-up came from the queue side.
        Traits::state().clock.unlink(lock.borrow_mut(), &timeout);

        debug_assert!(cb.wait.current_queue.get(&*lock).is_none());
        cb.wait.wait_result.get(&*lock)
    }
}

/// Get the currently running thread, or fail with `BadCtx` mapped into
/// `WaitError`.
fn running_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static ThreadCb<Traits>, WaitError> {
    Traits::state()
        .running_thread
        .get(&*lock)
        .ok_or(WaitError::BadCtx)
}

/// Detach the thread from the wait queue it's parked on, if any. No-op for
/// a thread that isn't on a wait queue, so wake-up paths can call this
/// unconditionally.
pub(crate) fn abort_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static ThreadCb<Traits>,
) {
    if let Some(queue_ref) = cb.wait.current_queue.get(&*lock) {
        // Safety: `current_queue` is only `Some(_)` while the queue is
        // alive and the thread is linked on it
        let queue = unsafe { queue_ref.0.as_ref() };
        wait_node_accessor!(&queue.waits, lock.borrow_mut()).remove(Ident(cb));
        cb.wait.current_queue.replace(&mut *lock, None);
    }
}
