//! Threads: control blocks, the thread hierarchy, and the state
//! transitions shared by the scheduling lists.
use core::fmt;

use super::{
    error::BadContextError,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    wait, KernelTraits, PortThreading,
};
use crate::utils::{
    intrusive_list::{Ident, StaticLink, StaticListHead},
    ktrace, Init,
};

/// Thread scheduling priority. Higher values take precedence.
pub type ThreadPriority = u8;

/// Thread scheduler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The control block was constructed but the thread has not entered
    /// the scheduler yet.
    Undefined,

    /// The thread is on the ready queue, waiting to be scheduled.
    Ready,

    /// The thread is currently scheduled to the CPU.
    Running,

    /// The thread is parked on a wait queue.
    Waiting,

    /// The thread is past its final transition, awaiting reclamation.
    Terminated,

    /// The control block is defunct. A resume aimed at a destroyed thread
    /// is silently dropped.
    Destroyed,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Undefined;
}

/// The static properties of a thread.
pub struct ThreadAttr {
    /// A name used in diagnostic output.
    pub name: &'static str,
}

impl Init for ThreadAttr {
    const INIT: Self = Self { name: "" };
}

/// The per-thread record placed on wait, ready and terminated lists — the
/// *waiting node*.
///
/// It is embedded in [`ThreadCb`], so the back-reference to the owning
/// thread is the containment itself, and the single link field is what
/// guarantees a thread can sit on at most one of those lists at a time.
pub(crate) struct WaitNode<Traits: PortThreading> {
    pub(crate) link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,
}

impl<Traits: PortThreading> Init for WaitNode<Traits> {
    const INIT: Self = Self { link: Init::INIT };
}

/// *Thread control block* — the state data of a thread.
pub struct ThreadCb<Traits: PortThreading> {
    /// The static properties of the thread.
    pub attr: &'static ThreadAttr,

    /// Base scheduling priority, assigned at creation. The ready queue
    /// orders threads by this field, sampled at link time.
    pub priority: ThreadPriority,

    /// Effective scheduling priority — what [`ThreadCb::sched_prio`]
    /// reports and what wait queues order by. Normally equal to
    /// [`Self::priority`]; a priority-inheritance protocol would raise it
    /// temporarily.
    pub(crate) effective_priority: CpuLockCell<Traits, ThreadPriority>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// The waiting node. On the ready queue in the Ready state, on a wait
    /// queue in the Waiting state, on the terminated list in the
    /// Terminated state, detached otherwise.
    pub(crate) wait_node: WaitNode<Traits>,

    /// Links the thread into its parent's children list, or into the
    /// top-level thread list if it has no parent.
    pub(crate) child_link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,

    /// The thread's children.
    pub(crate) children: ThreadList<Traits>,

    /// The wait state of the thread.
    pub(crate) wait: wait::ThreadWait<Traits>,
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    pub const fn new(attr: &'static ThreadAttr, priority: ThreadPriority) -> Self {
        Self {
            attr,
            priority,
            effective_priority: CpuLockCell::new(priority),
            st: CpuLockCell::new(ThreadSt::Undefined),
            wait_node: WaitNode {
                link: CpuLockCell::new(None),
            },
            child_link: CpuLockCell::new(None),
            children: ThreadList::new(),
            wait: wait::ThreadWait::new(),
        }
    }
}

impl<Traits: PortThreading> Init for ThreadCb<Traits> {
    const INIT: Self = Self {
        attr: &ThreadAttr::INIT,
        priority: 0,
        effective_priority: Init::INIT,
        st: Init::INIT,
        wait_node: Init::INIT,
        child_link: Init::INIT,
        children: Init::INIT,
        wait: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("name", &self.attr.name)
            .field("priority", &self.priority)
            .finish()
    }
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// The scheduling priority a wait queue orders by. Reflects priority
    /// inheritance, unlike the [`Self::priority`] field.
    pub(crate) fn sched_prio(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> ThreadPriority {
        self.effective_priority.get(&*lock)
    }

    /// Get the current scheduler state.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn sched_state(&self) -> Result<ThreadSt, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.st.get(&*lock))
    }

    /// Raise or restore the effective scheduling priority.
    ///
    /// The position of an already-queued thread is established at link
    /// time and is not revised by this call.
    pub fn set_sched_prio(&self, prio: ThreadPriority) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.effective_priority.replace(&mut *lock, prio);
        Ok(())
    }

    /// Make the thread schedulable again.
    ///
    /// This is the full admission path: a stale wait-queue entry is
    /// detached first, then the thread is linked into the ready queue. May
    /// request a context switch; must be called with CPU Lock inactive.
    pub fn resume(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        make_ready(lock.borrow_mut(), self);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Transition the thread into the Terminated state and park its
    /// waiting node on the terminated list, pending reclamation.
    pub fn terminate(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state();

        // Detach the waiting node from whatever scheduling list it's on.
        match self.st.get(&*lock) {
            ThreadSt::Ready => {
                state.ready.remove(lock.borrow_mut(), self);
            }
            ThreadSt::Waiting => {
                wait::abort_wait(lock.borrow_mut(), self);
            }
            _ => {}
        }

        if let Some(running) = state.running_thread.get(&*lock) {
            if core::ptr::eq(running, self) {
                state.running_thread.replace(&mut *lock, None);
            }
        }

        self.st.replace(&mut *lock, ThreadSt::Terminated);
        state.terminated.link(lock.borrow_mut(), self);
        ktrace!("terminate() {:?}", self);
        Ok(())
    }

    /// Mark the control block defunct. A later resume aimed at it — from a
    /// wait queue or from an expired timeout — is silently dropped.
    pub fn mark_destroyed(&self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.st.replace(&mut *lock, ThreadSt::Destroyed);
        Ok(())
    }

    /// Call `f` for each child of this thread.
    pub fn for_each_child(
        &self,
        f: impl FnMut(&'static ThreadCb<Traits>),
    ) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.children.for_each(lock.borrow_mut(), f);
        Ok(())
    }
}

/// Get a `ListAccessorCell` used to access a list of threads linked through
/// their waiting nodes.
macro_rules! wait_node_accessor {
    ($head:expr, $key:expr) => {
        $crate::utils::intrusive_list::ListAccessorCell::new(
            $head,
            &$crate::utils::intrusive_list::Static,
            |cb: &$crate::kernel::thread::ThreadCb<_>| &cb.wait_node.link,
            $key,
        )
    };
}

pub(crate) use wait_node_accessor;

/// Get a `ListAccessorCell` used to access a list of threads linked through
/// their child links.
macro_rules! child_link_accessor {
    ($head:expr, $key:expr) => {
        $crate::utils::intrusive_list::ListAccessorCell::new(
            $head,
            &$crate::utils::intrusive_list::Static,
            |cb: &$crate::kernel::thread::ThreadCb<_>| &cb.child_link,
            $key,
        )
    };
}

/// An unordered list of threads linked through their child links: the
/// top-level thread list and each thread's children list.
///
/// Purely an enumeration structure (process model, diagnostics, join);
/// threads are appended at the tail in registration order.
pub struct ThreadList<Traits: PortThreading> {
    head: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> ThreadList<Traits> {
    pub const fn new() -> Self {
        Self {
            head: CpuLockCell::new(StaticListHead::new()),
        }
    }
}

impl<Traits: PortThreading> Init for ThreadList<Traits> {
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: KernelTraits> ThreadList<Traits> {
    pub(crate) fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cb: &'static ThreadCb<Traits>,
    ) {
        ktrace!("thread list link() {:?}", cb);
        child_link_accessor!(&self.head, lock.borrow_mut()).push_back(Ident(cb));
    }

    pub(crate) fn for_each(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut f: impl FnMut(&'static ThreadCb<Traits>),
    ) {
        let accessor = child_link_accessor!(&self.head, lock.borrow_mut());
        let mut cursor = accessor.front();
        while let Some(ident) = cursor {
            cursor = accessor.next(ident);
            f(ident.0);
        }
    }

}

/// The FIFO parking lot for threads past their final transition (linked
/// through their waiting nodes). Reclamation happens in a deferred cleanup
/// path via [`reclaim_one`].
pub struct TerminatedList<Traits: PortThreading> {
    head: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> Init for TerminatedList<Traits> {
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: KernelTraits> TerminatedList<Traits> {
    /// Append the thread's waiting node at the tail. FIFO — no ordering by
    /// priority or anything else.
    pub(crate) fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cb: &'static ThreadCb<Traits>,
    ) {
        wait_node_accessor!(&self.head, lock.borrow_mut()).push_back(Ident(cb));
    }

    pub(crate) fn pop(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        wait_node_accessor!(&self.head, lock.borrow_mut())
            .pop_front()
            .map(|ident| ident.0)
    }
}

/// Register a thread with the kernel, linking it into its parent's
/// children list, or into the top-level thread list if it has no parent.
pub fn register_thread<Traits: KernelTraits>(
    cb: &'static ThreadCb<Traits>,
    parent: Option<&'static ThreadCb<Traits>>,
) -> Result<(), BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    match parent {
        None => Traits::state().top_threads.link(lock.borrow_mut(), cb),
        Some(parent) => parent.children.link(lock.borrow_mut(), cb),
    }
    Ok(())
}

/// Call `f` for each thread on the top-level thread list.
pub fn for_each_top_thread<Traits: KernelTraits>(
    f: impl FnMut(&'static ThreadCb<Traits>),
) -> Result<(), BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().top_threads.for_each(lock.borrow_mut(), f);
    Ok(())
}

/// Pop the oldest thread from the terminated list, if any. The deferred
/// cleanup path calls this until it returns `None`.
pub fn reclaim_one<Traits: KernelTraits>(
) -> Result<Option<&'static ThreadCb<Traits>>, BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().terminated.pop(lock.borrow_mut()))
}

/// Transition the thread into the Ready state, detaching a stale
/// wait-queue entry first.
///
/// This is the admission path shared by `resume`, wait-queue wake-ups and
/// expired timeouts. The ready queue's `unlink_head` deliberately does
/// *not* come back through here — dispatch trusts the caller.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static ThreadCb<Traits>,
) {
    // If the thread is still sitting on a wait queue (e.g. its timeout
    // fired first), detach it so the stale entry can't be observed again.
    wait::abort_wait(lock.borrow_mut(), cb);

    Traits::state().ready.link(lock, cb);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority ready
/// thread than the running one, call `PortThreading::yield_cpu`.
///
/// Paths that transition a thread into the Ready state call this before
/// returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();
    let prev_prio = match state.running_thread.get(&*lock) {
        Some(cb) if cb.st.get(&*lock) == ThreadSt::Running => Some(cb.priority),
        _ => None,
    };
    let next_prio = state.ready.front_priority(lock.borrow_mut());

    // Relinquish CPU Lock
    drop(lock);

    let preempt = match (prev_prio, next_prio) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(prev), Some(next)) => next > prev,
    };

    if preempt {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Choose the next thread to run and update the running-thread slot,
/// returning the previous running thread to the ready queue if it was
/// preempted.
pub(crate) fn choose_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();

    let prev_running = state.running_thread.get(&*lock);
    let prev_prio = match prev_running {
        Some(cb) if cb.st.get(&*lock) == ThreadSt::Running => Some(cb.priority),
        _ => None,
    };
    let next_prio = state.ready.front_priority(lock.borrow_mut());

    // Return if there's no thread willing to take over the current one.
    let take_over = match (prev_prio, next_prio) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(prev), Some(next)) => next > prev,
    };
    if !take_over {
        return;
    }

    let next = state.ready.unlink_head(lock.borrow_mut());

    // If the previous thread was still Running, it was preempted; give it
    // back to the ready queue.
    if let Some(prev) = prev_running {
        if prev_prio.is_some() {
            state.ready.link(lock.borrow_mut(), prev);
        }
    }

    state.running_thread.replace(&mut *lock, Some(next));
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Transition the current thread to Waiting
    let running_thread = Traits::state().running_thread.get(&*lock).unwrap();
    assert_eq!(running_thread.st.get(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Waiting);

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`.
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire CPU Lock. An interrupt handler may be in its own
        // critical section; keep retrying until it leaves.
        while !Traits::try_enter_cpu_lock() {}

        if running_thread.st.get(&*lock) == ThreadSt::Running {
            break;
        }
    }
}
