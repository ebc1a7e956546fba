//! The RTOS kernel core: thread lists, the scheduler's dispatch decision,
//! and the chronological timestamp queue.
//!
//! # Threads
//!
//! A thread may be in one of the following states:
//!
//!  - **Ready** — linked on the [ready queue], waiting to be scheduled to
//!    the CPU.
//!  - **Running** — currently scheduled to the CPU.
//!  - **Waiting** — parked on a [wait queue], and possibly also represented
//!    on the [timestamp queue] by a timeout node.
//!  - **Terminated** — past its final transition, parked on the terminated
//!    list until a cleanup path reclaims it.
//!  - **Destroyed** — the control block is defunct; a pending resume aimed
//!    at it is silently dropped.
//!
//! [ready queue]: ready::ReadyQueue
//! [wait queue]: wait::WaitQueue
//! [timestamp queue]: clock::TimestampQueue
//!
//! # Lock discipline
//!
//! Every list that an interrupt handler can reach is guarded by CPU Lock
//! (the interrupt-masked critical section). List operations take a borrowed
//! lock token; the public entry points acquire the lock themselves and are
//! documented with their context requirements.
use crate::utils::Init;

pub mod clock;
mod error;
mod klock;
pub mod ready;
pub mod thread;
pub mod timer;
pub mod wait;

#[cfg(test)]
mod tests;

pub use self::{
    clock::{TimestampQueue, Ticks},
    error::*,
    ready::ReadyQueue,
    thread::{ThreadAttr, ThreadCb, ThreadPriority, ThreadSt},
    timer::{TimerAttr, TimerCb},
    wait::WaitQueue,
};

/// Implemented by a port to provide the CPU Lock primitive and the
/// context-switch request.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Enter a CPU Lock state, masking interrupts. Returns `false` if CPU
    /// Lock was already active.
    fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state, unmasking interrupts.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and it must have been entered by the
    /// kernel.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Request a context switch to the highest-priority ready thread.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn yield_cpu();
}

/// Implemented by a port to provide the monotonic tick source.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortTimer: Sized + 'static {
    /// Read the monotonic tick count.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn tick_count() -> Ticks;
}

/// Static kernel configuration, supplied by the application: the kernel
/// state instance and the control block pools.
pub trait KernelCfg: PortThreading {
    /// Access the kernel state.
    fn state() -> &'static State<Self>;

    /// Access the timer control block pool.
    fn timer_cb_pool() -> &'static [TimerCb<Self>];

    /// Get the [`TimerCb`] for the timer at `index` in the pool.
    fn get_timer_cb(index: usize) -> Option<&'static TimerCb<Self>> {
        Self::timer_cb_pool().get(index)
    }
}

/// Represents "system" types having sufficient trait `impl`s to instantiate
/// the kernel.
///
/// This trait is not intended to be implemented directly; implement
/// [`PortThreading`], [`PortTimer`], and [`KernelCfg`] instead.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg {}
impl<T: PortThreading + PortTimer + KernelCfg> KernelTraits for T {}

/// The lists and cells owned by a kernel instance.
///
/// `State` is designed to be a `static`: it's fully usable in its `INIT`
/// state, so threads can register themselves and the clock can tick before
/// any initialization code has run.
pub struct State<Traits: PortThreading> {
    /// The ready queue. Threads in the Ready state live here, in priority
    /// order.
    pub ready: ReadyQueue<Traits>,

    /// The root of the thread hierarchy: threads that have no parent.
    pub top_threads: thread::ThreadList<Traits>,

    /// Threads past their final transition, awaiting reclamation in FIFO
    /// order.
    pub terminated: thread::TerminatedList<Traits>,

    /// The timestamp queue: pending timeouts and software timer expirations
    /// in chronological order.
    pub clock: TimestampQueue<Traits>,

    pub(super) running_thread: klock::CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    const INIT: Self = Self {
        ready: Init::INIT,
        top_threads: Init::INIT,
        terminated: Init::INIT,
        clock: Init::INIT,
        running_thread: Init::INIT,
    };
}

impl<Traits: PortThreading> State<Traits> {
    pub const fn new() -> Self {
        Init::INIT
    }
}

impl<Traits: PortThreading> Default for State<Traits> {
    fn default() -> Self {
        Init::INIT
    }
}

/// The interface the kernel exposes *to* the port: the clock tick entry and
/// the scheduling decision.
pub trait PortToKernel {
    /// Process a clock tick. The port should call this from the tick
    /// interrupt handler on every tick.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context.
    fn timer_tick();

    /// Choose the next thread to run and update the running-thread slot.
    /// The port should call this when it's about to perform a context
    /// switch.
    ///
    /// Precondition: CPU Lock inactive.
    fn choose_running_thread();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    fn timer_tick() {
        // The precondition includes CPU Lock being inactive, so this
        // `unwrap` should succeed
        let now = {
            let lock = klock::lock_cpu::<Traits>().unwrap();
            // Safety: CPU Lock active
            let now = unsafe { Traits::tick_count() };
            drop(lock);
            now
        };

        Traits::state().clock.check_timestamp(now);

        // Expired nodes might have woken up threads. Check for dispatch.
        let lock = klock::lock_cpu::<Traits>().unwrap();
        thread::unlock_cpu_and_check_preemption(lock);
    }

    fn choose_running_thread() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        thread::choose_running_thread(lock.borrow_mut());
        drop(lock);
    }
}
