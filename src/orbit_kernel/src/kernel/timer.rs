//! Software timers driven by the timestamp queue.
use core::fmt;

use super::{
    clock::{TimestampNode, Ticks},
    error::BadContextError,
    klock::{self, CpuLockCell, CpuLockGuard},
    KernelTraits, PortThreading,
};
use crate::utils::{ktrace, static_pin, Init};

/// The static properties of a timer.
pub struct TimerAttr {
    /// The expiration callback.
    ///
    /// Called from the clock tick path with CPU Lock *inactive*; the
    /// kernel re-arms a periodic timer before the callback runs, so the
    /// callback may restart or reconfigure the timer freely.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// A name used in diagnostic output.
    pub name: &'static str,
}

impl Init for TimerAttr {
    const INIT: Self = Self {
        entry_point: |_| {},
        entry_param: 0,
        name: "",
    };
}

impl fmt::Debug for TimerAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerAttr")
            .field("name", &self.name)
            .field("entry_param", &self.entry_param)
            .finish()
    }
}

/// *Timer control block* — the state data of a software timer.
///
/// Timer CBs live in the pool returned by [`KernelCfg::timer_cb_pool`];
/// `index` must be the timer's position in that pool, which is how the
/// expired node finds its way back to the control block.
///
/// [`KernelCfg::timer_cb_pool`]: super::KernelCfg::timer_cb_pool
pub struct TimerCb<Traits: PortThreading> {
    /// The static properties of the timer.
    pub attr: &'static TimerAttr,

    /// The timer's entry on the timestamp queue. Linked iff the timer is
    /// in the Active state.
    pub(super) node: TimestampNode<Traits>,

    /// `true` iff the timer is in the Active state.
    pub(super) active: CpuLockCell<Traits, bool>,

    /// The firing period. `None` makes the timer one-shot.
    pub(super) period: CpuLockCell<Traits, Option<Ticks>>,
}

impl<Traits: PortThreading> TimerCb<Traits> {
    pub const fn new(index: usize, attr: &'static TimerAttr) -> Self {
        Self {
            attr,
            node: TimestampNode::new_timer(index),
            active: CpuLockCell::new(false),
            period: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .finish()
    }
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Start the timer: schedule the first expiration `delay` ticks from
    /// now. A no-op if the timer is already active.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn start(&'static self, delay: Ticks) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.active.get(&*lock) {
            return Ok(());
        }

        // Safety: CPU Lock active
        let now = unsafe { Traits::tick_count() };
        self.node
            .at
            .replace(&mut *lock, now.wrapping_add(delay));
        Traits::state()
            .clock
            .link(lock.borrow_mut(), static_pin(&self.node));
        self.active.replace(&mut *lock, true);

        ktrace!("timer start() {:?}", self);
        Ok(())
    }

    /// Stop the timer, cancelling a pending expiration. A no-op if the
    /// timer is not active.
    ///
    /// Must be called with CPU Lock inactive.
    pub fn stop(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.node.is_linked(lock.borrow_mut()) {
            debug_assert!(self.active.get(&*lock));
            Traits::state().clock.unlink(lock.borrow_mut(), &self.node);
        }
        self.active.replace(&mut *lock, false);

        ktrace!("timer stop() {:?}", self);
        Ok(())
    }

    /// Set the firing period. `None` makes the timer one-shot. Takes
    /// effect at the next expiration.
    pub fn set_period(&self, period: Option<Ticks>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.period.replace(&mut *lock, period);
        Ok(())
    }

    /// Get a flag indicating whether the timer is in the Active state.
    pub fn is_active(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.active.get(&*lock))
    }
}

/// The expiration service routine: runs when the timer's node fires.
///
/// A periodic timer is re-enqueued *before* the user callback runs, at the
/// previous expiration time plus one period — not at "now" plus one
/// period — so a late tick doesn't make the schedule drift. CPU Lock is
/// released around the user callback and re-acquired afterwards.
pub(super) fn expire<Traits: KernelTraits>(
    index: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let timer_cb = Traits::get_timer_cb(index).unwrap();

    debug_assert!(!timer_cb.node.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    match timer_cb.period.get(&*lock) {
        Some(period) => {
            timer_cb
                .node
                .at
                .replace_with(&mut *lock, |at| at.wrapping_add(period));
            Traits::state()
                .clock
                .link(lock.borrow_mut(), static_pin(&timer_cb.node));
        }
        None => {
            timer_cb.active.replace(&mut *lock, false);
        }
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    (timer_cb.attr.entry_point)(timer_cb.attr.entry_param);

    // Re-acquire CPU Lock
    klock::lock_cpu().unwrap_or_else(|_| unsafe { klock::assume_cpu_lock() })
}
