//! Hosted simulation port for the Orbit RTOS kernel.
//!
//! This port runs the kernel on a regular OS for development and testing.
//! CPU Lock is emulated with an atomic flag, and the "clock" is a tick
//! counter the harness advances by hand, which makes time-driven scenarios
//! deterministic. There is no real context switching: `yield_cpu` is a
//! no-op and the harness invokes the scheduling decision explicitly.
//!
//! # Usage
//!
//! ```ignore
//! orbit_port_std::use_port!(unsafe struct SystemTraits);
//!
//! static KERNEL_STATE: State<SystemTraits> = State::new();
//!
//! impl KernelCfg for SystemTraits {
//!     fn state() -> &'static State<SystemTraits> {
//!         &KERNEL_STATE
//!     }
//!     fn timer_cb_pool() -> &'static [TimerCb<SystemTraits>] {
//!         &[]
//!     }
//! }
//! ```
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use orbit_kernel::kernel::Ticks;

/// Used by `use_port!`
#[doc(hidden)]
pub use orbit_kernel;

/// The port-side state of one simulated system: the CPU Lock flag and the
/// tick counter.
pub struct PortState {
    cpu_lock: AtomicBool,
    tick_count: AtomicU64,
}

impl PortState {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        let entered = !self.cpu_lock.swap(true, Ordering::Acquire);
        if entered {
            log::trace!("enter_cpu_lock");
        }
        entered
    }

    /// # Safety
    ///
    /// CPU Lock must be active.
    pub unsafe fn leave_cpu_lock(&self) {
        log::trace!("leave_cpu_lock");
        assert!(
            self.cpu_lock.swap(false, Ordering::Release),
            "CPU Lock was not active"
        );
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    pub fn tick_count(&self) -> Ticks {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Move the simulated clock to an absolute tick count.
    pub fn set_tick_count(&self, now: Ticks) {
        self.tick_count.store(now, Ordering::Relaxed);
    }

    /// Advance the simulated clock and return the new tick count.
    pub fn advance(&self, ticks: Ticks) -> Ticks {
        self.tick_count.fetch_add(ticks, Ordering::Relaxed) + ticks
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantiate the port: defines the given system type and implements the
/// kernel's port traits for it, backed by a dedicated [`PortState`].
///
/// The application still has to supply the kernel configuration
/// (`KernelCfg`) for the type — the kernel state and the CB pools are the
/// application's, not the port's.
#[macro_export]
macro_rules! use_port {
    (unsafe struct $name:ident) => {
        struct $name;

        impl $name {
            /// The port-side state of this system instance.
            #[allow(dead_code)]
            fn port_state() -> &'static $crate::PortState {
                static PORT_STATE: $crate::PortState = $crate::PortState::new();
                &PORT_STATE
            }
        }

        unsafe impl $crate::orbit_kernel::kernel::PortThreading for $name {
            fn try_enter_cpu_lock() -> bool {
                $name::port_state().try_enter_cpu_lock()
            }
            unsafe fn leave_cpu_lock() {
                $name::port_state().leave_cpu_lock()
            }
            fn is_cpu_lock_active() -> bool {
                $name::port_state().is_cpu_lock_active()
            }
            unsafe fn yield_cpu() {
                // The simulator performs scheduling decisions explicitly
                // via `PortToKernel::choose_running_thread`.
            }
        }

        unsafe impl $crate::orbit_kernel::kernel::PortTimer for $name {
            unsafe fn tick_count() -> $crate::orbit_kernel::kernel::Ticks {
                $name::port_state().tick_count()
            }
        }
    };
}
