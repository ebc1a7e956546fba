//! Utility
mod init;
pub(crate) mod intrusive_list;

pub use self::init::Init;

use core::pin::Pin;

/// Pin a reference whose pointee is known to live forever.
pub(crate) fn static_pin<T: ?Sized>(x: &'static T) -> Pin<&'static T> {
    // Safety: The pointee will never be deallocated without its destructor
    // running first
    unsafe { Pin::new_unchecked(x) }
}

/// Emit a diagnostic trace line. Expands to nothing unless the `trace`
/// feature is enabled.
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "trace")]
        ::log::trace!($($arg)*);
    }};
}

pub(crate) use ktrace;
