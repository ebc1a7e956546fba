macro_rules! define_error {
    (
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        pub enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => Self::$vname,
                    )*
                }
            }
        }
    };
}

/// All result codes (including success) that kernel entry points can
/// produce.
///
/// The list operations themselves are infallible — they assert their
/// preconditions instead. Result codes only appear at the public entry
/// points that check the calling context or report a timed-out wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum ResultCode {
    /// The operation was successful. No additional information is
    /// available.
    Success = 0,
    /// The current context disallows the operation.
    BadCtx = -25,
    /// The wait operation timed out before completion.
    Timeout = -34,
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

define_error! {
    /// Error type for operations that require a specific calling context.
    pub enum BadContextError {
        BadCtx,
    }
}

define_error! {
    /// Error type for [`WaitQueue::wait`] and [`WaitQueue::wait_until`].
    ///
    /// [`WaitQueue::wait`]: super::WaitQueue::wait
    /// [`WaitQueue::wait_until`]: super::WaitQueue::wait_until
    pub enum WaitError {
        BadCtx,
        Timeout,
    }
}

impl From<BadContextError> for WaitError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadCtx
    }
}
