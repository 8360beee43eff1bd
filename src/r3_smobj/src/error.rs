//! Result codes and per-operation error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use r3_smobj::ResultCode;
            /// assert_eq!(ResultCode::LockTimeout.as_str(), "LockTimeout");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the shared-memory object
    /// operations can return.
    ///
    /// The codes shared with the local kernel keep the values the R3 kernel
    /// uses for them, so a caller that handles both local and shared objects
    /// can compare them directly.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The notification transport failed to accept a wake-up request for
        /// a remote CPU. The waiter that was being woken up has already been
        /// removed from the pend list and will not be woken up by this
        /// operation.
        NotifyFailed = -5,
        /// The operation is not supported.
        NotSupported = -9,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object handle does not refer to a valid shared object,
        /// i.e., the validity tag stored in the object does not match the
        /// handle.
        NoAccess = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// A shared-memory pool is exhausted.
        NoMemory = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// An operation or an object couldn't be enqueued because there are too
        /// many of such things that already have been enqueued.
        QueueOverflow = -43,
        /// The wait operation was interrupted by a restart request.
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
        /// The resource is unavailable and the caller asked not to wait.
        Unavailable = -51,
        /// A shared-memory spin lock could not be acquired within the configured
        /// number of retries. This usually means another CPU is stuck while
        /// holding it.
        LockTimeout = -52,
    }
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

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod attach_error {}
    /// Error type for [`SmSystem::init_region`] and [`SmSystem::attach`].
    ///
    /// [`SmSystem::init_region`]: crate::SmSystem::init_region
    /// [`SmSystem::attach`]: crate::SmSystem::attach
    pub enum AttachError {
        /// The CPU ID or the CPU count is out of range, or the region is too
        /// small to hold the header.
        BadParam,
        /// The region does not contain a header written by a compatible
        /// implementation, or it was set up for a different CPU count or
        /// region size.
        BadObjectState,
        /// The header lock could not be acquired.
        LockTimeout,
    }
}

define_error! {
    mod create_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_create`].
    ///
    /// [`SmSystem::semaphore_create`]: crate::SmSystem::semaphore_create
    pub enum CreateSemaphoreError {
        /// The caller is an interrupt handler.
        BadContext,
        /// The initial value is out of range for the semaphore kind.
        BadParam,
        /// The semaphore pool is exhausted.
        NoMemory,
    }
}

define_error! {
    mod init_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_init`].
    ///
    /// [`SmSystem::semaphore_init`]: crate::SmSystem::semaphore_init
    pub enum InitSemaphoreError {
        /// The storage is misaligned or does not fit in the shared region, or
        /// the initial value is out of range for the semaphore kind.
        BadParam,
    }
}

define_error! {
    mod give_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_give`].
    ///
    /// [`SmSystem::semaphore_give`]: crate::SmSystem::semaphore_give
    pub enum GiveSemaphoreError {
        /// Invalid object handle.
        NoAccess,
        /// The caller is an interrupt handler.
        BadContext,
        /// The semaphore's spin lock could not be acquired.
        LockTimeout,
        /// The count of a counting semaphore is already at the maximum value.
        QueueOverflow,
        /// The wake-up request for the remote owner of the granted waiter could
        /// not be sent.
        NotifyFailed,
    }
}

define_error! {
    mod take_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_take`].
    ///
    /// [`SmSystem::semaphore_take`]: crate::SmSystem::semaphore_take
    pub enum TakeSemaphoreError {
        /// Invalid object handle.
        NoAccess,
        /// The caller is not a task.
        BadContext,
        /// The proxy pool is exhausted.
        NoMemory,
        /// The semaphore's spin lock could not be acquired.
        LockTimeout,
        /// The semaphore is unavailable, and [`Timeout::NoWait`] was given.
        ///
        /// [`Timeout::NoWait`]: crate::Timeout::NoWait
        Unavailable,
        Timeout,
        Interrupted,
    }
}

define_error! {
    mod flush_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_flush`].
    ///
    /// [`SmSystem::semaphore_flush`]: crate::SmSystem::semaphore_flush
    pub enum FlushSemaphoreError {
        /// Invalid object handle.
        NoAccess,
        /// The caller is an interrupt handler.
        BadContext,
        /// The semaphore's spin lock could not be acquired.
        LockTimeout,
        /// At least one wake-up request for a remote CPU could not be sent.
        NotifyFailed,
    }
}

define_error! {
    mod delete_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_delete`].
    ///
    /// [`SmSystem::semaphore_delete`]: crate::SmSystem::semaphore_delete
    pub enum DeleteSemaphoreError {
        /// Shared semaphores can never be deleted.
        NotSupported,
    }
}

define_error! {
    mod get_semaphore_error {}
    /// Error type for [`SmSystem::semaphore_info`].
    ///
    /// [`SmSystem::semaphore_info`]: crate::SmSystem::semaphore_info
    pub enum GetSemaphoreError {
        /// Invalid object handle.
        NoAccess,
        /// The semaphore's spin lock could not be acquired.
        LockTimeout,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// The error type returned by [`PortTransport::send_to_cpu`].
    ///
    /// [`PortTransport::send_to_cpu`]: crate::port::PortTransport::send_to_cpu
    #[into(GiveSemaphoreError)]
    #[into(FlushSemaphoreError)]
    pub enum NotifyError {
        NotifyFailed,
    }
}

define_suberror! {
    /// `BadContext`
    #[into(CreateSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(TakeSemaphoreError)]
    #[into(FlushSemaphoreError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `NoAccess`
    #[into(GiveSemaphoreError)]
    #[into(TakeSemaphoreError)]
    #[into(FlushSemaphoreError)]
    #[into(GetSemaphoreError)]
    pub(crate) enum NoAccessError {
        NoAccess,
    }
}

define_suberror! {
    /// The error type returned by [`SpinLock::lock`].
    ///
    /// [`SpinLock::lock`]: crate::spinlock::SpinLock::lock
    #[into(AttachError)]
    #[into(GiveSemaphoreError)]
    #[into(TakeSemaphoreError)]
    #[into(FlushSemaphoreError)]
    #[into(GetSemaphoreError)]
    pub enum LockTimeoutError {
        LockTimeout,
    }
}

define_suberror! {
    /// `NoMemory`
    #[into(CreateSemaphoreError)]
    #[into(TakeSemaphoreError)]
    pub(crate) enum NoMemoryError {
        NoMemory,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(AttachError)]
    #[into(CreateSemaphoreError)]
    #[into(InitSemaphoreError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}
