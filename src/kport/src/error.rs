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
            /// use kport::ResultCode;
            /// assert_eq!(ResultCode::Exhaustion.as_str(), "Exhaustion");
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
    /// All result codes (including success) that the port layer can report.
    ///
    /// Every error type in this crate is a subset of `ResultCode` and shares
    /// its discriminants, so the conversion is free.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is not covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified TLS ID has not been issued yet.
        BadId = -18,
        /// The current context disallows the operation, e.g., no task is
        /// specified and the kernel is not running any task.
        BadContext = -25,
        /// The target task opted out of thread-local storage.
        NotEnabled = -26,
        /// A fixed-capacity resource (TLS IDs, lock pool nodes) has been used
        /// up.
        Exhaustion = -33,
        /// The kernel or the allocator failed to create an underlying object.
        ResourceCreation = -34,
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
    mod alloc_id_error {}
    /// Error type for [`Subsystem::allocate_id`].
    ///
    /// [`Subsystem::allocate_id`]: crate::Subsystem::allocate_id
    pub enum AllocIdError {
        /// All `tls_table_size` IDs have been issued.
        Exhaustion,
    }
}

define_error! {
    mod init_error {}
    /// Error type for [`Subsystem::new`].
    ///
    /// [`Subsystem::new`]: crate::Subsystem::new
    pub enum InitError {
        /// No ID was left for the library slot. Whether this is fatal is up to
        /// the caller.
        Exhaustion,
    }
}

impl From<AllocIdError> for InitError {
    #[inline]
    fn from(x: AllocIdError) -> Self {
        match x {
            AllocIdError::Exhaustion => Self::Exhaustion,
        }
    }
}

define_error! {
    mod get_tls_error {}
    /// Error type for [`Subsystem::get_value`].
    ///
    /// [`Subsystem::get_value`]: crate::Subsystem::get_value
    pub enum GetTlsError {
        /// No task was specified, and there is no current task.
        BadContext,
        /// The ID has not been issued.
        BadId,
        /// The task was created with [`TaskOptions::NO_TLS`].
        ///
        /// [`TaskOptions::NO_TLS`]: crate::TaskOptions::NO_TLS
        NotEnabled,
    }
}

define_error! {
    mod set_tls_error {}
    /// Error type for [`Subsystem::set_value`].
    ///
    /// [`Subsystem::set_value`]: crate::Subsystem::set_value
    pub enum SetTlsError {
        /// No task was specified, and there is no current task.
        BadContext,
        /// The ID has not been issued.
        BadId,
        /// The ID refers to the library slot, which only the port writes.
        BadParam,
        /// The task was created with [`TaskOptions::NO_TLS`].
        ///
        /// [`TaskOptions::NO_TLS`]: crate::TaskOptions::NO_TLS
        NotEnabled,
    }
}

define_error! {
    mod set_destructor_error {}
    /// Error type for [`Subsystem::set_destructor`].
    ///
    /// [`Subsystem::set_destructor`]: crate::Subsystem::set_destructor
    pub enum SetDestructorError {
        /// The ID has not been issued.
        BadId,
    }
}

define_error! {
    mod create_tls_error {}
    /// Error type for [`Subsystem::task_create`].
    ///
    /// The kernel's task creation path may well treat this as a fatal
    /// configuration error.
    ///
    /// [`Subsystem::task_create`]: crate::Subsystem::task_create
    pub enum CreateTlsError {
        /// The TLS segment could not be allocated.
        ResourceCreation,
    }
}

define_error! {
    mod create_lock_error {}
    /// Error type for [`Subsystem::lock_try_create`].
    ///
    /// [`Subsystem::lock_try_create`]: crate::Subsystem::lock_try_create
    pub enum CreateLockError {
        /// The lock pool has no free nodes.
        Exhaustion,
        /// The kernel refused to create a semaphore.
        ResourceCreation,
    }
}
