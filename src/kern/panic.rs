//! Fatal error path
//!
//! Contract violations (double unwire, releasing a dead object, a lock
//! taken against the hierarchy) halt the kernel. Here that means logging
//! the message and panicking with the `KERNEL PANIC:` prefix.

use core::fmt;

/// Report a fatal kernel error and halt
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("KERNEL PANIC: {}", args);
    panic!("KERNEL PANIC: {}", args);
}

/// Halt the kernel with a formatted message
#[macro_export]
macro_rules! kernel_panic {
    ($($arg:tt)*) => {
        $crate::kern::panic::fatal(format_args!($($arg)*))
    };
}

/// Halt the kernel unless `cond` holds
#[macro_export]
macro_rules! kassert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::kern::panic::fatal(format_args!($($arg)*));
        }
    };
}
