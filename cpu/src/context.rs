//! The context in which the emulator performs a single operation.
//!
//! A call into the emulator is an opportunity to execute an
//! instruction or to let scheduled device activity happen.  The
//! emulator cares about how much time would have elapsed on the
//! machine being emulated (so that it knows when the clock next
//! ticks, or when the console finishes sending a character), while
//! the caller also keeps track of the actual elapsed time.
//!
//! Both quantities are `Duration`s, so we keep them together in a
//! struct to give them clear names.
use core::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub simulated_time: Duration,
    pub real_elapsed_time: Duration,
}

impl Context {
    #[must_use]
    pub fn new(simulated_time: Duration, real_elapsed_time: Duration) -> Context {
        Context {
            simulated_time,
            real_elapsed_time,
        }
    }

    /// A context for the instant the machine is switched on.
    #[must_use]
    pub fn power_on() -> Context {
        Context::new(Duration::ZERO, Duration::ZERO)
    }
}
