use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A one-shot flag that sleeping threads can wait on.
pub struct StopSignal {
    raised: Mutex< bool >,
    condvar: Condvar
}

impl StopSignal {
    pub const fn new() -> Self {
        StopSignal {
            raised: parking_lot::const_mutex( false ),
            condvar: Condvar::new()
        }
    }

    pub fn raise( &self ) {
        let mut guard = self.raised.lock();
        *guard = true;
        self.condvar.notify_all();
    }

    pub fn is_raised( &self ) -> bool {
        *self.raised.lock()
    }

    /// Sleeps for `duration` unless raised in the meantime; returns whether it was raised.
    pub fn wait_timeout( &self, duration: Duration ) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.raised.lock();
        while !*guard {
            if self.condvar.wait_until( &mut guard, deadline ).timed_out() {
                break;
            }
        }

        *guard
    }
}
