//! Simulated time for the command-line driver.
use std::time::{Duration, SystemTime};

use tracing::{event, Level};

use cpu::Context;

/// Keeps track of how much time has passed on the simulated machine,
/// alongside the wall-clock time the run has taken.  The machine runs
/// as fast as the host allows, so the two are unrelated.
#[derive(Debug)]
pub struct SimulatedClock {
    simulated_elapsed: Duration,

    /// Origin for the real elapsed time.  If the system clock
    /// appears to go backward, we move this.
    wall_clock_time_origin: SystemTime,
}

impl SimulatedClock {
    pub fn new() -> SimulatedClock {
        SimulatedClock {
            simulated_elapsed: Duration::ZERO,
            wall_clock_time_origin: SystemTime::now(),
        }
    }

    pub fn now(&self) -> Duration {
        self.simulated_elapsed
    }

    pub fn advance_to_simulated_time(&mut self, when: Duration) {
        if when < self.simulated_elapsed {
            event!(
                Level::WARN,
                "ignoring attempt to move simulated time back from {:?} to {:?}",
                self.simulated_elapsed,
                when
            );
            return;
        }
        self.simulated_elapsed = when;
    }

    pub fn make_fresh_context(&mut self) -> Context {
        let real_now = SystemTime::now();
        let elapsed = match real_now.duration_since(self.wall_clock_time_origin) {
            Ok(delta) => delta,
            Err(_) => {
                event!(Level::WARN, "system time went backward");
                self.wall_clock_time_origin = real_now;
                Duration::ZERO
            }
        };
        Context::new(self.simulated_elapsed, elapsed)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}
