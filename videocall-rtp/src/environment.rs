/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Explicit runtime context handed to constructors.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use web_time::Instant;

/// Source of monotonic time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by a monotonic [`Instant`], counting from construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct SimulatedClock {
    now_ms: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Services shared by the assembler and its buffers.
#[derive(Clone)]
pub struct Environment {
    clock: Arc<dyn Clock>,
}

impl Environment {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("now_ms", &self.clock.now_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let env = Environment::new(clock.clone());
        assert_eq!(env.now_ms(), 1000);
        clock.advance_ms(40);
        assert_eq!(env.now_ms(), 1040);
        assert_eq!(env.clock().now_ms(), 1040);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let env = Environment::default();
        let first = env.now_ms();
        let second = env.now_ms();
        assert!(second >= first);
    }
}
