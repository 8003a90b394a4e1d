//! Helpers shared by the integration test crates.

#![allow(dead_code, reason = "each test crate uses a different subset")]

use std::{
    thread,
    time::{Duration, Instant},
};

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
