//! Monotonic wall-clock used for window arithmetic.
//!
//! Sliding-window evaluation needs timestamps that are both comparable to
//! wall time (reset instants are reported as Unix epoch seconds) and immune
//! to wall-clock steps from NTP. The clock anchors the Unix epoch offset
//! once at first use and advances it with [`Instant`], so readings never
//! move backwards within a process.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process-wide anchor: wall-clock offset captured once, advanced monotonically.
struct Anchor {
    epoch_micros: u64,
    started: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before the Unix epoch");
        Anchor {
            epoch_micros: epoch.as_micros() as u64,
            started: Instant::now(),
        }
    })
}

/// Current time as microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    let anchor = anchor();
    anchor.epoch_micros + anchor.started.elapsed().as_micros() as u64
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_seconds() -> f64 {
    now_micros() as f64 / 1_000_000.0
}
