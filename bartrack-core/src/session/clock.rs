use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use super::{FrameCoordinator, TickOutcome};

/// Source of tick pacing and monotonic timestamps (ms).
pub trait FrameClock {
    /// Block until the next frame is due and return its timestamp.
    fn next_frame(&mut self) -> u64;
}

/// Wall-clock pacing at a fixed refresh rate.
///
/// A slow tick is not made up for: the next deadline is always one period
/// after the frame that was just released.
pub struct PacedClock {
    origin: Instant,
    period: Duration,
    next_deadline: Option<Instant>,
}

impl PacedClock {
    pub fn new(fps: u32) -> Self {
        Self {
            origin: Instant::now(),
            period: Duration::from_secs_f64(1.0 / f64::from(fps.max(1))),
            next_deadline: None,
        }
    }
}

impl FrameClock for PacedClock {
    fn next_frame(&mut self) -> u64 {
        if let Some(deadline) = self.next_deadline {
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
        }
        let now = Instant::now();
        self.next_deadline = Some(now + self.period);
        u64::try_from(now.duration_since(self.origin).as_millis()).unwrap_or(u64::MAX)
    }
}

/// Drives a coordinator one tick per clock frame until it goes idle.
pub struct Scheduler<C> {
    clock: C,
}

impl<C: FrameClock> Scheduler<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    /// Run until the session is stopped or the stream ends, then release
    /// the stream.  `after_tick` sees every tick that read a frame and
    /// returns the number of such ticks.
    pub fn run<F>(&mut self, coordinator: &mut FrameCoordinator, mut after_tick: F) -> u64
    where
        F: FnMut(&FrameCoordinator, TickOutcome, u64),
    {
        let mut ticks = 0u64;
        while coordinator.is_active() {
            let now_ms = self.clock.next_frame();
            match coordinator.on_tick(now_ms) {
                TickOutcome::Inactive | TickOutcome::Discarded => break,
                TickOutcome::EndOfStream => {
                    info!(ticks, "capture stream ended");
                    break;
                }
                outcome => {
                    ticks += 1;
                    after_tick(coordinator, outcome, now_ms);
                }
            }
        }
        coordinator.stop();
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paced_clock_is_monotonic_and_paced() {
        let mut clock = PacedClock::new(100);
        let t0 = clock.next_frame();
        let t1 = clock.next_frame();
        let t2 = clock.next_frame();
        assert!(t1 >= t0 + 9, "t0={t0} t1={t1}");
        assert!(t2 >= t1 + 9, "t1={t1} t2={t2}");
    }
}
