//! The vsync helper thread.
//!
//! A dedicated thread turns the primary monitor's vertical blank into pulses
//! on the loop's vsync-signal handle, at a rate controlled by an 8.8
//! fixed-point *pulldown* ratio: the accumulator grows by `pulldown` per
//! vblank and the loop is signalled only when its integer part advances, so
//! `1.0` signals every vblank and `0.5` every second one.
//!
//! A manual-reset *use-vsync* flag switches the helper between high-priority
//! vblank waiting and a low-priority fixed ~30 Hz tick. The vblank source
//! itself is pluggable so the helper does not care whether the pulses come
//! from a display driver, a compositor clock, or a simulated source.

use crate::poller::Signal;
use crate::stop::StopToken;
use crate::thread::{self, Priority};

use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Tick period of the disabled branch, and the substitute sleep after a
/// failed vblank wait.
const FALLBACK_TICK: Duration = Duration::from_millis(30);

/// Sleep substituted for a vblank that did not block (monitor powered down).
const POWERED_DOWN_SLEEP: Duration = Duration::from_millis(16);

/// A vblank wait returning faster than this did not actually block.
const MIN_BLOCK_TIME: Duration = Duration::from_millis(1);

/// Consecutive source failures tolerated before the helper permanently falls
/// back to the fixed-rate tick.
const MAX_ERROR_STREAK: u32 = 8;

/// A source of vertical-blank pulses for one monitor.
///
/// Implementations block the calling thread until the next vblank. The
/// helper thread is the only caller.
pub trait VblankSource: Send {
    /// Blocks until the next vertical blank.
    fn wait_for_vblank(&mut self) -> io::Result<()>;

    /// The monitor's refresh rate in Hz, used to derive the pulldown.
    fn refresh_rate(&self) -> f64;
}

/// Factory for vblank sources, keyed by the selected monitor id.
///
/// Invoked by the helper whenever the selected monitor changes (the user may
/// reassign their primary monitor at any time).
pub type VblankProvider = Box<dyn FnMut(usize) -> io::Result<Box<dyn VblankSource>> + Send>;

/// A fixed-rate sleeping vblank source.
///
/// The portable default (60 Hz), and the simulated source used in tests. It
/// keeps an absolute schedule so the rate does not drift with scheduling
/// jitter.
pub struct FixedRateVblank {
    period: Duration,
    rate: f64,
    next: Instant,
}

impl FixedRateVblank {
    /// # Panics
    ///
    /// Panics if `rate` is not a positive, finite frequency.
    pub fn new(rate: f64) -> Self {
        assert!(rate.is_finite() && rate > 0.0, "invalid vblank rate: {rate}");

        let period = Duration::from_secs_f64(1.0 / rate);
        Self {
            period,
            rate,
            next: Instant::now() + period,
        }
    }
}

impl VblankSource for FixedRateVblank {
    fn wait_for_vblank(&mut self) -> io::Result<()> {
        let now = Instant::now();
        if self.next <= now {
            // Fell behind; realign instead of replaying missed blanks.
            self.next = now + self.period;
        }

        std::thread::sleep(self.next - now);
        self.next += self.period;
        Ok(())
    }

    fn refresh_rate(&self) -> f64 {
        self.rate
    }
}

/// State shared between a loop, its producers and its vsync helper.
pub(crate) struct VsyncShared {
    /// Origin for the atomic timestamp.
    epoch: Instant,

    /// Nanoseconds since `epoch` of the last vblank (or fallback tick).
    vsync_time: AtomicU64,

    /// Pulldown ratio in UQ8.8.
    pull_down: AtomicU16,

    /// Requested maximum frame rate in UQ24.8, written by
    /// `set_maximum_frame_rate` and combined with the source's refresh rate
    /// by the helper.
    target_rate: AtomicU32,

    /// The monitor selected for vsync.
    monitor_id: AtomicUsize,

    /// The manual-reset use-vsync flag.
    enabled: Mutex<bool>,
    enabled_changed: Condvar,
}

impl VsyncShared {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            vsync_time: AtomicU64::new(0),
            pull_down: AtomicU16::new(0x100),
            target_rate: AtomicU32::new((30.0f64 * 256.0) as u32),
            monitor_id: AtomicUsize::new(0),
            enabled: Mutex::new(true),
            enabled_changed: Condvar::new(),
        }
    }

    /// The time of the last vblank observed by the helper.
    pub(crate) fn timestamp(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.vsync_time.load(Ordering::Relaxed))
    }

    fn stamp(&self) {
        let nanos = self.epoch.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.vsync_time.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn pulldown(&self) -> u16 {
        self.pull_down.load(Ordering::Relaxed)
    }

    fn set_pulldown(&self, value: u16) {
        self.pull_down.store(value, Ordering::Relaxed);
    }

    fn target_rate(&self) -> f64 {
        self.target_rate.load(Ordering::Relaxed) as f64 / 256.0
    }

    pub(crate) fn set_target_rate(&self, rate: f64) {
        let fixed = (rate * 256.0).clamp(1.0, u32::MAX as f64) as u32;
        self.target_rate.store(fixed, Ordering::Relaxed);
    }

    pub(crate) fn monitor_id(&self) -> usize {
        self.monitor_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_monitor_id(&self, id: usize) {
        self.monitor_id.store(id, Ordering::Relaxed);
    }

    /// Sets or resets the use-vsync flag. Idempotent.
    pub(crate) fn set_enabled(&self, on: bool) {
        *self.enabled.lock().unwrap() = on;
        self.enabled_changed.notify_all();
    }

    /// Waits up to `timeout` for the flag to be set, returning its state.
    ///
    /// Manual-reset semantics: while the flag is set this returns
    /// immediately; while reset it blocks for the full timeout unless the
    /// flag is set meanwhile.
    fn wait_enabled(&self, timeout: Duration) -> bool {
        let guard = self.enabled.lock().unwrap();
        let (guard, _) = self
            .enabled_changed
            .wait_timeout_while(guard, timeout, |enabled| !*enabled)
            .unwrap();
        *guard
    }
}

/// Derives the UQ8.8 pulldown from the target frame rate and the monitor's
/// refresh rate, clamped to (0, 1.0].
fn compute_pulldown(target_rate: f64, refresh_rate: f64) -> u16 {
    if !target_rate.is_finite() || !refresh_rate.is_finite() || refresh_rate <= 0.0 {
        return 0x100;
    }

    let ratio = (target_rate / refresh_rate).clamp(0.0, 1.0);
    ((ratio * 256.0).round() as u16).max(1)
}

/// The helper thread body.
///
/// Terminates on the stop token; source errors never terminate it.
pub(crate) fn vsync_thread_main(
    shared: Arc<VsyncShared>,
    signal: Arc<Signal>,
    stop: StopToken,
    mut provider: VblankProvider,
) {
    thread::set_name("vsync");

    let mut priority = Priority::Normal;
    let set_priority = |wanted: Priority, current: &mut Priority| {
        if *current != wanted {
            *current = wanted;
            if let Err(err) = thread::set_priority(wanted) {
                log::debug!("could not change vsync thread priority: {err}");
            }
        }
    };

    let mut source: Option<Box<dyn VblankSource>> = None;
    let mut source_monitor = usize::MAX;

    let mut sub_frame_count: u64 = 0;
    let mut frame_count: u64 = 0;

    let mut error_streak = 0u32;
    let mut logged_provider_error = false;
    let mut logged_wait_error = false;
    let mut logged_powered_down = false;
    let mut permanent_fallback = false;

    while !stop.stop_requested() {
        let enabled = if permanent_fallback {
            std::thread::sleep(FALLBACK_TICK);
            false
        } else {
            shared.wait_enabled(FALLBACK_TICK)
        };

        if !enabled {
            // ~30 Hz unconditional tick while vsync is off.
            set_priority(Priority::Normal, &mut priority);
            shared.stamp();
            signal.set();
            continue;
        }

        set_priority(Priority::TimeCritical, &mut priority);

        // Reacquire the vblank source when the selected monitor changed.
        let monitor = shared.monitor_id();
        if source.is_none() || monitor != source_monitor {
            match provider(monitor) {
                Ok(new_source) => {
                    source = Some(new_source);
                    source_monitor = monitor;
                    error_streak = 0;
                }
                Err(err) => {
                    if !logged_provider_error {
                        log::error!("could not acquire a vblank source for monitor {monitor}: {err}");
                        logged_provider_error = true;
                    }
                    permanent_fallback = bump_error_streak(&mut error_streak);
                    shared.stamp();
                    std::thread::sleep(FALLBACK_TICK);
                    signal.set();
                    continue;
                }
            }
        }

        let active = source.as_mut().unwrap();
        shared.set_pulldown(compute_pulldown(shared.target_rate(), active.refresh_rate()));

        let before = Instant::now();
        match active.wait_for_vblank() {
            Ok(()) => {
                error_streak = 0;

                if before.elapsed() < MIN_BLOCK_TIME {
                    // The vblank wait did not block: the monitor is most
                    // likely powered down.
                    if !logged_powered_down {
                        log::info!("vblank wait did not block; is the monitor powered down?");
                        logged_powered_down = true;
                    }
                    std::thread::sleep(POWERED_DOWN_SLEEP);
                }

                shared.stamp();

                sub_frame_count += shared.pulldown() as u64;
                let frame = sub_frame_count >> 8;
                if frame != frame_count {
                    frame_count = frame;
                    signal.set();
                }
            }
            Err(err) => {
                if !logged_wait_error {
                    log::error!("vblank wait failed: {err}");
                    logged_wait_error = true;
                }
                permanent_fallback = bump_error_streak(&mut error_streak);
                shared.stamp();
                std::thread::sleep(POWERED_DOWN_SLEEP);
            }
        }
    }
}

fn bump_error_streak(streak: &mut u32) -> bool {
    *streak += 1;
    if *streak == MAX_ERROR_STREAK {
        log::warn!(
            "vblank source failed {MAX_ERROR_STREAK} times in a row; \
             falling back to the fixed {FALLBACK_TICK:?} tick for good"
        );
    }
    *streak >= MAX_ERROR_STREAK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulldown_ratio() {
        // Matching rates signal every vblank.
        assert_eq!(compute_pulldown(60.0, 60.0), 0x100);
        // Half rate signals every second vblank.
        assert_eq!(compute_pulldown(60.0, 120.0), 0x080);
        // A target above the refresh rate clamps to every vblank.
        assert_eq!(compute_pulldown(120.0, 60.0), 0x100);
        // Degenerate refresh rates fall back to 1.0.
        assert_eq!(compute_pulldown(60.0, 0.0), 0x100);
    }

    #[test]
    fn accumulator_advances_by_pulldown() {
        // 0.5 pulldown: the integer frame count advances every second step.
        let mut sub = 0u64;
        let mut frames = 0;
        for _ in 0..8 {
            sub += 0x080;
            if sub >> 8 != frames {
                frames = sub >> 8;
            }
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn use_vsync_flag_is_manual_reset() {
        let shared = VsyncShared::new();

        assert!(shared.wait_enabled(Duration::from_millis(1)));
        assert!(shared.wait_enabled(Duration::from_millis(1)), "flag stays set");

        shared.set_enabled(false);
        let start = Instant::now();
        assert!(!shared.wait_enabled(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20), "reset flag blocks for the timeout");
    }
}
