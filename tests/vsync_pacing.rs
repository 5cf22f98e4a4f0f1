//! Vsync-paced redraws: pulldown ratio and the disabled-vsync fallback tick.

use vitrail_dispatch::{EventLoop, FixedRateVblank, VblankSource, Window};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct CountingWindow {
    redraws: AtomicUsize,
}

impl Window for CountingWindow {
    fn redraw(&self, _deadline: Instant) {
        self.redraws.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn a_half_pulldown_halves_the_signal_rate() {
    let event_loop = EventLoop::local();

    // A simulated 120 Hz monitor with a 60 Hz frame-rate cap: the helper
    // derives a 0x0080 pulldown and signals every second vblank.
    event_loop.set_vblank_provider(Box::new(|_monitor| {
        Ok(Box::new(FixedRateVblank::new(120.0)) as Box<dyn VblankSource>)
    }));
    event_loop.set_maximum_frame_rate(60.0);

    let window = Arc::new(CountingWindow {
        redraws: AtomicUsize::new(0),
    });
    event_loop.add_window(
        Arc::downgrade(&window) as std::sync::Weak<dyn Window>
    );

    let _quit = event_loop.delay(Instant::now() + Duration::from_secs(1), || {
        EventLoop::local().quit(0);
    });

    assert_eq!(event_loop.resume(None), 0);

    let redraws = window.redraws.load(Ordering::Relaxed);
    assert!(
        (45..=70).contains(&redraws),
        "expected about 60 redraws over one second at 120 Hz with 0.5 pulldown, got {redraws}"
    );
}

#[test]
fn disabled_vsync_falls_back_to_the_fixed_tick() {
    let event_loop = EventLoop::local();

    event_loop.set_vsync_enabled(false);

    let window = Arc::new(CountingWindow {
        redraws: AtomicUsize::new(0),
    });
    event_loop.add_window(
        Arc::downgrade(&window) as std::sync::Weak<dyn Window>
    );

    let _quit = event_loop.delay(Instant::now() + Duration::from_millis(600), || {
        EventLoop::local().quit(0);
    });

    assert_eq!(event_loop.resume(None), 0);

    // The disabled branch ticks once per ~30 ms: about 20 redraws in 600 ms.
    let redraws = window.redraws.load(Ordering::Relaxed);
    assert!(
        (10..=30).contains(&redraws),
        "expected about 20 fallback ticks over 600 ms, got {redraws}"
    );
}
